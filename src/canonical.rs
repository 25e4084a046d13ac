//! Deterministic, self-describing byte encoding of nested values.
//!
//! Every hash and every signature in this crate is computed over the output of [`encode`], so
//! two parties holding equal values always produce identical bytes. The grammar:
//!
//! - `null` is the four bytes `null`
//! - a list is `[\n`, the elements separated by `,\n`, then `]\n`
//! - a map is `{\n`, `key: value` pairs in ascending key order separated by `,\n`, then `}\n`
//! - bytes of length `z` are `w x _ payload`, and an integer `n` is `w x 0 hex(n)`, where `x`
//!   is `z` in lowercase hex without leading zeros and `w` is the length of `x` as two hex digits
//!
//! # Example
//! ```
//! use mixnet_consensus::canonical::{encode, decode_all, CanonicalValue};
//!
//! // Insertion order does not matter, keys are always written sorted
//! let value = CanonicalValue::map([("meta", CanonicalValue::from(1u64)), ("body", "hello".into())]);
//! let bytes = encode(&value).unwrap();
//! assert_eq!(bytes, b"{\n014_body: 015_hello,\n014_meta: 01101}\n".to_vec());
//!
//! let decoded = decode_all(&bytes).unwrap();
//! assert_eq!(decoded.get("body").and_then(|body| body.as_str()), Some("hello"));
//! ```

use serde::{Deserialize, Serialize};

use crate::consts::*;
use crate::error::{Err, ErrType, Result};

/// An arbitrary-precision non-negative integer, stored big-endian without leading zero bytes.
///
/// The codec has no representation for negative or fractional numbers, so neither does this
/// type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Natural(Vec<u8>);

impl Natural {
   pub fn from_be_bytes(bytes: &[u8]) -> Self {
      let first = bytes.iter().position(|byte| *byte != 0).unwrap_or(bytes.len());
      return Natural(bytes[first..].to_vec());
   }

   pub fn to_be_bytes(&self) -> &[u8] { return &self.0 }

   pub fn is_zero(&self) -> bool { return self.0.is_empty() }

   /// Returns `None` if the value does not fit.
   pub fn to_u64(&self) -> Option<u64> {
      if self.0.len() > 8 {
         return None;
      }
      return Some(self.0.iter().fold(0u64, |acc, byte| (acc << 8) | u64::from(*byte)));
   }

   /// Lowercase hex without leading zeros; zero is `"0"`.
   pub fn to_hex(&self) -> String {
      let encoded = hex::encode(&self.0);
      let trimmed = encoded.trim_start_matches('0');
      if trimmed.is_empty() {
         return String::from("0");
      }
      return trimmed.to_string();
   }

   /// Parse canonical hex (lowercase, no leading zeros). Anything else is rejected so that
   /// every integer has exactly one encoding.
   pub fn from_hex(digits: &[u8]) -> Option<Self> {
      if !is_canonical_hex(digits) {
         return None;
      }
      if digits == b"0" {
         return Some(Natural::default());
      }
      let mut padded = Vec::<u8>::with_capacity(digits.len() + 1);
      if digits.len() % 2 == 1 {
         padded.push(b'0');
      }
      padded.extend_from_slice(digits);
      return hex::decode(&padded).ok().map(|bytes| Natural::from_be_bytes(&bytes));
   }

   /// Decimal representation, used when an integer is coerced into a map key.
   pub fn to_decimal(&self) -> String {
      if self.is_zero() {
         return String::from("0");
      }
      let mut digits = Vec::<u8>::new();
      let mut number = self.0.clone();
      while !number.is_empty() {
         let mut remainder = 0u32;
         let mut quotient = Vec::<u8>::with_capacity(number.len());
         for byte in &number {
            let acc = (remainder << 8) | u32::from(*byte);
            let digit = acc / 10;
            remainder = acc % 10;
            if !(quotient.is_empty() && digit == 0) {
               // acc < 2560, so the quotient always fits in a byte
               quotient.push(digit as u8);
            }
         }
         digits.push(b'0' + remainder as u8);
         number = quotient;
      }
      return digits.iter().rev().map(|digit| char::from(*digit)).collect();
   }
}

impl From<u64> for Natural {
   fn from(number: u64) -> Self { return Natural::from_be_bytes(&number.to_be_bytes()) }
}

impl From<u128> for Natural {
   fn from(number: u128) -> Self { return Natural::from_be_bytes(&number.to_be_bytes()) }
}

impl From<usize> for Natural {
   fn from(number: usize) -> Self { return Natural::from(number as u64) }
}

fn is_canonical_hex(digits: &[u8]) -> bool {
   if digits.is_empty() {
      return false;
   }
   if digits.len() > 1 && digits[0] == b'0' {
      return false;
   }
   return digits.iter().all(|c| c.is_ascii_digit() || (b'a'..=b'f').contains(c));
}

/// A value that can be canonically encoded.
///
/// Map entries are kept in the order they were given; [`encode`] sorts them and coerces their
/// keys. Values produced by [`decode`] always have sorted `Bytes` keys. Equality follows the
/// encoding: two maps holding the same entries in a different order, or spelling a key as
/// `7` and `"7"`, are equal.
#[derive(Debug, Clone)]
pub enum CanonicalValue {
   Null,
   Integer(Natural),
   Bytes(Vec<u8>),
   List(Vec<CanonicalValue>),
   Map(Vec<(CanonicalValue, CanonicalValue)>),
}

impl CanonicalValue {
   /// Build a map from key/value pairs in any order.
   pub fn map<K, V, I>(pairs: I) -> Self
   where
      K: Into<CanonicalValue>,
      V: Into<CanonicalValue>,
      I: IntoIterator<Item = (K, V)>,
   {
      return CanonicalValue::Map(pairs.into_iter().map(|(k, v)| (k.into(), v.into())).collect());
   }

   pub fn list<V: Into<CanonicalValue>, I: IntoIterator<Item = V>>(items: I) -> Self {
      return CanonicalValue::List(items.into_iter().map(Into::into).collect());
   }

   /// Look up a map entry by its textual key. Integer keys are matched by their decimal form.
   pub fn get(&self, key: &str) -> Option<&CanonicalValue> {
      if let CanonicalValue::Map(entries) = self {
         return entries
            .iter()
            .find(|(k, _)| coerce_key(k).ok().as_deref() == Some(key.as_bytes()))
            .map(|(_, v)| v);
      }
      return None;
   }

   pub fn as_bytes(&self) -> Option<&[u8]> {
      if let CanonicalValue::Bytes(bytes) = self { return Some(bytes) }
      return None;
   }

   pub fn as_str(&self) -> Option<&str> {
      return self.as_bytes().and_then(|bytes| std::str::from_utf8(bytes).ok());
   }

   pub fn as_natural(&self) -> Option<&Natural> {
      if let CanonicalValue::Integer(number) = self { return Some(number) }
      return None;
   }

   pub fn as_u64(&self) -> Option<u64> {
      return self.as_natural().and_then(Natural::to_u64);
   }

   pub fn as_list(&self) -> Option<&[CanonicalValue]> {
      if let CanonicalValue::List(items) = self { return Some(items) }
      return None;
   }

   pub fn is_null(&self) -> bool { return matches!(self, CanonicalValue::Null) }

   /// Only a non-zero integer is true. The codec has no boolean, so `true` travels as `1`.
   pub fn is_truthy(&self) -> bool {
      return matches!(self, CanonicalValue::Integer(number) if !number.is_zero());
   }
}

impl PartialEq for CanonicalValue {
   fn eq(&self, other: &Self) -> bool {
      return match (self, other) {
         (CanonicalValue::Null, CanonicalValue::Null) => true,
         (CanonicalValue::Integer(a), CanonicalValue::Integer(b)) => a == b,
         (CanonicalValue::Bytes(a), CanonicalValue::Bytes(b)) => a == b,
         (CanonicalValue::List(a), CanonicalValue::List(b)) => a == b,
         (CanonicalValue::Map(a), CanonicalValue::Map(b)) => {
            let (a, b) = (sorted_entries(a), sorted_entries(b));
            a.len() == b.len()
               && a.iter().zip(&b).all(|((ka, a_key, a_val), (kb, b_key, b_val))| {
                  // Keys without a byte form only compare equal to themselves
                  ka == kb && (ka.is_some() || a_key == b_key) && a_val == b_val
               })
         }
         _ => false,
      };
   }
}

impl Eq for CanonicalValue {}

type SortedEntry<'a> = (Option<Vec<u8>>, &'a CanonicalValue, &'a CanonicalValue);

fn sorted_entries(entries: &[(CanonicalValue, CanonicalValue)]) -> Vec<SortedEntry<'_>> {
   let mut sorted: Vec<SortedEntry<'_>> = entries
      .iter()
      .map(|(key, value)| (coerce_key(key).ok(), key, value))
      .collect();
   sorted.sort_by(|a, b| a.0.cmp(&b.0));
   return sorted;
}

impl From<&str> for CanonicalValue {
   fn from(text: &str) -> Self { return CanonicalValue::Bytes(text.as_bytes().to_vec()) }
}

impl From<String> for CanonicalValue {
   fn from(text: String) -> Self { return CanonicalValue::Bytes(text.into_bytes()) }
}

impl From<&String> for CanonicalValue {
   fn from(text: &String) -> Self { return CanonicalValue::from(text.as_str()) }
}

impl From<Vec<u8>> for CanonicalValue {
   fn from(bytes: Vec<u8>) -> Self { return CanonicalValue::Bytes(bytes) }
}

impl From<&[u8]> for CanonicalValue {
   fn from(bytes: &[u8]) -> Self { return CanonicalValue::Bytes(bytes.to_vec()) }
}

impl From<u64> for CanonicalValue {
   fn from(number: u64) -> Self { return CanonicalValue::Integer(number.into()) }
}

impl From<usize> for CanonicalValue {
   fn from(number: usize) -> Self { return CanonicalValue::Integer(number.into()) }
}

impl From<Natural> for CanonicalValue {
   fn from(number: Natural) -> Self { return CanonicalValue::Integer(number) }
}

impl From<bool> for CanonicalValue {
   fn from(flag: bool) -> Self { return CanonicalValue::from(u64::from(flag)) }
}

impl<T: Into<CanonicalValue>> From<Option<T>> for CanonicalValue {
   fn from(option: Option<T>) -> Self {
      return option.map(Into::into).unwrap_or(CanonicalValue::Null);
   }
}

fn malformed(offset: usize, detail: impl Into<String>) -> Err {
   return Err::new(ErrType::MalformedEncoding { offset }, detail);
}

/// Map keys travel as bytes: text is already bytes, integers use their decimal form.
fn coerce_key(key: &CanonicalValue) -> std::result::Result<Vec<u8>, &'static str> {
   return match key {
      CanonicalValue::Bytes(bytes) => Ok(bytes.clone()),
      CanonicalValue::Integer(number) => Ok(number.to_decimal().into_bytes()),
      CanonicalValue::Null => Err("null cannot be a map key"),
      CanonicalValue::List(_) => Err("a list cannot be a map key"),
      CanonicalValue::Map(_) => Err("a map cannot be a map key"),
   };
}

fn write_sized(out: &mut Vec<u8>, tag: u8, payload: &[u8]) {
   let length = format!("{:x}", payload.len());
   out.extend_from_slice(format!("{:02x}", length.len()).as_bytes());
   out.extend_from_slice(length.as_bytes());
   out.push(tag);
   out.extend_from_slice(payload);
}

/// Canonically encode a value.
/// # Errors
/// `MalformedEncoding` if a map has a key that cannot be coerced to bytes, or two keys that
/// are equal after coercion. The offset is the output position where the map starts.
pub fn encode(value: &CanonicalValue) -> Result<Vec<u8>> {
   let mut out = Vec::<u8>::new();
   encode_into(value, &mut out)?;
   return Ok(out);
}

pub fn encode_into(value: &CanonicalValue, out: &mut Vec<u8>) -> Result<()> {
   match value {
      CanonicalValue::Null => out.extend_from_slice(NULL_TOKEN),
      CanonicalValue::Integer(number) => write_sized(out, INTEGER_TAG, number.to_hex().as_bytes()),
      CanonicalValue::Bytes(bytes) => write_sized(out, BYTES_TAG, bytes),
      CanonicalValue::List(items) => {
         out.extend_from_slice(LIST_OPEN);
         for (i, item) in items.iter().enumerate() {
            if i > 0 {
               out.extend_from_slice(SEPARATOR);
            }
            encode_into(item, out)?;
         }
         out.extend_from_slice(LIST_CLOSE);
      }
      CanonicalValue::Map(entries) => {
         let start = out.len();
         let mut sorted = Vec::<(Vec<u8>, &CanonicalValue)>::with_capacity(entries.len());
         for (key, entry) in entries {
            let key = coerce_key(key).map_err(|reason| malformed(start, reason))?;
            sorted.push((key, entry));
         }
         sorted.sort_by(|a, b| a.0.cmp(&b.0));
         if let Some(pair) = sorted.windows(2).find(|pair| pair[0].0 == pair[1].0) {
            let key = String::from_utf8_lossy(&pair[0].0);
            let tail = if key.len() > 64 { "..." } else { "" };
            return Err(malformed(start, format!("duplicate key '{}{}' in map", &key[..key.len().min(64)], tail)));
         }

         out.extend_from_slice(MAP_OPEN);
         for (i, (key, entry)) in sorted.iter().enumerate() {
            if i > 0 {
               out.extend_from_slice(SEPARATOR);
            }
            write_sized(out, BYTES_TAG, key);
            out.extend_from_slice(KEY_SEPARATOR);
            encode_into(entry, out)?;
         }
         out.extend_from_slice(MAP_CLOSE);
      }
   }
   return Ok(());
}

/// Decode one value from the front of `input`, returning it with the number of bytes consumed.
/// # Errors
/// `MalformedEncoding` with the offset of the first byte that could not be accepted.
pub fn decode(input: &[u8]) -> Result<(CanonicalValue, usize)> {
   let mut decoder = Decoder { input, pos: 0, depth: 0 };
   let value = decoder.value(None)?;
   return Ok((value, decoder.pos));
}

/// Decode a value that must span all of `input`.
pub fn decode_all(input: &[u8]) -> Result<CanonicalValue> {
   let (value, consumed) = decode(input)?;
   if consumed != input.len() {
      return Err(malformed(consumed, format!("{} trailing bytes", input.len() - consumed)));
   }
   return Ok(value);
}

struct Decoder<'a> {
   input: &'a [u8],
   pos: usize,
   depth: usize,
}

impl<'a> Decoder<'a> {
   fn take(&mut self, n: usize, what: &str) -> Result<&'a [u8]> {
      if self.input.len() - self.pos < n {
         return Err(malformed(self.pos, format!("eof while reading {what}")));
      }
      let input = self.input;
      let slice = &input[self.pos..self.pos + n];
      self.pos += n;
      return Ok(slice);
   }

   fn token(&mut self, what: &str) -> Result<[u8; 2]> {
      let slice = self.take(2, what)?;
      return Ok([slice[0], slice[1]]);
   }

   fn value(&mut self, head: Option<[u8; 2]>) -> Result<CanonicalValue> {
      let start = match head {
         Some(_) => self.pos - 2,
         None => self.pos,
      };
      let head = match head {
         Some(head) => head,
         None => self.token("value")?,
      };

      if &head == b"nu" {
         if self.take(2, "null")? != b"ll" {
            return Err(malformed(start, "invalid token instead of 'null'"));
         }
         return Ok(CanonicalValue::Null);
      }
      if &head == LIST_OPEN || &head == MAP_OPEN {
         if self.depth >= MAX_DEPTH {
            return Err(malformed(start, format!("nesting deeper than {MAX_DEPTH}")));
         }
         self.depth += 1;
         let value = if &head == LIST_OPEN { self.list() } else { self.map() };
         self.depth -= 1;
         return value;
      }
      return self.sized(start, head);
   }

   fn list(&mut self) -> Result<CanonicalValue> {
      let mut items = Vec::<CanonicalValue>::new();
      let mut next = self.token("list")?;
      if &next == LIST_CLOSE {
         return Ok(CanonicalValue::List(items));
      }
      loop {
         items.push(self.value(Some(next))?);
         let at = self.pos;
         let delimiter = self.token("list")?;
         if &delimiter == LIST_CLOSE {
            return Ok(CanonicalValue::List(items));
         }
         if &delimiter != SEPARATOR {
            return Err(malformed(at, "illegal token in list instead of ',\\n'"));
         }
         next = self.token("list")?;
      }
   }

   fn map(&mut self) -> Result<CanonicalValue> {
      let mut entries = Vec::<(CanonicalValue, CanonicalValue)>::new();
      let mut next = self.token("map")?;
      if &next == MAP_CLOSE {
         return Ok(CanonicalValue::Map(entries));
      }
      loop {
         let key_at = self.pos - 2;
         let key = self.value(Some(next))?;
         let key_bytes = match &key {
            CanonicalValue::Bytes(bytes) => bytes,
            _ => return Err(malformed(key_at, "map key is not bytes")),
         };
         if let Some((CanonicalValue::Bytes(previous), _)) = entries.last() {
            if previous >= key_bytes {
               return Err(malformed(key_at, "map keys are not in ascending order"));
            }
         }
         let at = self.pos;
         if &self.token("map")? != KEY_SEPARATOR {
            return Err(malformed(at, "invalid token instead of ': '"));
         }
         let entry = self.value(None)?;
         entries.push((key, entry));

         let at = self.pos;
         let delimiter = self.token("map")?;
         if &delimiter == MAP_CLOSE {
            return Ok(CanonicalValue::Map(entries));
         }
         if &delimiter != SEPARATOR {
            return Err(malformed(at, "illegal token in map instead of ',\\n'"));
         }
         next = self.token("map")?;
      }
   }

   fn sized(&mut self, start: usize, width: [u8; 2]) -> Result<CanonicalValue> {
      let width = std::str::from_utf8(&width)
         .ok()
         .filter(|digits| digits.bytes().all(|c| c.is_ascii_digit() || (b'a'..=b'f').contains(&c)))
         .and_then(|digits| usize::from_str_radix(digits, 16).ok())
         .filter(|width| *width > 0)
         .ok_or_else(|| malformed(start, "invalid width field"))?;

      let length_at = self.pos;
      let length = self.take(width, "length field")?;
      let length = Natural::from_hex(length)
         .and_then(|length| length.to_u64())
         .and_then(|length| usize::try_from(length).ok())
         .ok_or_else(|| malformed(length_at, "invalid length field"))?;

      let tag_at = self.pos;
      let tag = self.take(1, "object tag")?[0];
      let payload_at = self.pos;
      let payload = self.take(length, "object payload")?;

      return match tag {
         BYTES_TAG => Ok(CanonicalValue::Bytes(payload.to_vec())),
         INTEGER_TAG => Natural::from_hex(payload)
            .map(CanonicalValue::Integer)
            .ok_or_else(|| malformed(payload_at, "invalid integer digits")),
         _ => Err(malformed(tag_at, format!("invalid object tag '{}'", char::from(tag)))),
      };
   }
}

#[cfg(test)]
mod tests {
   use super::*;
   use proptest::prelude::*;
   use CanonicalValue::*;

   fn arb_value() -> impl Strategy<Value = CanonicalValue> {
      let leaf = prop_oneof![
         Just(Null),
         any::<u64>().prop_map(|n| Integer(n.into())),
         prop::collection::vec(any::<u8>(), 0..24).prop_map(|bytes| Integer(Natural::from_be_bytes(&bytes))),
         prop::collection::vec(any::<u8>(), 0..40).prop_map(Bytes),
      ];
      return leaf.prop_recursive(4, 64, 6, |inner| {
         prop_oneof![
            prop::collection::vec(inner.clone(), 0..6).prop_map(List),
            prop::collection::btree_map(prop::collection::vec(any::<u8>(), 0..8), inner, 0..6)
               .prop_map(|entries| Map(entries.into_iter().map(|(k, v)| (Bytes(k), v)).collect())),
         ]
      });
   }

   proptest! {
      #[test]
      fn test_round_trip(value in arb_value()) {
         let bytes = encode(&value).unwrap();
         let (decoded, consumed) = decode(&bytes).unwrap();
         prop_assert_eq!(consumed, bytes.len());
         prop_assert_eq!(decoded, value);
      }

      #[test]
      fn test_round_trip_of_shuffled_maps(
         entries in prop::collection::btree_map(prop::collection::vec(any::<u8>(), 0..8), arb_value(), 0..8),
         seed in any::<u64>(),
      ) {
         let mut pairs: Vec<(Vec<u8>, CanonicalValue)> = entries.into_iter().collect();
         if !pairs.is_empty() {
            let by = (seed as usize) % pairs.len();
            pairs.rotate_left(by);
            pairs.reverse();
         }
         let value = CanonicalValue::map(pairs);
         prop_assert_eq!(decode_all(&encode(&value).unwrap()).unwrap(), value);
      }

      #[test]
      fn test_map_insertion_order_is_irrelevant(
         entries in prop::collection::btree_map(prop::collection::vec(any::<u8>(), 0..8), any::<u64>(), 0..8),
         seed in any::<u64>(),
      ) {
         let sorted: Vec<(Vec<u8>, u64)> = entries.into_iter().collect();
         let mut shuffled = sorted.clone();
         // Deterministic rotation stands in for an arbitrary permutation
         if !shuffled.is_empty() {
            let by = (seed as usize) % shuffled.len();
            shuffled.rotate_left(by);
            shuffled.reverse();
         }
         prop_assert_eq!(encode(&CanonicalValue::map(sorted)).unwrap(), encode(&CanonicalValue::map(shuffled)).unwrap());
      }
   }

   #[test]
   fn test_scalar_encodings() {
      assert_eq!(encode(&Null).unwrap(), b"null");
      assert_eq!(encode(&CanonicalValue::from(0u64)).unwrap(), b"01100");
      assert_eq!(encode(&CanonicalValue::from(255u64)).unwrap(), b"0120ff");
      assert_eq!(encode(&CanonicalValue::from("abc")).unwrap(), b"013_abc");
      assert_eq!(encode(&CanonicalValue::from("")).unwrap(), b"010_");
      let long = vec![b'x'; 300];
      let encoded = encode(&Bytes(long.clone())).unwrap();
      assert_eq!(&encoded[..6], b"0312c_");
      assert_eq!(&encoded[6..], &long[..]);
   }

   #[test]
   fn test_container_encodings() {
      assert_eq!(encode(&List(vec![])).unwrap(), b"[\n]\n");
      assert_eq!(encode(&CanonicalValue::list([Null, Null])).unwrap(), b"[\nnull,\nnull]\n");
      assert_eq!(encode(&Map(vec![])).unwrap(), b"{\n}\n");
      let nested = CanonicalValue::map([("b", CanonicalValue::list([1u64])), ("a", Null.into())]);
      assert_eq!(encode(&nested).unwrap(), b"{\n011_a: null,\n011_b: [\n01101]\n}\n".to_vec());
   }

   #[test]
   fn test_duplicate_keys_rejected() {
      let value = CanonicalValue::map([("k", 1u64), ("k", 2u64)]);
      let err = encode(&value).unwrap_err();
      assert_eq!(err.err_type, ErrType::MalformedEncoding { offset: 0 });

      // 7 and "7" collide once the integer is coerced
      let value = Map(vec![(CanonicalValue::from(7u64), Null), (CanonicalValue::from("7"), Null)]);
      assert!(encode(&value).is_err());
   }

   #[test]
   fn test_integer_keys_are_coerced_to_decimal() {
      let value = Map(vec![(CanonicalValue::from(10u64), Null)]);
      assert_eq!(encode(&value).unwrap(), b"{\n012_10: null}\n".to_vec());
      assert_eq!(value.get("10"), Some(&Null));
   }

   #[test]
   fn test_non_coercible_key_rejected() {
      let value = Map(vec![(List(vec![]), Null)]);
      assert!(matches!(encode(&value).unwrap_err().err_type, ErrType::MalformedEncoding { .. }));
   }

   #[test]
   fn test_decode_reports_offsets() {
      // truncated payload
      let err = decode(b"015_abc").unwrap_err();
      assert_eq!(err.err_type, ErrType::MalformedEncoding { offset: 4 });
      // bad tag
      let err = decode(b"013xabc").unwrap_err();
      assert_eq!(err.err_type, ErrType::MalformedEncoding { offset: 3 });
      // missing separator inside a list
      let err = decode(b"[\nnull;\nnull]\n").unwrap_err();
      assert_eq!(err.err_type, ErrType::MalformedEncoding { offset: 6 });
      // not a width field at all
      assert!(decode(b"zz").is_err());
      assert!(decode(b"").is_err());
   }

   #[test]
   fn test_decode_is_strict() {
      // leading zero in an integer
      assert!(decode(b"012007").is_err());
      // leading zero in a length field
      assert!(decode(b"0203_abc").is_err());
      // uppercase hex
      assert!(decode(b"0120FF").is_err());
      // unsorted keys
      assert!(decode(b"{\n011_b: null,\n011_a: null}\n").is_err());
      // trailing comma
      assert!(decode(b"[\nnull,\n]\n").is_err());
      // trailing bytes are only an error for decode_all
      assert_eq!(decode(b"nullnull").unwrap(), (Null, 4));
      assert!(decode_all(b"nullnull").is_err());
   }

   #[test]
   fn test_map_equality_ignores_entry_order() {
      let unsorted = CanonicalValue::map([("b", 1u64), ("a", 2u64)]);
      assert_eq!(decode_all(&encode(&unsorted).unwrap()).unwrap(), unsorted);
      assert_eq!(Map(vec![(CanonicalValue::from(7u64), Null)]), CanonicalValue::map([("7", Null)]));
      assert_ne!(CanonicalValue::map([("a", 1u64)]), CanonicalValue::map([("a", 2u64)]));
      assert_ne!(CanonicalValue::map([("a", 1u64)]), CanonicalValue::map([("a", 1u64), ("b", 1u64)]));
   }

   #[test]
   fn test_nesting_depth_is_bounded() {
      let err = decode(&b"[\n".repeat(500_000)).unwrap_err();
      assert_eq!(err.err_type, ErrType::MalformedEncoding { offset: 2 * MAX_DEPTH });
      assert!(decode(&b"{\n".repeat(MAX_DEPTH + 1)).is_err());

      let mut deepest = b"[\n".repeat(MAX_DEPTH);
      deepest.extend_from_slice(&b"]\n".repeat(MAX_DEPTH));
      assert!(decode_all(&deepest).is_ok());
   }

   #[test]
   fn test_natural_conversions() {
      let big = Natural::from(u128::MAX);
      assert_eq!(big.to_hex(), "ffffffffffffffffffffffffffffffff");
      assert_eq!(big.to_decimal(), u128::MAX.to_string());
      assert_eq!(big.to_u64(), None);
      assert_eq!(Natural::from(4096u64).to_u64(), Some(4096));
      assert_eq!(Natural::from_hex(b"abc").unwrap().to_hex(), "abc");
      assert_eq!(Natural::from_be_bytes(&[0, 0, 1]), Natural::from(1u64));
   }
}
