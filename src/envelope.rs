//! Signed request envelopes for resource mutations.
//!
//! An envelope is `{info, data, by_consensus?, meta}`. The outer signature in `meta` covers
//! `canonical({by_consensus?, data, info})`; the consensus proof, when required, binds
//! `canonical({info, data})` to the body of a frozen negotiation.

use crate::canonical::{self, CanonicalValue};
use crate::crypto::KeyData;
use crate::error::Result;

/// Anything that has a canonical form. Request payloads implement this so the exact same
/// bytes can be agreed on in a negotiation and replayed in an envelope.
pub trait Canonical {
   fn to_canonical(&self) -> CanonicalValue;
}

impl Canonical for CanonicalValue {
   fn to_canonical(&self) -> CanonicalValue { return self.clone() }
}

/// What the request wants to do. Absent optional fields are left out of the canonical form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Info {
   pub operation: String,
   pub resource: String,
   pub id: Option<String>,
   pub on_last_consensus_id: Option<String>,
}

impl Info {
   pub fn new(operation: &str, resource: &str) -> Self {
      return Info {
         operation: operation.to_string(),
         resource: resource.to_string(),
         id: None,
         on_last_consensus_id: None,
      };
   }

   pub fn with_id(mut self, id: &str) -> Self {
      self.id = Some(id.to_string());
      return self;
   }

   pub fn on_last(mut self, consensus_id: &str) -> Self {
      self.on_last_consensus_id = Some(consensus_id.to_string());
      return self;
   }
}

impl Canonical for Info {
   fn to_canonical(&self) -> CanonicalValue {
      let mut entries = vec![
         ("operation", CanonicalValue::from(&self.operation)),
         ("resource", CanonicalValue::from(&self.resource)),
      ];
      if let Some(id) = &self.id {
         entries.push(("id", id.into()));
      }
      if let Some(on_last) = &self.on_last_consensus_id {
         entries.push(("on_last_consensus_id", on_last.into()));
      }
      return CanonicalValue::map(entries);
   }
}

/// Reference to a frozen consensus, optionally to one part of a multi-document body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ByConsensus {
   pub consensus_id: String,
   pub consensus_part: Option<usize>,
}

impl ByConsensus {
   pub fn new(consensus_id: &str) -> Self {
      return ByConsensus { consensus_id: consensus_id.to_string(), consensus_part: None };
   }

   pub fn part(consensus_id: &str, part: usize) -> Self {
      return ByConsensus { consensus_id: consensus_id.to_string(), consensus_part: Some(part) };
   }
}

impl Canonical for ByConsensus {
   fn to_canonical(&self) -> CanonicalValue {
      let mut entries = vec![("consensus_id", CanonicalValue::from(&self.consensus_id))];
      if let Some(part) = self.consensus_part {
         entries.push(("consensus_part", part.into()));
      }
      return CanonicalValue::map(entries);
   }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Meta {
   pub signature: Vec<u8>,
   /// Key the signature must verify under. When absent the key carried in the signature is used.
   pub key_data: Option<KeyData>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope<D> {
   pub info: Info,
   pub data: D,
   pub by_consensus: Option<ByConsensus>,
   pub meta: Meta,
}

/// Canonical `{info, data}`, the document a consensus must have agreed on.
pub fn document_body<D: Canonical>(info: &Info, data: &D) -> CanonicalValue {
   return CanonicalValue::map([("data", data.to_canonical()), ("info", info.to_canonical())]);
}

/// Bytes covered by the outer envelope signature.
pub fn signed_payload<D: Canonical>(info: &Info, data: &D, by_consensus: Option<&ByConsensus>) -> Result<Vec<u8>> {
   let mut entries = vec![("data", data.to_canonical()), ("info", info.to_canonical())];
   if let Some(by_consensus) = by_consensus {
      entries.push(("by_consensus", by_consensus.to_canonical()));
   }
   return canonical::encode(&CanonicalValue::map(entries));
}

impl<D: Canonical> Envelope<D> {
   pub fn body(&self) -> CanonicalValue {
      return document_body(&self.info, &self.data);
   }

   pub fn signed_payload(&self) -> Result<Vec<u8>> {
      return signed_payload(&self.info, &self.data, self.by_consensus.as_ref());
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_optional_info_fields_are_omitted() {
      let info = Info::new("create", "peer");
      assert_eq!(info.to_canonical().get("id"), None);

      let info = info.with_id("e1").on_last("c1");
      assert_eq!(info.to_canonical().get("id").and_then(CanonicalValue::as_str), Some("e1"));
      assert_eq!(info.to_canonical().get("on_last_consensus_id").and_then(CanonicalValue::as_str), Some("c1"));
   }

   #[test]
   fn test_signed_payload_covers_the_consensus_reference() {
      let info = Info::new("create", "peer");
      let data = CanonicalValue::map([("name", "alice")]);
      let bare = signed_payload(&info, &data, None).unwrap();
      let first = signed_payload(&info, &data, Some(&ByConsensus::new("c1"))).unwrap();
      let second = signed_payload(&info, &data, Some(&ByConsensus::part("c1", 0))).unwrap();
      assert_ne!(bare, first);
      assert_ne!(first, second);
   }

   #[test]
   fn test_document_body_ignores_the_proof() {
      let envelope = Envelope {
         info: Info::new("create", "peer"),
         data: CanonicalValue::map([("name", "alice")]),
         by_consensus: Some(ByConsensus::new("c1")),
         meta: Meta { signature: Vec::new(), key_data: None },
      };
      let expected = canonical::encode(&document_body(&envelope.info, &envelope.data)).unwrap();
      assert_eq!(canonical::encode(&envelope.body()).unwrap(), expected);
   }
}
