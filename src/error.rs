use std::fmt;

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
/// The error handling type for the entire crate.
///
/// Every error carries an [`ErrType`] that callers can match on to decide whether to correct
/// the request, retry from fresh state, or (for [`ErrType::Storage`]) treat the failure as
/// an infrastructure fault.
pub struct Err {
   pub err_type: ErrType,
   pub detail: String,
}

impl Err {
   pub fn new(err_type: ErrType, detail: impl Into<String>) -> Self {
      return Err { err_type, detail: detail.into() };
   }

   /// True for storage/transaction failures, which are never the caller's fault.
   pub fn is_infrastructure(&self) -> bool {
      return matches!(self.err_type, ErrType::Storage);
   }
}

impl std::error::Error for Err {}

impl fmt::Display for Err {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      if self.detail.is_empty() {
         return write!(f, "{}", self.err_type);
      }
      return write!(f, "{}: {}", self.err_type, self.detail);
   }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
/// Indicates the type of error so they can be used to trigger certain logic.
pub enum ErrType {
   /// A canonical byte stream could not be decoded, or a value could not be encoded.
   #[error("malformed encoding at byte {offset}")]
   MalformedEncoding { offset: usize },
   /// A signature did not verify, or verified for a different key than asserted.
   #[error("invalid signature")]
   InvalidSignature,
   /// The negotiation is already DONE.
   #[error("negotiation is not open")]
   NotOpen,
   /// A state-machine precondition on a peer, endpoint or message box was violated.
   #[error("wrong status")]
   WrongStatus,
   /// The identifier (or unique key material) is already taken.
   #[error("conflict")]
   Conflict,
   #[error("not found")]
   NotFound,
   #[error("consensus not found")]
   ConsensusNotFound,
   /// Body, meta or signer-set check failed, or a stale `on_last_consensus_id` was presented.
   #[error("consensus mismatch")]
   ConsensusMismatch,
   #[error("message count mismatch: expected {expected}, selected {actual}")]
   CountMismatch { expected: usize, actual: usize },
   #[error("{count} messages is below the minimum of {min}")]
   BelowMinimum { count: usize, min: u64 },
   #[error("{count} messages is above the maximum of {max}")]
   AboveMaximum { count: usize, max: u64 },
   /// A required owner or peer has not signed the consensus.
   #[error("missing signature")]
   MissingSignature,
   /// The caller is neither the peer nor one of its owners.
   #[error("caller is not an owner")]
   NotOwner,
   /// The request is well-formed but its content is not acceptable.
   #[error("invalid request")]
   Invalid,
   /// The active backend cannot perform this operation.
   #[error("unsupported")]
   Unsupported,
   /// Storage, snapshot or configuration I/O failed.
   #[error("storage failure")]
   Storage,
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Err>;

#[macro_export]
/// Instantiate an error object using prettier syntax.  \
/// # Parameters
/// $t: [`ErrType`] variant without fields \
/// $fmt, $args: optional `format!` style detail
macro_rules! ERR {
   ($t:ident) => {
      $crate::error::Err::new($crate::error::ErrType::$t, String::new())
   };

   ($t:ident, $($arg:tt)+) => {
      $crate::error::Err::new($crate::error::ErrType::$t, format!($($arg)+))
   };
}

impl From<std::io::Error> for Err {
   fn from(err: std::io::Error) -> Err {
      return ERR!(Storage, "{err}");
   }
}

impl From<bincode::Error> for Err {
   fn from(err: bincode::Error) -> Err {
      return ERR!(Storage, "snapshot codec: {err}");
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_display_includes_detail() {
      let err = ERR!(Conflict, "negotiation {} already exists", "abc");
      assert_eq!(err.to_string(), "conflict: negotiation abc already exists");
      assert_eq!(ERR!(NotOpen).to_string(), "negotiation is not open");
   }

   #[test]
   fn test_structured_variants() {
      let err = Err::new(ErrType::CountMismatch { expected: 3, actual: 2 }, "");
      assert_eq!(err.to_string(), "message count mismatch: expected 3, selected 2");
      assert!(!err.is_infrastructure());
   }

   #[test]
   fn test_io_errors_are_infrastructure() {
      let err: Err = std::io::Error::new(std::io::ErrorKind::Other, "disk gone").into();
      assert!(err.is_infrastructure());
   }
}
