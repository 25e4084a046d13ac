use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use parking_lot::RwLock;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::canonical::{self, CanonicalValue};
use crate::crypto::{hash_canonical, CryptoBackend, KeyId};
use crate::error::Result;
use crate::store::Table;
use crate::ERR;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NegotiationStatus {
   Open,
   Done,
}

impl fmt::Display for NegotiationStatus {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      return f.write_str(match self {
         NegotiationStatus::Open => "OPEN",
         NegotiationStatus::Done => "DONE",
      });
   }
}

/// A shared slot collecting signed contributions until they converge.
/// `text`, `timestamp` and `consensus_id` are set together when it freezes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Negotiation {
   pub id: String,
   pub status: NegotiationStatus,
   pub text: Option<Vec<u8>>,
   pub timestamp: Option<DateTime<Utc>>,
   pub consensus_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contribution {
   /// Sequence number within the negotiation, starting at 1.
   pub id: u64,
   pub negotiation_id: String,
   /// Canonical `{body, meta}` exactly as signed.
   pub text: Vec<u8>,
   pub signer_key_id: KeyId,
   pub signature: Vec<u8>,
   pub latest: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signing {
   pub negotiation_id: String,
   pub signer_key_id: KeyId,
   pub signature: Vec<u8>,
}

/// A negotiation together with the rows only it owns. Locked as one unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NegotiationRecord {
   pub negotiation: Negotiation,
   pub contributions: Vec<Contribution>,
   pub signings: Vec<Signing>,
}

impl NegotiationRecord {
   fn latest(&self) -> Vec<&Contribution> {
      return self.contributions.iter().filter(|contribution| contribution.latest).collect();
   }
}

/// What freezing a negotiation writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClosingResult {
   pub text: Vec<u8>,
   pub timestamp: DateTime<Utc>,
   pub consensus_id: String,
   pub signings: Vec<Signing>,
}

/// The frozen outcome of a negotiation, addressed by its consensus id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsensusRecord {
   pub consensus_id: String,
   pub negotiation_id: String,
   pub text: Vec<u8>,
   pub timestamp: DateTime<Utc>,
   /// Signer key id to signature.
   pub signings: BTreeMap<KeyId, Vec<u8>>,
}

impl ConsensusRecord {
   /// The agreed `{body, meta}` document.
   pub fn document(&self) -> Result<CanonicalValue> {
      return canonical::decode_all(&self.text);
   }

   pub fn signed_by(&self, key_id: &str) -> bool {
      return self.signings.contains_key(key_id);
   }
}

/// Format used for the timestamp inside the consensus digest.
pub fn consensus_timestamp(timestamp: &DateTime<Utc>) -> String {
   return timestamp.to_rfc3339_opts(SecondsFormat::Micros, true);
}

/// `sha256_hex(canonical({timestamp, negotiation_id, text, signings}))`.
pub fn consensus_digest(
   timestamp: &DateTime<Utc>,
   negotiation_id: &str,
   text: &[u8],
   signings: &BTreeMap<KeyId, Vec<u8>>,
) -> Result<String> {
   let signings = CanonicalValue::map(
      signings.iter().map(|(signer, signature)| (signer.as_str(), signature.clone()))
   );
   let consensus = CanonicalValue::map([
      ("negotiation_id", CanonicalValue::from(negotiation_id)),
      ("signings", signings),
      ("text", text.into()),
      ("timestamp", consensus_timestamp(timestamp).into()),
   ]);
   return hash_canonical(&consensus);
}

/// Decide whether the current latest contributions converge.
///
/// They converge when there is at least one, all carry byte-identical text, and that text's
/// `meta.accept` is true. Anything that fails along the way, including a text that does not
/// decode, means "not converged".
pub fn evaluate_closing(negotiation_id: &str, latest: &[&Contribution], now: DateTime<Utc>) -> Option<ClosingResult> {
   let first = latest.first()?;
   if latest.iter().any(|contribution| contribution.text != first.text) {
      return None;
   }

   let document = canonical::decode_all(&first.text).ok()?;
   if !document.get("meta")?.get("accept")?.is_truthy() {
      return None;
   }

   let timestamp = now.trunc_subsecs(6);
   let by_signer: BTreeMap<KeyId, Vec<u8>> = latest
      .iter()
      .map(|contribution| (contribution.signer_key_id.clone(), contribution.signature.clone()))
      .collect();
   let consensus_id = consensus_digest(&timestamp, negotiation_id, &first.text, &by_signer).ok()?;

   let signings = by_signer
      .into_iter()
      .map(|(signer_key_id, signature)| Signing {
         negotiation_id: negotiation_id.to_string(),
         signer_key_id,
         signature,
      })
      .collect();
   return Some(ClosingResult { text: first.text.clone(), timestamp, consensus_id, signings });
}

/// Canonical `{body, meta}`, the exact bytes a contribution signs.
pub fn contribution_text(body: &CanonicalValue, meta: &CanonicalValue) -> Result<Vec<u8>> {
   return canonical::encode(&CanonicalValue::map([("body", body.clone()), ("meta", meta.clone())]));
}

/// Collects contributions and freezes consensus records.
///
/// Every negotiation is its own locked row group. `contribute` holds that lock from the
/// status check through closing evaluation, so two contributions to the same negotiation can
/// never both observe it OPEN and both freeze it.
pub struct NegotiationEngine {
   backend: Arc<dyn CryptoBackend>,
   id_bytes: usize,
   negotiations: Table<NegotiationRecord>,
   // consensus_id -> negotiation id
   consensus_index: RwLock<HashMap<String, String>>,
}

impl NegotiationEngine {
   pub fn new(backend: Arc<dyn CryptoBackend>, id_bytes: usize) -> Self {
      return NegotiationEngine {
         backend,
         id_bytes,
         negotiations: Table::new(),
         consensus_index: RwLock::new(HashMap::new()),
      };
   }

   /// Rebuild an engine from exported records.
   pub fn from_records(backend: Arc<dyn CryptoBackend>, id_bytes: usize, records: Vec<NegotiationRecord>) -> Self {
      let index = records
         .iter()
         .filter_map(|record| {
            let consensus_id = record.negotiation.consensus_id.clone()?;
            Some((consensus_id, record.negotiation.id.clone()))
         })
         .collect();
      let rows = records.into_iter().map(|record| (record.negotiation.id.clone(), record));
      return NegotiationEngine {
         backend,
         id_bytes,
         negotiations: Table::from_rows(rows),
         consensus_index: RwLock::new(index),
      };
   }

   pub fn export(&self) -> Vec<NegotiationRecord> {
      return self.negotiations.export();
   }

   fn generate_id(&self) -> String {
      let mut bytes = vec![0u8; self.id_bytes];
      OsRng.fill_bytes(&mut bytes);
      return hex::encode(bytes);
   }

   /// Open a new negotiation under `id`, or under a random id when none is given.
   /// # Errors
   /// `Conflict` if `id` is already used.
   pub fn create_negotiation(&self, id: Option<String>) -> Result<Negotiation> {
      let id = id.unwrap_or_else(|| self.generate_id());
      let negotiation = Negotiation {
         id: id.clone(),
         status: NegotiationStatus::Open,
         text: None,
         timestamp: None,
         consensus_id: None,
      };
      let record = NegotiationRecord {
         negotiation: negotiation.clone(),
         contributions: Vec::new(),
         signings: Vec::new(),
      };
      self.negotiations.insert_new(&id, record)?;
      debug!(negotiation_id = %id, "negotiation opened");
      return Ok(negotiation);
   }

   /// Submit a signed `{body, meta}` to a negotiation.
   ///
   /// `key_data`, when given, is the key the signature must verify under; otherwise the
   /// backend uses whatever key the signature carries.
   /// # Errors
   /// `NotFound`, `NotOpen` once the negotiation is DONE, `InvalidSignature` unless the
   /// signature verifies for `signer_key_id`, and `MalformedEncoding` for a signature that
   /// does not decode.
   pub fn contribute(
      &self,
      negotiation_id: &str,
      body: &CanonicalValue,
      meta: &CanonicalValue,
      signature: &[u8],
      signer_key_id: &str,
      key_data: Option<&str>,
   ) -> Result<Contribution> {
      let handle = self.negotiations.require("negotiation", negotiation_id)?;
      let text = contribution_text(body, meta)?;

      let mut record = handle.lock();
      if record.negotiation.status != NegotiationStatus::Open {
         return Err(ERR!(NotOpen, "negotiation {negotiation_id} is {}", record.negotiation.status));
      }
      let recovered = self.backend.verify(&text, signature, key_data)?;
      if recovered.as_deref() != Some(signer_key_id) {
         warn!(negotiation_id, signer = signer_key_id, "contribution signature rejected");
         return Err(ERR!(InvalidSignature, "signature does not verify for {signer_key_id}"));
      }

      for previous in record.contributions.iter_mut() {
         if previous.signer_key_id == signer_key_id {
            previous.latest = false;
         }
      }
      let contribution = Contribution {
         id: record.contributions.len() as u64 + 1,
         negotiation_id: negotiation_id.to_string(),
         text,
         signer_key_id: signer_key_id.to_string(),
         signature: signature.to_vec(),
         latest: true,
      };
      record.contributions.push(contribution.clone());
      debug!(negotiation_id, signer = signer_key_id, sequence = contribution.id, "contribution accepted");

      let closing = evaluate_closing(negotiation_id, &record.latest(), Utc::now());
      let Some(closing) = closing else {
         debug!(negotiation_id, "not converged");
         return Ok(contribution);
      };

      record.negotiation.status = NegotiationStatus::Done;
      record.negotiation.text = Some(closing.text);
      record.negotiation.timestamp = Some(closing.timestamp);
      record.negotiation.consensus_id = Some(closing.consensus_id.clone());
      let signers = closing.signings.len();
      record.signings.extend(closing.signings);
      self.consensus_index.write().insert(closing.consensus_id.clone(), negotiation_id.to_string());
      drop(record);

      info!(negotiation_id, consensus_id = %closing.consensus_id, signers, "consensus reached");
      return Ok(contribution);
   }

   pub fn retrieve(&self, negotiation_id: &str) -> Result<Negotiation> {
      let handle = self.negotiations.require("negotiation", negotiation_id)?;
      let negotiation = handle.lock().negotiation.clone();
      return Ok(negotiation);
   }

   /// All negotiations, or only the one that froze with `consensus_id`.
   pub fn list(&self, consensus_id: Option<&str>) -> Vec<Negotiation> {
      let Some(consensus_id) = consensus_id else {
         return self.negotiations
            .handles()
            .iter()
            .map(|handle| handle.lock().negotiation.clone())
            .collect();
      };
      let negotiation_id = self.consensus_index.read().get(consensus_id).cloned();
      return negotiation_id
         .and_then(|id| self.retrieve(&id).ok())
         .into_iter()
         .collect();
   }

   /// Look up a frozen consensus.
   /// # Errors
   /// `ConsensusNotFound` unless a DONE negotiation carries `consensus_id`.
   pub fn consensus(&self, consensus_id: &str) -> Result<ConsensusRecord> {
      let negotiation_id = self.consensus_index
         .read()
         .get(consensus_id)
         .cloned()
         .ok_or_else(|| ERR!(ConsensusNotFound, "no consensus {consensus_id}"))?;
      let handle = self.negotiations
         .get(&negotiation_id)
         .ok_or_else(|| ERR!(ConsensusNotFound, "no consensus {consensus_id}"))?;

      let record = handle.lock();
      let negotiation = &record.negotiation;
      let (Some(text), Some(timestamp)) = (&negotiation.text, negotiation.timestamp) else {
         return Err(ERR!(ConsensusNotFound, "negotiation {negotiation_id} is not DONE"));
      };
      if negotiation.status != NegotiationStatus::Done {
         return Err(ERR!(ConsensusNotFound, "negotiation {negotiation_id} is not DONE"));
      }
      return Ok(ConsensusRecord {
         consensus_id: consensus_id.to_string(),
         negotiation_id: negotiation_id.clone(),
         text: text.clone(),
         timestamp,
         signings: record.signings
            .iter()
            .map(|signing| (signing.signer_key_id.clone(), signing.signature.clone()))
            .collect(),
      });
   }

   /// Contributions in submission order, optionally only the latest one per signer.
   pub fn contributions(&self, negotiation_id: &str, latest_only: bool) -> Result<Vec<Contribution>> {
      let handle = self.negotiations.require("negotiation", negotiation_id)?;
      let record = handle.lock();
      return Ok(record.contributions
         .iter()
         .filter(|contribution| !latest_only || contribution.latest)
         .cloned()
         .collect());
   }
}
