// Threads
use std::thread;
use std::time::Duration;

use tracing::debug;

use crate::canonical::CanonicalValue;
use crate::consts::*;
use crate::crypto::{CryptoBackend, EndpointMeta, KeyData, KeyId};
use crate::envelope::{signed_payload, ByConsensus, Canonical, Envelope, Info, Meta};
use crate::error::Result;
use crate::negotiation::{contribution_text, Contribution, Negotiation, NegotiationEngine, NegotiationStatus};
use crate::resource::{hash_message, Endpoint, Message, MessageBox, MessageData};

/// A candidate `{body, meta}` for a negotiation.
/// # Example
/// ```
/// use mixnet_consensus::client::Document;
/// use mixnet_consensus::canonical::CanonicalValue;
///
/// let proposal = Document::new(CanonicalValue::from("rotate keys")).accept(false);
/// assert_eq!(proposal.meta().get("accept").and_then(CanonicalValue::as_u64), Some(0));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
   pub body: CanonicalValue,
   pub accept: bool,
   /// When set, the consensus is only valid if exactly these keys signed it.
   pub signers: Option<Vec<KeyId>>,
}

impl Document {
   /// An accepting document for `body`.
   pub fn new(body: CanonicalValue) -> Self {
      return Document { body, accept: true, signers: None };
   }

   /// One document agreeing on several independent parts, addressed by index.
   pub fn batch(parts: Vec<CanonicalValue>) -> Self {
      return Document::new(CanonicalValue::List(parts));
   }

   pub fn accept(mut self, accept: bool) -> Self {
      self.accept = accept;
      return self;
   }

   pub fn signers(mut self, signers: Vec<KeyId>) -> Self {
      self.signers = Some(signers);
      return self;
   }

   pub fn meta(&self) -> CanonicalValue {
      let mut entries = vec![("accept", CanonicalValue::from(self.accept))];
      if let Some(signers) = &self.signers {
         entries.push(("signers", CanonicalValue::list(signers)));
      }
      return CanonicalValue::map(entries);
   }

   /// The bytes that get signed and, once agreed, frozen.
   pub fn text(&self) -> Result<Vec<u8>> {
      return contribution_text(&self.body, &self.meta());
   }
}

/// A document signed by one party, ready to submit.
#[derive(Debug, Clone)]
pub struct SignedContribution {
   pub body: CanonicalValue,
   pub meta: CanonicalValue,
   pub signature: Vec<u8>,
   pub signer_key_id: KeyId,
   pub key_data: KeyData,
}

impl SignedContribution {
   pub fn submit(&self, engine: &NegotiationEngine, negotiation_id: &str) -> Result<Contribution> {
      return engine.contribute(
         negotiation_id,
         &self.body,
         &self.meta,
         &self.signature,
         &self.signer_key_id,
         Some(&self.key_data),
      );
   }
}

pub fn sign_contribution(backend: &dyn CryptoBackend, document: &Document) -> Result<SignedContribution> {
   return Ok(SignedContribution {
      body: document.body.clone(),
      meta: document.meta(),
      signature: backend.sign(&document.text()?)?,
      signer_key_id: backend.key_id()?,
      key_data: backend.key_data()?,
   });
}

/// Build a resource request signed by `backend`.
pub fn sign_envelope<D: Canonical>(backend: &dyn CryptoBackend, info: Info, data: D, by_consensus: Option<ByConsensus>) -> Result<Envelope<D>> {
   let signature = backend.sign(&signed_payload(&info, &data, by_consensus.as_ref())?)?;
   return Ok(Envelope {
      info,
      data,
      by_consensus,
      meta: Meta { signature, key_data: Some(backend.key_data()?) },
   });
}

/// Poll a negotiation until it is DONE.
/// Returns None on timeout or if the negotiation does not exist.
///
/// # Parameters
/// `tick_rate`: the number of milliseconds between each poll. \
/// `timeout`: the max number of milliseconds to block on this thread.
pub fn wait_for_consensus(engine: &NegotiationEngine, negotiation_id: &str, tick_rate: u64, timeout: u64) -> Option<Negotiation> {
   let mut counter = 0u64;
   loop {
      let negotiation = engine.retrieve(negotiation_id).ok()?;
      if negotiation.status == NegotiationStatus::Done {
         return Some(negotiation);
      }
      if counter >= timeout {
         debug!(negotiation_id, timeout, "gave up waiting for consensus");
         return None;
      }
      thread::sleep(Duration::from_millis(tick_rate));
      counter += tick_rate.max(1);
   }
}

/// [`wait_for_consensus`] with the default tick and deadline.
pub fn wait_for_consensus_default(engine: &NegotiationEngine, negotiation_id: &str) -> Option<Negotiation> {
   return wait_for_consensus(engine, negotiation_id, POLL_TICK_MS, POLL_TIMEOUT_MS);
}

/// Output of one processing step, ready to be agreed on and published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessedBatch {
   /// PROCESSBOX submissions numbered by their output position.
   pub submissions: Vec<MessageData>,
   pub message_hashes: Vec<String>,
   pub proof: Option<Vec<u8>>,
}

/// Run `backend` over an endpoint's ACCEPTED messages on behalf of its owning peer.
pub fn process_inbox(backend: &dyn CryptoBackend, endpoint: &Endpoint, accepted: &[Message], recipients: Option<&[KeyId]>) -> Result<ProcessedBatch> {
   let processed = backend.process(&EndpointMeta::from(endpoint), accepted, recipients)?;

   let mut submissions = Vec::<MessageData>::with_capacity(processed.outputs.len());
   for (serial, (recipient, text)) in processed.outputs.into_iter().enumerate() {
      let serial = Some(serial as u64);
      let recipient = recipient.unwrap_or_default();
      let message_hash = hash_message(serial, &text, &endpoint.peer_id, &recipient);
      submissions.push(MessageData {
         endpoint_id: endpoint.endpoint_id.clone(),
         serial,
         sender: endpoint.peer_id.clone(),
         recipient,
         text,
         message_box: MessageBox::Processbox,
         message_hash: Some(message_hash),
      });
   }
   let message_hashes = submissions
      .iter()
      .filter_map(|submission| submission.message_hash.clone())
      .collect();
   return Ok(ProcessedBatch { submissions, message_hashes, proof: processed.proof });
}

#[cfg(test)]
mod tests {
   use super::*;
   use crate::crypto::Ed25519Backend;
   use crate::resource::EndpointStatus;
   use std::sync::Arc;

   fn engine() -> Arc<NegotiationEngine> {
      return Arc::new(NegotiationEngine::new(Arc::new(Ed25519Backend::verifier()), 16));
   }

   #[test]
   fn test_document_meta() {
      let document = Document::new(CanonicalValue::from("x")).signers(vec![String::from("a")]);
      let meta = document.meta();
      assert!(meta.get("accept").unwrap().is_truthy());
      assert_eq!(meta.get("signers").and_then(CanonicalValue::as_list).map(<[CanonicalValue]>::len), Some(1));
      assert_ne!(document.text().unwrap(), document.clone().accept(false).text().unwrap());
   }

   #[test]
   fn test_signed_contribution_closes_negotiation() {
      let engine = engine();
      let alice = Ed25519Backend::generate();
      let id = engine.create_negotiation(None).unwrap().id;
      let signed = sign_contribution(&alice, &Document::new(CanonicalValue::from("x"))).unwrap();
      assert_eq!(signed.signer_key_id, alice.key_id().unwrap());
      signed.submit(&engine, &id).unwrap();

      let negotiation = wait_for_consensus(&engine, &id, 1, 0).unwrap();
      assert_eq!(negotiation.status, NegotiationStatus::Done);
   }

   #[test]
   fn test_wait_for_consensus_times_out() {
      let engine = engine();
      let id = engine.create_negotiation(None).unwrap().id;
      assert_eq!(wait_for_consensus(&engine, &id, 5, 20), None);
      assert_eq!(wait_for_consensus(&engine, "missing", 5, 20), None);
   }

   #[test]
   fn test_wait_for_consensus_sees_a_late_closing() {
      let engine = engine();
      let id = engine.create_negotiation(None).unwrap().id;
      let waiter = {
         let engine = engine.clone();
         let id = id.clone();
         thread::spawn(move || wait_for_consensus(&engine, &id, 5, 5_000))
      };
      thread::sleep(Duration::from_millis(20));
      let alice = Ed25519Backend::generate();
      sign_contribution(&alice, &Document::new(CanonicalValue::from("x"))).unwrap().submit(&engine, &id).unwrap();
      assert!(waiter.join().unwrap().is_some());
   }

   #[test]
   fn test_process_inbox_numbers_outputs() {
      let mixer = Ed25519Backend::generate();
      let endpoint = Endpoint {
         endpoint_id: String::from("e1"),
         peer_id: mixer.key_id().unwrap(),
         size_min: 1,
         size_max: 4,
         endpoint_type: String::from(ENDPOINT_GATEWAY),
         endpoint_params: String::new(),
         status: EndpointStatus::Closed,
         links: Vec::new(),
         inbox_hash: None,
         outbox_hash: None,
         process_proof: None,
         consensus_logs: Vec::new(),
      };
      let accepted: Vec<Message> = ["a", "b"]
         .iter()
         .map(|text| Message {
            endpoint_id: String::from("e1"),
            serial: None,
            sender: String::from("s"),
            recipient: String::from("bob"),
            text: text.as_bytes().to_vec(),
            message_box: MessageBox::Accepted,
            message_hash: hash_message(None, text.as_bytes(), "s", "bob"),
         })
         .collect();

      let batch = process_inbox(&mixer, &endpoint, &accepted, None).unwrap();
      assert_eq!(batch.submissions.len(), 2);
      assert_eq!(batch.message_hashes.len(), 2);
      for (i, submission) in batch.submissions.iter().enumerate() {
         assert_eq!(submission.serial, Some(i as u64));
         assert_eq!(submission.recipient, "bob");
         assert_eq!(submission.message_box, MessageBox::Processbox);
         assert_eq!(submission.message_hash.as_ref(), Some(&batch.message_hashes[i]));
      }
   }

   #[test]
   fn test_sign_envelope_verifies() {
      let alice = Ed25519Backend::generate();
      let server = Ed25519Backend::verifier();
      let envelope = sign_envelope(&alice, Info::new(OP_CREATE, RESOURCE_PEER), CanonicalValue::from("x"), None).unwrap();
      let payload = envelope.signed_payload().unwrap();
      assert_eq!(server.verify(&payload, &envelope.meta.signature, envelope.meta.key_data.as_deref()).unwrap(), alice.key_id().ok());
   }
}
