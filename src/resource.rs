use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::canonical::{self, CanonicalValue};
use crate::consts::*;
use crate::crypto::{sha256_hex, BackendRegistry, CryptoBackend, KeyData, KeyId};
use crate::envelope::{ByConsensus, Canonical, Envelope, Info};
use crate::error::{Err, ErrType, Result};
use crate::negotiation::{ConsensusRecord, NegotiationEngine};
use crate::store::Table;
use crate::ERR;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerStatus {
   Ready,
   Deleted,
}

impl PeerStatus {
   pub fn as_str(&self) -> &'static str {
      return match self {
         PeerStatus::Ready => "READY",
         PeerStatus::Deleted => "DELETED",
      };
   }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EndpointStatus {
   Open,
   Full,
   Closed,
   Processed,
}

impl EndpointStatus {
   pub fn as_str(&self) -> &'static str {
      return match self {
         EndpointStatus::Open => "OPEN",
         EndpointStatus::Full => "FULL",
         EndpointStatus::Closed => "CLOSED",
         EndpointStatus::Processed => "PROCESSED",
      };
   }
}

/// Position of a message in an endpoint's pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageBox {
   Inbox,
   Accepted,
   Processbox,
   Outbox,
}

impl MessageBox {
   pub fn as_str(&self) -> &'static str {
      return match self {
         MessageBox::Inbox => "INBOX",
         MessageBox::Accepted => "ACCEPTED",
         MessageBox::Processbox => "PROCESSBOX",
         MessageBox::Outbox => "OUTBOX",
      };
   }
}

impl fmt::Display for PeerStatus {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { return f.write_str(self.as_str()) }
}

impl fmt::Display for EndpointStatus {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { return f.write_str(self.as_str()) }
}

impl fmt::Display for MessageBox {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { return f.write_str(self.as_str()) }
}

/// One authorized transition. Logs are append-only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsensusLog {
   pub consensus_id: String,
   pub status: String,
   pub timestamp: DateTime<Utc>,
}

impl ConsensusLog {
   fn new(consensus_id: &str, status: &str) -> Self {
      return ConsensusLog {
         consensus_id: consensus_id.to_string(),
         status: status.to_string(),
         timestamp: Utc::now(),
      };
   }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
   pub peer_id: KeyId,
   pub name: String,
   pub backend_id: String,
   pub backend_params: String,
   pub key_data: KeyData,
   /// Empty for a self-owned peer.
   pub owners: Vec<KeyId>,
   pub status: PeerStatus,
   pub consensus_logs: Vec<ConsensusLog>,
}

impl Peer {
   /// Whether `caller` may act for this peer.
   pub fn check_permission(&self, caller: &str) -> Result<()> {
      let allowed = if self.owners.is_empty() {
         caller == self.peer_id
      } else {
         self.owners.iter().any(|owner| owner == caller)
      };
      if !allowed {
         return Err(ERR!(NotOwner, "{caller} may not act for peer {}", self.peer_id));
      }
      return Ok(());
   }

   /// Who must have signed a consensus authorizing `caller` to act for this peer.
   pub fn required_signers(&self, caller: &str) -> Vec<KeyId> {
      return required_signers(&self.owners, caller, &self.peer_id);
   }
}

fn required_signers(owners: &[KeyId], caller: &str, peer_id: &str) -> Vec<KeyId> {
   if !owners.is_empty() {
      return owners.to_vec();
   }
   let mut signers = vec![caller.to_string()];
   if caller != peer_id {
      signers.push(peer_id.to_string());
   }
   return signers;
}

/// Declares that messages leaving `from_box` of another endpoint feed `to_box` of this one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointLink {
   pub from_endpoint_id: String,
   pub from_box: MessageBox,
   pub to_box: MessageBox,
}

impl Canonical for EndpointLink {
   fn to_canonical(&self) -> CanonicalValue {
      return CanonicalValue::map([
         ("from_box", self.from_box.as_str()),
         ("from_endpoint_id", self.from_endpoint_id.as_str()),
         ("to_box", self.to_box.as_str()),
      ]);
   }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
   pub endpoint_id: String,
   pub peer_id: KeyId,
   pub size_min: u64,
   pub size_max: u64,
   pub endpoint_type: String,
   pub endpoint_params: String,
   pub status: EndpointStatus,
   pub links: Vec<EndpointLink>,
   pub inbox_hash: Option<String>,
   pub outbox_hash: Option<String>,
   pub process_proof: Option<Vec<u8>>,
   pub consensus_logs: Vec<ConsensusLog>,
}

impl Endpoint {
   pub fn last_consensus_id(&self) -> Option<&str> {
      return self.consensus_logs.last().map(|log| log.consensus_id.as_str());
   }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
   pub endpoint_id: String,
   pub serial: Option<u64>,
   pub sender: String,
   pub recipient: String,
   pub text: Vec<u8>,
   pub message_box: MessageBox,
   pub message_hash: String,
}

/// `sha256_hex(serial ‖ text ‖ sender ‖ recipient)` with the serial in decimal, or empty.
pub fn hash_message(serial: Option<u64>, text: &[u8], sender: &str, recipient: &str) -> String {
   let mut preimage = serial.map(|serial| serial.to_string()).unwrap_or_default().into_bytes();
   preimage.extend_from_slice(text);
   preimage.extend_from_slice(sender.as_bytes());
   preimage.extend_from_slice(recipient.as_bytes());
   return sha256_hex(&preimage);
}

/// Commitment to a message set: the hash of its sorted, deduplicated hashes concatenated.
pub fn compute_messages_hash(message_hashes: &[String]) -> String {
   let sorted: BTreeSet<&str> = message_hashes.iter().map(String::as_str).collect();
   return sha256_hex(sorted.into_iter().collect::<String>().as_bytes());
}

// Request payloads

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerData {
   pub peer_id: KeyId,
   pub name: String,
   pub backend_id: String,
   pub backend_params: String,
   pub key_data: KeyData,
   pub owners: Vec<KeyId>,
   pub status: PeerStatus,
}

impl Canonical for PeerData {
   fn to_canonical(&self) -> CanonicalValue {
      return CanonicalValue::map([
         ("backend_id", CanonicalValue::from(&self.backend_id)),
         ("backend_params", (&self.backend_params).into()),
         ("key_data", (&self.key_data).into()),
         ("name", (&self.name).into()),
         ("owners", CanonicalValue::list(&self.owners)),
         ("peer_id", (&self.peer_id).into()),
         ("status", self.status.as_str().into()),
      ]);
   }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointData {
   pub endpoint_id: String,
   pub peer_id: KeyId,
   pub size_min: u64,
   pub size_max: u64,
   pub endpoint_type: String,
   pub endpoint_params: String,
   pub status: EndpointStatus,
   pub links: Vec<EndpointLink>,
}

impl Canonical for EndpointData {
   fn to_canonical(&self) -> CanonicalValue {
      return CanonicalValue::map([
         ("endpoint_id", CanonicalValue::from(&self.endpoint_id)),
         ("endpoint_params", (&self.endpoint_params).into()),
         ("endpoint_type", (&self.endpoint_type).into()),
         ("links", CanonicalValue::list(self.links.iter().map(Canonical::to_canonical))),
         ("peer_id", (&self.peer_id).into()),
         ("size_max", self.size_max.into()),
         ("size_min", self.size_min.into()),
         ("status", self.status.as_str().into()),
      ]);
   }
}

/// Body of a `partial_update` on an endpoint: close (to CLOSED) or process (to PROCESSED).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointTransition {
   pub status: EndpointStatus,
   pub message_hashes: Vec<String>,
   pub process_proof: Option<Vec<u8>>,
}

impl Canonical for EndpointTransition {
   fn to_canonical(&self) -> CanonicalValue {
      let mut entries = vec![
         ("message_hashes", CanonicalValue::list(&self.message_hashes)),
         ("status", self.status.as_str().into()),
      ];
      if let Some(proof) = &self.process_proof {
         entries.push(("process_proof", proof.clone().into()));
      }
      return CanonicalValue::map(entries);
   }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageData {
   pub endpoint_id: String,
   pub serial: Option<u64>,
   pub sender: String,
   pub recipient: String,
   pub text: Vec<u8>,
   pub message_box: MessageBox,
   /// Optional client-side hash, checked against the recomputed one.
   pub message_hash: Option<String>,
}

impl Canonical for MessageData {
   fn to_canonical(&self) -> CanonicalValue {
      return CanonicalValue::map([
         ("box", CanonicalValue::from(self.message_box.as_str())),
         ("endpoint_id", (&self.endpoint_id).into()),
         ("message_hash", self.message_hash.clone().into()),
         ("recipient", (&self.recipient).into()),
         ("sender", (&self.sender).into()),
         ("serial", self.serial.into()),
         ("text", self.text.clone().into()),
      ]);
   }
}

/// An endpoint and its messages, locked as one unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointRecord {
   pub endpoint: Endpoint,
   pub messages: Vec<Message>,
}

impl EndpointRecord {
   /// Accept exactly the INBOX messages named by `message_hashes`.
   fn close(&mut self, message_hashes: &[String]) -> Result<()> {
      if !matches!(self.endpoint.status, EndpointStatus::Open | EndpointStatus::Full) {
         return Err(ERR!(WrongStatus, "cannot close an endpoint that is {}", self.endpoint.status));
      }
      let wanted: BTreeSet<&str> = message_hashes.iter().map(String::as_str).collect();
      let selected: Vec<usize> = self.messages
         .iter()
         .enumerate()
         .filter(|(_, message)| message.message_box == MessageBox::Inbox && wanted.contains(message.message_hash.as_str()))
         .map(|(i, _)| i)
         .collect();

      let count = selected.len();
      if count != message_hashes.len() {
         return Err(Err::new(ErrType::CountMismatch { expected: message_hashes.len(), actual: count }, ""));
      }
      if (count as u64) < self.endpoint.size_min {
         return Err(Err::new(ErrType::BelowMinimum { count, min: self.endpoint.size_min }, ""));
      }
      if count as u64 > self.endpoint.size_max {
         return Err(Err::new(ErrType::AboveMaximum { count, max: self.endpoint.size_max }, ""));
      }

      for i in selected {
         self.messages[i].message_box = MessageBox::Accepted;
      }
      self.endpoint.inbox_hash = Some(compute_messages_hash(message_hashes));
      self.endpoint.status = EndpointStatus::Closed;
      return Ok(());
   }

   /// Publish the PROCESSBOX, which must match `message_hashes` exactly.
   fn process(&mut self, message_hashes: &[String], process_proof: Option<Vec<u8>>) -> Result<()> {
      if self.endpoint.status != EndpointStatus::Closed {
         return Err(ERR!(WrongStatus, "cannot process an endpoint that is {}", self.endpoint.status));
      }
      let expected: BTreeSet<&str> = self.messages
         .iter()
         .filter(|message| message.message_box == MessageBox::Processbox)
         .map(|message| message.message_hash.as_str())
         .collect();
      let given: BTreeSet<&str> = message_hashes.iter().map(String::as_str).collect();
      if given.len() != message_hashes.len() || given != expected {
         return Err(Err::new(
            ErrType::CountMismatch { expected: expected.len(), actual: message_hashes.len() },
            "hashes do not match the PROCESSBOX",
         ));
      }

      for message in self.messages.iter_mut().filter(|message| message.message_box == MessageBox::Processbox) {
         message.message_box = MessageBox::Outbox;
      }
      self.endpoint.process_proof = process_proof;
      self.endpoint.outbox_hash = Some(compute_messages_hash(message_hashes));
      self.endpoint.status = EndpointStatus::Processed;
      return Ok(());
   }
}

fn expect_operation(info: &Info, operation: &str, resource: &str) -> Result<()> {
   if info.operation != operation || info.resource != resource {
      return Err(ERR!(Invalid, "expected {operation}/{resource}, got {}/{}", info.operation, info.resource));
   }
   return Ok(());
}

/// Peers, endpoints and their messages. Every privileged change is authorized by a consensus
/// frozen in the [`NegotiationEngine`].
///
/// Lock order is row before index, and an operation never holds two rows at once.
pub struct ResourceManager {
   backend: Arc<dyn CryptoBackend>,
   registry: BackendRegistry,
   engine: Arc<NegotiationEngine>,
   peers: Table<Peer>,
   endpoints: Table<EndpointRecord>,
   // key_data -> peer_id
   peer_keys: RwLock<HashMap<KeyData, KeyId>>,
}

impl ResourceManager {
   pub fn new(backend: Arc<dyn CryptoBackend>, registry: BackendRegistry, engine: Arc<NegotiationEngine>) -> Self {
      return ResourceManager {
         backend,
         registry,
         engine,
         peers: Table::new(),
         endpoints: Table::new(),
         peer_keys: RwLock::new(HashMap::new()),
      };
   }

   /// Rebuild from exported rows, registering every peer key with the backend again.
   pub fn from_rows(
      backend: Arc<dyn CryptoBackend>,
      registry: BackendRegistry,
      engine: Arc<NegotiationEngine>,
      peers: Vec<Peer>,
      endpoints: Vec<EndpointRecord>,
   ) -> Result<Self> {
      let mut peer_keys = HashMap::new();
      for peer in &peers {
         backend.register_key(&peer.key_data)?;
         peer_keys.insert(peer.key_data.clone(), peer.peer_id.clone());
      }
      return Ok(ResourceManager {
         backend,
         registry,
         engine,
         peers: Table::from_rows(peers.into_iter().map(|peer| (peer.peer_id.clone(), peer))),
         endpoints: Table::from_rows(endpoints.into_iter().map(|record| (record.endpoint.endpoint_id.clone(), record))),
         peer_keys: RwLock::new(peer_keys),
      });
   }

   pub fn export(&self) -> (Vec<Peer>, Vec<EndpointRecord>) {
      return (self.peers.export(), self.endpoints.export());
   }

   /// Verify the outer envelope signature and return the caller's key id.
   pub fn authenticate<D: Canonical>(&self, envelope: &Envelope<D>) -> Result<KeyId> {
      let payload = envelope.signed_payload()?;
      let caller = self.backend.verify(&payload, &envelope.meta.signature, envelope.meta.key_data.as_deref())?;
      return caller.ok_or_else(|| {
         warn!(operation = %envelope.info.operation, resource = %envelope.info.resource, "envelope signature rejected");
         ERR!(InvalidSignature, "envelope signature does not verify")
      });
   }

   /// Check a consensus proof against the request it is presented with.
   ///
   /// The agreed body (or the selected part of it) must equal `body` byte for byte, the
   /// agreed meta must accept, any listed `signers` must be exactly who signed, and every key
   /// in `required` must be among the signers.
   pub fn validate_consensus(&self, by_consensus: Option<&ByConsensus>, body: &CanonicalValue, required: &[KeyId]) -> Result<ConsensusRecord> {
      let by_consensus = by_consensus
         .ok_or_else(|| ERR!(ConsensusNotFound, "request carries no consensus proof"))?;
      let consensus = self.engine.consensus(&by_consensus.consensus_id)?;
      let document = consensus
         .document()
         .map_err(|err| ERR!(ConsensusMismatch, "agreed text does not decode: {err}"))?;

      let agreed = document.get("body")
         .ok_or_else(|| ERR!(ConsensusMismatch, "agreed text has no body"))?;
      let agreed = match by_consensus.consensus_part {
         None => agreed,
         Some(part) => agreed
            .as_list()
            .and_then(|parts| parts.get(part))
            .ok_or_else(|| ERR!(ConsensusMismatch, "consensus has no part {part}"))?,
      };
      if canonical::encode(body)? != canonical::encode(agreed)? {
         return Err(ERR!(ConsensusMismatch, "request differs from the agreed body"));
      }

      let meta = document.get("meta");
      if !meta.and_then(|meta| meta.get("accept")).is_some_and(CanonicalValue::is_truthy) {
         return Err(ERR!(ConsensusMismatch, "agreed text was not accepted"));
      }
      if let Some(signers) = meta.and_then(|meta| meta.get("signers")) {
         let listed = signers
            .as_list()
            .ok_or_else(|| ERR!(ConsensusMismatch, "meta.signers is not a list"))?
            .iter()
            .map(|signer| signer.as_str().ok_or_else(|| ERR!(ConsensusMismatch, "meta.signers holds a non-text entry")))
            .collect::<Result<BTreeSet<&str>>>()?;
         let recorded: BTreeSet<&str> = consensus.signings.keys().map(String::as_str).collect();
         if listed != recorded {
            return Err(ERR!(ConsensusMismatch, "recorded signers differ from meta.signers"));
         }
      }

      if let Some(missing) = required.iter().find(|key_id| !consensus.signed_by(key_id)) {
         return Err(ERR!(MissingSignature, "{missing} has not signed consensus {}", consensus.consensus_id));
      }
      return Ok(consensus);
   }

   /// Check `caller` may act for the READY peer `peer_id` and return the signers its consensus
   /// needs.
   fn authorize(&self, peer_id: &str, caller: &str) -> Result<Vec<KeyId>> {
      let handle = self.peers.require("peer", peer_id)?;
      let peer = handle.lock();
      if peer.status != PeerStatus::Ready {
         return Err(ERR!(WrongStatus, "peer {} is {}", peer.peer_id, peer.status));
      }
      peer.check_permission(caller)?;
      return Ok(peer.required_signers(caller));
   }

   pub fn create_peer(&self, envelope: &Envelope<PeerData>) -> Result<Peer> {
      let caller = self.authenticate(envelope)?;
      expect_operation(&envelope.info, OP_CREATE, RESOURCE_PEER)?;
      let data = &envelope.data;

      if data.status != PeerStatus::Ready {
         return Err(ERR!(WrongStatus, "a new peer must be {}", PeerStatus::Ready));
      }
      if !self.registry.contains(&data.backend_id) {
         return Err(ERR!(Unsupported, "no crypto backend named '{}'", data.backend_id));
      }
      if data.owners.is_empty() {
         if self.backend.get_key_id_from_key_data(&data.key_data)? != caller {
            return Err(ERR!(Invalid, "a self-owned peer must use the caller's own key"));
         }
      } else {
         if !data.owners.contains(&caller) {
            return Err(ERR!(NotOwner, "{caller} is not among the listed owners"));
         }
         if data.owners.iter().collect::<BTreeSet<_>>().len() != data.owners.len() {
            return Err(ERR!(Invalid, "owners must be unique"));
         }
         if self.backend.combine_keys(&data.owners)? != data.key_data {
            return Err(ERR!(Invalid, "key data is not the combination of the owners' keys"));
         }
      }
      let peer_id = self.backend.get_key_id_from_key_data(&data.key_data)?;
      if peer_id != data.peer_id {
         return Err(ERR!(Invalid, "peer id {} does not match its key data", data.peer_id));
      }

      let required = required_signers(&data.owners, &caller, &peer_id);
      let consensus = self.validate_consensus(envelope.by_consensus.as_ref(), &envelope.body(), &required)?;

      let peer = Peer {
         peer_id: peer_id.clone(),
         name: data.name.clone(),
         backend_id: data.backend_id.clone(),
         backend_params: data.backend_params.clone(),
         key_data: data.key_data.clone(),
         owners: data.owners.clone(),
         status: PeerStatus::Ready,
         consensus_logs: vec![ConsensusLog::new(&consensus.consensus_id, PeerStatus::Ready.as_str())],
      };
      {
         let mut peer_keys = self.peer_keys.write();
         if peer_keys.contains_key(&data.key_data) {
            return Err(ERR!(Conflict, "key data is already used by another peer"));
         }
         self.peers.insert_new(&peer_id, peer.clone())?;
         peer_keys.insert(data.key_data.clone(), peer_id.clone());
      }
      self.backend.register_key(&data.key_data)?;

      info!(peer_id = %peer_id, owners = peer.owners.len(), consensus_id = %consensus.consensus_id, "peer created");
      return Ok(peer);
   }

   pub fn create_endpoint(&self, envelope: &Envelope<EndpointData>) -> Result<Endpoint> {
      let caller = self.authenticate(envelope)?;
      expect_operation(&envelope.info, OP_CREATE, RESOURCE_ENDPOINT)?;
      let data = &envelope.data;

      if data.status != EndpointStatus::Open {
         return Err(ERR!(WrongStatus, "a new endpoint must be {}", EndpointStatus::Open));
      }
      if data.size_max == 0 || data.size_min > data.size_max {
         return Err(ERR!(Invalid, "size bounds [{}, {}] are empty", data.size_min, data.size_max));
      }
      let required = self.authorize(&data.peer_id, &caller)?;
      if let Some(link) = data.links.iter().find(|link| !self.endpoints.contains(&link.from_endpoint_id)) {
         return Err(ERR!(NotFound, "linked endpoint '{}' does not exist", link.from_endpoint_id));
      }
      let consensus = self.validate_consensus(envelope.by_consensus.as_ref(), &envelope.body(), &required)?;

      let endpoint = Endpoint {
         endpoint_id: data.endpoint_id.clone(),
         peer_id: data.peer_id.clone(),
         size_min: data.size_min,
         size_max: data.size_max,
         endpoint_type: data.endpoint_type.clone(),
         endpoint_params: data.endpoint_params.clone(),
         status: EndpointStatus::Open,
         links: data.links.clone(),
         inbox_hash: None,
         outbox_hash: None,
         process_proof: None,
         consensus_logs: vec![ConsensusLog::new(&consensus.consensus_id, EndpointStatus::Open.as_str())],
      };
      let record = EndpointRecord { endpoint: endpoint.clone(), messages: Vec::new() };
      self.endpoints.insert_new(&data.endpoint_id, record)?;

      info!(endpoint_id = %endpoint.endpoint_id, peer_id = %endpoint.peer_id, endpoint_type = %endpoint.endpoint_type, "endpoint created");
      return Ok(endpoint);
   }

   /// Close or process an endpoint.
   ///
   /// `info.on_last_consensus_id` must name the endpoint's most recent consensus log, so of
   /// two transitions built from the same state only the first can apply.
   pub fn update_endpoint(&self, envelope: &Envelope<EndpointTransition>) -> Result<Endpoint> {
      let caller = self.authenticate(envelope)?;
      expect_operation(&envelope.info, OP_PARTIAL_UPDATE, RESOURCE_ENDPOINT)?;
      let endpoint_id = envelope.info.id
         .as_deref()
         .ok_or_else(|| ERR!(Invalid, "partial_update needs info.id"))?;

      let handle = self.endpoints.require("endpoint", endpoint_id)?;
      let peer_id = handle.lock().endpoint.peer_id.clone();
      let required = self.authorize(&peer_id, &caller)?;
      let consensus = self.validate_consensus(envelope.by_consensus.as_ref(), &envelope.body(), &required)?;

      let transition = &envelope.data;
      let mut record = handle.lock();
      let on_last = envelope.info.on_last_consensus_id.as_deref();
      if on_last.is_none() || on_last != record.endpoint.last_consensus_id() {
         warn!(endpoint_id, on_last = ?on_last, "stale endpoint transition");
         return Err(ERR!(ConsensusMismatch, "on_last_consensus_id is not the endpoint's last consensus"));
      }
      match transition.status {
         EndpointStatus::Closed => record.close(&transition.message_hashes)?,
         EndpointStatus::Processed => record.process(&transition.message_hashes, transition.process_proof.clone())?,
         other => return Err(ERR!(Invalid, "an endpoint cannot be moved to {other}")),
      }
      record.endpoint.consensus_logs.push(ConsensusLog::new(&consensus.consensus_id, transition.status.as_str()));
      let endpoint = record.endpoint.clone();
      drop(record);

      info!(endpoint_id, status = %endpoint.status, messages = transition.message_hashes.len(), "endpoint transitioned");
      return Ok(endpoint);
   }

   /// Add a message to an endpoint's INBOX (while OPEN) or PROCESSBOX (while CLOSED).
   pub fn submit_message(&self, envelope: &Envelope<MessageData>) -> Result<Message> {
      let caller = self.authenticate(envelope)?;
      expect_operation(&envelope.info, OP_CREATE, RESOURCE_MESSAGE)?;
      let data = &envelope.data;

      let message_hash = hash_message(data.serial, &data.text, &data.sender, &data.recipient);
      if data.message_hash.as_ref().is_some_and(|declared| *declared != message_hash) {
         return Err(ERR!(Invalid, "declared message hash does not match its content"));
      }

      let handle = self.endpoints.require("endpoint", &data.endpoint_id)?;
      let required_status = match data.message_box {
         MessageBox::Inbox => {
            if data.serial.is_some() {
               return Err(ERR!(Invalid, "INBOX messages carry no serial"));
            }
            EndpointStatus::Open
         }
         MessageBox::Processbox => {
            if data.serial.is_none() {
               return Err(ERR!(Invalid, "PROCESSBOX messages need a serial"));
            }
            let peer_id = handle.lock().endpoint.peer_id.clone();
            self.authorize(&peer_id, &caller)?;
            EndpointStatus::Closed
         }
         other => return Err(ERR!(Invalid, "messages cannot be submitted to {other}")),
      };

      let mut record = handle.lock();
      if record.endpoint.status != required_status {
         return Err(ERR!(WrongStatus, "endpoint {} is {}", data.endpoint_id, record.endpoint.status));
      }
      if record.messages.iter().any(|message| message.message_hash == message_hash) {
         return Err(ERR!(Conflict, "message {message_hash} already exists"));
      }
      let message = Message {
         endpoint_id: data.endpoint_id.clone(),
         serial: data.serial,
         sender: data.sender.clone(),
         recipient: data.recipient.clone(),
         text: data.text.clone(),
         message_box: data.message_box,
         message_hash,
      };
      record.messages.push(message.clone());
      debug!(endpoint_id = %data.endpoint_id, message_box = %message.message_box, "message stored");
      return Ok(message);
   }

   pub fn peer(&self, peer_id: &str) -> Result<Peer> {
      let handle = self.peers.require("peer", peer_id)?;
      let peer = handle.lock().clone();
      return Ok(peer);
   }

   pub fn endpoint(&self, endpoint_id: &str) -> Result<Endpoint> {
      let handle = self.endpoints.require("endpoint", endpoint_id)?;
      let endpoint = handle.lock().endpoint.clone();
      return Ok(endpoint);
   }

   /// Endpoints in id order, optionally narrowed to one peer and one status.
   pub fn endpoints(&self, peer_id: Option<&str>, status: Option<EndpointStatus>) -> Vec<Endpoint> {
      return self.endpoints
         .handles()
         .iter()
         .map(|handle| handle.lock().endpoint.clone())
         .filter(|endpoint| peer_id.map_or(true, |peer_id| endpoint.peer_id == peer_id))
         .filter(|endpoint| status.map_or(true, |status| endpoint.status == status))
         .collect();
   }

   /// Messages ordered by serial, then by arrival.
   pub fn messages(&self, endpoint_id: &str, message_box: Option<MessageBox>) -> Result<Vec<Message>> {
      let handle = self.endpoints.require("endpoint", endpoint_id)?;
      let mut messages: Vec<Message> = handle
         .lock()
         .messages
         .iter()
         .filter(|message| message_box.map_or(true, |message_box| message.message_box == message_box))
         .cloned()
         .collect();
      messages.sort_by_key(|message| message.serial);
      return Ok(messages);
   }
}
