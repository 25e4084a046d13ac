use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::Config;
use crate::crypto::{BackendRegistry, CryptoBackend};
use crate::error::Result;
use crate::negotiation::{NegotiationEngine, NegotiationRecord};
use crate::resource::{EndpointRecord, Peer, ResourceManager};
use crate::store::{read_snapshot, write_snapshot};
use crate::ERR;

/// Everything the service holds, as written to a snapshot file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
   pub negotiations: Vec<NegotiationRecord>,
   pub peers: Vec<Peer>,
   pub endpoints: Vec<EndpointRecord>,
}

/// The coordinating service: one negotiation engine and the resources it authorizes, sharing
/// the backend named in the config.
pub struct Service {
   config: Config,
   backend: Arc<dyn CryptoBackend>,
   engine: Arc<NegotiationEngine>,
   resources: ResourceManager,
}

impl Service {
   /// # Errors
   /// `Unsupported` if `config.backend` is not in `registry`.
   pub fn new(config: Config, registry: BackendRegistry) -> Result<Self> {
      let backend = registry.resolve(&config.backend)?;
      let engine = Arc::new(NegotiationEngine::new(backend.clone(), config.negotiation_id_bytes));
      let resources = ResourceManager::new(backend.clone(), registry, engine.clone());
      info!(backend = %config.backend, "service started");
      return Ok(Service { config, backend, engine, resources });
   }

   /// Rebuild a service from a snapshot written by [`Service::save_snapshot`].
   pub fn restore(config: Config, registry: BackendRegistry, path: &Path) -> Result<Self> {
      let snapshot: Snapshot = read_snapshot(path)?;
      let backend = registry.resolve(&config.backend)?;
      let engine = Arc::new(NegotiationEngine::from_records(
         backend.clone(),
         config.negotiation_id_bytes,
         snapshot.negotiations,
      ));
      let resources = ResourceManager::from_rows(backend.clone(), registry, engine.clone(), snapshot.peers, snapshot.endpoints)?;
      info!(path = %path.display(), "service restored");
      return Ok(Service { config, backend, engine, resources });
   }

   /// Start from the configured snapshot if it exists, otherwise empty.
   pub fn open(config: Config, registry: BackendRegistry) -> Result<Self> {
      return match config.snapshot_path.clone() {
         Some(path) if path.exists() => Service::restore(config, registry, &path),
         _ => Service::new(config, registry),
      };
   }

   /// Write every table. Each row is copied under its own lock, so a snapshot taken while
   /// requests are running is consistent per row.
   pub fn save_snapshot(&self, path: &Path) -> Result<()> {
      let (peers, endpoints) = self.resources.export();
      let snapshot = Snapshot { negotiations: self.engine.export(), peers, endpoints };
      write_snapshot(path, &snapshot)?;
      info!(path = %path.display(), negotiations = snapshot.negotiations.len(), "snapshot saved");
      return Ok(());
   }

   /// Save to the configured snapshot path.
   pub fn checkpoint(&self) -> Result<()> {
      let path = self.config.snapshot_path
         .as_deref()
         .ok_or_else(|| ERR!(Storage, "no snapshot_path configured"))?;
      return self.save_snapshot(path);
   }

   pub fn config(&self) -> &Config { return &self.config }

   pub fn backend(&self) -> &Arc<dyn CryptoBackend> { return &self.backend }

   pub fn engine(&self) -> &NegotiationEngine { return &self.engine }

   pub fn resources(&self) -> &ResourceManager { return &self.resources }
}

#[cfg(test)]
mod tests {
   use super::*;
   use crate::client::{sign_contribution, sign_envelope, Document};
   use crate::consts::*;
   use crate::crypto::Ed25519Backend;
   use crate::envelope::{document_body, ByConsensus, Info};
   use crate::error::ErrType;
   use crate::negotiation::NegotiationStatus;
   use crate::resource::{PeerData, PeerStatus};

   fn create_peer(service: &Service, owner: &Ed25519Backend) -> Peer {
      let info = Info::new(OP_CREATE, RESOURCE_PEER);
      let data = PeerData {
         peer_id: owner.key_id().unwrap(),
         name: String::from("alice"),
         backend_id: String::from(ED25519_BACKEND),
         backend_params: String::new(),
         key_data: owner.key_data().unwrap(),
         owners: Vec::new(),
         status: PeerStatus::Ready,
      };
      let negotiation = service.engine().create_negotiation(None).unwrap();
      sign_contribution(owner, &Document::new(document_body(&info, &data)))
         .unwrap()
         .submit(service.engine(), &negotiation.id)
         .unwrap();
      let consensus_id = service.engine().retrieve(&negotiation.id).unwrap().consensus_id.unwrap();
      let envelope = sign_envelope(owner, info, data, Some(ByConsensus::new(&consensus_id))).unwrap();
      return service.resources().create_peer(&envelope).unwrap();
   }

   #[test]
   fn test_unknown_backend_is_rejected() {
      let config = Config { backend: String::from("gpg"), ..Config::default() };
      let err = Service::new(config, BackendRegistry::with_defaults()).err().unwrap();
      assert_eq!(err.err_type, ErrType::Unsupported);
   }

   #[test]
   fn test_snapshot_round_trip() {
      let dir = tempfile::tempdir().unwrap();
      let path = dir.path().join("state.bin");
      let config = Config { snapshot_path: Some(path.clone()), ..Config::default() };

      let service = Service::new(config.clone(), BackendRegistry::with_defaults()).unwrap();
      let alice = Ed25519Backend::generate();
      let peer = create_peer(&service, &alice);
      let open = service.engine().create_negotiation(Some(String::from("pending"))).unwrap();
      service.checkpoint().unwrap();

      let restored = Service::open(config, BackendRegistry::with_defaults()).unwrap();
      assert_eq!(restored.resources().peer(&peer.peer_id).unwrap(), peer);
      assert_eq!(restored.engine().retrieve("pending").unwrap(), open);
      let consensus_id = peer.consensus_logs[0].consensus_id.as_str();
      let done = restored.engine().list(Some(consensus_id));
      assert_eq!(done.len(), 1);
      assert_eq!(done[0].status, NegotiationStatus::Done);

      // Restored peer keys are known to the backend again
      assert!(restored.backend().combine_keys(&[peer.peer_id.clone()]).is_ok());
   }

   #[test]
   fn test_checkpoint_needs_a_path() {
      let service = Service::new(Config::default(), BackendRegistry::with_defaults()).unwrap();
      assert!(service.checkpoint().unwrap_err().is_infrastructure());
      assert!(Service::restore(Config::default(), BackendRegistry::with_defaults(), Path::new("/no/such/file")).is_err());
   }
}
