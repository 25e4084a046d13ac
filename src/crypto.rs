// Encryption
use ed25519_dalek::{SigningKey, Signature, VerifyingKey, Signer, Verifier};
use curve25519_dalek::edwards::{CompressedEdwardsY, EdwardsPoint};
use curve25519_dalek::traits::Identity;
use x25519_dalek::{EphemeralSecret, PublicKey, StaticSecret};
use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm
};
use sha2::{Digest, Sha256};

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::RwLock;
use rand::prelude::SliceRandom;
use rand::random;
use tracing::debug;

use crate::canonical::{self, CanonicalValue};
use crate::consts::*;
use crate::error::{Err, ErrType, Result};
use crate::resource::{Endpoint, Message};
use crate::ERR;

/// Identifies a signer. Derived from key data by the backend that owns the key.
pub type KeyId = String;
/// Public key material in the backend's textual form.
pub type KeyData = String;

/// SHA-256 as lowercase hex, the digest used for consensus ids and message commitments.
pub fn sha256_hex(data: &[u8]) -> String {
   return hex::encode(Sha256::digest(data));
}

/// Hash the canonical encoding of a value.
pub fn hash_canonical(value: &CanonicalValue) -> Result<String> {
   return Ok(sha256_hex(&canonical::encode(value)?));
}

/// The parts of an endpoint a backend needs to process its messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointMeta {
   pub endpoint_id: String,
   pub endpoint_type: String,
   pub endpoint_params: String,
}

impl From<&Endpoint> for EndpointMeta {
   fn from(endpoint: &Endpoint) -> Self {
      return EndpointMeta {
         endpoint_id: endpoint.endpoint_id.clone(),
         endpoint_type: endpoint.endpoint_type.clone(),
         endpoint_params: endpoint.endpoint_params.clone(),
      };
   }
}

/// Output of [`CryptoBackend::process`]: the transformed messages, each optionally addressed,
/// and an opaque proof the core stores without interpreting.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Processed {
   pub outputs: Vec<(Option<KeyId>, Vec<u8>)>,
   pub proof: Option<Vec<u8>>,
}

/// The signing capability every crypto backend provides.
///
/// The core only ever calls `sign`/`verify` and compares the returned [`KeyId`] against the
/// signer sets it expects; it never looks inside a signature.
pub trait CryptoBackend: Send + Sync {
   /// Registry identifier, stored on every peer that uses this backend.
   fn backend_id(&self) -> &str;

   /// Key id of the local signing key.
   /// # Errors
   /// `Unsupported` if this instance only verifies.
   fn key_id(&self) -> Result<KeyId>;

   /// Key data of the local signing key.
   fn key_data(&self) -> Result<KeyData>;

   /// Produce a canonically encoded signature over `body`.
   fn sign(&self, body: &[u8]) -> Result<Vec<u8>>;

   /// Returns the signer's key id, or `None` on any cryptographic failure.
   /// When `public` is given it is used instead of the key embedded in the signature.
   /// # Errors
   /// `MalformedEncoding` only if the signature itself cannot be decoded.
   fn verify(&self, body: &[u8], signature: &[u8], public: Option<&str>) -> Result<Option<KeyId>>;

   fn get_key_id_from_key_data(&self, key_data: &str) -> Result<KeyId>;

   /// Remember a public key so it can later be addressed by key id.
   fn register_key(&self, key_data: &str) -> Result<KeyId>;

   /// Key data for a peer owned jointly by `key_ids`.
   fn combine_keys(&self, key_ids: &[KeyId]) -> Result<KeyData>;

   fn encrypt(&self, data: &[u8], recipients: &[KeyId]) -> Result<Vec<u8>>;

   /// Run one processing step of an endpoint over its accepted messages. Mixing steps must
   /// return the outputs in a uniformly random order.
   fn process(&self, endpoint: &EndpointMeta, messages: &[Message], recipients: Option<&[KeyId]>) -> Result<Processed>;
}

/// Maps backend ids to constructed backends. Resolved once when a service starts.
#[derive(Clone, Default)]
pub struct BackendRegistry {
   backends: BTreeMap<String, Arc<dyn CryptoBackend>>,
}

impl BackendRegistry {
   pub fn new() -> Self { return BackendRegistry::default() }

   /// A registry holding a verify-only [`Ed25519Backend`].
   pub fn with_defaults() -> Self {
      let mut registry = BackendRegistry::new();
      registry.register(Arc::new(Ed25519Backend::verifier()));
      return registry;
   }

   /// Add a backend under its own id, replacing any previous one.
   pub fn register(&mut self, backend: Arc<dyn CryptoBackend>) {
      self.backends.insert(backend.backend_id().to_string(), backend);
   }

   pub fn contains(&self, backend_id: &str) -> bool {
      return self.backends.contains_key(backend_id);
   }

   /// # Errors
   /// `Unsupported` if nothing is registered under `backend_id`.
   pub fn resolve(&self, backend_id: &str) -> Result<Arc<dyn CryptoBackend>> {
      return self.backends
         .get(backend_id)
         .cloned()
         .ok_or_else(|| ERR!(Unsupported, "no crypto backend named '{backend_id}'"));
   }
}

/// Ed25519 signatures with x25519 + AES-256-GCM onion layers.
///
/// A signature is the canonical map `{public, sig}` where `public` is the hex verifying key.
/// Key ids are the SHA-256 of the verifying key. Onion layers reuse the Ed25519 key pair in
/// its Montgomery form, so one identity both signs and receives.
///
/// # Example
/// ```
/// use mixnet_consensus::crypto::{CryptoBackend, Ed25519Backend};
///
/// let alice = Ed25519Backend::generate();
/// let server = Ed25519Backend::verifier();
/// let signature = alice.sign(b"hello").unwrap();
/// assert_eq!(server.verify(b"hello", &signature, None).unwrap(), Some(alice.key_id().unwrap()));
/// assert_eq!(server.verify(b"hellO", &signature, None).unwrap(), None);
/// ```
pub struct Ed25519Backend {
   signing_key: Option<SigningKey>,
   keys: RwLock<HashMap<KeyId, VerifyingKey>>,
}

impl Ed25519Backend {
   pub fn new(signing_key: SigningKey) -> Self {
      let backend = Ed25519Backend::verifier();
      let verifying_key = signing_key.verifying_key();
      backend.keys.write().insert(Self::key_id_of(&verifying_key), verifying_key);
      return Ed25519Backend { signing_key: Some(signing_key), ..backend };
   }

   /// Fresh random identity.
   pub fn generate() -> Self {
      return Ed25519Backend::new(SigningKey::from(random::<[u8; 32]>()));
   }

   /// A backend without a signing key, as run by the coordinating service.
   pub fn verifier() -> Self {
      return Ed25519Backend { signing_key: None, keys: RwLock::new(HashMap::new()) };
   }

   pub fn key_id_of(verifying_key: &VerifyingKey) -> KeyId {
      return sha256_hex(verifying_key.as_bytes());
   }

   pub fn key_data_of(verifying_key: &VerifyingKey) -> KeyData {
      return hex::encode(verifying_key.as_bytes());
   }

   fn parse_key_data(key_data: &str) -> Result<VerifyingKey> {
      let bytes = hex::decode(key_data)
         .map_err(|err| ERR!(Invalid, "key data is not hex: {err}"))?;
      let bytes = <[u8; 32]>::try_from(bytes.as_slice())
         .map_err(|_| ERR!(Invalid, "key data must be 32 bytes"))?;
      return VerifyingKey::from_bytes(&bytes)
         .map_err(|err| ERR!(Invalid, "key data is not an ed25519 point: {err}"));
   }

   fn signing_key(&self) -> Result<&SigningKey> {
      return self.signing_key
         .as_ref()
         .ok_or_else(|| ERR!(Unsupported, "this backend holds no signing key"));
   }

   fn lookup(&self, key_id: &str) -> Result<VerifyingKey> {
      return self.keys
         .read()
         .get(key_id)
         .copied()
         .ok_or_else(|| ERR!(NotFound, "key {key_id} is not registered"));
   }

   fn layer_key(shared_secret: &[u8]) -> Result<Aes256Gcm> {
      let digest = Sha256::digest(shared_secret);
      return Aes256Gcm::new_from_slice(&digest)
         .map_err(|_| ERR!(Invalid, "could not derive layer key"));
   }

   /// Wrap `payload` in one layer only `recipient` can remove.
   fn seal_layer(payload: &[u8], recipient: &VerifyingKey) -> Result<Vec<u8>> {
      let secret = EphemeralSecret::random();
      let ephemeral = PublicKey::from(&secret);
      let their_key = PublicKey::from(recipient.to_montgomery().to_bytes());
      let cipher = Self::layer_key(secret.diffie_hellman(&their_key).as_bytes())?;

      let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
      let ciphertext = cipher.encrypt(&nonce, payload)
         .map_err(|_| ERR!(Invalid, "could not encrypt onion layer"))?;

      let layer = CanonicalValue::map([
         ("ciphertext", CanonicalValue::from(ciphertext)),
         ("ephemeral", ephemeral.as_bytes().as_slice().into()),
         ("nonce", nonce.as_slice().into()),
      ]);
      return canonical::encode(&layer);
   }

   /// Remove the outermost layer addressed to the local key.
   fn peel_layer(&self, layer: &[u8]) -> Result<Vec<u8>> {
      let secret = StaticSecret::from(self.signing_key()?.to_scalar_bytes());

      let layer = canonical::decode_all(layer)?;
      let field = |name: &str| {
         layer.get(name)
            .and_then(CanonicalValue::as_bytes)
            .ok_or_else(|| ERR!(Invalid, "onion layer has no '{name}'"))
      };
      let ephemeral = <[u8; 32]>::try_from(field("ephemeral")?)
         .map_err(|_| ERR!(Invalid, "ephemeral key must be 32 bytes"))?;
      let nonce = field("nonce")?;
      if nonce.len() != 12 {
         return Err(ERR!(Invalid, "onion nonce must be 12 bytes"));
      }

      let cipher = Self::layer_key(secret.diffie_hellman(&PublicKey::from(ephemeral)).as_bytes())?;
      return cipher.decrypt(aes_gcm::Nonce::from_slice(nonce), field("ciphertext")?)
         .map_err(|_| ERR!(Invalid, "could not peel onion layer"));
   }

   fn peel_onion(&self, messages: &[Message], recipients: Option<&[KeyId]>) -> Result<Processed> {
      let mut texts: Vec<&[u8]> = messages.iter().map(|message| message.text.as_slice()).collect();
      texts.shuffle(&mut OsRng);

      // The peeled layer is addressed to the next hop when the caller names one
      let next_hop = recipients.and_then(|recipients| recipients.first()).cloned();
      let mut outputs = Vec::<(Option<KeyId>, Vec<u8>)>::with_capacity(texts.len());
      for text in texts {
         outputs.push((next_hop.clone(), self.peel_layer(text)?));
      }
      return Ok(Processed { outputs, proof: None });
   }
}

impl CryptoBackend for Ed25519Backend {
   fn backend_id(&self) -> &str { return ED25519_BACKEND }

   fn key_id(&self) -> Result<KeyId> {
      return Ok(Self::key_id_of(&self.signing_key()?.verifying_key()));
   }

   fn key_data(&self) -> Result<KeyData> {
      return Ok(Self::key_data_of(&self.signing_key()?.verifying_key()));
   }

   fn sign(&self, body: &[u8]) -> Result<Vec<u8>> {
      let signing_key = self.signing_key()?;
      let signature = signing_key.sign(body);
      let signature = CanonicalValue::map([
         ("public", CanonicalValue::from(Self::key_data_of(&signing_key.verifying_key()))),
         ("sig", signature.to_bytes().as_slice().into()),
      ]);
      return canonical::encode(&signature);
   }

   fn verify(&self, body: &[u8], signature: &[u8], public: Option<&str>) -> Result<Option<KeyId>> {
      let decoded = canonical::decode_all(signature)?;
      let sig = decoded.get("sig")
         .and_then(CanonicalValue::as_bytes)
         .and_then(|bytes| <[u8; 64]>::try_from(bytes).ok())
         .ok_or_else(|| Err::new(ErrType::MalformedEncoding { offset: 0 }, "signature has no 64-byte 'sig'"))?;
      let key_data = match public {
         Some(public) => public,
         None => decoded.get("public")
            .and_then(CanonicalValue::as_str)
            .ok_or_else(|| Err::new(ErrType::MalformedEncoding { offset: 0 }, "signature has no 'public'"))?,
      };

      let verifying_key = match Self::parse_key_data(key_data) {
         Ok(verifying_key) => verifying_key,
         Err(err) => {
            debug!(error = %err, "rejecting signature with unusable key");
            return Ok(None);
         }
      };
      if verifying_key.verify(body, &Signature::from_bytes(&sig)).is_err() {
         return Ok(None);
      }
      return Ok(Some(Self::key_id_of(&verifying_key)));
   }

   fn get_key_id_from_key_data(&self, key_data: &str) -> Result<KeyId> {
      return Ok(Self::key_id_of(&Self::parse_key_data(key_data)?));
   }

   fn register_key(&self, key_data: &str) -> Result<KeyId> {
      let verifying_key = Self::parse_key_data(key_data)?;
      let key_id = Self::key_id_of(&verifying_key);
      self.keys.write().insert(key_id.clone(), verifying_key);
      return Ok(key_id);
   }

   /// Sums the owners' Edwards points. The result identifies the group; nobody can sign with it.
   fn combine_keys(&self, key_ids: &[KeyId]) -> Result<KeyData> {
      if key_ids.is_empty() {
         return Err(ERR!(Invalid, "cannot combine an empty key set"));
      }
      let mut combined = EdwardsPoint::identity();
      for key_id in key_ids {
         let point = CompressedEdwardsY(self.lookup(key_id)?.to_bytes())
            .decompress()
            .ok_or_else(|| ERR!(Invalid, "key {key_id} does not decompress"))?;
         combined += point;
      }
      return Ok(hex::encode(combined.compress().to_bytes()));
   }

   fn encrypt(&self, data: &[u8], recipients: &[KeyId]) -> Result<Vec<u8>> {
      if recipients.is_empty() {
         return Err(ERR!(Invalid, "at least one recipient is required"));
      }
      // The first recipient peels the outermost layer
      let mut payload = data.to_vec();
      for recipient in recipients.iter().rev() {
         payload = Self::seal_layer(&payload, &self.lookup(recipient)?)?;
      }
      return Ok(payload);
   }

   fn process(&self, endpoint: &EndpointMeta, messages: &[Message], recipients: Option<&[KeyId]>) -> Result<Processed> {
      return match endpoint.endpoint_type.as_str() {
         ENDPOINT_GATEWAY => Ok(Processed {
            outputs: messages
               .iter()
               .map(|message| (Some(message.recipient.clone()), message.text.clone()))
               .collect(),
            proof: None,
         }),
         ENDPOINT_ONION => self.peel_onion(messages, recipients),
         other => Err(ERR!(Unsupported, "endpoint type '{other}' is not supported by {}", ED25519_BACKEND)),
      };
   }
}

#[cfg(test)]
mod tests {
   use super::*;
   use crate::resource::MessageBox;

   fn message(text: Vec<u8>, recipient: &str) -> Message {
      return Message {
         endpoint_id: String::from("e1"),
         serial: None,
         sender: String::from("sender"),
         recipient: recipient.to_string(),
         text,
         message_box: MessageBox::Accepted,
         message_hash: String::new(),
      };
   }

   fn meta(endpoint_type: &str) -> EndpointMeta {
      return EndpointMeta {
         endpoint_id: String::from("e1"),
         endpoint_type: endpoint_type.to_string(),
         endpoint_params: String::new(),
      };
   }

   #[test]
   fn test_sign_and_verify() {
      let alice = Ed25519Backend::generate();
      let bob = Ed25519Backend::generate();
      let server = Ed25519Backend::verifier();
      let signature = alice.sign(b"body").unwrap();

      assert_eq!(server.verify(b"body", &signature, None).unwrap(), Some(alice.key_id().unwrap()));
      assert_eq!(server.verify(b"other", &signature, None).unwrap(), None);
      // An explicit key overrides the embedded one
      let bob_key = bob.key_data().unwrap();
      assert_eq!(server.verify(b"body", &signature, Some(&bob_key)).unwrap(), None);
      let alice_key = alice.key_data().unwrap();
      assert_eq!(server.verify(b"body", &signature, Some(&alice_key)).unwrap(), Some(alice.key_id().unwrap()));
   }

   #[test]
   fn test_malformed_signature_is_an_error() {
      let server = Ed25519Backend::verifier();
      assert!(server.verify(b"body", b"not canonical", None).is_err());
      let missing_sig = canonical::encode(&CanonicalValue::map([("public", "00")])).unwrap();
      assert!(server.verify(b"body", &missing_sig, None).is_err());
   }

   #[test]
   fn test_key_id_from_key_data() {
      let alice = Ed25519Backend::generate();
      let server = Ed25519Backend::verifier();
      assert_eq!(server.get_key_id_from_key_data(&alice.key_data().unwrap()).unwrap(), alice.key_id().unwrap());
      assert!(server.get_key_id_from_key_data("zz").is_err());
      assert!(server.key_id().is_err());
      assert!(server.sign(b"body").is_err());
   }

   #[test]
   fn test_combine_keys_is_order_independent() {
      let server = Ed25519Backend::verifier();
      let owners: Vec<Ed25519Backend> = (0..3).map(|_| Ed25519Backend::generate()).collect();
      let mut key_ids = Vec::<KeyId>::new();
      for owner in &owners {
         key_ids.push(server.register_key(&owner.key_data().unwrap()).unwrap());
      }
      let combined = server.combine_keys(&key_ids).unwrap();
      key_ids.reverse();
      assert_eq!(server.combine_keys(&key_ids).unwrap(), combined);
      assert!(server.get_key_id_from_key_data(&combined).is_ok());

      assert_eq!(server.combine_keys(&[String::from("unknown")]).unwrap_err().err_type, ErrType::NotFound);
      assert!(server.combine_keys(&[]).is_err());
   }

   #[test]
   fn test_onion_layers_peel_in_route_order() {
      let sender = Ed25519Backend::generate();
      let first = Ed25519Backend::generate();
      let second = Ed25519Backend::generate();
      let route = vec![
         sender.register_key(&first.key_data().unwrap()).unwrap(),
         sender.register_key(&second.key_data().unwrap()).unwrap(),
      ];
      let onion = sender.encrypt(b"secret", &route).unwrap();

      // The second hop cannot remove the outer layer
      assert!(second.process(&meta(ENDPOINT_ONION), &[message(onion.clone(), "x")], None).is_err());

      let hop = first.process(&meta(ENDPOINT_ONION), &[message(onion, "x")], Some(&route[1..])).unwrap();
      assert_eq!(hop.outputs.len(), 1);
      assert_eq!(hop.outputs[0].0.as_ref(), Some(&route[1]));
      let last = second.process(&meta(ENDPOINT_ONION), &[message(hop.outputs[0].1.clone(), "x")], None).unwrap();
      assert_eq!(last.outputs, vec![(None, b"secret".to_vec())]);
   }

   #[test]
   fn test_onion_process_preserves_the_multiset() {
      let sender = Ed25519Backend::generate();
      let mixer = Ed25519Backend::generate();
      let route = vec![sender.register_key(&mixer.key_data().unwrap()).unwrap()];
      let messages: Vec<Message> = (0..8u8)
         .map(|i| message(sender.encrypt(&[i], &route).unwrap(), "x"))
         .collect();

      let processed = mixer.process(&meta(ENDPOINT_ONION), &messages, None).unwrap();
      let mut texts: Vec<Vec<u8>> = processed.outputs.into_iter().map(|(_, text)| text).collect();
      texts.sort();
      assert_eq!(texts, (0..8u8).map(|i| vec![i]).collect::<Vec<Vec<u8>>>());
   }

   #[test]
   fn test_gateway_and_unsupported_types() {
      let backend = Ed25519Backend::generate();
      let processed = backend.process(&meta(ENDPOINT_GATEWAY), &[message(b"hi".to_vec(), "bob")], None).unwrap();
      assert_eq!(processed.outputs, vec![(Some(String::from("bob")), b"hi".to_vec())]);
      assert_eq!(processed.proof, None);

      let err = backend.process(&meta("ZEUS_SK_MIX"), &[], None).unwrap_err();
      assert_eq!(err.err_type, ErrType::Unsupported);
   }

   #[test]
   fn test_registry_resolves_by_id() {
      let registry = BackendRegistry::with_defaults();
      assert!(registry.contains(ED25519_BACKEND));
      assert_eq!(registry.resolve(ED25519_BACKEND).unwrap().backend_id(), ED25519_BACKEND);
      assert_eq!(registry.resolve("gpg").err().map(|err| err.err_type), Some(ErrType::Unsupported));
   }
}
