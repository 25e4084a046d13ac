#![crate_name="mixnet_consensus"]
//! ## mixnet_consensus
//!
//! **Signed multi-party negotiation, and mix-network endpoints that only move when a consensus says so.**
//!
//! Mutually distrusting peers agree on a document by each signing its canonical encoding and
//! submitting it to a shared negotiation. Once every live contribution is byte-identical and
//! marked `accept`, the negotiation freezes into a consensus record: the agreed text, a
//! timestamp and the signatures that produced it, addressed by a hash. That record is then the
//! only thing that can create a peer, create an endpoint, or move an endpoint's messages
//! through its INBOX → ACCEPTED → PROCESSBOX → OUTBOX pipeline.
//!
//! # Usage
//!
//! A [`Service`] owns a [`NegotiationEngine`] and a [`ResourceManager`] that share one crypto
//! backend, picked by id from a [`BackendRegistry`]. The [`client`] module has helpers for
//! the other side of the table. For each privileged change a client:
//!
//! 1. Builds the request `{info, data}` and wraps it in a [`client::Document`].
//! 2. Signs the document and submits it to a negotiation, together with every other party whose signature is needed.
//! 3. Polls with [`client::wait_for_consensus`] until the negotiation is DONE.
//! 4. Replays the exact same request in a signed [`envelope::Envelope`] that references the consensus id.
//!
//! # Example
//! ```
//! use mixnet_consensus::{BackendRegistry, Config, CryptoBackend, Ed25519Backend, Service};
//! use mixnet_consensus::client::{process_inbox, sign_contribution, sign_envelope, wait_for_consensus, Document};
//! use mixnet_consensus::envelope::{document_body, ByConsensus, Canonical, Info};
//! use mixnet_consensus::resource::*;
//! use mixnet_consensus::consts::*;
//!
//! // Agree on a request alone and return the consensus id
//! fn agree<D: Canonical>(service: &Service, signer: &Ed25519Backend, info: &Info, data: &D) -> String {
//!    let negotiation = service.engine().create_negotiation(None).unwrap();
//!    sign_contribution(signer, &Document::new(document_body(info, data)))
//!       .unwrap()
//!       .submit(service.engine(), &negotiation.id)
//!       .unwrap();
//!    let done = wait_for_consensus(service.engine(), &negotiation.id, 10, 1_000).unwrap();
//!    return done.consensus_id.unwrap();
//! }
//!
//! let service = Service::new(Config::default(), BackendRegistry::with_defaults()).unwrap();
//! let alice = Ed25519Backend::generate();
//! let bob = Ed25519Backend::generate();
//!
//! // Alice registers herself as a peer
//! let info = Info::new(OP_CREATE, RESOURCE_PEER);
//! let peer = PeerData {
//!    peer_id: alice.key_id().unwrap(),
//!    name: String::from("alice"),
//!    backend_id: String::from(ED25519_BACKEND),
//!    backend_params: String::new(),
//!    key_data: alice.key_data().unwrap(),
//!    owners: Vec::new(),
//!    status: PeerStatus::Ready,
//! };
//! let consensus_id = agree(&service, &alice, &info, &peer);
//! let envelope = sign_envelope(&alice, info, peer, Some(ByConsensus::new(&consensus_id))).unwrap();
//! service.resources().create_peer(&envelope).unwrap();
//!
//! // ...and opens a gateway taking one or two messages
//! let info = Info::new(OP_CREATE, RESOURCE_ENDPOINT);
//! let gateway = EndpointData {
//!    endpoint_id: String::from("gateway"),
//!    peer_id: alice.key_id().unwrap(),
//!    size_min: 1,
//!    size_max: 2,
//!    endpoint_type: String::from(ENDPOINT_GATEWAY),
//!    endpoint_params: String::new(),
//!    status: EndpointStatus::Open,
//!    links: Vec::new(),
//! };
//! let consensus_id = agree(&service, &alice, &info, &gateway);
//! let envelope = sign_envelope(&alice, info, gateway, Some(ByConsensus::new(&consensus_id))).unwrap();
//! let endpoint = service.resources().create_endpoint(&envelope).unwrap();
//!
//! // Bob drops a message in the inbox
//! let letter = MessageData {
//!    endpoint_id: String::from("gateway"),
//!    serial: None,
//!    sender: bob.key_id().unwrap(),
//!    recipient: String::from("carol"),
//!    text: b"hello carol".to_vec(),
//!    message_box: MessageBox::Inbox,
//!    message_hash: None,
//! };
//! let envelope = sign_envelope(&bob, Info::new(OP_CREATE, RESOURCE_MESSAGE), letter, None).unwrap();
//! let letter = service.resources().submit_message(&envelope).unwrap();
//!
//! // Alice closes the inbox on exactly that message
//! let info = Info::new(OP_PARTIAL_UPDATE, RESOURCE_ENDPOINT)
//!    .with_id("gateway")
//!    .on_last(endpoint.last_consensus_id().unwrap());
//! let close = EndpointTransition {
//!    status: EndpointStatus::Closed,
//!    message_hashes: vec![letter.message_hash.clone()],
//!    process_proof: None,
//! };
//! let consensus_id = agree(&service, &alice, &info, &close);
//! let envelope = sign_envelope(&alice, info, close, Some(ByConsensus::new(&consensus_id))).unwrap();
//! let endpoint = service.resources().update_endpoint(&envelope).unwrap();
//!
//! // Processes the accepted messages and publishes the result
//! let accepted = service.resources().messages("gateway", Some(MessageBox::Accepted)).unwrap();
//! let batch = process_inbox(&alice, &endpoint, &accepted, None).unwrap();
//! for output in batch.submissions {
//!    let envelope = sign_envelope(&alice, Info::new(OP_CREATE, RESOURCE_MESSAGE), output, None).unwrap();
//!    service.resources().submit_message(&envelope).unwrap();
//! }
//! let info = Info::new(OP_PARTIAL_UPDATE, RESOURCE_ENDPOINT)
//!    .with_id("gateway")
//!    .on_last(endpoint.last_consensus_id().unwrap());
//! let process = EndpointTransition {
//!    status: EndpointStatus::Processed,
//!    message_hashes: batch.message_hashes,
//!    process_proof: batch.proof,
//! };
//! let consensus_id = agree(&service, &alice, &info, &process);
//! let envelope = sign_envelope(&alice, info, process, Some(ByConsensus::new(&consensus_id))).unwrap();
//! assert_eq!(service.resources().update_endpoint(&envelope).unwrap().status, EndpointStatus::Processed);
//!
//! let outbox = service.resources().messages("gateway", Some(MessageBox::Outbox)).unwrap();
//! assert_eq!(outbox[0].recipient, "carol");
//! assert_eq!(outbox[0].text, b"hello carol");
//! ```
//!
//! # How it Works
//!
//! Everything that is hashed or signed is first put through the [`canonical`] codec, a
//! self-describing byte format with exactly one encoding per value: map keys are sorted,
//! duplicates are refused, and hex lengths carry no leading zeros. "Everyone signed the same
//! bytes" is then a plain byte comparison.
//!
//! A negotiation keeps one `latest` contribution per signer. After every contribution the
//! engine checks whether all latest texts are identical and accepting; if they are, it freezes
//! them and derives `consensus_id = sha256(canonical({timestamp, negotiation_id, text, signings}))`.
//! A single signer who accepts its own text closes a negotiation on the spot, which is how a
//! peer registers itself. Nothing else closes a negotiation and nothing reopens one.
//!
//! The resource side never trusts the request alone. It re-encodes `{info, data}`, compares it
//! to the frozen body, checks `meta.accept` and checks the peer's owners (or the peer and the
//! caller) all signed. Endpoint transitions also name the endpoint's last consensus id; the
//! first transition to land advances it and any request built from the same stale state is
//! refused.
//!
//! # Errors
//!
//! Every fallible call returns [`Err`], whose [`ErrType`] says what went wrong.
//! All classes are recoverable by the caller except `Storage`, which marks an infrastructure fault. See [`error`].
//!
//! # Glossary
//!
//! - **Canonical Encoding**: the deterministic byte form used as the pre-image of every hash and signature. See [`canonical`].
//! - **Negotiation**: a shared slot collecting signed contributions until they converge. See [`Negotiation`].
//! - **Contribution**: one signer's signed `{body, meta}`.
//! - **Consensus record**: the frozen text, timestamp and signatures of a converged negotiation. See [`ConsensusRecord`].
//! - **by_consensus**: a reference to a consensus record presented with a privileged request.
//! - **Peer**: an identity with a key, owned by itself or by several signers. See [`Peer`].
//! - **Endpoint**: a mix-network stage with a bounded batch of messages. See [`Endpoint`].
//! - **Box**: a message's position in the endpoint pipeline. See [`MessageBox`].
//! - **on_last_consensus_id**: the optimistic-concurrency token tying a transition to the endpoint's latest consensus.
//!
//! # Copying
//!
//! This work is dual-licensed under Apache 2.0 and MIT terms.


pub mod canonical;
pub mod client;
pub mod config;
pub mod consts;
pub mod crypto;
pub mod envelope;
pub mod error;
pub mod negotiation;
pub mod resource;
pub mod service;
pub mod store;
pub mod telemetry;

pub use crate::canonical::{CanonicalValue, Natural};
pub use crate::config::Config;
pub use crate::crypto::{BackendRegistry, CryptoBackend, Ed25519Backend, KeyData, KeyId};
pub use crate::error::{Err, ErrType, Result};
pub use crate::negotiation::{ConsensusRecord, Contribution, Negotiation, NegotiationEngine, NegotiationStatus};
pub use crate::resource::{Endpoint, EndpointStatus, Message, MessageBox, Peer, PeerStatus, ResourceManager};
pub use crate::service::Service;
