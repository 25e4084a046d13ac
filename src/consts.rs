//! Protocol constants shared by the codec, the engine and the backends.

/// Identifier of the bundled [`crate::crypto::Ed25519Backend`].
pub const ED25519_BACKEND: &str = "ed25519";

/// Default length, in random bytes, of server-generated negotiation ids.
pub const NEGOTIATION_ID_BYTES: usize = 32;

// Canonical tokens
pub const NULL_TOKEN: &[u8; 4] = b"null";
pub const LIST_OPEN: &[u8; 2] = b"[\n";
pub const LIST_CLOSE: &[u8; 2] = b"]\n";
pub const MAP_OPEN: &[u8; 2] = b"{\n";
pub const MAP_CLOSE: &[u8; 2] = b"}\n";
pub const SEPARATOR: &[u8; 2] = b",\n";
pub const KEY_SEPARATOR: &[u8; 2] = b": ";
pub const BYTES_TAG: u8 = b'_';
pub const INTEGER_TAG: u8 = b'0';
/// Deepest list/map nesting the decoder accepts.
pub const MAX_DEPTH: usize = 128;

// Envelope operations and resources
pub const OP_CREATE: &str = "create";
pub const OP_PARTIAL_UPDATE: &str = "partial_update";
pub const RESOURCE_PEER: &str = "peer";
pub const RESOURCE_ENDPOINT: &str = "endpoint";
pub const RESOURCE_MESSAGE: &str = "message";

// Endpoint types served by the bundled backend
pub const ENDPOINT_GATEWAY: &str = "GATEWAY";
pub const ENDPOINT_ONION: &str = "ONION";

/// Default client polling interval in milliseconds.
pub const POLL_TICK_MS: u64 = 500;
/// Default client polling deadline in milliseconds.
pub const POLL_TIMEOUT_MS: u64 = 30_000;
