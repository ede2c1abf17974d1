//! Credential store
//!
//! Maps identity hashes to per-user cipher material. Hot paths look
//! users up on every handshake/packet, so the store supports two update
//! shapes: incremental mutation under the writer lock (management API)
//! and wholesale replacement of a freshly built map (file reload).
//! Readers never observe a partially mutated map.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

/// Length of an identity hash in bytes
pub const IDENTITY_HASH_LENGTH: usize = 32;

/// Fixed-size digest of a user's pre-shared key, used as the lookup key
pub type IdentityHash = [u8; IDENTITY_HASH_LENGTH];

/// Key derivation context for identity hashes (2022-blake3 family)
const IDENTITY_CONTEXT: &str = "shadowsocks 2022 identity subkey";

/// Key derivation context for per-stream cipher material
const STREAM_CONTEXT: &str = "shadowsocks 2022 session subkey";

/// Key derivation context for per-packet cipher material
const PACKET_CONTEXT: &str = "shadowsocks 2022 packet subkey";

/// Derive the identity hash of a user pre-shared key.
#[must_use]
pub fn identity_hash(upsk: &[u8]) -> IdentityHash {
    blake3::derive_key(IDENTITY_CONTEXT, upsk)
}

/// Per-user cipher material, derived once per credential change.
///
/// Both relays share the user set, but packet-direction material is
/// only derived when the server has UDP enabled.
#[derive(Debug, Clone)]
pub struct UserCipherConfig {
    name: Arc<str>,
    upsk: Box<[u8]>,
    stream_key: [u8; 32],
    packet_key: Option<[u8; 32]>,
}

impl UserCipherConfig {
    /// Derive cipher material for a user.
    ///
    /// `derive_packet_keys` is set when the server also runs a UDP
    /// relay; TCP-only servers skip the packet-direction derivation.
    #[must_use]
    pub fn new(name: &str, upsk: &[u8], derive_packet_keys: bool) -> Self {
        Self {
            name: Arc::from(name),
            upsk: upsk.into(),
            stream_key: blake3::derive_key(STREAM_CONTEXT, upsk),
            packet_key: derive_packet_keys.then(|| blake3::derive_key(PACKET_CONTEXT, upsk)),
        }
    }

    /// Username this material belongs to.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The user's pre-shared key.
    #[must_use]
    pub fn upsk(&self) -> &[u8] {
        &self.upsk
    }

    /// Stream-direction key material.
    #[must_use]
    pub const fn stream_key(&self) -> &[u8; 32] {
        &self.stream_key
    }

    /// Packet-direction key material, absent on TCP-only servers.
    #[must_use]
    pub const fn packet_key(&self) -> Option<&[u8; 32]> {
        self.packet_key.as_ref()
    }
}

/// Identity hash → cipher material mapping visible to hot paths
pub type UserLookupMap = HashMap<IdentityHash, Arc<UserCipherConfig>>;

/// A live credential store shared between a relay and its manager.
///
/// One store per relay direction: the TCP and UDP stores of a server
/// hold identical user sets but independently derived cipher state.
#[derive(Debug, Default)]
pub struct CredStore {
    users: RwLock<UserLookupMap>,
}

impl CredStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole mapping atomically.
    ///
    /// Used by full file reloads: the new map is built off to the side
    /// and swapped in under the writer lock, so concurrent lookups see
    /// either the old or the new map, never a mixture.
    pub fn replace(&self, users: UserLookupMap) {
        *self.users.write() = users;
    }

    /// Mutate the mapping in place under the writer lock.
    ///
    /// Used by incremental add/update/delete; lookups are excluded for
    /// the duration of `f`.
    pub fn update(&self, f: impl FnOnce(&mut UserLookupMap)) {
        f(&mut self.users.write());
    }

    /// Look up a user by identity hash.
    #[must_use]
    pub fn lookup(&self, hash: &IdentityHash) -> Option<Arc<UserCipherConfig>> {
        self.users.read().get(hash).cloned()
    }

    /// Number of users currently visible.
    #[must_use]
    pub fn len(&self) -> usize {
        self.users.read().len()
    }

    /// Whether the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.users.read().is_empty()
    }
}
