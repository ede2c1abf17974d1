//! Credential management
//!
//! A [`ManagedServer`] owns the disk-backed credential set of one
//! logical server: a username → uPSK JSON file, in-memory caches, and
//! references to the live TCP/UDP [`CredStore`]s the relays consult on
//! their hot paths. Mutations apply to the caches and the live stores
//! immediately and enqueue a debounced save; file reloads rebuild the
//! caches off to the side and swap both stores wholesale.
//!
//! The [`Manager`] is the registry of managed servers and the service
//! handle the embedding process starts, stops, and pokes on its reload
//! signal.

mod store;

pub use store::{
    identity_hash, CredStore, IdentityHash, UserCipherConfig, UserLookupMap,
    IDENTITY_HASH_LENGTH,
};

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{CredentialError, RelayError};
use crate::relay::Service;

/// Default cooldown between a mutation and the save it triggers.
pub const DEFAULT_SAVE_COOLDOWN: Duration = Duration::from_secs(5);

/// A user credential as the management API sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserCredential {
    /// Username
    pub name: String,
    /// User pre-shared key
    pub upsk: Vec<u8>,
}

/// Cached per-user state mirroring the on-disk file.
#[derive(Debug, Clone)]
struct CachedCredential {
    upsk: Vec<u8>,
    hash: IdentityHash,
}

/// Everything guarded by the server's cache lock.
///
/// `creds` and `users` are kept consistent at all times: every
/// credential's hash is present in both maps, and nothing else is.
#[derive(Default)]
struct ServerCaches {
    /// Byte-equal watermark of the on-disk content, for reload skipping
    content: String,
    /// username → cached credential
    creds: HashMap<String, CachedCredential>,
    /// identity hash → cipher material
    users: UserLookupMap,
}

/// A server whose credentials are managed from a JSON file on disk.
pub struct ManagedServer {
    name: String,
    psk_length: usize,
    path: PathBuf,
    caches: RwLock<ServerCaches>,
    tcp: Option<Arc<CredStore>>,
    udp: Option<Arc<CredStore>>,
    save_cooldown: Duration,
    save_queue_tx: mpsc::Sender<()>,
    save_queue_rx: Mutex<Option<mpsc::Receiver<()>>>,
    shutdown_tx: broadcast::Sender<()>,
    debouncer: Mutex<Option<JoinHandle<()>>>,
}

impl ManagedServer {
    fn new(
        name: String,
        psk_length: usize,
        path: PathBuf,
        tcp: Option<Arc<CredStore>>,
        udp: Option<Arc<CredStore>>,
        save_cooldown: Duration,
    ) -> Self {
        // Capacity 1 collapses mutation bursts into one pending save.
        let (save_queue_tx, save_queue_rx) = mpsc::channel(1);
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            name,
            psk_length,
            path,
            caches: RwLock::new(ServerCaches::default()),
            tcp,
            udp,
            save_cooldown,
            save_queue_tx,
            save_queue_rx: Mutex::new(Some(save_queue_rx)),
            shutdown_tx,
            debouncer: Mutex::new(None),
        }
    }

    /// Server name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Expected uPSK length for this server's cipher.
    #[must_use]
    pub const fn psk_length(&self) -> usize {
        self.psk_length
    }

    fn derives_packet_keys(&self) -> bool {
        self.udp.is_some()
    }

    /// List all credentials.
    #[must_use]
    pub fn credentials(&self) -> Vec<UserCredential> {
        let caches = self.caches.read();
        caches
            .creds
            .iter()
            .map(|(name, cached)| UserCredential {
                name: name.clone(),
                upsk: cached.upsk.clone(),
            })
            .collect()
    }

    /// Get one user's credential.
    #[must_use]
    pub fn get_credential(&self, username: &str) -> Option<UserCredential> {
        let caches = self.caches.read();
        caches.creds.get(username).map(|cached| UserCredential {
            name: username.to_string(),
            upsk: cached.upsk.clone(),
        })
    }

    fn check_psk_length(&self, username: &str, upsk: &[u8]) -> Result<(), CredentialError> {
        if upsk.len() == self.psk_length {
            Ok(())
        } else {
            Err(CredentialError::PskLength {
                username: username.to_string(),
                actual: upsk.len(),
                expected: self.psk_length,
            })
        }
    }

    /// Add a user credential.
    ///
    /// On success the new user is visible to the next lookup on both
    /// relay stores, and a debounced save is enqueued.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialError`] naming the violated rule; state is
    /// untouched on error.
    pub fn add_credential(&self, username: &str, upsk: &[u8]) -> Result<(), CredentialError> {
        if username.is_empty() {
            return Err(CredentialError::EmptyUsername);
        }
        self.check_psk_length(username, upsk)?;

        let config;
        let hash;
        {
            let mut caches = self.caches.write();
            if caches.creds.contains_key(username) {
                return Err(CredentialError::UserExists(username.to_string()));
            }
            hash = identity_hash(upsk);
            config = Arc::new(UserCipherConfig::new(
                username,
                upsk,
                self.derives_packet_keys(),
            ));
            caches.creds.insert(
                username.to_string(),
                CachedCredential {
                    upsk: upsk.to_vec(),
                    hash,
                },
            );
            caches.users.insert(hash, config.clone());
        }

        self.enqueue_save();
        self.update_stores(move |users| {
            users.insert(hash, config.clone());
        });
        Ok(())
    }

    /// Update a user credential.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialError`] naming the violated rule; state is
    /// untouched on error.
    pub fn update_credential(&self, username: &str, upsk: &[u8]) -> Result<(), CredentialError> {
        self.check_psk_length(username, upsk)?;

        let config;
        let old_hash;
        let new_hash;
        {
            let mut caches = self.caches.write();
            let Some(cached) = caches.creds.get(username) else {
                return Err(CredentialError::NonexistentUser(username.to_string()));
            };
            if cached.upsk == upsk {
                return Err(CredentialError::UnchangedPsk(username.to_string()));
            }
            old_hash = cached.hash;
            new_hash = identity_hash(upsk);
            config = Arc::new(UserCipherConfig::new(
                username,
                upsk,
                self.derives_packet_keys(),
            ));
            let cached = caches.creds.get_mut(username).expect("checked above");
            cached.upsk = upsk.to_vec();
            cached.hash = new_hash;
            caches.users.remove(&old_hash);
            caches.users.insert(new_hash, config.clone());
        }

        self.enqueue_save();
        self.update_stores(move |users| {
            users.remove(&old_hash);
            users.insert(new_hash, config.clone());
        });
        Ok(())
    }

    /// Delete a user credential.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialError::NonexistentUser`] if the user is
    /// unknown; state is untouched on error.
    pub fn delete_credential(&self, username: &str) -> Result<(), CredentialError> {
        let hash;
        {
            let mut caches = self.caches.write();
            let Some(cached) = caches.creds.remove(username) else {
                return Err(CredentialError::NonexistentUser(username.to_string()));
            };
            hash = cached.hash;
            caches.users.remove(&hash);
        }

        self.enqueue_save();
        self.update_stores(move |users| {
            users.remove(&hash);
        });
        Ok(())
    }

    fn update_stores(&self, f: impl Fn(&mut UserLookupMap)) {
        if let Some(tcp) = &self.tcp {
            tcp.update(&f);
        }
        if let Some(udp) = &self.udp {
            udp.update(&f);
        }
    }

    fn replace_stores(&self) {
        let caches = self.caches.read();
        if let Some(tcp) = &self.tcp {
            tcp.replace(caches.users.clone());
        }
        if let Some(udp) = &self.udp {
            udp.replace(caches.users.clone());
        }
    }

    fn enqueue_save(&self) {
        // Full queue means a save is already pending; it will pick up
        // this mutation too.
        let _ = self.save_queue_tx.try_send(());
    }

    /// Rebuild the caches from the file. Does not touch the live stores.
    fn reload_caches(&self) -> Result<(), CredentialError> {
        let content = std::fs::read_to_string(&self.path)?;

        let mut caches = self.caches.write();
        if content == caches.content {
            return Ok(());
        }

        let decoded: HashMap<String, String> = serde_json::from_str(&content)
            .map_err(|e| CredentialError::Decode(e.to_string()))?;

        let mut creds = HashMap::with_capacity(decoded.len());
        let mut users = UserLookupMap::with_capacity(decoded.len());
        for (username, upsk_b64) in &decoded {
            if username.is_empty() {
                return Err(CredentialError::EmptyUsername);
            }
            let upsk = BASE64
                .decode(upsk_b64)
                .map_err(|e| CredentialError::Decode(format!("uPSK of user {username}: {e}")))?;
            self.check_psk_length(username, &upsk)?;

            let hash = identity_hash(&upsk);
            if let Some(existing) = users.get(&hash) {
                return Err(CredentialError::DuplicateUpsk {
                    first: existing.name().to_string(),
                    second: username.clone(),
                });
            }
            users.insert(
                hash,
                Arc::new(UserCipherConfig::new(
                    username,
                    &upsk,
                    self.derives_packet_keys(),
                )),
            );
            creds.insert(username.clone(), CachedCredential { upsk, hash });
        }

        caches.content = content;
        caches.creds = creds;
        caches.users = users;
        Ok(())
    }

    /// Load credentials from the configured file and apply them to the
    /// live stores.
    ///
    /// A byte-identical file short-circuits the rebuild. On error all
    /// prior state, cached and live, is left untouched.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialError`] for file, decode, or validation
    /// failures.
    pub fn load_from_file(&self) -> Result<(), CredentialError> {
        self.reload_caches()?;
        self.replace_stores();
        Ok(())
    }

    async fn save_to_file(&self) -> Result<(), CredentialError> {
        // Serialize under the read lock; only the watermark write below
        // needs the writer lock.
        let json = {
            let caches = self.caches.read();
            let upsk_map: BTreeMap<&str, String> = caches
                .creds
                .iter()
                .map(|(name, cached)| (name.as_str(), BASE64.encode(&cached.upsk)))
                .collect();

            let mut buf = Vec::new();
            let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
            let mut serializer = serde_json::Serializer::with_formatter(&mut buf, formatter);
            upsk_map
                .serialize(&mut serializer)
                .map_err(|e| CredentialError::Decode(e.to_string()))?;
            String::from_utf8(buf).expect("serde_json produces UTF-8")
        };

        tokio::fs::write(&self.path, &json).await?;
        self.caches.write().content = json;
        Ok(())
    }

    /// Start the save debouncer and publish the cached user set to the
    /// live stores.
    pub fn start(self: &Arc<Self>) {
        self.replace_stores();

        let Some(mut queue) = self.save_queue_rx.lock().take() else {
            return;
        };
        let server = Arc::clone(self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        let handle = tokio::spawn(async move {
            loop {
                // Wait for an incoming save job. Biased toward the
                // queue: a pending save is flushed before shutdown is
                // honored.
                let mut shutdown_seen = false;
                tokio::select! {
                    biased;
                    job = queue.recv() => {
                        if job.is_none() {
                            return;
                        }
                    }
                    _ = shutdown_rx.recv() => return,
                }

                // Cooldown collapses bursts; shutdown skips straight to
                // the final save.
                tokio::select! {
                    () = tokio::time::sleep(server.save_cooldown) => {}
                    _ = shutdown_rx.recv() => {
                        shutdown_seen = true;
                    }
                }

                // Clear anything enqueued during the cooldown.
                while queue.try_recv().is_ok() {}

                if let Err(e) = server.save_to_file().await {
                    warn!(server = %server.name, error = %e, "failed to save credentials");
                }

                if shutdown_seen {
                    return;
                }
            }
        });
        *self.debouncer.lock() = Some(handle);
    }

    /// Stop the save debouncer, flushing a pending save first.
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(());
        let handle = self.debouncer.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

impl fmt::Debug for ManagedServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedServer")
            .field("name", &self.name)
            .field("psk_length", &self.psk_length)
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

/// Registry of managed servers.
pub struct Manager {
    servers: RwLock<HashMap<String, Arc<ManagedServer>>>,
    save_cooldown: Duration,
}

impl Manager {
    /// Create an empty manager with the default save cooldown.
    #[must_use]
    pub fn new() -> Self {
        Self::with_save_cooldown(DEFAULT_SAVE_COOLDOWN)
    }

    /// Create an empty manager with a custom save cooldown.
    #[must_use]
    pub fn with_save_cooldown(save_cooldown: Duration) -> Self {
        Self {
            servers: RwLock::new(HashMap::new()),
            save_cooldown,
        }
    }

    /// Register a server and load its credential file.
    ///
    /// The TCP/UDP stores are the live stores its relays read; passing
    /// `None` for `udp` skips packet-direction key derivation.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialError`] if the name is taken or the initial
    /// file load fails.
    pub fn register_server(
        &self,
        name: &str,
        psk_length: usize,
        path: impl AsRef<Path>,
        tcp: Option<Arc<CredStore>>,
        udp: Option<Arc<CredStore>>,
    ) -> Result<Arc<ManagedServer>, CredentialError> {
        let mut servers = self.servers.write();
        if servers.contains_key(name) {
            return Err(CredentialError::ServerExists(name.to_string()));
        }

        let server = Arc::new(ManagedServer::new(
            name.to_string(),
            psk_length,
            path.as_ref().to_path_buf(),
            tcp,
            udp,
            self.save_cooldown,
        ));
        server.reload_caches()?;

        servers.insert(name.to_string(), server.clone());
        debug!(server = %name, "registered server");
        Ok(server)
    }

    /// Get a registered server by name.
    #[must_use]
    pub fn server(&self, name: &str) -> Option<Arc<ManagedServer>> {
        self.servers.read().get(name).cloned()
    }

    /// Load credentials for all managed servers, failing on the first
    /// error.
    ///
    /// # Errors
    ///
    /// Returns the first server's [`CredentialError`].
    pub fn load_all(&self) -> Result<(), CredentialError> {
        let servers: Vec<_> = self.servers.read().values().cloned().collect();
        for server in servers {
            server.load_from_file()?;
            debug!(server = %server.name(), "loaded credentials");
        }
        Ok(())
    }

    /// Reload all managed servers from their files.
    ///
    /// A server that fails to reload keeps its previous state; the
    /// error is logged and the remaining servers still reload. Called
    /// on the process's reload signal.
    pub fn reload_all(&self) {
        let servers: Vec<_> = self.servers.read().values().cloned().collect();
        for server in servers {
            match server.load_from_file() {
                Ok(()) => info!(server = %server.name(), "reloaded credentials"),
                Err(e) => {
                    warn!(server = %server.name(), error = %e, "failed to reload credentials");
                }
            }
        }
    }
}

impl Default for Manager {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for Manager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("credential manager")
    }
}

#[async_trait::async_trait]
impl Service for Manager {
    async fn start(&self) -> Result<(), RelayError> {
        let servers: Vec<_> = self.servers.read().values().cloned().collect();
        for server in servers {
            server.start();
        }
        Ok(())
    }

    async fn stop(&self) -> Result<(), RelayError> {
        let servers: Vec<_> = self.servers.read().values().cloned().collect();
        for server in servers {
            server.stop().await;
        }
        Ok(())
    }
}
