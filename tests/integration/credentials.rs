//! Credential manager end-to-end scenarios

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use tempfile::TempDir;

use rust_relay::{identity_hash, CredStore, Manager, Service};

fn upsk(seed: u8) -> Vec<u8> {
    vec![seed; 32]
}

fn write_cred_file(dir: &TempDir, creds: &[(&str, Vec<u8>)]) -> std::path::PathBuf {
    let path = dir.path().join("creds.json");
    let map: HashMap<&str, String> = creds
        .iter()
        .map(|(user, key)| (*user, BASE64.encode(key)))
        .collect();
    std::fs::write(&path, serde_json::to_string_pretty(&map).unwrap()).unwrap();
    path
}

#[tokio::test]
async fn live_update_is_atomic_under_concurrent_lookups() {
    let dir = TempDir::new().unwrap();
    let path = write_cred_file(&dir, &[("alice", upsk(1))]);

    let tcp = Arc::new(CredStore::new());
    let udp = Arc::new(CredStore::new());
    let manager = Manager::with_save_cooldown(Duration::from_millis(10));
    let server = manager
        .register_server("ss-2022", 32, &path, Some(tcp.clone()), Some(udp.clone()))
        .unwrap();
    manager.start().await.unwrap();

    // Hot-path readers hammer both stores while credentials rotate.
    let mut readers = Vec::new();
    for store in [tcp.clone(), udp.clone()] {
        readers.push(tokio::spawn(async move {
            let mut hits = 0u64;
            for round in 0..2000u32 {
                let seed = u8::try_from(round % 2 + 1).unwrap();
                if let Some(config) = store.lookup(&identity_hash(&upsk(seed))) {
                    // Whatever we see must be internally consistent.
                    assert_eq!(config.name(), "alice");
                    assert_eq!(config.upsk(), upsk(seed).as_slice());
                    hits += 1;
                }
                if round % 128 == 0 {
                    tokio::task::yield_now().await;
                }
            }
            hits
        }));
    }

    // Rotate alice's key back and forth under load.
    for round in 0..40u32 {
        let next = if round % 2 == 0 { upsk(2) } else { upsk(1) };
        server.update_credential("alice", &next).unwrap();
        tokio::task::yield_now().await;
    }

    for reader in readers {
        let hits = reader.await.unwrap();
        assert!(hits > 0, "readers must observe live credentials");
    }

    // After the last rotation only the final key authenticates.
    assert!(tcp.lookup(&identity_hash(&upsk(2))).is_none());
    assert!(tcp.lookup(&identity_hash(&upsk(1))).is_some());

    manager.stop().await.unwrap();
}

#[tokio::test]
async fn mutations_reach_disk_within_cooldown() {
    let dir = TempDir::new().unwrap();
    let path = write_cred_file(&dir, &[]);

    let manager = Manager::with_save_cooldown(Duration::from_millis(20));
    let server = manager
        .register_server("ss-2022", 32, &path, None, None)
        .unwrap();
    manager.start().await.unwrap();

    server.add_credential("alice", &upsk(1)).unwrap();
    server.add_credential("bob", &upsk(2)).unwrap();
    server.delete_credential("bob").unwrap();

    tokio::time::sleep(Duration::from_millis(250)).await;

    let content = std::fs::read_to_string(&path).unwrap();
    let on_disk: HashMap<String, String> = serde_json::from_str(&content).unwrap();
    assert_eq!(on_disk.len(), 1);
    assert_eq!(BASE64.decode(&on_disk["alice"]).unwrap(), upsk(1));

    manager.stop().await.unwrap();
}

#[tokio::test]
async fn reload_applies_file_changes_to_live_stores() {
    let dir = TempDir::new().unwrap();
    let path = write_cred_file(&dir, &[("alice", upsk(1))]);

    let tcp = Arc::new(CredStore::new());
    let manager = Manager::new();
    manager
        .register_server("ss-2022", 32, &path, Some(tcp.clone()), None)
        .unwrap();
    manager.start().await.unwrap();
    assert!(tcp.lookup(&identity_hash(&upsk(1))).is_some());

    // The reload signal handler path: rewrite the file, reload all.
    write_cred_file(&dir, &[("carol", upsk(3))]);
    manager.reload_all();

    assert!(tcp.lookup(&identity_hash(&upsk(1))).is_none());
    assert_eq!(
        tcp.lookup(&identity_hash(&upsk(3))).unwrap().name(),
        "carol"
    );

    manager.stop().await.unwrap();
}
