//! WebSocket client against a DocumentHub on a loopback port.

use std::sync::Arc;
use std::time::Duration;

use barsa_core::{Collection, Credentials, Record};
use barsa_db::LocalStore;
use barsa_sync::{
    ConnectionFailureKind, ConnectionValidator, DocumentHub, HubHandle, HubSettings, MemoryRemote,
    SessionState, SyncSessionManager, SyncSettings, WsConnector,
};
use serde_json::json;

const PROJECT: &str = "granja-norte";
const KEY: &str = "key-1";

macro_rules! eventually {
    ($cond:expr) => {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !$cond {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition not reached in time")
    };
}

async fn start_hub() -> HubHandle {
    let remote = MemoryRemote::new();
    remote.provision(PROJECT, KEY);
    let settings = HubSettings {
        port: 0,
        bind_addr: "127.0.0.1".to_string(),
    };
    DocumentHub::new(settings, remote).start().await.unwrap()
}

fn connector() -> Arc<WsConnector> {
    Arc::new(WsConnector::from_settings(&SyncSettings {
        connect_timeout_secs: 2,
        ..SyncSettings::default()
    }))
}

fn credentials(hub: &HubHandle, key: &str) -> Credentials {
    Credentials::new(key, PROJECT).with_endpoint(hub.endpoint())
}

fn batch(id: &str, crates: i64) -> Record {
    Record::from_value(json!({"id": id, "crates": crates})).unwrap()
}

#[tokio::test]
async fn test_session_over_websocket() {
    let hub = start_hub().await;
    let store = LocalStore::in_memory().await.unwrap();
    let manager = SyncSessionManager::new(
        store.clone(),
        connector(),
        SyncSettings {
            bootstrap_delay_ms: 50,
            ..SyncSettings::default()
        },
    );

    manager.connect(&credentials(&hub, KEY)).await.unwrap();
    assert_eq!(manager.state().await, SessionState::Active);
    eventually!(hub.remote().active_feeds(PROJECT) == 4);
    assert_eq!(hub.client_names().await, vec!["primary".to_string()]);

    // Local save is mirrored through the hub.
    store.save(Collection::Batches, batch("b-1", 5)).await.unwrap();
    eventually!(hub.remote().document(PROJECT, "batches", "b-1").is_some());

    // Another device's write arrives locally.
    hub.remote()
        .put_document(PROJECT, Collection::Batches, batch("b-2", 8))
        .unwrap();
    eventually!(store.get_one(Collection::Batches, "b-2").await.unwrap().is_some());

    // And so does its delete.
    assert!(hub.remote().remove_document(PROJECT, Collection::Batches, "b-2"));
    eventually!(store.get_one(Collection::Batches, "b-2").await.unwrap().is_none());

    manager.disconnect().await;
    eventually!(hub.client_count().await == 0);
    eventually!(hub.remote().active_feeds(PROJECT) == 0);

    hub.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_wrong_key_fails_connect_over_websocket() {
    let hub = start_hub().await;
    let store = LocalStore::in_memory().await.unwrap();
    let manager = SyncSessionManager::new(store, connector(), SyncSettings::default());

    let err = manager
        .connect(&credentials(&hub, "wrong"))
        .await
        .unwrap_err();
    assert_eq!(err.failure_kind(), ConnectionFailureKind::PermissionDenied);
    assert_eq!(manager.state().await, SessionState::Disconnected);

    hub.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_validator_over_websocket() {
    let hub = start_hub().await;
    let validator = ConnectionValidator::new(connector(), Duration::from_secs(2));

    let ok = validator.validate(&credentials(&hub, KEY)).await;
    assert!(ok.valid, "{:?}", ok);
    assert!(hub
        .remote()
        .document(PROJECT, "_diagnostics", "connection-test")
        .is_some());

    let denied = validator.validate(&credentials(&hub, "wrong")).await;
    assert_eq!(denied.kind, Some(ConnectionFailureKind::PermissionDenied));

    let missing = validator
        .validate(&Credentials::new(KEY, "other-farm").with_endpoint(hub.endpoint()))
        .await;
    assert_eq!(missing.kind, Some(ConnectionFailureKind::NotProvisioned));

    let no_endpoint = validator.validate(&Credentials::new(KEY, PROJECT)).await;
    assert_eq!(
        no_endpoint.kind,
        Some(ConnectionFailureKind::MalformedCredentials)
    );

    eventually!(hub.client_count().await == 0);
    hub.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_unreachable_hub_is_network_unavailable() {
    let hub = start_hub().await;
    let endpoint = hub.endpoint();
    hub.shutdown().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let validator = ConnectionValidator::new(connector(), Duration::from_secs(2));
    let outcome = validator
        .validate(&Credentials::new(KEY, PROJECT).with_endpoint(endpoint))
        .await;
    assert_eq!(outcome.kind, Some(ConnectionFailureKind::NetworkUnavailable));
}
