//! End-to-end behaviour of the sync core against an in-memory server.

use std::sync::Arc;
use std::time::Duration;

use daybook_core::sync::{
    ChannelEventSource, ConnectionStatus, MockTransport, PullGateState, PullResponse,
};
use daybook_core::{
    Config, Credential, Entity, Food, FoodEntry, InvalidationChannel, Mutation, PatchOp,
    PullOutcome, Session, SyncClient, SyncConfig, SyncCoordinator, SyncError, TokenProvider,
};
use parking_lot::Mutex;
use tempfile::TempDir;

fn tea() -> FoodEntry {
    FoodEntry {
        name: "Tea".to_string(),
        price: None,
    }
}

fn signed_in() -> TokenProvider {
    TokenProvider::in_memory(
        Some(Credential::new("tok").with_user_id("u1")),
        Duration::ZERO,
    )
}

async fn advance_to(start: tokio::time::Instant, millis: u64) {
    tokio::time::sleep_until(start + Duration::from_millis(millis)).await;
}

async fn settle() {
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
}

async fn wait_connected(channel: &InvalidationChannel) {
    let mut status = channel.status();
    status
        .wait_for(|s| *s == ConnectionStatus::Connected)
        .await
        .unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_local_write_is_readable_while_pull_is_gated() {
    let start = tokio::time::Instant::now();
    let mock = MockTransport::new();
    let config = SyncConfig::new("food", "https://example.com")
        .with_pull_warmup(Duration::from_millis(2000))
        .with_pull_on_ready(false)
        .with_auto_push(false);
    let coordinator: SyncCoordinator<Food> =
        SyncCoordinator::new(config, Arc::new(mock.clone()), signed_in()).unwrap();

    advance_to(start, 10).await;
    coordinator
        .mutate(Mutation::Create {
            id: "a".to_string(),
            fields: tea(),
        })
        .unwrap();

    advance_to(start, 11).await;
    let records: Vec<Entity<FoodEntry>> = coordinator.scan().collect();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].id, "a");
    assert_eq!(records[0].fields.name, "Tea");

    advance_to(start, 500).await;
    assert_eq!(coordinator.pull().await.unwrap(), PullOutcome::Gated);
    assert_eq!(mock.pull_count(), 0);

    advance_to(start, 2001).await;
    assert_eq!(coordinator.gate_state(), PullGateState::Open);
    assert!(matches!(
        coordinator.pull().await.unwrap(),
        PullOutcome::Applied { .. }
    ));
    assert_eq!(mock.pull_count(), 1);

    // The pending create is still there; nothing was rolled back
    assert_eq!(coordinator.get("a").unwrap().fields.name, "Tea");
}

#[tokio::test]
async fn test_sync_event_reaches_every_domain_through_one_stream() {
    let dir = TempDir::new().unwrap();
    let mock = MockTransport::new();
    let config = Config {
        data_dir: dir.path().to_path_buf(),
        server_url: Some("https://example.com".to_string()),
        ..Config::default()
    };
    let session = Session::open_with(config, Arc::new(mock.clone()), signed_in()).unwrap();

    let source = ChannelEventSource::new();
    let channel = session.listen_to(Arc::new(source.clone()));
    wait_connected(&channel).await;
    assert_eq!(source.connect_count(), 1);
    assert_eq!(source.open_connections(), 1);

    source.send("ping");
    settle().await;
    assert_eq!(mock.pull_count(), 0);

    source.send("sync");
    settle().await;
    let mut urls = mock.pull_urls();
    urls.sort();
    assert_eq!(
        urls,
        vec![
            "https://example.com/api/diary/pull",
            "https://example.com/api/food/pull",
            "https://example.com/api/ideas/pull",
        ]
    );

    session.shutdown();
    settle().await;
    assert!(!channel.is_streaming());
}

#[tokio::test(start_paused = true)]
async fn test_credential_burst_builds_one_coordinator() {
    let tokens = TokenProvider::in_memory(None, Duration::from_millis(300));
    let config = SyncConfig::new("food", "https://example.com")
        .with_pull_on_ready(false)
        .with_auto_push(false);
    let client: SyncClient<Food> =
        SyncClient::new(config, Arc::new(MockTransport::new()), tokens.clone()).unwrap();

    tokens.set(&Credential::new("first")).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    tokens.set(&Credential::new("second")).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    tokens.set(&Credential::new("third")).unwrap();

    // Still inside the window of the last change
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!client.is_initialized());

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(client.is_initialized());
    assert_eq!(client.coordinator_builds(), 1);
}

#[tokio::test]
async fn test_failed_push_is_not_rolled_back() {
    let mock = MockTransport::new();
    mock.fail_pushes(1, 400);
    let config = SyncConfig::new("food", "https://example.com")
        .with_pull_on_ready(false)
        .with_auto_push(false);
    let coordinator: SyncCoordinator<Food> =
        SyncCoordinator::new(config, Arc::new(mock.clone()), signed_in()).unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let _sub = coordinator.subscribe(move |records| sink.lock().push(records.len()));

    coordinator.create(tea()).unwrap();
    assert!(coordinator.flush().await.is_err());

    assert_eq!(*seen.lock(), vec![0, 1]);
    assert_eq!(coordinator.scan().count(), 1);
    assert_eq!(coordinator.pending_count(), 1);
    assert!(mock.pokes().is_empty());

    // The next flush sends the same batch
    let outcome = coordinator.flush().await.unwrap();
    assert!(matches!(outcome, daybook_core::PushOutcome::Pushed { count: 1, .. }));
    let pushes = mock.pushes();
    assert_eq!(pushes[0], pushes[1]);
}

#[tokio::test]
async fn test_server_patch_replaces_local_view() {
    let mock = MockTransport::new();
    let config = SyncConfig::new("food", "https://example.com")
        .with_pull_on_ready(false)
        .with_auto_push(false);
    let coordinator: SyncCoordinator<Food> =
        SyncCoordinator::new(config, Arc::new(mock.clone()), signed_in()).unwrap();
    coordinator.create(tea()).unwrap();

    let server_copy = Entity::new("srv", tea());
    mock.queue_pull_response(PullResponse {
        last_mutation_id: Some(1),
        patch: vec![
            PatchOp::Clear,
            PatchOp::Put {
                key: "entry/srv".to_string(),
                value: serde_json::to_value(&server_copy).unwrap(),
            },
        ],
    });
    coordinator.pull().await.unwrap();

    let ids: Vec<_> = coordinator.scan().map(|e| e.id).collect();
    assert_eq!(ids, vec!["srv"]);
    assert_eq!(coordinator.pending_count(), 0);
}

#[test]
fn test_session_reload_restores_replica_and_queue() {
    let dir = TempDir::new().unwrap();
    let config = Config {
        data_dir: dir.path().to_path_buf(),
        server_url: Some("https://example.com".to_string()),
        ..Config::default()
    };

    let first = Session::open_with(config.clone(), Arc::new(MockTransport::new()), signed_in())
        .unwrap();
    let id = first.food().create(tea()).unwrap();
    first.shutdown();
    drop(first);

    let second =
        Session::open_with(config, Arc::new(MockTransport::new()), signed_in()).unwrap();
    assert_eq!(second.food().get(&id).unwrap().unwrap().fields.name, "Tea");
    let coordinator = second.food().coordinator().unwrap();
    assert_eq!(coordinator.pending_count(), 1);
}

#[test]
fn test_signed_out_session_rejects_writes() {
    let dir = TempDir::new().unwrap();
    let config = Config {
        data_dir: dir.path().to_path_buf(),
        ..Config::default()
    };
    let session = Session::open_with(
        config,
        Arc::new(MockTransport::new()),
        TokenProvider::in_memory(None, Duration::ZERO),
    )
    .unwrap();

    let err = session.diary().create(Default::default()).unwrap_err();
    assert!(matches!(err, SyncError::NotInitialized { domain: "diary" }));
}
