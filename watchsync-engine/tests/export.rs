use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};

use chrono::{TimeZone, Utc};
use reqwest::Method;
use watchsync_backend::{
    BackendClient, BackendError, MemoryQueue, QueuedRequest, RemoteItem, RemoteUserData, UserData,
};
use watchsync_engine::{plan_export, ExportOptions, ExportProgress};
use watchsync_model::{BackendMeta, MediaType, State};

struct MockBackend {
    name: String,
    items: HashMap<String, RemoteItem>,
}

impl MockBackend {
    fn new(items: Vec<(&str, RemoteItem)>) -> Self {
        Self {
            name: "home".to_string(),
            items: items
                .into_iter()
                .map(|(id, item)| (id.to_string(), item))
                .collect(),
        }
    }
}

impl BackendClient for MockBackend {
    fn backend_id(&self) -> &str {
        &self.name
    }

    async fn identify(&self) -> Result<String, BackendError> {
        Ok("mock-server".to_string())
    }

    async fn list_items(&self, _since: Option<i64>) -> Result<Vec<State>, BackendError> {
        Ok(Vec::new())
    }

    async fn get_item(&self, item_id: &str) -> Result<RemoteItem, BackendError> {
        self.items
            .get(item_id)
            .cloned()
            .ok_or(BackendError::NotFound)
    }

    async fn mark_played(
        &self,
        _item_id: &str,
        _played_at: Option<i64>,
    ) -> Result<(), BackendError> {
        Ok(())
    }

    async fn mark_unplayed(&self, _item_id: &str) -> Result<(), BackendError> {
        Ok(())
    }

    fn play_state_request(&self, item_id: &str, entity: &State) -> QueuedRequest {
        QueuedRequest {
            method: if entity.watched {
                Method::POST
            } else {
                Method::DELETE
            },
            url: format!("http://mock.local/PlayedItems/{item_id}"),
            headers: Vec::new(),
            user_data: UserData {
                backend: self.name.clone(),
                title: entity.title.clone(),
                media_type: entity.media_type.as_str().to_string(),
                watched: entity.watched,
                updated: entity.updated,
            },
        }
    }
}

fn remote(played: bool, last_played: Option<i64>, created: Option<i64>) -> RemoteItem {
    RemoteItem {
        id: "121".to_string(),
        name: Some("The Matrix".to_string()),
        item_type: "Movie".to_string(),
        user_data: Some(RemoteUserData {
            played,
            last_played_date: last_played.map(|ts| Utc.timestamp_opt(ts, 0).unwrap()),
        }),
        date_created: created.map(|ts| Utc.timestamp_opt(ts, 0).unwrap()),
        ..Default::default()
    }
}

fn entity(watched: bool, updated: i64) -> State {
    State {
        media_type: MediaType::Movie,
        watched,
        updated,
        via: "home".to_string(),
        title: "The Matrix".to_string(),
        guids: BTreeMap::from([("imdb".to_string(), "tt1".to_string())]),
        metadata: BTreeMap::from([(
            "home".to_string(),
            BackendMeta {
                id: Some("121".to_string()),
                ..Default::default()
            },
        )]),
        ..Default::default()
    }
}

fn silent() -> impl Fn(ExportProgress) {
    |_| {}
}

#[tokio::test]
async fn queues_a_play_when_the_backend_is_behind() {
    let backend = MockBackend::new(vec![("121", remote(false, None, Some(990)))]);
    let queue = MemoryQueue::new();
    let entities = [entity(true, 1000)];

    let stats = plan_export(
        &backend,
        &queue,
        &entities,
        &ExportOptions::default(),
        &silent(),
    )
    .await;

    assert_eq!(stats.queued, 1);
    let requests = queue.drain();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].method, Method::POST);
    assert!(requests[0].user_data.watched);
}

#[tokio::test]
async fn queues_an_unplay_when_canonical_is_unwatched() {
    let backend = MockBackend::new(vec![("121", remote(true, Some(900), Some(800)))]);
    let queue = MemoryQueue::new();
    let entities = [entity(false, 1000)];

    let stats = plan_export(
        &backend,
        &queue,
        &entities,
        &ExportOptions::default(),
        &silent(),
    )
    .await;

    assert_eq!(stats.queued, 1);
    assert_eq!(queue.drain()[0].method, Method::DELETE);
}

#[tokio::test]
async fn backend_newer_than_drift_window_is_left_alone() {
    // Canonical updated=1000, backend created=1020, tolerance 10:
    // 1020 >= 1010, so the backend wins and no action is enqueued.
    let backend = MockBackend::new(vec![("121", remote(false, None, Some(1020)))]);
    let queue = MemoryQueue::new();
    let entities = [entity(true, 1000)];

    let stats = plan_export(
        &backend,
        &queue,
        &entities,
        &ExportOptions::default(),
        &silent(),
    )
    .await;

    assert_eq!(stats.queued, 0);
    assert_eq!(stats.backend_newer, 1);
    assert!(queue.is_empty());
}

#[tokio::test]
async fn already_in_sync_is_suppressed() {
    let backend = MockBackend::new(vec![("121", remote(true, Some(999), None))]);
    let queue = MemoryQueue::new();
    let entities = [entity(true, 1000)];

    let stats = plan_export(
        &backend,
        &queue,
        &entities,
        &ExportOptions::default(),
        &silent(),
    )
    .await;

    assert_eq!(stats.identical, 1);
    assert!(queue.is_empty());
}

#[tokio::test]
async fn entities_unknown_to_the_backend_are_skipped() {
    let backend = MockBackend::new(vec![]);
    let queue = MemoryQueue::new();

    let mut no_id = entity(true, 1000);
    no_id.metadata.clear();
    let gone = entity(true, 1000); // has an id, but the backend 404s

    let stats = plan_export(
        &backend,
        &queue,
        &[no_id, gone],
        &ExportOptions::default(),
        &silent(),
    )
    .await;

    assert_eq!(stats.processed, 2);
    assert_eq!(stats.missing_local_id, 1);
    assert_eq!(stats.not_found, 1);
    assert!(queue.is_empty());
}

#[tokio::test]
async fn missing_backend_date_is_skipped() {
    let backend = MockBackend::new(vec![("121", remote(false, None, None))]);
    let queue = MemoryQueue::new();
    let entities = [entity(true, 1000)];

    let stats = plan_export(
        &backend,
        &queue,
        &entities,
        &ExportOptions::default(),
        &silent(),
    )
    .await;

    assert_eq!(stats.missing_date, 1);
    assert!(queue.is_empty());
}

#[tokio::test]
async fn after_gate_skips_unchanged_entities() {
    let backend = MockBackend::new(vec![("121", remote(false, None, Some(900)))]);
    let queue = MemoryQueue::new();
    let entities = [entity(true, 1000)];

    let gated = ExportOptions {
        after: Some(1500),
        ..Default::default()
    };
    let stats = plan_export(&backend, &queue, &entities, &gated, &silent()).await;
    assert_eq!(stats.unchanged_since, 1);
    assert!(queue.is_empty());

    let ungated = ExportOptions {
        after: Some(1500),
        ignore_date: true,
        ..Default::default()
    };
    let stats = plan_export(&backend, &queue, &entities, &ungated, &silent()).await;
    assert_eq!(stats.queued, 1);
    assert_eq!(queue.len(), 1);
}

#[tokio::test]
async fn dry_run_counts_without_enqueueing() {
    let backend = MockBackend::new(vec![("121", remote(false, None, Some(900)))]);
    let queue = MemoryQueue::new();
    let entities = [entity(true, 1000)];

    let options = ExportOptions {
        dry_run: true,
        ..Default::default()
    };
    let stats = plan_export(&backend, &queue, &entities, &options, &silent()).await;

    assert_eq!(stats.queued, 1);
    assert!(queue.is_empty());
}

#[tokio::test]
async fn progress_reports_every_decision() {
    let backend = MockBackend::new(vec![
        ("121", remote(false, None, Some(900))),
        ("122", remote(true, Some(999), None)),
    ]);
    let queue = MemoryQueue::new();

    let queued = entity(true, 1000);
    let mut in_sync = entity(true, 1000);
    in_sync.metadata.get_mut("home").unwrap().id = Some("122".to_string());

    let events: RefCell<Vec<ExportProgress>> = RefCell::new(Vec::new());
    plan_export(
        &backend,
        &queue,
        &[queued, in_sync],
        &ExportOptions::default(),
        &|event| events.borrow_mut().push(event),
    )
    .await;

    let events = events.into_inner();
    assert!(matches!(events[0], ExportProgress::Planning { total: 2 }));
    assert!(events
        .iter()
        .any(|e| matches!(e, ExportProgress::Queued { .. })));
    assert!(events
        .iter()
        .any(|e| matches!(e, ExportProgress::Skipped { .. })));
    assert!(matches!(events.last(), Some(ExportProgress::Done)));
}
