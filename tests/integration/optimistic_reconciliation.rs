//! Integration tests for optimistic task updates.
//!
//! Drives a `TaskController` (alone or inside a `Session`) against a scripted
//! `MemoryStore` and checks how the local view reconciles with the store's
//! answers.

#![allow(clippy::expect_used, clippy::unwrap_used, clippy::similar_names)]

use std::sync::Arc;
use std::time::Duration;

use betterish::session::{Session, SessionOptions};
use betterish::store::StoreError;
use betterish::store::memory::{MemoryStore, StoreCall};
use betterish::tasks::{
    ControllerOptions, ErrorKind, RetryPolicy, TaskController, TaskError, TaskEvent, TaskService,
};
use betterish_proto::document::FieldValue;
use betterish_proto::task::{NewTask, TASKS_COLLECTION, Task, TaskId, TaskPatch, Timestamp};
use tokio::sync::mpsc;

// ---------------------------------------------------------------------------
// Helper functions
// ---------------------------------------------------------------------------

fn fast_options() -> ControllerOptions {
    ControllerOptions {
        retry: RetryPolicy {
            retries: 1,
            backoff: Duration::from_millis(1),
        },
        ..ControllerOptions::default()
    }
}

fn make_controller(
    store: &MemoryStore,
    options: ControllerOptions,
) -> (Arc<TaskController<MemoryStore>>, mpsc::Receiver<TaskEvent>) {
    let service = TaskService::new(Arc::new(store.clone()));
    let (controller, events) = TaskController::new(service, "alice", options);
    (Arc::new(controller), events)
}

fn seed(store: &MemoryStore, id: &str, title: &str) {
    let task = Task::from_new(
        TaskId::persisted(id),
        "alice",
        NewTask::titled(title),
        Timestamp::from_millis(1_000),
    );
    store.insert(TASKS_COLLECTION, id, task.to_fields());
}

async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..1_000 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    panic!("condition not reached in time");
}

fn drain(events: &mut mpsc::Receiver<TaskEvent>) -> Vec<TaskEvent> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}

// ===========================================================================
// Create
// ===========================================================================

#[tokio::test]
async fn add_resolves_temporary_id_to_store_id() {
    let store = MemoryStore::with_ids("srv_", 123);
    store.set_latency(Some(Duration::from_millis(20)));
    let (controller, _events) = make_controller(&store, fast_options());

    let adding = tokio::spawn({
        let controller = Arc::clone(&controller);
        async move { controller.add(NewTask::titled("Take out trash")).await }
    });

    wait_until(|| !controller.tasks().is_empty()).await;
    let optimistic = controller.tasks();
    assert_eq!(optimistic.len(), 1);
    assert!(optimistic[0].id.is_temporary());

    let id = adding.await.unwrap().unwrap();
    assert_eq!(id, TaskId::persisted("srv_123"));

    let tasks = controller.tasks();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].id, TaskId::persisted("srv_123"));
    assert_eq!(tasks[0].title, "Take out trash");
    assert!(!tasks[0].completed);
}

#[tokio::test]
async fn failed_add_leaves_no_task_and_one_notice() {
    let store = MemoryStore::new();
    let (controller, mut events) = make_controller(&store, fast_options());
    store.fail_next(StoreCall::Create, StoreError::Internal("disk full".into()));

    let err = controller.add(NewTask::titled("Water plants")).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Unknown);
    assert!(controller.tasks().is_empty());
    assert_eq!(controller.notices().len(), 1);
    let notices = drain(&mut events)
        .into_iter()
        .filter(|e| matches!(e, TaskEvent::Notice(_)))
        .count();
    assert_eq!(notices, 1);
}

#[tokio::test]
async fn own_create_echo_does_not_duplicate_task() {
    let store = MemoryStore::with_ids("srv_", 1);
    let options = SessionOptions {
        controller: fast_options(),
        ..SessionOptions::default()
    };
    let (session, _events) = Session::open(Arc::new(store.clone()), "alice", options)
        .await
        .unwrap();
    let controller = Arc::clone(session.controller());

    let id = controller.add(NewTask::titled("Pay rent")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let tasks = controller.tasks();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].id, id);
}

// ===========================================================================
// Update / complete
// ===========================================================================

#[tokio::test]
async fn complete_reverts_after_connectivity_failure_and_retry() {
    let store = MemoryStore::with_ids("srv_", 123);
    let (controller, _events) = make_controller(&store, fast_options());
    let id = controller.add(NewTask::titled("Take out trash")).await.unwrap();

    store.fail_next(StoreCall::Update, StoreError::Connectivity("offline".into()));
    store.fail_next(StoreCall::Update, StoreError::Connectivity("offline".into()));

    let completing = tokio::spawn({
        let controller = Arc::clone(&controller);
        let id = id.clone();
        async move { controller.complete(&id).await }
    });
    let err = completing.await.unwrap().unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Connectivity);
    assert!(!controller.get(&id).unwrap().completed);
    let notices = controller.notices();
    assert_eq!(notices.len(), 1);
    assert_eq!(notices[0].kind, ErrorKind::Connectivity);
    assert_eq!(notices[0].task_id, Some(id));
}

#[tokio::test]
async fn complete_shows_immediately() {
    let store = MemoryStore::new();
    seed(&store, "t1", "Dishes");
    store.set_latency(Some(Duration::from_millis(30)));
    let (controller, _events) = make_controller(&store, fast_options());
    controller.refresh().await.unwrap();

    let id = TaskId::persisted("t1");
    let completing = tokio::spawn({
        let controller = Arc::clone(&controller);
        let id = id.clone();
        async move { controller.complete(&id).await }
    });
    wait_until(|| controller.is_pending(&id)).await;
    assert!(controller.get(&id).unwrap().completed);

    completing.await.unwrap().unwrap();
    assert!(controller.get(&id).unwrap().completed);
    assert!(!controller.is_pending(&id));
}

#[tokio::test]
async fn updates_to_one_task_reach_store_in_order() {
    let store = MemoryStore::new();
    seed(&store, "t1", "Draft");
    let (controller, _events) = make_controller(&store, fast_options());
    controller.refresh().await.unwrap();
    store.set_latency(Some(Duration::from_millis(10)));

    let id = TaskId::persisted("t1");
    let (first, second) = tokio::join!(
        controller.update(&id, TaskPatch::title("First")),
        controller.update(&id, TaskPatch::title("Second")),
    );
    first.unwrap();
    second.unwrap();

    let titles: Vec<_> = store
        .writes()
        .into_iter()
        .filter(|w| w.call == StoreCall::Update)
        .filter_map(|w| w.fields.get("title").cloned())
        .collect();
    assert_eq!(
        titles,
        vec![FieldValue::Text("First".into()), FieldValue::Text("Second".into())]
    );
    assert_eq!(controller.get(&id).unwrap().title, "Second");
}

#[tokio::test]
async fn invalid_update_is_refused_without_notice() {
    let store = MemoryStore::new();
    seed(&store, "t1", "Draft");
    let (controller, _events) = make_controller(&store, fast_options());
    controller.refresh().await.unwrap();

    let id = TaskId::persisted("t1");
    let err = controller
        .update(&id, TaskPatch::title("x".repeat(101)))
        .await
        .unwrap_err();
    assert!(matches!(err, TaskError::Validation(_)));
    assert_eq!(controller.get(&id).unwrap().title, "Draft");
    assert!(controller.notices().is_empty());
    assert!(store.writes().is_empty());
}

#[tokio::test]
async fn complete_many_runs_each_task_independently() {
    let store = MemoryStore::new();
    seed(&store, "t1", "One");
    seed(&store, "t2", "Two");
    let (controller, _events) = make_controller(&store, fast_options());
    controller.refresh().await.unwrap();
    store.fail_next(StoreCall::Update, StoreError::Unauthorized("locked".into()));

    let ids = [TaskId::persisted("t1"), TaskId::persisted("t2")];
    let results = controller.complete_many(&ids).await;

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    let completed = ids
        .iter()
        .filter(|id| controller.get(id).unwrap().completed)
        .count();
    assert_eq!(completed, 1);
    assert_eq!(controller.notices().len(), 1);
}

// ===========================================================================
// Delete
// ===========================================================================

#[tokio::test]
async fn delete_not_found_is_success_without_notice() {
    let store = MemoryStore::new();
    seed(&store, "t1", "Gone already");
    let (controller, _events) = make_controller(&store, fast_options());
    controller.refresh().await.unwrap();
    store.fail_next(StoreCall::Update, StoreError::NotFound("t1".into()));

    let id = TaskId::persisted("t1");
    controller.delete(&id).await.unwrap();

    assert!(controller.get(&id).is_none());
    assert!(controller.notices().is_empty());
}

#[tokio::test]
async fn failed_delete_brings_task_back() {
    let store = MemoryStore::new();
    seed(&store, "t1", "Keep");
    let (controller, _events) = make_controller(&store, fast_options());
    controller.refresh().await.unwrap();
    store.fail_next(StoreCall::Update, StoreError::Unauthorized("no".into()));

    let id = TaskId::persisted("t1");
    assert!(controller.delete(&id).await.is_err());
    assert_eq!(controller.get(&id).unwrap().title, "Keep");
    assert_eq!(controller.notices()[0].kind, ErrorKind::Authorization);
}

#[tokio::test]
async fn undo_delete_within_window() {
    let store = MemoryStore::new();
    seed(&store, "t1", "Oops");
    let (controller, _events) = make_controller(&store, fast_options());
    controller.refresh().await.unwrap();

    let id = TaskId::persisted("t1");
    controller.delete(&id).await.unwrap();
    assert!(controller.get(&id).is_none());

    controller.undo_delete(&id).await.unwrap();
    assert_eq!(controller.get(&id).unwrap().title, "Oops");
    assert_eq!(
        store.get(TASKS_COLLECTION, "t1").unwrap().get("deleted"),
        Some(&FieldValue::Bool(false))
    );
}

// ===========================================================================
// Refresh and remote changes
// ===========================================================================

#[tokio::test]
async fn refresh_keeps_pending_completion() {
    let store = MemoryStore::new();
    seed(&store, "x", "Pending");
    seed(&store, "y", "Other");
    let options = ControllerOptions {
        retry: RetryPolicy {
            retries: 1,
            backoff: Duration::from_millis(100),
        },
        ..ControllerOptions::default()
    };
    let (controller, _events) = make_controller(&store, options);
    controller.refresh().await.unwrap();

    store.set_latency(Some(Duration::from_millis(30)));
    store.fail_next(StoreCall::Update, StoreError::Timeout);

    let id = TaskId::persisted("x");
    let completing = tokio::spawn({
        let controller = Arc::clone(&controller);
        let id = id.clone();
        async move { controller.complete(&id).await }
    });
    wait_until(|| controller.is_pending(&id)).await;

    // The store still says "not completed" while the retry is waiting.
    controller.refresh().await.unwrap();
    assert!(controller.is_pending(&id));
    assert!(controller.get(&id).unwrap().completed);
    assert_eq!(controller.tasks().len(), 2);

    completing.await.unwrap().unwrap();
    assert!(controller.get(&id).unwrap().completed);
}

#[tokio::test]
async fn foreign_changes_stream_into_session() {
    let store = MemoryStore::new();
    let (session, _events) = Session::open(Arc::new(store.clone()), "alice", SessionOptions::default())
        .await
        .unwrap();
    let controller = Arc::clone(session.controller());

    seed(&store, "other-device", "Added elsewhere");
    wait_until(|| controller.tasks().len() == 1).await;

    let mut tombstone = store.get(TASKS_COLLECTION, "other-device").unwrap();
    tombstone.insert("deleted".into(), FieldValue::Bool(true));
    store.insert(TASKS_COLLECTION, "other-device", tombstone);
    wait_until(|| controller.tasks().is_empty()).await;
}

#[tokio::test]
async fn teardown_discards_late_results() {
    let store = MemoryStore::new();
    seed(&store, "t1", "Slow");
    let (controller, _events) = make_controller(&store, fast_options());
    controller.refresh().await.unwrap();
    store.set_latency(Some(Duration::from_millis(30)));
    store.fail_next(StoreCall::Update, StoreError::Internal("late".into()));

    let id = TaskId::persisted("t1");
    let completing = tokio::spawn({
        let controller = Arc::clone(&controller);
        let id = id.clone();
        async move { controller.complete(&id).await }
    });
    wait_until(|| controller.is_pending(&id)).await;
    controller.teardown();
    let _ = completing.await.unwrap();

    // The failure arrived after teardown: no rollback, no notice.
    assert!(controller.get(&id).unwrap().completed);
    assert!(controller.notices().is_empty());
}
