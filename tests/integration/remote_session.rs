//! End-to-end tests: sessions talking to a real `betterish-store` server
//! over WebSocket.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use betterish::session::{Session, SessionOptions};
use betterish::store::remote::{RemoteOptions, RemoteStore};
use betterish::tasks::TaskError;
use betterish_proto::task::{Category, NewTask, Priority, TaskPatch};

async fn start_server() -> SocketAddr {
    let (addr, _handle) = betterish_store::server::start_server("127.0.0.1:0")
        .await
        .unwrap();
    addr
}

async fn open(addr: SocketAddr, owner: &str) -> Session<RemoteStore> {
    let store = RemoteStore::connect(&format!("ws://{addr}/ws"), owner, RemoteOptions::default())
        .await
        .unwrap();
    let (session, _events) = Session::open(Arc::new(store), owner, SessionOptions::default())
        .await
        .unwrap();
    session
}

async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn add_is_confirmed_and_reaches_other_device() {
    let addr = start_server().await;
    let phone = open(addr, "alice").await;
    let laptop = open(addr, "alice").await;

    let new = NewTask {
        category: Some(Category::Household),
        priority: Priority::High,
        ..NewTask::titled("Take out trash")
    };
    let id = phone.controller().add(new).await.unwrap();
    assert!(!id.is_temporary());
    assert_eq!(phone.controller().tasks().len(), 1);

    let laptop_ctl = Arc::clone(laptop.controller());
    wait_until(|| laptop_ctl.get(&id).is_some()).await;
    let seen = laptop_ctl.get(&id).unwrap();
    assert_eq!(seen.title, "Take out trash");
    assert_eq!(seen.category, Some(Category::Household));
    assert_eq!(seen.priority, Priority::High);

    // The creator's own echo must not produce a second copy.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(phone.controller().tasks().len(), 1);
}

#[tokio::test]
async fn edits_and_deletes_propagate() {
    let addr = start_server().await;
    let phone = open(addr, "alice").await;
    let laptop = open(addr, "alice").await;
    let laptop_ctl = Arc::clone(laptop.controller());

    let id = phone.controller().add(NewTask::titled("Call mom")).await.unwrap();
    wait_until(|| laptop_ctl.get(&id).is_some()).await;

    phone.controller().complete(&id).await.unwrap();
    wait_until(|| laptop_ctl.get(&id).is_some_and(|t| t.completed)).await;

    laptop_ctl.update(&id, TaskPatch::title("Call mom back")).await.unwrap();
    let phone_ctl = Arc::clone(phone.controller());
    wait_until(|| phone_ctl.get(&id).is_some_and(|t| t.title == "Call mom back")).await;

    phone_ctl.delete(&id).await.unwrap();
    wait_until(|| laptop_ctl.get(&id).is_none()).await;

    phone_ctl.undo_delete(&id).await.unwrap();
    wait_until(|| laptop_ctl.get(&id).is_some()).await;
}

#[tokio::test]
async fn owners_are_isolated() {
    let addr = start_server().await;
    let alice = open(addr, "alice").await;
    let bob = open(addr, "bob").await;

    let id = alice.controller().add(NewTask::titled("Private")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(bob.controller().tasks().is_empty());

    let err = bob.controller().complete(&id).await.unwrap_err();
    assert!(matches!(err, TaskError::NotFound(_)));
}

#[tokio::test]
async fn reopened_session_loads_existing_tasks() {
    let addr = start_server().await;
    let first = open(addr, "alice").await;
    first.controller().add(NewTask::titled("Older")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    first.controller().add(NewTask::titled("Newer")).await.unwrap();
    first.close();

    let second = open(addr, "alice").await;
    let titles: Vec<_> = second
        .controller()
        .tasks()
        .into_iter()
        .map(|t| t.title)
        .collect();
    assert_eq!(titles, vec!["Newer", "Older"]);
}

#[tokio::test]
async fn switching_owner_over_one_connection() {
    let addr = start_server().await;
    let mut session = open(addr, "alice").await;
    session.controller().add(NewTask::titled("Alice's")).await.unwrap();

    let _events = session.switch_owner("bob").await.unwrap();
    assert_eq!(session.owner(), "bob");
    assert!(session.controller().tasks().is_empty());
    session.controller().add(NewTask::titled("Bob's")).await.unwrap();
    assert_eq!(session.controller().tasks().len(), 1);
}
