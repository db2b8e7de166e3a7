//! Property tests: with a store that always succeeds, the optimistic
//! controller ends up showing exactly what the pure reducer computes for the
//! same sequence of intents.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::sync::Arc;

use betterish::store::memory::MemoryStore;
use betterish::tasks::{Action, ControllerOptions, TaskController, TaskService, TaskView};
use betterish_proto::task::{NewTask, Task, TaskId, TaskPatch, Timestamp};
use proptest::prelude::*;

#[derive(Debug, Clone)]
enum Step {
    Add(String),
    Rename(usize, String),
    Complete(usize),
    Uncomplete(usize),
    Delete(usize),
}

fn arb_title() -> impl Strategy<Value = String> {
    "[a-z][a-z ]{0,19}"
}

fn arb_step() -> impl Strategy<Value = Step> {
    prop_oneof![
        3 => arb_title().prop_map(Step::Add),
        2 => (any::<usize>(), arb_title()).prop_map(|(i, t)| Step::Rename(i, t)),
        2 => any::<usize>().prop_map(Step::Complete),
        1 => any::<usize>().prop_map(Step::Uncomplete),
        1 => any::<usize>().prop_map(Step::Delete),
    ]
}

/// Visible content without IDs or timestamps, in a stable order.
fn content(tasks: impl IntoIterator<Item = Task>) -> Vec<(String, bool)> {
    let mut out: Vec<_> = tasks
        .into_iter()
        .map(|t| (t.title.trim().to_string(), t.completed))
        .collect();
    out.sort();
    out
}

fn pick(ids: &[TaskId], index: usize) -> Option<TaskId> {
    (!ids.is_empty()).then(|| ids[index % ids.len()].clone())
}

fn run_reducer(steps: &[Step]) -> Vec<(String, bool)> {
    let mut view = TaskView::new();
    let mut ids = Vec::new();
    for (n, step) in steps.iter().enumerate() {
        let action = match step {
            Step::Add(title) => {
                let id = TaskId::persisted(format!("r{n}"));
                ids.push(id.clone());
                let new = NewTask::titled(title.clone());
                Action::Add(Task::from_new(id, "alice", new, Timestamp::from_millis(n as u64)))
            }
            Step::Rename(i, title) => {
                let Some(id) = pick(&ids, *i) else { continue };
                Action::Update {
                    id,
                    patch: TaskPatch::title(title.clone()),
                }
            }
            Step::Complete(i) => {
                let Some(id) = pick(&ids, *i) else { continue };
                Action::Complete {
                    id,
                    at: Timestamp::from_millis(n as u64),
                }
            }
            Step::Uncomplete(i) => {
                let Some(id) = pick(&ids, *i) else { continue };
                Action::Uncomplete { id }
            }
            Step::Delete(i) => {
                let Some(id) = pick(&ids, *i) else { continue };
                Action::Delete { id }
            }
        };
        let _ = view.apply(action);
    }
    content(view.tasks().into_iter().cloned())
}

async fn run_controller(steps: &[Step]) -> Vec<(String, bool)> {
    let store = MemoryStore::new();
    let service = TaskService::new(Arc::new(store));
    let (controller, _events) = TaskController::new(service, "alice", ControllerOptions::default());
    let mut ids = Vec::new();
    for step in steps {
        match step {
            Step::Add(title) => {
                let id = controller.add(NewTask::titled(title.clone())).await.unwrap();
                ids.push(id);
            }
            Step::Rename(i, title) => {
                if let Some(id) = pick(&ids, *i) {
                    let _ = controller.update(&id, TaskPatch::title(title.clone())).await;
                }
            }
            Step::Complete(i) => {
                if let Some(id) = pick(&ids, *i) {
                    let _ = controller.complete(&id).await;
                }
            }
            Step::Uncomplete(i) => {
                if let Some(id) = pick(&ids, *i) {
                    let _ = controller.uncomplete(&id).await;
                }
            }
            Step::Delete(i) => {
                if let Some(id) = pick(&ids, *i) {
                    let _ = controller.delete(&id).await;
                }
            }
        }
    }
    assert!(controller.pending_operations().is_empty());
    assert!(controller.notices().is_empty());
    content(controller.tasks())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn controller_matches_reducer(steps in proptest::collection::vec(arb_step(), 0..30)) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let via_controller = runtime.block_on(run_controller(&steps));
        let via_reducer = run_reducer(&steps);
        prop_assert_eq!(via_controller, via_reducer);
    }

    #[test]
    fn inverse_undoes_any_step(steps in proptest::collection::vec(arb_step(), 1..20), last in arb_step()) {
        let mut view = TaskView::new();
        let mut ids = Vec::new();
        for (n, step) in steps.iter().chain(std::iter::once(&last)).enumerate() {
            let action = match step {
                Step::Add(title) => {
                    let id = TaskId::persisted(format!("r{n}"));
                    ids.push(id.clone());
                    Action::Add(Task::from_new(id, "alice", NewTask::titled(title.clone()), Timestamp::from_millis(n as u64)))
                }
                Step::Rename(i, title) => match pick(&ids, *i) {
                    Some(id) => Action::Update { id, patch: TaskPatch::title(title.clone()) },
                    None => continue,
                },
                Step::Complete(i) => match pick(&ids, *i) {
                    Some(id) => Action::Complete { id, at: Timestamp::from_millis(n as u64) },
                    None => continue,
                },
                Step::Uncomplete(i) => match pick(&ids, *i) {
                    Some(id) => Action::Uncomplete { id },
                    None => continue,
                },
                Step::Delete(i) => match pick(&ids, *i) {
                    Some(id) => Action::Delete { id },
                    None => continue,
                },
            };
            let before = view.clone();
            if let Ok(inverse) = view.apply(action) {
                let mut undone = view.clone();
                undone.apply(inverse).unwrap();
                prop_assert_eq!(undone, before);
            }
        }
    }
}
