//! Betterish: an optimistic task manager on the command line.
//!
//! Talks to a `betterish-store` server when a store URL is configured;
//! otherwise runs against an in-memory demo store seeded with a few tasks.
//! Configuration via CLI flags, environment variables, or config file
//! (`~/.config/betterish/config.toml`).
//!
//! ```bash
//! # Demo mode
//! cargo run --bin betterish -- list
//!
//! # Against a store server
//! cargo run --bin betterish -- --store-url ws://127.0.0.1:9400/ws \
//!     --owner alice add "Take out trash" --category household
//! ```

use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use betterish::config::{CliArgs, ClientConfig, Command, ListView, SubtaskAction};
use betterish::render;
use betterish::session::Session;
use betterish::store::DocumentStore;
use betterish::store::memory::MemoryStore;
use betterish::store::remote::RemoteStore;
use betterish::tasks::{TaskError, TaskEvent};
use betterish_proto::task::{
    Category, NewTask, Priority, Recurrence, TASKS_COLLECTION, Task, TaskId, Timestamp,
};
use clap::Parser;
use tokio::sync::mpsc;
use tracing_appender::non_blocking::WorkerGuard;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = CliArgs::parse();

    let config = match ClientConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Warning: failed to load config file: {e}");
            ClientConfig::default()
        }
    };

    // Logs go to a file so they never mix with command output.
    let _log_guard = init_logging(&cli.log_level, cli.log_file.as_deref());
    tracing::info!(owner = %config.owner, "betterish starting");

    let command = cli.command.unwrap_or(Command::List {
        view: ListView::All,
        json: false,
    });

    let result = match config.store_url.clone() {
        Some(url) => match RemoteStore::connect(&url, &config.owner, config.remote_options()).await {
            Ok(store) => run(Arc::new(store), &config, command).await,
            Err(e) => {
                eprintln!("Could not connect to {url}: {e}");
                return ExitCode::FAILURE;
            }
        },
        None => {
            tracing::info!("no store URL configured, using demo store");
            run(Arc::new(demo_store(&config.owner)), &config, command).await
        }
    };

    tracing::info!("betterish exiting");
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Initialize file-based logging.
///
/// Returns a [`WorkerGuard`] that must be held until shutdown to ensure all
/// buffered log entries are flushed.
fn init_logging(level: &str, file_path: Option<&Path>) -> Option<WorkerGuard> {
    let default_path = std::env::temp_dir().join("betterish.log");
    let log_path = file_path.unwrap_or(&default_path);

    let log_dir = log_path.parent()?;
    let file_name = log_path.file_name()?.to_str()?;

    let file_appender = tracing_appender::rolling::never(log_dir, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_writer(non_blocking)
        .with_env_filter(env_filter)
        .with_ansi(false)
        .init();

    Some(guard)
}

/// A store pre-filled with a few tasks for `owner`.
fn demo_store(owner: &str) -> MemoryStore {
    let store = MemoryStore::new();
    let now = Timestamp::now();
    let day = Duration::from_secs(24 * 60 * 60);
    let seeds = [
        ("demo_1", "Take out trash", Some(Category::Household), Priority::High, Some(Recurrence::Weekly(chrono::Weekday::Tue)), now),
        ("demo_2", "Call mom", Some(Category::Relationship), Priority::Medium, None, now.saturating_sub(day * 3)),
        ("demo_3", "Change furnace filter", Some(Category::Maintenance), Priority::Low, None, now.saturating_sub(day * 10)),
    ];
    for (id, title, category, priority, recurrence, created_at) in seeds {
        let new = NewTask {
            category,
            priority,
            recurrence,
            ..NewTask::titled(title)
        };
        let task = Task::from_new(TaskId::persisted(id), owner, new, created_at);
        store.insert(TASKS_COLLECTION, id, task.to_fields());
    }
    store
}

async fn run<S: DocumentStore + 'static>(
    store: Arc<S>,
    config: &ClientConfig,
    command: Command,
) -> Result<(), TaskError> {
    let (session, events) = Session::open(store, &config.owner, config.session_options()).await?;
    let controller = Arc::clone(session.controller());
    let format = config.timestamp_format.as_str();
    let now = Timestamp::now();

    let outcome = match command {
        Command::List { view, json } => {
            let tasks: Vec<Task> = controller.with_view(|v| {
                let picked = match view {
                    ListView::All => v.tasks(),
                    ListView::Active => v.active(now),
                    ListView::Completed => v.completed(),
                    ListView::Promises => v.past_promises(now),
                    ListView::Today => now.weekday().map_or_else(Vec::new, |day| v.due_on(day)),
                    ListView::Archived => v.archived(),
                    ListView::Projects => v.projects(),
                };
                picked.into_iter().cloned().collect()
            });
            print_tasks(&tasks, json, now, format);
            Ok(())
        }
        Command::Add {
            title,
            detail,
            category,
            priority,
            recurrence,
        } => {
            let new = NewTask {
                title,
                detail,
                category,
                priority: priority.unwrap_or_default(),
                recurrence,
            };
            controller.add(new).await.map(|id| println!("added {id}"))
        }
        Command::Complete { ids } => {
            let ids: Vec<TaskId> = ids.iter().map(|raw| TaskId::parse(raw)).collect();
            let results = controller.complete_many(&ids).await;
            report_each(&ids, results, "completed")
        }
        Command::Uncomplete { id } => controller
            .uncomplete(&TaskId::parse(&id))
            .await
            .map(|id| println!("reopened {id}")),
        Command::Delete { id } => controller
            .delete(&TaskId::parse(&id))
            .await
            .map(|id| println!("deleted {id}")),
        Command::Purge { id } => controller
            .purge(&TaskId::parse(&id))
            .await
            .map(|id| println!("purged {id}")),
        Command::Archive { ids, undo } => {
            let ids: Vec<TaskId> = ids.iter().map(|raw| TaskId::parse(raw)).collect();
            if undo {
                let mut results = Vec::with_capacity(ids.len());
                for id in &ids {
                    results.push(controller.unarchive(id).await);
                }
                report_each(&ids, results, "unarchived")
            } else {
                let results = controller.archive_many(&ids).await;
                report_each(&ids, results, "archived")
            }
        }
        Command::Project { id, subtasks } => controller
            .convert_to_project(&TaskId::parse(&id), &subtasks)
            .await
            .map(|id| println!("{id} is now a project")),
        Command::Subtask { id, action } => {
            let id = TaskId::parse(&id);
            let result = match action {
                SubtaskAction::Add { title } => controller.add_subtask(&id, &title).await,
                SubtaskAction::Done { n, undo } => controller.set_subtask_done(&id, n, !undo).await,
                SubtaskAction::Rename { n, title } => {
                    controller.rename_subtask(&id, n, &title).await
                }
            };
            result.map(|id| {
                if let Some(task) = controller.get(&id) {
                    println!("{}", render::task_line(&task, now, format));
                }
            })
        }
        Command::Snooze { id, hours } => {
            let until = now.saturating_add(Duration::from_secs(hours * 60 * 60));
            controller
                .snooze(&TaskId::parse(&id), Some(until))
                .await
                .map(|id| println!("snoozed {id} until {}", render::format_timestamp(until, format)))
        }
        Command::Search { query } => {
            let tasks: Vec<Task> =
                controller.with_view(|v| v.search(&query).into_iter().cloned().collect());
            print_tasks(&tasks, false, now, format);
            Ok(())
        }
        Command::Watch => {
            watch(&session, events, format).await;
            Ok(())
        }
    };

    for notice in controller.notices() {
        eprintln!("! {}", notice.message);
    }
    controller.clear_notices();
    session.close();
    outcome
}

/// Prints one line per id and returns the first failure.
fn report_each(
    ids: &[TaskId],
    results: Vec<Result<TaskId, TaskError>>,
    verb: &str,
) -> Result<(), TaskError> {
    let mut first_err = None;
    for (id, result) in ids.iter().zip(results) {
        match result {
            Ok(_) => println!("{verb} {id}"),
            Err(e) => {
                eprintln!("{id}: {e}");
                first_err.get_or_insert(e);
            }
        }
    }
    first_err.map_or(Ok(()), Err)
}

fn print_tasks(tasks: &[Task], json: bool, now: Timestamp, format: &str) {
    if json {
        let rows: Vec<_> = tasks.iter().map(render::task_json).collect();
        println!("{}", serde_json::Value::Array(rows));
        return;
    }
    if tasks.is_empty() {
        println!("No tasks.");
    }
    for task in tasks {
        println!("{}", render::task_line(task, now, format));
    }
}

/// Prints the active list whenever it changes, until Ctrl-C.
async fn watch<S: DocumentStore + 'static>(
    session: &Session<S>,
    mut events: mpsc::Receiver<TaskEvent>,
    format: &str,
) {
    let controller = session.controller();
    let print_active = || {
        let now = Timestamp::now();
        let tasks: Vec<Task> = controller.with_view(|v| v.active(now).into_iter().cloned().collect());
        println!("--- {} active ---", tasks.len());
        print_tasks(&tasks, false, now, format);
    };
    print_active();

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(TaskEvent::ViewChanged) => print_active(),
                Some(TaskEvent::Notice(notice)) => eprintln!("! {}", notice.message),
                Some(TaskEvent::Resolved { .. }) => {}
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("watch interrupted");
                break;
            }
        }
    }
}
