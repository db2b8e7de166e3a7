//! Property-based tests for the task document mapping and wire codec.
//!
//! Uses proptest to verify:
//! 1. Any valid `Task` survives the task → document → task mapping.
//! 2. Random bytes never cause a panic in `decode` (returns `Err` gracefully).
//! 3. Query results always satisfy the filters, the ordering and the limit.
//! 4. `change_for` agrees with filter evaluation on both sides of a mutation.

use betterish_proto::codec;
use betterish_proto::document::{
    Change, Direction, Document, FieldValue, Fields, Filter, FilterOp, Query, change_for,
    matches_all,
};
use betterish_proto::store::{ClientFrame, ServerFrame};
use betterish_proto::task::{
    Category, NewTask, Priority, Recurrence, Subtask, Task, TaskId, Timestamp,
};
use chrono::Weekday;
use proptest::prelude::*;

// --- Strategies ---

fn arb_weekday() -> impl Strategy<Value = Weekday> {
    (0u8..7).prop_map(|n| Weekday::try_from(n).unwrap_or(Weekday::Mon))
}

fn arb_recurrence() -> impl Strategy<Value = Recurrence> {
    prop_oneof![
        Just(Recurrence::Daily),
        Just(Recurrence::Weekdays),
        Just(Recurrence::Weekends),
        arb_weekday().prop_map(Recurrence::Weekly),
        prop::collection::vec(arb_weekday(), 1..7).prop_map(Recurrence::SpecificDays),
    ]
}

fn arb_priority() -> impl Strategy<Value = Priority> {
    prop_oneof![Just(Priority::Low), Just(Priority::Medium), Just(Priority::High)]
}

fn arb_category() -> impl Strategy<Value = Category> {
    (0usize..Category::ALL.len()).prop_map(|i| Category::ALL[i])
}

/// Titles are already normalized (trimmed, non-empty).
fn arb_task() -> impl Strategy<Value = Task> {
    (
        "[a-z][a-z ]{0,30}[a-z]",
        prop::option::of("[a-z]{1,40}"),
        prop::option::of(arb_category()),
        arb_priority(),
        prop::option::of(any::<u64>()),
        any::<u64>(),
        prop::option::of(any::<u64>()),
        prop::option::of(arb_recurrence()),
        any::<bool>(),
        prop::collection::vec(("[a-z][a-z ]{0,10}[a-z]", prop::option::of(any::<u64>())), 0..4),
    )
        .prop_map(
            |(title, detail, category, priority, completed_at, created, snoozed, recurrence, archived, steps)| {
                let mut task = Task::from_new(
                    TaskId::persisted("srv_1"),
                    "owner",
                    NewTask {
                        title,
                        detail,
                        category,
                        priority,
                        recurrence,
                    },
                    Timestamp::from_millis(created),
                );
                task.completed_at = completed_at.map(Timestamp::from_millis);
                task.completed = task.completed_at.is_some();
                task.snoozed_until = snoozed.map(Timestamp::from_millis);
                task.archived = archived;
                task.is_project = !steps.is_empty();
                task.subtasks = steps
                    .into_iter()
                    .zip(1..)
                    .map(|((title, done), id)| Subtask {
                        completed_at: done.map(Timestamp::from_millis),
                        ..Subtask::new(id, &title)
                    })
                    .collect();
                task
            },
        )
}

fn arb_fields() -> impl Strategy<Value = Fields> {
    (
        prop_oneof![Just("alice"), Just("bob")],
        0u64..10,
        any::<bool>(),
    )
        .prop_map(|(owner, rank, done)| {
            let mut f = Fields::new();
            f.insert("owner".into(), FieldValue::Text(owner.into()));
            f.insert("rank".into(), FieldValue::Timestamp(rank));
            f.insert("done".into(), FieldValue::Bool(done));
            f
        })
}

fn arb_filter() -> impl Strategy<Value = Filter> {
    prop_oneof![
        prop_oneof![Just("alice"), Just("bob")].prop_map(|o| Filter::eq("owner", o)),
        (0u64..10).prop_map(|r| Filter::new("rank", FilterOp::Ge, FieldValue::Timestamp(r))),
        any::<bool>().prop_map(|d| Filter::new("done", FilterOp::Ne, d)),
    ]
}

// --- Property tests ---

proptest! {
    /// Any valid Task survives the document mapping.
    #[test]
    fn task_document_round_trip(task in arb_task()) {
        let doc = Document::new("srv_1", task.to_fields());
        let decoded = Task::from_document(&doc).expect("decode should succeed");
        prop_assert_eq!(task, decoded);
    }

    /// Random bytes never cause a panic when decoded as a client frame.
    #[test]
    fn random_bytes_decode_client_frame_no_panic(bytes in prop::collection::vec(any::<u8>(), 0..512)) {
        let _ = codec::decode::<ClientFrame>(&bytes);
    }

    /// Random bytes never cause a panic when decoded as a server frame.
    #[test]
    fn random_bytes_decode_server_frame_no_panic(bytes in prop::collection::vec(any::<u8>(), 0..512)) {
        let _ = codec::decode::<ServerFrame>(&bytes);
    }

    /// Query results satisfy every filter, are ordered, and respect the limit.
    #[test]
    fn query_select_is_sound(
        docs in prop::collection::vec(arb_fields(), 0..20),
        filters in prop::collection::vec(arb_filter(), 0..3),
        limit in 1u32..10,
    ) {
        let docs: Vec<Document> = docs
            .into_iter()
            .enumerate()
            .map(|(i, f)| Document::new(format!("doc_{i:02}"), f))
            .collect();
        let mut query = Query::new().order_by("rank", Direction::Descending).limit(limit);
        query.filters.clone_from(&filters);

        let selected = query.select(&docs);
        let expected_len = docs.iter().filter(|d| matches_all(&filters, &d.fields)).count();

        prop_assert_eq!(selected.len(), expected_len.min(limit as usize));
        for doc in &selected {
            prop_assert!(matches_all(&filters, &doc.fields));
        }
        for pair in selected.windows(2) {
            prop_assert!(pair[0].get("rank") >= pair[1].get("rank"));
        }
    }

    /// Subscribers see an upsert iff the new state matches, and a removal iff
    /// only the old state matched.
    #[test]
    fn change_for_agrees_with_filters(
        before in prop::option::of(arb_fields()),
        after in prop::option::of(arb_fields()),
        filters in prop::collection::vec(arb_filter(), 0..3),
    ) {
        let was = before.as_ref().is_some_and(|f| matches_all(&filters, f));
        let now = after.as_ref().is_some_and(|f| matches_all(&filters, f));
        let change = change_for("doc", before.as_ref(), after.as_ref(), &filters);
        match change {
            Some(Change::Upserted(doc)) => {
                prop_assert!(now);
                prop_assert_eq!(Some(doc.fields), after);
            }
            Some(Change::Removed { .. }) => prop_assert!(was && !now),
            None => prop_assert!(!now && !was),
        }
    }
}
