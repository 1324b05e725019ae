//! Integration tests: the full fold pipeline (events → reducers → statements
//! → SQLite rows).
//!
//! Covers:
//!   - Create statements materializing complete rows
//!   - Changed events with nothing to set reducing to no-ops
//!   - Updates touching only the named columns
//!   - Deletes conditioned on exactly (id, instance_id)
//!   - Owner- and instance-removal cascades scoped to their tenant
//!   - Per-aggregate ordering, multi-op statements, multi-cycle resume

use fixtures::*;

use silt_core::config::RunnerConfig;
use silt_core::event::{EventSource, MemoryEventSource};
use silt_core::runner::ProjectionRunner;
use std::sync::Arc;

#[test]
fn added_event_materializes_a_full_row() {
    let source = Arc::new(MemoryEventSource::new());
    source
        .append(action_added("instance-id", "org-1", "action-1", 15, "name"))
        .unwrap();

    let mut runner = actions_runner(mem_conn(), Arc::clone(&source));
    let report = runner.run_cycle().unwrap();
    assert_eq!(report.applied, 1);

    let row = action_row(runner.connection(), "instance-id", "action-1").unwrap();
    assert_eq!(
        row,
        ActionRow {
            id: "action-1".into(),
            creation_date: micros(ts(15)),
            change_date: micros(ts(15)),
            resource_owner: "org-1".into(),
            instance_id: "instance-id".into(),
            sequence: 15,
            name: "name".into(),
            script: "name(){}".into(),
            timeout: 3,
            allowed_to_fail: true,
            action_state: ACTION_STATE_ACTIVE,
        }
    );
}

#[test]
fn changed_event_with_only_an_empty_name_is_a_no_op() {
    let source = Arc::new(MemoryEventSource::new());
    source
        .append(action_added("i1", "org-1", "a1", 1, "original"))
        .unwrap();
    source
        .append(action_changed(
            "i1",
            "a1",
            2,
            &ActionChanged {
                name: Some(String::new()),
                ..ActionChanged::default()
            },
        ))
        .unwrap();

    let mut runner = actions_runner(mem_conn(), Arc::clone(&source));
    let report = runner.run_cycle().unwrap();
    assert_eq!(report.applied, 1);
    assert_eq!(report.no_ops, 1);
    assert_eq!(report.position, 2, "a no-op still consumes its event");

    let row = action_row(runner.connection(), "i1", "a1").unwrap();
    assert_eq!(row.name, "original");
    assert_eq!(row.change_date, micros(ts(1)), "the store must be untouched");
    assert_eq!(row.sequence, 1);
}

#[test]
fn changed_event_updates_only_named_columns() {
    let source = Arc::new(MemoryEventSource::new());
    source
        .append(action_added("i1", "org-1", "a1", 1, "before"))
        .unwrap();
    source
        .append(action_changed(
            "i1",
            "a1",
            2,
            &ActionChanged {
                script: Some("patched(){}".into()),
                ..ActionChanged::default()
            },
        ))
        .unwrap();

    let mut runner = actions_runner(mem_conn(), Arc::clone(&source));
    drain(&mut runner);

    let row = action_row(runner.connection(), "i1", "a1").unwrap();
    assert_eq!(row.name, "before");
    assert_eq!(row.script, "patched(){}");
    assert_eq!(row.sequence, 2);
    assert_eq!(row.change_date, micros(ts(2)));
    assert_eq!(row.creation_date, micros(ts(1)), "creation date never moves");
}

#[test]
fn removed_event_deletes_by_id_and_instance_only() {
    let source = Arc::new(MemoryEventSource::new());
    // The same action id exists in two instances; only one copy may go.
    source
        .append(action_added("inst-a", "org-1", "shared", 1, "a-copy"))
        .unwrap();
    source
        .append(action_added("inst-b", "org-1", "shared", 1, "b-copy"))
        .unwrap();
    source
        .append(action_added("inst-a", "org-1", "bystander", 1, "stays"))
        .unwrap();
    source.append(action_removed("inst-a", "shared", 2)).unwrap();

    let mut runner = actions_runner(mem_conn(), Arc::clone(&source));
    drain(&mut runner);

    assert!(action_row(runner.connection(), "inst-a", "shared").is_none());
    assert!(action_row(runner.connection(), "inst-b", "shared").is_some());
    assert!(action_row(runner.connection(), "inst-a", "bystander").is_some());
    assert_eq!(count_rows(runner.connection(), "projections_actions2"), 2);
}

#[test]
fn deactivate_and_reactivate_flip_the_state_column() {
    let source = Arc::new(MemoryEventSource::new());
    source
        .append(action_added("i1", "org-1", "a1", 1, "toggler"))
        .unwrap();
    source
        .append(action_event("i1", "a1", 2, "action.deactivated"))
        .unwrap();

    let mut runner = actions_runner(mem_conn(), Arc::clone(&source));
    drain(&mut runner);
    let row = action_row(runner.connection(), "i1", "a1").unwrap();
    assert_eq!(row.action_state, ACTION_STATE_INACTIVE);
    assert_eq!(row.sequence, 2);

    source
        .append(action_event("i1", "a1", 3, "action.reactivated"))
        .unwrap();
    drain(&mut runner);
    let row = action_row(runner.connection(), "i1", "a1").unwrap();
    assert_eq!(row.action_state, ACTION_STATE_ACTIVE);
    assert_eq!(row.sequence, 3);
}

#[test]
fn org_removal_cascades_to_owned_rows_only() {
    let source = Arc::new(MemoryEventSource::new());
    source
        .append(action_added("instance-id", "agg-id", "owned", 1, "goes"))
        .unwrap();
    source
        .append(action_added("instance-id", "other-org", "foreign", 1, "stays"))
        .unwrap();
    source
        .append(action_added("other-instance", "agg-id", "twin", 1, "stays-too"))
        .unwrap();
    source.append(org_removed("instance-id", "agg-id", 2)).unwrap();

    let mut runner = actions_runner(mem_conn(), Arc::clone(&source));
    drain(&mut runner);

    assert!(action_row(runner.connection(), "instance-id", "owned").is_none());
    assert!(
        action_row(runner.connection(), "instance-id", "foreign").is_some(),
        "other owners in the same instance are untouched"
    );
    assert!(
        action_row(runner.connection(), "other-instance", "twin").is_some(),
        "the same owner id in another instance is untouched"
    );
}

#[test]
fn instance_removal_wipes_only_that_instance() {
    let source = Arc::new(MemoryEventSource::new());
    source
        .append(action_added("inst-a", "org-1", "a1", 1, "doomed"))
        .unwrap();
    source
        .append(action_added("inst-a", "org-2", "a2", 1, "doomed-too"))
        .unwrap();
    source
        .append(action_added("inst-b", "org-1", "b1", 1, "survivor"))
        .unwrap();
    source.append(instance_removed("inst-a", 1)).unwrap();

    let mut runner = actions_runner(mem_conn(), Arc::clone(&source));
    drain(&mut runner);

    assert_eq!(count_rows(runner.connection(), "projections_actions2"), 1);
    assert!(action_row(runner.connection(), "inst-b", "b1").is_some());
}

#[test]
fn per_aggregate_updates_apply_in_sequence_order() {
    let source = Arc::new(MemoryEventSource::new());
    source
        .append(action_added("i1", "org-1", "a1", 1, "v1"))
        .unwrap();
    source
        .append(action_added("i1", "org-1", "other", 1, "noise"))
        .unwrap();
    for (seq, name) in [(2, "v2"), (3, "v3")] {
        source
            .append(action_changed(
                "i1",
                "a1",
                seq,
                &ActionChanged {
                    name: Some(name.into()),
                    ..ActionChanged::default()
                },
            ))
            .unwrap();
    }

    let mut runner = actions_runner(mem_conn(), Arc::clone(&source));
    drain(&mut runner);

    let row = action_row(runner.connection(), "i1", "a1").unwrap();
    assert_eq!(row.name, "v3", "the latest update wins");
    assert_eq!(row.sequence, 3);
}

#[test]
fn small_batches_resume_across_cycles() {
    let source = Arc::new(MemoryEventSource::new());
    source
        .append(action_added("i1", "org-1", "a1", 1, "v1"))
        .unwrap();
    for seq in 2..=5u64 {
        source
            .append(action_changed(
                "i1",
                "a1",
                seq,
                &ActionChanged {
                    name: Some(format!("v{seq}")),
                    ..ActionChanged::default()
                },
            ))
            .unwrap();
    }

    let config = RunnerConfig {
        batch_limit: 2,
        ..fast_config()
    };
    let mut runner = ProjectionRunner::new(
        actions_schema(),
        actions_registry(),
        Arc::clone(&source) as Arc<dyn EventSource>,
        mem_conn(),
        config,
    )
    .unwrap();

    let positions: Vec<u64> = std::iter::from_fn(|| {
        let report = runner.run_cycle().unwrap();
        (!report.caught_up()).then_some(report.position)
    })
    .collect();
    assert_eq!(positions, vec![2, 4, 5]);

    let row = action_row(runner.connection(), "i1", "a1").unwrap();
    assert_eq!(row.name, "v5");
}

#[test]
fn trigger_event_applies_both_ops_of_the_group() {
    let source = Arc::new(MemoryEventSource::new());
    source
        .append(action_added("i1", "org-1", "a1", 1, "hooked"))
        .unwrap();
    source
        .append(trigger_added("i1", "a1", 2, Some("post_create")))
        .unwrap();

    let mut runner = actions_runner(mem_conn(), Arc::clone(&source));
    drain(&mut runner);

    let row = action_row(runner.connection(), "i1", "a1").unwrap();
    assert_eq!(row.change_date, micros(ts(2)));
    assert_eq!(row.sequence, 2);

    let trigger_type: String = runner
        .connection()
        .query_row(
            "SELECT trigger_type FROM projections_actions2_triggers \
             WHERE instance_id = ?1 AND action_id = ?2",
            ["i1", "a1"],
            |row| row.get(0),
        )
        .unwrap();
    assert_eq!(trigger_type, "post_create");
}

#[test]
fn events_of_unregistered_aggregates_never_reach_the_runner() {
    let source = Arc::new(MemoryEventSource::new());
    source
        .append(action_added("i1", "org-1", "a1", 1, "mine"))
        .unwrap();
    // A user-aggregate event in the same log; the actions registry has no
    // reducer for it, so the fetch filters exclude it.
    source
        .append(metadata_set("i1", "org-1", "user-1", "k", "v", 1))
        .unwrap();

    let mut runner = actions_runner(mem_conn(), Arc::clone(&source));
    let report = runner.run_cycle().unwrap();
    assert_eq!(report.fetched, 1);
    assert_eq!(report.applied, 1);
    assert_eq!(report.position, 1);
}
