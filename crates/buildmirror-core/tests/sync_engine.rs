//! End-to-end behavior of the sync engine against a scripted server.

mod support;

use std::collections::HashSet;

use buildmirror_core::model::remote::{TEST_FAILURE, TEST_SUCCESS};
use buildmirror_core::model::{BuildCondition, BuildState, LATEST_ENTITY_VERSION};
use buildmirror_core::sync::SyncBudget;
use support::{Harness, SERVER, build_ref, snapshot, test_page};

fn finished_pages(ids: &[&[u32]]) -> Vec<Vec<buildmirror_core::model::BuildRef>> {
    ids.iter()
        .map(|page| page.iter().map(|id| build_ref(*id, BuildState::Finished)).collect())
        .collect()
}

#[test]
fn full_reindex_walks_past_unchanged_interior_page() {
    let h = Harness::in_memory();
    h.remote.set_pages(finished_pages(&[&[60, 50], &[40, 30], &[20, 10]]));

    // Interior page already mirrored and unchanged.
    h.stores
        .refs
        .save_chunk(
            h.sync.server(),
            &[build_ref(40, BuildState::Finished), build_ref(30, BuildState::Finished)],
        )
        .expect("seed refs");

    let report = h.sync.full_reindex().expect("full reindex");
    assert_eq!(report.pages, 3);
    assert_eq!(report.checked, 6);
    assert_eq!(report.saved, 4);
    assert!(!report.interrupted);
}

#[test]
fn incremental_walk_stops_at_first_unchanged_page_after_the_first() {
    let h = Harness::in_memory();
    h.remote.set_pages(finished_pages(&[&[60, 50], &[40, 30], &[20, 10]]));
    h.stores
        .refs
        .save_chunk(
            h.sync.server(),
            &[build_ref(40, BuildState::Finished), build_ref(30, BuildState::Finished)],
        )
        .expect("seed refs");

    let report = h
        .sync
        .run_actualize_builds(false, &mut HashSet::new(), &SyncBudget::unlimited())
        .expect("walk");
    assert_eq!(report.pages, 2);
    assert_eq!(report.saved, 2);
    assert_eq!(h.remote.pages_served(), 2);
}

#[test]
fn incremental_walk_never_stops_on_the_first_page() {
    let h = Harness::in_memory();
    h.remote.set_pages(finished_pages(&[&[60], &[50], &[40]]));
    h.stores
        .refs
        .save_chunk(h.sync.server(), &[build_ref(60, BuildState::Finished)])
        .expect("seed refs");

    let report = h
        .sync
        .run_actualize_builds(false, &mut HashSet::new(), &SyncBudget::unlimited())
        .expect("walk");
    // Page 1 unchanged, page 2 changed, page 3 changed.
    assert_eq!(report.pages, 3);
    assert_eq!(report.saved, 2);
}

#[test]
fn mandatory_set_converges_to_unfound_ids() {
    let h = Harness::in_memory();
    h.remote.set_pages(finished_pages(&[&[9, 8], &[5, 4]]));

    let mut mandatory = HashSet::from([5, 9, 20]);
    let report = h
        .sync
        .run_actualize_builds(false, &mut mandatory, &SyncBudget::unlimited())
        .expect("walk");
    assert_eq!(report.requested, 3);
    assert_eq!(report.remaining, 1);
    assert_eq!(mandatory, HashSet::from([20]));
}

#[test]
fn exhausted_budget_stops_between_pages() {
    let h = Harness::in_memory();
    h.remote.set_pages(finished_pages(&[&[3], &[2], &[1]]));
    let budget = SyncBudget::unlimited();
    budget.cancel();

    let report = h
        .sync
        .run_actualize_builds(true, &mut HashSet::new(), &budget)
        .expect("walk");
    assert_eq!(report.pages, 1);
    assert!(report.interrupted);
    assert_eq!(report.saved, 1);
}

#[test]
fn changed_refs_are_loaded_proactively_and_idempotently() {
    let h = Harness::in_memory();
    h.remote.set_pages(finished_pages(&[&[2, 1]]));
    for id in [1, 2] {
        h.remote.put_build(
            snapshot(id, "Ignite_Cache1", BuildState::Finished),
            vec![test_page(&[("CacheTest.testPut", TEST_SUCCESS)])],
        );
    }

    h.sync.full_reindex().expect("walk");
    assert_eq!(h.sync.pending_loads(), 2);
    assert!(h.drain_loads() >= 1);
    assert_eq!(h.sync.pending_loads(), 0);

    let stored = h.sync.get_fat_build(2).expect("stored");
    assert_eq!(stored.revision, 1);
    assert_eq!(stored.tests.len(), 1);

    let again = h.sync.do_load_builds(&HashSet::from([1, 2])).expect("reload");
    assert_eq!(again.updated, 0);
    assert_eq!(again.errors, 0);
    assert_eq!(again.requested, 2);
}

#[test]
fn pending_lanes_can_be_drained_inline() {
    let h = Harness::in_memory();
    h.remote.set_pages(finished_pages(&[&[3, 2, 1]]));
    for id in [1, 2] {
        h.remote
            .put_build(snapshot(id, "Ignite_Cache1", BuildState::Finished), vec![]);
    }
    h.remote.fail_build(3);

    h.sync.full_reindex().expect("walk");
    let report = h.sync.load_all_pending();
    assert_eq!(report.requested, 3);
    assert_eq!(report.updated, 2);
    assert_eq!(report.errors, 1);
    assert_eq!(h.sync.pending_loads(), 0);

    // The scheduled tasks still run but find their lanes empty.
    h.drain_loads();
    assert_eq!(h.remote.fetched_builds(), vec![1, 2, 3]);
}

#[test]
fn revisions_increase_with_each_distinct_save() {
    let h = Harness::in_memory();
    let mut build = snapshot(7, "Ignite_Cache1", BuildState::Running);
    h.remote.put_build(build.clone(), vec![]);

    let first = h.sync.reload_build(7, None).expect("load").expect("stored");
    assert_eq!(first.revision, 1);

    build.state = BuildState::Finished;
    build.finish_date = Some(1_700_000_900_000);
    h.remote.put_build(build, vec![test_page(&[("t", TEST_FAILURE)])]);
    let second = h.sync.reload_build(7, Some(&first)).expect("load").expect("stored");
    assert_eq!(second.revision, 2);

    let unchanged = h.sync.reload_build(7, Some(&second)).expect("load");
    assert!(unchanged.is_none());

    let r = h.stores.refs.get(h.sync.server(), 7).expect("ref").expect("present");
    assert_eq!(r.state, BuildState::Finished);
}

#[test]
fn vanished_running_build_is_stored_cancelled_with_its_tests() {
    let h = Harness::in_memory();
    h.remote.put_build(
        snapshot(11, "Ignite_Cache1", BuildState::Running),
        vec![test_page(&[("a", TEST_SUCCESS), ("b", TEST_FAILURE)])],
    );
    let existing = h.sync.reload_build(11, None).expect("load").expect("stored");
    assert!(existing.is_running());

    h.remote.forget_build(11);
    let saved = h
        .sync
        .reload_build(11, Some(&existing))
        .expect("not found is recovered")
        .expect("terminal copy stored");
    assert_eq!(saved.state, BuildState::Finished);
    assert!(saved.cancelled);
    assert_eq!(saved.tests.len(), 2);
    assert!(!saved.fake_stub);

    let r = h.stores.refs.get(h.sync.server(), 11).expect("ref").expect("present");
    assert_eq!(r.state, BuildState::Finished);
}

#[test]
fn unknown_build_becomes_a_fake_stub() {
    let h = Harness::in_memory();
    let stub = h.sync.get_fat_build(404).expect("stub stored");
    assert!(stub.fake_stub);
    assert_eq!(stub.state, BuildState::Finished);
    assert!(stub.tests.is_empty());
    assert!(h.stores.fat.contains_key(h.sync.server().key(404)).expect("contains"));
}

#[test]
fn composite_builds_skip_test_details() {
    let h = Harness::in_memory();
    let mut chain = snapshot(20, "Ignite_RunAll", BuildState::Finished);
    chain.composite = true;
    h.remote.put_build(
        chain,
        vec![test_page(&[("Cache.a", TEST_SUCCESS), ("Cache.b", TEST_FAILURE)])],
    );
    h.remote.put_build(
        snapshot(21, "Ignite_Cache1", BuildState::Finished),
        vec![test_page(&[("Cache.a", TEST_FAILURE)])],
    );

    let composite = h.sync.get_fat_build(20).expect("composite");
    assert!(composite.composite);
    assert_eq!(composite.tests.len(), 2);
    assert_eq!(h.remote.details_requested(20), vec![false]);

    h.sync.get_fat_build(21).expect("plain");
    assert_eq!(h.remote.details_requested(21), vec![true]);
}

#[test]
fn transient_failures_serve_stale_data_and_count_as_errors() {
    let h = Harness::in_memory();
    h.remote.put_build(snapshot(3, "Ignite_Cache1", BuildState::Finished), vec![]);
    let mut stored = h.sync.get_fat_build(3).expect("load");

    stored.entity_version = LATEST_ENTITY_VERSION - 1;
    h.stores
        .fat
        .put_fat_build(h.sync.server().key(3), &stored)
        .expect("downgrade");
    h.remote.fail_build(3);

    let stale = h.sync.get_fat_build(3).expect("stale fallback");
    assert!(stale.is_outdated_entity_version());

    let report = h.sync.do_load_builds(&HashSet::from([3])).expect("load batch");
    assert_eq!(report.errors, 1);
    assert_eq!(report.updated, 0);

    h.remote.fail_build(99);
    assert!(h.sync.get_fat_build(99).is_err());
}

#[test]
fn outdated_records_are_queued_and_rewritten() {
    let h = Harness::in_memory();
    h.remote.put_build(snapshot(5, "Ignite_Cache1", BuildState::Finished), vec![]);
    let mut stored = h.sync.get_fat_build(5).expect("load");
    stored.entity_version = LATEST_ENTITY_VERSION - 1;
    h.stores
        .fat
        .put_fat_build(h.sync.server().key(5), &stored)
        .expect("downgrade");

    assert_eq!(h.sync.schedule_outdated_reload().expect("scan"), 1);
    h.drain_loads();

    let fresh = h
        .stores
        .fat
        .get_fat_build(h.sync.server().key(5))
        .expect("get")
        .expect("present");
    assert!(!fresh.is_outdated_entity_version());
    assert_eq!(fresh.revision, stored.revision + 1);
    assert!(h.stores.fat.outdated_version_entries(h.sync.server()).expect("scan").is_empty());
}

#[test]
fn actualize_reloads_stuck_builds_directly_and_schedules_resync() {
    let h = Harness::in_memory();
    let server = h.sync.server();
    h.stores
        .refs
        .save_chunk(
            server,
            &[
                build_ref(100, BuildState::Running),
                build_ref(3050, BuildState::Running),
                build_ref(3200, BuildState::Queued),
            ],
        )
        .expect("seed refs");
    h.remote.set_pages(finished_pages(&[&[3200, 3050]]));
    for id in [100, 3050, 3200] {
        h.remote
            .put_build(snapshot(id, "Ignite_Cache1", BuildState::Finished), vec![]);
    }

    let report = h.sync.actualize_recent_builds().expect("actualize");
    assert_eq!(report.requested, 2);
    assert_eq!(report.remaining, 0);
    assert_eq!(report.saved, 2);

    h.drain_loads();
    assert_eq!(h.remote.fetched_builds(), vec![100, 3050, 3200]);
    assert!(h.stores.refs.get_queued_and_running(server).expect("active").is_empty());

    // The resync hop is unnamed; running it schedules the named full reindex.
    let full = h.sync.task_name("fullReindex");
    assert!(!h.scheduler.is_pending(&full));
    h.scheduler.run_pending();
    assert!(h.scheduler.is_pending(&full));
}

#[test]
fn failed_walk_still_reloads_active_builds_directly() {
    let h = Harness::in_memory();
    let server = h.sync.server();
    h.stores
        .refs
        .save_chunk(
            server,
            &[build_ref(40, BuildState::Running), build_ref(41, BuildState::Queued)],
        )
        .expect("seed refs");
    h.remote.set_pages(finished_pages(&[&[41, 40]]));
    h.remote.fail_page(0);
    for id in [40, 41] {
        h.remote
            .put_build(snapshot(id, "Ignite_Cache1", BuildState::Finished), vec![]);
    }

    assert!(h.sync.actualize_recent_builds().is_err());
    assert_eq!(h.sync.pending_loads(), 2);

    h.drain_loads();
    assert_eq!(h.remote.fetched_builds(), vec![40, 41]);
    assert!(h.stores.refs.get_queued_and_running(server).expect("active").is_empty());
}

#[test]
fn history_reads_schedule_one_refresh_and_map_the_default_branch() {
    let h = Harness::in_memory();
    h.stores
        .refs
        .save_chunk(
            h.sync.server(),
            &[build_ref(1, BuildState::Finished), build_ref(2, BuildState::Finished)],
        )
        .expect("seed refs");

    let history = h
        .sync
        .get_build_history(Some("Ignite_Cache1"), Some("<default>"))
        .expect("history");
    assert_eq!(history.iter().map(|r| r.id).collect::<Vec<_>>(), vec![1, 2]);
    h.sync.get_build_history(None, None).expect("history");

    let actualize = format!("actualizeRecentBuilds.{SERVER}");
    assert_eq!(h.scheduler.pending_names(), vec![actualize]);
}

#[test]
fn triggered_build_is_indexed_immediately() {
    let h = Harness::in_memory();
    h.remote.set_pages(finished_pages(&[&[1]]));

    let queued = h
        .sync
        .trigger_build("Ignite_RunAll", "refs/heads/master", false, true)
        .expect("trigger");
    let r = h
        .stores
        .refs
        .get(h.sync.server(), queued.id)
        .expect("ref")
        .expect("indexed");
    assert_eq!(r.state, BuildState::Queued);
    assert_eq!(r.build_type_id, "Ignite_RunAll");
}

#[test]
fn conditions_default_to_valid() {
    let h = Harness::in_memory();
    assert!(h.sync.build_is_valid(8).expect("valid"));
    let changed = h
        .sync
        .set_build_condition(BuildCondition {
            build_id: 8,
            principal: "ci-bot".into(),
            is_valid: false,
            reason: Some("agent out of disk".into()),
            recorded_at: None,
        })
        .expect("set");
    assert!(changed);
    assert!(!h.sync.build_is_valid(8).expect("valid"));
    assert!(h.sync.get_build_condition(8).expect("get").is_some());
}

#[test]
fn flaky_tests_surface_through_suite_history() {
    let h = Harness::in_memory();
    let outcomes = [TEST_SUCCESS, TEST_FAILURE, TEST_SUCCESS, TEST_FAILURE];
    for (idx, status) in outcomes.iter().enumerate() {
        let id = u32::try_from(idx).expect("small") + 1;
        h.remote.put_build(
            snapshot(id, "Ignite_Cache1", BuildState::Finished),
            vec![test_page(&[("Flaky.test", *status), ("Stable.test", TEST_SUCCESS)])],
        );
        h.sync.reload_build(id, None).expect("load");
    }

    let history = h.sync.suite_history("Ignite_Cache1").expect("history");
    let flaky = history.flaky_tests(2);
    assert_eq!(flaky.len(), 1);
    let name = h.stores.compactor.id_if_present("Flaky.test").expect("interned");
    assert_eq!(flaky[0], (name, 3));

    let starts = h.sync.build_start_times(&[1, 2, 99]).expect("start times");
    assert_eq!(starts.len(), 2);
}
