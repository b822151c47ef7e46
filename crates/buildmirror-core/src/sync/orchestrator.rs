//! Per-server sync engine.
//!
//! Reads are served from the local stores and only *schedule* refreshes.
//! A refresh walks the server's history pages newest first, records which
//! references changed, and queues the changed ids for proactive fat
//! loading on one of several lanes. Every few hours a full reindex walks
//! the whole history.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Weak};

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::config::SyncConfig;
use crate::error::{RemoteError, SyncError};
use crate::key::ServerMask;
use crate::model::remote::{DEFAULT_BRANCH, DEFAULT_BRANCH_ALIAS};
use crate::model::{
    BuildCondition, BuildRef, BuildRefCompacted, BuildSnapshot, CompactedBuild, FatBuildInput,
    TestPage,
};
use crate::remote::{RemoteCiClient, fetch_all_test_pages};
use crate::scheduler::Scheduler;
use crate::store::{Stores, SuiteHistory};
use crate::sync::budget::SyncBudget;
use crate::sync::lanes::ProactiveLanes;
use crate::timing::timed;

pub const ACTUALIZE_TASK: &str = "actualizeRecentBuilds";
pub const FULL_REINDEX_TASK: &str = "fullReindex";
pub const LOAD_TASK_PREFIX: &str = "loadFatBuilds";

/// Outcome of one history walk.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ActualizeReport {
    /// References whose stored value changed.
    pub saved: usize,
    /// References seen on all walked pages.
    pub checked: usize,
    /// Size of the mandatory set at the start.
    pub requested: usize,
    /// Mandatory ids not found on any walked page.
    pub remaining: usize,
    pub pages: usize,
    /// The walk stopped because its budget ran out.
    pub interrupted: bool,
}

impl fmt::Display for ActualizeReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "entries saved {}, builds checked {} on {} pages, needed to find {}, remained to find {}",
            self.saved, self.checked, self.pages, self.requested, self.remaining
        )?;
        if self.interrupted {
            f.write_str(" (interrupted)")?;
        }
        Ok(())
    }
}

/// Outcome of one proactive load batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LoadReport {
    /// Builds stored with a new revision.
    pub updated: usize,
    pub errors: usize,
    pub requested: usize,
}

impl LoadReport {
    pub const fn merge(&mut self, other: &Self) {
        self.updated += other.updated;
        self.errors += other.errors;
        self.requested += other.requested;
    }
}

impl fmt::Display for LoadReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "builds updated {} from {} requested, errors: {}",
            self.updated, self.requested, self.errors
        )
    }
}

/// Split queued/running ids into `(paginate, direct)`.
///
/// Ids more than `threshold` below the newest one are unlikely to appear on
/// the first history pages and are reloaded directly.
#[must_use]
pub fn split_stuck(ids: &[u32], threshold: u32) -> (HashSet<u32>, HashSet<u32>) {
    let Some(max) = ids.iter().copied().max() else {
        return (HashSet::new(), HashSet::new());
    };
    let floor = max.saturating_sub(threshold);
    ids.iter().copied().partition(|id| *id > floor)
}

/// Sync engine of one server.
pub struct SyncOrchestrator {
    server_id: String,
    server: ServerMask,
    remote: Arc<dyn RemoteCiClient>,
    stores: Arc<Stores>,
    scheduler: Arc<dyn Scheduler>,
    config: SyncConfig,
    lanes: ProactiveLanes,
    cancel: SyncBudget,
    me: Weak<Self>,
}

impl SyncOrchestrator {
    #[must_use]
    pub fn new(
        remote: Arc<dyn RemoteCiClient>,
        stores: Arc<Stores>,
        scheduler: Arc<dyn Scheduler>,
        config: SyncConfig,
    ) -> Arc<Self> {
        let server_id = remote.server_id().to_string();
        Arc::new_cyclic(|me| Self {
            server: ServerMask::for_server(&server_id),
            server_id,
            remote,
            stores,
            scheduler,
            lanes: ProactiveLanes::new(config.proactive_lanes),
            config,
            cancel: SyncBudget::unlimited(),
            me: me.clone(),
        })
    }

    #[must_use]
    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    #[must_use]
    pub const fn server(&self) -> ServerMask {
        self.server
    }

    #[must_use]
    pub fn stores(&self) -> &Stores {
        &self.stores
    }

    /// Scheduler task name, unique per server.
    #[must_use]
    pub fn task_name(&self, operation: &str) -> String {
        format!("{operation}.{}", self.server_id)
    }

    /// Ids queued for proactive loading and not drained yet.
    #[must_use]
    pub fn pending_loads(&self) -> usize {
        self.lanes.pending()
    }

    /// Stop running and future walks at their next page boundary.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Schedule `run` on this orchestrator, skipping it if the
    /// orchestrator is gone by then.
    fn schedule_self(
        &self,
        operation: &str,
        delay: std::time::Duration,
        run: impl FnOnce(&Self) + Send + 'static,
    ) -> bool {
        let me = self.me.clone();
        self.scheduler.schedule_named(
            &self.task_name(operation),
            delay,
            Box::new(move || {
                if let Some(this) = me.upgrade() {
                    run(&this);
                }
            }),
        )
    }

    // -----------------------------------------------------------------------
    // Read API
    // -----------------------------------------------------------------------

    /// Stored history, filtered by build type and branch.
    ///
    /// Schedules a refresh of recent builds. `<default>` stands for
    /// `refs/heads/master`.
    ///
    /// # Errors
    ///
    /// Returns an error if the store read fails.
    pub fn get_build_history(
        &self,
        build_type_id: Option<&str>,
        branch: Option<&str>,
    ) -> Result<Vec<BuildRef>, SyncError> {
        self.schedule_actualize();
        let branch = branch.map(|b| if b == DEFAULT_BRANCH_ALIAS { DEFAULT_BRANCH } else { b });
        Ok(self
            .stores
            .refs
            .find_builds_in_history(self.server, build_type_id, branch)?)
    }

    /// Stored fat build, reloaded first when absent or outdated.
    ///
    /// A failed reload falls back to the stored record when there is one.
    ///
    /// # Errors
    ///
    /// Returns the reload error when nothing is stored.
    pub fn get_fat_build(&self, build_id: u32) -> Result<CompactedBuild, SyncError> {
        timed("get_fat_build", || {
            let existing = self.stores.fat.get_fat_build(self.server.key(build_id))?;
            if let Some(found) = existing.as_ref().filter(|b| !b.is_outdated_entity_version()) {
                return Ok(found.clone());
            }

            match self.reload_build(build_id, existing.as_ref()) {
                Ok(Some(saved)) => Ok(saved),
                Ok(None) => existing.ok_or(SyncError::BuildNotFound(build_id)),
                Err(err) => match existing {
                    Some(stale) => {
                        warn!(server = %self.server_id, build = build_id, error = %err,
                            "reload failed, serving stale record");
                        Ok(stale)
                    }
                    None => Err(err),
                },
            }
        })
    }

    /// # Errors
    ///
    /// Returns an error if the store read fails.
    pub fn build_is_valid(&self, build_id: u32) -> Result<bool, SyncError> {
        Ok(self.stores.conditions.build_is_valid(self.server, build_id)?)
    }

    /// # Errors
    ///
    /// Returns an error if the store read fails.
    pub fn get_build_condition(&self, build_id: u32) -> Result<Option<BuildCondition>, SyncError> {
        Ok(self
            .stores
            .conditions
            .get_build_condition(self.server, build_id)?)
    }

    /// Returns whether the stored judgment changed.
    ///
    /// # Errors
    ///
    /// Returns an error if the store write fails.
    pub fn set_build_condition(&self, cond: BuildCondition) -> Result<bool, SyncError> {
        Ok(self.stores.conditions.set_build_condition(self.server, cond)?)
    }

    /// Test history of one build type.
    ///
    /// # Errors
    ///
    /// Returns an error if the store scan fails.
    pub fn suite_history(&self, build_type_id: &str) -> Result<Arc<SuiteHistory>, SyncError> {
        Ok(self.stores.fat.suite_history(self.server, build_type_id)?)
    }

    /// # Errors
    ///
    /// Returns an error if the store read fails.
    pub fn build_start_times(&self, ids: &[u32]) -> Result<HashMap<u32, i64>, SyncError> {
        Ok(self.stores.fat.build_start_times(self.server, ids)?)
    }

    /// Queue a build on the server and index it right away.
    ///
    /// # Errors
    ///
    /// Returns an error if the server rejects the build or the walk fails.
    pub fn trigger_build(
        &self,
        build_type_id: &str,
        branch: &str,
        clean_rebuild: bool,
        queue_at_top: bool,
    ) -> Result<BuildSnapshot, SyncError> {
        let build = self
            .remote
            .trigger_build(build_type_id, branch, clean_rebuild, queue_at_top)?;
        let mut mandatory = HashSet::from([build.id]);
        let report = self.run_actualize_builds(false, &mut mandatory, &self.cancel)?;
        info!(server = %self.server_id, build = build.id, %report, "triggered build indexed");
        Ok(build)
    }

    // -----------------------------------------------------------------------
    // History walks
    // -----------------------------------------------------------------------

    /// Schedule [`Self::actualize_recent_builds`] unless already pending.
    pub fn schedule_actualize(&self) -> bool {
        self.schedule_self(ACTUALIZE_TASK, self.config.actualize_delay(), |this| {
            if let Err(err) = this.actualize_recent_builds() {
                error!(server = %this.server_id, error = %err, "actualize recent builds failed");
            }
        })
    }

    /// Refresh builds still queued or running locally.
    ///
    /// Recent ones are searched for in the history pages; stuck ones, and
    /// recent ones the walk did not reach, are reloaded directly. A full
    /// reindex is always scheduled afterwards.
    ///
    /// # Errors
    ///
    /// Returns an error if the store read or the walk fails.
    pub fn actualize_recent_builds(&self) -> Result<ActualizeReport, SyncError> {
        let result = self.actualize_recent_builds_inner();
        self.schedule_resync();
        result
    }

    fn actualize_recent_builds_inner(&self) -> Result<ActualizeReport, SyncError> {
        let active: Vec<u32> = self
            .stores
            .refs
            .get_queued_and_running(self.server)?
            .iter()
            .map(|r| r.id)
            .collect();
        let (mut paginate, direct) = split_stuck(&active, self.config.stuck_threshold);
        if !direct.is_empty() {
            debug!(server = %self.server_id, stuck = direct.len(), "reloading stuck builds directly");
        }
        self.schedule_builds_load(direct);

        // Ids the walk did not resolve are reloaded directly, even when the
        // walk itself failed part way.
        let walked = self.run_actualize_builds(false, &mut paginate, &self.cancel);
        if !paginate.is_empty() {
            debug!(server = %self.server_id, missed = paginate.len(), "reloading unresolved builds directly");
            self.schedule_builds_load(paginate);
        }
        walked
    }

    /// Walk history pages from the first one.
    ///
    /// Changed references are queued for fat loading and found ids are
    /// removed from `mandatory`. An incremental walk stops after a page
    /// past the first that changed nothing once `mandatory` is empty; a
    /// full reindex walks every page. The budget is checked between pages.
    ///
    /// # Errors
    ///
    /// Returns the first remote or store error; pages before it stay saved.
    pub fn run_actualize_builds(
        &self,
        full_reindex: bool,
        mandatory: &mut HashSet<u32>,
        budget: &SyncBudget,
    ) -> Result<ActualizeReport, SyncError> {
        timed("run_actualize_builds", || {
            let mut report = ActualizeReport {
                requested: mandatory.len(),
                ..ActualizeReport::default()
            };
            let mut next: Option<String> = None;

            loop {
                if report.pages > 0 && budget.exhausted() {
                    report.interrupted = true;
                    break;
                }
                let page = self.remote.get_build_refs(next.as_deref())?;
                let changed = self.stores.refs.save_chunk(self.server, &page.refs)?;

                report.pages += 1;
                report.saved += changed.len();
                report.checked += page.refs.len();
                for r in &page.refs {
                    mandatory.remove(&r.id);
                }
                debug!(
                    server = %self.server_id,
                    page = report.pages,
                    refs = page.refs.len(),
                    changed = changed.len(),
                    "history page"
                );
                let changed_count = changed.len();
                self.schedule_builds_load(changed.into_iter().map(|k| k.build_id()));

                next = page.next_page;
                if next.is_none() {
                    break;
                }
                if !full_reindex && report.pages > 1 && changed_count == 0 && mandatory.is_empty() {
                    break;
                }
            }

            report.remaining = mandatory.len();
            info!(server = %self.server_id, full_reindex, %report, "history walk finished");
            Ok(report)
        })
    }

    /// Schedule [`Self::schedule_full_reindex`] after the resync delay.
    pub fn schedule_resync(&self) {
        let me = self.me.clone();
        self.scheduler.invoke_later(
            self.config.resync_after(),
            Box::new(move || {
                if let Some(this) = me.upgrade() {
                    this.schedule_full_reindex();
                }
            }),
        );
    }

    /// Schedule a full reindex unless one is already pending.
    pub fn schedule_full_reindex(&self) -> bool {
        self.schedule_self(FULL_REINDEX_TASK, self.config.full_reindex_delay(), |this| {
            if let Err(err) = this.full_reindex() {
                error!(server = %this.server_id, error = %err, "full reindex failed");
            }
        })
    }

    /// Walk the whole history within the configured resync timeout.
    ///
    /// # Errors
    ///
    /// Returns the first remote or store error.
    pub fn full_reindex(&self) -> Result<ActualizeReport, SyncError> {
        let budget = self.cancel.child(self.config.resync_timeout());
        self.run_actualize_builds(true, &mut HashSet::new(), &budget)
    }

    // -----------------------------------------------------------------------
    // Proactive fat loading
    // -----------------------------------------------------------------------

    /// Queue ids on a random lane and schedule that lane's drain.
    pub fn schedule_builds_load(&self, ids: impl IntoIterator<Item = u32>) {
        let ids: Vec<u32> = ids.into_iter().collect();
        if ids.is_empty() {
            return;
        }
        let lane = self.lanes.pick();
        self.lanes.add(lane, ids);
        self.schedule_self(
            &format!("{LOAD_TASK_PREFIX}{lane}"),
            self.config.lane_delay(),
            move |this| {
                let report = this.load_fat_builds(lane);
                if report.requested > 0 {
                    info!(server = %this.server_id, lane, %report, "proactive load finished");
                }
            },
        );
    }

    /// Reload every stored record written under an older entity version.
    ///
    /// Returns how many ids were queued.
    ///
    /// # Errors
    ///
    /// Returns an error if the store scan fails.
    pub fn schedule_outdated_reload(&self) -> Result<usize, SyncError> {
        let outdated = self.stores.fat.outdated_version_entries(self.server)?;
        let count = outdated.len();
        if count > 0 {
            info!(server = %self.server_id, count, "scheduling reload of outdated builds");
        }
        self.schedule_builds_load(outdated);
        Ok(count)
    }

    /// Drain one lane and load what it held.
    pub fn load_fat_builds(&self, lane: usize) -> LoadReport {
        let ids = self.lanes.take(lane);
        match self.do_load_builds(&ids) {
            Ok(report) => report,
            Err(err) => {
                error!(server = %self.server_id, lane, error = %err, "proactive load failed");
                LoadReport {
                    updated: 0,
                    errors: ids.len(),
                    requested: ids.len(),
                }
            }
        }
    }

    /// Drain every lane now instead of waiting for the scheduled loads.
    pub fn load_all_pending(&self) -> LoadReport {
        (0..self.lanes.count())
            .map(|lane| self.load_fat_builds(lane))
            .fold(LoadReport::default(), |mut total, batch| {
                total.merge(&batch);
                total
            })
    }

    /// Reload each id; failures are logged and counted, not propagated.
    ///
    /// # Errors
    ///
    /// Returns an error only if the bulk read of existing records fails.
    pub fn do_load_builds(&self, ids: &HashSet<u32>) -> Result<LoadReport, SyncError> {
        let mut report = LoadReport {
            requested: ids.len(),
            ..LoadReport::default()
        };
        if ids.is_empty() {
            return Ok(report);
        }
        let ordered: Vec<u32> = ids.iter().copied().collect::<BTreeSet<_>>().into_iter().collect();

        timed("do_load_builds", || {
            let existing = self.stores.fat.get_all_fat_builds(self.server, &ordered)?;
            for id in ordered {
                match self.reload_build(id, existing.get(&id)) {
                    Ok(Some(_)) => report.updated += 1,
                    Ok(None) => {}
                    Err(err) => {
                        error!(server = %self.server_id, build = id, error = %err, "build load failed");
                        report.errors += 1;
                    }
                }
            }
            Ok(report)
        })
    }

    /// Fetch a build with all its test pages and merge it into the store.
    ///
    /// A build the server no longer knows is stored as a terminal copy of
    /// `existing` (or a stub when there is none) so it stops being polled.
    /// Returns the stored record when its content changed.
    ///
    /// # Errors
    ///
    /// Returns remote errors other than not-found, and store errors.
    pub fn reload_build(
        &self,
        build_id: u32,
        existing: Option<&CompactedBuild>,
    ) -> Result<Option<CompactedBuild>, SyncError> {
        let (build, pages) = match self.fetch_build(build_id) {
            Ok(fetched) => fetched,
            Err(err) if err.is_not_found() => {
                info!(server = %self.server_id, build = build_id, error = %err,
                    "build gone from server, storing terminal copy");
                self.terminal_copy(build_id, existing)
            }
            Err(err) => {
                error!(server = %self.server_id, build = build_id, error = %err, "loading build failed");
                return Err(err.into());
            }
        };

        let input = FatBuildInput::from_snapshot(&build, &pages);
        let saved = self
            .stores
            .fat
            .save_build(self.server.key(build_id), &input, existing)?;
        if let Some(saved) = &saved {
            self.stores
                .refs
                .save(self.server, &BuildRefCompacted::from_build(saved))?;
        }
        Ok(saved)
    }

    fn fetch_build(&self, build_id: u32) -> Result<(BuildSnapshot, Vec<TestPage>), RemoteError> {
        let build = self.remote.get_build(build_id)?;
        let pages = fetch_all_test_pages(self.remote.as_ref(), build_id, !build.composite)?;
        Ok((build, pages))
    }

    fn terminal_copy(
        &self,
        build_id: u32,
        existing: Option<&CompactedBuild>,
    ) -> (BuildSnapshot, Vec<TestPage>) {
        let compactor = self.stores.compactor.as_ref();
        match existing {
            Some(stored) => {
                let mut build = stored.to_snapshot(compactor);
                if build.state.is_active() {
                    build.set_cancelled();
                }
                (build, vec![stored.test_page(compactor)])
            }
            None => (BuildSnapshot::fake_stub(build_id), Vec::new()),
        }
    }
}
