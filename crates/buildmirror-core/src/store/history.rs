//! Per-suite test run history derived from stored fat builds.
//!
//! A [`SuiteHistory`] is computed on first request for a (server, build
//! type) pair and cached until a fat build of that suite is written again.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::StoreError;
use crate::key::ServerMask;
use crate::model::CompactedBuild;

/// Outcome of one build in a suite's history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildOutcome {
    pub status: Option<u32>,
    pub start_date: Option<i64>,
    pub test_count: usize,
}

/// One test in one build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TestRun {
    pub failed: bool,
    pub muted: bool,
    pub ignored: bool,
}

/// Runs of one test across builds, keyed by build id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TestHistory {
    pub runs: BTreeMap<u32, TestRun>,
}

impl TestHistory {
    /// Runs that count towards statistics (ignored runs do not).
    fn counted(&self) -> impl Iterator<Item = &TestRun> {
        self.runs.values().filter(|r| !r.ignored)
    }

    #[must_use]
    pub fn run_count(&self) -> usize {
        self.counted().count()
    }

    #[must_use]
    pub fn failure_count(&self) -> usize {
        self.counted().filter(|r| r.failed).count()
    }

    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn failure_rate(&self) -> f64 {
        let runs = self.run_count();
        if runs == 0 {
            return 0.0;
        }
        self.failure_count() as f64 / runs as f64
    }

    /// Status changes between consecutive counted runs, in build order.
    ///
    /// A test that alternates pass/fail has a high flip count even when its
    /// failure rate is moderate.
    #[must_use]
    pub fn flip_count(&self) -> usize {
        let outcomes: Vec<bool> = self.counted().map(|r| r.failed).collect();
        outcomes.windows(2).filter(|w| w[0] != w[1]).count()
    }
}

/// Test history of one build type on one server.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SuiteHistory {
    pub builds: BTreeMap<u32, BuildOutcome>,
    /// Keyed by interned test name.
    pub tests: HashMap<u32, TestHistory>,
}

impl SuiteHistory {
    /// Aggregate `builds`; stubs and cancelled builds carry no signal and
    /// are skipped. A test fails when its status is not `success_status`.
    pub fn collect<'a>(
        builds: impl IntoIterator<Item = &'a CompactedBuild>,
        success_status: Option<u32>,
    ) -> Self {
        let mut history = Self::default();
        for build in builds {
            if build.fake_stub || build.cancelled || build.state.is_active() {
                continue;
            }
            history.builds.insert(
                build.id,
                BuildOutcome {
                    status: build.status,
                    start_date: build.start_date,
                    test_count: build.tests.len(),
                },
            );
            for test in &build.tests {
                history.tests.entry(test.name).or_default().runs.insert(
                    build.id,
                    TestRun {
                        failed: Some(test.status) != success_status,
                        muted: test.muted,
                        ignored: test.ignored,
                    },
                );
            }
        }
        history
    }

    #[must_use]
    pub fn test(&self, name_id: u32) -> Option<&TestHistory> {
        self.tests.get(&name_id)
    }

    /// Tests that flipped at least `min_flips` times, most unstable first.
    #[must_use]
    pub fn flaky_tests(&self, min_flips: usize) -> Vec<(u32, usize)> {
        let mut flaky: Vec<(u32, usize)> = self
            .tests
            .iter()
            .map(|(name, h)| (*name, h.flip_count()))
            .filter(|(_, flips)| *flips >= min_flips)
            .collect();
        flaky.sort_unstable_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        flaky
    }
}

type SuiteKey = (ServerMask, u32);

#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<SuiteKey, Arc<SuiteHistory>>,
    /// Bumped on every invalidation, cached or not.
    generations: HashMap<SuiteKey, u64>,
}

impl CacheState {
    fn generation(&self, key: SuiteKey) -> u64 {
        self.generations.get(&key).copied().unwrap_or(0)
    }
}

/// Cache of computed histories.
#[derive(Debug, Default)]
pub struct RunHistoryCache {
    state: Mutex<CacheState>,
}

impl RunHistoryCache {
    /// Cached history, computing it with `compute` when absent.
    ///
    /// `compute` runs without the cache lock held. Its result is only cached
    /// if no invalidation of the suite happened meanwhile; otherwise it is
    /// returned to the caller and the next request computes again.
    ///
    /// # Errors
    ///
    /// Propagates errors from `compute`.
    pub fn get_or_compute(
        &self,
        server: ServerMask,
        build_type_id: u32,
        compute: impl FnOnce() -> Result<SuiteHistory, StoreError>,
    ) -> Result<Arc<SuiteHistory>, StoreError> {
        let key = (server, build_type_id);
        let started = {
            let state = self.lock()?;
            if let Some(found) = state.entries.get(&key) {
                return Ok(Arc::clone(found));
            }
            state.generation(key)
        };
        let computed = Arc::new(compute()?);
        let mut state = self.lock()?;
        if state.generation(key) == started {
            state.entries.insert(key, Arc::clone(&computed));
        } else {
            tracing::trace!(%server, build_type_id, "suite written during scan, not caching");
        }
        Ok(computed)
    }

    /// Drop the cached history of one suite.
    pub fn invalidate(&self, server: ServerMask, build_type_id: u32) {
        let key = (server, build_type_id);
        if let Ok(mut state) = self.state.lock() {
            *state.generations.entry(key).or_insert(0) += 1;
            if state.entries.remove(&key).is_some() {
                tracing::trace!(%server, build_type_id, "invalidated suite history");
            }
        }
    }

    #[must_use]
    pub fn is_cached(&self, server: ServerMask, build_type_id: u32) -> bool {
        self.state
            .lock()
            .is_ok_and(|s| s.entries.contains_key(&(server, build_type_id)))
    }

    fn lock(&self) -> Result<MutexGuard<'_, CacheState>, StoreError> {
        self.state
            .lock()
            .map_err(|_| StoreError::Poisoned("run history cache"))
    }
}
