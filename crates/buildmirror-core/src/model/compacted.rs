//! Normalized, interned records kept in the store.
//!
//! A [`CompactedBuild`] merges everything known about one build (tests from
//! every page, problems, statistics, change ids) into a single value that is
//! replaced as a whole on every write. Equality is structural over the
//! content so that re-fetching an unchanged build never produces a write.

use std::collections::HashMap;
use std::collections::hash_map::Entry;

use serde::{Deserialize, Serialize};

use crate::compactor::StringCompactor;
use crate::error::StoreError;
use crate::model::remote::{
    BuildRef, BuildSnapshot, BuildState, ChangeRef, ProblemOccurrence, Statistics,
    StatisticsProperty, TestOccurrence, TestPage,
};

/// Schema version written into every new [`CompactedBuild`].
///
/// Bump this when normalization changes; older records are then reported by
/// `outdated_version_entries` and reloaded on read.
pub const LATEST_ENTITY_VERSION: u16 = 3;

pub const PROBLEM_EXECUTION_TIMEOUT: &str = "TC_EXECUTION_TIMEOUT";
pub const PROBLEM_JVM_CRASH: &str = "TC_JVM_CRASH";
pub const PROBLEM_OOME: &str = "TC_OOME";
pub const PROBLEM_EXIT_CODE: &str = "TC_EXIT_CODE";
pub const PROBLEM_FAILED_TESTS: &str = "TC_FAILED_TESTS";
pub const PROBLEM_SNAPSHOT_DEPENDENCY: &str = "SNAPSHOT_DEPENDENCY_ERROR_BUILD_PROCEEDS_TYPE";

// ---------------------------------------------------------------------------
// Input bundle
// ---------------------------------------------------------------------------

/// Raw pieces of one build, as fetched from the server.
#[derive(Debug, Clone, Copy)]
pub struct FatBuildInput<'a> {
    pub build: &'a BuildSnapshot,
    pub test_pages: &'a [TestPage],
    pub problems: Option<&'a [ProblemOccurrence]>,
    pub statistics: Option<&'a Statistics>,
    pub changes: Option<&'a [ChangeRef]>,
}

impl<'a> FatBuildInput<'a> {
    /// Take problems, statistics and changes from the snapshot itself.
    #[must_use]
    pub fn from_snapshot(build: &'a BuildSnapshot, test_pages: &'a [TestPage]) -> Self {
        Self {
            build,
            test_pages,
            problems: build.problems.as_deref(),
            statistics: build.statistics.as_ref(),
            changes: build.changes.as_deref(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests, problems, statistics
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestCompacted {
    /// Numeric tail of the occurrence locator, when it has one.
    pub occurrence_id: Option<u32>,
    pub name: u32,
    pub status: u32,
    pub duration: Option<u32>,
    pub ignored: bool,
    pub muted: bool,
    pub investigated: bool,
    pub test_id: Option<i64>,
    pub details: Option<String>,
}

impl TestCompacted {
    fn new(compactor: &dyn StringCompactor, test: &TestOccurrence) -> Result<Self, StoreError> {
        Ok(Self {
            occurrence_id: parse_occurrence_id(&test.id),
            name: compactor.intern(&test.name)?,
            status: compactor.intern(&test.status)?,
            duration: test.duration,
            ignored: test.ignored,
            muted: test.muted,
            investigated: test.currently_investigated,
            test_id: test.test_id,
            details: test.details.clone(),
        })
    }

    fn to_occurrence(&self, compactor: &dyn StringCompactor, build_id: u32) -> TestOccurrence {
        let id = self.occurrence_id.map_or_else(
            || format!("build:(id:{build_id})"),
            |occ| format!("build:(id:{build_id}),id:{occ}"),
        );
        TestOccurrence {
            id,
            name: compactor.resolve(self.name).unwrap_or_default(),
            status: compactor.resolve(self.status).unwrap_or_default(),
            duration: self.duration,
            ignored: self.ignored,
            muted: self.muted,
            currently_investigated: self.investigated,
            test_id: self.test_id,
            details: self.details.clone(),
        }
    }

    /// Occurrences are identified by locator id, or by name when the
    /// locator carries none.
    fn occurrence_key(&self) -> OccurrenceKey {
        self.occurrence_id
            .map_or(OccurrenceKey::Name(self.name), OccurrenceKey::Id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum OccurrenceKey {
    Id(u32),
    Name(u32),
}

/// Extract `2000` from `build:(id:4021),id:2000`.
fn parse_occurrence_id(locator: &str) -> Option<u32> {
    let tail = &locator[locator.rfind("id:")? + 3..];
    let digits: String = tail.chars().take_while(char::is_ascii_digit).collect();
    digits.parse().ok()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProblemCompacted {
    pub id: Option<u32>,
    pub identity: Option<u32>,
    pub problem_type: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatisticsCompacted {
    /// `(interned name, value)`, sorted by name id.
    pub values: Vec<(u32, i64)>,
}

impl StatisticsCompacted {
    #[must_use]
    pub fn get(&self, name_id: u32) -> Option<i64> {
        self.values
            .binary_search_by_key(&name_id, |(k, _)| *k)
            .ok()
            .map(|idx| self.values[idx].1)
    }
}

// ---------------------------------------------------------------------------
// CompactedBuild
// ---------------------------------------------------------------------------

/// Full build record as stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompactedBuild {
    pub entity_version: u16,
    /// Content revision; excluded from equality.
    pub revision: u64,
    pub id: u32,
    pub build_type_id: u32,
    pub branch_name: Option<u32>,
    pub status: Option<u32>,
    pub state: BuildState,
    pub composite: bool,
    pub cancelled: bool,
    pub fake_stub: bool,
    pub queued_date: Option<i64>,
    pub start_date: Option<i64>,
    pub finish_date: Option<i64>,
    pub tests: Vec<TestCompacted>,
    pub problems: Vec<ProblemCompacted>,
    pub statistics: Option<StatisticsCompacted>,
    pub change_ids: Vec<u32>,
    pub snapshot_dependencies: Vec<u32>,
}

impl PartialEq for CompactedBuild {
    fn eq(&self, other: &Self) -> bool {
        self.entity_version == other.entity_version
            && self.id == other.id
            && self.build_type_id == other.build_type_id
            && self.branch_name == other.branch_name
            && self.status == other.status
            && self.state == other.state
            && self.composite == other.composite
            && self.cancelled == other.cancelled
            && self.fake_stub == other.fake_stub
            && self.queued_date == other.queued_date
            && self.start_date == other.start_date
            && self.finish_date == other.finish_date
            && self.tests == other.tests
            && self.problems == other.problems
            && self.statistics == other.statistics
            && self.change_ids == other.change_ids
            && self.snapshot_dependencies == other.snapshot_dependencies
    }
}

impl Eq for CompactedBuild {}

impl CompactedBuild {
    /// Normalize all inputs into one record at revision 0.
    ///
    /// Tests from every page are merged; an occurrence delivered twice is
    /// kept once. Change ids that are not positive integers are dropped.
    ///
    /// # Errors
    ///
    /// Returns an error if interning a string fails.
    pub fn normalize(
        compactor: &dyn StringCompactor,
        input: &FatBuildInput<'_>,
    ) -> Result<Self, StoreError> {
        let mut build = Self::from_snapshot(compactor, input.build)?;
        let mut seen = HashMap::new();
        for page in input.test_pages {
            build.add_tests(compactor, &page.tests, &mut seen)?;
        }
        if let Some(problems) = input.problems {
            build.add_problems(compactor, problems)?;
        }
        if let Some(statistics) = input.statistics {
            build.set_statistics(compactor, statistics)?;
        }
        if let Some(changes) = input.changes {
            build.change_ids = extract_change_ids(input.build.id, changes);
        }
        Ok(build)
    }

    fn from_snapshot(
        compactor: &dyn StringCompactor,
        build: &BuildSnapshot,
    ) -> Result<Self, StoreError> {
        Ok(Self {
            entity_version: LATEST_ENTITY_VERSION,
            revision: 0,
            id: build.id,
            build_type_id: compactor.intern(&build.build_type_id)?,
            branch_name: compactor.intern_opt(build.branch_name.as_deref())?,
            status: compactor.intern_opt(build.status.as_deref())?,
            state: build.state,
            composite: build.composite,
            cancelled: build.cancelled,
            fake_stub: build.fake_stub,
            queued_date: build.queued_date,
            start_date: build.start_date,
            finish_date: build.finish_date,
            tests: Vec::new(),
            problems: Vec::new(),
            statistics: None,
            change_ids: Vec::new(),
            snapshot_dependencies: build.snapshot_dependencies.clone(),
        })
    }

    fn add_tests(
        &mut self,
        compactor: &dyn StringCompactor,
        tests: &[TestOccurrence],
        seen: &mut HashMap<OccurrenceKey, usize>,
    ) -> Result<(), StoreError> {
        for test in tests {
            let compacted = TestCompacted::new(compactor, test)?;
            match seen.entry(compacted.occurrence_key()) {
                Entry::Occupied(slot) => self.tests[*slot.get()] = compacted,
                Entry::Vacant(slot) => {
                    slot.insert(self.tests.len());
                    self.tests.push(compacted);
                }
            }
        }
        Ok(())
    }

    fn add_problems(
        &mut self,
        compactor: &dyn StringCompactor,
        problems: &[ProblemOccurrence],
    ) -> Result<(), StoreError> {
        for problem in problems {
            self.problems.push(ProblemCompacted {
                id: compactor.intern_opt(problem.id.as_deref())?,
                identity: compactor.intern_opt(problem.identity.as_deref())?,
                problem_type: compactor.intern(&problem.problem_type)?,
            });
        }
        Ok(())
    }

    fn set_statistics(
        &mut self,
        compactor: &dyn StringCompactor,
        statistics: &Statistics,
    ) -> Result<(), StoreError> {
        let mut values = Vec::with_capacity(statistics.properties.len());
        for prop in &statistics.properties {
            let Ok(value) = prop.value.trim().parse::<i64>() else {
                tracing::debug!(build = self.id, name = %prop.name, "skipping non-numeric statistic");
                continue;
            };
            values.push((compactor.intern(&prop.name)?, value));
        }
        values.sort_unstable_by_key(|(k, _)| *k);
        values.dedup_by_key(|(k, _)| *k);
        self.statistics = Some(StatisticsCompacted { values });
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Derived flags
    // -----------------------------------------------------------------------

    #[must_use]
    pub const fn is_running(&self) -> bool {
        matches!(self.state, BuildState::Running)
    }

    #[must_use]
    pub const fn is_queued(&self) -> bool {
        matches!(self.state, BuildState::Queued)
    }

    #[must_use]
    pub const fn is_outdated_entity_version(&self) -> bool {
        self.entity_version < LATEST_ENTITY_VERSION
    }

    /// Milliseconds the build ran: wall time since start while running,
    /// start to finish otherwise.
    #[must_use]
    pub fn running_time(&self, now_ms: i64) -> Option<i64> {
        let start = self.start_date.filter(|ts| *ts > 0)?;
        if self.is_running() {
            return Some(now_ms - start);
        }
        self.finish_date.map(|finish| finish - start)
    }

    fn has_problem(&self, compactor: &dyn StringCompactor, problem_type: &str) -> bool {
        compactor
            .id_if_present(problem_type)
            .is_some_and(|id| self.problems.iter().any(|p| p.problem_type == id))
    }

    #[must_use]
    pub fn has_timeout_problem(&self, compactor: &dyn StringCompactor) -> bool {
        self.has_problem(compactor, PROBLEM_EXECUTION_TIMEOUT)
    }

    #[must_use]
    pub fn has_jvm_crash_problem(&self, compactor: &dyn StringCompactor) -> bool {
        self.has_problem(compactor, PROBLEM_JVM_CRASH)
    }

    #[must_use]
    pub fn has_oome_problem(&self, compactor: &dyn StringCompactor) -> bool {
        self.has_problem(compactor, PROBLEM_OOME)
    }

    #[must_use]
    pub fn has_exit_code_problem(&self, compactor: &dyn StringCompactor) -> bool {
        self.has_problem(compactor, PROBLEM_EXIT_CODE)
    }

    #[must_use]
    pub fn has_failed_tests_problem(&self, compactor: &dyn StringCompactor) -> bool {
        self.has_problem(compactor, PROBLEM_FAILED_TESTS)
    }

    #[must_use]
    pub fn has_snapshot_dependency_problem(&self, compactor: &dyn StringCompactor) -> bool {
        self.has_problem(compactor, PROBLEM_SNAPSHOT_DEPENDENCY)
    }

    /// JVM crash or execution timeout.
    #[must_use]
    pub fn has_critical_problem(&self, compactor: &dyn StringCompactor) -> bool {
        self.has_jvm_crash_problem(compactor) || self.has_timeout_problem(compactor)
    }

    /// The suite did not run to completion, so its test list is partial.
    #[must_use]
    pub fn has_suite_incomplete_failure(&self, compactor: &dyn StringCompactor) -> bool {
        self.has_jvm_crash_problem(compactor)
            || self.has_timeout_problem(compactor)
            || self.has_oome_problem(compactor)
            || self.has_exit_code_problem(compactor)
    }

    // -----------------------------------------------------------------------
    // Expansion back to server shapes
    // -----------------------------------------------------------------------

    /// Rebuild the snapshot this record was normalized from.
    #[must_use]
    pub fn to_snapshot(&self, compactor: &dyn StringCompactor) -> BuildSnapshot {
        BuildSnapshot {
            id: self.id,
            build_type_id: compactor.resolve(self.build_type_id).unwrap_or_default(),
            branch_name: compactor.resolve_opt(self.branch_name),
            status: compactor.resolve_opt(self.status),
            state: self.state,
            composite: self.composite,
            cancelled: self.cancelled,
            fake_stub: self.fake_stub,
            queued_date: self.queued_date,
            start_date: self.start_date,
            finish_date: self.finish_date,
            problems: Some(
                self.problems
                    .iter()
                    .map(|p| ProblemOccurrence {
                        id: compactor.resolve_opt(p.id),
                        identity: compactor.resolve_opt(p.identity),
                        problem_type: compactor.resolve(p.problem_type).unwrap_or_default(),
                    })
                    .collect(),
            ),
            statistics: self.statistics.as_ref().map(|stats| Statistics {
                properties: stats
                    .values
                    .iter()
                    .filter_map(|(name, value)| {
                        Some(StatisticsProperty {
                            name: compactor.resolve(*name)?,
                            value: value.to_string(),
                        })
                    })
                    .collect(),
            }),
            changes: Some(
                self.change_ids
                    .iter()
                    .map(|id| ChangeRef { id: id.to_string() })
                    .collect(),
            ),
            snapshot_dependencies: self.snapshot_dependencies.clone(),
        }
    }

    /// All stored tests as a single page.
    #[must_use]
    pub fn test_page(&self, compactor: &dyn StringCompactor) -> TestPage {
        TestPage {
            tests: self
                .tests
                .iter()
                .map(|t| t.to_occurrence(compactor, self.id))
                .collect(),
            next_page: None,
        }
    }
}

/// Parse change ids; entries that are not positive integers are dropped.
#[must_use]
pub fn extract_change_ids(build_id: u32, changes: &[ChangeRef]) -> Vec<u32> {
    changes
        .iter()
        .filter_map(|change| match change.id.trim().parse::<u32>() {
            Ok(id) if id > 0 => Some(id),
            _ => {
                tracing::warn!(build = build_id, change = %change.id, "unable to parse change id");
                None
            }
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Build references
// ---------------------------------------------------------------------------

/// Stored form of a [`BuildRef`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildRefCompacted {
    pub id: u32,
    pub build_type_id: u32,
    pub branch_name: Option<u32>,
    pub status: Option<u32>,
    pub state: BuildState,
}

impl BuildRefCompacted {
    /// # Errors
    ///
    /// Returns an error if interning a string fails.
    pub fn from_ref(compactor: &dyn StringCompactor, r: &BuildRef) -> Result<Self, StoreError> {
        Ok(Self {
            id: r.id,
            build_type_id: compactor.intern(&r.build_type_id)?,
            branch_name: compactor.intern_opt(r.branch_name.as_deref())?,
            status: compactor.intern_opt(r.status.as_deref())?,
            state: r.state,
        })
    }

    #[must_use]
    pub fn from_build(build: &CompactedBuild) -> Self {
        Self {
            id: build.id,
            build_type_id: build.build_type_id,
            branch_name: build.branch_name,
            status: build.status,
            state: build.state,
        }
    }

    #[must_use]
    pub fn to_ref(&self, compactor: &dyn StringCompactor) -> BuildRef {
        BuildRef {
            id: self.id,
            build_type_id: compactor.resolve(self.build_type_id).unwrap_or_default(),
            branch_name: compactor.resolve_opt(self.branch_name),
            status: compactor.resolve_opt(self.status),
            state: self.state,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compactor::MemCompactor;
    use crate::model::remote::{STATUS_FAILURE, TEST_FAILURE, TEST_SUCCESS};

    fn snapshot(id: u32) -> BuildSnapshot {
        BuildSnapshot {
            id,
            build_type_id: "Ignite_Cache1".into(),
            branch_name: Some("refs/heads/master".into()),
            status: Some(STATUS_FAILURE.into()),
            state: BuildState::Finished,
            composite: false,
            cancelled: false,
            fake_stub: false,
            queued_date: Some(1_000),
            start_date: Some(2_000),
            finish_date: Some(9_000),
            problems: Some(vec![ProblemOccurrence {
                id: Some("p1".into()),
                identity: Some("jvm".into()),
                problem_type: PROBLEM_JVM_CRASH.into(),
            }]),
            statistics: Some(Statistics {
                properties: vec![
                    StatisticsProperty { name: "BuildDuration".into(), value: "7000".into() },
                    StatisticsProperty { name: "Label".into(), value: "n/a".into() },
                ],
            }),
            changes: Some(vec![
                ChangeRef { id: "311".into() },
                ChangeRef { id: "abc".into() },
                ChangeRef { id: "0".into() },
            ]),
            snapshot_dependencies: vec![],
        }
    }

    fn test(occ: u32, name: &str, status: &str) -> TestOccurrence {
        TestOccurrence {
            id: format!("build:(id:1),id:{occ}"),
            name: name.into(),
            status: status.into(),
            duration: Some(12),
            ignored: false,
            muted: false,
            currently_investigated: false,
            test_id: None,
            details: None,
        }
    }

    #[test]
    fn redelivered_occurrence_keeps_its_slot_and_latest_status() {
        let compactor = MemCompactor::new();
        let build = snapshot(1);
        let first: Vec<TestOccurrence> =
            (0..20_000).map(|i| test(i, &format!("T{i}"), TEST_SUCCESS)).collect();
        let mut second: Vec<TestOccurrence> =
            (0..20_000).map(|i| test(i, &format!("T{i}"), TEST_FAILURE)).collect();
        let mut unlocated = test(0, "unlocated", TEST_SUCCESS);
        unlocated.id = "no-locator".into();
        second.push(unlocated.clone());
        unlocated.status = TEST_FAILURE.into();
        second.push(unlocated);
        let pages = vec![
            TestPage { tests: first, next_page: Some("p2".into()) },
            TestPage { tests: second, next_page: None },
        ];
        let compacted =
            CompactedBuild::normalize(&compactor, &FatBuildInput::from_snapshot(&build, &pages))
                .expect("normalize");

        assert_eq!(compacted.tests.len(), 20_001);
        let failure = compactor.id_if_present(TEST_FAILURE);
        assert!(compacted.tests.iter().all(|t| Some(t.status) == failure));
        assert_eq!(compactor.resolve(compacted.tests[5].name).as_deref(), Some("T5"));
        assert_eq!(compacted.tests[20_000].occurrence_id, None);
    }

    #[test]
    fn normalize_merges_pages_and_drops_bad_change_ids() {
        let compactor = MemCompactor::new();
        let build = snapshot(1);
        let pages = vec![
            TestPage { tests: vec![test(1, "a", TEST_SUCCESS)], next_page: Some("p2".into()) },
            TestPage {
                tests: vec![test(2, "b", TEST_FAILURE), test(1, "a", TEST_SUCCESS)],
                next_page: None,
            },
        ];
        let compacted =
            CompactedBuild::normalize(&compactor, &FatBuildInput::from_snapshot(&build, &pages))
                .expect("normalize");

        assert_eq!(compacted.tests.len(), 2);
        assert_eq!(compacted.change_ids, vec![311]);
        assert_eq!(compacted.entity_version, LATEST_ENTITY_VERSION);
        let stats = compacted.statistics.as_ref().expect("statistics");
        assert_eq!(stats.values.len(), 1);
        let duration_id = compactor.id_if_present("BuildDuration").expect("interned");
        assert_eq!(stats.get(duration_id), Some(7000));
    }

    #[test]
    fn equality_ignores_revision_but_not_entity_version() {
        let compactor = MemCompactor::new();
        let build = snapshot(1);
        let input = FatBuildInput::from_snapshot(&build, &[]);
        let a = CompactedBuild::normalize(&compactor, &input).expect("normalize");
        let mut b = a.clone();
        b.revision = 9;
        assert_eq!(a, b);

        b.entity_version = LATEST_ENTITY_VERSION - 1;
        assert_ne!(a, b);
        assert!(b.is_outdated_entity_version());
    }

    #[test]
    fn problem_classification() {
        let compactor = MemCompactor::new();
        let build = snapshot(1);
        let compacted =
            CompactedBuild::normalize(&compactor, &FatBuildInput::from_snapshot(&build, &[]))
                .expect("normalize");
        assert!(compacted.has_jvm_crash_problem(&compactor));
        assert!(compacted.has_critical_problem(&compactor));
        assert!(compacted.has_suite_incomplete_failure(&compactor));
        assert!(!compacted.has_timeout_problem(&compactor));
        assert!(!compacted.has_failed_tests_problem(&compactor));
    }

    #[test]
    fn running_time_prefers_wall_clock_while_running() {
        let compactor = MemCompactor::new();
        let mut build = snapshot(1);
        let finished =
            CompactedBuild::normalize(&compactor, &FatBuildInput::from_snapshot(&build, &[]))
                .expect("normalize");
        assert_eq!(finished.running_time(50_000), Some(7_000));

        build.state = BuildState::Running;
        build.finish_date = None;
        let running =
            CompactedBuild::normalize(&compactor, &FatBuildInput::from_snapshot(&build, &[]))
                .expect("normalize");
        assert_eq!(running.running_time(50_000), Some(48_000));

        build.start_date = None;
        let unstarted =
            CompactedBuild::normalize(&compactor, &FatBuildInput::from_snapshot(&build, &[]))
                .expect("normalize");
        assert_eq!(unstarted.running_time(50_000), None);
    }

    #[test]
    fn snapshot_expansion_preserves_content() {
        let compactor = MemCompactor::new();
        let build = snapshot(1);
        let pages = vec![TestPage { tests: vec![test(5, "a", TEST_FAILURE)], next_page: None }];
        let compacted =
            CompactedBuild::normalize(&compactor, &FatBuildInput::from_snapshot(&build, &pages))
                .expect("normalize");

        let expanded = compacted.to_snapshot(&compactor);
        let page = compacted.test_page(&compactor);
        let again = CompactedBuild::normalize(
            &compactor,
            &FatBuildInput::from_snapshot(&expanded, std::slice::from_ref(&page)),
        )
        .expect("normalize");
        assert_eq!(compacted, again);
        assert_eq!(page.tests[0].id, "build:(id:1),id:5");
    }

    #[test]
    fn occurrence_locator_parsing() {
        assert_eq!(parse_occurrence_id("build:(id:4021),id:2000"), Some(2000));
        assert_eq!(parse_occurrence_id("id:7"), Some(7));
        assert_eq!(parse_occurrence_id("name:foo"), None);
    }
}
