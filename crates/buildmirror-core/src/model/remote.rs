//! Data as the CI server reports it.
//!
//! These are the shapes exchanged with a [`crate::remote::RemoteCiClient`].
//! They carry plain strings; the store keeps the compacted forms from
//! [`super::compacted`].

use serde::{Deserialize, Serialize};
use std::fmt;

/// Build status reported for successful builds.
pub const STATUS_SUCCESS: &str = "SUCCESS";
/// Build status reported for failed builds.
pub const STATUS_FAILURE: &str = "FAILURE";
/// Build status of cancelled builds and synthesized stubs.
pub const STATUS_UNKNOWN: &str = "UNKNOWN";

/// Test occurrence status for passed tests.
pub const TEST_SUCCESS: &str = "SUCCESS";
/// Test occurrence status for failed tests.
pub const TEST_FAILURE: &str = "FAILURE";

/// Branch placeholder accepted by history queries.
pub const DEFAULT_BRANCH_ALIAS: &str = "<default>";
/// Branch the placeholder stands for.
pub const DEFAULT_BRANCH: &str = "refs/heads/master";

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Lifecycle of a build on the CI server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildState {
    Queued,
    Running,
    Finished,
}

impl BuildState {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Finished => "finished",
        }
    }

    /// Queued and running builds still change on the server.
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Queued | Self::Running)
    }
}

impl fmt::Display for BuildState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// References and pages
// ---------------------------------------------------------------------------

/// One entry of the server's build history listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildRef {
    pub id: u32,
    pub build_type_id: String,
    #[serde(default)]
    pub branch_name: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    pub state: BuildState,
}

/// One page of build history, newest builds first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefPage {
    #[serde(default)]
    pub refs: Vec<BuildRef>,
    /// Opaque token for the following page; `None` on the last page.
    #[serde(default)]
    pub next_page: Option<String>,
}

/// One page of test occurrences for a build.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestPage {
    #[serde(default)]
    pub tests: Vec<TestOccurrence>,
    #[serde(default)]
    pub next_page: Option<String>,
}

// ---------------------------------------------------------------------------
// Full build
// ---------------------------------------------------------------------------

/// Everything the server reports about one build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildSnapshot {
    pub id: u32,
    pub build_type_id: String,
    #[serde(default)]
    pub branch_name: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    pub state: BuildState,
    /// Aggregating build with snapshot dependencies and no tests of its own.
    #[serde(default)]
    pub composite: bool,
    #[serde(default)]
    pub cancelled: bool,
    /// Placeholder created locally for a build the server no longer knows.
    #[serde(default)]
    pub fake_stub: bool,
    /// Epoch milliseconds.
    #[serde(default)]
    pub queued_date: Option<i64>,
    #[serde(default)]
    pub start_date: Option<i64>,
    #[serde(default)]
    pub finish_date: Option<i64>,
    #[serde(default)]
    pub problems: Option<Vec<ProblemOccurrence>>,
    #[serde(default)]
    pub statistics: Option<Statistics>,
    #[serde(default)]
    pub changes: Option<Vec<ChangeRef>>,
    #[serde(default)]
    pub snapshot_dependencies: Vec<u32>,
}

impl BuildSnapshot {
    /// Empty finished build standing in for an id the server does not know.
    #[must_use]
    pub fn fake_stub(id: u32) -> Self {
        Self {
            id,
            build_type_id: String::new(),
            branch_name: None,
            status: Some(STATUS_UNKNOWN.to_string()),
            state: BuildState::Finished,
            composite: false,
            cancelled: false,
            fake_stub: true,
            queued_date: None,
            start_date: None,
            finish_date: None,
            problems: None,
            statistics: None,
            changes: None,
            snapshot_dependencies: Vec::new(),
        }
    }

    /// Force a terminal state: the build will never report progress again.
    pub fn set_cancelled(&mut self) {
        self.state = BuildState::Finished;
        self.status = Some(STATUS_UNKNOWN.to_string());
        self.cancelled = true;
    }

    #[must_use]
    pub fn to_ref(&self) -> BuildRef {
        BuildRef {
            id: self.id,
            build_type_id: self.build_type_id.clone(),
            branch_name: self.branch_name.clone(),
            status: self.status.clone(),
            state: self.state,
        }
    }
}

/// A single test run inside a build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestOccurrence {
    /// Server locator, e.g. `build:(id:4021),id:2000`.
    pub id: String,
    pub name: String,
    pub status: String,
    /// Milliseconds.
    #[serde(default)]
    pub duration: Option<u32>,
    #[serde(default)]
    pub ignored: bool,
    #[serde(default)]
    pub muted: bool,
    #[serde(default)]
    pub currently_investigated: bool,
    /// Server-wide test id, stable across builds.
    #[serde(default)]
    pub test_id: Option<i64>,
    /// Failure text; only requested for non-composite builds.
    #[serde(default)]
    pub details: Option<String>,
}

/// Problem attached to a build (timeouts, crashes, failed tests, ...).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProblemOccurrence {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub identity: Option<String>,
    #[serde(rename = "type")]
    pub problem_type: String,
}

/// Named numeric statistics reported for a finished build.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Statistics {
    #[serde(default)]
    pub properties: Vec<StatisticsProperty>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatisticsProperty {
    pub name: String,
    pub value: String,
}

/// VCS change included in a build. Ids are numeric strings on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRef {
    pub id: String,
}

// ---------------------------------------------------------------------------
// Conditions
// ---------------------------------------------------------------------------

/// A user's judgment that a build should (not) be used in reports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildCondition {
    pub build_id: u32,
    pub principal: String,
    pub is_valid: bool,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub recorded_at: Option<chrono::DateTime<chrono::Utc>>,
}
