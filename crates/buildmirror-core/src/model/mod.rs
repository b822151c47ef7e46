//! Build data model: server-facing shapes and their compacted forms.

pub mod compacted;
pub mod remote;

pub use compacted::{
    BuildRefCompacted, CompactedBuild, FatBuildInput, LATEST_ENTITY_VERSION, ProblemCompacted,
    StatisticsCompacted, TestCompacted,
};
pub use remote::{
    BuildCondition, BuildRef, BuildSnapshot, BuildState, ChangeRef, ProblemOccurrence, RefPage,
    Statistics, StatisticsProperty, TestOccurrence, TestPage,
};
