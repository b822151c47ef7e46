use std::fmt;

/// Machine-readable error codes for operators and report tooling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    NotInitialized,
    ConfigParseError,
    BuildNotFound,
    RemoteNotFound,
    RemoteUnavailable,
    MalformedRemoteData,
    CorruptRecord,
    StoreWriteFailed,
    LockPoisoned,
    InternalUnexpected,
}

impl ErrorCode {
    /// Stable code identifier (`E####`) for machine parsing.
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::NotInitialized => "E1001",
            Self::ConfigParseError => "E1002",
            Self::BuildNotFound => "E2001",
            Self::RemoteNotFound => "E2002",
            Self::RemoteUnavailable => "E3001",
            Self::MalformedRemoteData => "E3002",
            Self::CorruptRecord => "E4001",
            Self::StoreWriteFailed => "E4002",
            Self::LockPoisoned => "E5001",
            Self::InternalUnexpected => "E9001",
        }
    }

    /// Short human-facing summary for logs and terminal output.
    #[must_use]
    pub const fn message(self) -> &'static str {
        match self {
            Self::NotInitialized => "Store not initialized",
            Self::ConfigParseError => "Config file parse error",
            Self::BuildNotFound => "Build not found locally",
            Self::RemoteNotFound => "Build not found on CI server",
            Self::RemoteUnavailable => "CI server request failed",
            Self::MalformedRemoteData => "Malformed data from CI server",
            Self::CorruptRecord => "Corrupt stored record",
            Self::StoreWriteFailed => "Store read/write failed",
            Self::LockPoisoned => "Lock poisoned",
            Self::InternalUnexpected => "Internal unexpected error",
        }
    }

    /// Optional remediation hint that can be surfaced to operators.
    #[must_use]
    pub const fn hint(self) -> Option<&'static str> {
        match self {
            Self::NotInitialized => Some("Run `bmirror init` to create the mirror database."),
            Self::ConfigParseError => Some("Fix syntax in buildmirror.toml and retry."),
            Self::BuildNotFound => Some("Run `bmirror sync` to fetch recent history."),
            Self::RemoteNotFound => None,
            Self::RemoteUnavailable => Some("The next scheduled sync retries automatically."),
            Self::MalformedRemoteData => None,
            Self::CorruptRecord => Some("Run `bmirror sync --full` to reload affected builds."),
            Self::StoreWriteFailed => Some("Check disk space and write permissions."),
            Self::LockPoisoned => Some("Restart the process; a worker thread panicked."),
            Self::InternalUnexpected => Some("Retry once. If persistent, report a bug with logs."),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Failures of the local key-value tables and the string intern table.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A table was opened against a database whose schema was never migrated.
    #[error("table `{table}` used before initialization")]
    NotInitialized { table: String },

    /// The underlying SQLite call failed.
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// A stored value could not be encoded or decoded.
    #[error("value codec for `{table}`: {source}")]
    Codec {
        table: String,
        #[source]
        source: serde_json::Error,
    },

    /// The persisted intern table has a hole or duplicate id.
    #[error("string table is not dense: expected id {expected}, found {found}")]
    SparseStrings { expected: u32, found: u32 },

    /// A mutex guarding shared store state was poisoned.
    #[error("lock poisoned: {0}")]
    Poisoned(&'static str),
}

impl StoreError {
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::NotInitialized { .. } => ErrorCode::NotInitialized,
            Self::Sqlite(_) => ErrorCode::StoreWriteFailed,
            Self::Codec { .. } | Self::SparseStrings { .. } => ErrorCode::CorruptRecord,
            Self::Poisoned(_) => ErrorCode::LockPoisoned,
        }
    }
}

/// Failures reported by a [`crate::remote::RemoteCiClient`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RemoteError {
    /// The requested build vanished or never existed.
    #[error("not found on CI server: {0}")]
    NotFound(String),

    /// Network or server failure; the next scheduled cycle retries.
    #[error("CI server request failed: {0}")]
    Transient(String),

    /// The server answered with something that could not be interpreted.
    #[error("malformed CI server response: {0}")]
    Malformed(String),
}

impl RemoteError {
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::NotFound(_) => ErrorCode::RemoteNotFound,
            Self::Transient(_) => ErrorCode::RemoteUnavailable,
            Self::Malformed(_) => ErrorCode::MalformedRemoteData,
        }
    }

    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Errors surfaced by the sync orchestrator.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error(transparent)]
    Store(#[from] StoreError),

    /// An interactive read found nothing locally and the remote had nothing.
    #[error("build {0} not found")]
    BuildNotFound(u32),
}

impl SyncError {
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Remote(e) => e.code(),
            Self::Store(e) => e.code(),
            Self::BuildNotFound(_) => ErrorCode::BuildNotFound,
        }
    }
}
