//! Error classification for IndexPilot.
//!
//! An [`ErrorMetadata`] is attached to an `anyhow` chain via `.context(e)`.
//! It tags the failure with an [`ErrorCode`], which determines how the
//! executor and maintenance loop react: retry with backoff, defer and
//! reschedule, drop to read-only, or escalate to system bypass. The `msg` is
//! operator-facing; the `short_msg` is a stable tag usable in tests and
//! metrics.
use std::borrow::Cow;

mod metrics;

pub use crate::metrics::report_error;

#[derive(thiserror::Error, Clone, Debug, PartialEq, Eq)]
#[error("{msg}")]
pub struct ErrorMetadata {
    pub code: ErrorCode,
    /// Short ScreamingCamelCase tag, stable across copy changes.
    /// Eg `LockTimeout`.
    pub short_msg: Cow<'static, str>,
    /// Operator-facing description. Must never embed an identifier that
    /// failed validation.
    pub msg: Cow<'static, str>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    // Transient database failures: retryable with backoff.
    LockTimeout,
    Deadlock,
    ConnectionLost,
    PlannerUnavailable,

    // Resource exhaustion: the operation is deferred, not failed.
    PoolExhausted,
    StorageBudgetExceeded,
    RateLimited,
    WindowClosed,
    CircuitOpen,
    Throttled,

    // Configuration: fatal at boot, logged and skipped at runtime.
    InvalidIdentifier,
    UnknownTable,
    MalformedSchema,

    // Invariant violations: alert and continue read-only.
    MutationLogGap,
    CatalogDrift,

    // Fatal: daemon transitions to system bypass.
    PermissionDenied,
    CorruptedMetadata,

    // Conflicts surfaced by DDL (duplicate name, concurrent schema change).
    DdlConflict,
    Timeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transient,
    Resource,
    Configuration,
    Invariant,
    Fatal,
}

impl ErrorCode {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ErrorCode::LockTimeout
            | ErrorCode::Deadlock
            | ErrorCode::ConnectionLost
            | ErrorCode::Timeout
            | ErrorCode::PlannerUnavailable => ErrorKind::Transient,
            ErrorCode::PoolExhausted
            | ErrorCode::StorageBudgetExceeded
            | ErrorCode::RateLimited
            | ErrorCode::WindowClosed
            | ErrorCode::Throttled
            | ErrorCode::CircuitOpen => ErrorKind::Resource,
            ErrorCode::InvalidIdentifier
            | ErrorCode::UnknownTable
            | ErrorCode::DdlConflict
            | ErrorCode::MalformedSchema => ErrorKind::Configuration,
            ErrorCode::MutationLogGap | ErrorCode::CatalogDrift => ErrorKind::Invariant,
            ErrorCode::PermissionDenied | ErrorCode::CorruptedMetadata => ErrorKind::Fatal,
        }
    }

    /// A stable label for the per-code failure counter.
    pub fn metric_label(&self) -> &'static str {
        match self {
            ErrorCode::LockTimeout => "lock_timeout",
            ErrorCode::Deadlock => "deadlock",
            ErrorCode::ConnectionLost => "connection_lost",
            ErrorCode::PlannerUnavailable => "planner_unavailable",
            ErrorCode::PoolExhausted => "pool_exhausted",
            ErrorCode::StorageBudgetExceeded => "storage_budget_exceeded",
            ErrorCode::RateLimited => "rate_limited",
            ErrorCode::WindowClosed => "window_closed",
            ErrorCode::CircuitOpen => "circuit_open",
            ErrorCode::Throttled => "throttled",
            ErrorCode::InvalidIdentifier => "invalid_identifier",
            ErrorCode::UnknownTable => "unknown_table",
            ErrorCode::MalformedSchema => "malformed_schema",
            ErrorCode::MutationLogGap => "mutation_log_gap",
            ErrorCode::CatalogDrift => "catalog_drift",
            ErrorCode::PermissionDenied => "permission_denied",
            ErrorCode::CorruptedMetadata => "corrupted_metadata",
            ErrorCode::DdlConflict => "ddl_conflict",
            ErrorCode::Timeout => "timeout",
        }
    }
}

impl ErrorMetadata {
    pub fn new(
        code: ErrorCode,
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            code,
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }

    pub fn lock_timeout(msg: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::LockTimeout, "LockTimeout", msg)
    }

    pub fn deadlock(msg: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::Deadlock, "Deadlock", msg)
    }

    pub fn connection_lost(msg: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::ConnectionLost, "ConnectionLost", msg)
    }

    pub fn planner_unavailable(msg: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::PlannerUnavailable, "PlannerUnavailable", msg)
    }

    pub fn pool_exhausted() -> Self {
        Self::new(
            ErrorCode::PoolExhausted,
            "PoolExhausted",
            "No database connection became available within the acquire timeout",
        )
    }

    pub fn storage_budget_exceeded(msg: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::StorageBudgetExceeded, "StorageBudgetExceeded", msg)
    }

    pub fn rate_limited(msg: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::RateLimited, "RateLimited", msg)
    }

    pub fn window_closed(msg: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::WindowClosed, "WindowClosed", msg)
    }

    pub fn circuit_open(msg: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::CircuitOpen, "CircuitOpen", msg)
    }

    pub fn throttled(msg: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::Throttled, "Throttled", msg)
    }

    /// Note: the offending identifier is intentionally absent from the
    /// operator-facing message.
    pub fn invalid_identifier() -> Self {
        Self::new(
            ErrorCode::InvalidIdentifier,
            "InvalidIdentifier",
            "An SQL identifier failed validation and was rejected",
        )
    }

    pub fn unknown_table(msg: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::UnknownTable, "UnknownTable", msg)
    }

    pub fn malformed_schema(msg: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::MalformedSchema, "MalformedSchema", msg)
    }

    pub fn mutation_log_gap(msg: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::MutationLogGap, "MutationLogGap", msg)
    }

    pub fn catalog_drift(msg: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::CatalogDrift, "CatalogDrift", msg)
    }

    pub fn permission_denied(msg: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::PermissionDenied, "PermissionDenied", msg)
    }

    pub fn corrupted_metadata(msg: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::CorruptedMetadata, "CorruptedMetadata", msg)
    }

    pub fn ddl_conflict(msg: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::DdlConflict, "DdlConflict", msg)
    }

    pub fn timeout(msg: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::Timeout, "Timeout", msg)
    }

    pub fn is_retryable(&self) -> bool {
        self.code.kind() == ErrorKind::Transient
    }

    pub fn is_deferrable(&self) -> bool {
        self.code.kind() == ErrorKind::Resource
    }

    pub fn is_fatal(&self) -> bool {
        self.code.kind() == ErrorKind::Fatal
    }
}

/// Read classification back off an `anyhow::Error` chain.
pub trait ErrorMetadataAnyhowExt {
    fn error_metadata(&self) -> Option<&ErrorMetadata>;
    fn error_code(&self) -> Option<ErrorCode>;
    fn is_retryable(&self) -> bool;
    fn is_deferrable(&self) -> bool;
    fn is_fatal(&self) -> bool;
    fn short_msg(&self) -> &str;
}

impl ErrorMetadataAnyhowExt for anyhow::Error {
    fn error_metadata(&self) -> Option<&ErrorMetadata> {
        self.downcast_ref::<ErrorMetadata>()
    }

    fn error_code(&self) -> Option<ErrorCode> {
        self.error_metadata().map(|e| e.code)
    }

    fn is_retryable(&self) -> bool {
        self.error_metadata().is_some_and(|e| e.is_retryable())
    }

    fn is_deferrable(&self) -> bool {
        self.error_metadata().is_some_and(|e| e.is_deferrable())
    }

    fn is_fatal(&self) -> bool {
        self.error_metadata().is_some_and(|e| e.is_fatal())
    }

    fn short_msg(&self) -> &str {
        self.error_metadata()
            .map(|e| e.short_msg.as_ref())
            .unwrap_or("InternalError")
    }
}
