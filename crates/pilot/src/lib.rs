//! Daemon assembly: runtime construction, the bypass and rollback planes,
//! the read-only API, and the scheduler.
pub mod bypass;
pub mod config;
pub mod read_api;
pub mod rollback;
pub mod runtime;
pub mod scheduler;

pub use crate::{
    bypass::{
        Bypass,
        BypassLevel,
    },
    config::Config,
    read_api::ReadApi,
    rollback::RollbackPlane,
    runtime::Runtime,
    scheduler::{
        Scheduler,
        SchedulerHandle,
    },
};

/// Exit codes of the command-line surface.
pub fn exit_code_for(err: &anyhow::Error) -> i32 {
    use errors::{
        ErrorCode,
        ErrorMetadataAnyhowExt,
    };
    match err.error_code() {
        Some(
            ErrorCode::CircuitOpen
            | ErrorCode::WindowClosed
            | ErrorCode::RateLimited
            | ErrorCode::Throttled
            | ErrorCode::StorageBudgetExceeded,
        ) => 2,
        Some(ErrorCode::PlannerUnavailable) => 3,
        Some(ErrorCode::PermissionDenied) => 4,
        Some(ErrorCode::ConnectionLost | ErrorCode::PoolExhausted | ErrorCode::Timeout) => 5,
        _ => 70,
    }
}
