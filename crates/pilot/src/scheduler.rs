//! The cron-like ticker. All periodic work in the daemon is dispatched from
//! here: nothing else owns a timer. Startup bypass boots the runtime without
//! spawning any tick.
use std::sync::Arc;

use chrono::Utc;
use common::knobs::{
    DECISION_INTERVAL,
    MAINTENANCE_INTERVAL,
};
use errors::{
    report_error,
    ErrorMetadataAnyhowExt,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{
    bypass::BypassLevel,
    runtime::Runtime,
};

pub struct SchedulerHandle {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

pub struct Scheduler;

impl Scheduler {
    /// Spawn the tick tasks, the ingest consumer, and the fatal-error
    /// watcher. With startup bypass in effect only the consumer and the
    /// watcher run; no tick ever fires.
    pub fn start(runtime: Arc<Runtime>) -> SchedulerHandle {
        let cancel = CancellationToken::new();
        let mut tasks = Vec::new();

        tasks.push(runtime.stats.start_consumer());

        // Fatal errors anywhere in the daemon are signaled through the
        // shutdown channel; the watcher takes the system to bypass so every
        // later pass runs read-only.
        {
            let runtime = runtime.clone();
            let cancel = cancel.clone();
            let mut shutdown_rx = runtime.shutdown_receiver();
            tasks.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        message = shutdown_rx.recv() => {
                            let Ok(message) = message else { return };
                            tracing::error!(
                                "fatal error; entering system bypass: {:#}",
                                message.error
                            );
                            runtime.bypass.set(BypassLevel::System, "");
                        },
                    }
                }
            }));
        }

        if runtime.bypass.startup_inert() {
            tracing::warn!("startup bypass active; scheduler ticks disabled");
            return SchedulerHandle { cancel, tasks };
        }

        {
            let runtime = runtime.clone();
            let cancel = cancel.clone();
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(*DECISION_INTERVAL);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                // The immediate first tick is skipped so a fresh boot
                // observes traffic before deciding anything.
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = ticker.tick() => {},
                    }
                    if let Err(e) = runtime.decision_pass(Utc::now()).await {
                        if e.is_fatal() {
                            runtime.shutdown.signal(e);
                        } else {
                            report_error(&e);
                        }
                    }
                }
            }));
        }

        {
            let runtime = runtime.clone();
            let cancel = cancel.clone();
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(*MAINTENANCE_INTERVAL);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = ticker.tick() => {},
                    }
                    if let Err(e) = runtime.maintenance_pass(Utc::now()).await {
                        if e.is_fatal() {
                            runtime.shutdown.signal(e);
                        } else {
                            report_error(&e);
                        }
                    }
                }
            }));
        }

        SchedulerHandle { cancel, tasks }
    }
}

impl SchedulerHandle {
    /// Graceful shutdown: stop dispatching, cancel in-flight builds with a
    /// grace period, then let the caller drain the log writer and close the
    /// pool.
    pub async fn shutdown(self, runtime: &Runtime) {
        self.cancel.cancel();
        runtime.executor.cancel_all_builds();
        for task in self.tasks {
            task.abort();
            let _ = task.await;
        }
        runtime.drain_log_writer().await;
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::Arc,
        time::Duration,
    };

    use catalog::BootstrapMode;
    use common::testing::FakeDb;

    use super::Scheduler;
    use crate::{
        Bypass,
        Runtime,
    };

    #[tokio::test]
    async fn test_fatal_signal_takes_daemon_to_system_bypass() {
        let db = Arc::new(FakeDb::new());
        let bypass = Arc::new(Bypass::new());
        let runtime = Runtime::start(db, BootstrapMode::Introspect, bypass)
            .await
            .unwrap();
        let _handle = Scheduler::start(runtime.clone());
        assert!(runtime.bypass.ddl_allowed());

        runtime.shutdown.signal(anyhow::anyhow!(errors::ErrorMetadata::corrupted_metadata(
            "metadata table failed consistency checks",
        )));
        // Give the watcher a chance to run.
        for _ in 0..100 {
            if !runtime.bypass.ddl_allowed() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(!runtime.bypass.ddl_allowed());
    }
}
