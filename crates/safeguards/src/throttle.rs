//! Write-latency throttle. New builds defer when the database's recent write
//! latency is above the ceiling; above the emergency ceiling, in-flight
//! non-critical builds are cancelled.
use std::sync::Arc;

use common::{
    db::DbAdapter,
    knobs::{
        EMERGENCY_CEILING_MS,
        WRITE_LATENCY_CEILING_MS,
    },
};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ThrottleState {
    Ok,
    Defer,
    Emergency,
}

pub struct WriteLatencyThrottle {
    db: Arc<dyn DbAdapter>,
}

impl WriteLatencyThrottle {
    pub fn new(db: Arc<dyn DbAdapter>) -> Self {
        Self { db }
    }

    pub async fn state(&self) -> ThrottleState {
        // A failed latency sample must not wedge the throttle open or shut;
        // treat it as healthy and let the adapter's own failure surface.
        let latency = self.db.write_latency_ms().await.unwrap_or(0.0);
        if latency >= *EMERGENCY_CEILING_MS {
            ThrottleState::Emergency
        } else if latency >= *WRITE_LATENCY_CEILING_MS {
            ThrottleState::Defer
        } else {
            ThrottleState::Ok
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use common::testing::FakeDb;

    use super::{
        ThrottleState,
        WriteLatencyThrottle,
    };

    #[tokio::test]
    async fn test_thresholds() {
        let db = Arc::new(FakeDb::new());
        let throttle = WriteLatencyThrottle::new(db.clone());

        db.set_write_latency_ms(1.0);
        assert_eq!(throttle.state().await, ThrottleState::Ok);

        db.set_write_latency_ms(*common::knobs::WRITE_LATENCY_CEILING_MS + 1.0);
        assert_eq!(throttle.state().await, ThrottleState::Defer);

        db.set_write_latency_ms(*common::knobs::EMERGENCY_CEILING_MS + 1.0);
        assert_eq!(throttle.state().await, ThrottleState::Emergency);
    }
}
