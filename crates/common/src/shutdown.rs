use std::sync::Arc;

// Used by subsystems to signal a fatal error that must take the daemon to
// system bypass.
#[derive(Clone)]
pub struct ShutdownSignal {
    shutdown_tx: Option<async_broadcast::Sender<ShutdownMessage>>,
}

#[derive(Clone, Debug)]
pub struct ShutdownMessage {
    pub error: Arc<anyhow::Error>,
}

impl ShutdownSignal {
    pub fn new(shutdown_tx: async_broadcast::Sender<ShutdownMessage>) -> Self {
        Self {
            shutdown_tx: Some(shutdown_tx),
        }
    }

    pub fn signal(&self, fatal_error: anyhow::Error) {
        if let Some(ref shutdown_tx) = self.shutdown_tx {
            _ = shutdown_tx.try_broadcast(ShutdownMessage {
                error: Arc::new(fatal_error),
            });
        } else {
            // No receiver configured. Just panic.
            panic!("Shutting down due to fatal error: {}", fatal_error);
        }
    }

    // Creates a new ShutdownSignal that panics when signaled.
    pub fn panic() -> Self {
        Self { shutdown_tx: None }
    }

    #[cfg(any(test, feature = "testing"))]
    pub fn no_op() -> Self {
        let (sender, _receiver) = async_broadcast::broadcast(1);
        Self {
            shutdown_tx: Some(sender),
        }
    }
}
