use std::sync::Arc;

use tokio::sync::watch;

/// One-shot shutdown flag.
///
/// Set by the job path once its single job is done, or by a signal handler. The
/// lifecycle path awaits it while it has nothing better to do.
#[derive(Clone, Debug)]
pub struct ShutdownSignal(Arc<watch::Sender<bool>>);

impl ShutdownSignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self(Arc::new(tx))
    }

    pub fn trigger(&self) {
        // send_replace works even when nobody is subscribed yet.
        self.0.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolves once the flag is set. Resolves immediately if it already is.
    pub async fn wait(&self) {
        let mut rx = self.0.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}
