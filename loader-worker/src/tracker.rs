use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use tokio::sync::Notify;

/// Counts batches that were dispatched but not yet reconciled, and notifies waiters once the
/// input is exhausted and that count drops to zero.
#[derive(Debug, Default)]
pub struct DispatchTracker {
    outstanding: AtomicUsize,
    input_exhausted: AtomicBool,
    drained: Notify,
}

impl DispatchTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn dispatched(&self) {
        let outstanding = self.outstanding.fetch_add(1, Ordering::SeqCst) + 1;
        metrics::gauge!("loader_batches_in_flight").set(outstanding as f64);
    }

    pub fn reconciled(&self) {
        let outstanding = self.outstanding.fetch_sub(1, Ordering::SeqCst) - 1;
        metrics::gauge!("loader_batches_in_flight").set(outstanding as f64);
        self.notify_if_drained();
    }

    /// No further dispatches will be made.
    pub fn input_exhausted(&self) {
        self.input_exhausted.store(true, Ordering::SeqCst);
        self.notify_if_drained();
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }

    pub fn is_drained(&self) -> bool {
        self.input_exhausted.load(Ordering::SeqCst) && self.outstanding() == 0
    }

    /// Resolve once every dispatched batch has been reconciled and no more will be dispatched.
    pub async fn wait_drained(&self) {
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            // Register before checking, so a notification between the check and the await
            // is not missed.
            notified.as_mut().enable();

            if self.is_drained() {
                return;
            }

            notified.await;
        }
    }

    fn notify_if_drained(&self) {
        if self.is_drained() {
            self.drained.notify_waiters();
        }
    }
}
