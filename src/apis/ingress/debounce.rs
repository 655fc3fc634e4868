//! Debouncing of spammed reconcile triggers
//!
//! The callback fires once after the buffer duration has passed without a
//! new trigger. Continuous triggering delays the callback indefinitely.
//! Cancelling the token tears down the background driver; the callback never
//! fires afterwards.

use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Handle for feeding triggers into a debounced callback.
#[derive(Clone)]
pub struct Debouncer {
    trigger_tx: mpsc::UnboundedSender<()>,
}

impl Debouncer {
    /// Register a trigger. Never blocks; bursts are coalesced.
    pub fn trigger(&self) {
        let _ = self.trigger_tx.send(());
    }
}

/// Wrap `callback` so that a burst of triggers within any window of the
/// buffer duration results in at most one invocation, fired once the burst
/// has been quiet for the full buffer duration.
pub fn debounce<F>(cancel: CancellationToken, buffer: Duration, mut callback: F) -> Debouncer
where
    F: FnMut() + Send + 'static,
{
    let (trigger_tx, mut trigger_rx) = mpsc::unbounded_channel::<()>();

    tokio::spawn(async move {
        'idle: loop {
            // wait for the first trigger of a burst
            tokio::select! {
                _ = cancel.cancelled() => return,
                received = trigger_rx.recv() => {
                    if received.is_none() {
                        return;
                    }
                }
            }
            // then wait for quiescence, restarting the timer on every trigger
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(buffer) => {
                        callback();
                        continue 'idle;
                    }
                    received = trigger_rx.recv() => {
                        if received.is_none() {
                            return;
                        }
                    }
                }
            }
        }
    });

    Debouncer { trigger_tx }
}
