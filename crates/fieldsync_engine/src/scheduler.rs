//! Background sync loop.

use crate::local::LocalReplica;
use crate::state::{SyncEngine, SyncOutcome};
use crate::transport::SyncTransport;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Runs [`SyncEngine::sync_now`] once at start, then every
/// `sync_interval`, whenever [`SyncScheduler::trigger`] is called, and
/// after a backoff delay while cycles keep failing.
///
/// A failure that cannot succeed on its own, such as a rejected token or a
/// tenant mismatch, parks the loop: no timer runs until the next
/// [`SyncScheduler::trigger`].
pub struct SyncScheduler {
    trigger: Arc<Notify>,
    stop: Arc<Notify>,
    handle: JoinHandle<()>,
}

impl SyncScheduler {
    /// Starts the loop on the current tokio runtime.
    pub fn spawn<T, S>(engine: Arc<SyncEngine<T, S>>) -> Self
    where
        T: SyncTransport + 'static,
        S: LocalReplica + 'static,
    {
        let trigger = Arc::new(Notify::new());
        let stop = Arc::new(Notify::new());
        let handle = tokio::spawn(run(engine, Arc::clone(&trigger), Arc::clone(&stop)));
        Self {
            trigger,
            stop,
            handle,
        }
    }

    /// Requests a cycle as soon as the current one, if any, finishes.
    pub fn trigger(&self) {
        self.trigger.notify_one();
    }

    /// Stops the loop after any in-flight cycle and waits for it to exit.
    pub async fn stop(self) {
        self.stop.notify_one();
        let _ = self.handle.await;
    }
}

async fn run<T, S>(engine: Arc<SyncEngine<T, S>>, trigger: Arc<Notify>, stop: Arc<Notify>)
where
    T: SyncTransport + 'static,
    S: LocalReplica + 'static,
{
    let interval = engine.config().sync_interval;
    info!(?interval, "sync scheduler started");

    loop {
        let outcome = engine.sync_now().await;
        let wait = next_wait(&engine, &outcome, interval);
        debug!(?outcome, ?wait, "scheduled sync finished");

        let sleep = async {
            match wait {
                Some(delay) => tokio::time::sleep(delay).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::select! {
            _ = stop.notified() => break,
            _ = trigger.notified() => {}
            _ = sleep => {}
        }
    }
    info!("sync scheduler stopped");
}

fn next_wait<T, S>(
    engine: &SyncEngine<T, S>,
    outcome: &SyncOutcome,
    interval: Option<Duration>,
) -> Option<Duration>
where
    T: SyncTransport,
    S: LocalReplica,
{
    match outcome {
        SyncOutcome::Failed {
            retryable: false, ..
        } => None,
        SyncOutcome::Failed { .. } | SyncOutcome::Offline => {
            let failures = engine.stats().consecutive_failures;
            let backoff = engine.config().retry.delay_for_attempt(failures);
            Some(interval.map_or(backoff, |interval| backoff.min(interval)))
        }
        _ => interval,
    }
}
