//! # Sync runner
//!
//! Module dedicated to the per-mailbox synchronization worker. The
//! [`SyncRunner`] polls the remote feed in a background task, retries
//! failed rounds with an exponential backoff and never gives up: a
//! round that keeps failing is simply attempted again at the next
//! poll. Session disconnections never affect it.

use std::{sync::Arc, time::Duration};

use tokio::{sync::Notify, task::JoinHandle, time};
use tracing::{debug, trace, warn};

use crate::retry::{Retry, RetryState};

use super::{Error, Result, SyncEngine};

/// The handle of a running synchronization worker.
#[derive(Debug)]
pub struct SyncRunner {
    name: String,
    shutdown: Arc<Notify>,
    handle: JoinHandle<()>,
}

impl SyncRunner {
    /// Spawns the worker of the mailbox synced by the given engine.
    pub fn spawn(engine: SyncEngine) -> Self {
        let name = engine.mailbox().name().to_owned();
        let shutdown = Arc::new(Notify::new());

        let handle = tokio::spawn(run(engine, shutdown.clone()));
        debug!(mailbox = %name, "spawned sync runner");

        Self {
            name,
            shutdown,
            handle,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Stops the worker and waits for it to finish.
    ///
    /// A round in flight is dropped at its next suspension point,
    /// which never leaves a half-applied batch behind.
    pub async fn shutdown(self) -> Result<()> {
        self.shutdown.notify_one();
        self.handle
            .await
            .map_err(|err| Error::JoinRunnerError(err, self.name.clone()))?;
        debug!(mailbox = %self.name, "stopped sync runner");
        Ok(())
    }
}

async fn run(engine: SyncEngine, shutdown: Arc<Notify>) {
    let name = engine.mailbox().name().to_owned();
    let poll_interval = engine.config().poll_interval();
    let mut retry = Retry::new(engine.config().retry.clone());

    loop {
        let round = async {
            match retry.timeout(engine.sync()).await {
                Ok(res) => res,
                Err(_) => Err(Error::RemoteTimeoutError(name.clone())),
            }
        };

        let res = tokio::select! {
            _ = shutdown.notified() => break,
            res = round => res,
        };

        match &res {
            Ok(report) if report.is_empty() => trace!(mailbox = %name, "nothing to sync"),
            Ok(report) => debug!(mailbox = %name, "synced: {report}"),
            Err(err) => {
                warn!(mailbox = %name, "cannot sync mailbox: {err}");
                trace!("{err:?}");
            }
        }

        let delay: Duration = match retry.next(res) {
            RetryState::Ok(_) => poll_interval,
            RetryState::Retry(delay) => {
                debug!(mailbox = %name, attempt = retry.attempts, "retrying in {delay:?}");
                delay
            }
            RetryState::GaveUp => {
                warn!(mailbox = %name, "too many failed attempts, waiting for next poll");
                poll_interval
            }
        };

        tokio::select! {
            _ = shutdown.notified() => break,
            _ = time::sleep(delay) => (),
        }
    }
}
