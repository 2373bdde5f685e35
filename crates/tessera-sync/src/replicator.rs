//! Replicators: configured push targets with a collection scope.
//!
//! Each replicator owns a worker task. The worker pushes document heads to its
//! peer and keeps failed pushes in a persisted pending set, retrying them on a
//! bounded backoff schedule. Once the schedule is exhausted the replicator is
//! marked degraded and waits for the next local write or a manual retry.

use crate::engine::Inner;
use crate::network::PeerId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tessera_core::DocId;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Collections a replicator covers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "collections", rename_all = "snake_case")]
pub enum ReplicatorScope {
    All,
    Collections(BTreeSet<String>),
}

impl ReplicatorScope {
    pub fn collections<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ReplicatorScope::Collections(names.into_iter().map(Into::into).collect())
    }

    pub fn includes(&self, collection: &str) -> bool {
        match self {
            ReplicatorScope::All => true,
            ReplicatorScope::Collections(names) => names.contains(collection),
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, ReplicatorScope::Collections(names) if names.is_empty())
    }

    pub(crate) fn union(&self, other: &ReplicatorScope) -> ReplicatorScope {
        match (self, other) {
            (ReplicatorScope::Collections(a), ReplicatorScope::Collections(b)) => {
                ReplicatorScope::Collections(a.union(b).cloned().collect())
            }
            _ => ReplicatorScope::All,
        }
    }

    /// Collections of `self` not covered by `before`, resolved against `known`.
    pub(crate) fn added_since(&self, before: Option<&ReplicatorScope>, known: &[String]) -> Vec<String> {
        known
            .iter()
            .filter(|c| self.includes(c) && !before.map(|b| b.includes(c)).unwrap_or(false))
            .cloned()
            .collect()
    }

    /// Remove `names`. An `All` scope is first expanded to `known`.
    pub(crate) fn without(&self, names: &BTreeSet<String>, known: &[String]) -> ReplicatorScope {
        let current: BTreeSet<String> = match self {
            ReplicatorScope::All => known.iter().cloned().collect(),
            ReplicatorScope::Collections(existing) => existing.clone(),
        };
        ReplicatorScope::Collections(current.difference(names).cloned().collect())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicatorStatus {
    Active,
    /// A push failed and a retry is scheduled.
    Retrying,
    /// Every scheduled retry failed.
    Degraded,
}

/// A document whose heads still have to reach the replicator.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PendingPush {
    pub collection: String,
    pub doc_id: DocId,
}

/// A persisted replicator record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Replicator {
    pub peer: PeerId,
    pub scope: ReplicatorScope,
    pub status: ReplicatorStatus,
    pub last_status_change: DateTime<Utc>,
    pub pending: BTreeSet<PendingPush>,
}

impl Replicator {
    pub fn new(peer: PeerId, scope: ReplicatorScope) -> Self {
        Self {
            peer,
            scope,
            status: ReplicatorStatus::Active,
            last_status_change: Utc::now(),
            pending: BTreeSet::new(),
        }
    }

    /// Returns `true` if the status changed.
    pub(crate) fn set_status(&mut self, status: ReplicatorStatus) -> bool {
        if self.status == status {
            return false;
        }
        self.status = status;
        self.last_status_change = Utc::now();
        true
    }
}

pub(crate) enum Command {
    Push(PendingPush),
    Retry,
}

/// Engine-side handle to a running worker.
pub(crate) struct ReplicatorHandle {
    tx: mpsc::UnboundedSender<Command>,
    cancel: CancellationToken,
}

impl ReplicatorHandle {
    pub(crate) fn push(&self, job: PendingPush) {
        let _ = self.tx.send(Command::Push(job));
    }

    pub(crate) fn retry(&self) {
        let _ = self.tx.send(Command::Retry);
    }

    pub(crate) fn stop(&self) {
        self.cancel.cancel();
    }
}

pub(crate) fn spawn_worker(inner: Arc<Inner>, peer: PeerId) -> ReplicatorHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let cancel = inner.shutdown_token().child_token();
    let worker = Worker {
        inner: inner.clone(),
        peer,
        rx,
        cancel: cancel.clone(),
        backoff: None,
    };
    inner.tasks().spawn(worker.run());
    ReplicatorHandle { tx, cancel }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Trigger {
    Command,
    Timer,
}

struct Worker {
    inner: Arc<Inner>,
    peer: PeerId,
    rx: mpsc::UnboundedReceiver<Command>,
    cancel: CancellationToken,
    /// Index into the retry schedule and when that retry is due.
    backoff: Option<(usize, Instant)>,
}

impl Worker {
    async fn run(mut self) {
        debug!(peer = %self.peer, "replicator worker started");
        if !self.inner.replicator_pending(&self.peer).is_empty() {
            self.flush(Trigger::Command).await;
        }

        loop {
            let deadline = self.backoff.map(|(_, at)| at);
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                command = self.rx.recv() => match command {
                    Some(Command::Push(job)) => {
                        self.inner.add_pending(&self.peer, &self.cancel, job);
                        self.flush(Trigger::Command).await;
                    }
                    Some(Command::Retry) => self.flush(Trigger::Command).await,
                    None => break,
                },
                _ = sleep_until_deadline(deadline) => self.flush(Trigger::Timer).await,
            }
        }
        debug!(peer = %self.peer, "replicator worker stopped");
    }

    async fn flush(&mut self, trigger: Trigger) {
        let failure = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                debug!(peer = %self.peer, "replicator stopped during push");
                return;
            }
            failure = self.push_pending() => failure,
        };
        let Some(error) = failure else {
            self.backoff = None;
            if self.inner.set_replicator_status(&self.peer, &self.cancel, ReplicatorStatus::Active) {
                info!(peer = %self.peer, "replicator active");
            }
            return;
        };

        // A write while retrying keeps the current schedule
        if trigger == Trigger::Command && self.backoff.is_some() {
            return;
        }
        let step = match (trigger, self.backoff) {
            (Trigger::Timer, Some((step, _))) => step + 1,
            _ => 0,
        };
        match self.inner.config().retry_intervals.get(step) {
            Some(delay) => {
                self.backoff = Some((step, Instant::now() + *delay));
                self.inner.set_replicator_status(&self.peer, &self.cancel, ReplicatorStatus::Retrying);
                warn!(peer = %self.peer, attempt = step + 1, delay = ?delay, error = %error, "replicator push failed, retrying");
            }
            None => {
                self.backoff = None;
                self.inner.set_replicator_status(&self.peer, &self.cancel, ReplicatorStatus::Degraded);
                warn!(peer = %self.peer, error = %error, "replicator degraded");
            }
        }
    }

    /// Push every pending document. Returns the first transient failure.
    async fn push_pending(&self) -> Option<crate::error::SyncError> {
        for job in self.inner.replicator_pending(&self.peer) {
            match self.inner.push_doc(&self.peer, &job).await {
                Ok(()) => self.inner.complete_pending(&self.peer, &self.cancel, &job),
                Err(e) if e.is_retryable() => return Some(e),
                Err(e) => {
                    warn!(peer = %self.peer, doc_id = %job.doc_id, error = %e, "dropping push");
                    self.inner.complete_pending(&self.peer, &self.cancel, &job);
                }
            }
        }
        None
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}
