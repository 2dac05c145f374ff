//! Turns creation events into concurrently running sessions.
//!
//! The event loop never waits on a session: each accepted event is spawned
//! immediately and the spawned task waits for a concurrency permit. Only
//! `Create` events whose file name is a valid request id start sessions.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};

use crate::request::RequestId;
use crate::session::{Session, SessionContext, SessionOutcome, SessionState};
use crate::watcher::{FileEvent, FileEventKind, Subscription};

/// Tally of finished sessions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    /// Sessions spawned.
    pub started: usize,
    /// Events that did not name a request.
    pub ignored: usize,
    /// Sessions that got a reply.
    pub replied: usize,
    /// Sessions that ran out of time.
    pub timed_out: usize,
    /// Sessions that failed.
    pub failed: usize,
}

impl SessionStats {
    fn record(&mut self, outcome: &SessionOutcome) {
        match outcome.state() {
            SessionState::Replied => self.replied += 1,
            SessionState::TimedOut => self.timed_out += 1,
            _ => self.failed += 1,
        }
    }
}

type TaskResult = (RequestId, Option<SessionOutcome>);

/// Spawns one [`Session`] per detected request, bounded by a semaphore.
#[derive(Debug)]
pub struct Orchestrator {
    ctx: SessionContext,
    permits: Arc<Semaphore>,
    tasks: JoinSet<TaskResult>,
    in_flight: HashSet<RequestId>,
    stats: SessionStats,
}

impl Orchestrator {
    /// Orchestrator running at most `max_sessions` sessions at a time.
    pub fn new(ctx: SessionContext, max_sessions: usize) -> Self {
        Self {
            ctx,
            permits: Arc::new(Semaphore::new(max_sessions.max(1))),
            tasks: JoinSet::new(),
            in_flight: HashSet::new(),
            stats: SessionStats::default(),
        }
    }

    /// Number of sessions not yet finished (running or waiting for a permit).
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Counters so far.
    pub fn stats(&self) -> SessionStats {
        self.stats
    }

    /// Spawn a session for `event` if it announces a new request.
    ///
    /// Returns the request id of the spawned session.
    pub fn handle_event(&mut self, event: &FileEvent) -> Option<RequestId> {
        if event.kind != FileEventKind::Create {
            return None;
        }
        let Some(name) = event.file_name() else {
            self.stats.ignored += 1;
            return None;
        };
        let id = match RequestId::parse(name) {
            Ok(id) => id,
            Err(e) => {
                log::debug!("[Orchestrator] Ignoring {}: {e}", event.path.display());
                self.stats.ignored += 1;
                return None;
            }
        };
        if !self.in_flight.insert(id.clone()) {
            log::debug!("[Orchestrator] Request {id} already has a session");
            return None;
        }

        let session = Session::new(id.clone(), self.ctx.clone());
        let permits = Arc::clone(&self.permits);
        let task_id = id.clone();
        self.tasks.spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                log::warn!("[Orchestrator] Session limiter closed, dropping {task_id}");
                return (task_id, None);
            };
            // Inner task so a panicking session still reports its id.
            match tokio::spawn(session.run()).await {
                Ok(outcome) => (task_id, Some(outcome)),
                Err(e) => {
                    log::error!("[Orchestrator] Session {task_id} panicked: {e}");
                    (task_id, None)
                }
            }
        });
        self.stats.started += 1;
        log::info!("[Orchestrator] Started session for {id} ({} in flight)", self.in_flight.len());
        Some(id)
    }

    fn reap(&mut self, joined: Result<TaskResult, JoinError>) {
        match joined {
            Ok((id, outcome)) => {
                self.in_flight.remove(&id);
                match outcome {
                    Some(outcome) => {
                        log::info!("[Orchestrator] Session {id} ended: {}", outcome.state());
                        self.stats.record(&outcome);
                    }
                    None => self.stats.failed += 1,
                }
            }
            Err(e) => {
                log::error!("[Orchestrator] Session task failed: {e}");
                self.stats.failed += 1;
            }
        }
    }

    /// Consume `events` until the stream ends, then wait for every running
    /// session to finish.
    pub async fn run(mut self, mut events: Subscription) -> SessionStats {
        log::info!("[Orchestrator] Waiting for requests");
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => {
                        self.handle_event(&event);
                    }
                    None => break,
                },
                Some(joined) = self.tasks.join_next(), if !self.tasks.is_empty() => {
                    self.reap(joined);
                }
            }
        }

        log::info!(
            "[Orchestrator] Event stream ended, waiting for {} session(s)",
            self.tasks.len()
        );
        while let Some(joined) = self.tasks.join_next().await {
            self.reap(joined);
        }
        self.stats
    }
}
