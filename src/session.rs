//! One request's life, from detection to reply.
//!
//! ```text
//! Detected ─► RequestRead ─► Sent ─► Polling ─┬─► Replied
//!    │             │           │        │     └─► TimedOut
//!    └─────────────┴───────────┴────────┴───────► Failed
//! ```
//!
//! A session talks to its collaborators only through the
//! [`RequestChannel`], [`Dispatcher`] and [`ReplyStore`] seams, so tests
//! drive it with in-memory fakes and a paused clock.

// Rust guideline compliant 2026-02

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{sleep, sleep_until, timeout_at, Instant};

use crate::config::Config;
use crate::constants;
use crate::crypto::{self, CorrelationTag, CryptoError, DerivedKey};
use crate::ipc::{IpcError, RequestChannel};
use crate::relay::{Dispatcher, ReplyStore};
use crate::request::{Request, RequestId};

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Creation event seen, waiting out the debounce.
    Detected,
    /// Request payload read from the endpoint.
    RequestRead,
    /// Sealed request accepted by at least one device.
    Sent,
    /// Waiting for a reply in the relay store.
    Polling,
    /// Reply decrypted and handed to the requester.
    Replied,
    /// No reply before the deadline.
    TimedOut,
    /// Unrecoverable local error.
    Failed,
}

impl SessionState {
    /// Whether the session has ended.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Replied | Self::TimedOut | Self::Failed)
    }

    /// Whether `self -> next` is a legal transition.
    pub fn can_transition_to(self, next: Self) -> bool {
        match (self, next) {
            (from, Self::Failed) => !from.is_terminal(),
            (Self::Detected, Self::RequestRead)
            | (Self::RequestRead, Self::Sent)
            | (Self::Sent, Self::Polling)
            | (Self::Polling, Self::Replied | Self::TimedOut) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

/// Why a session failed.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Reading the request failed.
    #[error("ipc: {0}")]
    Ipc(#[from] IpcError),
    /// Sealing, tagging or opening failed.
    #[error("crypto: {0}")]
    Crypto(#[from] CryptoError),
    /// Not a single device accepted the push.
    #[error("push dispatch failed for all {0} device(s)")]
    DispatchFailed(usize),
    /// A state change that the lifecycle does not allow.
    #[error("illegal session transition {from} -> {to}")]
    IllegalTransition {
        /// Current state.
        from: SessionState,
        /// Requested state.
        to: SessionState,
    },
}

/// How a session ended.
#[derive(Debug)]
pub enum SessionOutcome {
    /// A reply was decrypted. `delivered` is false if handing it to the
    /// requester failed.
    Replied {
        /// Whether the requester received the reply.
        delivered: bool,
    },
    /// The deadline passed without a reply.
    TimedOut,
    /// The session hit an unrecoverable error.
    Failed(SessionError),
}

impl SessionOutcome {
    /// Terminal state corresponding to this outcome.
    pub fn state(&self) -> SessionState {
        match self {
            Self::Replied { .. } => SessionState::Replied,
            Self::TimedOut => SessionState::TimedOut,
            Self::Failed(_) => SessionState::Failed,
        }
    }
}

/// Timing knobs for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSettings {
    /// Delay between detection and the first connect.
    pub debounce: Duration,
    /// Delay between reply store polls.
    pub poll_interval: Duration,
    /// Polling budget, counted from entering [`SessionState::Polling`].
    pub deadline: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            debounce: constants::DEFAULT_DEBOUNCE,
            poll_interval: constants::DEFAULT_POLL_INTERVAL,
            deadline: constants::DEFAULT_SESSION_DEADLINE,
        }
    }
}

impl From<&Config> for SessionSettings {
    fn from(config: &Config) -> Self {
        Self {
            debounce: config.debounce(),
            poll_interval: config.poll_interval(),
            deadline: config.session_deadline(),
        }
    }
}

/// Read-only state shared by every session.
#[derive(Clone)]
pub struct SessionContext {
    /// Key derived from the shared secret.
    pub key: Arc<DerivedKey>,
    /// Requester endpoints.
    pub channel: Arc<dyn RequestChannel>,
    /// Push dispatch.
    pub dispatcher: Arc<dyn Dispatcher>,
    /// Reply store.
    pub store: Arc<dyn ReplyStore>,
    /// Device tokens every request is pushed to.
    pub devices: Arc<[String]>,
    /// Timing.
    pub settings: SessionSettings,
}

impl std::fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionContext")
            .field("devices", &self.devices.len())
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

/// A single request's state machine.
#[derive(Debug)]
pub struct Session {
    id: RequestId,
    state: SessionState,
    ctx: SessionContext,
}

impl Session {
    /// New session in [`SessionState::Detected`].
    pub fn new(id: RequestId, ctx: SessionContext) -> Self {
        Self {
            id,
            state: SessionState::Detected,
            ctx,
        }
    }

    /// Request id.
    pub fn id(&self) -> &RequestId {
        &self.id
    }

    /// Current state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    fn advance(&mut self, next: SessionState) -> Result<(), SessionError> {
        if !self.state.can_transition_to(next) {
            return Err(SessionError::IllegalTransition {
                from: self.state,
                to: next,
            });
        }
        log::debug!("[Session] {}: {} -> {}", self.id, self.state, next);
        self.state = next;
        Ok(())
    }

    /// Drive the session to a terminal state.
    pub async fn run(mut self) -> SessionOutcome {
        match self.drive().await {
            Ok(outcome) => outcome,
            Err(e) => {
                log::error!("[Session] {} failed in {}: {e}", self.id, self.state);
                self.state = SessionState::Failed;
                SessionOutcome::Failed(e)
            }
        }
    }

    async fn drive(&mut self) -> Result<SessionOutcome, SessionError> {
        let ctx = self.ctx.clone();

        sleep(ctx.settings.debounce).await;
        log::info!("[Session] Picked up request {}", self.id);

        let request = Request {
            id: self.id.clone(),
            payload: ctx.channel.read_request(&self.id).await?,
        };
        self.advance(SessionState::RequestRead)?;

        let sealed = crypto::seal(&ctx.key, &request.payload)?;
        let tag = crypto::correlation_tag(&ctx.key, request.id.as_str())?;
        let report = ctx.dispatcher.send(&ctx.devices, &sealed).await;
        if report.all_failed() {
            return Err(SessionError::DispatchFailed(report.failed.len()));
        }
        log::info!(
            "[Session] {} pushed to {}/{} device(s)",
            self.id,
            report.delivered.len(),
            report.delivered.len() + report.failed.len()
        );
        self.advance(SessionState::Sent)?;

        self.advance(SessionState::Polling)?;
        let deadline = Instant::now() + ctx.settings.deadline;
        let Some(sealed_reply) = self.poll(&tag, deadline).await else {
            log::info!("[Session] {} timed out waiting for a reply", self.id);
            self.advance(SessionState::TimedOut)?;
            return Ok(SessionOutcome::TimedOut);
        };

        let plaintext = crypto::open(&ctx.key, &sealed_reply)?;
        self.advance(SessionState::Replied)?;
        log::info!("[Session] Got reply for {} (tag {tag})", self.id);

        let delivered = match ctx.channel.send_reply(&self.id, &plaintext).await {
            Ok(()) => true,
            Err(e) => {
                log::error!("[Session] Failed to deliver reply for {}: {e}", self.id);
                false
            }
        };
        Ok(SessionOutcome::Replied { delivered })
    }

    /// Poll until a non-empty value or the deadline. Fetch errors are
    /// retried; a fetch still in flight at the deadline is abandoned.
    async fn poll(&self, tag: &CorrelationTag, deadline: Instant) -> Option<String> {
        let store = &self.ctx.store;
        loop {
            match timeout_at(deadline, store.fetch(tag)).await {
                Err(_elapsed) => return None,
                Ok(Ok(Some(sealed))) => return Some(sealed),
                Ok(Ok(None)) => log::debug!("[Session] {}: no reply yet", self.id),
                Ok(Err(e)) => log::warn!("[Session] Poll error for {}: {e}", self.id),
            }

            let next = Instant::now() + self.ctx.settings.poll_interval;
            if next >= deadline {
                sleep_until(deadline).await;
                return None;
            }
            sleep_until(next).await;
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::crypto::{derive_key, SharedSecret};
    use crate::relay::{DispatchReport, RelayError};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    pub(crate) fn key() -> Arc<DerivedKey> {
        Arc::new(derive_key(&SharedSecret::new("1234")).unwrap())
    }

    #[derive(Default)]
    pub(crate) struct FakeChannel {
        pub fail_read: bool,
        pub fail_reply: bool,
        pub reads: Mutex<Vec<RequestId>>,
        pub replies: Mutex<Vec<(RequestId, Vec<u8>)>>,
    }

    #[async_trait]
    impl RequestChannel for FakeChannel {
        async fn read_request(&self, id: &RequestId) -> Result<Vec<u8>, IpcError> {
            self.reads.lock().unwrap().push(id.clone());
            if self.fail_read {
                return Err(IpcError::Closed(id.as_str().into()));
            }
            Ok(format!("request {id}").into_bytes())
        }

        async fn send_reply(&self, id: &RequestId, payload: &[u8]) -> Result<(), IpcError> {
            if self.fail_reply {
                return Err(IpcError::Closed(id.as_str().into()));
            }
            self.replies
                .lock()
                .unwrap()
                .push((id.clone(), payload.to_vec()));
            Ok(())
        }
    }

    #[derive(Default)]
    pub(crate) struct FakeDispatcher {
        pub reject_all: bool,
        /// Tokens rejected even when `reject_all` is false.
        pub rejected: Vec<String>,
        pub sent: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Dispatcher for FakeDispatcher {
        async fn send(&self, devices: &[String], sealed: &str) -> DispatchReport {
            self.sent.lock().unwrap().push(sealed.to_string());
            let mut report = DispatchReport::default();
            for token in devices {
                if self.reject_all || self.rejected.contains(token) {
                    report.failed.push((token.clone(), "rejected".into()));
                } else {
                    report.delivered.push(token.clone());
                }
            }
            report
        }
    }

    /// Replays scripted fetch results, then reports "no reply" forever.
    #[derive(Default)]
    pub(crate) struct FakeStore {
        pub script: Mutex<VecDeque<Result<Option<String>, RelayError>>>,
        pub hang: bool,
        pub fetches: AtomicUsize,
        pub tags: Mutex<Vec<String>>,
    }

    impl FakeStore {
        pub(crate) fn scripted(
            results: impl IntoIterator<Item = Result<Option<String>, RelayError>>,
        ) -> Self {
            Self {
                script: Mutex::new(results.into_iter().collect()),
                ..Self::default()
            }
        }
    }

    #[async_trait]
    impl ReplyStore for FakeStore {
        async fn fetch(&self, tag: &CorrelationTag) -> Result<Option<String>, RelayError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            self.tags.lock().unwrap().push(tag.to_string());
            if self.hang {
                std::future::pending::<()>().await;
            }
            self.script.lock().unwrap().pop_front().unwrap_or(Ok(None))
        }

        async fn store(&self, _tag: &CorrelationTag, _sealed: &str) -> Result<(), RelayError> {
            Ok(())
        }
    }

    struct Harness {
        channel: Arc<FakeChannel>,
        dispatcher: Arc<FakeDispatcher>,
        store: Arc<FakeStore>,
    }

    impl Harness {
        fn new(channel: FakeChannel, dispatcher: FakeDispatcher, store: FakeStore) -> Self {
            Self {
                channel: Arc::new(channel),
                dispatcher: Arc::new(dispatcher),
                store: Arc::new(store),
            }
        }

        fn session(&self, id: &str) -> Session {
            let ctx = SessionContext {
                key: key(),
                channel: Arc::clone(&self.channel) as Arc<dyn RequestChannel>,
                dispatcher: Arc::clone(&self.dispatcher) as Arc<dyn Dispatcher>,
                store: Arc::clone(&self.store) as Arc<dyn ReplyStore>,
                devices: vec!["token-a".to_string(), "token-b".to_string()].into(),
                settings: SessionSettings::default(),
            };
            Session::new(RequestId::parse(id).unwrap(), ctx)
        }
    }

    fn sealed(plaintext: &str) -> String {
        crypto::seal(&key(), plaintext.as_bytes()).unwrap()
    }

    #[test]
    fn test_transitions() {
        use SessionState::*;
        assert!(Detected.can_transition_to(RequestRead));
        assert!(Polling.can_transition_to(TimedOut));
        assert!(Sent.can_transition_to(Failed));
        assert!(!Detected.can_transition_to(Polling));
        assert!(!Replied.can_transition_to(Failed));
        assert!(!TimedOut.can_transition_to(Polling));
        assert!(!Polling.can_transition_to(Sent));
    }

    #[test]
    fn test_illegal_transition_rejected() {
        let harness = Harness::new(
            FakeChannel::default(),
            FakeDispatcher::default(),
            FakeStore::default(),
        );
        let mut session = harness.session("ABC123");
        let err = session.advance(SessionState::Replied).unwrap_err();
        assert!(matches!(err, SessionError::IllegalTransition { .. }));
        assert_eq!(session.state(), SessionState::Detected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reply_after_empty_polls() {
        let harness = Harness::new(
            FakeChannel::default(),
            FakeDispatcher::default(),
            FakeStore::scripted([Ok(None), Ok(None), Ok(None), Ok(Some(sealed("approved")))]),
        );
        let session = harness.session("ABC123");
        let start = Instant::now();

        let outcome = session.run().await;

        assert!(matches!(outcome, SessionOutcome::Replied { delivered: true }));
        assert_eq!(harness.store.fetches.load(Ordering::SeqCst), 4);
        // 1s debounce, then fetches at 0, 2, 4, 6 seconds into polling.
        assert_eq!(start.elapsed(), Duration::from_secs(7));

        let replies = harness.channel.replies.lock().unwrap();
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].0.as_str(), "ABC123");
        assert_eq!(replies[0].1, b"approved");
    }

    #[tokio::test(start_paused = true)]
    async fn test_push_carries_sealed_request_and_tag_hides_id() {
        let harness = Harness::new(
            FakeChannel::default(),
            FakeDispatcher::default(),
            FakeStore::scripted([Ok(Some(sealed("ok")))]),
        );
        harness.session("ABC123").run().await;

        let sent = harness.dispatcher.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        let opened = crypto::open(&key(), &sent[0]).unwrap();
        assert_eq!(opened, b"request ABC123");

        let tags = harness.store.tags.lock().unwrap();
        assert_eq!(
            tags[0],
            "6538ce3ad0b51c628a1a99d9b6c989c9ff6c68e9dea5c5853b22329e727dbee4"
        );
        assert!(!sent[0].contains("ABC123"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_times_out_exactly_at_deadline() {
        let harness = Harness::new(
            FakeChannel::default(),
            FakeDispatcher::default(),
            FakeStore::default(),
        );
        let start = Instant::now();

        let outcome = harness.session("ABC123").run().await;

        assert!(matches!(outcome, SessionOutcome::TimedOut));
        assert_eq!(start.elapsed(), Duration::from_secs(61));
        // Fetches at 0, 2, ..., 58 seconds.
        assert_eq!(harness.store.fetches.load(Ordering::SeqCst), 30);
        assert!(harness.channel.replies.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_fetch_abandoned_at_deadline() {
        let store = FakeStore {
            hang: true,
            ..FakeStore::default()
        };
        let harness = Harness::new(FakeChannel::default(), FakeDispatcher::default(), store);
        let start = Instant::now();

        let outcome = harness.session("ABC123").run().await;

        assert!(matches!(outcome, SessionOutcome::TimedOut));
        assert_eq!(start.elapsed(), Duration::from_secs(61));
        assert_eq!(harness.store.fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_retried() {
        let error = || RelayError::Status {
            status: 503,
            body: "busy".into(),
        };
        let harness = Harness::new(
            FakeChannel::default(),
            FakeDispatcher::default(),
            FakeStore::scripted([Err(error()), Err(error()), Ok(Some(sealed("yes")))]),
        );

        let outcome = harness.session("ABC123").run().await;

        assert!(matches!(outcome, SessionOutcome::Replied { delivered: true }));
        assert_eq!(harness.store.fetches.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_undecryptable_reply_fails() {
        let other_key = derive_key(&SharedSecret::new("9999")).unwrap();
        let foreign = crypto::seal(&other_key, b"approved").unwrap();
        let harness = Harness::new(
            FakeChannel::default(),
            FakeDispatcher::default(),
            FakeStore::scripted([Ok(Some(foreign))]),
        );

        let outcome = harness.session("ABC123").run().await;

        assert!(matches!(
            outcome,
            SessionOutcome::Failed(SessionError::Crypto(CryptoError::Authentication))
        ));
        assert!(harness.channel.replies.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_device_accepted_keeps_session_going() {
        let dispatcher = FakeDispatcher {
            rejected: vec!["token-a".to_string()],
            ..FakeDispatcher::default()
        };
        let harness = Harness::new(
            FakeChannel::default(),
            dispatcher,
            FakeStore::scripted([Ok(None), Ok(Some(sealed("approved")))]),
        );

        let outcome = harness.session("ABC123").run().await;

        assert!(matches!(outcome, SessionOutcome::Replied { delivered: true }));
        assert!(harness.store.fetches.load(Ordering::SeqCst) >= 1);
        assert_eq!(harness.channel.replies.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_devices_rejected_fails_without_polling() {
        let dispatcher = FakeDispatcher {
            reject_all: true,
            ..FakeDispatcher::default()
        };
        let harness = Harness::new(FakeChannel::default(), dispatcher, FakeStore::default());

        let outcome = harness.session("ABC123").run().await;

        assert!(matches!(
            outcome,
            SessionOutcome::Failed(SessionError::DispatchFailed(2))
        ));
        assert_eq!(harness.store.fetches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_failure_fails() {
        let channel = FakeChannel {
            fail_read: true,
            ..FakeChannel::default()
        };
        let harness = Harness::new(channel, FakeDispatcher::default(), FakeStore::default());

        let outcome = harness.session("ABC123").run().await;

        assert!(matches!(outcome, SessionOutcome::Failed(SessionError::Ipc(_))));
        assert_eq!(outcome.state(), SessionState::Failed);
        assert!(harness.dispatcher.sent.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_delivery_failure_still_replied() {
        let channel = FakeChannel {
            fail_reply: true,
            ..FakeChannel::default()
        };
        let harness = Harness::new(
            channel,
            FakeDispatcher::default(),
            FakeStore::scripted([Ok(Some(sealed("approved")))]),
        );

        let outcome = harness.session("ABC123").run().await;

        assert!(matches!(outcome, SessionOutcome::Replied { delivered: false }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_debounce_before_read() {
        let harness = Harness::new(
            FakeChannel::default(),
            FakeDispatcher::default(),
            FakeStore::scripted([Ok(Some(sealed("ok")))]),
        );
        let session = harness.session("ABC123");
        let handle = tokio::spawn(session.run());

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(harness.channel.reads.lock().unwrap().is_empty());

        handle.await.unwrap();
        assert_eq!(harness.channel.reads.lock().unwrap().len(), 1);
    }
}
