//! SIM relay - forwards local approval requests to remote devices.
//!
//! Requesters create a `SOCK_SEQPACKET` endpoint named after a request id in
//! the socket directory. The relay notices the endpoint, reads the request,
//! encrypts it with a key derived from a shared secret, pushes it to the
//! approving devices, polls an untrusted relay store for the encrypted reply,
//! and hands the decrypted reply back over the endpoint.
//!
//! # Architecture
//!
//! ```text
//! MultiWatcher ─► Orchestrator ─spawn─► Session ─┬─► RequestChannel (ipc)
//!                  (semaphore)                   ├─► Dispatcher   (relay)
//!                                                └─► ReplyStore   (relay)
//! ```
//!
//! # Modules
//!
//! - [`crypto`] - Key derivation, AES-GCM sealing, correlation tags
//! - [`watcher`] - Fan-out directory watcher
//! - [`ipc`] - Per-request Unix socket exchange
//! - [`relay`] - HTTP clients for push dispatch and the reply store
//! - [`session`] - Per-request state machine
//! - [`orchestrator`] - Event loop spawning sessions
//! - [`config`] - Configuration loading/saving

pub mod config;
pub mod constants;
pub mod crypto;
pub mod env;
pub mod ipc;
pub mod orchestrator;
pub mod relay;
pub mod request;
pub mod session;
pub mod watcher;

// Re-export commonly used types
pub use config::Config;
pub use crypto::{CorrelationTag, DerivedKey, SharedSecret};
pub use ipc::{RequestChannel, RequestEndpoint, UnixChannel};
pub use orchestrator::{Orchestrator, SessionStats};
pub use relay::{Dispatcher, RelayClient, ReplyStore};
pub use request::RequestId;
pub use session::{Session, SessionContext, SessionOutcome, SessionSettings, SessionState};
pub use watcher::{MultiWatcher, Subscription};
