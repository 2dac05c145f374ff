//! Application-wide constants for sim-relay.
//!
//! This module centralizes the protocol constants and configuration
//! defaults. Constants are grouped by domain.
//!
//! # Categories
//!
//! - **Session**: Debounce, poll interval and deadline defaults
//! - **Watcher**: Subscriber queue sizing
//! - **IPC**: Message size limits and socket permissions
//! - **Relay**: HTTP endpoints and timeouts

use std::time::Duration;

// ============================================================================
// Session
// ============================================================================

/// Delay between a creation event and connecting to the new endpoint.
///
/// The requester creates its socket file before it starts listening, so
/// connecting immediately can race the `listen()` call.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_secs(1);

/// Fixed interval between reply store polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Overall deadline for a session's poll loop.
pub const DEFAULT_SESSION_DEADLINE: Duration = Duration::from_secs(60);

/// Upper bound on concurrently running sessions.
pub const DEFAULT_MAX_SESSIONS: usize = 64;

// ============================================================================
// Watcher
// ============================================================================

/// Capacity of each subscriber's event queue.
///
/// Events for a subscriber whose queue is full are dropped for that
/// subscriber only. The directory can always be re-listed.
pub const SUBSCRIBER_QUEUE_CAPACITY: usize = 10;

// ============================================================================
// IPC
// ============================================================================

/// Largest request or reply message read from an endpoint.
pub const MAX_MESSAGE_SIZE: usize = 1_000_000;

/// Listen backlog for requester endpoints.
pub const ENDPOINT_BACKLOG: i32 = 5;

/// Permissions of a requester endpoint socket file.
pub const ENDPOINT_MODE: u32 = 0o660;

/// Length of generated request ids (hex chars, 4 bits each).
pub const REQUEST_ID_LEN: usize = 32;

// sun_path is 104 on macOS, 108 on Linux; use conservative limit
/// Longest socket path accepted when binding or connecting.
pub const MAX_SOCKET_PATH: usize = 104;

// ============================================================================
// Relay
// ============================================================================

/// Default base URL of the relay functions.
pub const DEFAULT_RELAY_URL: &str = "https://europe-west2-simapprover.cloudfunctions.net/";

/// Default directory holding requester endpoints.
pub const DEFAULT_SOCK_DIR: &str = "/var/run/sim";

/// HTTP client request timeout for relay calls.
pub const HTTP_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Push dispatch endpoint, relative to the relay base URL.
pub const PUSH_ENDPOINT: &str = "request";

/// Reply poll endpoint, relative to the relay base URL.
pub const POLL_ENDPOINT: &str = "poll-reply";

/// Reply write endpoint, relative to the relay base URL.
pub const REPLY_ENDPOINT: &str = "reply";

// ============================================================================
// Crypto
// ============================================================================

/// Environment variable holding the shared secret.
pub const SECRET_ENV_VAR: &str = "SIM_PIN";

/// Known plaintext for the startup encryption self-test.
pub const SELF_TEST_PLAINTEXT: &[u8] = b"hello world";
