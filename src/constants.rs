//! Protocol constants and default tunables

use std::time::Duration;

/// Default FreeSWITCH ESL port for inbound connections
pub const DEFAULT_ESL_PORT: u16 = 8021;

/// Default ESL shared secret shipped with FreeSWITCH
pub const DEFAULT_ESL_PASSWORD: &str = "ClueCon";

/// Maximum single frame body (8MB) - validates Content-Length header
/// No legitimate ESL message should exceed this (largest is sofia status ~1-2MB)
pub const MAX_MESSAGE_SIZE: usize = 8 * 1024 * 1024;

/// Protocol message terminators
pub const HEADER_TERMINATOR: &str = "\n\n";
pub const LINE_TERMINATOR: &str = "\n";

/// Literal the server puts in its reply to a successful `auth`.
pub const AUTH_ACCEPTED_MARKER: &str = "+OK accepted";

/// Liveness probe. Not an ESL verb; any non-event reply counts as alive.
pub const PROBE_MESSAGE: &str = "ping\n\n";

/// Listener name matching every event.
pub const WILDCARD_EVENT: &str = "*";

/// TCP dial timeout
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Per-frame read deadline
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Per-frame write deadline
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Liveness probe deadline (write and read each)
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// How long `Pool::get` waits for a free transport
pub const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(10);

/// Idle transports older than this are evicted
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Period of the idle-set health check
pub const DEFAULT_HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Period of the idle-set eviction scan
pub const DEFAULT_EVICTION_INTERVAL: Duration = Duration::from_secs(60);

/// Default command round-trip timeout used by the client (5 seconds)
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

/// Default number of concurrent event delivery workers
pub const DEFAULT_DISPATCH_WORKERS: usize = 8;

/// Maximum number of queued deliveries before `dispatch` waits
pub const MAX_EVENT_QUEUE_SIZE: usize = 1000;
