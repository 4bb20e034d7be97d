//! Error types for the pooled ESL transport

use thiserror::Error;

/// Result alias used throughout the crate.
pub type EslResult<T> = Result<T, EslError>;

/// Errors produced by the codec, transports, pool, dispatcher and client.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum EslError {
    /// TCP dial or authentication handshake failed.
    #[error("connect to {addr} failed: {reason}")]
    Connect {
        /// `host:port` that was dialed.
        addr: String,
        /// What went wrong.
        reason: String,
    },

    /// A frame could not be read or written. The transport is dead afterwards.
    #[error("frame error: {message}")]
    Frame {
        /// What went wrong.
        message: String,
        /// Underlying socket error, if any.
        #[source]
        source: Option<std::io::Error>,
    },

    /// The pool was closed.
    #[error("connection pool is closed")]
    PoolClosed,

    /// The caller's deadline or cancellation fired while waiting for a transport.
    #[error("timed out waiting for a pooled connection")]
    PoolTimeout,

    /// The decoder rejected a frame.
    #[error("decode error: {message}")]
    Decode {
        /// What went wrong.
        message: String,
    },

    /// Caller-supplied command text would break protocol framing.
    #[error("protocol error: {message}")]
    Protocol {
        /// What went wrong.
        message: String,
    },

    /// Pool configuration rejected by [`PoolConfig::validate`](crate::PoolConfig::validate).
    #[error("invalid configuration: {message}")]
    InvalidConfig {
        /// What went wrong.
        message: String,
    },

    /// Reply-Text started with `-ERR`.
    #[error("command failed: {reply_text}")]
    CommandFailed {
        /// Raw `Reply-Text` value.
        reply_text: String,
    },

    /// Reply-Text was neither `+OK` nor `-ERR`.
    #[error("unexpected reply: {reply_text}")]
    UnexpectedReply {
        /// Raw `Reply-Text` value.
        reply_text: String,
    },

    /// A command did not complete within its deadline.
    #[error("operation timed out after {timeout_ms}ms")]
    Timeout {
        /// Deadline that elapsed.
        timeout_ms: u64,
    },

    /// Dispatcher backlog was full and the event was dropped.
    #[error("event queue full, event dropped")]
    QueueFull,

    /// Dispatcher workers are gone.
    #[error("event dispatcher is shut down")]
    DispatcherClosed,
}

impl EslError {
    pub(crate) fn connect(addr: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Connect {
            addr: addr.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn frame(message: impl Into<String>) -> Self {
        Self::Frame {
            message: message.into(),
            source: None,
        }
    }

    pub(crate) fn frame_io(message: impl Into<String>, source: std::io::Error) -> Self {
        Self::Frame {
            message: message.into(),
            source: Some(source),
        }
    }

    pub(crate) fn decode(message: impl Into<String>) -> Self {
        Self::Decode {
            message: message.into(),
        }
    }

    pub(crate) fn protocol_error(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    pub(crate) fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    /// `true` for errors after which the transport that produced them is unusable.
    pub fn is_transport_fatal(&self) -> bool {
        matches!(self, EslError::Frame { .. } | EslError::Timeout { .. })
    }
}
