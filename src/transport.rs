//! One authenticated ESL socket

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, trace, warn};

use crate::command::Command;
use crate::config::PoolConfig;
use crate::constants::{AUTH_ACCEPTED_MARKER, PROBE_MESSAGE};
use crate::error::{EslError, EslResult};
use crate::headers::{ContentType, Header};
use crate::pool::Slot;
use crate::protocol::{self, Frame};

static NEXT_TRANSPORT_ID: AtomicU64 = AtomicU64::new(1);

type Stream = BufReader<TcpStream>;

/// Run `fut` under `deadline`, turning expiry into a frame error.
async fn with_deadline<T>(
    deadline: Duration,
    what: &str,
    fut: impl Future<Output = EslResult<T>>,
) -> EslResult<T> {
    match timeout(deadline, fut).await {
        Ok(result) => result,
        Err(_) => Err(EslError::frame(format!(
            "{} timed out after {}ms",
            what,
            deadline.as_millis()
        ))),
    }
}

/// Establish a TCP connection with a timeout.
async fn tcp_connect_with_timeout(config: &PoolConfig) -> EslResult<TcpStream> {
    let addr = config.addr();
    match timeout(config.connect_timeout, TcpStream::connect(addr.as_str())).await {
        Ok(Ok(s)) => {
            debug!("[CONNECT] TCP connection established to {}", addr);
            Ok(s)
        }
        Ok(Err(e)) => {
            warn!("[CONNECT] TCP connect to {} failed: {}", addr, e);
            Err(EslError::connect(addr, e.to_string()))
        }
        Err(_) => {
            warn!(
                "[CONNECT] TCP connect to {} timed out after {}ms",
                addr,
                config
                    .connect_timeout
                    .as_millis()
            );
            Err(EslError::connect(
                addr,
                format!(
                    "timed out after {}ms",
                    config
                        .connect_timeout
                        .as_millis()
                ),
            ))
        }
    }
}

/// Send `auth` and wait for the acceptance marker.
///
/// FreeSWITCH opens every inbound socket with an `auth/request` frame; one
/// such greeting is skipped before the reply is checked.
async fn authenticate(stream: &mut Stream, config: &PoolConfig) -> EslResult<()> {
    let auth = Command::auth(&config.password).encode()?;
    debug!("[AUTH] Sending command: auth [REDACTED]");
    with_deadline(
        config.write_timeout,
        "auth write",
        protocol::write_frame(stream.get_mut(), auth.as_bytes()),
    )
    .await?;

    let mut reply = with_deadline(config.read_timeout, "auth read", protocol::read_frame(stream)).await?;
    if reply.content_type() == Some(ContentType::AuthRequest) {
        trace!("[AUTH] Skipping auth/request greeting");
        reply = with_deadline(config.read_timeout, "auth read", protocol::read_frame(stream)).await?;
    }

    if !reply.contains(AUTH_ACCEPTED_MARKER) {
        let reason = reply
            .header(Header::ReplyText)
            .unwrap_or("no reply text");
        return Err(EslError::protocol_error(format!(
            "authentication rejected: {}",
            reason
        )));
    }

    debug!("[AUTH] Authentication successful");
    Ok(())
}

/// Read until the reply to `ping`, dropping events queued ahead of it.
///
/// A subscribed transport may hold event frames that arrived while it sat
/// idle.
async fn read_ping_reply(id: u64, stream: &mut Stream) -> EslResult<Frame> {
    loop {
        let frame = protocol::read_frame(stream).await?;
        match frame.content_type() {
            Some(ct) if ct.is_event() => {
                debug!(
                    "[TRANSPORT] Transport {} dropped {} frame read during liveness check",
                    id, ct
                );
            }
            Some(ContentType::DisconnectNotice) => {
                return Err(EslError::frame("server sent disconnect notice"));
            }
            _ => return Ok(frame),
        }
    }
}

/// An authenticated connection that exchanges whole frames.
///
/// All socket access goes through one async lock, so a frame is never
/// interleaved with another. Any I/O failure, including a deadline, marks
/// the transport dead and drops the socket; a dead transport never comes
/// back.
pub struct Transport {
    id: u64,
    addr: String,
    stream: Mutex<Option<Stream>>,
    alive: AtomicBool,
    last_used: Instant,
    config: Arc<PoolConfig>,
    slot: Option<Slot>,
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("id", &self.id)
            .field("addr", &self.addr)
            .field("alive", &self.is_alive())
            .field("idle_for", &self.idle_for())
            .finish()
    }
}

impl Transport {
    /// Dial and authenticate.
    ///
    /// Fails with [`EslError::Connect`] on a dial error, a handshake I/O
    /// error, or a reply without `+OK accepted`. The socket is closed on
    /// failure.
    pub async fn connect(config: Arc<PoolConfig>) -> EslResult<Self> {
        let addr = config.addr();
        debug!("[CONNECT] Connecting to FreeSWITCH at {}", addr);

        let tcp = tcp_connect_with_timeout(&config).await?;
        let mut stream = BufReader::new(tcp);

        if let Err(e) = authenticate(&mut stream, &config).await {
            warn!("[AUTH] Handshake with {} failed: {}", addr, e);
            let _ = stream
                .get_mut()
                .shutdown()
                .await;
            return Err(match e {
                EslError::Connect { .. } => e,
                other => EslError::connect(addr, other.to_string()),
            });
        }

        let id = NEXT_TRANSPORT_ID.fetch_add(1, Ordering::Relaxed);
        debug!("[CONNECT] Transport {} ready ({})", id, addr);
        Ok(Self {
            id,
            addr,
            stream: Mutex::new(Some(stream)),
            alive: AtomicBool::new(true),
            last_used: Instant::now(),
            config,
            slot: None,
        })
    }

    /// Process-unique identifier.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// `host:port` this transport is connected to.
    pub fn peer(&self) -> &str {
        &self.addr
    }

    /// Liveness flag. No I/O.
    pub fn is_alive(&self) -> bool {
        self.alive
            .load(Ordering::Acquire)
    }

    /// Time since the transport was created or last returned to a pool.
    pub fn idle_for(&self) -> Duration {
        self.last_used
            .elapsed()
    }

    pub(crate) fn touch(&mut self) {
        self.last_used = Instant::now();
    }

    pub(crate) fn attach_slot(&mut self, slot: Slot) {
        self.slot = Some(slot);
    }

    /// Capacity slot, present only on transports a pool created.
    pub(crate) fn slot(&self) -> Option<&Slot> {
        self.slot
            .as_ref()
    }

    fn kill(&self, stream: &mut Option<Stream>, reason: &EslError) {
        if self
            .alive
            .swap(false, Ordering::AcqRel)
        {
            debug!("[TRANSPORT] Transport {} marked dead: {}", self.id, reason);
        }
        stream.take();
    }

    /// Read one frame under the configured read deadline.
    pub async fn read_frame(&self) -> EslResult<Frame> {
        let mut guard = self
            .stream
            .lock()
            .await;
        let Some(stream) = guard.as_mut() else {
            return Err(EslError::frame("transport is closed"));
        };

        let result = with_deadline(
            self.config
                .read_timeout,
            "read",
            protocol::read_frame(stream),
        )
        .await;
        if let Err(ref e) = result {
            self.kill(&mut guard, e);
        }
        result
    }

    /// Write one frame under the configured write deadline.
    ///
    /// The payload is terminated with a blank line if it is not already.
    pub async fn write_frame(&self, payload: &[u8]) -> EslResult<()> {
        let mut guard = self
            .stream
            .lock()
            .await;
        let Some(stream) = guard.as_mut() else {
            return Err(EslError::frame("transport is closed"));
        };

        let result = with_deadline(
            self.config
                .write_timeout,
            "write",
            protocol::write_frame(stream.get_mut(), payload),
        )
        .await;
        if let Err(ref e) = result {
            self.kill(&mut guard, e);
        }
        result
    }

    /// Probe the peer.
    ///
    /// Sends `ping` and waits for its reply, each half bounded by the probe
    /// deadline. Event frames read before the reply are dropped, so the
    /// stream stays aligned for the next command.
    pub async fn is_valid(&self) -> bool {
        if !self.is_alive() {
            return false;
        }

        let mut guard = self
            .stream
            .lock()
            .await;
        let Some(stream) = guard.as_mut() else {
            return false;
        };

        let deadline = self
            .config
            .probe_timeout;
        let written = with_deadline(
            deadline,
            "probe write",
            protocol::write_frame(stream.get_mut(), PROBE_MESSAGE.as_bytes()),
        )
        .await;
        let result = match written {
            Ok(()) => {
                with_deadline(deadline, "probe read", read_ping_reply(self.id, stream)).await
            }
            Err(e) => Err(e),
        };

        match result {
            Ok(_) => {
                trace!("[TRANSPORT] Transport {} probe ok", self.id);
                true
            }
            Err(e) => {
                self.kill(&mut guard, &e);
                false
            }
        }
    }

    /// Shut the socket down and mark dead. Idempotent.
    pub async fn close(&self) {
        self.alive
            .store(false, Ordering::Release);
        let taken = self
            .stream
            .lock()
            .await
            .take();
        if let Some(mut stream) = taken {
            let _ = stream
                .get_mut()
                .shutdown()
                .await;
            debug!("[TRANSPORT] Transport {} closed", self.id);
        }
    }
}
