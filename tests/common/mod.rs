//! In-process ESL server for integration tests.
//!
//! Speaks just enough of the protocol: optional `auth/request` greeting,
//! `auth`, `ping` (answered with `-ERR command not found` like FreeSWITCH),
//! `api` and `bgapi`. A few `api` verbs drive special behavior:
//!
//! - `api fail` replies with an `-ERR` body
//! - `api sleep <ms>` waits before replying
//! - `api events` sends one `text/event-plain` frame before the reply
//! - `api hangup` closes the socket without replying
//!
//! `event <format> <names>` is acknowledged and then followed by one
//! `text/event-plain` frame, as a subscribed socket would see.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use freeswitch_esl_pool::protocol::read_frame;
use freeswitch_esl_pool::PoolConfig;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

pub const PASSWORD: &str = "ClueCon";

pub const EVENT_BODY: &str =
    "Event-Name: CUSTOM\nEvent-Subclass: mock%3A%3Atick\nUnique-ID: mock-uuid-1\n\n";

#[derive(Clone)]
pub struct MockBehavior {
    pub password: String,
    pub send_greeting: bool,
    /// When set, every `ping` reply waits for one permit.
    pub ping_gate: Option<Arc<Semaphore>>,
}

impl Default for MockBehavior {
    fn default() -> Self {
        Self {
            password: PASSWORD.to_string(),
            send_greeting: true,
            ping_gate: None,
        }
    }
}

pub struct MockServer {
    pub addr: SocketAddr,
    accepted: Arc<AtomicUsize>,
    connections: Arc<Mutex<Vec<CancellationToken>>>,
    shutdown: CancellationToken,
}

impl MockServer {
    pub async fn start() -> Self {
        Self::start_with(MockBehavior::default()).await
    }

    pub async fn start_with(behavior: MockBehavior) -> Self {
        init_tracing();
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .unwrap();
        let addr = listener
            .local_addr()
            .unwrap();
        let accepted = Arc::new(AtomicUsize::new(0));
        let connections = Arc::new(Mutex::new(Vec::new()));
        let shutdown = CancellationToken::new();

        let server = Self {
            addr,
            accepted: Arc::clone(&accepted),
            connections: Arc::clone(&connections),
            shutdown: shutdown.clone(),
        };

        tokio::spawn(async move {
            loop {
                let stream = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    res = listener.accept() => match res {
                        Ok((stream, _)) => stream,
                        Err(_) => break,
                    },
                };
                let n = accepted.fetch_add(1, Ordering::SeqCst);
                let kill = shutdown.child_token();
                connections
                    .lock()
                    .unwrap()
                    .push(kill.clone());
                tokio::spawn(serve(stream, behavior.clone(), kill, n));
            }
        });

        server
    }

    /// Pool config pointing at this server with quiet background loops and
    /// no warm-up.
    pub fn config(&self) -> PoolConfig {
        let mut config = PoolConfig::new("127.0.0.1", self.addr.port());
        config.password = PASSWORD.to_string();
        config.connect_timeout = Duration::from_secs(2);
        config.read_timeout = Duration::from_secs(5);
        config.write_timeout = Duration::from_secs(2);
        config.probe_timeout = Duration::from_secs(2);
        config.acquire_timeout = Duration::from_secs(5);
        config.health_check_interval = Duration::from_secs(3600);
        config.eviction_interval = Duration::from_secs(3600);
        config.warm_up = 0;
        config
    }

    /// Connections accepted so far.
    pub fn accepted(&self) -> usize {
        self.accepted
            .load(Ordering::SeqCst)
    }

    /// Close every server-side socket accepted so far.
    pub fn drop_all_connections(&self) {
        for kill in self
            .connections
            .lock()
            .unwrap()
            .drain(..)
        {
            kill.cancel();
        }
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.shutdown
            .cancel();
    }
}

/// Route crate logs to the test output; filter with `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// Poll `check` until it holds or two seconds pass.
pub async fn wait_until(mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

pub fn command_reply(reply_text: &str) -> String {
    format!(
        "Content-Type: command/reply\nReply-Text: {}\n\n",
        reply_text
    )
}

pub fn api_response(body: &str) -> String {
    format!(
        "Content-Type: api/response\nContent-Length: {}\n\n{}",
        body.len(),
        body
    )
}

pub fn event_frame() -> String {
    format!(
        "Content-Length: {}\nContent-Type: text/event-plain\n\n{}",
        EVENT_BODY.len(),
        EVENT_BODY
    )
}

async fn send(writer: &mut OwnedWriteHalf, data: &str) -> bool {
    writer
        .write_all(data.as_bytes())
        .await
        .is_ok()
}

async fn serve(stream: TcpStream, behavior: MockBehavior, kill: CancellationToken, conn: usize) {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    if behavior.send_greeting && !send(&mut writer, "Content-Type: auth/request\n\n").await {
        return;
    }

    loop {
        let frame = tokio::select! {
            _ = kill.cancelled() => return,
            frame = read_frame(&mut reader) => frame,
        };
        let Ok(frame) = frame else {
            return;
        };
        let text = String::from_utf8_lossy(frame.as_bytes()).to_string();
        let verb = text
            .lines()
            .next()
            .unwrap_or("")
            .trim()
            .to_string();

        let ok = if let Some(password) = verb.strip_prefix("auth ") {
            if password == behavior.password {
                send(&mut writer, &command_reply("+OK accepted")).await
            } else {
                let _ = send(&mut writer, &command_reply("-ERR invalid")).await;
                return;
            }
        } else if verb == "ping" {
            if let Some(gate) = &behavior.ping_gate {
                tokio::select! {
                    _ = kill.cancelled() => return,
                    permit = gate.acquire() => match permit {
                        Ok(permit) => permit.forget(),
                        Err(_) => return,
                    },
                }
            }
            send(&mut writer, &command_reply("-ERR command not found")).await
        } else if let Some(command) = verb.strip_prefix("api ") {
            if command == "fail" {
                send(&mut writer, &api_response("-ERR no such command\n")).await
            } else if command == "hangup" {
                return;
            } else if command == "events" {
                send(&mut writer, &event_frame()).await
                    && send(&mut writer, &api_response("+OK events\n")).await
            } else if let Some(ms) = command.strip_prefix("sleep ") {
                let ms = ms
                    .parse()
                    .unwrap_or(0);
                tokio::select! {
                    _ = kill.cancelled() => return,
                    _ = tokio::time::sleep(Duration::from_millis(ms)) => {}
                }
                send(&mut writer, &api_response("+OK slept\n")).await
            } else {
                send(&mut writer, &api_response(&format!("+OK {}\n", command))).await
            }
        } else if let Some(subscription) = verb.strip_prefix("event ") {
            let format = subscription
                .split_whitespace()
                .next()
                .unwrap_or("plain");
            send(
                &mut writer,
                &command_reply(&format!("+OK event listener enabled {}", format)),
            )
            .await
                && send(&mut writer, &event_frame()).await
        } else if verb.starts_with("bgapi ") {
            let job = format!("mock-job-{}", conn);
            send(
                &mut writer,
                &format!(
                    "Content-Type: command/reply\nReply-Text: +OK Job-UUID: {}\nJob-UUID: {}\n\n",
                    job, job
                ),
            )
            .await
        } else {
            send(&mut writer, &command_reply("-ERR command not found")).await
        };

        if !ok {
            return;
        }
    }
}
