//! Request/reply façade over the pool and the event processor

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;
use tracing::{debug, warn};

use crate::command::{Command, CommandResult, EslResponse};
use crate::config::PoolConfig;
use crate::constants::DEFAULT_COMMAND_TIMEOUT;
use crate::decoder::EslDecoder;
use crate::dispatcher::DispatcherConfig;
use crate::error::{EslError, EslResult};
use crate::event::EslEvent;
use crate::headers::ContentType;
use crate::pool::{Pool, PoolStats};
use crate::processor::EventProcessor;
use crate::transport::Transport;

/// Options for [`EslClient::with_options`].
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub pool: PoolConfig,
    pub dispatcher: DispatcherConfig,
    /// Round-trip deadline for commands without their own timeout. Default: 5s.
    pub command_timeout: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            pool: PoolConfig::default(),
            dispatcher: DispatcherConfig::default(),
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }
}

/// Pooled ESL client.
///
/// Each command borrows a transport, writes the command and reads frames
/// until the reply arrives. Event frames read in the meantime are handed to
/// the event processor.
///
/// ```rust,no_run
/// use freeswitch_esl_pool::{EslClient, EslError, PoolConfig};
///
/// #[tokio::main]
/// async fn main() -> Result<(), EslError> {
///     let client = EslClient::connect(PoolConfig::new("localhost", 8021)).await?;
///
///     client.on_event("BACKGROUND_JOB", |event| {
///         println!("job {} done", event.job_uuid().unwrap_or("?"));
///     });
///
///     let response = client.api("status").await?;
///     println!("Status: {}", response.body().unwrap_or("No body"));
///
///     let job = client.bgapi("status").await?;
///     println!("Job-UUID: {}", job);
///
///     client.close().await;
///     Ok(())
/// }
/// ```
pub struct EslClient {
    pool: Pool,
    processor: EventProcessor<EslDecoder>,
    command_timeout: Duration,
}

impl EslClient {
    /// Connect with default dispatcher settings and command timeout.
    pub async fn connect(config: PoolConfig) -> EslResult<Self> {
        Self::with_options(ClientOptions {
            pool: config,
            ..ClientOptions::default()
        })
        .await
    }

    pub async fn with_options(options: ClientOptions) -> EslResult<Self> {
        let pool = Pool::new(options.pool).await?;
        let processor = EventProcessor::new(EslDecoder, options.dispatcher);
        Ok(Self {
            pool,
            processor,
            command_timeout: options.command_timeout,
        })
    }

    /// Send a command and wait for the reply.
    ///
    /// The round trip is bounded by the command's own timeout, else the
    /// client default; on expiry the transport is closed rather than reused,
    /// since a late reply would desynchronize it. The reply is returned as
    /// received; use [`EslResponse::into_result`] to turn `-ERR` into an
    /// error. A result sink set with [`Command::on_result`] receives the
    /// outcome either way.
    pub async fn send(&self, mut command: Command) -> EslResult<EslResponse> {
        let sink = command.take_result_sink();
        let deadline = command
            .timeout_value()
            .unwrap_or(self.command_timeout);

        let outcome = match command.encode() {
            Ok(wire) => {
                if command
                    .verb()
                    .starts_with("auth ")
                {
                    debug!("Sending command: auth [REDACTED]");
                } else {
                    debug!("Sending command: {}", wire.trim());
                }
                self.exchange(&wire, deadline)
                    .await
            }
            Err(e) => Err(e),
        };

        if let Some(tx) = sink {
            if tx
                .send(CommandResult::from_outcome(&outcome))
                .is_err()
            {
                debug!("Result receiver dropped before delivery");
            }
        }
        outcome
    }

    async fn exchange(&self, wire: &str, deadline: Duration) -> EslResult<EslResponse> {
        let transport = self
            .pool
            .get()
            .await?;

        let result = match timeout(deadline, self.round_trip(&transport, wire)).await {
            Ok(result) => result,
            Err(_) => Err(EslError::Timeout {
                timeout_ms: u64::try_from(deadline.as_millis()).unwrap_or(u64::MAX),
            }),
        };

        match &result {
            Ok(response) => debug!("Received response: success={}", response.is_success()),
            Err(e) if e.is_transport_fatal() => {
                warn!("Closing transport {} after error: {}", transport.id(), e);
                transport
                    .close()
                    .await;
            }
            Err(_) => {}
        }
        self.pool
            .put(transport)
            .await;
        result
    }

    async fn round_trip(&self, transport: &Transport, wire: &str) -> EslResult<EslResponse> {
        transport
            .write_frame(wire.as_bytes())
            .await?;

        loop {
            let frame = transport
                .read_frame()
                .await?;
            match frame.content_type() {
                Some(ct) if ct.is_event() => {
                    if let Err(e) = self
                        .processor
                        .process(frame.as_bytes())
                        .await
                    {
                        warn!("Dropping event frame read during command: {}", e);
                    }
                }
                Some(ContentType::DisconnectNotice) => {
                    return Err(EslError::frame("server sent disconnect notice"));
                }
                _ => return EslResponse::from_frame(&frame),
            }
        }
    }

    /// Execute `api <command>`.
    ///
    /// ```rust,no_run
    /// # async fn example(client: &freeswitch_esl_pool::EslClient) -> Result<(), freeswitch_esl_pool::EslError> {
    /// let response = client.api("global_getvar hostname").await?;
    /// println!("{}", response.body().unwrap_or(""));
    /// # Ok(())
    /// # }
    /// ```
    pub async fn api(&self, command: &str) -> EslResult<EslResponse> {
        self.send(Command::api(command))
            .await
    }

    /// Execute `bgapi <command>` and return the job UUID.
    ///
    /// The command's output arrives later as a `BACKGROUND_JOB` event with
    /// the same `Job-UUID`.
    pub async fn bgapi(&self, command: &str) -> EslResult<String> {
        let response = self
            .send(Command::bgapi(command))
            .await?
            .into_result()?;
        response
            .job_uuid()
            .map(str::to_string)
            .ok_or_else(|| EslError::UnexpectedReply {
                reply_text: response
                    .reply_text()
                    .unwrap_or("")
                    .to_string(),
            })
    }

    /// Register a listener; `"*"` receives every event.
    pub fn on_event<F>(&self, name: impl Into<String>, listener: F)
    where
        F: Fn(&EslEvent) + Send + Sync + 'static,
    {
        self.processor
            .dispatcher()
            .register(name, listener);
    }

    /// Register an async handler for events named exactly `name`.
    pub fn on_event_handler<F, Fut>(&self, name: impl Into<String>, handler: F)
    where
        F: Fn(Arc<EslEvent>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.processor
            .register_handler(name, handler);
    }

    /// Feed a raw frame obtained elsewhere through the event processor.
    pub async fn process(&self, frame: &[u8]) -> EslResult<()> {
        self.processor
            .process(frame)
            .await
    }

    /// Underlying pool, for direct transport access.
    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    pub fn stats(&self) -> PoolStats {
        self.pool
            .stats()
    }

    /// Close the pool. Idempotent.
    pub async fn close(&self) {
        self.pool
            .close()
            .await;
    }
}

impl std::fmt::Debug for EslClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EslClient")
            .field("pool", &self.pool)
            .field("command_timeout", &self.command_timeout)
            .finish()
    }
}
