//! Command encoding and reply classification

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use tokio::sync::oneshot;

use crate::{
    constants::{HEADER_TERMINATOR, LINE_TERMINATOR},
    error::{EslError, EslResult},
    headers::Header,
    protocol::{self, Frame},
};

/// Validate that a user-provided string contains no newline characters.
///
/// ESL commands are line-delimited; embedded newlines would allow injection
/// of arbitrary protocol commands.
fn validate_no_newlines(s: &str, context: &str) -> EslResult<()> {
    if s.contains('\n') || s.contains('\r') {
        return Err(EslError::protocol_error(format!(
            "{} must not contain newlines",
            context
        )));
    }
    Ok(())
}

/// How the verb line is prefixed on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[non_exhaustive]
pub enum CommandType {
    /// Verb sent as given (`api status`, `auth secret`, `noop`).
    #[default]
    Plain,
    /// Background job: `bgapi <verb>`; reply carries a `Job-UUID`.
    Async,
    /// Channel message: `sendmsg <verb>`.
    Message,
    /// Event subscription: `event <verb>`.
    Event,
}

impl CommandType {
    /// Wire prefix including the trailing space (empty for `Plain`).
    pub fn prefix(&self) -> &'static str {
        match self {
            CommandType::Plain => "",
            CommandType::Async => "bgapi ",
            CommandType::Message => "sendmsg ",
            CommandType::Event => "event ",
        }
    }
}

/// Outcome delivered to a command's result sink.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandResult {
    /// `Job-UUID` from a `bgapi` acceptance.
    pub job_uuid: Option<String>,
    /// Reply body, or `Reply-Text` when the reply has no body.
    pub body: String,
    /// Error text when the command failed.
    pub error: Option<String>,
}

impl CommandResult {
    pub(crate) fn from_outcome(outcome: &EslResult<EslResponse>) -> Self {
        match outcome {
            Ok(response) => Self {
                job_uuid: response
                    .job_uuid()
                    .map(str::to_string),
                body: response
                    .body()
                    .or_else(|| response.reply_text())
                    .unwrap_or_default()
                    .to_string(),
                error: None,
            },
            Err(e) => Self {
                job_uuid: None,
                body: String::new(),
                error: Some(e.to_string()),
            },
        }
    }
}

/// A single ESL command: verb line, optional headers and `key=value` parameters.
///
/// Headers and parameters keep insertion order; setting an existing key
/// replaces its value in place.
///
/// ```
/// use freeswitch_esl_pool::{Command, CommandType};
///
/// let cmd = Command::new(CommandType::Async, "originate user/1000 &park")
///     .header("Job-UUID", "d8c1")
///     .unwrap();
/// assert_eq!(
///     cmd.encode().unwrap(),
///     "bgapi originate user/1000 &park\nJob-UUID: d8c1\n\n"
/// );
/// ```
pub struct Command {
    command_type: CommandType,
    verb: String,
    headers: Vec<(String, String)>,
    params: Vec<(String, String)>,
    is_async: bool,
    timeout: Option<Duration>,
    result_tx: Option<oneshot::Sender<CommandResult>>,
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let verb = if self
            .verb
            .starts_with("auth ")
        {
            "auth [REDACTED]"
        } else {
            self.verb
                .as_str()
        };
        f.debug_struct("Command")
            .field("command_type", &self.command_type)
            .field("verb", &verb)
            .field("headers", &self.headers)
            .field("params", &self.params)
            .field("is_async", &self.is_async)
            .field("timeout", &self.timeout)
            .field("has_result_sink", &self.result_tx.is_some())
            .finish()
    }
}

fn upsert(list: &mut Vec<(String, String)>, key: &str, value: &str) {
    match list
        .iter_mut()
        .find(|(k, _)| k == key)
    {
        Some(entry) => entry.1 = value.to_string(),
        None => list.push((key.to_string(), value.to_string())),
    }
}

impl Command {
    /// Start a command of the given type.
    pub fn new(command_type: CommandType, verb: impl Into<String>) -> Self {
        Self {
            command_type,
            verb: verb.into(),
            headers: Vec::new(),
            params: Vec::new(),
            is_async: command_type == CommandType::Async,
            timeout: None,
            result_tx: None,
        }
    }

    /// `api <command>`.
    pub fn api(command: &str) -> Self {
        Self::new(CommandType::Plain, format!("api {}", command))
    }

    /// `bgapi <command>`.
    pub fn bgapi(command: &str) -> Self {
        Self::new(CommandType::Async, command)
    }

    /// `auth <password>`. Debug output redacts the secret.
    pub fn auth(password: &str) -> Self {
        Self::new(CommandType::Plain, format!("auth {}", password))
    }

    /// Add or replace a header.
    ///
    /// Returns an error if the name or value contains newline characters.
    pub fn header(mut self, name: &str, value: &str) -> EslResult<Self> {
        validate_no_newlines(name, "header name")?;
        validate_no_newlines(value, "header value")?;
        upsert(&mut self.headers, name, value);
        Ok(self)
    }

    /// Add or replace a `key=value` parameter.
    pub fn param(mut self, key: &str, value: &str) -> EslResult<Self> {
        validate_no_newlines(key, "parameter name")?;
        validate_no_newlines(value, "parameter value")?;
        upsert(&mut self.params, key, value);
        Ok(self)
    }

    /// Mark the reply as a background-job acceptance.
    pub fn asynchronous(mut self) -> Self {
        self.is_async = true;
        self
    }

    /// Bound the whole request/reply exchange.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Deliver a [`CommandResult`] to `tx` once the exchange finishes.
    pub fn on_result(mut self, tx: oneshot::Sender<CommandResult>) -> Self {
        self.result_tx = Some(tx);
        self
    }

    pub fn command_type(&self) -> CommandType {
        self.command_type
    }

    pub fn verb(&self) -> &str {
        &self.verb
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    pub fn params(&self) -> &[(String, String)] {
        &self.params
    }

    pub fn is_async(&self) -> bool {
        self.is_async
    }

    pub fn timeout_value(&self) -> Option<Duration> {
        self.timeout
    }

    pub(crate) fn take_result_sink(&mut self) -> Option<oneshot::Sender<CommandResult>> {
        self.result_tx
            .take()
    }

    /// Serialize to wire text.
    ///
    /// Layout: verb line, header lines, blank line, then parameter lines and a
    /// second blank line when any parameters are set.
    pub fn encode(&self) -> EslResult<String> {
        use std::fmt::Write;

        validate_no_newlines(&self.verb, "command verb")?;

        let mut result = String::from(self.command_type.prefix());
        result.push_str(&self.verb);
        result.push_str(LINE_TERMINATOR);

        for (key, value) in &self.headers {
            let _ = write!(result, "{}: {}{}", key, value, LINE_TERMINATOR);
        }
        result.push_str(LINE_TERMINATOR);

        if !self
            .params
            .is_empty()
        {
            for (key, value) in &self.params {
                let _ = write!(result, "{}={}{}", key, value, LINE_TERMINATOR);
            }
            result.push_str(LINE_TERMINATOR);
        }

        debug_assert!(result.ends_with(HEADER_TERMINATOR));
        Ok(result)
    }
}

/// Reply-Text classification per the ESL wire protocol.
///
/// FreeSWITCH commands return `+OK …` on success and `-ERR …` on failure.
/// A handful of commands (`getvar`) return the raw value with no prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ReplyStatus {
    /// Reply-Text starts with `+OK` or is absent/empty.
    Ok,
    /// Reply-Text starts with `-ERR`.
    Err,
    /// Reply-Text present but matches neither `+OK` nor `-ERR`.
    Other,
}

/// Reply to a command (`command/reply` or `api/response`).
#[derive(Debug, Clone, PartialEq)]
pub struct EslResponse {
    headers: HashMap<String, String>,
    body: Option<String>,
    status: ReplyStatus,
}

impl EslResponse {
    /// `ReplyStatus` is derived from the `Reply-Text` header.
    pub fn new(headers: HashMap<String, String>, body: Option<String>) -> Self {
        let mut status = match headers
            .get(Header::ReplyText.as_str())
            .map(|s| s.as_str())
        {
            None | Some("") => ReplyStatus::Ok,
            Some(t) if t.starts_with("+OK") => ReplyStatus::Ok,
            Some(t) if t.starts_with("-ERR") => ReplyStatus::Err,
            Some(_) => ReplyStatus::Other,
        };

        // api/response carries its verdict in the body
        if status == ReplyStatus::Ok
            && body
                .as_deref()
                .is_some_and(|b| b.starts_with("-ERR"))
        {
            status = ReplyStatus::Err;
        }

        Self {
            headers,
            body,
            status,
        }
    }

    /// Build from a reply frame; header values are percent-decoded.
    pub fn from_frame(frame: &Frame) -> EslResult<Self> {
        let headers = protocol::parse_headers(frame.header_block())?;
        let body = match frame.body() {
            [] => None,
            bytes => Some(
                String::from_utf8(bytes.to_vec())
                    .map_err(|_| EslError::decode("invalid UTF-8 in reply body"))?,
            ),
        };
        Ok(Self::new(headers, body))
    }

    /// `true` if the reply indicates success.
    pub fn is_success(&self) -> bool {
        self.status == ReplyStatus::Ok
    }

    /// Classification of the reply.
    pub fn reply_status(&self) -> ReplyStatus {
        self.status
    }

    /// Response body (the `api/` response payload).
    pub fn body(&self) -> Option<&str> {
        self.body
            .as_deref()
    }

    /// Look up a response header by name.
    pub fn header(&self, name: impl AsRef<str>) -> Option<&str> {
        self.headers
            .get(name.as_ref())
            .map(|s| s.as_str())
    }

    /// All response headers.
    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }

    /// Raw `Reply-Text` header value (e.g. `+OK`, `-ERR invalid command`).
    pub fn reply_text(&self) -> Option<&str> {
        self.header(Header::ReplyText)
    }

    /// `Job-UUID` from a `bgapi` acceptance.
    ///
    /// Prefers the dedicated header and falls back to the
    /// `+OK Job-UUID: <uuid>` form of Reply-Text.
    pub fn job_uuid(&self) -> Option<&str> {
        self.header(Header::JobUuid)
            .or_else(|| {
                self.reply_text()?
                    .strip_prefix("+OK Job-UUID:")
                    .map(str::trim)
            })
    }

    /// Convert to result based on success status.
    pub fn into_result(self) -> EslResult<Self> {
        match self.status {
            ReplyStatus::Ok => Ok(self),
            ReplyStatus::Err => {
                let reply_text = self
                    .reply_text()
                    .or(self.body())
                    .unwrap_or("-ERR")
                    .trim()
                    .to_string();
                Err(EslError::CommandFailed { reply_text })
            }
            ReplyStatus::Other => {
                let reply_text = self
                    .reply_text()
                    .unwrap_or("")
                    .to_string();
                Err(EslError::UnexpectedReply { reply_text })
            }
        }
    }
}
