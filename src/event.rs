//! Decoded ESL events

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::headers::Header;

/// An event produced by a [`Decoder`](crate::Decoder) from one frame.
///
/// Read-only once it reaches the dispatcher; listeners and handlers share it
/// behind an `Arc`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EslEvent {
    name: String,
    headers: HashMap<String, String>,
    body: Option<String>,
    #[serde(skip)]
    raw: Vec<u8>,
}

impl EslEvent {
    /// Create a new empty event
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an event with the given name.
    pub fn with_name(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Event name used for listener and handler lookup.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Override the event name.
    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    /// Take the name from the `Event-Name` header when present.
    ///
    /// The header wins over whatever name was set before.
    pub fn resolve_name(&mut self) {
        if let Some(name) = self
            .headers
            .get(Header::EventName.as_str())
        {
            self.name = name.clone();
        }
    }

    /// Look up a header by name (case-sensitive).
    pub fn header(&self, name: impl AsRef<str>) -> Option<&str> {
        self.headers
            .get(name.as_ref())
            .map(|s| s.as_str())
    }

    /// All headers as a map.
    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }

    /// Set or overwrite a header.
    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers
            .insert(name.into(), value.into());
    }

    /// Event body (the content after the blank line in plain-text events).
    pub fn body(&self) -> Option<&str> {
        self.body
            .as_deref()
    }

    /// Set the event body.
    pub fn set_body(&mut self, body: impl Into<String>) {
        self.body = Some(body.into());
    }

    /// Frame bytes the event was decoded from.
    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    pub(crate) fn set_raw(&mut self, raw: Vec<u8>) {
        self.raw = raw;
    }

    /// `Unique-ID` header.
    pub fn unique_id(&self) -> Option<&str> {
        self.header(Header::UniqueId)
    }

    /// `Job-UUID` header from `bgapi` `BACKGROUND_JOB` events.
    pub fn job_uuid(&self) -> Option<&str> {
        self.header(Header::JobUuid)
    }

    /// `Event-Subclass` header of `CUSTOM` events.
    pub fn subclass(&self) -> Option<&str> {
        self.header(Header::EventSubclass)
    }
}
