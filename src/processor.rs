//! Decode raw frames and route them to listeners and handlers

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;

use futures_util::FutureExt;
use parking_lot::RwLock;
use tracing::{debug, error, trace};

use crate::decoder::{Decoder, EslDecoder};
use crate::dispatcher::{DispatcherConfig, EventDispatcher};
use crate::error::EslResult;
use crate::event::EslEvent;

/// Future returned by an [`EventHandler`].
pub type HandlerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Per-event-name async handler. Each invocation runs on its own task.
pub type EventHandler = Arc<dyn Fn(Arc<EslEvent>) -> HandlerFuture + Send + Sync>;

/// Turns raw frames into dispatched events.
///
/// Every decoded event goes to the [`EventDispatcher`]; in addition, each
/// handler registered for the exact event name is spawned on its own task.
/// Handlers run concurrently with the listeners and with each other.
pub struct EventProcessor<D: Decoder = EslDecoder> {
    decoder: D,
    dispatcher: EventDispatcher,
    handlers: RwLock<HashMap<String, Vec<EventHandler>>>,
}

impl EventProcessor<EslDecoder> {
    /// Processor using [`EslDecoder`] and a default dispatcher.
    pub fn with_defaults() -> Self {
        Self::new(EslDecoder, DispatcherConfig::default())
    }
}

impl<D: Decoder> EventProcessor<D> {
    /// Must be called within a tokio runtime.
    pub fn new(decoder: D, config: DispatcherConfig) -> Self {
        Self {
            decoder,
            dispatcher: EventDispatcher::new(config),
            handlers: RwLock::new(HashMap::new()),
        }
    }

    /// Register an async handler for events named exactly `name`.
    pub fn register_handler<F, Fut>(&self, name: impl Into<String>, handler: F)
    where
        F: Fn(Arc<EslEvent>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        debug!("[PROCESS] Registering handler for {}", name);
        let handler: EventHandler = Arc::new(move |event| Box::pin(handler(event)));
        self.handlers
            .write()
            .entry(name)
            .or_default()
            .push(handler);
    }

    /// Dispatcher used for listener registration.
    pub fn dispatcher(&self) -> &EventDispatcher {
        &self.dispatcher
    }

    /// Decode `frame` and deliver it.
    ///
    /// A decode error is returned and nothing is dispatched. Returns once
    /// the delivery is queued and the handlers are spawned.
    pub async fn process(&self, frame: &[u8]) -> EslResult<()> {
        let mut event = self
            .decoder
            .decode(frame)?;
        event.resolve_name();
        let event = Arc::new(event);
        trace!("[PROCESS] Decoded event {}", event.name());

        let handlers: Vec<EventHandler> = self
            .handlers
            .read()
            .get(event.name())
            .cloned()
            .unwrap_or_default();
        for handler in handlers {
            let event = Arc::clone(&event);
            // handler is invoked on the spawned task; panics stay there
            tokio::spawn(async move {
                let name = event
                    .name()
                    .to_string();
                if AssertUnwindSafe(async move { handler(event).await })
                    .catch_unwind()
                    .await
                    .is_err()
                {
                    error!("[PROCESS] Handler for {} panicked", name);
                }
            });
        }

        self.dispatcher
            .submit(event)
            .await
    }
}

impl<D: Decoder> std::fmt::Debug for EventProcessor<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventProcessor")
            .field("dispatcher", &self.dispatcher)
            .field(
                "handler_names",
                &self
                    .handlers
                    .read()
                    .keys()
                    .cloned()
                    .collect::<Vec<_>>(),
            )
            .finish()
    }
}
