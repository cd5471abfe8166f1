//! Event dispatch table
//!
//! Routes decoded envelopes to handlers by opcode, or by event name for named
//! dispatch payloads. Handlers run on their own task so a slow handler never
//! stalls the listen loop; their errors go to the owning session.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use futures::future::BoxFuture;
use parking_lot::RwLock;
use serde_json::Value;
use tokio::task::JoinHandle;

/// A decoded wire envelope
pub trait Envelope: Send + 'static {
    fn opcode(&self) -> u8;

    /// Sequence number, when the payload carries one
    fn sequence(&self) -> Option<u64>;

    /// Event name of a named dispatch payload
    fn event_name(&self) -> Option<&str>;

    fn into_data(self) -> Value;
}

/// The session a table dispatches into
pub trait SessionContext: Send + Sync + 'static {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Record the latest sequence number
    fn record_sequence(&self, sequence: u64);

    /// Error sink for handler failures
    fn report(&self, error: DispatchError<Self::Error>);
}

/// Dispatch failures
#[derive(Debug, thiserror::Error)]
pub enum DispatchError<E: std::error::Error + 'static> {
    #[error("unknown opcode {0}")]
    UnknownOpcode(u8),

    #[error("unknown event {0}")]
    UnknownEvent(String),

    #[error("handler for {name} failed: {source}")]
    Handler {
        name: String,
        #[source]
        source: E,
    },
}

type HandlerFn<S, E> = Arc<dyn Fn(Arc<S>, Value) -> BoxFuture<'static, Result<(), E>> + Send + Sync>;

/// Callback attached to a named event, run after its handler
pub type EventListener = Arc<dyn Fn(&Value) + Send + Sync>;

/// Application command handler
pub type CommandHandler<S, E> = HandlerFn<S, E>;

/// Opcode and event handler table for one session kind
pub struct DispatchTable<S: SessionContext> {
    ops: HashMap<u8, HandlerFn<S, S::Error>>,
    events: HashMap<&'static str, HandlerFn<S, S::Error>>,
    listeners: RwLock<HashMap<String, Vec<EventListener>>>,
    commands: DashMap<String, CommandHandler<S, S::Error>>,
    command_event: Option<&'static str>,
}

impl<S: SessionContext> Default for DispatchTable<S> {
    fn default() -> Self {
        Self {
            ops: HashMap::new(),
            events: HashMap::new(),
            listeners: RwLock::new(HashMap::new()),
            commands: DashMap::new(),
            command_event: None,
        }
    }
}

impl<S: SessionContext> fmt::Debug for DispatchTable<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut ops: Vec<_> = self.ops.keys().copied().collect();
        ops.sort_unstable();
        f.debug_struct("DispatchTable")
            .field("ops", &ops)
            .field("events", &self.events.len())
            .field("commands", &self.commands.len())
            .finish()
    }
}

fn boxed<S, E, F, Fut>(handler: F) -> HandlerFn<S, E>
where
    F: Fn(Arc<S>, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), E>> + Send + 'static,
{
    Arc::new(move |session, data| Box::pin(handler(session, data)))
}

impl<S: SessionContext> DispatchTable<S> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the handler for a control opcode
    pub fn on_op<F, Fut>(mut self, op: u8, handler: F) -> Self
    where
        F: Fn(Arc<S>, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), S::Error>> + Send + 'static,
    {
        self.ops.insert(op, boxed(handler));
        self
    }

    /// Register the handler for a named dispatch event
    pub fn on_event<F, Fut>(mut self, name: &'static str, handler: F) -> Self
    where
        F: Fn(Arc<S>, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), S::Error>> + Send + 'static,
    {
        self.events.insert(name, boxed(handler));
        self
    }

    /// Name the event whose payload carries application commands
    pub fn with_command_event(mut self, name: &'static str) -> Self {
        self.command_event = Some(name);
        self
    }

    /// Attach a listener to a named event
    pub fn add_listener<F>(&self, event: &str, listener: F)
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.listeners
            .write()
            .entry(event.to_string())
            .or_default()
            .push(Arc::new(listener));
    }

    /// Register a handler for an application command name
    ///
    /// Replaces any handler previously registered under the same name.
    pub fn add_command<F, Fut>(&self, name: &str, handler: F)
    where
        F: Fn(Arc<S>, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), S::Error>> + Send + 'static,
    {
        self.commands.insert(name.to_string(), boxed(handler));
    }

    pub fn has_event(&self, name: &str) -> bool {
        self.events.contains_key(name)
    }

    /// Dispatch one envelope
    ///
    /// The sequence number is recorded before the handler is spawned. The
    /// returned task resolves once the handler and its listeners finish.
    pub fn handle<P: Envelope>(
        self: &Arc<Self>,
        session: Arc<S>,
        envelope: P,
    ) -> Result<JoinHandle<()>, DispatchError<S::Error>> {
        if let Some(sequence) = envelope.sequence() {
            session.record_sequence(sequence);
        }

        let op = envelope.opcode();
        let (name, handler) = match envelope.event_name() {
            Some(event) => {
                let handler = self
                    .events
                    .get(event)
                    .ok_or_else(|| DispatchError::UnknownEvent(event.to_string()))?;
                (event.to_string(), Arc::clone(handler))
            }
            None => {
                let handler = self.ops.get(&op).ok_or(DispatchError::UnknownOpcode(op))?;
                (format!("op {op}"), Arc::clone(handler))
            }
        };
        let is_event = envelope.event_name().is_some();
        let data = envelope.into_data();

        tracing::trace!(handler = %name, "Dispatching");

        let table = Arc::clone(self);
        Ok(tokio::spawn(async move {
            let snapshot = is_event.then(|| data.clone());

            if let Err(source) = handler(Arc::clone(&session), data).await {
                session.report(DispatchError::Handler {
                    name: name.clone(),
                    source,
                });
            }

            if let Some(data) = snapshot {
                table.notify_listeners(&name, &data);
                if table.command_event == Some(name.as_str()) {
                    table.run_command(session, data).await;
                }
            }
        }))
    }

    fn notify_listeners(&self, event: &str, data: &Value) {
        let listeners = self.listeners.read().get(event).cloned();
        for listener in listeners.into_iter().flatten() {
            listener(data);
        }
    }

    async fn run_command(&self, session: Arc<S>, data: Value) {
        let Some(name) = data
            .get("data")
            .and_then(|d| d.get("name"))
            .and_then(Value::as_str)
        else {
            return;
        };

        // Clone out of the map so no shard lock is held across the await
        let handler = self.commands.get(name).map(|h| Arc::clone(h.value()));
        match handler {
            Some(handler) => {
                let name = name.to_string();
                if let Err(source) = handler(Arc::clone(&session), data).await {
                    session.report(DispatchError::Handler {
                        name: format!("command {name}"),
                        source,
                    });
                }
            }
            None => tracing::debug!(command = name, "No handler registered for command"),
        }
    }
}
