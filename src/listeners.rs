//! Event subscriptions.
//!
//! Listeners are installed once at startup through [`EventHub`]'s
//! `subscribe_*` calls. Each call returns a [`Subscription`]; cancelling or
//! dropping it detaches the listener.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};

use futures_util::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::commands::CommandFailure;
use crate::events::GatewayEvent;
use crate::types::Message;

type Handler<T> = Arc<dyn Fn(T) -> BoxFuture<'static, ()> + Send + Sync>;

struct Entry<T> {
    id: u64,
    name: &'static str,
    token: CancellationToken,
    handler: Handler<T>,
}

/// Handlers for one event kind, in installation order.
struct Slot<T> {
    next_id: AtomicU64,
    entries: RwLock<Vec<Entry<T>>>,
}

/// Removal side of a slot, independent of its event type.
trait Detach: Send + Sync {
    fn detach(&self, id: u64);
}

impl<T: Clone + Send + 'static> Slot<T> {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            next_id: AtomicU64::new(0),
            entries: RwLock::new(Vec::new()),
        })
    }

    fn subscribe(self: &Arc<Self>, name: &'static str, handler: Handler<T>) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        self.entries
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(Entry {
                id,
                name,
                token: token.clone(),
                handler,
            });
        debug!(listener = name, "listener installed");

        let slot: Weak<dyn Detach> = Arc::downgrade(self) as Weak<dyn Detach>;
        Subscription {
            name,
            id,
            token,
            slot,
        }
    }

    /// Live handlers, snapshotted so no lock is held while they run.
    fn live(&self) -> Vec<(&'static str, Handler<T>)> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries
            .iter()
            .filter(|e| !e.token.is_cancelled())
            .map(|e| (e.name, Arc::clone(&e.handler)))
            .collect()
    }

    /// Run every live handler in installation order.
    async fn emit(&self, value: T) {
        for (_, handler) in self.live() {
            handler(value.clone()).await;
        }
    }

    fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

impl<T: Send + 'static> Detach for Slot<T> {
    fn detach(&self, id: u64) {
        let removed = {
            let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
            let index = entries.iter().position(|e| e.id == id);
            index.map(|i| entries.remove(i))
        };
        // Handler dropped outside the lock; it may own the hub.
        drop(removed);
    }
}

/// Handle to an installed listener. Cancelling or dropping it removes the
/// listener and releases its handler.
#[must_use = "dropping a Subscription detaches the listener"]
pub struct Subscription {
    name: &'static str,
    id: u64,
    token: CancellationToken,
    slot: Weak<dyn Detach>,
}

impl Subscription {
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Detach the listener now.
    pub fn cancel(&self) {
        self.token.cancel();
        if let Some(slot) = self.slot.upgrade() {
            slot.detach(self.id);
        }
    }

    pub fn is_active(&self) -> bool {
        !self.token.is_cancelled()
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("name", &self.name)
            .field("active", &self.is_active())
            .finish()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel();
    }
}

struct HubInner {
    socket_opened: Arc<Slot<()>>,
    message: Arc<Slot<Message>>,
    command_error: Arc<Slot<Arc<CommandFailure>>>,
    gateway: Arc<Slot<Arc<GatewayEvent>>>,
}

/// Fan-out point between the transport, the command engine, and listeners.
/// Cheap to clone.
#[derive(Clone)]
pub struct EventHub {
    inner: Arc<HubInner>,
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

fn boxed<T, F, Fut>(f: F) -> Handler<T>
where
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |value: T| -> BoxFuture<'static, ()> { Box::pin(f(value)) })
}

impl EventHub {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(HubInner {
                socket_opened: Slot::new(),
                message: Slot::new(),
                command_error: Slot::new(),
                gateway: Slot::new(),
            }),
        }
    }

    /// Transport opened (every connect and reconnect).
    pub fn subscribe_socket_opened<F, Fut>(&self, name: &'static str, f: F) -> Subscription
    where
        F: Fn(()) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.inner.socket_opened.subscribe(name, boxed(f))
    }

    /// A message was received.
    pub fn subscribe_message<F, Fut>(&self, name: &'static str, f: F) -> Subscription
    where
        F: Fn(Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.inner.message.subscribe(name, boxed(f))
    }

    /// A command failed while executing.
    pub fn subscribe_command_error<F, Fut>(&self, name: &'static str, f: F) -> Subscription
    where
        F: Fn(Arc<CommandFailure>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.inner.command_error.subscribe(name, boxed(f))
    }

    /// Every gateway event, as delivered by the transport.
    pub fn subscribe_gateway<F, Fut>(&self, name: &'static str, f: F) -> Subscription
    where
        F: Fn(Arc<GatewayEvent>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.inner.gateway.subscribe(name, boxed(f))
    }

    pub async fn emit_socket_opened(&self) {
        self.inner.socket_opened.emit(()).await
    }

    pub async fn emit_message(&self, message: Message) {
        self.inner.message.emit(message).await
    }

    pub async fn emit_command_error(&self, failure: CommandFailure) {
        self.inner.command_error.emit(Arc::new(failure)).await
    }

    pub async fn emit_gateway(&self, event: Arc<GatewayEvent>) {
        self.inner.gateway.emit(event).await
    }

    /// Number of live listeners across all event kinds.
    pub fn listener_count(&self) -> usize {
        self.inner.socket_opened.len()
            + self.inner.message.len()
            + self.inner.command_error.len()
            + self.inner.gateway.len()
    }
}

// ---------------------------------------------------------------------------
// Additional listener sets
// ---------------------------------------------------------------------------

/// A set of async listeners supplied by the command-handler layer.
pub trait Listener: Send + Sync {
    fn name(&self) -> &'static str;

    /// Subscribe to whatever events the listener needs.
    fn install(self: Arc<Self>, hub: &EventHub) -> Vec<Subscription>;
}

/// Logs connection milestones: READY identity and resumes.
pub struct ConnectionLogger;

impl Listener for ConnectionLogger {
    fn name(&self) -> &'static str {
        "connection-logger"
    }

    fn install(self: Arc<Self>, hub: &EventHub) -> Vec<Subscription> {
        vec![hub.subscribe_gateway(self.name(), |event| async move {
            match event.as_ref() {
                GatewayEvent::Ready(ready) => info!(
                    user = %ready.user.tag(),
                    guilds = ready.guilds.len(),
                    "bot is ready"
                ),
                GatewayEvent::Resumed => info!("session resumed"),
                _ => {}
            }
        })]
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
