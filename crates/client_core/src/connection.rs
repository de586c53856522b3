use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, MutexGuard, Weak},
    time::Duration,
};

use serde::Serialize;
use shared::protocol::{ClientFrame, ServerEvent, ServerEventKind};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, info, warn};

use crate::transport::{Connector, Transport, TransportEvent};

pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_millis(3000);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    Status(ConnectionState),
    Server(ServerEvent),
}

/// Selects which events a subscriber receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventFilter {
    Status,
    Kind(ServerEventKind),
    All,
}

impl EventFilter {
    fn matches(&self, event: &ConnectionEvent) -> bool {
        match (self, event) {
            (EventFilter::All, _) => true,
            (EventFilter::Status, ConnectionEvent::Status(_)) => true,
            (EventFilter::Kind(kind), ConnectionEvent::Server(event)) => event.kind() == *kind,
            _ => false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    pub reconnect_delay: Duration,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
        }
    }
}

#[derive(Serialize)]
struct RawFrame<'a, P> {
    #[serde(rename = "type")]
    frame_type: &'a str,
    payload: &'a P,
}

type Handler = Arc<dyn Fn(&ConnectionEvent) + Send + Sync>;

#[derive(Default)]
struct Subscribers {
    next_id: u64,
    handlers: Vec<(u64, EventFilter, Handler)>,
}

/// Handle returned by [`ConnectionManager::subscribe`]. Dropping it removes
/// the handler.
pub struct Subscription {
    id: u64,
    subscribers: Weak<Mutex<Subscribers>>,
}

impl Subscription {
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(subscribers) = self.subscribers.upgrade() {
            lock_recovered(&subscribers)
                .handlers
                .retain(|(id, _, _)| *id != self.id);
        }
    }
}

struct ConnectionInner {
    state: ConnectionState,
    wants_connection: bool,
    credential: Option<String>,
    outbound: Option<mpsc::UnboundedSender<String>>,
    queue: VecDeque<String>,
    reconnect: Option<JoinHandle<()>>,
    reader: Option<JoinHandle<()>>,
    generation: u64,
}

/// Owns the push socket: lifecycle, auth handshake, the outbound FIFO queue,
/// reconnect scheduling and event fan-out.
pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    options: ConnectionOptions,
    inner: Mutex<ConnectionInner>,
    subscribers: Arc<Mutex<Subscribers>>,
}

impl ConnectionManager {
    pub fn new(connector: Arc<dyn Connector>, options: ConnectionOptions) -> Arc<Self> {
        Arc::new(Self {
            connector,
            options,
            inner: Mutex::new(ConnectionInner {
                state: ConnectionState::Disconnected,
                wants_connection: false,
                credential: None,
                outbound: None,
                queue: VecDeque::new(),
                reconnect: None,
                reader: None,
                generation: 0,
            }),
            subscribers: Arc::new(Mutex::new(Subscribers::default())),
        })
    }

    pub fn state(&self) -> ConnectionState {
        self.lock().state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn queued_frames(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn has_pending_reconnect(&self) -> bool {
        self.lock().reconnect.is_some()
    }

    pub fn connect(self: &Arc<Self>, credential: Option<String>) {
        let mut events = Vec::new();
        {
            let mut inner = self.lock();
            inner.wants_connection = true;
            if credential.is_some() {
                inner.credential = credential;
            }
            if matches!(
                inner.state,
                ConnectionState::Connecting | ConnectionState::Connected
            ) {
                return;
            }
            if let Some(timer) = inner.reconnect.take() {
                timer.abort();
            }
            self.begin_open(&mut inner, &mut events);
        }
        self.dispatch(events);
    }

    pub fn disconnect(&self) {
        let mut events = Vec::new();
        {
            let mut inner = self.lock();
            inner.wants_connection = false;
            inner.generation += 1;
            if let Some(timer) = inner.reconnect.take() {
                timer.abort();
            }
            if let Some(reader) = inner.reader.take() {
                reader.abort();
            }
            inner.outbound = None;
            transition(&mut inner, ConnectionState::Disconnected, &mut events);
        }
        info!("push connection closed by client");
        self.dispatch(events);
    }

    /// Replaces the held credential and re-authenticates an open socket.
    pub fn set_credential(&self, credential: impl Into<String>) {
        let credential = credential.into();
        let mut inner = self.lock();
        inner.credential = Some(credential.clone());
        if inner.state != ConnectionState::Connected {
            return;
        }
        if let (Some(outbound), Some(auth)) = (inner.outbound.as_ref(), auth_frame(&credential)) {
            if outbound.send(auth).is_err() {
                warn!("push writer gone; re-authentication deferred to next connect");
            }
        }
    }

    pub fn send(self: &Arc<Self>, frame: &ClientFrame) {
        match serde_json::to_string(frame) {
            Ok(text) => self.send_text(text),
            Err(err) => warn!(frame_type = frame.type_name(), error = %err, "failed to encode frame"),
        }
    }

    /// Sends a `{ type, payload }` frame built from loose parts.
    pub fn send_raw<P: Serialize>(self: &Arc<Self>, frame_type: &str, payload: &P) {
        let envelope = RawFrame {
            frame_type,
            payload,
        };
        match serde_json::to_string(&envelope) {
            Ok(text) => self.send_text(text),
            Err(err) => warn!(frame_type, error = %err, "failed to encode frame"),
        }
    }

    fn send_text(self: &Arc<Self>, text: String) {
        let mut inner = self.lock();
        if inner.state == ConnectionState::Connected {
            if let Some(outbound) = inner.outbound.as_ref() {
                match outbound.send(text) {
                    Ok(()) => return,
                    Err(returned) => {
                        inner.queue.push_back(returned.0);
                        return;
                    }
                }
            }
        }
        inner.queue.push_back(text);
        debug!(queued = inner.queue.len(), "frame queued until connected");
        if inner.wants_connection && inner.state == ConnectionState::Disconnected {
            self.schedule_reconnect(&mut inner);
        }
    }

    pub fn subscribe<F>(&self, filter: EventFilter, handler: F) -> Subscription
    where
        F: Fn(&ConnectionEvent) + Send + Sync + 'static,
    {
        let mut subscribers = lock_recovered(&self.subscribers);
        subscribers.next_id += 1;
        let id = subscribers.next_id;
        subscribers.handlers.push((id, filter, Arc::new(handler)));
        Subscription {
            id,
            subscribers: Arc::downgrade(&self.subscribers),
        }
    }

    fn begin_open(self: &Arc<Self>, inner: &mut ConnectionInner, events: &mut Vec<ConnectionEvent>) {
        inner.generation += 1;
        let generation = inner.generation;
        transition(inner, ConnectionState::Connecting, events);
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let result = manager.connector.connect().await;
            manager.finish_open(generation, result);
        });
    }

    fn finish_open(
        self: &Arc<Self>,
        generation: u64,
        result: Result<Transport, crate::error::TransportError>,
    ) {
        let mut events = Vec::new();
        {
            let mut inner = self.lock();
            if inner.generation != generation || !inner.wants_connection {
                debug!(generation, "discarding stale connection attempt");
                return;
            }
            match result {
                Ok(transport) => {
                    let Transport { outbound, inbound } = transport;
                    let authenticated = match inner.credential.as_deref().and_then(auth_frame) {
                        Some(auth) => outbound.send(auth).is_ok(),
                        None => true,
                    };
                    if !authenticated {
                        warn!(generation, "push writer closed before auth was sent");
                        self.fail(&mut inner, &mut events);
                    } else {
                        while let Some(frame) = inner.queue.pop_front() {
                            if let Err(returned) = outbound.send(frame) {
                                inner.queue.push_front(returned.0);
                                break;
                            }
                        }
                        inner.outbound = Some(outbound);
                        transition(&mut inner, ConnectionState::Connected, &mut events);
                        inner.reader = Some(self.spawn_reader(generation, inbound));
                        info!(generation, "push connection established");
                    }
                }
                Err(err) => {
                    warn!(error = %err, "push connection failed");
                    self.fail(&mut inner, &mut events);
                }
            }
        }
        self.dispatch(events);
    }

    fn spawn_reader(
        self: &Arc<Self>,
        generation: u64,
        mut inbound: mpsc::UnboundedReceiver<TransportEvent>,
    ) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = inbound.recv().await {
                if !manager.handle_transport_event(generation, event) {
                    return;
                }
            }
            manager.handle_transport_event(generation, TransportEvent::Closed);
        })
    }

    /// Returns false once the transport is finished.
    fn handle_transport_event(self: &Arc<Self>, generation: u64, event: TransportEvent) -> bool {
        let mut events = Vec::new();
        let keep_reading = {
            let mut inner = self.lock();
            if inner.generation != generation {
                return false;
            }
            match event {
                TransportEvent::Frame(text) => {
                    match serde_json::from_str::<ServerEvent>(&text) {
                        Ok(event) => {
                            if let ServerEvent::Error { error } = &event {
                                warn!(code = %error.code, detail = %error.message, "server reported error");
                            }
                            events.push(ConnectionEvent::Server(event));
                        }
                        Err(err) => warn!(error = %err, "ignoring unparseable server frame"),
                    }
                    true
                }
                TransportEvent::Error(reason) => {
                    warn!(%reason, "push transport error");
                    inner.reader = None;
                    self.fail(&mut inner, &mut events);
                    false
                }
                TransportEvent::Closed => {
                    info!("push transport closed");
                    inner.reader = None;
                    inner.outbound = None;
                    transition(&mut inner, ConnectionState::Disconnected, &mut events);
                    self.schedule_reconnect(&mut inner);
                    false
                }
            }
        };
        self.dispatch(events);
        keep_reading
    }

    /// Error is transient: it is always followed by disconnected before a
    /// reconnect is scheduled.
    fn fail(self: &Arc<Self>, inner: &mut ConnectionInner, events: &mut Vec<ConnectionEvent>) {
        inner.outbound = None;
        transition(inner, ConnectionState::Error, events);
        transition(inner, ConnectionState::Disconnected, events);
        self.schedule_reconnect(inner);
    }

    fn schedule_reconnect(self: &Arc<Self>, inner: &mut ConnectionInner) {
        if !inner.wants_connection || inner.reconnect.is_some() {
            return;
        }
        let delay = self.options.reconnect_delay;
        let expected_generation = inner.generation;
        info!(delay_ms = delay.as_millis() as u64, "scheduling reconnect");
        let manager = Arc::clone(self);
        inner.reconnect = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let mut events = Vec::new();
            {
                let mut inner = manager.lock();
                inner.reconnect = None;
                if !inner.wants_connection
                    || inner.generation != expected_generation
                    || inner.state != ConnectionState::Disconnected
                {
                    return;
                }
                manager.begin_open(&mut inner, &mut events);
            }
            manager.dispatch(events);
        }));
    }

    fn dispatch(&self, events: Vec<ConnectionEvent>) {
        for event in events {
            let handlers: Vec<Handler> = lock_recovered(&self.subscribers)
                .handlers
                .iter()
                .filter(|(_, filter, _)| filter.matches(&event))
                .map(|(_, _, handler)| Arc::clone(handler))
                .collect();
            for handler in handlers {
                handler(&event);
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, ConnectionInner> {
        lock_recovered(&self.inner)
    }
}

fn transition(
    inner: &mut ConnectionInner,
    next: ConnectionState,
    events: &mut Vec<ConnectionEvent>,
) {
    if inner.state == next {
        return;
    }
    debug!(from = ?inner.state, to = ?next, "connection state changed");
    inner.state = next;
    events.push(ConnectionEvent::Status(next));
}

fn auth_frame(credential: &str) -> Option<String> {
    serde_json::to_string(&ClientFrame::Auth {
        access_token: credential.to_string(),
    })
    .ok()
}

fn lock_recovered<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
#[path = "tests/connection_tests.rs"]
mod tests;
