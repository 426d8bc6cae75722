//! Self-healing connection to a collaboration endpoint.
//!
//! One [`Connector`] owns one logical duplex channel. A single driver task
//! runs the state machine, so handlers never interleave:
//!
//! ```text
//!            ┌──────────── timer fires ◀──────────────┐
//!            ▼                                        │
//!       Connecting ──open──▶ Open ──close/error──▶ Closed ──attempts left──┘
//!            │                                        │
//!            └──────────── connect error ─────────────┤
//!                                                     └─ no attempts left ──▶ GivingUp
//! ```
//!
//! The retry counter resets only on a successful open. `stop()` cancels the
//! pending timer, closes the socket and silences every observer callback,
//! from any state.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, ThreadId};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::backoff::{Backoff, ConnectorConfig};
use crate::protocol::Payload;
use crate::transport::{Link, LinkEvent, Transport, TransportError, WebSocketTransport};

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closed,
    /// Retries exhausted. Terminal.
    GivingUp,
}

/// What happens after a close.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPlan {
    After(Duration),
    ExhaustedRetries,
}

/// Passed to [`ConnectionObserver::on_close`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseInfo {
    /// Set when the close was caused by a transport error.
    pub cause: Option<TransportError>,
    pub next: RetryPlan,
}

/// Lifecycle callbacks. Every method is optional.
///
/// Callbacks run on the connector's driver task and must not block.
pub trait ConnectionObserver: Send + 'static {
    fn on_open(&mut self) {}
    fn on_close(&mut self, _info: &CloseInfo) {}
    fn on_message(&mut self, _payload: Payload) {}
    fn on_error(&mut self, _error: &TransportError) {}
    fn on_retry_scheduled(&mut self, _attempt: u32, _delay: Duration) {}
}

impl ConnectionObserver for () {}

/// Observer callbacks as values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Opened,
    Closed(CloseInfo),
    Message(Payload),
    Error(TransportError),
    RetryScheduled { attempt: u32, delay: Duration },
}

/// Forwards every callback into an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelObserver {
    tx: mpsc::UnboundedSender<ConnectionEvent>,
}

impl ChannelObserver {
    /// Create the observer and the receiving end of its events.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ConnectionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn forward(&self, event: ConnectionEvent) {
        // Receiver gone means nobody is listening any more.
        let _ = self.tx.send(event);
    }
}

impl ConnectionObserver for ChannelObserver {
    fn on_open(&mut self) {
        self.forward(ConnectionEvent::Opened);
    }

    fn on_close(&mut self, info: &CloseInfo) {
        self.forward(ConnectionEvent::Closed(info.clone()));
    }

    fn on_message(&mut self, payload: Payload) {
        self.forward(ConnectionEvent::Message(payload));
    }

    fn on_error(&mut self, error: &TransportError) {
        self.forward(ConnectionEvent::Error(error.clone()));
    }

    fn on_retry_scheduled(&mut self, attempt: u32, delay: Duration) {
        self.forward(ConnectionEvent::RetryScheduled { attempt, delay });
    }
}

/// Bounded FIFO of frames sent while not open.
///
/// Replayed right after the next successful open.
pub struct OfflineQueue {
    queue: VecDeque<Payload>,
    max_size: usize,
}

impl OfflineQueue {
    /// Create a queue holding at most `max_size` frames.
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(max_size.min(1024)),
            max_size,
        }
    }

    /// Queue a frame. Returns `false` when full.
    pub fn enqueue(&mut self, payload: Payload) -> bool {
        if self.queue.len() >= self.max_size {
            return false;
        }
        self.queue.push_back(payload);
        true
    }

    /// Take every queued frame, oldest first.
    pub fn drain(&mut self) -> Vec<Payload> {
        self.queue.drain(..).collect()
    }

    /// Number of queued frames.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Check if the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Total payload bytes waiting.
    pub fn total_bytes(&self) -> usize {
        self.queue.iter().map(Payload::len).sum()
    }
}

/// Observer plus the stop flag that gates it.
///
/// A callback only runs while holding `observer` and after checking
/// `stopped`, so once `stop()` has set the flag and taken the lock, no
/// callback can start.
struct Dispatch {
    stopped: AtomicBool,
    observer: Mutex<Box<dyn ConnectionObserver>>,
    /// Thread currently inside a callback, if any.
    in_callback: Mutex<Option<ThreadId>>,
}

impl Dispatch {
    fn new(observer: Box<dyn ConnectionObserver>) -> Self {
        Self {
            stopped: AtomicBool::new(false),
            observer: Mutex::new(observer),
            in_callback: Mutex::new(None),
        }
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Run a callback unless stopped. Returns `false` if suppressed.
    fn emit(&self, callback: impl FnOnce(&mut dyn ConnectionObserver)) -> bool {
        let mut observer = self.observer.lock().unwrap_or_else(PoisonError::into_inner);
        if self.is_stopped() {
            return false;
        }
        let _guard = CallbackGuard::enter(&self.in_callback);
        callback(observer.as_mut());
        true
    }

    /// Set the stop flag and wait out a callback running elsewhere.
    fn stop(&self) -> bool {
        let first = !self.stopped.swap(true, Ordering::SeqCst);
        let current = thread::current().id();
        let reentrant = *self
            .in_callback
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            == Some(current);
        if !reentrant {
            drop(self.observer.lock().unwrap_or_else(PoisonError::into_inner));
        }
        first
    }
}

struct CallbackGuard<'a> {
    slot: &'a Mutex<Option<ThreadId>>,
}

impl<'a> CallbackGuard<'a> {
    fn enter(slot: &'a Mutex<Option<ThreadId>>) -> Self {
        *slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(thread::current().id());
        Self { slot }
    }
}

impl Drop for CallbackGuard<'_> {
    fn drop(&mut self) {
        *self.slot.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

/// Handle to a running connection.
///
/// Construct on mount, [`stop`](Connector::stop) (or drop) on teardown.
/// Must be created inside a Tokio runtime.
pub struct Connector {
    url: String,
    commands: mpsc::UnboundedSender<Payload>,
    state: watch::Receiver<ConnectionState>,
    attempts: Arc<AtomicU32>,
    dispatch: Arc<Dispatch>,
    queue_enabled: bool,
    task: JoinHandle<()>,
}

impl Connector {
    /// Connect over WebSocket.
    pub fn connect(
        url: impl Into<String>,
        config: ConnectorConfig,
        observer: impl ConnectionObserver,
    ) -> Self {
        Self::spawn(url, config, WebSocketTransport::new(), observer)
    }

    /// Connect over an arbitrary transport. The first attempt starts
    /// immediately; this never blocks waiting for it.
    pub fn spawn<T: Transport>(
        url: impl Into<String>,
        config: ConnectorConfig,
        transport: T,
        observer: impl ConnectionObserver,
    ) -> Self {
        let url = url.into();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        let attempts = Arc::new(AtomicU32::new(0));
        let dispatch = Arc::new(Dispatch::new(Box::new(observer)));

        let driver = Driver {
            url: url.clone(),
            backoff: config.backoff(),
            transport,
            commands: commands_rx,
            state: state_tx,
            attempts: attempts.clone(),
            dispatch: dispatch.clone(),
            queue: OfflineQueue::new(config.offline_queue_capacity),
        };
        let task = tokio::spawn(driver.run());

        Self {
            url,
            commands: commands_tx,
            state: state_rx,
            attempts,
            dispatch,
            queue_enabled: config.offline_queue_capacity > 0,
            task,
        }
    }

    /// Send a frame.
    ///
    /// Dropped silently unless the connection is open, or the offline queue
    /// is enabled. Returns whether the frame was handed on.
    pub fn send(&self, payload: impl Into<Payload>) -> bool {
        if self.is_stopped() {
            return false;
        }
        if !self.is_connected() && !self.queue_enabled {
            log::trace!("Dropping outbound frame: not connected");
            return false;
        }
        self.commands.send(payload.into()).is_ok()
    }

    /// Tear down: cancel any pending retry, close the socket, and make sure
    /// no observer callback fires after this returns. Idempotent.
    pub fn stop(&self) {
        if self.dispatch.stop() {
            log::info!("Connector for {} stopped", self.url);
        }
        self.task.abort();
    }

    /// Current state. Reads `Closed` once stopped, unless it had given up.
    pub fn state(&self) -> ConnectionState {
        let state = *self.state.borrow();
        if self.is_stopped() && state != ConnectionState::GivingUp {
            ConnectionState::Closed
        } else {
            state
        }
    }

    /// Whether the connection is open right now.
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Whether `stop()` has been called.
    pub fn is_stopped(&self) -> bool {
        self.dispatch.is_stopped()
    }

    /// Retries scheduled since the last successful open.
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Endpoint this connector targets.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Wait until the connector reaches `target`.
    ///
    /// Returns `false` if the connector ends (stopped or gave up) first.
    pub async fn wait_for_state(&self, target: ConnectionState) -> bool {
        let mut rx = self.state.clone();
        let reached = rx.wait_for(|state| *state == target).await.is_ok();
        reached && !(self.is_stopped() && target != ConnectionState::Closed)
    }
}

impl Drop for Connector {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for Connector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connector")
            .field("url", &self.url)
            .field("state", &self.state())
            .field("attempts", &self.attempts())
            .finish()
    }
}

enum Served {
    Closed(Option<TransportError>),
    Shutdown,
}

/// The connector's event loop. Owns the socket, the timer and the queue.
struct Driver<T> {
    url: String,
    backoff: Backoff,
    transport: T,
    commands: mpsc::UnboundedReceiver<Payload>,
    state: watch::Sender<ConnectionState>,
    attempts: Arc<AtomicU32>,
    dispatch: Arc<Dispatch>,
    queue: OfflineQueue,
}

impl<T: Transport> Driver<T> {
    async fn run(mut self) {
        let mut attempt: u32 = 0;

        loop {
            if self.dispatch.is_stopped() {
                return;
            }
            self.set_state(ConnectionState::Connecting);
            log::debug!("Connecting to {} (retry {attempt})", self.url);

            let connect = self.transport.connect(&self.url);
            tokio::pin!(connect);
            let result = loop {
                tokio::select! {
                    result = &mut connect => break result,
                    command = self.commands.recv() => match command {
                        Some(payload) => self.hold(payload),
                        None => return,
                    },
                }
            };

            let cause = match result {
                Ok(link) => {
                    attempt = 0;
                    self.attempts.store(0, Ordering::SeqCst);
                    self.set_state(ConnectionState::Open);
                    log::info!("Connected to {}", self.url);
                    if !self.dispatch.emit(|o| o.on_open()) {
                        return;
                    }
                    match self.serve(link).await {
                        Served::Closed(cause) => cause,
                        Served::Shutdown => return,
                    }
                }
                Err(e) => Some(e),
            };

            self.set_state(ConnectionState::Closed);
            if let Some(error) = &cause {
                log::warn!("Connection to {} failed: {error}", self.url);
                if !self.dispatch.emit(|o| o.on_error(error)) {
                    return;
                }
            }

            let next = if self.backoff.can_retry(attempt) {
                RetryPlan::After(self.backoff.delay(attempt))
            } else {
                RetryPlan::ExhaustedRetries
            };
            if !self.dispatch.emit(|o| o.on_close(&CloseInfo { cause, next })) {
                return;
            }

            let delay = match next {
                RetryPlan::After(delay) => delay,
                RetryPlan::ExhaustedRetries => {
                    log::warn!(
                        "Giving up on {} after {} retries",
                        self.url,
                        self.backoff.max_attempts()
                    );
                    self.set_state(ConnectionState::GivingUp);
                    return;
                }
            };

            if !self.dispatch.emit(|o| o.on_retry_scheduled(attempt, delay)) {
                return;
            }
            log::debug!("Retrying {} in {delay:?}", self.url);
            attempt += 1;
            self.attempts.store(attempt, Ordering::SeqCst);

            let timer = tokio::time::sleep(delay);
            tokio::pin!(timer);
            loop {
                tokio::select! {
                    _ = &mut timer => break,
                    command = self.commands.recv() => match command {
                        Some(payload) => self.hold(payload),
                        None => return,
                    },
                }
            }
        }
    }

    /// Pump an open link until it closes or the handle goes away.
    async fn serve(&mut self, mut link: Link) -> Served {
        for payload in self.queue.drain() {
            if let Err(e) = link.send(payload).await {
                return Served::Closed(Some(e));
            }
        }

        loop {
            tokio::select! {
                event = link.recv() => match event {
                    LinkEvent::Message(payload) => {
                        if !self.dispatch.emit(|o| o.on_message(payload)) {
                            return Served::Shutdown;
                        }
                    }
                    LinkEvent::Closed { cause } => return Served::Closed(cause),
                },
                command = self.commands.recv() => match command {
                    Some(payload) => {
                        if let Err(e) = link.send(payload).await {
                            return Served::Closed(Some(e));
                        }
                    }
                    None => return Served::Shutdown,
                },
            }
        }
    }

    /// A frame arrived while not open: queue it or drop it.
    fn hold(&mut self, payload: Payload) {
        if !self.queue.enqueue(payload) {
            log::debug!("Dropping outbound frame while disconnected ({} queued)", self.queue.len());
        }
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::future::BoxFuture;
    use futures_util::FutureExt;

    /// Transport whose every attempt fails.
    struct Unreachable;

    impl Transport for Unreachable {
        fn connect(&self, _url: &str) -> BoxFuture<'static, Result<Link, TransportError>> {
            async { Err(TransportError::Connect("refused".into())) }.boxed()
        }
    }

    #[test]
    fn test_offline_queue() {
        let mut queue = OfflineQueue::new(100);
        assert!(queue.is_empty());

        queue.enqueue(Payload::Binary(vec![1, 2, 3]));
        queue.enqueue(Payload::from("abcd"));
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.total_bytes(), 7);

        let drained = queue.drain();
        assert_eq!(drained, vec![Payload::Binary(vec![1, 2, 3]), Payload::from("abcd")]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_offline_queue_capacity() {
        let mut queue = OfflineQueue::new(2);
        assert!(queue.enqueue(Payload::from("a")));
        assert!(queue.enqueue(Payload::from("b")));
        assert!(!queue.enqueue(Payload::from("c")));
        assert_eq!(queue.len(), 2);

        let mut disabled = OfflineQueue::new(0);
        assert!(!disabled.enqueue(Payload::from("a")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_initial_state_is_connecting() {
        let connector = Connector::spawn("ws://test", ConnectorConfig::default(), Unreachable, ());
        assert_eq!(connector.state(), ConnectionState::Connecting);
        assert!(!connector.is_connected());
        assert_eq!(connector.url(), "ws://test");
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_attempts() {
        let config = ConnectorConfig::new().with_max_attempts(3);
        let (observer, mut events) = ChannelObserver::new();
        let connector = Connector::spawn("ws://test", config, Unreachable, observer);

        assert!(connector.wait_for_state(ConnectionState::GivingUp).await);
        assert_eq!(connector.attempts(), 3);

        let mut closes = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let ConnectionEvent::Closed(info) = event {
                closes.push(info.next);
            }
        }
        assert_eq!(
            closes,
            vec![
                RetryPlan::After(Duration::from_millis(500)),
                RetryPlan::After(Duration::from_millis(1000)),
                RetryPlan::After(Duration::from_millis(2000)),
                RetryPlan::ExhaustedRetries,
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_dropped_when_not_open() {
        let connector = Connector::spawn("ws://test", ConnectorConfig::default(), Unreachable, ());
        assert!(!connector.send("hello"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_is_idempotent() {
        let connector = Connector::spawn("ws://test", ConnectorConfig::default(), Unreachable, ());
        connector.stop();
        connector.stop();
        assert!(connector.is_stopped());
        assert_eq!(connector.state(), ConnectionState::Closed);
        assert!(!connector.send("late"));
    }
}
