//! Reconnection engine.
//!
//! One engine establishes one physical connection. It runs a single driver
//! task that moves through
//!
//! ```text
//! Initial -> Connecting -> Connected
//!               |  ^
//!               v  |
//!        ReconnectScheduled -> Failed
//!
//! (any non-terminal state) -> Cancelled
//! ```
//!
//! Every transition, the cancel path included, happens under one lock, and
//! the result sender is taken out under that lock. The handle therefore
//! observes exactly one terminal result.

use crate::strategy::ReconnectStrategy;
use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use usc_monitor::{ErrorInfo, ErrorLevel, EventDispatcher, EventKind, MonitorEvent};
use usc_wire::ErrorCode;

/// Terminal failures of a connect attempt
#[derive(Error, Debug)]
pub enum ReconnectError {
    /// Cancelled before a connection was handed out
    #[error("connect cancelled")]
    Cancelled,

    /// The strategy declined to retry
    #[error("giving up after {attempts} attempts: {source}")]
    Exhausted {
        /// Connect attempts made
        attempts: u32,
        /// Failure of the last attempt
        #[source]
        source: io::Error,
    },

    /// `connect` was called on an engine that already started
    #[error("connect already started")]
    AlreadyStarted,

    /// The driver task ended without resolving
    #[error("connect task aborted")]
    Aborted,
}

/// Opens physical connections
#[async_trait]
pub trait ConnectionFactory: Send + Sync + 'static {
    /// Established connection
    type Connection: Send + 'static;

    /// Open a connection to `addr`
    async fn connect(&self, addr: SocketAddr) -> io::Result<Self::Connection>;

    /// Dispose of a connection nobody will use
    async fn discard(&self, connection: Self::Connection) {
        drop(connection);
    }
}

/// Engine state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectState {
    /// `connect` not called yet
    Initial,
    /// Attempt in flight
    Connecting {
        /// 1-based attempt number
        attempt: u32,
    },
    /// Waiting before the next attempt
    ReconnectScheduled {
        /// Attempt that will run next
        attempt: u32,
        /// Delay before it runs
        delay: Duration,
    },
    /// Connection handed out
    Connected,
    /// Strategy gave up
    Failed,
    /// Cancelled by the caller
    Cancelled,
}

impl ReconnectState {
    /// Whether the engine has resolved
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ReconnectState::Connected | ReconnectState::Failed | ReconnectState::Cancelled
        )
    }
}

type Outcome<C> = Result<C, ReconnectError>;

struct Shared<C> {
    state: ReconnectState,
    result: Option<oneshot::Sender<Outcome<C>>>,
}

struct Inner<F: ConnectionFactory> {
    addr: SocketAddr,
    factory: Arc<F>,
    strategy: Arc<dyn ReconnectStrategy>,
    shared: Mutex<Shared<F::Connection>>,
    cancel: CancellationToken,
    events: Option<(Arc<EventDispatcher>, String)>,
}

impl<F: ConnectionFactory> Inner<F> {
    fn lock(&self) -> MutexGuard<'_, Shared<F::Connection>> {
        match self.shared.lock() {
            Ok(shared) => shared,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn state(&self) -> ReconnectState {
        self.lock().state
    }

    fn cancel(&self) -> bool {
        let mut shared = self.lock();
        if shared.state.is_terminal() {
            return false;
        }
        shared.state = ReconnectState::Cancelled;
        if let Some(result) = shared.result.take() {
            let _ = result.send(Err(ReconnectError::Cancelled));
        }
        self.cancel.cancel();
        info!("Connect to {} cancelled", self.addr);
        true
    }

    /// Move to `next` unless a terminal state was reached first
    fn advance(&self, next: ReconnectState) -> bool {
        let mut shared = self.lock();
        if shared.state.is_terminal() {
            return false;
        }
        shared.state = next;
        true
    }

    /// Publish a failed attempt as a channel error of the device
    fn report_failure(&self, cause: &io::Error, level: ErrorLevel, message: String) {
        if let Some((events, device_id)) = &self.events {
            events.publish(MonitorEvent::new(
                device_id.clone(),
                EventKind::ChannelError(ErrorInfo::new(ErrorCode::from_io_error(cause), level, message)),
            ));
        }
    }

    async fn run(self: Arc<Self>) {
        let mut attempt = 1;
        loop {
            if !self.advance(ReconnectState::Connecting { attempt }) {
                return;
            }

            let timeout = self.strategy.connect_timeout();
            debug!("Connecting to {} (attempt {}, timeout {:?})", self.addr, attempt, timeout);

            let result = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return,
                result = tokio::time::timeout(timeout, self.factory.connect(self.addr)) => result,
            };
            let result = result.unwrap_or_else(|_| {
                Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("connect timed out after {:?}", timeout),
                ))
            });

            let cause = match result {
                Ok(connection) => {
                    self.complete(connection).await;
                    return;
                }
                Err(cause) => cause,
            };

            let delay = {
                let mut shared = self.lock();
                if shared.state.is_terminal() {
                    return;
                }
                match self.strategy.schedule_reconnect(&cause) {
                    Some(delay) => {
                        warn!(
                            "Failed to connect to {}: {}; retrying in {:?}",
                            self.addr, cause, delay
                        );
                        self.report_failure(
                            &cause,
                            ErrorLevel::Warning,
                            format!("connect attempt {} failed: {}", attempt, cause),
                        );
                        shared.state = ReconnectState::ReconnectScheduled {
                            attempt: attempt + 1,
                            delay,
                        };
                        delay
                    }
                    None => {
                        warn!(
                            "Failed to connect to {} after {} attempts: {}",
                            self.addr, attempt, cause
                        );
                        self.report_failure(
                            &cause,
                            ErrorLevel::Error,
                            format!("giving up after {} attempts: {}", attempt, cause),
                        );
                        shared.state = ReconnectState::Failed;
                        if let Some(result) = shared.result.take() {
                            let _ = result.send(Err(ReconnectError::Exhausted {
                                attempts: attempt,
                                source: cause,
                            }));
                        }
                        return;
                    }
                }
            };

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
        }
    }

    async fn complete(&self, connection: F::Connection) {
        let unclaimed = {
            let mut shared = self.lock();
            if shared.state.is_terminal() {
                // Cancelled while the connect was finishing
                Some(connection)
            } else {
                shared.state = ReconnectState::Connected;
                self.strategy.reconnect_successful();
                info!("Connected to {}", self.addr);
                match shared.result.take() {
                    Some(result) => result.send(Ok(connection)).err().and_then(|outcome| outcome.ok()),
                    None => Some(connection),
                }
            }
        };

        if let Some(connection) = unclaimed {
            debug!("Discarding unclaimed connection to {}", self.addr);
            self.factory.discard(connection).await;
        }
    }
}

/// Establishes one connection under a retry strategy
pub struct ReconnectEngine<F: ConnectionFactory> {
    inner: Arc<Inner<F>>,
    result: Mutex<Option<oneshot::Receiver<Outcome<F::Connection>>>>,
}

impl<F: ConnectionFactory> ReconnectEngine<F> {
    /// Create an engine for `addr`
    pub fn new(addr: SocketAddr, factory: Arc<F>, strategy: Arc<dyn ReconnectStrategy>) -> Self {
        let (tx, rx) = oneshot::channel();
        Self {
            inner: Arc::new(Inner {
                addr,
                factory,
                strategy,
                shared: Mutex::new(Shared {
                    state: ReconnectState::Initial,
                    result: Some(tx),
                }),
                cancel: CancellationToken::new(),
                events: None,
            }),
            result: Mutex::new(Some(rx)),
        }
    }

    /// Publish failed attempts to `events` as errors of `device_id`
    ///
    /// Has no effect once [`ReconnectEngine::connect`] was called.
    pub fn with_events(mut self, events: Arc<EventDispatcher>, device_id: impl Into<String>) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.events = Some((events, device_id.into()));
        }
        self
    }

    /// Target address
    pub fn addr(&self) -> SocketAddr {
        self.inner.addr
    }

    /// Current state
    pub fn state(&self) -> ReconnectState {
        self.inner.state()
    }

    /// Start connecting; must be called inside a tokio runtime
    ///
    /// Only the first call starts the engine; later calls fail with
    /// [`ReconnectError::AlreadyStarted`].
    pub fn connect(&self) -> Result<ConnectHandle<F>, ReconnectError> {
        let rx = {
            let mut result = match self.result.lock() {
                Ok(result) => result,
                Err(poisoned) => poisoned.into_inner(),
            };
            result.take().ok_or(ReconnectError::AlreadyStarted)?
        };

        tokio::spawn(self.inner.clone().run());
        Ok(ConnectHandle {
            inner: self.inner.clone(),
            rx: Some(rx),
        })
    }

    /// Cancel the engine; returns whether this call cancelled it
    pub fn cancel(&self) -> bool {
        self.inner.cancel()
    }
}

/// Completion handle of a started engine
pub struct ConnectHandle<F: ConnectionFactory> {
    inner: Arc<Inner<F>>,
    rx: Option<oneshot::Receiver<Outcome<F::Connection>>>,
}

impl<F: ConnectionFactory> ConnectHandle<F> {
    /// Wait for the terminal result
    ///
    /// Dropping the handle, or a pending `wait`, cancels the engine.
    pub async fn wait(mut self) -> Result<F::Connection, ReconnectError> {
        match self.rx.take() {
            Some(rx) => rx.await.unwrap_or(Err(ReconnectError::Aborted)),
            None => Err(ReconnectError::Aborted),
        }
    }

    /// Cancel the engine; returns whether this call cancelled it
    pub fn cancel(&self) -> bool {
        self.inner.cancel()
    }

    /// Current state
    pub fn state(&self) -> ReconnectState {
        self.inner.state()
    }
}

impl<F: ConnectionFactory> Drop for ConnectHandle<F> {
    fn drop(&mut self) {
        // Nobody can observe the result any more
        self.inner.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::{BackoffConfig, ExponentialBackoff};
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, PartialEq, Eq)]
    struct FakeConnection(u32);

    /// Factory replaying scripted outcomes
    #[derive(Default)]
    struct ScriptedFactory {
        script: Mutex<VecDeque<io::Result<FakeConnection>>>,
        connects: AtomicUsize,
        discarded: AtomicUsize,
        on_connect: Mutex<Option<Box<dyn FnOnce() + Send>>>,
    }

    impl ScriptedFactory {
        fn new(script: Vec<io::Result<FakeConnection>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                ..Default::default()
            })
        }
    }

    #[async_trait]
    impl ConnectionFactory for ScriptedFactory {
        type Connection = FakeConnection;

        async fn connect(&self, _addr: SocketAddr) -> io::Result<FakeConnection> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            let hook = self.on_connect.lock().unwrap().take();
            if let Some(hook) = hook {
                hook();
            }
            let next = self.script.lock().unwrap().pop_front();
            match next {
                Some(outcome) => outcome,
                None => std::future::pending().await,
            }
        }

        async fn discard(&self, _connection: FakeConnection) {
            self.discarded.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn refused() -> io::Result<FakeConnection> {
        Err(io::Error::from(io::ErrorKind::ConnectionRefused))
    }

    fn addr() -> SocketAddr {
        "127.0.0.1:1069".parse().unwrap()
    }

    fn backoff(max_retries: Option<u32>) -> Arc<dyn ReconnectStrategy> {
        Arc::new(ExponentialBackoff::new(BackoffConfig {
            max_retries,
            ..BackoffConfig::default()
        }))
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_until_success() {
        let factory = ScriptedFactory::new(vec![refused(), refused(), Ok(FakeConnection(7))]);
        let engine = ReconnectEngine::new(addr(), factory.clone(), backoff(None));

        let connection = engine.connect().unwrap().wait().await.unwrap();
        assert_eq!(connection, FakeConnection(7));
        assert_eq!(factory.connects.load(Ordering::SeqCst), 3);
        assert_eq!(engine.state(), ReconnectState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_when_retries_exhausted() {
        let factory = ScriptedFactory::new(vec![refused(), refused(), refused(), Ok(FakeConnection(1))]);
        let engine = ReconnectEngine::new(addr(), factory.clone(), backoff(Some(2)));

        let err = engine.connect().unwrap().wait().await.unwrap_err();
        assert!(matches!(err, ReconnectError::Exhausted { attempts: 3, .. }));
        assert_eq!(factory.connects.load(Ordering::SeqCst), 3);
        assert_eq!(engine.state(), ReconnectState::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_attempts_are_published() {
        let events = Arc::new(EventDispatcher::new(1));
        let (listener, mut rx) = usc_monitor::ForwardingListener::new();
        events.add_listener(Arc::new(listener));

        let factory = ScriptedFactory::new(vec![refused(), refused(), refused()]);
        let engine = ReconnectEngine::new(addr(), factory, backoff(Some(2)))
            .with_events(events.clone(), "127.0.0.1:1069");
        engine.connect().unwrap().wait().await.unwrap_err();

        let mut levels = Vec::new();
        for _ in 0..3 {
            let event = rx.recv().await.unwrap();
            assert_eq!(event.device_id, "127.0.0.1:1069");
            let EventKind::ChannelError(error) = &event.kind else {
                panic!("unexpected event {:?}", event.kind);
            };
            assert_eq!(error.error_code, ErrorCode::ConnRefused);
            levels.push(error.level);
        }
        assert_eq!(levels, vec![ErrorLevel::Warning, ErrorLevel::Warning, ErrorLevel::Error]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_only_once() {
        let factory = ScriptedFactory::new(vec![Ok(FakeConnection(1))]);
        let engine = ReconnectEngine::new(addr(), factory, backoff(None));
        let handle = engine.connect().unwrap();
        assert!(matches!(engine.connect(), Err(ReconnectError::AlreadyStarted)));
        handle.wait().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_scheduled_reconnect() {
        let factory = ScriptedFactory::new(vec![refused(), Ok(FakeConnection(1))]);
        let engine = ReconnectEngine::new(addr(), factory.clone(), backoff(None));
        let handle = engine.connect().unwrap();

        while !matches!(engine.state(), ReconnectState::ReconnectScheduled { .. }) {
            tokio::task::yield_now().await;
        }
        assert!(handle.cancel());
        assert!(!engine.cancel());

        let err = handle.wait().await.unwrap_err();
        assert!(matches!(err, ReconnectError::Cancelled));

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(factory.connects.load(Ordering::SeqCst), 1);
        assert_eq!(engine.state(), ReconnectState::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_racing_connect_success_discards_connection() {
        let factory = ScriptedFactory::new(vec![Ok(FakeConnection(9))]);
        let engine = Arc::new(ReconnectEngine::new(addr(), factory.clone(), backoff(None)));

        // Cancel lands after the connect produced its connection but before
        // the engine recorded the success
        let canceller = engine.clone();
        *factory.on_connect.lock().unwrap() = Some(Box::new(move || {
            assert!(canceller.cancel());
        }));

        let err = engine.connect().unwrap().wait().await.unwrap_err();
        assert!(matches!(err, ReconnectError::Cancelled));

        while factory.discarded.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
        assert_eq!(factory.discarded.load(Ordering::SeqCst), 1);
        assert_eq!(engine.state(), ReconnectState::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout_counts_as_failure() {
        // Empty script: every connect hangs
        let factory = ScriptedFactory::new(vec![]);
        let engine = ReconnectEngine::new(addr(), factory.clone(), backoff(Some(1)));

        let err = engine.connect().unwrap().wait().await.unwrap_err();
        match err {
            ReconnectError::Exhausted { attempts, source } => {
                assert_eq!(attempts, 2);
                assert_eq!(source.kind(), io::ErrorKind::TimedOut);
            }
            other => panic!("unexpected error {:?}", other),
        }
    }
}
