//! Server: one broker core behind up to four listeners.
//!
//! Lifecycle is `Stopped -> Starting -> Running -> Stopping -> Stopped`,
//! moved by compare-and-swap on a single atomic so that concurrent `start`
//! and `stop` calls cannot both win.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use bytes::Bytes;
use futures::future::join_all;
use parking_lot::Mutex;
use rustls::ServerConfig as TlsConfig;
use tokio::sync::Notify;
use tracing::{error, info, warn};

use crate::auth::{self, Ledger};
use crate::broker::{AllowAll, Authenticator, Broker, BrokerConfig, Handler};
use crate::config::{AuthSource, ServerConfig, TlsSource, TlsUsage, parse_addr};
use crate::error::{Error, Result};
use crate::listener::{HttpListener, Listener, ListenerKind, MqttListener};
use crate::status::Credentials;
use crate::tls;

/// Server lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum State {
    Stopped = 0,
    Starting = 1,
    Running = 2,
    Stopping = 3,
}

impl From<u8> for State {
    fn from(v: u8) -> Self {
        match v {
            1 => State::Starting,
            2 => State::Running,
            3 => State::Stopping,
            _ => State::Stopped,
        }
    }
}

/// A configured broker with its listeners.
pub struct Server {
    config: ServerConfig,
    authenticator: Arc<dyn Authenticator>,
    ledger: Option<Arc<Ledger>>,
    status_credentials: Arc<Credentials>,
    state: AtomicU8,
    active: Mutex<Active>,
    stopped: Notify,
}

/// What `stop` has to release. Only `start` adds to it, and only while the
/// start that bound the listeners is still current.
#[derive(Default)]
struct Active {
    /// Bumped by every start; a start whose generation is stale drops its
    /// listeners itself.
    generation: u64,
    broker: Option<Broker>,
    listeners: Vec<Arc<dyn Listener>>,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("state", &self.state())
            .field("listeners", &self.active.lock().listeners.len())
            .finish()
    }
}

impl Server {
    /// Validate `config` and prepare the authenticator.
    ///
    /// An auth file is read here. Nothing binds until [`Server::start`].
    pub fn new(config: ServerConfig) -> Result<Self> {
        config.validate()?;

        let (authenticator, ledger) = match &config.auth {
            AuthSource::Disabled => {
                warn!("authentication disabled, every client and topic is allowed");
                (Arc::new(AllowAll) as Arc<dyn Authenticator>, None)
            }
            AuthSource::File(path) => {
                let ledger = Arc::new(auth::load(path.as_deref()).with_admin_rules());
                (ledger.clone() as Arc<dyn Authenticator>, Some(ledger))
            }
            AuthSource::Ledger(ledger) => {
                let ledger = Arc::new(ledger.clone().with_admin_rules());
                (ledger.clone() as Arc<dyn Authenticator>, Some(ledger))
            }
        };

        let status_credentials = Arc::new(Credentials::from_ledger(ledger.as_deref()));

        Ok(Self {
            config,
            authenticator,
            ledger,
            status_credentials,
            state: AtomicU8::new(State::Stopped as u8),
            active: Mutex::new(Active::default()),
            stopped: Notify::new(),
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn state(&self) -> State {
        State::from(self.state.load(Ordering::SeqCst))
    }

    /// The ledger in use, unless authentication is disabled.
    pub fn ledger(&self) -> Option<&Ledger> {
        self.ledger.as_deref()
    }

    /// The current broker core, present between start and stop.
    pub fn broker(&self) -> Option<Broker> {
        self.active.lock().broker.clone()
    }

    /// Bound address of the listener of `kind`, if it is up.
    pub fn local_addr(&self, kind: ListenerKind) -> Option<SocketAddr> {
        self.active
            .lock()
            .listeners
            .iter()
            .find(|l| l.kind() == kind)
            .map(|l| l.local_addr())
    }

    fn transition(&self, from: State, to: State) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Bind every enabled listener and start serving.
    ///
    /// A bind failure is returned as is; listeners bound before it stay
    /// bound and the server stays `Starting` until [`Server::stop`]. A stop
    /// that lands while binding makes this return [`Error::ShuttingDown`]
    /// with everything it bound already closed.
    pub async fn start(&self) -> Result<()> {
        let generation = {
            let mut active = self.active.lock();
            if !self.transition(State::Stopped, State::Starting) {
                return Err(match self.state() {
                    State::Stopping => Error::ShuttingDown,
                    _ => Error::AlreadyRunning,
                });
            }
            active.generation += 1;
            active.generation
        };
        info!("starting server");

        let broker = Broker::builder(
            BrokerConfig::default()
                .buffer_size(self.config.buffer_size)
                .inline_client(self.config.inline_client)
                .sys_interval(self.config.sys_interval),
        )
        .shared_authenticator(Arc::clone(&self.authenticator))
        .build();

        let tls = self.resolve_tls();
        let mut bound: Vec<Arc<dyn Listener>> = Vec::new();
        for kind in ListenerKind::ALL {
            if self.state() != State::Starting {
                break;
            }
            match self.bind(kind, tls.clone()).await {
                Ok(Some(listener)) => bound.push(listener),
                Ok(None) => {}
                Err(e) => {
                    error!(listener = kind.id(), error = %e, "failed to start listener");
                    // Hand what is bound to stop, unless stop already ran.
                    let orphaned = {
                        let mut active = self.active.lock();
                        if active.generation == generation && self.state() == State::Starting {
                            active.listeners.append(&mut bound);
                            active.broker = Some(broker.clone());
                            false
                        } else {
                            true
                        }
                    };
                    if orphaned {
                        release(&bound, &broker).await;
                    }
                    return Err(e);
                }
            }
        }

        if let Err(e) = broker.serve() {
            release(&bound, &broker).await;
            return Err(e);
        }

        let running = {
            let mut active = self.active.lock();
            let current = active.generation == generation
                && self.transition(State::Starting, State::Running);
            if current {
                active.listeners = bound.clone();
                active.broker = Some(broker.clone());
            }
            current
        };
        if !running {
            release(&bound, &broker).await;
            return Err(Error::ShuttingDown);
        }

        for listener in bound {
            tokio::spawn(listener.serve(broker.clone()));
        }
        info!("server running");
        Ok(())
    }

    fn resolve_tls(&self) -> Option<Arc<TlsConfig>> {
        match &self.config.tls {
            TlsSource::None => None,
            TlsSource::Config(config) => Some(Arc::clone(config)),
            TlsSource::Files(files) => {
                match tls::build(&files.cert, &files.key, files.ca.as_deref()) {
                    Ok(config) => Some(config),
                    Err(e) => {
                        warn!(
                            cert = %files.cert.display(),
                            key = %files.key.display(),
                            error = %e,
                            "tls unavailable, tls listeners disabled"
                        );
                        None
                    }
                }
            }
        }
    }

    /// Bind the listener of `kind`; `None` when it is not enabled or lacks TLS.
    async fn bind(
        &self,
        kind: ListenerKind,
        tls: Option<Arc<TlsConfig>>,
    ) -> Result<Option<Arc<dyn Listener>>> {
        let grace = self.config.shutdown_grace;
        let listener: Arc<dyn Listener> = match kind {
            ListenerKind::Mqtt => {
                let Some(addr) = &self.config.mqtt else {
                    return Ok(None);
                };
                Arc::new(MqttListener::bind(kind, parse_addr(addr)?, None, grace).await?)
            }
            ListenerKind::MqttTls => {
                let Some(addr) = &self.config.mqtt_tls else {
                    return Ok(None);
                };
                let Some(tls) = tls else {
                    warn!(listener = kind.id(), "no tls configuration, listener skipped");
                    return Ok(None);
                };
                Arc::new(MqttListener::bind(kind, parse_addr(addr)?, Some(tls), grace).await?)
            }
            ListenerKind::WebSocket => {
                let Some(ws) = &self.config.websocket else {
                    return Ok(None);
                };
                let tls = match (ws.tls, tls) {
                    (TlsUsage::Never, _) => None,
                    (TlsUsage::IfAvailable, tls) => tls,
                    (TlsUsage::Required, Some(tls)) => Some(tls),
                    (TlsUsage::Required, None) => {
                        warn!(listener = kind.id(), "no tls configuration, listener skipped");
                        return Ok(None);
                    }
                };
                Arc::new(MqttListener::bind(kind, parse_addr(&ws.addr)?, tls, grace).await?)
            }
            ListenerKind::HttpStatus => {
                let Some(addr) = &self.config.http else {
                    return Ok(None);
                };
                let credentials = Arc::clone(&self.status_credentials);
                Arc::new(HttpListener::bind(parse_addr(addr)?, credentials, grace).await?)
            }
        };
        info!(
            listener = listener.id(),
            protocol = listener.protocol(),
            addr = %listener.local_addr(),
            "listener bound"
        );
        Ok(Some(listener))
    }

    /// Close every listener and the broker.
    ///
    /// Returns true for the call that performed the shutdown. Concurrent and
    /// repeated calls return false without waiting.
    pub async fn stop(&self) -> bool {
        let claimed = self.transition(State::Running, State::Stopping)
            || self.transition(State::Starting, State::Stopping);
        if !claimed {
            return false;
        }
        info!("stopping server");

        let (listeners, broker) = {
            let mut active = self.active.lock();
            (std::mem::take(&mut active.listeners), active.broker.take())
        };
        if let Some(broker) = broker {
            release(&listeners, &broker).await;
        }

        self.state.store(State::Stopped as u8, Ordering::SeqCst);
        self.stopped.notify_waiters();
        info!("server stopped");
        true
    }

    /// Start, then serve until Ctrl-C or [`Server::stop`].
    pub async fn run(&self) -> Result<()> {
        let stopped = self.stopped.notified();
        tokio::pin!(stopped);
        stopped.as_mut().enable();

        if let Err(e) = self.start().await {
            self.stop().await;
            return Err(e);
        }

        tokio::select! {
            _ = &mut stopped => return Ok(()),
            signal = tokio::signal::ctrl_c() => match signal {
                Ok(()) => info!("interrupt received"),
                Err(e) => {
                    warn!(error = %e, "cannot listen for ctrl-c, waiting for stop");
                    stopped.await;
                    return Ok(());
                }
            },
        }
        self.stop().await;
        Ok(())
    }

    fn running_broker(&self) -> Result<Broker> {
        self.broker().ok_or(Error::NotRunning)
    }

    /// Publish from inside the process. Needs `inline_client`.
    pub fn publish(&self, topic: &str, payload: impl Into<Bytes>) -> Result<()> {
        self.running_broker()?.publish(topic, payload)
    }

    /// Subscribe an in-process handler. Needs `inline_client`.
    pub fn subscribe<H: Handler + 'static>(&self, filter: &str, id: &str, handler: H) -> Result<()> {
        self.running_broker()?.subscribe(filter, id, handler)
    }

    pub fn unsubscribe(&self, filter: &str, id: &str) -> Result<()> {
        self.running_broker()?.unsubscribe(filter, id)
    }
}

async fn release(listeners: &[Arc<dyn Listener>], broker: &Broker) {
    join_all(listeners.iter().map(|l| l.close(broker))).await;
    broker.close();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn local_config() -> ServerConfig {
        ServerConfig {
            mqtt: Some("127.0.0.1:0".to_string()),
            http: Some("127.0.0.1:0".to_string()),
            shutdown_grace: Duration::from_millis(200),
            sys_interval: None,
            ..ServerConfig::default()
        }
    }

    #[test]
    fn test_admin_rules_always_added() {
        let server = Server::new(ServerConfig::default()).unwrap();
        let ledger = server.ledger().unwrap();
        assert!(ledger.authenticate_connection("arx7", "arbalest", "10.1.2.3"));
        assert!(ledger.authenticate_connection("YoRHa", "no2typeB", "127.0.0.1"));
        assert!(!ledger.authenticate_connection("YoRHa", "no2typeB", "10.1.2.3"));
    }

    #[test]
    fn test_disabled_auth_has_no_ledger() {
        let server = Server::new(ServerConfig {
            auth: AuthSource::Disabled,
            ..ServerConfig::default()
        })
        .unwrap();
        assert!(server.ledger().is_none());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let result = Server::new(ServerConfig {
            mqtt: Some("not an address".to_string()),
            ..ServerConfig::default()
        });
        assert!(matches!(result, Err(Error::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_lifecycle() {
        let server = Server::new(local_config()).unwrap();
        assert_eq!(server.state(), State::Stopped);
        assert!(!server.stop().await);

        server.start().await.unwrap();
        assert_eq!(server.state(), State::Running);
        assert!(server.local_addr(ListenerKind::Mqtt).is_some());
        assert!(server.local_addr(ListenerKind::HttpStatus).is_some());
        assert!(server.local_addr(ListenerKind::MqttTls).is_none());
        assert!(matches!(server.start().await, Err(Error::AlreadyRunning)));

        assert!(server.stop().await);
        assert_eq!(server.state(), State::Stopped);
        assert!(server.broker().is_none());
        assert!(server.local_addr(ListenerKind::Mqtt).is_none());

        // A stopped server starts again with a fresh broker.
        server.start().await.unwrap();
        assert!(server.stop().await);
    }

    #[tokio::test]
    async fn test_bind_failure_leaves_starting() {
        let taken = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server = Server::new(ServerConfig {
            http: Some(taken.local_addr().unwrap().to_string()),
            ..local_config()
        })
        .unwrap();

        assert!(matches!(server.start().await, Err(Error::Bind { .. })));
        assert_eq!(server.state(), State::Starting);
        // The plain MQTT listener bound before the failure is still held.
        assert!(server.local_addr(ListenerKind::Mqtt).is_some());

        assert!(server.stop().await);
        assert_eq!(server.state(), State::Stopped);
        assert!(server.local_addr(ListenerKind::Mqtt).is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_stop_while_starting_releases_listeners() {
        let server = Arc::new(Server::new(local_config()).unwrap());
        for _ in 0..200 {
            let starting = tokio::spawn({
                let server = Arc::clone(&server);
                async move { server.start().await }
            });
            while server.state() == State::Stopped && !starting.is_finished() {
                tokio::task::yield_now().await;
            }
            server.stop().await;

            let started = starting.await.unwrap();
            assert!(matches!(started, Ok(()) | Err(Error::ShuttingDown)));
            if server.state() == State::Running {
                // start finished before stop could claim it.
                assert!(server.stop().await);
            }
            assert_eq!(server.state(), State::Stopped);
            assert!(server.broker().is_none());
            assert!(server.local_addr(ListenerKind::Mqtt).is_none());
            assert!(server.local_addr(ListenerKind::HttpStatus).is_none());
            assert!(server.active.lock().listeners.is_empty());
        }
    }

    #[tokio::test]
    async fn test_stopped_start_frees_fixed_port() {
        let port = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let server = Arc::new(
            Server::new(ServerConfig {
                mqtt: Some(format!("127.0.0.1:{port}")),
                ..local_config()
            })
            .unwrap(),
        );

        let starting = tokio::spawn({
            let server = Arc::clone(&server);
            async move { server.start().await }
        });
        server.stop().await;
        starting.await.unwrap().ok();
        if server.state() == State::Running {
            assert!(server.stop().await);
        }

        // Whatever the interleaving, the port is free again.
        server.start().await.unwrap();
        assert_eq!(
            server.local_addr(ListenerKind::Mqtt).map(|a| a.port()),
            Some(port)
        );
        assert!(server.stop().await);
    }

    #[tokio::test]
    async fn test_run_returns_on_stop() {
        let server = Arc::new(Server::new(local_config()).unwrap());
        let running = tokio::spawn({
            let server = Arc::clone(&server);
            async move { server.run().await }
        });

        tokio::time::timeout(Duration::from_secs(5), async {
            while server.state() != State::Running {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        assert!(server.stop().await);
        tokio::time::timeout(Duration::from_secs(5), running)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_inline_client() {
        let server = Server::new(ServerConfig {
            inline_client: true,
            ..local_config()
        })
        .unwrap();
        assert!(matches!(server.publish("a/b", "x"), Err(Error::NotRunning)));

        server.start().await.unwrap();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        server
            .subscribe("a/+", "inline-1", move |id: &str, msg: &crate::broker::Message| {
                let _ = tx.send((id.to_string(), msg.topic.clone(), msg.payload.clone()));
            })
            .unwrap();
        server.publish("a/b", "hello").unwrap();

        let (id, topic, payload) = rx.recv().await.unwrap();
        assert_eq!(id, "inline-1");
        assert_eq!(topic, "a/b");
        assert_eq!(payload.as_ref(), b"hello");

        server.unsubscribe("a/+", "inline-1").unwrap();
        server.stop().await;
    }

    #[tokio::test]
    async fn test_inline_client_disabled() {
        let server = Server::new(local_config()).unwrap();
        server.start().await.unwrap();
        assert!(matches!(
            server.publish("a/b", "x"),
            Err(Error::InlineClientDisabled)
        ));
        server.stop().await;
    }
}
