//! HTTP status listener.

use std::future::IntoFuture;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

use super::{Listener, ListenerKind, Shutdown};
use crate::broker::Broker;
use crate::error::{Error, Result};
use crate::status::{self, Credentials};

/// Listener serving the status endpoints.
pub struct HttpListener {
    addr: SocketAddr,
    credentials: Arc<Credentials>,
    socket: Mutex<Option<TcpListener>>,
    shutdown: Shutdown,
}

impl std::fmt::Debug for HttpListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpListener")
            .field("addr", &self.addr)
            .finish()
    }
}

impl HttpListener {
    pub async fn bind(
        addr: SocketAddr,
        credentials: Arc<Credentials>,
        grace: Duration,
    ) -> Result<Self> {
        let id = ListenerKind::HttpStatus.id();
        let bind_error = |source: io::Error| Error::Bind {
            id: id.to_string(),
            addr: addr.to_string(),
            source,
        };
        let socket = TcpListener::bind(addr).await.map_err(bind_error)?;
        let addr = socket.local_addr().map_err(bind_error)?;

        Ok(Self {
            addr,
            credentials,
            socket: Mutex::new(Some(socket)),
            shutdown: Shutdown::new(id, grace),
        })
    }
}

#[async_trait]
impl Listener for HttpListener {
    fn id(&self) -> &str {
        ListenerKind::HttpStatus.id()
    }

    fn kind(&self) -> ListenerKind {
        ListenerKind::HttpStatus
    }

    fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    fn protocol(&self) -> &'static str {
        "http"
    }

    async fn serve(self: Arc<Self>, broker: Broker) {
        let Some(socket) = self.socket.lock().take() else {
            debug!(listener = self.id(), "listener closed or already serving");
            return;
        };
        info!(listener = self.id(), protocol = self.protocol(), addr = %self.addr, "listening");

        let accept = self.shutdown.accept.clone();
        let force = self.shutdown.force.clone();
        let router = status::router(broker.clone(), Arc::clone(&self.credentials));
        let server = axum::serve(socket, router)
            .with_graceful_shutdown(async move { accept.cancelled().await })
            .into_future();

        // Tracked so that close() waits for in-flight requests.
        let task = self.shutdown.tracker.spawn(async move {
            tokio::select! {
                result = server => result,
                _ = force.cancelled() => Ok(()),
            }
        });

        let result = task.await;
        self.shutdown.released.cancel();
        let failed = match result {
            Ok(Ok(())) => false,
            Ok(Err(e)) => {
                error!(listener = self.id(), error = %e, "http server failed, closing listener");
                true
            }
            Err(e) => {
                error!(listener = self.id(), error = %e, "http server task aborted");
                true
            }
        };
        if failed {
            self.close(&broker).await;
        }
    }

    async fn close(&self, broker: &Broker) -> bool {
        if !self.shutdown.begin() {
            return false;
        }
        broker.close_clients(self.id());
        // The server task owns the socket, so it is gone once drained.
        self.shutdown.drain().await;
        self.shutdown.release_socket(&self.socket).await;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::BrokerConfig;
    use crate::status::{FALLBACK_PASSWORD, FALLBACK_USERNAME};
    use reqwest::StatusCode;

    #[tokio::test]
    async fn test_serves_until_closed() {
        let broker = Broker::new(BrokerConfig::default());
        let listener = Arc::new(
            HttpListener::bind(
                "127.0.0.1:0".parse().unwrap(),
                Arc::new(Credentials::from_ledger(None)),
                Duration::from_millis(200),
            )
            .await
            .unwrap(),
        );
        let addr = listener.local_addr();
        let serving = tokio::spawn(Arc::clone(&listener).serve(broker.clone()));
        let http = reqwest::Client::new();
        let get = |path: &str| {
            http.get(format!("http://{addr}{path}"))
                .basic_auth(FALLBACK_USERNAME, Some(FALLBACK_PASSWORD))
        };

        let body = get("/info").send().await.unwrap().text().await.unwrap();
        assert!(body.contains("\"clients_connected\""));

        let missing = get("/nope").send().await.unwrap();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);

        let anonymous = http.get(format!("http://{addr}/info")).send().await.unwrap();
        assert_eq!(anonymous.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            anonymous.headers()[reqwest::header::WWW_AUTHENTICATE],
            "Basic realm=\"mqttd\""
        );

        let wrong = http
            .get(format!("http://{addr}/clients"))
            .basic_auth(FALLBACK_USERNAME, Some("wrong"))
            .send()
            .await
            .unwrap();
        assert_eq!(wrong.status(), StatusCode::UNAUTHORIZED);

        assert!(listener.close(&broker).await);
        assert!(!listener.close(&broker).await);
        tokio::time::timeout(Duration::from_secs(5), serving)
            .await
            .unwrap()
            .unwrap();
    }
}
