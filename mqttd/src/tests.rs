//! Integration tests for mqttd.
//!
//! Each test runs a full [`Server`] on `127.0.0.1:0` listeners and talks to
//! it over the network: rumqttc for plain MQTT, hand-written CONNECT frames
//! over tokio-rustls and tokio-tungstenite for TLS and websocket, and
//! reqwest for the status endpoints.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use rumqttc::mqttbytes::v4::{Connect, Packet as V4Packet};
use rumqttc::{AsyncClient, Event, EventLoop, Incoming, MqttOptions, QoS};

use crate::broker::MAX_PACKET_SIZE;
use crate::status::{FALLBACK_PASSWORD, FALLBACK_USERNAME};
use crate::{
    Access, AuthSource, Ledger, ListenerKind, Server, ServerConfig, State, TlsFiles, TlsSource,
    TlsUsage, User, WebSocketConfig,
};

const LOCAL: &str = "127.0.0.1:0";
const TIMEOUT: Duration = Duration::from_secs(5);

/// Expected CONNACK for an accepted v4 session.
const CONNACK_ACCEPTED: [u8; 4] = [0x20, 0x02, 0x00, 0x00];

fn base_config() -> ServerConfig {
    ServerConfig {
        mqtt: Some(LOCAL.to_string()),
        shutdown_grace: Duration::from_millis(200),
        sys_interval: None,
        ..ServerConfig::default()
    }
}

/// Route broker logs to the test output. Run with `RUST_LOG=mqttd=debug`.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

async fn started(config: ServerConfig) -> Server {
    init_tracing();
    let server = Server::new(config).unwrap();
    server.start().await.unwrap();
    assert_eq!(server.state(), State::Running);
    server
}

fn client(server: &Server, id: &str, username: &str, password: &str) -> (AsyncClient, EventLoop) {
    let addr = server.local_addr(ListenerKind::Mqtt).unwrap();
    let mut options = MqttOptions::new(id, addr.ip().to_string(), addr.port());
    options.set_keep_alive(Duration::from_secs(5));
    if !username.is_empty() {
        options.set_credentials(username, password);
    }
    AsyncClient::new(options, 10)
}

/// Poll until `pick` accepts an incoming packet.
async fn wait_for<T>(eventloop: &mut EventLoop, mut pick: impl FnMut(Incoming) -> Option<T>) -> T {
    tokio::time::timeout(TIMEOUT, async {
        loop {
            if let Event::Incoming(packet) = eventloop.poll().await.unwrap() {
                if let Some(value) = pick(packet) {
                    return value;
                }
            }
        }
    })
    .await
    .unwrap()
}

async fn connects(eventloop: &mut EventLoop) -> bool {
    matches!(
        tokio::time::timeout(TIMEOUT, eventloop.poll()).await.unwrap(),
        Ok(Event::Incoming(Incoming::ConnAck(_)))
    )
}

fn connect_frame(client_id: &str, username: &str, password: &str) -> BytesMut {
    let mut connect = Connect::new(client_id);
    connect.set_login(username, password);
    let mut buf = BytesMut::new();
    V4Packet::Connect(connect)
        .write(&mut buf, MAX_PACKET_SIZE)
        .unwrap();
    buf
}

fn write_cert(dir: &Path) -> (PathBuf, PathBuf, rcgen::Certificate) {
    let rcgen::CertifiedKey { cert, key_pair } =
        rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let cert_path = dir.join("cert.ec.pem");
    let key_path = dir.join("cert-key.ec.pem");
    std::fs::write(&cert_path, cert.pem()).unwrap();
    std::fs::write(&key_path, key_pair.serialize_pem()).unwrap();
    (cert_path, key_path, cert)
}

mod auth_tests {
    use super::*;

    #[tokio::test]
    async fn test_admin_connects_without_auth_file() {
        let server = started(base_config()).await;

        let (_c, mut el) = client(&server, "admin-any", "arx7", "arbalest");
        assert!(connects(&mut el).await);

        // Loopback-only admin from 127.0.0.1.
        let (_c, mut el) = client(&server, "admin-local", "YoRHa", "no2typeB");
        assert!(connects(&mut el).await);

        server.stop().await;
    }

    #[tokio::test]
    async fn test_unknown_user_rejected() {
        let server = started(base_config()).await;

        let (_c, mut el) = client(&server, "stranger", "nobody", "secret");
        assert!(!connects(&mut el).await);

        let (_c, mut el) = client(&server, "anonymous", "", "");
        assert!(!connects(&mut el).await);

        server.stop().await;
    }

    #[tokio::test]
    async fn test_read_only_acl() {
        let ledger = Ledger::new()
            .with_user(User::new("u1", "p1").with_acl("down/#", Access::ReadOnly))
            .with_user(User::new("u2", "p2").with_acl("down/#", Access::ReadWrite));
        let server = started(ServerConfig {
            auth: AuthSource::Ledger(ledger),
            ..base_config()
        })
        .await;

        let (reader, mut reader_el) = client(&server, "reader", "u1", "p1");
        assert!(connects(&mut reader_el).await);

        reader.subscribe("down/#", QoS::AtMostOnce).await.unwrap();
        let granted = wait_for(&mut reader_el, |p| match p {
            Incoming::SubAck(ack) => Some(ack.return_codes),
            _ => None,
        })
        .await;
        assert_eq!(
            granted,
            [rumqttc::mqttbytes::v4::SubscribeReasonCode::Success(QoS::AtMostOnce)]
        );

        reader.subscribe("up/x", QoS::AtMostOnce).await.unwrap();
        let refused = wait_for(&mut reader_el, |p| match p {
            Incoming::SubAck(ack) => Some(ack.return_codes),
            _ => None,
        })
        .await;
        assert_eq!(refused, [rumqttc::mqttbytes::v4::SubscribeReasonCode::Failure]);

        let (writer, mut writer_el) = client(&server, "writer", "u2", "p2");
        assert!(connects(&mut writer_el).await);
        writer
            .publish("down/x", QoS::AtMostOnce, false, "hello")
            .await
            .unwrap();
        let pump = tokio::spawn(async move { while writer_el.poll().await.is_ok() {} });

        let publish = wait_for(&mut reader_el, |p| match p {
            Incoming::Publish(publish) => Some(publish),
            _ => None,
        })
        .await;
        assert_eq!(publish.topic, "down/x");
        assert_eq!(publish.payload.as_ref(), b"hello");

        pump.abort();
        server.stop().await;
    }

    #[tokio::test]
    async fn test_malformed_auth_file_regenerated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("auth.yaml");
        std::fs::write(&path, "control: [not, a, user").unwrap();

        let server = Server::new(ServerConfig {
            auth: AuthSource::File(Some(path.clone())),
            ..base_config()
        })
        .unwrap();
        let ledger = server.ledger().unwrap();
        assert!(ledger.authenticate_connection("control", "dayone", "10.0.0.1"));
        assert!(ledger.authenticate_connection("arx7", "arbalest", "10.0.0.1"));

        let rewritten = std::fs::read_to_string(&path).unwrap();
        assert_eq!(crate::auth::parse(&rewritten).unwrap(), Ledger::sample());
    }

    #[tokio::test]
    async fn test_auth_disabled_allows_anyone() {
        let server = started(ServerConfig {
            auth: AuthSource::Disabled,
            ..base_config()
        })
        .await;

        let (c, mut el) = client(&server, "free", "whoever", "whatever");
        assert!(connects(&mut el).await);
        c.subscribe("any/#", QoS::AtMostOnce).await.unwrap();
        let granted = wait_for(&mut el, |p| match p {
            Incoming::SubAck(ack) => Some(ack.return_codes),
            _ => None,
        })
        .await;
        assert_eq!(
            granted,
            [rumqttc::mqttbytes::v4::SubscribeReasonCode::Success(QoS::AtMostOnce)]
        );

        server.stop().await;
    }
}

mod lifecycle_tests {
    use super::*;

    #[tokio::test]
    async fn test_concurrent_stop_closes_once() {
        let server = started(ServerConfig {
            http: Some(LOCAL.to_string()),
            ..base_config()
        })
        .await;
        let mqtt = server.local_addr(ListenerKind::Mqtt).unwrap();

        let (a, b) = tokio::join!(server.stop(), server.stop());
        assert!(a ^ b);
        assert!(!server.stop().await);
        assert_eq!(server.state(), State::Stopped);
        assert!(tokio::net::TcpStream::connect(mqtt).await.is_err());
    }

    #[tokio::test]
    async fn test_missing_tls_cert_keeps_mqtt() {
        let dir = tempfile::tempdir().unwrap();
        let server = started(ServerConfig {
            mqtt_tls: Some(LOCAL.to_string()),
            tls: TlsSource::Files(TlsFiles {
                cert: dir.path().join("missing.pem"),
                key: dir.path().join("missing-key.pem"),
                ca: None,
            }),
            ..base_config()
        })
        .await;

        assert!(server.local_addr(ListenerKind::MqttTls).is_none());
        assert!(server.local_addr(ListenerKind::Mqtt).is_some());

        let (_c, mut el) = client(&server, "plain", "arx7", "arbalest");
        assert!(connects(&mut el).await);

        server.stop().await;
    }

    #[tokio::test]
    async fn test_stop_disconnects_clients() {
        let server = started(base_config()).await;
        let (_c, mut el) = client(&server, "victim", "arx7", "arbalest");
        assert!(connects(&mut el).await);

        assert!(server.stop().await);
        let ended = tokio::time::timeout(TIMEOUT, async {
            loop {
                if el.poll().await.is_err() {
                    return;
                }
            }
        })
        .await;
        assert!(ended.is_ok());
    }
}

mod transport_tests {
    use super::*;
    use futures::{SinkExt, StreamExt};
    use rustls::pki_types::ServerName;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio_tungstenite::tungstenite::Message as WsMessage;
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;
    use tokio_tungstenite::tungstenite::http::HeaderValue;

    fn tls_config(cert_path: PathBuf, key_path: PathBuf, ca: Option<PathBuf>) -> ServerConfig {
        ServerConfig {
            mqtt_tls: Some(LOCAL.to_string()),
            tls: TlsSource::Files(TlsFiles {
                cert: cert_path,
                key: key_path,
                ca,
            }),
            ..base_config()
        }
    }

    /// Connect over TLS without a client certificate, send CONNECT and read
    /// the 4-byte reply.
    async fn tls_connect(
        addr: std::net::SocketAddr,
        cert: &rcgen::Certificate,
        client_id: &str,
    ) -> std::io::Result<[u8; 4]> {
        let mut roots = rustls::RootCertStore::empty();
        roots.add(cert.der().clone()).unwrap();
        let config = rustls::ClientConfig::builder_with_provider(crate::tls::provider())
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_root_certificates(roots)
            .with_no_client_auth();
        let connector = tokio_rustls::TlsConnector::from(Arc::new(config));

        let tcp = tokio::net::TcpStream::connect(addr).await?;
        let mut stream = connector
            .connect(ServerName::try_from("localhost").unwrap(), tcp)
            .await?;
        stream
            .write_all(&connect_frame(client_id, "arx7", "arbalest"))
            .await?;

        let mut connack = [0u8; 4];
        tokio::time::timeout(TIMEOUT, stream.read_exact(&mut connack))
            .await
            .unwrap()?;
        Ok(connack)
    }

    #[tokio::test]
    async fn test_tls_listener_accepts_connect() {
        let dir = tempfile::tempdir().unwrap();
        let (cert_path, key_path, cert) = write_cert(dir.path());
        let server = started(tls_config(cert_path, key_path, None)).await;
        let addr = server.local_addr(ListenerKind::MqttTls).unwrap();

        let connack = tls_connect(addr, &cert, "tls-client").await.unwrap();
        assert_eq!(connack, CONNACK_ACCEPTED);

        let clients = server.broker().unwrap().clients();
        assert_eq!(clients.len(), 1);
        assert_eq!(clients[0].listener, "mqtt+tls");

        server.stop().await;
    }

    #[tokio::test]
    async fn test_client_ca_requires_client_certificate() {
        let dir = tempfile::tempdir().unwrap();
        let (cert_path, key_path, cert) = write_cert(dir.path());
        let ca = Some(cert_path.clone());
        let server = started(tls_config(cert_path, key_path, ca)).await;
        let addr = server.local_addr(ListenerKind::MqttTls).unwrap();

        // TLS 1.3 clients finish their side first, so the refusal can
        // surface on the handshake or on the first read.
        let result = tls_connect(addr, &cert, "no-cert").await;
        assert!(result.is_err(), "client without certificate got {result:?}");
        assert!(server.broker().unwrap().clients().is_empty());

        server.stop().await;
    }

    #[tokio::test]
    async fn test_unusable_client_ca_accepts_anyone() {
        let dir = tempfile::tempdir().unwrap();
        let (cert_path, key_path, cert) = write_cert(dir.path());
        let garbage = dir.path().join("ca.pem");
        std::fs::write(&garbage, "not a certificate").unwrap();

        for ca in [garbage, dir.path().join("absent.pem")] {
            let server =
                started(tls_config(cert_path.clone(), key_path.clone(), Some(ca))).await;
            let addr = server.local_addr(ListenerKind::MqttTls).unwrap();

            let connack = tls_connect(addr, &cert, "no-cert").await.unwrap();
            assert_eq!(connack, CONNACK_ACCEPTED);

            server.stop().await;
        }
    }

    #[tokio::test]
    async fn test_websocket_listener() {
        let server = started(ServerConfig {
            websocket: Some(WebSocketConfig {
                addr: LOCAL.to_string(),
                tls: TlsUsage::Never,
            }),
            ..base_config()
        })
        .await;
        let addr = server.local_addr(ListenerKind::WebSocket).unwrap();

        let mut request = format!("ws://{addr}/mqtt").into_client_request().unwrap();
        request
            .headers_mut()
            .insert("Sec-WebSocket-Protocol", HeaderValue::from_static("mqtt"));
        let tcp = tokio::net::TcpStream::connect(addr).await.unwrap();
        let (mut ws, _) = tokio_tungstenite::client_async(request, tcp).await.unwrap();

        let frame = connect_frame("ws-client", "arx7", "arbalest").freeze();
        ws.send(WsMessage::Binary(frame)).await.unwrap();

        match tokio::time::timeout(TIMEOUT, ws.next()).await.unwrap() {
            Some(Ok(WsMessage::Binary(data))) => assert_eq!(data.as_ref(), CONNACK_ACCEPTED),
            other => panic!("expected binary CONNACK, got {other:?}"),
        }

        let clients = server.broker().unwrap().clients();
        assert_eq!(clients[0].listener, "ws");

        server.stop().await;
    }

    #[tokio::test]
    async fn test_websocket_requires_tls_skipped() {
        let server = started(ServerConfig {
            websocket: Some(WebSocketConfig {
                addr: LOCAL.to_string(),
                tls: TlsUsage::Required,
            }),
            ..base_config()
        })
        .await;
        assert!(server.local_addr(ListenerKind::WebSocket).is_none());
        server.stop().await;
    }
}

mod status_tests {
    use super::*;

    async fn get(
        http: std::net::SocketAddr,
        path: &str,
        user: &str,
        pass: &str,
    ) -> reqwest::Response {
        reqwest::Client::new()
            .get(format!("http://{http}{path}"))
            .basic_auth(user, Some(pass))
            .send()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_status_endpoints() {
        let server = started(ServerConfig {
            http: Some(LOCAL.to_string()),
            ..base_config()
        })
        .await;
        let http = server.local_addr(ListenerKind::HttpStatus).unwrap();

        let (_c, mut el) = client(&server, "status-client", "arx7", "arbalest");
        assert!(connects(&mut el).await);

        let info: serde_json::Value = get(http, "/info", "arx7", "arbalest")
            .await
            .json()
            .await
            .unwrap();
        assert_eq!(info["clients_connected"], 1);

        let page = get(http, "/clients", "arx7", "arbalest")
            .await
            .text()
            .await
            .unwrap();
        assert!(page.contains("<td>status-client</td>"));
        assert!(page.contains("<td>mqtt</td>"));

        let raw = get(http, "/raw", "arx7", "arbalest")
            .await
            .text()
            .await
            .unwrap();
        assert!(raw.contains("\"id\": \"status-client\""));
        assert!(raw.ends_with('\n'));

        server.stop().await;
    }

    #[tokio::test]
    async fn test_status_requires_ledger_account() {
        let ledger = Ledger::new().with_user(User::new("ops", "hunter2"));
        let server = started(ServerConfig {
            http: Some(LOCAL.to_string()),
            auth: AuthSource::Ledger(ledger),
            ..base_config()
        })
        .await;
        let http = server.local_addr(ListenerKind::HttpStatus).unwrap();

        let anonymous = reqwest::get(format!("http://{http}/clients")).await.unwrap();
        assert_eq!(anonymous.status(), reqwest::StatusCode::UNAUTHORIZED);

        for (user, pass) in [("ops", "wrong"), (FALLBACK_USERNAME, FALLBACK_PASSWORD)] {
            let denied = get(http, "/info", user, pass).await;
            assert_eq!(denied.status(), reqwest::StatusCode::UNAUTHORIZED);
        }
        for (user, pass) in [("ops", "hunter2"), ("arx7", "arbalest")] {
            let allowed = get(http, "/info", user, pass).await;
            assert_eq!(allowed.status(), reqwest::StatusCode::OK);
        }

        server.stop().await;
    }

    #[tokio::test]
    async fn test_status_fallback_account_without_auth() {
        let server = started(ServerConfig {
            http: Some(LOCAL.to_string()),
            auth: AuthSource::Disabled,
            ..base_config()
        })
        .await;
        let http = server.local_addr(ListenerKind::HttpStatus).unwrap();

        let allowed = get(http, "/clients", FALLBACK_USERNAME, FALLBACK_PASSWORD).await;
        assert_eq!(allowed.status(), reqwest::StatusCode::OK);
        let denied = get(http, "/clients", "arx7", "arbalest").await;
        assert_eq!(denied.status(), reqwest::StatusCode::UNAUTHORIZED);

        server.stop().await;
    }

    #[tokio::test]
    async fn test_sys_info_published() {
        let server = started(ServerConfig {
            inline_client: true,
            sys_interval: Some(Duration::from_millis(50)),
            ..base_config()
        })
        .await;

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        server
            .subscribe("$SYS/#", "sys", move |_: &str, msg: &crate::Message| {
                let _ = tx.send(msg.payload.clone());
            })
            .unwrap();

        let payload = tokio::time::timeout(TIMEOUT, rx.recv()).await.unwrap().unwrap();
        let info: serde_json::Value = serde_json::from_slice(&payload).unwrap();
        assert!(info["uptime"].is_number());

        server.stop().await;
    }
}
