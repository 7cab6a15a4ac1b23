//! Multi-listener MQTT broker with a credential and topic ACL ledger.
//!
//! One QoS 0 broker core (MQTT 3.1.1 and 5.0) is served through up to four
//! independently optional listeners:
//!
//! - plain MQTT over TCP
//! - MQTT over TLS, optionally requiring client certificates
//! - MQTT over websocket, with TLS when available
//! - HTTP status endpoints (`/info`, `/clients`, `/raw`)
//!
//! Connections are admitted by the [`Ledger`]: ordered connection rules,
//! per-user passwords and topic ACLs loaded from a YAML auth file, plus two
//! administrative accounts that are always present.
//!
//! ## Example
//!
//! ```no_run
//! use mqttd::{AuthSource, Server, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() -> mqttd::Result<()> {
//!     let server = Server::new(ServerConfig {
//!         mqtt: Some(":1883".to_string()),
//!         http: Some(":1880".to_string()),
//!         auth: AuthSource::File(Some("auth.yaml".into())),
//!         ..ServerConfig::default()
//!     })?;
//!     server.run().await
//! }
//! ```

pub mod auth;
pub mod broker;
pub mod config;
mod error;
pub mod listener;
mod server;
pub mod status;
pub mod tls;
pub mod topic;

pub use auth::{Access, AclRule, AuthRule, Ledger, Operation, User};
pub use broker::{Authenticator, Broker, BrokerConfig, ClientInfo, Message, SystemInfo};
pub use config::{
    AuthSource, ConfigFile, ServerConfig, TlsFiles, TlsSource, TlsUsage, WebSocketConfig,
};
pub use error::{Error, Result};
pub use listener::ListenerKind;
pub use server::{Server, State};

#[cfg(test)]
mod tests;
