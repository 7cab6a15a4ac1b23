//! One client session: CONNECT, authentication, then the packet loop.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::protocol::{self, Inbound, PacketReader, PacketWriter};
use super::types::{ClientInfo, ConnInfo, Message};
use super::{CLIENT_QUEUE, Shared};
use crate::error::{Error, Result};
use crate::topic;

/// Time allowed between accepting a stream and receiving CONNECT.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

pub(super) async fn run<S>(
    shared: Arc<Shared>,
    stream: S,
    listener: &str,
    remote: SocketAddr,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut reader, mut writer) = protocol::split(
        stream,
        shared.config.buffer_size,
        shared.config.max_topic_alias,
        Arc::clone(&shared.stats),
    );

    let connect = tokio::time::timeout(CONNECT_TIMEOUT, reader.read_connect())
        .await
        .map_err(|_| Error::Timeout(format!("no CONNECT from {remote}")))??;
    let version = reader.version();
    writer.set_version(version);

    let conn = ConnInfo {
        client_id: shared.client_id_for(&connect.client_id),
        username: connect.username.clone(),
        remote,
        listener: listener.to_string(),
    };

    if !shared.authenticator.authenticate(&conn, &connect.password) {
        warn!(client = %conn.client_id, username = %conn.username, %remote, listener, "authentication failed");
        writer.connack(false).await?;
        return Err(Error::AuthenticationFailed);
    }
    writer.connack(true).await?;

    let (tx, rx) = mpsc::channel::<Message>(CLIENT_QUEUE);
    let tx = Arc::new(tx);
    let cancel = shared.register(
        ClientInfo {
            id: conn.client_id.clone(),
            remote: remote.to_string(),
            listener: listener.to_string(),
            protocol_version: version.level(),
            username: conn.username.clone(),
            clean_session: connect.clean_session,
            keep_alive: connect.keep_alive,
            connected_at: Utc::now(),
            subscriptions: Vec::new(),
        },
        Arc::clone(&tx),
    );

    info!(client = %conn.client_id, %remote, listener, "client connected ({version})");

    let mut session = Session {
        shared: &shared,
        conn: &conn,
        tx: &tx,
        keep_alive: connect.keep_alive,
    };
    let result = session.run(reader, writer, rx, cancel).await;

    shared.unregister(&conn.client_id, &tx);
    match &result {
        Ok(()) => info!(client = %conn.client_id, "client disconnected"),
        Err(e) => info!(client = %conn.client_id, error = %e, "client dropped"),
    }
    result
}

struct Session<'a> {
    shared: &'a Shared,
    conn: &'a ConnInfo,
    tx: &'a Arc<mpsc::Sender<Message>>,
    keep_alive: u16,
}

impl Session<'_> {
    async fn run<S>(
        &mut self,
        mut reader: PacketReader<S>,
        mut writer: PacketWriter<S>,
        mut rx: mpsc::Receiver<Message>,
        cancel: CancellationToken,
    ) -> Result<()>
    where
        S: AsyncRead + AsyncWrite,
    {
        // Disconnect if no packet arrives within 1.5 × keep_alive (MQTT 3.1.1 §3.1.2.10).
        // A keep_alive of 0 disables the timeout.
        let grace = (self.keep_alive > 0)
            .then(|| Duration::from_millis(u64::from(self.keep_alive) * 1500));
        let mut deadline = grace.map(|g| Instant::now() + g);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(client = %self.conn.client_id, "session closed by broker");
                    return Ok(());
                }

                msg = rx.recv() => match msg {
                    Some(msg) => writer.publish(&msg).await?,
                    None => return Ok(()),
                },

                packet = reader.read() => {
                    deadline = grace.map(|g| Instant::now() + g);
                    if !self.handle(packet?, &mut writer).await? {
                        return Ok(());
                    }
                }

                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    warn!(client = %self.conn.client_id, keep_alive = self.keep_alive, "keep-alive timeout");
                    return Err(Error::Timeout("keep-alive".to_string()));
                }
            }
        }
    }

    /// Handle one packet. Returns false when the client disconnected.
    async fn handle<S: AsyncWrite>(
        &mut self,
        packet: Inbound,
        writer: &mut PacketWriter<S>,
    ) -> Result<bool> {
        match packet {
            Inbound::Publish {
                topic,
                payload,
                retain,
                ack,
            } => {
                self.publish(Message {
                    topic,
                    payload,
                    retain,
                });
                if let Some(pkid) = ack {
                    writer.puback(pkid).await?;
                }
            }
            Inbound::Subscribe { pkid, filters } => {
                let granted: Vec<bool> = filters.iter().map(|f| self.subscribe(f)).collect();
                writer.suback(pkid, &granted).await?;
            }
            Inbound::Unsubscribe { pkid, filters } => {
                for filter in &filters {
                    self.shared
                        .unsubscribe_client(&self.conn.client_id, filter, self.tx);
                }
                writer.unsuback(pkid, filters.len()).await?;
            }
            Inbound::PingReq => writer.pingresp().await?,
            Inbound::Disconnect => return Ok(false),
            Inbound::Ignored => {}
        }
        Ok(true)
    }

    fn publish(&self, msg: Message) {
        let client = &self.conn.client_id;
        if msg.topic.contains(['+', '#']) {
            warn!(client = %client, topic = %msg.topic, "publish to wildcard topic dropped");
            return;
        }
        if !self.shared.authenticator.acl(self.conn, &msg.topic, true) {
            warn!(client = %client, topic = %msg.topic, "ACL denied publish");
            return;
        }
        trace!(client = %client, topic = %msg.topic, "publish");
        self.shared.stats.message_received();
        self.shared.route(&msg);
    }

    fn subscribe(&self, filter: &str) -> bool {
        let client = &self.conn.client_id;
        if let Err(e) = topic::validate_filter(filter) {
            warn!(client = %client, error = %e, "subscribe rejected");
            return false;
        }
        if !self.shared.authenticator.acl(self.conn, filter, false) {
            warn!(client = %client, filter, "ACL denied subscribe");
            return false;
        }
        self.shared.subscribe_client(client, filter, self.tx);
        debug!(client = %client, filter, "subscribed");
        true
    }
}
