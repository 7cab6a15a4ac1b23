//! Packet framing over any async byte stream.
//!
//! Encoding and decoding reuse the `mqttbytes` codecs shipped with rumqttc,
//! for both MQTT 3.1.1 (v4) and MQTT 5.0 (v5). The version is detected from
//! the CONNECT packet and fixed for the rest of the connection.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tracing::{trace, warn};

use super::Stats;
use super::types::{Message, ProtocolVersion};
use crate::error::{Error, Result};

/// Maximum packet size (1MB default).
pub const MAX_PACKET_SIZE: usize = 1024 * 1024;

mod v4 {
    pub use rumqttc::mqttbytes::QoS;
    pub use rumqttc::mqttbytes::v4::*;
}

mod v5 {
    pub use rumqttc::v5::mqttbytes::QoS;
    pub use rumqttc::v5::mqttbytes::v5::{
        ConnAck, ConnectReturnCode, Packet, PingResp, PubAck, PubAckReason, Publish, SubAck,
        SubscribeReasonCode, UnsubAck, UnsubAckReason,
    };
}

/// Fields of a CONNECT packet the broker acts on.
#[derive(Debug, Clone)]
pub(crate) struct Connect {
    pub client_id: String,
    pub username: String,
    pub password: Vec<u8>,
    pub keep_alive: u16,
    pub clean_session: bool,
}

/// Packets a connected client may send.
#[derive(Debug)]
pub(crate) enum Inbound {
    Publish {
        topic: String,
        payload: Bytes,
        retain: bool,
        /// Set for QoS 1 publishes, which are acknowledged.
        ack: Option<u16>,
    },
    Subscribe { pkid: u16, filters: Vec<String> },
    Unsubscribe { pkid: u16, filters: Vec<String> },
    PingReq,
    Disconnect,
    /// Packet that needs no reply, or a publish dropped during decoding.
    Ignored,
}

/// Read side of a connection.
pub(crate) struct PacketReader<S> {
    inner: ReadHalf<S>,
    buf: BytesMut,
    version: ProtocolVersion,
    max_packet_size: usize,
    max_topic_alias: u16,
    topic_aliases: HashMap<u16, String>,
    stats: Arc<Stats>,
}

/// Write side of a connection.
pub(crate) struct PacketWriter<S> {
    inner: WriteHalf<S>,
    version: ProtocolVersion,
    stats: Arc<Stats>,
}

/// Split a stream into packet reader and writer halves.
pub(crate) fn split<S>(
    stream: S,
    buffer_size: usize,
    max_topic_alias: u16,
    stats: Arc<Stats>,
) -> (PacketReader<S>, PacketWriter<S>)
where
    S: AsyncRead + AsyncWrite,
{
    let (reader, writer) = tokio::io::split(stream);
    (
        PacketReader {
            inner: reader,
            buf: BytesMut::with_capacity(buffer_size),
            version: ProtocolVersion::V4,
            max_packet_size: MAX_PACKET_SIZE,
            max_topic_alias,
            topic_aliases: HashMap::new(),
            stats: Arc::clone(&stats),
        },
        PacketWriter {
            inner: writer,
            version: ProtocolVersion::V4,
            stats,
        },
    )
}

/// Detect the protocol level of a CONNECT packet.
///
/// Returns `Ok(None)` while more bytes are needed.
///
/// CONNECT layout: fixed header (0x10), remaining length (1-4 bytes),
/// protocol name length (2 bytes), protocol name "MQTT", protocol level.
pub(crate) fn detect_version(buf: &[u8]) -> Result<Option<ProtocolVersion>> {
    let Some(&first) = buf.first() else {
        return Ok(None);
    };
    if first != 0x10 {
        return Err(Error::Protocol("expected CONNECT packet".to_string()));
    }

    let mut header_len = 1usize;
    let mut complete = false;
    for &byte in buf.iter().skip(1).take(4) {
        header_len += 1;
        if byte & 0x80 == 0 {
            complete = true;
            break;
        }
    }
    if !complete {
        if buf.len() > 5 {
            return Err(Error::Protocol("malformed remaining length".to_string()));
        }
        return Ok(None);
    }

    let level_offset = header_len + 2 + 4;
    match buf.get(level_offset) {
        None => Ok(None),
        Some(4) => Ok(Some(ProtocolVersion::V4)),
        Some(5) => Ok(Some(ProtocolVersion::V5)),
        Some(level) => Err(Error::Protocol(format!(
            "unsupported protocol level: {level}"
        ))),
    }
}

impl<S: AsyncRead> PacketReader<S> {
    pub fn version(&self) -> ProtocolVersion {
        self.version
    }

    async fn fill(&mut self) -> Result<()> {
        let mut tmp = [0u8; 4096];
        let n = self.inner.read(&mut tmp).await?;
        if n == 0 {
            return Err(Error::ConnectionClosed);
        }
        self.stats.bytes_received(n);
        self.buf.extend_from_slice(&tmp[..n]);
        Ok(())
    }

    /// Read the CONNECT packet, fixing the protocol version.
    pub async fn read_connect(&mut self) -> Result<Connect> {
        self.version = loop {
            if let Some(version) = detect_version(&self.buf)? {
                break version;
            }
            self.fill().await?;
        };

        let connect = match self.version {
            ProtocolVersion::V4 => match self.read_v4().await? {
                v4::Packet::Connect(connect) => {
                    let (username, password) = connect
                        .login
                        .map(|l| (l.username, l.password.into_bytes()))
                        .unwrap_or_default();
                    Connect {
                        client_id: connect.client_id,
                        username,
                        password,
                        keep_alive: connect.keep_alive,
                        clean_session: connect.clean_session,
                    }
                }
                other => return Err(unexpected_connect(&other)),
            },
            ProtocolVersion::V5 => match self.read_v5().await? {
                v5::Packet::Connect(connect, _, login) => {
                    let (username, password) = login
                        .map(|l| (l.username, l.password.into_bytes()))
                        .unwrap_or_default();
                    Connect {
                        client_id: connect.client_id,
                        username,
                        password,
                        keep_alive: connect.keep_alive,
                        clean_session: connect.clean_start,
                    }
                }
                other => return Err(unexpected_connect(&other)),
            },
        };
        Ok(connect)
    }

    /// Read the next packet after CONNECT.
    pub async fn read(&mut self) -> Result<Inbound> {
        let inbound = match self.version {
            ProtocolVersion::V4 => match self.read_v4().await? {
                v4::Packet::Publish(publish) => Inbound::Publish {
                    ack: ack_for(publish.qos == v4::QoS::AtLeastOnce, publish.pkid),
                    topic: publish.topic,
                    payload: publish.payload,
                    retain: publish.retain,
                },
                v4::Packet::Subscribe(subscribe) => Inbound::Subscribe {
                    pkid: subscribe.pkid,
                    filters: subscribe.filters.into_iter().map(|f| f.path).collect(),
                },
                v4::Packet::Unsubscribe(unsubscribe) => Inbound::Unsubscribe {
                    pkid: unsubscribe.pkid,
                    filters: unsubscribe.topics,
                },
                v4::Packet::PingReq => Inbound::PingReq,
                v4::Packet::Disconnect => Inbound::Disconnect,
                v4::Packet::Connect(_) => {
                    return Err(Error::Protocol("second CONNECT packet".to_string()));
                }
                other => {
                    trace!("ignoring packet: {:?}", other);
                    Inbound::Ignored
                }
            },
            ProtocolVersion::V5 => match self.read_v5().await? {
                v5::Packet::Publish(publish) => self.resolve_v5_publish(publish),
                v5::Packet::Subscribe(subscribe) => Inbound::Subscribe {
                    pkid: subscribe.pkid,
                    filters: subscribe.filters.into_iter().map(|f| f.path).collect(),
                },
                v5::Packet::Unsubscribe(unsubscribe) => Inbound::Unsubscribe {
                    pkid: unsubscribe.pkid,
                    filters: unsubscribe.filters,
                },
                v5::Packet::PingReq(_) => Inbound::PingReq,
                v5::Packet::Disconnect(_) => Inbound::Disconnect,
                v5::Packet::Connect(..) => {
                    return Err(Error::Protocol("second CONNECT packet".to_string()));
                }
                other => {
                    trace!("ignoring packet: {:?}", other);
                    Inbound::Ignored
                }
            },
        };
        Ok(inbound)
    }

    async fn read_v4(&mut self) -> Result<v4::Packet> {
        loop {
            if !self.buf.is_empty() {
                match v4::Packet::read(&mut self.buf, self.max_packet_size) {
                    Ok(packet) => {
                        self.stats.packet_received();
                        return Ok(packet);
                    }
                    Err(rumqttc::mqttbytes::Error::InsufficientBytes(_)) => {}
                    Err(e) => return Err(e.into()),
                }
            }
            self.fill().await?;
        }
    }

    async fn read_v5(&mut self) -> Result<v5::Packet> {
        let max_size = Some(self.max_packet_size as u32);
        loop {
            if !self.buf.is_empty() {
                match v5::Packet::read(&mut self.buf, max_size) {
                    Ok(packet) => {
                        self.stats.packet_received();
                        return Ok(packet);
                    }
                    Err(rumqttc::v5::mqttbytes::Error::InsufficientBytes(_)) => {}
                    Err(e) => return Err(Error::Protocol(e.to_string())),
                }
            }
            self.fill().await?;
        }
    }

    /// Resolve the topic of a v5 PUBLISH, applying topic aliases.
    ///
    /// A topic together with an alias updates the mapping; an empty topic is
    /// looked up by alias. Aliases above the configured maximum are rejected.
    fn resolve_v5_publish(&mut self, publish: v5::Publish) -> Inbound {
        let topic = String::from_utf8_lossy(&publish.topic).into_owned();
        let alias = publish.properties.as_ref().and_then(|p| p.topic_alias);

        let topic = match alias {
            Some(alias) if alias == 0 || alias > self.max_topic_alias => {
                warn!(alias, max = self.max_topic_alias, "topic alias out of range, dropping publish");
                return Inbound::Ignored;
            }
            Some(alias) if topic.is_empty() => match self.topic_aliases.get(&alias) {
                Some(resolved) => resolved.clone(),
                None => {
                    warn!(alias, "unknown topic alias, dropping publish");
                    return Inbound::Ignored;
                }
            },
            Some(alias) => {
                self.topic_aliases.insert(alias, topic.clone());
                topic
            }
            None if topic.is_empty() => {
                warn!("publish with empty topic and no alias, dropping");
                return Inbound::Ignored;
            }
            None => topic,
        };

        Inbound::Publish {
            topic,
            payload: publish.payload,
            retain: publish.retain,
            ack: ack_for(publish.qos == v5::QoS::AtLeastOnce, publish.pkid),
        }
    }
}

fn ack_for(at_least_once: bool, pkid: u16) -> Option<u16> {
    at_least_once.then_some(pkid)
}

fn unexpected_connect(got: &impl std::fmt::Debug) -> Error {
    Error::UnexpectedPacket {
        expected: "Connect".to_string(),
        got: format!("{got:?}"),
    }
}

impl<S: AsyncWrite> PacketWriter<S> {
    pub fn set_version(&mut self, version: ProtocolVersion) {
        self.version = version;
    }

    async fn write_v4(&mut self, packet: v4::Packet) -> Result<()> {
        let mut buf = BytesMut::with_capacity(packet.size());
        packet.write(&mut buf, MAX_PACKET_SIZE)?;
        self.flush(&buf).await
    }

    async fn write_v5(&mut self, packet: v5::Packet) -> Result<()> {
        let mut buf = BytesMut::with_capacity(packet.size());
        packet
            .write(&mut buf, Some(MAX_PACKET_SIZE as u32))
            .map_err(|e| Error::Protocol(e.to_string()))?;
        self.flush(&buf).await
    }

    async fn flush(&mut self, buf: &[u8]) -> Result<()> {
        self.inner.write_all(buf).await?;
        self.inner.flush().await?;
        self.stats.bytes_sent(buf.len());
        self.stats.packet_sent();
        Ok(())
    }

    /// Answer CONNECT, accepting or refusing the connection.
    pub async fn connack(&mut self, accepted: bool) -> Result<()> {
        match self.version {
            ProtocolVersion::V4 => {
                let code = if accepted {
                    v4::ConnectReturnCode::Success
                } else {
                    v4::ConnectReturnCode::NotAuthorized
                };
                self.write_v4(v4::Packet::ConnAck(v4::ConnAck::new(code, false)))
                    .await
            }
            ProtocolVersion::V5 => {
                let code = if accepted {
                    v5::ConnectReturnCode::Success
                } else {
                    v5::ConnectReturnCode::NotAuthorized
                };
                self.write_v5(v5::Packet::ConnAck(v5::ConnAck {
                    session_present: false,
                    code,
                    properties: None,
                }))
                .await
            }
        }
    }

    /// Deliver a message at QoS 0.
    pub async fn publish(&mut self, msg: &Message) -> Result<()> {
        match self.version {
            ProtocolVersion::V4 => {
                let mut publish =
                    v4::Publish::new(&msg.topic, v4::QoS::AtMostOnce, msg.payload.to_vec());
                publish.retain = msg.retain;
                self.write_v4(v4::Packet::Publish(publish)).await?;
            }
            ProtocolVersion::V5 => {
                self.write_v5(v5::Packet::Publish(v5::Publish {
                    dup: false,
                    qos: v5::QoS::AtMostOnce,
                    retain: msg.retain,
                    topic: Bytes::copy_from_slice(msg.topic.as_bytes()),
                    pkid: 0,
                    payload: msg.payload.clone(),
                    properties: None,
                }))
                .await?;
            }
        }
        self.stats.message_sent();
        Ok(())
    }

    pub async fn puback(&mut self, pkid: u16) -> Result<()> {
        match self.version {
            ProtocolVersion::V4 => self.write_v4(v4::Packet::PubAck(v4::PubAck::new(pkid))).await,
            ProtocolVersion::V5 => {
                self.write_v5(v5::Packet::PubAck(v5::PubAck {
                    pkid,
                    reason: v5::PubAckReason::Success,
                    properties: None,
                }))
                .await
            }
        }
    }

    /// Acknowledge a SUBSCRIBE; `granted[i]` tells whether filter `i` was accepted.
    pub async fn suback(&mut self, pkid: u16, granted: &[bool]) -> Result<()> {
        match self.version {
            ProtocolVersion::V4 => {
                let codes = granted
                    .iter()
                    .map(|&ok| {
                        if ok {
                            v4::SubscribeReasonCode::Success(v4::QoS::AtMostOnce)
                        } else {
                            v4::SubscribeReasonCode::Failure
                        }
                    })
                    .collect();
                self.write_v4(v4::Packet::SubAck(v4::SubAck::new(pkid, codes)))
                    .await
            }
            ProtocolVersion::V5 => {
                let return_codes = granted
                    .iter()
                    .map(|&ok| {
                        if ok {
                            v5::SubscribeReasonCode::Success(v5::QoS::AtMostOnce)
                        } else {
                            v5::SubscribeReasonCode::NotAuthorized
                        }
                    })
                    .collect();
                self.write_v5(v5::Packet::SubAck(v5::SubAck {
                    pkid,
                    return_codes,
                    properties: None,
                }))
                .await
            }
        }
    }

    pub async fn unsuback(&mut self, pkid: u16, count: usize) -> Result<()> {
        match self.version {
            ProtocolVersion::V4 => {
                self.write_v4(v4::Packet::UnsubAck(v4::UnsubAck::new(pkid)))
                    .await
            }
            ProtocolVersion::V5 => {
                self.write_v5(v5::Packet::UnsubAck(v5::UnsubAck {
                    pkid,
                    reasons: vec![v5::UnsubAckReason::Success; count],
                    properties: None,
                }))
                .await
            }
        }
    }

    pub async fn pingresp(&mut self) -> Result<()> {
        match self.version {
            ProtocolVersion::V4 => self.write_v4(v4::Packet::PingResp).await,
            ProtocolVersion::V5 => {
                self.write_v5(v5::Packet::PingResp(v5::PingResp)).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connect_v4() -> BytesMut {
        let mut connect = v4::Connect::new("client-1");
        connect.set_login("user", "pass");
        let mut buf = BytesMut::new();
        v4::Packet::Connect(connect).write(&mut buf, MAX_PACKET_SIZE).unwrap();
        buf
    }

    #[test]
    fn test_detect_version_v4() {
        let buf = connect_v4();
        assert_eq!(detect_version(&buf).unwrap(), Some(ProtocolVersion::V4));
    }

    #[test]
    fn test_detect_version_needs_more_bytes() {
        let buf = connect_v4();
        assert_eq!(detect_version(&buf[..0]).unwrap(), None);
        assert_eq!(detect_version(&buf[..3]).unwrap(), None);
    }

    #[test]
    fn test_detect_version_rejects_non_connect() {
        assert!(detect_version(&[0x30, 0x00]).is_err());
        assert!(detect_version(&[0x10, 0x80, 0x80, 0x80, 0x80, 0x01]).is_err());
        let mut buf = connect_v4().to_vec();
        buf[8] = 3;
        assert!(detect_version(&buf).is_err());
    }

    #[tokio::test]
    async fn test_read_connect_and_publish() {
        let (client, server) = tokio::io::duplex(1024);
        let stats = Arc::new(Stats::default());
        let (mut reader, _writer) = split(server, 4096, 10, stats);

        let mut bytes = connect_v4();
        v4::Packet::Publish(v4::Publish::new("a/b", v4::QoS::AtMostOnce, b"hi".to_vec()))
            .write(&mut bytes, MAX_PACKET_SIZE)
            .unwrap();
        let (_client_read, mut client_write) = tokio::io::split(client);
        client_write.write_all(&bytes).await.unwrap();

        let connect = reader.read_connect().await.unwrap();
        assert_eq!(connect.client_id, "client-1");
        assert_eq!(connect.username, "user");
        assert_eq!(connect.password, b"pass");
        assert_eq!(reader.version(), ProtocolVersion::V4);

        match reader.read().await.unwrap() {
            Inbound::Publish { topic, payload, ack, .. } => {
                assert_eq!(topic, "a/b");
                assert_eq!(payload.as_ref(), b"hi");
                assert_eq!(ack, None);
            }
            other => panic!("expected publish, got {other:?}"),
        }
    }

    #[test]
    fn test_v5_topic_alias() {
        let (_client, server) = tokio::io::duplex(64);
        let (mut reader, _writer) = split(server, 64, 10, Arc::new(Stats::default()));
        reader.version = ProtocolVersion::V5;

        let publish = |topic: &str, alias: Option<u16>| {
            let properties = alias.map(|alias| rumqttc::v5::mqttbytes::v5::PublishProperties {
                topic_alias: Some(alias),
                ..Default::default()
            });
            v5::Publish {
                dup: false,
                qos: v5::QoS::AtMostOnce,
                retain: false,
                topic: Bytes::copy_from_slice(topic.as_bytes()),
                pkid: 0,
                payload: Bytes::from_static(b"x"),
                properties,
            }
        };

        let topic_of = |inbound: Inbound| match inbound {
            Inbound::Publish { topic, .. } => Some(topic),
            _ => None,
        };

        assert_eq!(topic_of(reader.resolve_v5_publish(publish("t/1", Some(3)))), Some("t/1".into()));
        assert_eq!(topic_of(reader.resolve_v5_publish(publish("", Some(3)))), Some("t/1".into()));
        assert_eq!(topic_of(reader.resolve_v5_publish(publish("", Some(4)))), None);
        assert_eq!(topic_of(reader.resolve_v5_publish(publish("t/2", Some(11)))), None);
        assert_eq!(topic_of(reader.resolve_v5_publish(publish("", None))), None);
    }
}
