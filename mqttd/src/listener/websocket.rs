//! MQTT over websocket.
//!
//! MQTT packets travel in binary websocket frames. [`WsStream`] flattens the
//! frames back into a byte stream so the broker can serve it like TCP.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use bytes::{Buf, Bytes};
use futures::{Sink, Stream};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::{WebSocketStream, accept_hdr_async};
use tracing::debug;

use crate::error::{Error, Result};

/// Websocket subprotocol negotiated with MQTT clients.
pub const SUBPROTOCOL: &str = "mqtt";

/// Perform the websocket handshake on an accepted stream.
///
/// The `mqtt` subprotocol is echoed back when the client offers it.
pub async fn accept<S>(stream: S) -> Result<WsStream<S>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let callback = |req: &Request, mut response: Response| {
        let offers_mqtt = req
            .headers()
            .get("Sec-WebSocket-Protocol")
            .and_then(|v| v.to_str().ok())
            .is_some_and(|protocols| protocols.split(',').any(|p| p.trim() == SUBPROTOCOL));
        if offers_mqtt {
            response.headers_mut().insert(
                "Sec-WebSocket-Protocol",
                HeaderValue::from_static(SUBPROTOCOL),
            );
        }
        debug!(path = %req.uri().path(), offers_mqtt, "websocket handshake");
        Ok(response)
    };

    let ws = accept_hdr_async(stream, callback)
        .await
        .map_err(|e| Error::Protocol(format!("websocket handshake failed: {e}")))?;
    Ok(WsStream::new(ws))
}

/// Byte stream view of a websocket connection.
pub struct WsStream<S> {
    inner: WebSocketStream<S>,
    pending: Bytes,
}

impl<S> WsStream<S> {
    pub fn new(inner: WebSocketStream<S>) -> Self {
        Self {
            inner,
            pending: Bytes::new(),
        }
    }
}

fn ws_error(e: impl std::fmt::Display) -> io::Error {
    io::Error::other(e.to_string())
}

impl<S> AsyncRead for WsStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            if !self.pending.is_empty() {
                let n = self.pending.len().min(buf.remaining());
                buf.put_slice(&self.pending[..n]);
                self.pending.advance(n);
                return Poll::Ready(Ok(()));
            }

            match ready!(Pin::new(&mut self.inner).poll_next(cx)) {
                Some(Ok(Message::Binary(data))) => self.pending = data,
                // Close frame or end of stream reads as EOF.
                Some(Ok(Message::Close(_))) | None => return Poll::Ready(Ok(())),
                // Control frames are answered by tungstenite; text is not MQTT.
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Poll::Ready(Err(ws_error(e))),
            }
        }
    }
}

impl<S> AsyncWrite for WsStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let mut inner = Pin::new(&mut self.inner);
        ready!(inner.as_mut().poll_ready(cx)).map_err(ws_error)?;
        inner
            .start_send(Message::Binary(Bytes::copy_from_slice(buf)))
            .map_err(ws_error)?;
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx).map_err(ws_error)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_close(cx).map_err(ws_error)
    }
}
