//! Socket I/O.
//!
//! This is the only part of the crate that runs concurrently with the
//! session's dispatch task. A [`Connector`] opens a socket, spawns whatever
//! tasks it needs to pump frames, and hands back a [`Link`] for writing.
//! Everything read from the socket is reported through an [`Inbound`]
//! channel; the I/O tasks never touch session state.
//!
//! [`WebSocketConnector`] is the production implementation on top of
//! `tokio-tungstenite`.

use std::sync::Once;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{protocol::CloseFrame, Message as WebsocketMessage};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::error::{Error, Result};

/// What a socket reports back to the session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Inbound {
    /// A text frame, not yet decoded.
    Text(String),

    /// The socket is gone. Carries the close code if the peer sent one.
    Closed(Option<u16>),
}

/// Writing half of an open socket.
///
/// Dropping or [closing](Self::close) the link tears the socket down.
#[derive(Clone, Debug)]
pub struct Link {
    tx: mpsc::UnboundedSender<String>,
    shutdown: CancellationToken,
}

impl Link {
    /// Wraps the queue feeding a socket writer. The writer must stop when
    /// `shutdown` is cancelled, and must drop its receiver when the socket
    /// dies so that [`is_open`](Self::is_open) turns false.
    #[must_use]
    pub fn new(tx: mpsc::UnboundedSender<String>, shutdown: CancellationToken) -> Self {
        Self { tx, shutdown }
    }

    /// Queues a text frame.
    ///
    /// # Errors
    ///
    /// Returns `Unavailable` if the socket is no longer open.
    pub fn send(&self, text: String) -> Result<()> {
        if !self.is_open() {
            return Err(Error::unavailable("socket is closed"));
        }

        self.tx
            .send(text)
            .map_err(|_| Error::unavailable("socket writer has stopped"))
    }

    /// Whether the socket still looks alive. A socket can die without its
    /// close being reported, so this is checked before every send.
    #[must_use]
    pub fn is_open(&self) -> bool {
        !self.tx.is_closed() && !self.shutdown.is_cancelled()
    }

    pub fn close(&self) {
        self.shutdown.cancel();
    }
}

/// Opens sockets.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connects to `url`. Every frame and the eventual close must be
    /// reported on `inbound`.
    async fn connect(&self, url: &Url, inbound: mpsc::UnboundedSender<Inbound>) -> Result<Link>;
}

/// Connects over WebSocket using `tokio-tungstenite`.
#[derive(Copy, Clone, Debug, Default)]
pub struct WebSocketConnector;

static TLS_PROVIDER: Once = Once::new();

/// `wss` needs a process-wide crypto provider before the first handshake.
fn install_tls_provider() {
    TLS_PROVIDER.call_once(|| {
        if rustls::crypto::ring::default_provider()
            .install_default()
            .is_err()
        {
            debug!("using the crypto provider installed by the host");
        }
    });
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, url: &Url, inbound: mpsc::UnboundedSender<Inbound>) -> Result<Link> {
        debug!("connecting to {url}");
        if url.scheme() == "wss" {
            install_tls_provider();
        }

        let (ws_stream, _) = tokio_tungstenite::connect_async(url.as_str()).await?;
        let (mut ws_tx, mut ws_rx) = ws_stream.split();

        let shutdown = CancellationToken::new();
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();

        let writer_shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = writer_shutdown.cancelled() => {
                        let _ = ws_tx.send(WebsocketMessage::Close(None)).await;
                        break;
                    }
                    text = rx.recv() => {
                        let Some(text) = text else { break };
                        trace!("-> {text}");
                        if let Err(e) = ws_tx.send(WebsocketMessage::Text(text.into())).await {
                            warn!("error sending frame: {e}");
                            break;
                        }
                    }
                }
            }

            // Makes `Link::is_open` report false from now on.
            drop(rx);
            writer_shutdown.cancel();
        });

        let reader_shutdown = shutdown.clone();
        tokio::spawn(async move {
            let code = loop {
                tokio::select! {
                    () = reader_shutdown.cancelled() => break None,
                    message = ws_rx.next() => match message {
                        Some(Ok(WebsocketMessage::Text(text))) => {
                            trace!("<- {}", text.as_str());
                            if inbound.send(Inbound::Text(text.as_str().to_owned())).is_err() {
                                break None;
                            }
                        }
                        Some(Ok(WebsocketMessage::Close(frame))) => {
                            debug!("connection closed by server: {frame:?}");
                            break frame.map(|CloseFrame { code, .. }| u16::from(code));
                        }
                        // Pings are answered by tungstenite itself.
                        Some(Ok(_)) => trace!("ignoring non-text frame"),
                        Some(Err(e)) => {
                            warn!("error receiving frame: {e}");
                            break None;
                        }
                        None => break None,
                    },
                }
            };

            let _ = inbound.send(Inbound::Closed(code));
            reader_shutdown.cancel();
        });

        Ok(Link::new(tx, shutdown))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn link_reports_closed_after_close() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let link = Link::new(tx, CancellationToken::new());
        assert!(link.is_open());
        link.send(String::from("{}")).unwrap();

        link.close();
        assert!(!link.is_open());
        assert_eq!(
            link.send(String::from("{}")).unwrap_err().kind,
            crate::error::ErrorKind::Unavailable
        );
    }

    #[tokio::test]
    async fn secure_urls_reach_the_tls_handshake() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            // Hang up on the client hello.
            if let Ok((stream, _)) = listener.accept().await {
                drop(stream);
            }
        });

        let url = Url::parse(&format!("wss://127.0.0.1:{port}")).unwrap();
        let (inbound, _rx) = mpsc::unbounded_channel();
        let err = WebSocketConnector.connect(&url, inbound).await.unwrap_err();
        assert!(!err.to_string().contains("TLS support not compiled in"), "{err}");
    }

    #[test]
    fn link_notices_a_dead_writer() {
        let (tx, rx) = mpsc::unbounded_channel();
        let link = Link::new(tx, CancellationToken::new());
        drop(rx);
        assert!(!link.is_open());
    }
}
