//! TCP implementation of [`Transport`]

use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use super::framing::{encode_frame, FrameDecoder};
use super::{
    DisconnectReason, Endpoint, EventEmitter, Transport, TransportError, TransportEvents,
};

const READ_CHUNK_SIZE: usize = 8 * 1024;

/// Characters of a frame shown in trace logs
const LOG_PREVIEW_CHARS: usize = 200;

/// Leading `max_chars` characters of `frame`, cut on a character boundary
fn preview(frame: &str, max_chars: usize) -> &str {
    frame
        .char_indices()
        .nth(max_chars)
        .map_or(frame, |(end, _)| &frame[..end])
}

/// One live connection instance
struct Link {
    /// Serializes writers so concurrent frames never interleave
    writer: Mutex<OwnedWriteHalf>,
    open: AtomicBool,
    shutdown: broadcast::Sender<DisconnectReason>,
    reader: std::sync::Mutex<Option<JoinHandle<()>>>,
    peer: Option<SocketAddr>,
}

/// Newline-delimited JSON over a TCP stream
///
/// Used both by the handler (outbound via [`Transport::connect`]) and by the
/// proxy for accepted sockets ([`TcpTransport::from_stream`]).
#[derive(Default)]
pub struct TcpTransport {
    link: RwLock<Option<Arc<Link>>>,
}

impl TcpTransport {
    /// Create a transport with no connection
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap an already-established stream (e.g. from `TcpListener::accept`)
    pub fn from_stream(stream: TcpStream) -> (Self, TransportEvents) {
        let transport = Self::new();
        let events = transport.attach(stream);
        (transport, events)
    }

    /// Remote address of the current connection
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.current().and_then(|link| link.peer)
    }

    fn current(&self) -> Option<Arc<Link>> {
        self.link
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn take_link(&self) -> Option<Arc<Link>> {
        self.link.write().unwrap_or_else(|e| e.into_inner()).take()
    }

    fn attach(&self, stream: TcpStream) -> TransportEvents {
        let peer = stream.peer_addr().ok();
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY: {}", e);
        }
        let (read_half, write_half) = stream.into_split();
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let link = Arc::new(Link {
            writer: Mutex::new(write_half),
            open: AtomicBool::new(true),
            shutdown: shutdown_tx,
            reader: std::sync::Mutex::new(None),
            peer,
        });

        let (emitter, events) = TransportEvents::channel();
        let handle = tokio::spawn(receive_loop(
            read_half,
            Arc::clone(&link),
            shutdown_rx,
            emitter,
        ));
        *link.reader.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);

        *self.link.write().unwrap_or_else(|e| e.into_inner()) = Some(link);
        events
    }
}

/// Marks the link closed however the receive loop exits, unwinding included
struct CloseOnExit(Arc<Link>);

impl Drop for CloseOnExit {
    fn drop(&mut self) {
        self.0.open.store(false, Ordering::SeqCst);
    }
}

/// Read chunks until EOF, error or local shutdown, emitting complete frames
async fn receive_loop(
    mut read_half: OwnedReadHalf,
    link: Arc<Link>,
    mut shutdown_rx: broadcast::Receiver<DisconnectReason>,
    emitter: EventEmitter,
) {
    let _close = CloseOnExit(Arc::clone(&link));
    let mut decoder = FrameDecoder::new();
    let mut chunk = vec![0u8; READ_CHUNK_SIZE];

    let reason = loop {
        tokio::select! {
            read = read_half.read(&mut chunk) => match read {
                Ok(0) => break DisconnectReason::PeerClosed,
                Ok(n) => {
                    for frame in decoder.push(&chunk[..n]) {
                        trace!("Received frame: {}", preview(&frame, LOG_PREVIEW_CHARS));
                        if !emitter.message(frame) {
                            debug!("No listener for inbound frames, dropping");
                        }
                    }
                }
                Err(e) => break DisconnectReason::Error(e.to_string()),
            },
            reason = shutdown_rx.recv() => {
                break reason.unwrap_or(DisconnectReason::Local);
            }
        }
    };

    if decoder.pending() > 0 {
        debug!(
            "Discarding {} bytes of an incomplete frame",
            decoder.pending()
        );
    }
    info!(
        "Connection to {} ended: {}",
        link.peer
            .map(|p| p.to_string())
            .unwrap_or_else(|| "unknown peer".to_string()),
        reason
    );
    emitter.disconnect(reason);
}

#[async_trait]
impl Transport for TcpTransport {
    async fn connect(&self, endpoint: &Endpoint) -> Result<TransportEvents, TransportError> {
        if self.is_connected() {
            return Err(TransportError::AlreadyConnected);
        }

        debug!("Connecting to {}", endpoint);
        let stream = TcpStream::connect((endpoint.host(), endpoint.port()))
            .await
            .map_err(|source| TransportError::ConnectFailed {
                endpoint: endpoint.to_string(),
                source,
            })?;

        info!("Connected to {}", endpoint);
        Ok(self.attach(stream))
    }

    async fn send(&self, message: &str) -> Result<(), TransportError> {
        if message.contains('\n') {
            return Err(TransportError::InvalidFrame(
                "message contains a newline".to_string(),
            ));
        }

        let link = self
            .current()
            .filter(|link| link.open.load(Ordering::SeqCst))
            .ok_or(TransportError::NotConnected)?;

        let frame = encode_frame(message);
        let mut writer = link.writer.lock().await;
        let written = match writer.write_all(&frame).await {
            Ok(()) => writer.flush().await,
            Err(e) => Err(e),
        };

        if let Err(e) = written {
            warn!("Write failed, closing connection: {}", e);
            link.open.store(false, Ordering::SeqCst);
            let _ = link.shutdown.send(DisconnectReason::Error(e.to_string()));
            return Err(e.into());
        }

        trace!("Sent frame ({} bytes)", frame.len());
        Ok(())
    }

    async fn disconnect(&self) {
        let Some(link) = self.take_link() else {
            return;
        };

        link.open.store(false, Ordering::SeqCst);
        let _ = link.shutdown.send(DisconnectReason::Local);

        let reader = link.reader.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = reader {
            let _ = handle.await;
        }

        let mut writer = link.writer.lock().await;
        let _ = writer.shutdown().await;
        debug!("TCP transport disconnected");
    }

    fn is_connected(&self) -> bool {
        self.current()
            .map(|link| link.open.load(Ordering::SeqCst))
            .unwrap_or(false)
    }
}
