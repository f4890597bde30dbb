//! Continuous event stream: the websocket source and the pump thread that
//! turns it into an ordered channel of [`StreamEvent`]s.
use crate::backoff::{Backoff, BackoffPolicy};
use crate::envelope::{Received, Rejected};
use crate::snapshot::now_unix_ns;
use crossbeam_channel::Sender;
use std::net::TcpStream;
use std::thread::JoinHandle;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use tungstenite::stream::MaybeTlsStream;
use tungstenite::{Message, WebSocket};

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("websocket error: {0}")]
    Ws(#[from] tungstenite::Error),
    #[error("not connected")]
    NotConnected,
    /// The source has nothing more to deliver, ever.
    #[error("stream finished")]
    Finished,
}

/// A reconnectable source of raw text frames, delivered in order.
pub trait EventSource: Send + 'static {
    fn connect(&mut self) -> Result<(), StreamError>;
    /// Next text frame; `Ok(None)` when the peer closed the connection.
    fn next_message(&mut self) -> Result<Option<String>, StreamError>;
}

pub struct WsEventSource {
    url: String,
    socket: Option<WebSocket<MaybeTlsStream<TcpStream>>>,
}

impl WsEventSource {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into(), socket: None }
    }
}

impl EventSource for WsEventSource {
    fn connect(&mut self) -> Result<(), StreamError> {
        let (socket, response) = tungstenite::connect(self.url.as_str())?;
        debug!(status = %response.status(), url = %self.url, "websocket connected");
        self.socket = Some(socket);
        Ok(())
    }

    fn next_message(&mut self) -> Result<Option<String>, StreamError> {
        let socket = self.socket.as_mut().ok_or(StreamError::NotConnected)?;
        loop {
            // pongs for incoming pings are queued by tungstenite and flushed on read
            match socket.read() {
                Ok(Message::Text(text)) => return Ok(Some(text)),
                Ok(Message::Close(frame)) => {
                    debug!(?frame, "close frame received");
                    self.socket = None;
                    return Ok(None);
                }
                Ok(_) => continue,
                Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed) => {
                    self.socket = None;
                    return Ok(None);
                }
                Err(e) => {
                    self.socket = None;
                    return Err(e.into());
                }
            }
        }
    }
}

/// What the pump hands to the control loop, in socket order.
#[derive(Debug)]
pub enum StreamEvent {
    Connected { attempt: u32 },
    Envelope(Received),
    /// Frame that is not a usable depth update or trade (acks, unknown
    /// events, malformed payloads). Still recorded verbatim.
    Unparsed { recv_unix_ns: u64, text: String, reason: String },
    Disconnected { reason: String },
    /// The source is exhausted; no reconnect will follow.
    Ended,
    /// Reconnect attempts exceeded the configured cap.
    Fatal(String),
}

#[derive(Debug, Clone, Copy)]
pub struct PumpConfig {
    pub backoff: BackoffPolicy,
    pub reconnect_attempts: u32,
}

/// Run `source` on its own thread: connect, forward every frame parsed once
/// at ingress, reconnect with backoff. Stops when the receiver goes away.
pub fn spawn_pump<E: EventSource>(
    mut source: E,
    tx: Sender<StreamEvent>,
    cfg: PumpConfig,
) -> std::io::Result<JoinHandle<()>> {
    std::thread::Builder::new().name("stream-pump".into()).spawn(move || {
        let mut backoff = Backoff::new(cfg.backoff);
        let mut failures = 0u32;
        let mut connects = 0u32;
        loop {
            match source.connect() {
                Ok(()) => {
                    failures = 0;
                    backoff.reset();
                    connects += 1;
                    info!(attempt = connects, "event stream connected");
                    if tx.send(StreamEvent::Connected { attempt: connects }).is_err() {
                        return;
                    }
                }
                Err(StreamError::Finished) => {
                    let _ = tx.send(StreamEvent::Ended);
                    return;
                }
                Err(e) => {
                    failures += 1;
                    if failures >= cfg.reconnect_attempts {
                        error!(failures, error = %e, "event stream unreachable");
                        let _ = tx.send(StreamEvent::Fatal(format!("stream connect failed {failures} times: {e}")));
                        return;
                    }
                    let delay = backoff.next_delay();
                    warn!(failures, error = %e, delay_ms = delay.as_millis() as u64, "connect failed, retrying");
                    std::thread::sleep(delay);
                    continue;
                }
            }

            let reason = loop {
                match source.next_message() {
                    Ok(Some(text)) => {
                        let recv_unix_ns = now_unix_ns();
                        let event = match Received::ingest(text, recv_unix_ns) {
                            Ok(received) => StreamEvent::Envelope(received),
                            Err(Rejected { text, error }) => {
                                StreamEvent::Unparsed { recv_unix_ns, text, reason: error.to_string() }
                            }
                        };
                        if tx.send(event).is_err() {
                            return;
                        }
                    }
                    Ok(None) => break "closed by peer".to_string(),
                    Err(StreamError::Finished) => {
                        let _ = tx.send(StreamEvent::Ended);
                        return;
                    }
                    Err(e) => break e.to_string(),
                }
            };
            warn!(%reason, "event stream disconnected");
            if tx.send(StreamEvent::Disconnected { reason }).is_err() {
                return;
            }
            std::thread::sleep(backoff.next_delay());
        }
    })
}
