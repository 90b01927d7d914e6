//! Line-framed link supervisor over an abstract byte transport.
//!
//! Concrete transports (serial, TCP, Bluetooth) live outside the core; the
//! supervisor owns reconnection, heartbeat and the quality gauge, and fans
//! incoming lines out on a broadcast channel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::select;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, warn};

use crate::error::HostError;
use crate::util::exponential_backoff;

pub const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(5);
pub const RECONNECT_BASE_DELAY: Duration = Duration::from_secs(1);
pub const RECONNECT_MAX_DELAY: Duration = Duration::from_secs(30);
pub const RECONNECT_MAX_ATTEMPTS: u32 = 5;

const EVENT_CHANNEL_CAPACITY: usize = 256;
const WRITE_CHANNEL_CAPACITY: usize = 32;

/// A freshly opened byte duplex.
pub struct TransportStream {
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
    pub writer: Box<dyn AsyncWrite + Send + Unpin>,
}

/// Boundary to the concrete transports supplied by the embedding
/// application. `open` is called again on every reconnect attempt.
#[async_trait]
pub trait Transport: Send + 'static {
    async fn open(&mut self) -> Result<TransportStream, HostError>;

    fn describe(&self) -> String {
        "transport".to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkQuality {
    Excellent,
    Good,
    Poor,
    Unknown,
}

#[derive(Debug, Clone)]
pub enum LinkEvent {
    Connected,
    Disconnected,
    Line(String),
    Error(String),
}

#[derive(Debug)]
enum WriteOp {
    Line(String),
    Raw(u8),
}

#[derive(Default)]
struct QualityTracker {
    seen_traffic: bool,
    consecutive_errors: u32,
    lines_since_error: u32,
}

impl QualityTracker {
    fn gauge(&self) -> LinkQuality {
        if !self.seen_traffic {
            LinkQuality::Unknown
        } else if self.consecutive_errors >= 3 {
            LinkQuality::Poor
        } else if self.consecutive_errors > 0 || self.lines_since_error < 20 {
            LinkQuality::Good
        } else {
            LinkQuality::Excellent
        }
    }

    fn record_connected(&mut self) {
        self.seen_traffic = true;
        self.consecutive_errors = 0;
        self.lines_since_error = 0;
    }

    fn record_line(&mut self) {
        self.seen_traffic = true;
        self.consecutive_errors = 0;
        self.lines_since_error = self.lines_since_error.saturating_add(1);
    }

    fn record_error(&mut self) {
        self.seen_traffic = true;
        self.consecutive_errors += 1;
        self.lines_since_error = 0;
    }
}

struct LinkShared {
    connected: AtomicBool,
    quality: Mutex<QualityTracker>,
}

/// Handle to the link supervisor task.
pub struct Link {
    events: broadcast::Sender<LinkEvent>,
    write_tx: mpsc::Sender<WriteOp>,
    shutdown: watch::Sender<bool>,
    shared: Arc<LinkShared>,
}

impl Link {
    /// Start the supervisor. The returned receiver was subscribed before the
    /// task runs, so the first `Connected` event cannot be missed.
    pub fn spawn(transport: Box<dyn Transport>) -> (Link, broadcast::Receiver<LinkEvent>) {
        let (events, first_receiver) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (write_tx, write_rx) = mpsc::channel(WRITE_CHANNEL_CAPACITY);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let shared = Arc::new(LinkShared {
            connected: AtomicBool::new(false),
            quality: Mutex::new(QualityTracker::default()),
        });
        tokio::spawn(run_link(transport, events.clone(), write_rx, shutdown_rx, shared.clone()));
        (Link { events, write_tx, shutdown, shared }, first_receiver)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LinkEvent> {
        self.events.subscribe()
    }

    pub fn quality(&self) -> LinkQuality {
        self.shared.quality.lock().unwrap().gauge()
    }

    /// Connected and not degraded.
    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst) && self.quality() != LinkQuality::Poor
    }

    /// Queue a line; the supervisor appends the terminating newline.
    pub async fn send_line(&self, text: &str) -> Result<(), HostError> {
        self.send_op(WriteOp::Line(text.to_string())).await
    }

    /// Send a single realtime byte with no terminator.
    pub async fn send_raw(&self, byte: u8) -> Result<(), HostError> {
        self.send_op(WriteOp::Raw(byte)).await
    }

    async fn send_op(&self, op: WriteOp) -> Result<(), HostError> {
        if !self.shared.connected.load(Ordering::SeqCst) {
            return Err(HostError::ConnectionFailed("link is down".to_string()));
        }
        self.write_tx
            .send(op)
            .await
            .map_err(|_| HostError::ConnectionFailed("link task stopped".to_string()))
    }

    /// Idempotent; repeated calls are no-ops.
    pub fn disconnect(&self) {
        drop(self.shutdown.send(true));
    }
}

enum SessionEnd {
    Shutdown,
    Failed(String),
}

async fn run_link(
    mut transport: Box<dyn Transport>,
    events: broadcast::Sender<LinkEvent>,
    mut write_rx: mpsc::Receiver<WriteOp>,
    mut shutdown_rx: watch::Receiver<bool>,
    shared: Arc<LinkShared>,
) {
    let mut attempt = 0u32;
    loop {
        if *shutdown_rx.borrow() {
            return;
        }
        match transport.open().await {
            Ok(stream) => {
                attempt = 0;
                shared.connected.store(true, Ordering::SeqCst);
                shared.quality.lock().unwrap().record_connected();
                drop(events.send(LinkEvent::Connected));
                let end =
                    run_session(stream, &events, &mut write_rx, &mut shutdown_rx, &shared).await;
                shared.connected.store(false, Ordering::SeqCst);
                drop(events.send(LinkEvent::Disconnected));
                match end {
                    SessionEnd::Shutdown => return,
                    SessionEnd::Failed(reason) => {
                        shared.quality.lock().unwrap().record_error();
                        drop(events.send(LinkEvent::Error(reason)));
                    }
                }
            }
            Err(error) => {
                shared.quality.lock().unwrap().record_error();
                drop(events.send(LinkEvent::Error(format!("open failed: {}", error))));
            }
        }
        attempt += 1;
        if attempt >= RECONNECT_MAX_ATTEMPTS {
            drop(events.send(LinkEvent::Error("reconnect attempts exhausted".to_string())));
            return;
        }
        let delay = exponential_backoff(RECONNECT_BASE_DELAY, attempt - 1, RECONNECT_MAX_DELAY);
        debug!(transport = %transport.describe(), attempt, ?delay, "link reconnecting");
        select! {
            _ = sleep(delay) => {}
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    return;
                }
            }
        }
    }
}

async fn run_session(
    stream: TransportStream,
    events: &broadcast::Sender<LinkEvent>,
    write_rx: &mut mpsc::Receiver<WriteOp>,
    shutdown_rx: &mut watch::Receiver<bool>,
    shared: &Arc<LinkShared>,
) -> SessionEnd {
    let mut lines = BufReader::new(stream.reader).lines();
    let mut writer = stream.writer;
    let mut last_seen = Instant::now();
    loop {
        select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    last_seen = Instant::now();
                    shared.quality.lock().unwrap().record_line();
                    let line = line.trim_end_matches('\r');
                    if line.is_empty() {
                        continue;
                    }
                    debug!(line, "recv");
                    drop(events.send(LinkEvent::Line(line.to_string())));
                }
                Ok(None) => return SessionEnd::Failed("stream closed".to_string()),
                Err(error) => return SessionEnd::Failed(format!("read failed: {}", error)),
            },
            op = write_rx.recv() => match op {
                Some(WriteOp::Line(text)) => {
                    debug!(line = %text, "send");
                    if let Err(error) = write_line(&mut writer, &text).await {
                        return SessionEnd::Failed(format!("write failed: {}", error));
                    }
                }
                Some(WriteOp::Raw(byte)) => {
                    debug!(byte, "send raw");
                    if let Err(error) = write_byte(&mut writer, byte).await {
                        return SessionEnd::Failed(format!("write failed: {}", error));
                    }
                }
                None => return SessionEnd::Shutdown,
            },
            _ = sleep_until(last_seen + HEARTBEAT_TIMEOUT) => {
                warn!("heartbeat timeout");
                return SessionEnd::Failed("heartbeat timeout".to_string());
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    return SessionEnd::Shutdown;
                }
            }
        }
    }
}

async fn write_line(
    writer: &mut Box<dyn AsyncWrite + Send + Unpin>,
    text: &str,
) -> std::io::Result<()> {
    writer.write_all(text.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await
}

async fn write_byte(writer: &mut Box<dyn AsyncWrite + Send + Unpin>, byte: u8) -> std::io::Result<()> {
    writer.write_all(&[byte]).await?;
    writer.flush().await
}
