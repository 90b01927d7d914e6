//! Outbound command pipeline: FIFO with at most one command in flight,
//! bounded depth, per-command timeout and bounded retries.

use std::sync::Arc;
use std::time::Duration;

use tokio::select;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, warn};

use crate::error::HostError;
use crate::grbl::{self, parser::parse_line, GrblMessage, ProbeReport, StatusReport};
use crate::transport::{Link, LinkEvent};
use crate::util::exponential_backoff;

pub const QUEUE_CAPACITY: usize = 50;
pub const RETRY_BASE_DELAY: Duration = Duration::from_millis(100);
pub const RETRY_MAX_DELAY: Duration = Duration::from_secs(5);
pub const DEFAULT_MAX_ATTEMPTS: u8 = 3;
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

/// One outbound line and its delivery policy.
#[derive(Debug, Clone)]
pub struct Command {
    pub text: String,
    pub timeout: Duration,
    pub max_attempts: u8,
    pub attempt: u8,
}

impl Command {
    pub fn new(text: impl Into<String>) -> Command {
        Command {
            text: text.into(),
            timeout: DEFAULT_COMMAND_TIMEOUT,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            attempt: 0,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Command {
        self.timeout = timeout;
        self
    }
}

/// Every line observed between dispatch and the terminator.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommandResponse {
    pub lines: Vec<String>,
}

impl CommandResponse {
    pub fn text(&self) -> String {
        self.lines.join("\n")
    }

    pub fn probe_report(&self) -> Option<ProbeReport> {
        self.lines.iter().find_map(|line| match parse_line(line) {
            GrblMessage::Probe(report) => Some(report),
            _ => None,
        })
    }

    pub fn status_report(&self) -> Option<StatusReport> {
        self.lines.iter().find_map(|line| match parse_line(line) {
            GrblMessage::Status(report) => Some(report),
            _ => None,
        })
    }
}

struct Pending {
    command: Command,
    done: oneshot::Sender<Result<CommandResponse, HostError>>,
}

/// Handle to the queue actor.
pub struct CommandQueue {
    tx: mpsc::Sender<Pending>,
    clear_tx: mpsc::UnboundedSender<oneshot::Sender<()>>,
}

impl CommandQueue {
    pub fn spawn(link: Arc<Link>) -> CommandQueue {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        let (clear_tx, clear_rx) = mpsc::unbounded_channel();
        tokio::spawn(QueueTask { link, rx, clear_rx, clear_closed: false }.run());
        CommandQueue { tx, clear_tx }
    }

    pub async fn execute(&self, text: &str, timeout: Duration) -> Result<CommandResponse, HostError> {
        self.execute_command(Command::new(text).with_timeout(timeout)).await
    }

    /// Enqueue and wait for resolution. Rejects immediately when the queue
    /// is at capacity.
    pub async fn execute_command(&self, command: Command) -> Result<CommandResponse, HostError> {
        let (done, done_rx) = oneshot::channel();
        self.tx.try_send(Pending { command, done }).map_err(|error| match error {
            mpsc::error::TrySendError::Full(_) => HostError::BufferOverflow,
            mpsc::error::TrySendError::Closed(_) => {
                HostError::ConnectionFailed("command queue stopped".to_string())
            }
        })?;
        done_rx.await.map_err(|_| HostError::Cancelled)?
    }

    /// Reject every waiting and in-flight command with a cancellation
    /// error. Resolves once the rejection is visible, i.e. before any
    /// later command can dispatch.
    pub async fn clear(&self) {
        let (ack, ack_rx) = oneshot::channel();
        if self.clear_tx.send(ack).is_ok() {
            drop(ack_rx.await);
        }
    }
}

enum Wait {
    Resolved(CommandResponse),
    DeviceError(String),
    TransportError(String),
    TimedOut,
    Cancelled(oneshot::Sender<()>),
}

struct QueueTask {
    link: Arc<Link>,
    rx: mpsc::Receiver<Pending>,
    clear_rx: mpsc::UnboundedReceiver<oneshot::Sender<()>>,
    clear_closed: bool,
}

impl QueueTask {
    async fn run(mut self) {
        loop {
            select! {
                biased;
                ack = self.clear_rx.recv(), if !self.clear_closed => match ack {
                    Some(ack) => self.drain(ack),
                    None => self.clear_closed = true,
                },
                pending = self.rx.recv() => match pending {
                    Some(pending) => self.dispatch(pending).await,
                    None => return,
                },
            }
        }
    }

    fn drain(&mut self, ack: oneshot::Sender<()>) {
        while let Ok(pending) = self.rx.try_recv() {
            drop(pending.done.send(Err(HostError::Cancelled)));
        }
        drop(ack.send(()));
    }

    async fn dispatch(&mut self, pending: Pending) {
        let Pending { mut command, done } = pending;
        loop {
            // Subscribe before writing so the response cannot slip past,
            // and drop the subscription once the command resolves.
            let events = self.link.subscribe();
            let written = if command.text.trim() == "?" {
                self.link.send_raw(b'?').await
            } else {
                self.link.send_line(&command.text).await
            };
            let wait = match written {
                Ok(()) => self.await_response(&command, events).await,
                Err(error) => Wait::TransportError(error.to_string()),
            };
            let failure = match wait {
                Wait::Resolved(response) => {
                    drop(done.send(Ok(response)));
                    return;
                }
                Wait::Cancelled(ack) => {
                    drop(done.send(Err(HostError::Cancelled)));
                    self.drain(ack);
                    return;
                }
                Wait::TimedOut => HostError::CommandTimeout(command.text.clone()),
                Wait::DeviceError(message) => HostError::HardwareError(message),
                Wait::TransportError(message) => HostError::ConnectionFailed(message),
            };
            command.attempt += 1;
            if command.attempt >= command.max_attempts {
                drop(done.send(Err(failure)));
                return;
            }
            debug!(command = %command.text, attempt = command.attempt, error = %failure, "retrying");
            let delay =
                exponential_backoff(RETRY_BASE_DELAY, command.attempt as u32, RETRY_MAX_DELAY);
            select! {
                biased;
                ack = self.clear_rx.recv(), if !self.clear_closed => match ack {
                    Some(ack) => {
                        drop(done.send(Err(HostError::Cancelled)));
                        self.drain(ack);
                        return;
                    }
                    None => self.clear_closed = true,
                },
                _ = sleep(delay) => {}
            }
        }
    }

    async fn await_response(
        &mut self,
        command: &Command,
        mut events: broadcast::Receiver<LinkEvent>,
    ) -> Wait {
        let deadline = Instant::now() + command.timeout;
        let mut response = CommandResponse::default();
        loop {
            select! {
                biased;
                ack = self.clear_rx.recv(), if !self.clear_closed => match ack {
                    Some(ack) => return Wait::Cancelled(ack),
                    None => self.clear_closed = true,
                },
                event = events.recv() => match event {
                    Ok(LinkEvent::Line(line)) => {
                        response.lines.push(line.clone());
                        match classify_terminator(&command.text, &line) {
                            Some(Terminal::Done) => return Wait::Resolved(response),
                            Some(Terminal::DeviceError(message)) => {
                                return Wait::DeviceError(message)
                            }
                            None => {}
                        }
                    }
                    Ok(LinkEvent::Error(message)) => return Wait::TransportError(message),
                    Ok(LinkEvent::Disconnected) => {
                        return Wait::TransportError("link dropped".to_string())
                    }
                    Ok(LinkEvent::Connected) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "response listener lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        return Wait::TransportError("link stopped".to_string())
                    }
                },
                _ = sleep_until(deadline) => return Wait::TimedOut,
            }
        }
    }
}

enum Terminal {
    Done,
    DeviceError(String),
}

/// Response-terminator rules, in order: a status report resolves `?`, a
/// probe report resolves anything, then `ok`, then `error`. A probe cycle
/// replies with both `ok` and `[PRB:...]` in either order, so for `G38.x`
/// only the probe report (or a failure) ends collection. An alarm fails
/// only the probe cycle that provoked it; any other command keeps waiting
/// for its own `ok`/`error`/timeout, and the alarm reaches subscribers as
/// an event instead.
fn classify_terminator(command: &str, line: &str) -> Option<Terminal> {
    let line = line.trim();
    if command.trim() == "?" && line.starts_with('<') {
        return Some(Terminal::Done);
    }
    if line.contains("[PRB") {
        return Some(Terminal::Done);
    }
    let awaiting_probe = command.trim_start().starts_with("G38");
    if !awaiting_probe && (line == "ok" || line.contains("ok")) {
        return Some(Terminal::Done);
    }
    if let Some(rest) = line.strip_prefix("error:") {
        let detail = rest
            .trim()
            .parse::<u8>()
            .map(|code| format!("error:{}: {}", code, grbl::error_text(code)))
            .unwrap_or_else(|_| line.to_string());
        return Some(Terminal::DeviceError(detail));
    }
    if line.starts_with("error") {
        return Some(Terminal::DeviceError(line.to_string()));
    }
    if awaiting_probe {
        if let Some(rest) = line.strip_prefix("ALARM:") {
            let detail = rest
                .trim()
                .parse::<u8>()
                .map(|code| format!("ALARM:{}: {}", code, grbl::alarm_text(code)))
                .unwrap_or_else(|_| line.to_string());
            return Some(Terminal::DeviceError(detail));
        }
    }
    None
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};
    use tokio::time::timeout;

    use crate::transport::test::pair;

    /// Minimal device: answers every received line through `respond`.
    fn spawn_device(
        device: DuplexStream,
        respond: impl Fn(&str) -> Option<String> + Send + 'static,
    ) -> Arc<AtomicUsize> {
        let received = Arc::new(AtomicUsize::new(0));
        let counter = received.clone();
        tokio::spawn(async move {
            let (reader, mut writer) = tokio::io::split(device);
            let mut lines = BufReader::new(reader).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                counter.fetch_add(1, Ordering::SeqCst);
                if let Some(reply) = respond(&line) {
                    if writer.write_all(reply.as_bytes()).await.is_err() {
                        return;
                    }
                }
            }
        });
        received
    }

    async fn queue_over_device(
        respond: impl Fn(&str) -> Option<String> + Send + 'static,
    ) -> (Arc<Link>, CommandQueue, Arc<AtomicUsize>) {
        let (transport, device) = pair();
        let (link, mut events) = Link::spawn(Box::new(transport));
        // Wait for the link to come up before issuing commands.
        loop {
            if let Ok(LinkEvent::Connected) = events.recv().await {
                break;
            }
        }
        let received = spawn_device(device, respond);
        let link = Arc::new(link);
        let queue = CommandQueue::spawn(link.clone());
        (link, queue, received)
    }

    #[tokio::test]
    async fn ok_resolves_the_command() {
        let (_link, queue, _received) = queue_over_device(|_| Some("ok\r\n".to_string())).await;
        let response = queue.execute("G0 X1", Duration::from_secs(2)).await.unwrap();
        assert_eq!(response.lines, vec!["ok".to_string()]);
    }

    #[tokio::test]
    async fn response_buffer_keeps_intermediate_lines() {
        let (_link, queue, _received) = queue_over_device(|line| {
            if line.starts_with("G38.2") {
                Some("[PRB:0.000,0.000,-1.234:1]\r\n".to_string())
            } else {
                Some("ok\r\n".to_string())
            }
        })
        .await;
        let response = queue.execute("G38.2 Z-10 F50", Duration::from_secs(2)).await.unwrap();
        let report = response.probe_report().expect("probe report captured");
        assert!(report.contact);
    }

    #[tokio::test]
    async fn device_errors_retry_then_fail() {
        let (_link, queue, received) =
            queue_over_device(|_| Some("error:20\r\n".to_string())).await;
        let result = queue.execute("G0 X1", Duration::from_secs(2)).await;
        match result {
            Err(HostError::HardwareError(message)) => assert!(message.contains("error:20")),
            other => panic!("expected hardware error, got {:?}", other),
        }
        assert_eq!(received.load(Ordering::SeqCst), DEFAULT_MAX_ATTEMPTS as usize);
    }

    #[tokio::test]
    async fn commands_resolve_in_fifo_order() {
        let (_link, queue, _received) = queue_over_device(|_| Some("ok\r\n".to_string())).await;
        let queue = Arc::new(queue);
        let mut handles = Vec::new();
        for i in 0..5 {
            let queue = queue.clone();
            handles.push(tokio::spawn(async move {
                queue.execute(&format!("G0 X{}", i), Duration::from_secs(2)).await
            }));
        }
        for handle in handles {
            assert!(handle.await.unwrap().is_ok());
        }
    }

    #[tokio::test]
    async fn saturated_queue_rejects_with_capacity_error() {
        // Device never answers, so the first command stays in flight.
        let (_link, queue, _received) = queue_over_device(|_| None).await;
        let queue = Arc::new(queue);
        let mut handles = Vec::new();
        for i in 0..(QUEUE_CAPACITY + 1) {
            let queue = queue.clone();
            handles.push(tokio::spawn(async move {
                queue.execute(&format!("G0 X{}", i), Duration::from_secs(30)).await
            }));
        }
        // Let the spawned calls enqueue; one dispatches, fifty wait.
        tokio::task::yield_now().await;
        sleep(Duration::from_millis(50)).await;
        let overflow = queue.execute("G0 X99", Duration::from_secs(30)).await;
        assert_eq!(overflow, Err(HostError::BufferOverflow));
        queue.clear().await;
        let mut cancelled = 0;
        for handle in handles {
            if handle.await.unwrap() == Err(HostError::Cancelled) {
                cancelled += 1;
            }
        }
        assert!(cancelled >= QUEUE_CAPACITY);
    }

    #[tokio::test]
    async fn clear_cancels_the_in_flight_command() {
        let (_link, queue, _received) = queue_over_device(|_| None).await;
        let queue = Arc::new(queue);
        let inner = queue.clone();
        let pending =
            tokio::spawn(async move { inner.execute("G0 X1", Duration::from_secs(30)).await });
        sleep(Duration::from_millis(50)).await;
        queue.clear().await;
        let result = timeout(Duration::from_secs(1), pending).await.unwrap().unwrap();
        assert_eq!(result, Err(HostError::Cancelled));
    }

    #[test]
    fn terminator_rules_in_order() {
        assert!(matches!(
            classify_terminator("?", "<Idle|MPos:1.5,-2.0,3.25|F:0>"),
            Some(Terminal::Done)
        ));
        assert!(classify_terminator("?", "[MSG:note]").is_none());
        assert!(matches!(classify_terminator("G0 X1", "ok"), Some(Terminal::Done)));
        assert!(matches!(
            classify_terminator("G38.2 Z-5 F50", "[PRB:0,0,-1:1]"),
            Some(Terminal::Done)
        ));
        // A probe cycle's ok does not end collection; the report does.
        assert!(classify_terminator("G38.2 Z-5 F50", "ok").is_none());
        assert!(matches!(
            classify_terminator("G0 X1", "error:20"),
            Some(Terminal::DeviceError(_))
        ));
        // An alarm fails the probe cycle that provoked it, but an ordinary
        // command keeps waiting for its own terminator.
        assert!(matches!(
            classify_terminator("G38.2 Z-5 F50", "ALARM:4"),
            Some(Terminal::DeviceError(_))
        ));
        assert!(classify_terminator("G0 X1", "ALARM:1").is_none());
        assert!(classify_terminator("$H", "ALARM:9").is_none());
        assert!(classify_terminator("G0 X1", "<Idle|MPos:0,0,0>").is_none());
    }
}
