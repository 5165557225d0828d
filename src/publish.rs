//! Result/error publishing
//!
//! `Publisher::publish` only enqueues. A background dispatcher thread hands
//! each message to a `Transport`; delivery failures are logged and counted,
//! never retried. `Dispatcher::shutdown` waits a bounded time for the queue
//! to drain.

use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Stdout, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::error::PublishError;

/// Default bound on the shutdown drain
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Message {
    pub topic: String,
    pub payload: String,
}

/// Delivers messages to a topic.
pub trait Transport: Send {
    fn send(&mut self, message: &Message) -> Result<(), PublishError>;

    fn flush(&mut self) -> Result<(), PublishError> {
        Ok(())
    }
}

/// Appends one `{"topic":..,"payload":..}` JSON object per line.
pub struct JsonLinesTransport<W: Write + Send> {
    writer: W,
}

impl<W: Write + Send> JsonLinesTransport<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl JsonLinesTransport<Stdout> {
    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }
}

impl JsonLinesTransport<BufWriter<File>> {
    /// Open `path` for appending, creating it if needed.
    pub fn append_to(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self::new(BufWriter::new(file)))
    }
}

impl<W: Write + Send> Transport for JsonLinesTransport<W> {
    fn send(&mut self, message: &Message) -> Result<(), PublishError> {
        let line = serde_json::to_string(message).map_err(|source| PublishError::Encode {
            topic: message.topic.clone(),
            source,
        })?;
        writeln!(self.writer, "{}", line).map_err(|source| PublishError::Delivery {
            topic: message.topic.clone(),
            source,
        })
    }

    fn flush(&mut self) -> Result<(), PublishError> {
        self.writer.flush().map_err(|source| PublishError::Delivery {
            topic: String::new(),
            source,
        })
    }
}

/// Records messages in memory. Clones share the record.
#[derive(Debug, Clone, Default)]
pub struct MemoryTransport {
    messages: Arc<Mutex<Vec<Message>>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<Message> {
        self.messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Payloads published on `topic`, in order
    pub fn payloads(&self, topic: &str) -> Vec<String> {
        self.messages()
            .into_iter()
            .filter(|m| m.topic == topic)
            .map(|m| m.payload)
            .collect()
    }
}

impl Transport for MemoryTransport {
    fn send(&mut self, message: &Message) -> Result<(), PublishError> {
        self.messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(message.clone());
        Ok(())
    }
}

enum Command {
    Deliver(Message),
    Shutdown,
}

#[derive(Debug, Default)]
struct Counters {
    queued: AtomicUsize,
    delivered: AtomicUsize,
    failed: AtomicUsize,
}

/// Outcome of `Dispatcher::shutdown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrainReport {
    /// Whether the queue emptied within the timeout
    pub drained: bool,
    pub delivered: usize,
    pub failed: usize,
    /// Messages still queued when the wait ended
    pub pending: usize,
}

/// Cloneable handle for enqueueing messages.
#[derive(Clone)]
pub struct Publisher {
    tx: Sender<Command>,
    closed: Arc<AtomicBool>,
    counters: Arc<Counters>,
}

impl Publisher {
    /// Enqueue without waiting for delivery.
    pub fn publish(&self, topic: &str, payload: impl Into<String>) -> Result<(), PublishError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(PublishError::Closed);
        }
        let message = Message {
            topic: topic.to_string(),
            payload: payload.into(),
        };
        self.tx
            .send(Command::Deliver(message))
            .map_err(|_| PublishError::Closed)?;
        self.counters.queued.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Messages that failed in the transport so far
    pub fn failed_count(&self) -> usize {
        self.counters.failed.load(Ordering::Relaxed)
    }
}

/// Owns the delivery thread.
pub struct Dispatcher {
    publisher: Publisher,
    done_rx: Receiver<()>,
}

impl Dispatcher {
    pub fn spawn<T: Transport + 'static>(transport: T) -> io::Result<Self> {
        let (tx, rx) = mpsc::channel();
        let (done_tx, done_rx) = mpsc::channel();
        let counters = Arc::new(Counters::default());

        let worker_counters = Arc::clone(&counters);
        thread::Builder::new()
            .name("publish-dispatcher".to_string())
            .spawn(move || deliver_loop(transport, rx, &worker_counters, done_tx))?;

        Ok(Self {
            publisher: Publisher {
                tx,
                closed: Arc::new(AtomicBool::new(false)),
                counters,
            },
            done_rx,
        })
    }

    pub fn publisher(&self) -> Publisher {
        self.publisher.clone()
    }

    /// Stop accepting messages and wait at most `timeout` for the queue to
    /// drain. The delivery thread is abandoned if it does not finish in time.
    pub fn shutdown(self, timeout: Duration) -> DrainReport {
        self.publisher.closed.store(true, Ordering::SeqCst);
        let _ = self.publisher.tx.send(Command::Shutdown);

        let drained = self.done_rx.recv_timeout(timeout).is_ok();
        let counters = &self.publisher.counters;
        let delivered = counters.delivered.load(Ordering::Relaxed);
        let failed = counters.failed.load(Ordering::Relaxed);
        let queued = counters.queued.load(Ordering::Relaxed);
        let report = DrainReport {
            drained,
            delivered,
            failed,
            pending: queued.saturating_sub(delivered + failed),
        };

        if drained {
            info!(delivered, failed, "publisher drained");
        } else {
            warn!(
                pending = report.pending,
                timeout_secs = timeout.as_secs_f64(),
                "publisher drain timed out"
            );
        }
        report
    }
}

fn deliver_loop<T: Transport>(
    mut transport: T,
    rx: Receiver<Command>,
    counters: &Counters,
    done_tx: Sender<()>,
) {
    for command in rx {
        match command {
            Command::Deliver(message) => match transport.send(&message) {
                Ok(()) => {
                    debug!(topic = %message.topic, "published");
                    counters.delivered.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    error!(topic = %message.topic, "publish failed: {}", e);
                    counters.failed.fetch_add(1, Ordering::Relaxed);
                }
            },
            Command::Shutdown => break,
        }
    }
    if let Err(e) = transport.flush() {
        error!("failed to flush transport: {}", e);
    }
    let _ = done_tx.send(());
}

#[cfg(test)]
mod tests {
    use super::*;

    struct BrokenTransport;

    impl Transport for BrokenTransport {
        fn send(&mut self, message: &Message) -> Result<(), PublishError> {
            Err(PublishError::Delivery {
                topic: message.topic.clone(),
                source: io::Error::new(io::ErrorKind::BrokenPipe, "down"),
            })
        }
    }

    /// Blocks every send until the gate opens.
    struct GatedTransport(Arc<Mutex<()>>);

    impl Transport for GatedTransport {
        fn send(&mut self, _message: &Message) -> Result<(), PublishError> {
            let _guard = self.0.lock().unwrap_or_else(PoisonError::into_inner);
            Ok(())
        }
    }

    #[test]
    fn test_messages_delivered_in_order() {
        let transport = MemoryTransport::new();
        let dispatcher = Dispatcher::spawn(transport.clone()).unwrap();
        let publisher = dispatcher.publisher();

        publisher.publish("results", r#"{"images":[]}"#).unwrap();
        publisher.publish("errors", "entry failed").unwrap();
        publisher.publish("results", r#"{"images":["x"]}"#).unwrap();

        let report = dispatcher.shutdown(Duration::from_secs(5));
        assert!(report.drained);
        assert_eq!(report.delivered, 3);
        assert_eq!(report.pending, 0);
        assert_eq!(
            transport.payloads("results"),
            vec![r#"{"images":[]}"#.to_string(), r#"{"images":["x"]}"#.to_string()]
        );
        assert_eq!(transport.payloads("errors"), vec!["entry failed".to_string()]);
    }

    #[test]
    fn test_failures_are_counted_not_retried() {
        let dispatcher = Dispatcher::spawn(BrokenTransport).unwrap();
        let publisher = dispatcher.publisher();
        publisher.publish("results", "a").unwrap();
        publisher.publish("results", "b").unwrap();

        let report = dispatcher.shutdown(Duration::from_secs(5));
        assert!(report.drained);
        assert_eq!(report.failed, 2);
        assert_eq!(report.delivered, 0);
    }

    #[test]
    fn test_publish_after_shutdown_is_closed() {
        let dispatcher = Dispatcher::spawn(MemoryTransport::new()).unwrap();
        let publisher = dispatcher.publisher();
        dispatcher.shutdown(Duration::from_secs(5));
        assert!(matches!(publisher.publish("results", "late"), Err(PublishError::Closed)));
    }

    #[test]
    fn test_shutdown_wait_is_bounded() {
        let gate = Arc::new(Mutex::new(()));
        let held = gate.lock().unwrap();
        let dispatcher = Dispatcher::spawn(GatedTransport(Arc::clone(&gate))).unwrap();
        dispatcher.publisher().publish("results", "stuck").unwrap();

        let report = dispatcher.shutdown(Duration::from_millis(50));
        assert!(!report.drained);
        assert_eq!(report.pending, 1);
        drop(held);
    }

    #[test]
    fn test_json_lines_format() -> anyhow::Result<()> {
        let mut transport = JsonLinesTransport::new(Vec::new());
        transport.send(&Message {
            topic: "errors".to_string(),
            payload: "bad \"entry\"".to_string(),
        })?;
        let text = String::from_utf8(transport.into_inner())?;
        assert_eq!(text, "{\"topic\":\"errors\",\"payload\":\"bad \\\"entry\\\"\"}\n");
        Ok(())
    }

    #[test]
    fn test_json_lines_appends_to_file() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("messages.jsonl");
        for payload in ["one", "two"] {
            let mut transport = JsonLinesTransport::append_to(&path)?;
            transport.send(&Message {
                topic: "results".to_string(),
                payload: payload.to_string(),
            })?;
            transport.flush()?;
        }
        let text = std::fs::read_to_string(&path)?;
        assert_eq!(text.lines().count(), 2);
        Ok(())
    }
}
