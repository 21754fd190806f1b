//! Bounded multi-producer / single-consumer progress reporting.
//!
//! Workers, the scheduler and the upload handoff all hold a
//! [`ProgressSender`]. A single [`ProgressConsumer`] drains the channel on
//! its own thread with a timed receive, tallies outcomes and forwards
//! `(message, success)` pairs to a [`ReportSink`] until it sees `Done`
//! (or `NothingToDo` for an empty run).

use super::TaskOutcome;
use crate::error::ProgressError;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use serde::Serialize;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Channel capacity; a full channel blocks producers until the consumer
/// catches up.
pub const PROGRESS_CAPACITY: usize = 100;

/// Receive timeout of the consumer loop.
pub const RECV_TIMEOUT: Duration = Duration::from_secs(1);

pub const NOTHING_TO_DO_MESSAGE: &str = "No images to compress and upload found!";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressMessage {
    /// Terminal outcome of one file.
    Outcome(TaskOutcome),
    /// Free-form human-readable line that is not a file outcome.
    Status { message: String, success: bool },
    /// Sentinel: the run is over. Always the last message of a run.
    Done,
    /// Sentinel for a run that discovered no files. Sent instead of `Done`.
    NothingToDo,
}

pub struct ProgressChannel;

impl ProgressChannel {
    pub fn open() -> (ProgressSender, ProgressReceiver) {
        Self::with_capacity(PROGRESS_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> (ProgressSender, ProgressReceiver) {
        let (tx, rx) = bounded(capacity);
        (ProgressSender { tx }, ProgressReceiver { rx })
    }
}

#[derive(Debug, Clone)]
pub struct ProgressSender {
    tx: Sender<ProgressMessage>,
}

impl ProgressSender {
    pub fn outcome(&self, outcome: TaskOutcome) {
        self.send(ProgressMessage::Outcome(outcome));
    }

    pub fn status(&self, message: impl Into<String>, success: bool) {
        self.send(ProgressMessage::Status {
            message: message.into(),
            success,
        });
    }

    pub fn done(&self) {
        self.send(ProgressMessage::Done);
    }

    pub fn nothing_to_do(&self) {
        self.send(ProgressMessage::NothingToDo);
    }

    /// Blocks while the channel is full. A dropped consumer is logged and
    /// the message discarded; producers must never fail because nobody is
    /// watching.
    pub fn send(&self, message: ProgressMessage) {
        if let Err(e) = self.tx.send(message) {
            warn!("Progress consumer is gone, dropping message: {:?}", e.into_inner());
        }
    }
}

#[derive(Debug)]
pub struct ProgressReceiver {
    rx: Receiver<ProgressMessage>,
}

impl ProgressReceiver {
    pub fn recv_timeout(&self, timeout: Duration) -> Result<ProgressMessage, RecvTimeoutError> {
        self.rx.recv_timeout(timeout)
    }

    /// Everything currently buffered, without blocking.
    pub fn drain(&self) -> Vec<ProgressMessage> {
        self.rx.try_iter().collect()
    }
}

/// Aggregate the consumer keeps while draining.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProgressTally {
    pub succeeded: usize,
    pub failed: usize,
    pub status_lines: usize,
    /// Whether a terminal sentinel was observed.
    pub finished: bool,
}

impl ProgressTally {
    pub fn outcomes(&self) -> usize {
        self.succeeded + self.failed
    }

    fn record(&mut self, outcome: &TaskOutcome) {
        if outcome.success {
            self.succeeded += 1;
        } else {
            self.failed += 1;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReportEvent {
    Message { text: String, success: bool },
    Done(ProgressTally),
    NothingToDo(String),
}

/// Consumer-facing boundary (UI, terminal, log).
pub trait ReportSink: Send {
    fn on_event(&mut self, event: ReportEvent);
}

impl<F> ReportSink for F
where
    F: FnMut(ReportEvent) + Send,
{
    fn on_event(&mut self, event: ReportEvent) {
        self(event)
    }
}

pub struct ProgressConsumer<S: ReportSink> {
    receiver: ProgressReceiver,
    sink: S,
    timeout: Duration,
}

impl<S: ReportSink + 'static> ProgressConsumer<S> {
    pub fn new(receiver: ProgressReceiver, sink: S) -> Self {
        Self {
            receiver,
            sink,
            timeout: RECV_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Run the consumer on a dedicated thread.
    pub fn spawn(self) -> std::io::Result<thread::JoinHandle<Result<ProgressTally, ProgressError>>> {
        thread::Builder::new()
            .name("progress-consumer".to_string())
            .spawn(move || self.run())
    }

    /// Drain until a terminal sentinel arrives. Returns an error if every
    /// sender disconnects first.
    pub fn run(mut self) -> Result<ProgressTally, ProgressError> {
        let mut tally = ProgressTally::default();
        let mut last_message = Instant::now();

        loop {
            match self.receiver.recv_timeout(self.timeout) {
                Ok(ProgressMessage::Outcome(outcome)) => {
                    last_message = Instant::now();
                    tally.record(&outcome);
                    self.sink.on_event(ReportEvent::Message {
                        text: outcome.message,
                        success: outcome.success,
                    });
                }
                Ok(ProgressMessage::Status { message, success }) => {
                    last_message = Instant::now();
                    tally.status_lines += 1;
                    self.sink.on_event(ReportEvent::Message { text: message, success });
                }
                Ok(ProgressMessage::Done) => {
                    tally.finished = true;
                    self.sink.on_event(ReportEvent::Done(tally.clone()));
                    return Ok(tally);
                }
                Ok(ProgressMessage::NothingToDo) => {
                    tally.finished = true;
                    self.sink
                        .on_event(ReportEvent::NothingToDo(NOTHING_TO_DO_MESSAGE.to_string()));
                    return Ok(tally);
                }
                Err(RecvTimeoutError::Timeout) => {
                    debug!("No progress for {:?}, still waiting", last_message.elapsed());
                }
                Err(RecvTimeoutError::Disconnected) => {
                    warn!("Progress channel closed without a terminal message");
                    self.sink.on_event(ReportEvent::Message {
                        text: ProgressError::Disconnected.to_string(),
                        success: false,
                    });
                    return Err(ProgressError::Disconnected);
                }
            }
        }
    }
}
