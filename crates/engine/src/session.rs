//! Generation sessions
//!
//! A session is one prompt-to-completion evaluation. The native callback runs
//! on the generation thread and pushes into a [`FragmentSink`]; the HTTP task
//! drains the paired [`GenerationSession`]. The channel is the only shared
//! state, so fragments arrive in emission order and nothing can be observed
//! half-written.

use parking_lot::Mutex;
use rkserve_common::METRICS;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{self, error::TryRecvError, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

/// Session identifier
pub type SessionId = Uuid;

/// Lifecycle of a session as seen by the drainer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    /// Started, no fragment observed yet
    Running,

    /// At least one fragment observed, not terminal
    Normal,

    /// Engine signalled completion
    Finished,

    /// Engine signalled failure
    Error,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Finished | SessionStatus::Error)
    }
}

/// Event pushed by the producer side
#[derive(Debug, Clone, PartialEq)]
pub enum GenerationEvent {
    Fragment(String),
    Finished,
    Failed(String),
}

/// Producer half handed to the backend for one run
///
/// Once a terminal event has been pushed every further call is ignored.
/// Raw bytes from the runtime may end inside a multi-byte character; the
/// unfinished tail is carried into the next call.
#[derive(Debug)]
pub struct FragmentSink {
    tx: UnboundedSender<GenerationEvent>,
    terminal: AtomicBool,
    pending: Mutex<Vec<u8>>,
}

impl FragmentSink {
    /// Append a fragment to the session output
    pub fn fragment(&self, text: impl Into<String>) {
        if self.is_terminal() {
            return;
        }
        self.flush_pending();
        self.push(text.into());
    }

    /// Append raw runtime bytes, holding back an incomplete UTF-8 tail
    pub fn fragment_bytes(&self, bytes: &[u8]) {
        if self.is_terminal() {
            return;
        }
        let text = {
            let mut pending = self.pending.lock();
            pending.extend_from_slice(bytes);
            take_complete_utf8(&mut pending)
        };
        if !text.is_empty() {
            self.push(text);
        }
    }

    /// Mark the run as successfully completed
    pub fn finish(&self) {
        if self.is_terminal() {
            return;
        }
        self.flush_pending();
        if !self.terminal.swap(true, Ordering::AcqRel) {
            let _ = self.tx.send(GenerationEvent::Finished);
        }
    }

    /// Mark the run as failed
    pub fn fail(&self, reason: impl Into<String>) {
        if self.is_terminal() {
            return;
        }
        self.flush_pending();
        if !self.terminal.swap(true, Ordering::AcqRel) {
            let _ = self.tx.send(GenerationEvent::Failed(reason.into()));
        }
    }

    /// Whether a terminal event was pushed
    pub fn is_terminal(&self) -> bool {
        self.terminal.load(Ordering::Acquire)
    }

    fn flush_pending(&self) {
        let rest = std::mem::take(&mut *self.pending.lock());
        if !rest.is_empty() {
            self.push(String::from_utf8_lossy(&rest).into_owned());
        }
    }

    fn push(&self, text: String) {
        METRICS.generation.fragments_total.inc();
        // The drainer may be gone; the run still has to complete.
        let _ = self.tx.send(GenerationEvent::Fragment(text));
    }
}

/// Decode the longest complete prefix of `buf` and drop it from the buffer
///
/// Invalid sequences become U+FFFD. A truncated sequence at the end stays in
/// `buf`.
fn take_complete_utf8(buf: &mut Vec<u8>) -> String {
    let mut text = String::new();
    let mut start = 0;

    while start < buf.len() {
        match std::str::from_utf8(&buf[start..]) {
            Ok(valid) => {
                text.push_str(valid);
                start = buf.len();
            }
            Err(e) => {
                let valid_end = start + e.valid_up_to();
                text.push_str(&String::from_utf8_lossy(&buf[start..valid_end]));
                match e.error_len() {
                    Some(len) => {
                        text.push(char::REPLACEMENT_CHARACTER);
                        start = valid_end + len;
                    }
                    None => {
                        start = valid_end;
                        break;
                    }
                }
            }
        }
    }

    buf.drain(..start);
    text
}

/// Create a connected sink/receiver pair
pub(crate) fn channel() -> (FragmentSink, UnboundedReceiver<GenerationEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        FragmentSink {
            tx,
            terminal: AtomicBool::new(false),
            pending: Mutex::new(Vec::new()),
        },
        rx,
    )
}

/// Everything a drained session produced
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationOutput {
    /// Concatenated fragments, partial when the engine failed
    pub text: String,

    /// Terminal status
    pub status: SessionStatus,

    /// Number of fragments received
    pub fragments: usize,

    /// Failure reason reported by the engine
    pub error: Option<String>,
}

/// Consumer half of one in-flight generation
pub struct GenerationSession {
    id: SessionId,
    events: UnboundedReceiver<GenerationEvent>,
    status: SessionStatus,
    error: Option<String>,
    fragments: usize,
    worker: Option<JoinHandle<()>>,
    started: Instant,
}

impl GenerationSession {
    pub(crate) fn new(
        id: SessionId,
        events: UnboundedReceiver<GenerationEvent>,
        worker: JoinHandle<()>,
    ) -> Self {
        Self {
            id,
            events,
            status: SessionStatus::Running,
            error: None,
            fragments: 0,
            worker: Some(worker),
            started: Instant::now(),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    /// Time since the session was started
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Wait for the next fragment
    ///
    /// Returns `None` once the session is terminal; [`Self::status`] then
    /// tells how it ended.
    pub async fn next_fragment(&mut self) -> Option<String> {
        while !self.status.is_terminal() {
            let event = self.events.recv().await;
            if let Some(text) = self.apply(event) {
                return Some(text);
            }
        }
        None
    }

    /// Non-blocking poll: the next fragment if one is queued, plus the
    /// status after taking it
    pub fn try_poll(&mut self) -> (Option<String>, SessionStatus) {
        if self.status.is_terminal() {
            return (None, self.status);
        }
        let fragment = match self.events.try_recv() {
            Ok(event) => self.apply(Some(event)),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => self.apply(None),
        };
        (fragment, self.status)
    }

    fn apply(&mut self, event: Option<GenerationEvent>) -> Option<String> {
        match event {
            Some(GenerationEvent::Fragment(text)) => {
                self.fragments += 1;
                self.status = SessionStatus::Normal;
                Some(text)
            }
            Some(GenerationEvent::Finished) => {
                self.status = SessionStatus::Finished;
                None
            }
            Some(GenerationEvent::Failed(reason)) => {
                self.mark_failed(reason);
                None
            }
            None => {
                // Producer dropped without a terminal event: the worker died.
                self.mark_failed("generation thread exited without a terminal status".to_string());
                None
            }
        }
    }

    fn mark_failed(&mut self, reason: String) {
        warn!("Session {} failed: {}", self.id, reason);
        METRICS.generation.generations_failed.inc();
        self.status = SessionStatus::Error;
        self.error = Some(reason);
    }

    /// Drain to completion and join the generation thread
    pub async fn collect(mut self) -> GenerationOutput {
        let mut text = String::new();
        while let Some(fragment) = self.next_fragment().await {
            text.push_str(&fragment);
        }
        let status = self.status;
        let fragments = self.fragments;
        let error = self.error.clone();
        self.finish().await;

        GenerationOutput {
            text,
            status,
            fragments,
            error,
        }
    }

    /// Join the generation thread
    ///
    /// Events still queued are discarded. The admission slot must not be
    /// released before this returns.
    pub async fn finish(mut self) {
        if let Some(worker) = self.worker.take() {
            if let Err(e) = worker.await {
                warn!("Generation thread for session {} panicked: {}", self.id, e);
            }
        }
        debug!(
            "Session {} closed: status={:?}, fragments={}, elapsed={:?}",
            self.id,
            self.status,
            self.fragments,
            self.started.elapsed()
        );
    }
}

impl Drop for GenerationSession {
    fn drop(&mut self) {
        if self.worker.is_some() && !self.status.is_terminal() {
            debug!("Session {} dropped before completion; generation runs on", self.id);
        }
    }
}
