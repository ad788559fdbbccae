//! Scripted in-process backend
//!
//! Replays a fixed list of fragments for every run. Used by the test suites
//! and for exercising the HTTP surface on machines without an NPU.

use crate::engine::GenerationBackend;
use crate::input::EngineInput;
use crate::session::FragmentSink;
use crossbeam::channel::Receiver;
use parking_lot::Mutex;
use rkserve_common::{GatewayError, Result};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

#[derive(Debug, Clone)]
enum Ending {
    Finish,
    Status(String),
    Error(String),
}

/// Backend that emits the same fragments for every input
pub struct ScriptedBackend {
    fragments: Vec<String>,
    ending: Ending,
    fragment_delay: Option<Duration>,
    hold: Option<Receiver<()>>,
    inputs: Mutex<Vec<EngineInput>>,
    runs: AtomicUsize,
    releases: AtomicUsize,
}

impl ScriptedBackend {
    /// Emit `fragments`, then finish
    pub fn new<I, S>(fragments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            fragments: fragments.into_iter().map(Into::into).collect(),
            ending: Ending::Finish,
            fragment_delay: None,
            hold: None,
            inputs: Mutex::new(Vec::new()),
            runs: AtomicUsize::new(0),
            releases: AtomicUsize::new(0),
        }
    }

    /// End every run with an error callback instead of finish
    pub fn failing_with_status(mut self, reason: impl Into<String>) -> Self {
        self.ending = Ending::Status(reason.into());
        self
    }

    /// End every run by returning an error from `run`
    pub fn failing_with_error(mut self, message: impl Into<String>) -> Self {
        self.ending = Ending::Error(message.into());
        self
    }

    /// Sleep between fragments
    pub fn with_fragment_delay(mut self, delay: Duration) -> Self {
        self.fragment_delay = Some(delay);
        self
    }

    /// Block after the last fragment until `hold` yields a value or its
    /// sender is dropped
    pub fn with_hold(mut self, hold: Receiver<()>) -> Self {
        self.hold = Some(hold);
        self
    }

    /// Inputs seen so far, in run order
    pub fn inputs(&self) -> Vec<EngineInput> {
        self.inputs.lock().clone()
    }

    pub fn run_count(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }

    pub fn release_count(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }
}

impl GenerationBackend for ScriptedBackend {
    fn run(&self, input: &EngineInput, sink: &FragmentSink) -> Result<()> {
        if self.releases.load(Ordering::SeqCst) > 0 {
            return Err(GatewayError::EngineReleased);
        }
        self.runs.fetch_add(1, Ordering::SeqCst);
        self.inputs.lock().push(input.clone());

        for fragment in &self.fragments {
            if let Some(delay) = self.fragment_delay {
                std::thread::sleep(delay);
            }
            sink.fragment(fragment.clone());
        }

        if let Some(hold) = &self.hold {
            let _ = hold.recv();
        }

        match &self.ending {
            Ending::Finish => {
                sink.finish();
                Ok(())
            }
            Ending::Status(reason) => {
                sink.fail(reason.clone());
                Ok(())
            }
            Ending::Error(message) => Err(GatewayError::engine(message.clone())),
        }
    }

    fn release(&self) -> Result<()> {
        self.releases.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn name(&self) -> &str {
        "scripted backend"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{self, GenerationEvent};

    #[test]
    fn test_replays_fragments() {
        let backend = ScriptedBackend::new(["a", "b"]);
        let (sink, mut rx) = session::channel();

        backend.run(&"p".into(), &sink).unwrap();

        assert_eq!(rx.try_recv().unwrap(), GenerationEvent::Fragment("a".into()));
        assert_eq!(rx.try_recv().unwrap(), GenerationEvent::Fragment("b".into()));
        assert_eq!(rx.try_recv().unwrap(), GenerationEvent::Finished);
        assert_eq!(backend.run_count(), 1);
        assert_eq!(backend.inputs(), vec![EngineInput::Prompt("p".into())]);
    }

    #[test]
    fn test_run_after_release_fails() {
        let backend = ScriptedBackend::new(["a"]);
        backend.release().unwrap();
        let (sink, _rx) = session::channel();

        assert!(backend.run(&"p".into(), &sink).is_err());
        assert_eq!(backend.run_count(), 0);
    }
}
