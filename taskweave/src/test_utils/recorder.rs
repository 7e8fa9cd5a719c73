use crate::task::{Run, TaskContext, ThreadType};
use parking_lot::Mutex;
use std::borrow::Cow;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Event {
    Run(&'static str),
    Cancel(&'static str),
}

/// Shared log of the task callbacks, in the order they were invoked.
#[derive(Debug, Clone, Default)]
pub(crate) struct Recorder {
    events: Arc<Mutex<Vec<Event>>>,
}

impl Recorder {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record(&self, event: Event) {
        self.events.lock().push(event);
    }

    pub(crate) fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    pub(crate) fn ran(&self, name: &str) -> bool {
        self.events
            .lock()
            .iter()
            .any(|e| matches!(e, Event::Run(n) if *n == name))
    }

    pub(crate) fn canceled(&self, name: &str) -> bool {
        self.events
            .lock()
            .iter()
            .any(|e| matches!(e, Event::Cancel(n) if *n == name))
    }

    pub(crate) fn position(&self, event: &Event) -> Option<usize> {
        self.events.lock().iter().position(|e| e == event)
    }

    /// A task recording its callbacks here.
    pub(crate) fn task(&self, name: &'static str) -> RecordingTask {
        RecordingTask {
            name,
            thread_type: ThreadType::Worker,
            recorder: self.clone(),
            fail: false,
        }
    }
}

pub(crate) struct RecordingTask {
    name: &'static str,
    thread_type: ThreadType,
    recorder: Recorder,
    fail: bool,
}

impl RecordingTask {
    pub(crate) fn on(mut self, thread_type: ThreadType) -> Self {
        self.thread_type = thread_type;
        self
    }

    /// Ends `Failed` instead of `Completed`.
    pub(crate) fn failing(mut self) -> Self {
        self.fail = true;
        self
    }
}

impl Run for RecordingTask {
    fn run(&mut self, cx: &mut TaskContext<'_>) {
        self.recorder.record(Event::Run(self.name));

        if self.fail {
            cx.fail();
        }
    }

    fn on_cancel(&mut self) {
        self.recorder.record(Event::Cancel(self.name));
    }

    fn name(&self) -> Cow<'static, str> {
        Cow::Borrowed(self.name)
    }

    fn thread_type(&self) -> ThreadType {
        self.thread_type
    }
}
