use serde_json::{json, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Breakpoint,
    Pause,
}

impl StopReason {
    pub fn as_str(self) -> &'static str {
        match self {
            StopReason::Breakpoint => "breakpoint",
            StopReason::Pause => "pause",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadReason {
    Started,
    Exited,
}

impl ThreadReason {
    pub fn as_str(self) -> &'static str {
        match self {
            ThreadReason::Started => "started",
            ThreadReason::Exited => "exited",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputCategory {
    Console,
    Stderr,
}

impl OutputCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            OutputCategory::Console => "console",
            OutputCategory::Stderr => "stderr",
        }
    }
}

/// Notification produced by a session, in the order it must reach the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Stopped {
        thread_id: i64,
        reason: StopReason,
        all_threads_stopped: bool,
    },
    Continued {
        thread_id: i64,
        all_threads_continued: bool,
    },
    Thread {
        thread_id: i64,
        reason: ThreadReason,
    },
    Output {
        category: OutputCategory,
        output: String,
    },
}

impl SessionEvent {
    pub fn started(thread_id: i64) -> Self {
        SessionEvent::Thread {
            thread_id,
            reason: ThreadReason::Started,
        }
    }

    pub fn exited(thread_id: i64) -> Self {
        SessionEvent::Thread {
            thread_id,
            reason: ThreadReason::Exited,
        }
    }

    /// DAP event name and body.
    pub fn to_dap(&self) -> (&'static str, Value) {
        match self {
            SessionEvent::Stopped {
                thread_id,
                reason,
                all_threads_stopped,
            } => (
                "stopped",
                json!({
                    "reason": reason.as_str(),
                    "threadId": thread_id,
                    "allThreadsStopped": all_threads_stopped,
                }),
            ),
            SessionEvent::Continued {
                thread_id,
                all_threads_continued,
            } => (
                "continued",
                json!({
                    "threadId": thread_id,
                    "allThreadsContinued": all_threads_continued,
                }),
            ),
            SessionEvent::Thread { thread_id, reason } => (
                "thread",
                json!({ "reason": reason.as_str(), "threadId": thread_id }),
            ),
            SessionEvent::Output { category, output } => (
                "output",
                json!({ "category": category.as_str(), "output": output }),
            ),
        }
    }
}
