//! Structured logging hooks for agent lifecycle and execution events.
//!
//! OTel spans and Prometheus metrics are out of scope; what remains is the
//! ambient, always-present logging layer every invocation goes through,
//! built on `tracing` the way the rest of this crate is.

use std::sync::Arc;

use tracing::debug;
use tracing::info;
use tracing::warn;

/// One reportable event in an invocation's lifecycle or a code block's
/// execution within it.
#[derive(Debug, Clone)]
pub enum LogEvent {
    CreateAgent {
        uid: String,
        model: String,
    },
    Enter {
        uid: String,
        iid: String,
    },
    Exit {
        uid: String,
        iid: String,
    },
    Exception {
        uid: String,
        iid: String,
        message: String,
    },
    CodeBlock {
        iid: String,
        exec_id: String,
        code: String,
    },
    ExecuteResult {
        iid: String,
        exec_id: String,
        summary: String,
    },
    StreamPartial {
        iid: String,
        content: String,
    },
}

/// Receives [`LogEvent`]s from the interaction loop. A thin seam so the
/// default `tracing` sink can be swapped for a test double.
#[async_trait::async_trait]
pub trait Notifier: Send + Sync {
    async fn send_log(&self, event: LogEvent);
}

pub type SharedNotifier = Arc<dyn Notifier>;

/// The default notifier: every event becomes one structured `tracing` call
/// at the level appropriate to its severity.
pub struct TracingNotifier;

#[async_trait::async_trait]
impl Notifier for TracingNotifier {
    async fn send_log(&self, event: LogEvent) {
        match event {
            LogEvent::CreateAgent { uid, model } => {
                info!(uid, model, "agent created");
            }
            LogEvent::Enter { uid, iid } => {
                debug!(uid, iid, "invocation entered");
            }
            LogEvent::Exit { uid, iid } => {
                debug!(uid, iid, "invocation exited");
            }
            LogEvent::Exception { uid, iid, message } => {
                warn!(uid, iid, message, "invocation raised an exception");
            }
            LogEvent::CodeBlock { iid, exec_id, code } => {
                debug!(iid, exec_id, bytes = code.len(), "executing code block");
            }
            LogEvent::ExecuteResult { iid, exec_id, summary } => {
                debug!(iid, exec_id, summary, "code block finished");
            }
            LogEvent::StreamPartial { iid, content } => {
                debug!(iid, bytes = content.len(), "stream partial received");
            }
        }
    }
}

pub fn tracing_notifier() -> SharedNotifier {
    Arc::new(TracingNotifier)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use std::sync::Mutex;

    struct RecordingNotifier {
        events: Mutex<Vec<LogEvent>>,
    }

    #[async_trait::async_trait]
    impl Notifier for RecordingNotifier {
        async fn send_log(&self, event: LogEvent) {
            self.events.lock().unwrap_or_else(std::sync::PoisonError::into_inner).push(event);
        }
    }

    #[tokio::test]
    async fn tracing_notifier_handles_every_variant_without_panicking() {
        let notifier = tracing_notifier();
        notifier
            .send_log(LogEvent::CreateAgent {
                uid: "u1".into(),
                model: "openai:gpt-4.1".into(),
            })
            .await;
        notifier
            .send_log(LogEvent::StreamPartial {
                iid: "i1".into(),
                content: "partial".into(),
            })
            .await;
    }

    #[tokio::test]
    async fn recording_notifier_captures_events_in_order() {
        let notifier = RecordingNotifier {
            events: Mutex::new(Vec::new()),
        };
        notifier
            .send_log(LogEvent::Enter {
                uid: "u1".into(),
                iid: "i1".into(),
            })
            .await;
        notifier
            .send_log(LogEvent::Exit {
                uid: "u1".into(),
                iid: "i1".into(),
            })
            .await;
        let events = notifier.events.into_inner().unwrap_or_else(std::sync::PoisonError::into_inner);
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], LogEvent::Enter { .. }));
        assert!(matches!(events[1], LogEvent::Exit { .. }));
    }
}
