//! The multiplexer (§4.2): routes framed client messages into concurrent
//! per-invocation tasks, and fans server messages back out over one
//! transport-writer queue.

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use agentica_protocol::ErrorName;
use agentica_protocol::InvocationEventKind;
use agentica_protocol::MultiplexClientMessage;
use agentica_protocol::MultiplexServerMessage;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::error::AgenticaError;
use crate::notifier::LogEvent;
use crate::notifier::SharedNotifier;
use crate::registry::Registry;

/// Bounded best-effort wait for invocation tasks to unwind on shutdown
/// before the connection is torn down regardless (§4.2 Termination).
const SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

struct InvocationHandle {
    cancel: CancellationToken,
    task: tokio::task::JoinHandle<()>,
}

struct Inner {
    registry: Registry,
    server_tx: mpsc::Sender<Vec<u8>>,
    invocations: StdMutex<HashMap<String, InvocationHandle>>,
    agent_contexts: StdMutex<HashSet<String>>,
    notifier: SharedNotifier,
}

/// Owns per-connection invocation state. One instance per accepted socket
/// (§3 "Connection context").
#[derive(Clone)]
pub struct Multiplexer {
    inner: Arc<Inner>,
}

impl Multiplexer {
    pub fn new(registry: Registry, server_tx: mpsc::Sender<Vec<u8>>, notifier: SharedNotifier) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry,
                server_tx,
                invocations: StdMutex::new(HashMap::new()),
                agent_contexts: StdMutex::new(HashSet::new()),
                notifier,
            }),
        }
    }

    pub async fn handle_client_message(&self, msg: MultiplexClientMessage) {
        match msg {
            MultiplexClientMessage::Invoke {
                match_id,
                uid,
                warp_locals_payload,
                prompt,
                streaming,
                parent_uid: _,
                parent_iid: _,
            } => {
                self.handle_invoke(match_id, uid, warp_locals_payload, prompt, streaming).await;
            }
            MultiplexClientMessage::Cancel { uid, iid } => {
                self.handle_cancel(uid, iid).await;
            }
            MultiplexClientMessage::Data { uid, iid, payload } => {
                self.handle_data(uid, iid, payload).await;
            }
        }
    }

    async fn handle_invoke(&self, match_id: String, uid: String, warp_locals_payload: Vec<u8>, prompt: Option<String>, streaming: bool) {
        let Some(agent) = self.inner.registry.get_agent(&uid) else {
            self.send_error(None, match_id, ErrorName::MalformedInvokeMessageError, None).await;
            return;
        };

        let Some(permit) = self.inner.registry.admit_invocation() else {
            self.send_error(Some(uid), match_id, ErrorName::TooManyInvocationsError, None).await;
            return;
        };

        self.ensure_agent_context(&uid);

        let iid = uuid::Uuid::new_v4().to_string();
        let cancel = CancellationToken::new();

        self.send_server_message(MultiplexServerMessage::NewIid {
            match_id,
            uid: uid.clone(),
            iid: iid.clone(),
        })
        .await;

        self.inner.registry.track_invocation(&uid, &iid, cancel.clone());

        let inner = self.inner.clone();
        let task_cancel = cancel.clone();
        let task_iid = iid.clone();
        let task_uid = uid.clone();
        let task = tokio::spawn(async move {
            inner
                .notifier
                .send_log(LogEvent::Enter {
                    uid: task_uid.clone(),
                    iid: task_iid.clone(),
                })
                .await;
            send_invocation_event(&inner, &task_uid, &task_iid, InvocationEventKind::Enter).await;

            let outcome = tokio::select! {
                biased;
                _ = task_cancel.cancelled() => Err(AgenticaError::Sandbox(crate::error::SandboxErr::Shutdown)),
                res = agent.run(task_iid.clone(), warp_locals_payload, prompt, Some(streaming)) => res,
            };

            if let Err(e) = &outcome {
                if !e.is_request_too_large() {
                    inner
                        .notifier
                        .send_log(LogEvent::Exception {
                            uid: task_uid.clone(),
                            iid: task_iid.clone(),
                            message: e.to_string(),
                        })
                        .await;
                }
                send_error_message(&inner, Some(task_uid.clone()), task_iid.clone(), e.error_name(), Some(e.to_string())).await;
            }

            inner
                .notifier
                .send_log(LogEvent::Exit {
                    uid: task_uid.clone(),
                    iid: task_iid.clone(),
                })
                .await;
            send_invocation_event(&inner, &task_uid, &task_iid, InvocationEventKind::Exit).await;

            inner.invocations.lock().unwrap_or_else(std::sync::PoisonError::into_inner).remove(&task_iid);
            inner.registry.untrack_invocation(&task_uid, &task_iid);
            drop(permit);
        });

        self.inner
            .invocations
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(iid, InvocationHandle { cancel, task });
    }

    async fn handle_cancel(&self, uid: String, iid: String) {
        let handle = self
            .inner
            .invocations
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(&iid);
        let Some(handle) = handle else {
            self.send_error(Some(uid), iid, ErrorName::NotRunningError, None).await;
            return;
        };
        handle.cancel.cancel();
        self.inner.registry.untrack_invocation(&uid, &iid);
    }

    async fn handle_data(&self, uid: String, iid: String, payload: Vec<u8>) {
        let exists = self
            .inner
            .invocations
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .contains_key(&iid);
        if !exists {
            self.send_error(Some(uid.clone()), iid, ErrorName::NotRunningError, None).await;
            return;
        }
        let Some(agent) = self.inner.registry.get_agent(&uid) else {
            self.send_error(Some(uid), iid, ErrorName::NotRunningError, None).await;
            return;
        };
        if let Err(e) = agent.forward_client_data(iid.clone(), payload) {
            warn!(uid, iid, error = %e, "failed to forward client data into sandbox");
        }
    }

    fn ensure_agent_context(&self, uid: &str) {
        let mut contexts = self.inner.agent_contexts.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if contexts.insert(uid.to_string()) {
            debug!(uid, "agent context created on first invoke");
        }
    }

    async fn send_error(&self, uid: Option<String>, iid: String, name: ErrorName, message: Option<String>) {
        send_error_message(&self.inner, uid, iid, name, message).await;
    }

    async fn send_server_message(&self, msg: MultiplexServerMessage) {
        send_server_message(&self.inner, msg).await;
    }

    /// Termination (§4.2): cancel every running invocation, await them on a
    /// bounded best-effort basis, then clear all per-connection state.
    pub async fn shutdown(&self) {
        let handles: Vec<InvocationHandle> = {
            let mut invocations = self.inner.invocations.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            invocations.drain().map(|(_, handle)| handle).collect()
        };
        for handle in &handles {
            handle.cancel.cancel();
        }
        let join_all = futures::future::join_all(handles.into_iter().map(|h| h.task));
        if tokio::time::timeout(SHUTDOWN_DRAIN_TIMEOUT, join_all).await.is_err() {
            warn!("multiplexer shutdown timed out waiting for invocation tasks to drain");
        }
        self.inner.agent_contexts.lock().unwrap_or_else(std::sync::PoisonError::into_inner).clear();
        info!("multiplexer stopped");
    }
}

async fn send_invocation_event(inner: &Arc<Inner>, uid: &str, iid: &str, event: InvocationEventKind) {
    send_server_message(
        inner,
        MultiplexServerMessage::InvocationEvent {
            uid: uid.to_string(),
            iid: iid.to_string(),
            event,
        },
    )
    .await;
}

async fn send_error_message(inner: &Arc<Inner>, uid: Option<String>, iid: String, name: ErrorName, message: Option<String>) {
    send_server_message(inner, MultiplexServerMessage::Error { uid, iid, name, message }).await;
}

async fn send_server_message(inner: &Arc<Inner>, msg: MultiplexServerMessage) {
    match serde_json::to_vec(&msg) {
        Ok(bytes) => {
            if inner.server_tx.send(bytes).await.is_err() {
                warn!("transport writer queue closed, dropping server message");
            }
        }
        Err(e) => warn!(error = %e, "failed to serialize server message"),
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::config::ServerConfig;

    fn test_multiplexer() -> (Multiplexer, mpsc::Receiver<Vec<u8>>, Registry) {
        let registry = Registry::new(ServerConfig::default(), crate::notifier::tracing_notifier());
        let (tx, rx) = mpsc::channel(16);
        let mux = Multiplexer::new(registry.clone(), tx, crate::notifier::tracing_notifier());
        (mux, rx, registry)
    }

    #[tokio::test]
    async fn invoke_with_unknown_uid_emits_malformed_error_and_no_new_iid() {
        let (mux, mut rx, _registry) = test_multiplexer();
        mux.handle_client_message(MultiplexClientMessage::Invoke {
            match_id: "m1".into(),
            uid: "nope".into(),
            warp_locals_payload: Vec::new(),
            prompt: None,
            streaming: false,
            parent_uid: None,
            parent_iid: None,
        })
        .await;

        let bytes = rx.recv().await.expect("one message sent");
        let msg: MultiplexServerMessage = serde_json::from_slice(&bytes).expect("valid json");
        match msg {
            MultiplexServerMessage::Error { iid, name, .. } => {
                assert_eq!(iid, "m1");
                assert_eq!(name, ErrorName::MalformedInvokeMessageError);
            }
            other => panic!("unexpected message: {other:?}"),
        }
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn cancel_of_unknown_iid_emits_not_running_error() {
        let (mux, mut rx, _registry) = test_multiplexer();
        mux.handle_client_message(MultiplexClientMessage::Cancel {
            uid: "u".into(),
            iid: "gone".into(),
        })
        .await;

        let bytes = rx.recv().await.expect("one message sent");
        let msg: MultiplexServerMessage = serde_json::from_slice(&bytes).expect("valid json");
        assert!(matches!(
            msg,
            MultiplexServerMessage::Error { name: ErrorName::NotRunningError, .. }
        ));
    }

    #[tokio::test]
    async fn shutdown_with_no_invocations_completes_immediately() {
        let (mux, _rx, _registry) = test_multiplexer();
        mux.shutdown().await;
    }
}
