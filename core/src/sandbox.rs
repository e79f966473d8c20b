//! The sandbox bridge (§4.5): a duplex channel between the controller and
//! an isolated guest interpreter that runs user code.
//!
//! The guest's own REPL implementation is out of scope; this module owns
//! the framing, the inbox/outbox queues, and the pending-reply table used
//! to intercept controller-originated RPCs by correlation id. The guest
//! itself runs on a dedicated OS thread behind the [`GuestRunner`] trait,
//! mirroring the single-threaded-interpreter-on-its-own-thread pattern used
//! by embedded-isolate runners (e.g. a V8 isolate driven from its own
//! thread rather than the async executor).

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::AtomicI64;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tracing::debug;
use tracing::warn;

use crate::error::AgenticaError;
use crate::error::Result;
use crate::error::SandboxErr;

/// Controller-originated `mid`s are allocated from a negative, monotonically
/// decreasing space so they can never collide with the positive space used
/// by the client/guest (§9 Design Notes).
const FIRST_CONTROLLER_MID: i64 = -256;

/// One self-describing message on the bridge (§4.5 Framing).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum BridgeMessage {
    Request {
        mid: i64,
        fid: u64,
        fmt: String,
        #[serde(default)]
        defs: Value,
        data: Value,
    },
    Response {
        mid: i64,
        #[serde(with = "response_data")]
        data: std::result::Result<Vec<u8>, String>,
    },
    FutureResult {
        fid: String,
        #[serde(with = "future_data")]
        data: std::result::Result<Value, String>,
    },
    /// Opaque client-originated or guest-originated bytes, tagged with the
    /// invocation they belong to so a shared bridge never hands one
    /// invocation's data to another's exchange (§3 "inbox is exclusively
    /// consumed by that task").
    Data {
        iid: String,
        #[serde(with = "serde_bytes_vec")]
        payload: Vec<u8>,
    },
    /// Orderly shutdown sentinel placed on the inbox.
    Quit,
}

mod serde_bytes_vec {
    use serde::Deserializer;
    use serde::Serializer;
    use serde::de::Deserialize;

    pub fn serialize<S: Serializer>(v: &[u8], s: S) -> std::result::Result<S::Ok, S::Error> {
        serde_bytes::serialize(v, s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Vec<u8>, D::Error> {
        serde_bytes::ByteBuf::deserialize(d).map(|b| b.into_vec())
    }
}

mod response_data {
    use serde::Deserialize;
    use serde::Deserializer;
    use serde::Serialize;
    use serde::Serializer;

    #[derive(Serialize, Deserialize)]
    struct Repr {
        ok: bool,
        #[serde(default)]
        bytes: Vec<u8>,
        #[serde(default)]
        error: String,
    }

    pub fn serialize<S: Serializer>(
        v: &std::result::Result<Vec<u8>, String>,
        s: S,
    ) -> std::result::Result<S::Ok, S::Error> {
        let repr = match v {
            Ok(bytes) => Repr {
                ok: true,
                bytes: bytes.clone(),
                error: String::new(),
            },
            Err(e) => Repr {
                ok: false,
                bytes: Vec::new(),
                error: e.clone(),
            },
        };
        repr.serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        d: D,
    ) -> std::result::Result<std::result::Result<Vec<u8>, String>, D::Error> {
        let repr = Repr::deserialize(d)?;
        Ok(if repr.ok { Ok(repr.bytes) } else { Err(repr.error) })
    }
}

mod future_data {
    use super::Value;
    use serde::Deserialize;
    use serde::Deserializer;
    use serde::Serialize;
    use serde::Serializer;

    #[derive(Serialize, Deserialize)]
    struct Repr {
        ok: bool,
        #[serde(default)]
        value: Value,
        #[serde(default)]
        error: String,
    }

    pub fn serialize<S: Serializer>(
        v: &std::result::Result<Value, String>,
        s: S,
    ) -> std::result::Result<S::Ok, S::Error> {
        let repr = match v {
            Ok(value) => Repr {
                ok: true,
                value: value.clone(),
                error: String::new(),
            },
            Err(e) => Repr {
                ok: false,
                value: Value::Null,
                error: e.clone(),
            },
        };
        repr.serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        d: D,
    ) -> std::result::Result<std::result::Result<Value, String>, D::Error> {
        let repr = Repr::deserialize(d)?;
        Ok(if repr.ok { Ok(repr.value) } else { Err(repr.error) })
    }
}

/// A guest interpreter implementation, run on a dedicated OS thread. The
/// guest loop consumes `inbox`, reacts (internals out of scope), and
/// produces `outbox`. The default stub used by tests fulfills `ReplRunCode`
/// requests with a canned evaluation.
pub trait GuestRunner: Send + 'static {
    fn run(self: Box<Self>, inbox: std::sync::mpsc::Receiver<BridgeMessage>, outbox: std::sync::mpsc::Sender<BridgeMessage>);
}

/// Summary returned by `repl_init`/`repl_session_info` (§4.5).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionInfo {
    pub globals_signature: String,
    pub locals_signature: String,
    #[serde(default)]
    pub modules: Vec<String>,
    pub role: String,
    pub return_type: String,
}

/// Result of `repl_run_code` (§4.5).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EvaluationInfo {
    #[serde(default)]
    pub exception_name: Option<String>,
    #[serde(default)]
    pub traceback: Option<String>,
    #[serde(default)]
    pub output: String,
    #[serde(default)]
    pub out_str: String,
    #[serde(default)]
    pub has_return_value: bool,
    #[serde(default)]
    pub has_raised_error: bool,
    #[serde(default)]
    pub has_result: bool,
}

impl EvaluationInfo {
    /// A "future result" has already been dispatched to the client for this
    /// invocation (§4.3 step 6, §4.4 step 6): either a return value or a
    /// raised exception was syntactically produced and forwarded as a
    /// `FutureResult`.
    pub fn produced_future_result(&self) -> bool {
        self.has_result && (self.has_return_value || self.has_raised_error)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ReplRunOptions {
    pub iid: Option<String>,
    pub mode: Option<String>,
}

/// The live bridge: owns the inbox/outbox and the pending-reply table.
pub struct SandboxBridge {
    inbox_tx: std::sync::mpsc::Sender<BridgeMessage>,
    next_controller_mid: AtomicI64,
    pending: Mutex<HashMap<i64, oneshot::Sender<std::result::Result<Vec<u8>, SandboxErr>>>>,
    closed: AtomicBool,
    guest_thread: Mutex<Option<std::thread::JoinHandle<()>>>,
    /// Messages from the guest not addressed to a pending controller
    /// request: forwarded verbatim to the SDK client.
    to_client_rx: Mutex<Option<mpsc::Receiver<BridgeMessage>>>,
}

impl SandboxBridge {
    /// Spawn `guest` on its own OS thread and start the bridge's reader
    /// task, which demultiplexes the guest's outbox between the pending
    /// table (controller-originated replies) and the client forward queue.
    pub fn spawn(guest: Box<dyn GuestRunner>) -> Self {
        let (inbox_tx, inbox_rx) = std::sync::mpsc::channel::<BridgeMessage>();
        let (guest_outbox_tx, guest_outbox_rx) = std::sync::mpsc::channel::<BridgeMessage>();

        #[expect(clippy::expect_used)]
        let guest_thread = std::thread::Builder::new()
            .name("sandbox-guest".into())
            .spawn(move || guest.run(inbox_rx, guest_outbox_tx))
            .expect("spawning the guest OS thread must succeed");

        let pending: std::sync::Arc<Mutex<HashMap<i64, oneshot::Sender<std::result::Result<Vec<u8>, SandboxErr>>>>> =
            std::sync::Arc::new(Mutex::new(HashMap::new()));
        let (to_client_tx, to_client_rx) = mpsc::channel::<BridgeMessage>(256);

        // The guest's outbox is a blocking std channel (the guest thread is
        // not async); bridge it onto the async side with spawn_blocking so
        // the reader can still be cancelled when the bridge closes.
        let pending_for_reader = pending.clone();
        tokio::task::spawn_blocking(move || {
            while let Ok(msg) = guest_outbox_rx.recv() {
                if let BridgeMessage::Response { mid, data } = &msg
                    && *mid < 0
                {
                    let sender = {
                        let mut table = pending_for_reader
                            .lock()
                            .unwrap_or_else(std::sync::PoisonError::into_inner);
                        table.remove(mid)
                    };
                    match sender {
                        Some(sender) => {
                            let result = data.clone().map_err(SandboxErr::Denied);
                            let _ = sender.send(result);
                            continue;
                        }
                        None => {
                            warn!(mid, "no pending controller request for intercepted-looking mid");
                        }
                    }
                }
                if to_client_tx.blocking_send(msg).is_err() {
                    break;
                }
            }
        });

        Self {
            inbox_tx,
            next_controller_mid: AtomicI64::new(FIRST_CONTROLLER_MID),
            pending,
            closed: AtomicBool::new(false),
            guest_thread: Mutex::new(Some(guest_thread)),
            to_client_rx: Mutex::new(Some(to_client_rx)),
        }
    }

    /// Take the receiving half of messages destined for the SDK client.
    /// May only be called once.
    pub fn take_client_receiver(&self) -> Option<mpsc::Receiver<BridgeMessage>> {
        self.to_client_rx.lock().unwrap_or_else(std::sync::PoisonError::into_inner).take()
    }

    /// Forward an opaque client-originated message into the guest's inbox
    /// unchanged (positive `mid`s live in this space).
    pub fn forward_to_guest(&self, msg: BridgeMessage) -> Result<()> {
        self.inbox_tx
            .send(msg)
            .map_err(|_| AgenticaError::Sandbox(SandboxErr::GuestDied))
    }

    /// Issue a controller-originated request and await its intercepted
    /// reply. Allocates the next negative `mid` and registers it in the
    /// pending table before sending.
    async fn request(&self, fid: u64, fmt: &str, data: Value) -> Result<Vec<u8>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(AgenticaError::Sandbox(SandboxErr::Shutdown));
        }
        let mid = self.next_controller_mid.fetch_sub(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        {
            let mut table = self.pending.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            table.insert(mid, tx);
        }
        let msg = BridgeMessage::Request {
            mid,
            fid,
            fmt: fmt.to_string(),
            defs: Value::Null,
            data,
        };
        if self.inbox_tx.send(msg).is_err() {
            let mut table = self.pending.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            table.remove(&mid);
            return Err(AgenticaError::Sandbox(SandboxErr::GuestDied));
        }
        match rx.await {
            Ok(Ok(bytes)) => Ok(bytes),
            Ok(Err(e)) => Err(AgenticaError::Sandbox(e)),
            Err(_) => Err(AgenticaError::Sandbox(SandboxErr::Shutdown)),
        }
    }

    /// Idempotent teardown (§4.5 Teardown): sends `QUIT`, cancels every
    /// pending controller request with a shutdown error, and joins the
    /// guest thread.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.inbox_tx.send(BridgeMessage::Quit);
        let mut table = self.pending.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        for (_, sender) in table.drain() {
            let _ = sender.send(Err(SandboxErr::Shutdown));
        }
        drop(table);
        if let Some(handle) = self
            .guest_thread
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take()
        {
            let _ = handle.join();
        }
    }
}

impl Drop for SandboxBridge {
    fn drop(&mut self) {
        self.close();
    }
}

/// The typed REPL-contract client atop [`SandboxBridge`] (§4.5 REPL contract).
pub struct SandboxHandle {
    bridge: std::sync::Arc<SandboxBridge>,
}

impl SandboxHandle {
    pub fn new(bridge: std::sync::Arc<SandboxBridge>) -> Self {
        Self { bridge }
    }

    pub async fn repl_init(&self, globals: Vec<u8>, locals: Vec<u8>) -> Result<SessionInfo> {
        let data = serde_json::json!({ "globals": globals, "locals": locals });
        let bytes = self.bridge.request(0, "repl_init", data).await?;
        decode(&bytes)
    }

    pub async fn repl_run_code(&self, code: &str, options: ReplRunOptions) -> Result<EvaluationInfo> {
        let data = serde_json::json!({ "code": code, "iid": options.iid, "mode": options.mode });
        let bytes = self.bridge.request(0, "repl_run_code", data).await?;
        decode(&bytes)
    }

    pub async fn repl_call_method(&self, name: &str, args: Value) -> Result<Value> {
        let data = serde_json::json!({ "name": name, "args": args });
        let bytes = self.bridge.request(0, "repl_call_method", data).await?;
        decode(&bytes)
    }

    pub async fn repl_session_info(&self) -> Result<SessionInfo> {
        let bytes = self.bridge.request(0, "repl_session_info", Value::Null).await?;
        decode(&bytes)
    }

    /// Forward an opaque client-originated payload straight into the
    /// guest's inbox, bypassing the pending-reply table entirely, tagged
    /// with the invocation it belongs to (§4.5 "opaque `Data` forwarded
    /// between the SDK and guest").
    pub fn forward_client_data(&self, iid: String, bytes: Vec<u8>) -> Result<()> {
        self.bridge.forward_to_guest(BridgeMessage::Data { iid, payload: bytes })
    }

    pub fn close(&self) {
        self.bridge.close();
    }
}

impl Clone for SandboxHandle {
    fn clone(&self) -> Self {
        Self {
            bridge: self.bridge.clone(),
        }
    }
}

fn decode<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T> {
    serde_json::from_slice(bytes).map_err(AgenticaError::Json)
}

/// A stub guest used by tests and by `no_sandbox` / in-process wiring: it
/// satisfies the REPL contract with canned, deterministic responses rather
/// than running any real interpreter.
pub struct StubGuest;

impl GuestRunner for StubGuest {
    fn run(self: Box<Self>, inbox: std::sync::mpsc::Receiver<BridgeMessage>, outbox: std::sync::mpsc::Sender<BridgeMessage>) {
        for msg in inbox.iter() {
            match msg {
                BridgeMessage::Quit => {
                    debug!("stub guest received QUIT");
                    break;
                }
                BridgeMessage::Request { mid, fmt, data, .. } => {
                    let payload = stub_response(&fmt, &data);
                    let bytes = serde_json::to_vec(&payload).unwrap_or_default();
                    let _ = outbox.send(BridgeMessage::Response { mid, data: Ok(bytes) });
                }
                BridgeMessage::Data { iid, payload } => {
                    let _ = outbox.send(BridgeMessage::Data { iid, payload });
                }
                BridgeMessage::Response { .. } | BridgeMessage::FutureResult { .. } => {}
            }
        }
    }
}

fn stub_response(fmt: &str, data: &Value) -> Value {
    match fmt {
        "repl_init" | "repl_session_info" => serde_json::json!({
            "globals_signature": "",
            "locals_signature": "",
            "modules": [],
            "role": "assistant",
            "return_type": "str",
        }),
        "repl_run_code" => serde_json::json!({
            "exception_name": null,
            "traceback": null,
            "output": "",
            "out_str": "",
            "has_return_value": false,
            "has_raised_error": false,
            "has_result": false,
        }),
        "repl_call_method" => data.clone(),
        other => {
            warn!(fmt = other, "stub guest received unknown request format");
            Value::Null
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    #[tokio::test]
    async fn repl_run_code_round_trips_through_stub_guest() {
        let bridge = std::sync::Arc::new(SandboxBridge::spawn(Box::new(StubGuest)));
        let handle = SandboxHandle::new(bridge);
        let eval = handle
            .repl_run_code("1 + 1", ReplRunOptions::default())
            .await
            .expect("stub guest replies");
        assert!(!eval.has_result);
        handle.close();
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let bridge = std::sync::Arc::new(SandboxBridge::spawn(Box::new(StubGuest)));
        bridge.close();
        bridge.close();
    }

    #[tokio::test]
    async fn controller_mids_are_negative_and_decreasing() {
        let bridge = SandboxBridge::spawn(Box::new(StubGuest));
        let first = bridge.next_controller_mid.load(Ordering::SeqCst);
        assert_eq!(first, FIRST_CONTROLLER_MID);
        let _ = bridge.request(0, "repl_session_info", Value::Null).await;
        let second = bridge.next_controller_mid.load(Ordering::SeqCst);
        assert!(second < first);
        bridge.close();
    }
}
