//! Session/Agent registry (§4.7): per-client session tracking, agent
//! creation, admission control, and deterministic teardown.

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use agentica_protocol::CreateAgentRequest;
use agentica_protocol::MagicProtocol;
use agentica_protocol::VersionStatus;
use agentica_protocol::policy_for;
use agentica_protocol::version::check_sdk_version;
use agentica_protocol::version::format_unsupported_message;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::agent::Agent;
use crate::agent::TokenBudget;
use crate::config::ServerConfig;
use crate::error::AgenticaError;
use crate::error::Result;
use crate::inference::InferenceEndpoint;
use crate::model::ModelSpec;
use crate::model::ProviderInfo;
use crate::notifier::LogEvent;
use crate::notifier::SharedNotifier;
use crate::sandbox::GuestRunner;
use crate::sandbox::SandboxBridge;
use crate::sandbox::SandboxHandle;

/// `{cid, uids, created_at}` (§3 Data model).
pub struct Session {
    pub cid: String,
    uids: HashSet<String>,
}

impl Session {
    fn new(cid: String) -> Self {
        Self {
            cid,
            uids: HashSet::new(),
        }
    }

    pub fn add_agent(&mut self, uid: String) {
        self.uids.insert(uid);
    }

    pub fn remove_agent(&mut self, uid: &str) {
        self.uids.remove(uid);
    }

    pub fn is_empty(&self) -> bool {
        self.uids.is_empty()
    }

    pub fn uids(&self) -> impl Iterator<Item = &String> {
        self.uids.iter()
    }
}

/// Bounded admission counter (§4.7, §8, §9 Open Questions): `admit()`
/// increments iff under the cap; `release()` must be called **iff** the
/// matching `admit()` returned `true` — see DESIGN.md for why this is
/// enforced at the call site with a `Permit` guard rather than trusted to
/// callers.
struct Admission {
    max_concurrent_invocations: usize,
    concurrent_invocations: usize,
}

impl Admission {
    fn admit(&mut self) -> bool {
        if self.concurrent_invocations < self.max_concurrent_invocations {
            self.concurrent_invocations += 1;
            debug!(
                concurrent_invocations = self.concurrent_invocations,
                max = self.max_concurrent_invocations,
                "admission granted"
            );
            true
        } else {
            false
        }
    }

    fn release(&mut self) {
        if self.concurrent_invocations == 0 {
            error!("admission release called with concurrent_invocations already at zero");
            return;
        }
        self.concurrent_invocations -= 1;
        debug!(concurrent_invocations = self.concurrent_invocations, "admission released");
    }
}

/// An RAII guard proving an `admit()` call succeeded. Dropping it releases
/// admission capacity exactly once, which is how this implementation
/// resolves the historical "release called even when admit failed" bug
/// noted in the design notes: there is no code path that can construct a
/// `Permit` without a successful `admit()`, and no way to release without
/// dropping one.
pub struct Permit {
    registry: Arc<RegistryInner>,
}

impl Drop for Permit {
    fn drop(&mut self) {
        self.registry
            .admission
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .release();
    }
}

struct RegistryInner {
    sessions: StdMutex<HashMap<String, Session>>,
    agents: StdMutex<HashMap<String, Arc<Agent>>>,
    uid_to_cid: StdMutex<HashMap<String, String>>,
    admission: StdMutex<Admission>,
    /// Cancellation handles for each agent's currently running invocations,
    /// keyed by `uid` then `iid`, so `destroy_agent` can reach whatever
    /// multiplexer started them without the registry holding a reference
    /// back to it (§4.7 "destroy_agent ... cancels any running invocation").
    invocation_cancels: StdMutex<HashMap<String, HashMap<String, CancellationToken>>>,
    providers: HashMap<String, ProviderInfo>,
    notifier: SharedNotifier,
    config: ServerConfig,
}

/// The registry is the single owner of Sessions and Agents (§3 "Ownership
/// summary").
#[derive(Clone)]
pub struct Registry {
    inner: Arc<RegistryInner>,
}

impl Registry {
    pub fn new(config: ServerConfig, notifier: SharedNotifier) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                sessions: StdMutex::new(HashMap::new()),
                agents: StdMutex::new(HashMap::new()),
                uid_to_cid: StdMutex::new(HashMap::new()),
                admission: StdMutex::new(Admission {
                    max_concurrent_invocations: config.max_concurrent_invocations,
                    concurrent_invocations: 0,
                }),
                invocation_cancels: StdMutex::new(HashMap::new()),
                providers: crate::model::built_in_providers(),
                notifier,
                config,
            }),
        }
    }

    /// Idempotent: registering an already-registered `cid` is a no-op.
    pub fn register_session(&self, cid: &str) {
        let mut sessions = self.lock_sessions();
        sessions.entry(cid.to_string()).or_insert_with(|| Session::new(cid.to_string()));
        info!(cid, "session registered");
    }

    /// Destroys every agent in the session, then removes the session.
    /// Idempotent: deregistering an unknown `cid` is a no-op.
    pub fn deregister_session(&self, cid: &str) {
        let uids: Vec<String> = {
            let sessions = self.lock_sessions();
            match sessions.get(cid) {
                Some(session) => session.uids().cloned().collect(),
                None => return,
            }
        };
        for uid in uids {
            self.destroy_agent(&uid);
        }
        self.lock_sessions().remove(cid);
        info!(cid, "session deregistered");
    }

    pub fn session_registered(&self, cid: &str) -> bool {
        self.lock_sessions().contains_key(cid)
    }

    /// Validates the model identifier, constructs an `Agent`, and
    /// associates it to the session. Returns the fresh `uid`.
    pub async fn create_agent(&self, request: CreateAgentRequest, cid: &str) -> Result<String> {
        if !self.session_registered(cid) {
            return Err(AgenticaError::Validation(format!("session {cid} was never registered")));
        }

        let protocol = MagicProtocol::parse(request.protocol.as_deref())
            .map_err(|e| AgenticaError::Validation(e.to_string()))?;
        let policy = policy_for(protocol.sdk);
        match check_sdk_version(
            &policy,
            &protocol.version,
            crate::config::version_check_disabled(),
            crate::config::is_local_mode(),
        ) {
            VersionStatus::Unsupported => {
                return Err(AgenticaError::UnsupportedVersion(format_unsupported_message(
                    protocol.sdk,
                    &protocol.version,
                    &policy,
                )));
            }
            VersionStatus::Deprecated => {
                warn!(sdk = %protocol.sdk, version = %protocol.version, "deprecated sdk version, proceeding");
            }
            VersionStatus::Ok => {}
        }

        let model_spec = ModelSpec::parse(&request.model, &self.inner.providers)?;
        let provider = self
            .inner
            .providers
            .get(&model_spec.provider)
            .ok_or_else(|| AgenticaError::BadModel(request.model.clone()))?;
        let token = provider
            .api_key()
            .ok_or_else(|| AgenticaError::Unauthorized)?;

        if request.json {
            return Err(AgenticaError::Validation("JSON-mode agents are not supported".into()));
        }

        let base_url = self
            .inner
            .config
            .inference_endpoint
            .clone()
            .unwrap_or_else(|| provider.base_url.clone());
        let inference = InferenceEndpoint::new(reqwest::Client::new(), base_url, token)
            .with_retry_policy(self.inner.config.max_retries, self.inner.config.backoff_base_ms);

        let sandbox = self.spawn_sandbox();
        let uid = uuid::Uuid::new_v4().to_string();

        let agent = Agent::new(
            uid.clone(),
            cid.to_string(),
            model_spec,
            request.system,
            request.doc,
            request.warp_globals_payload.into_vec(),
            TokenBudget {
                max_tokens_per_invocation: request.max_tokens_per_invocation,
                max_tokens_per_round: request.max_tokens_per_round,
                max_rounds: request.max_rounds,
            },
            request.streaming,
            sandbox,
            inference,
            self.inner.notifier.clone(),
        );

        self.inner.agents.lock().unwrap_or_else(std::sync::PoisonError::into_inner).insert(uid.clone(), Arc::new(agent));
        self.inner.uid_to_cid.lock().unwrap_or_else(std::sync::PoisonError::into_inner).insert(uid.clone(), cid.to_string());
        #[expect(clippy::expect_used)]
        self.lock_sessions()
            .get_mut(cid)
            .expect("session existence checked above")
            .add_agent(uid.clone());

        self.inner
            .notifier
            .send_log(LogEvent::CreateAgent {
                uid: uid.clone(),
                model: request.model,
            })
            .await;

        Ok(uid)
    }

    fn spawn_sandbox(&self) -> SandboxHandle {
        let guest: Box<dyn GuestRunner> = Box::new(crate::sandbox::StubGuest);
        let bridge = Arc::new(SandboxBridge::spawn(guest));
        SandboxHandle::new(bridge)
    }

    pub fn get_agent(&self, uid: &str) -> Option<Arc<Agent>> {
        self.inner.agents.lock().unwrap_or_else(std::sync::PoisonError::into_inner).get(uid).cloned()
    }

    /// Idempotent: destroying an unknown or already-destroyed `uid` is a
    /// no-op.
    pub fn destroy_agent(&self, uid: &str) {
        let agent = self
            .inner
            .agents
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(uid);
        let Some(agent) = agent else { return };
        self.cancel_invocations(uid);
        agent.close();
        if let Some(cid) = self.inner.uid_to_cid.lock().unwrap_or_else(std::sync::PoisonError::into_inner).remove(uid)
            && let Some(session) = self.lock_sessions().get_mut(&cid)
        {
            session.remove_agent(uid);
        }
        info!(uid, "agent destroyed");
    }

    /// Record a running invocation's cancellation handle so a later
    /// `destroy_agent(uid)` can reach it, whichever multiplexer started it
    /// (§4.7, §4.2 "Cancel removes the inbox").
    pub fn track_invocation(&self, uid: &str, iid: &str, cancel: CancellationToken) {
        self.inner
            .invocation_cancels
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .entry(uid.to_string())
            .or_default()
            .insert(iid.to_string(), cancel);
    }

    /// Stop tracking an invocation once it has finished or been cancelled
    /// directly (e.g. a client `Cancel` message already removed it from the
    /// multiplexer's own table).
    pub fn untrack_invocation(&self, uid: &str, iid: &str) {
        let mut cancels = self
            .inner
            .invocation_cancels
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(per_uid) = cancels.get_mut(uid) {
            per_uid.remove(iid);
            if per_uid.is_empty() {
                cancels.remove(uid);
            }
        }
    }

    /// Cancel every invocation currently tracked for `uid`.
    fn cancel_invocations(&self, uid: &str) {
        let per_uid = self
            .inner
            .invocation_cancels
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(uid);
        if let Some(per_uid) = per_uid {
            for (iid, cancel) in per_uid {
                debug!(uid, iid, "cancelling invocation as part of agent destruction");
                cancel.cancel();
            }
        }
    }

    /// Returns a [`Permit`] on success; `None` means the cap was reached.
    pub fn admit_invocation(&self) -> Option<Permit> {
        let granted = self
            .inner
            .admission
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .admit();
        if granted {
            Some(Permit {
                registry: self.inner.clone(),
            })
        } else {
            warn!("admission refused: at max_concurrent_invocations");
            None
        }
    }

    fn lock_sessions(&self) -> std::sync::MutexGuard<'_, HashMap<String, Session>> {
        self.inner.sessions.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}
