//! The "history sequencer": a composable effect-description abstraction
//! that decouples the agent's interaction *policy* from how its effects are
//! actually executed (§4.4, §9 Design Notes).
//!
//! A [`Step`] is either a final value (`Pure`) or a request to perform one
//! [`Effect`] followed by a continuation that resumes with the effect's
//! result. [`Context::run`] is the single place that walks a `Step` against
//! mutable agent state; the policy itself (see `agent::interaction_policy`)
//! never touches I/O directly.

use agentica_protocol::Delta;
use agentica_protocol::Role;
use serde_json::Value;

use crate::error::AgenticaError;
use crate::error::Result;
use crate::inference::CompletionRequest;
use crate::inference::InferenceEndpoint;
use crate::notifier::LogEvent;
use crate::notifier::SharedNotifier;
use crate::sandbox::EvaluationInfo;
use crate::sandbox::ReplRunOptions;
use crate::sandbox::SandboxHandle;
use crate::sandbox::SessionInfo;

/// The closed set of effects an interaction policy can request.
pub enum Effect {
    Insert { content: String, role: Role },
    InsertDelta(Delta),
    Capture { name: String, value: Value },
    Retrieve { name: String },
    ReplInit { globals: Vec<u8>, locals: Vec<u8> },
    ReplRunCode { code: String, options: ReplRunOptions },
    ReplCallMethod { name: String, args: Value },
    ReplSessionInfo,
    ModelInference { request: CompletionRequest },
    SendLog(LogEvent),
    LogCodeBlock(String),
    LogExecuteResult { exec_id: String, summary: String },
}

/// The value produced by performing an [`Effect`].
#[derive(Debug, Clone)]
pub enum EffectResult {
    Unit,
    Value(Value),
    SessionInfo(SessionInfo),
    Evaluation(EvaluationInfo),
    Delta(Delta),
    ExecId(String),
}

impl EffectResult {
    pub fn into_delta(self) -> Option<Delta> {
        match self {
            EffectResult::Delta(d) => Some(d),
            _ => None,
        }
    }

    pub fn into_evaluation(self) -> Option<EvaluationInfo> {
        match self {
            EffectResult::Evaluation(e) => Some(e),
            _ => None,
        }
    }

    pub fn into_exec_id(self) -> Option<String> {
        match self {
            EffectResult::ExecId(id) => Some(id),
            _ => None,
        }
    }

    pub fn into_session_info(self) -> Option<SessionInfo> {
        match self {
            EffectResult::SessionInfo(info) => Some(info),
            _ => None,
        }
    }
}

type Continuation = Box<dyn FnOnce(EffectResult) -> Step + Send>;

/// A description of an effectful computation: either a final value, or one
/// more effect to perform before continuing.
pub enum Step {
    Pure(EffectResult),
    Do(Effect, Continuation),
}

impl Step {
    pub fn pure(value: EffectResult) -> Self {
        Step::Pure(value)
    }

    pub fn done() -> Self {
        Step::Pure(EffectResult::Unit)
    }

    pub fn then(effect: Effect, cont: impl FnOnce(EffectResult) -> Step + Send + 'static) -> Self {
        Step::Do(effect, Box::new(cont))
    }
}

/// Mutable state threaded through a single sequencer run: the agent's
/// sandbox handle, inference client, history, and notifier bindings.
pub struct Context {
    pub sandbox: SandboxHandle,
    pub inference: InferenceEndpoint,
    pub history: Vec<Delta>,
    pub notifier: SharedNotifier,
    pub iid: String,
    pub scratch: std::collections::HashMap<String, Value>,
}

impl Context {
    /// Trampoline the description to completion, performing each effect in
    /// turn. Implemented as an explicit loop (not recursion) so policies
    /// with long effect chains never grow the call stack (§9 Design Notes:
    /// "avoid coroutines for composition; use them only at the actual I/O
    /// leaves").
    pub async fn run(&mut self, mut step: Step) -> Result<EffectResult> {
        loop {
            match step {
                Step::Pure(value) => return Ok(value),
                Step::Do(effect, cont) => {
                    let result = self.perform(effect).await?;
                    step = cont(result);
                }
            }
        }
    }

    /// Perform a single effect without building a multi-step description.
    /// Control flow *between* effects is ordinary `async`/`await` in the
    /// interaction policy (see `agent::run_interaction`); `Step`/`Do` chains
    /// are reserved for strategies' pure, testable insert sequences (§9:
    /// "avoid coroutines for composition; use them only at the actual I/O
    /// leaves" — `async fn` already is Rust's composition mechanism, so the
    /// sequencer need not duplicate it).
    pub async fn run_one(&mut self, effect: Effect) -> Result<EffectResult> {
        self.run(Step::then(effect, Step::pure)).await
    }

    async fn perform(&mut self, effect: Effect) -> Result<EffectResult> {
        match effect {
            Effect::Insert { content, role } => {
                self.history.push(Delta::new(fresh_delta_id(), role).with_content(content));
                Ok(EffectResult::Unit)
            }
            Effect::InsertDelta(delta) => {
                self.history.push(delta);
                Ok(EffectResult::Unit)
            }
            Effect::Capture { name, value } => {
                self.scratch.insert(name, value);
                Ok(EffectResult::Unit)
            }
            Effect::Retrieve { name } => {
                Ok(EffectResult::Value(self.scratch.get(&name).cloned().unwrap_or(Value::Null)))
            }
            Effect::ReplInit { globals, locals } => {
                let info = self.sandbox.repl_init(globals, locals).await?;
                Ok(EffectResult::SessionInfo(info))
            }
            Effect::ReplRunCode { code, options } => {
                let eval = self.sandbox.repl_run_code(&code, options).await?;
                Ok(EffectResult::Evaluation(eval))
            }
            Effect::ReplCallMethod { name, args } => {
                let value = self.sandbox.repl_call_method(&name, args).await?;
                Ok(EffectResult::Value(value))
            }
            Effect::ReplSessionInfo => {
                let info = self.sandbox.repl_session_info().await?;
                Ok(EffectResult::SessionInfo(info))
            }
            Effect::ModelInference { request } => {
                let delta = run_model_inference(self, request).await?;
                Ok(EffectResult::Delta(delta))
            }
            Effect::SendLog(event) => {
                self.notifier.send_log(event).await;
                Ok(EffectResult::Unit)
            }
            Effect::LogCodeBlock(code) => {
                let exec_id = uuid::Uuid::new_v4().to_string();
                self.notifier
                    .send_log(LogEvent::CodeBlock {
                        iid: self.iid.clone(),
                        exec_id: exec_id.clone(),
                        code,
                    })
                    .await;
                Ok(EffectResult::ExecId(exec_id))
            }
            Effect::LogExecuteResult { exec_id, summary } => {
                self.notifier
                    .send_log(LogEvent::ExecuteResult {
                        iid: self.iid.clone(),
                        exec_id,
                        summary,
                    })
                    .await;
                Ok(EffectResult::Unit)
            }
        }
    }
}

fn fresh_delta_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Drives one `ModelInference` effect: streaming or unary per the request,
/// with partials forwarded to the notifier in arrival order and fused once
/// into the returned [`Delta`] (§4.4 streaming fusion rules).
async fn run_model_inference(ctx: &mut Context, request: CompletionRequest) -> Result<Delta> {
    if request.streaming {
        use futures::StreamExt;
        let mut stream = ctx.inference.stream(request).await?;
        let mut fused = Delta::new(fresh_delta_id(), Role::Agent);
        let mut first = true;
        while let Some(partial) = stream.next().await {
            let partial = partial?;
            ctx.notifier
                .send_log(LogEvent::StreamPartial {
                    iid: ctx.iid.clone(),
                    content: partial.content.clone().unwrap_or_default(),
                })
                .await;
            if first {
                fused.id = partial.id.clone();
                fused.role = partial.role;
                first = false;
            }
            fused.fuse(&partial);
        }
        Ok(fused)
    } else {
        ctx.inference.complete(request).await
    }
}

/// `MaxRoundsError`: total rounds has reached `max_rounds` (§4.4).
pub fn max_rounds_exceeded(rounds_completed: u32, max_rounds: Option<u32>) -> Result<()> {
    match max_rounds {
        Some(max) if rounds_completed >= max => Err(AgenticaError::MaxRounds),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    #[test]
    fn pure_step_short_circuits() {
        let step = Step::pure(EffectResult::ExecId("abc".into()));
        match step {
            Step::Pure(EffectResult::ExecId(id)) => assert_eq!(id, "abc"),
            _ => panic!("expected pure step"),
        }
    }

    #[test]
    fn max_rounds_unbounded_when_none() {
        assert!(max_rounds_exceeded(1000, None).is_ok());
    }

    #[test]
    fn max_rounds_trips_at_limit() {
        assert!(max_rounds_exceeded(3, Some(3)).is_err());
        assert!(max_rounds_exceeded(2, Some(3)).is_ok());
    }
}
