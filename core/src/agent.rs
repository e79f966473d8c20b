//! An agent: one sandbox, one inference client, one system prompt, run
//! serially through the interaction policy (§3 Data model, §4.3, §4.4).

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use agentica_protocol::Delta;
use agentica_protocol::InvocationEventKind;
use agentica_protocol::Role;
use regex_lite::Regex;
use tokio::sync::Mutex;
use tracing::warn;

use crate::error::AgenticaError;
use crate::error::Result;
use crate::inference::CompletionRequest;
use crate::inference::InferenceEndpoint;
use crate::inference::WireMessage;
use crate::model::ModelSpec;
use crate::notifier::SharedNotifier;
use crate::sandbox::ReplRunOptions;
use crate::sandbox::SandboxHandle;
use crate::sandbox::SessionInfo;
use crate::sequencer::Context;
use crate::sequencer::Effect;
use crate::sequencer::Step;
use crate::sequencer::max_rounds_exceeded;

/// Per-call and per-invocation token ceilings (§4.4 "Token bookkeeping").
/// `None` on any field means unbounded (bounded only by the provider) —
/// in particular, `max_tokens_per_round: None` is a deliberate bypass of
/// the per-round cap, not a zero budget, matching documented upstream
/// behavior rather than a stricter reading.
#[derive(Debug, Clone, Default)]
pub struct TokenBudget {
    pub max_tokens_per_invocation: Option<u64>,
    pub max_tokens_per_round: Option<u64>,
    pub max_rounds: Option<u32>,
}

/// The outcome of one `run()` call: the rest of the invocation's lifecycle
/// bookkeeping (emitting `ENTER`/`EXIT`/`Error`) is the multiplexer's job.
pub struct RunOutcome {
    pub rounds_completed: u32,
}

/// Selected once at construction from the provider family; exposes pure
/// description builders, never coroutines (§4.4 "Strategy table", §9).
pub trait InteractionStrategy: Send + Sync {
    /// Runs once per agent, the first time any invocation executes.
    fn init_sequence(&self, premise: Option<&str>, system: Option<&str>) -> Step;

    /// Runs once per invocation, for the user's task.
    fn user_sequence(&self, task: &str) -> Step;

    /// JSON-mode agents are not implemented by either strategy family; both
    /// reject up front rather than silently ignoring `json=true`.
    fn rejects_json_mode(&self) -> bool {
        true
    }
}

pub struct DefaultStrategy;

impl InteractionStrategy for DefaultStrategy {
    fn init_sequence(&self, premise: Option<&str>, system: Option<&str>) -> Step {
        build_init_sequence(premise, system)
    }

    fn user_sequence(&self, task: &str) -> Step {
        let delta = Delta::new(fresh_id(), Role::User).with_content(task.to_string());
        Step::then(Effect::InsertDelta(delta), |_| Step::done())
    }
}

pub struct AnthropicStrategy;

impl InteractionStrategy for AnthropicStrategy {
    fn init_sequence(&self, premise: Option<&str>, system: Option<&str>) -> Step {
        build_init_sequence(premise, system)
    }

    fn user_sequence(&self, task: &str) -> Step {
        let delta = Delta::new(fresh_id(), Role::User).with_content(task.to_string());
        Step::then(Effect::InsertDelta(delta), |_| Step::done())
    }
}

fn build_init_sequence(premise: Option<&str>, system: Option<&str>) -> Step {
    let premise = premise.map(str::to_string);
    let system = system.map(str::to_string);
    let system_delta = system.map(|s| Delta::new(fresh_id(), Role::System).with_content(s).implicit());
    match (premise, system_delta) {
        (Some(premise), Some(system_delta)) => Step::then(Effect::InsertDelta(system_delta), move |_| {
            let premise_delta = Delta::new(fresh_id(), Role::System).with_content(premise).implicit();
            Step::then(Effect::InsertDelta(premise_delta), |_| Step::done())
        }),
        (Some(premise), None) => {
            let premise_delta = Delta::new(fresh_id(), Role::System).with_content(premise).implicit();
            Step::then(Effect::InsertDelta(premise_delta), |_| Step::done())
        }
        (None, Some(system_delta)) => Step::then(Effect::InsertDelta(system_delta), |_| Step::done()),
        (None, None) => Step::done(),
    }
}

/// Pick the strategy for a provider family (§9 "Dynamic dispatch on
/// model/provider"): `anthropic` gets its own strategy, everything else the
/// default OpenAI-compatible one.
pub fn strategy_for(provider: &str) -> Arc<dyn InteractionStrategy> {
    match provider {
        "anthropic" => Arc::new(AnthropicStrategy),
        _ => Arc::new(DefaultStrategy),
    }
}

fn fresh_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

struct AgentState {
    history: Vec<Delta>,
    executed_system: bool,
    sandbox_primed: bool,
    last_session_info: Option<SessionInfo>,
}

/// One agent: bound to a sandbox, an inference client, a system prompt, and
/// the sequencer policy. `run()` is serialized by `lock`; `closed` makes
/// `close()` idempotent.
pub struct Agent {
    pub uid: String,
    pub cid: String,
    pub model_spec: ModelSpec,
    pub endpoint_id: String,
    pub system_prompt: Option<String>,
    pub premise: Option<String>,
    pub warp_globals_payload: Vec<u8>,
    pub token_budget: TokenBudget,
    pub streaming_default: bool,
    sandbox: SandboxHandle,
    inference: InferenceEndpoint,
    notifier: SharedNotifier,
    strategy: Arc<dyn InteractionStrategy>,
    state: Mutex<AgentState>,
    closed: AtomicBool,
}

impl Agent {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        uid: String,
        cid: String,
        model_spec: ModelSpec,
        system_prompt: Option<String>,
        premise: Option<String>,
        warp_globals_payload: Vec<u8>,
        token_budget: TokenBudget,
        streaming_default: bool,
        sandbox: SandboxHandle,
        inference: InferenceEndpoint,
        notifier: SharedNotifier,
    ) -> Self {
        let strategy = strategy_for(&model_spec.provider);
        let endpoint_id = model_spec.provider.clone();
        Self {
            uid,
            cid,
            model_spec,
            endpoint_id,
            system_prompt,
            premise,
            warp_globals_payload,
            token_budget,
            streaming_default,
            sandbox,
            inference,
            notifier,
            strategy,
            state: Mutex::new(AgentState {
                history: Vec::new(),
                executed_system: false,
                sandbox_primed: false,
                last_session_info: None,
            }),
            closed: AtomicBool::new(false),
        }
    }

    pub fn history_len(&self) -> usize {
        // Best-effort snapshot; callers needing a consistent view should
        // serialize through `run`.
        self.state.try_lock().map(|s| s.history.len()).unwrap_or(0)
    }

    /// Run the invocation contract of §4.3 steps 2-6 (steps 1, 7, 8 are the
    /// multiplexer's responsibility: `on_enter`/`on_exit`/admission release).
    pub async fn run(
        &self,
        iid: String,
        warp_locals_payload: Vec<u8>,
        prompt: Option<String>,
        streaming: Option<bool>,
    ) -> Result<RunOutcome> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(AgenticaError::Sandbox(crate::error::SandboxErr::Shutdown));
        }
        let mut state = self.state.lock().await;
        let streaming = streaming.unwrap_or(self.streaming_default);

        if !state.sandbox_primed {
            let info = self
                .sandbox
                .repl_init(self.warp_globals_payload.clone(), warp_locals_payload)
                .await?;
            state.sandbox_primed = true;
            state.last_session_info = Some(info);
        } else {
            let info = self.sandbox.repl_init(Vec::new(), warp_locals_payload).await?;
            state.last_session_info = Some(info);
        }

        if !state.executed_system {
            let mut ctx = Context {
                sandbox: self.sandbox.clone(),
                inference: self.inference.clone(),
                history: std::mem::take(&mut state.history),
                notifier: self.notifier.clone(),
                iid: iid.clone(),
                scratch: std::collections::HashMap::new(),
            };
            let step = self
                .strategy
                .init_sequence(self.premise.as_deref(), self.system_prompt.as_deref());
            ctx.run(step).await?;
            for delta in &mut ctx.history {
                delta.implicit = true;
            }
            state.history = ctx.history;
            state.executed_system = true;
        }

        let mut ctx = Context {
            sandbox: self.sandbox.clone(),
            inference: self.inference.clone(),
            history: std::mem::take(&mut state.history),
            notifier: self.notifier.clone(),
            iid: iid.clone(),
            scratch: std::collections::HashMap::new(),
        };

        if let Some(task) = prompt {
            let step = self.strategy.user_sequence(&task);
            ctx.run(step).await?;
        }

        let outcome = run_interaction(&mut ctx, &self.model_spec.model, &self.token_budget, streaming).await;
        state.history = ctx.history;
        outcome
    }

    /// Forward opaque client-originated bytes into this agent's sandbox
    /// bridge, tagged with the invocation they belong to (§4.2 `Data`
    /// dispatch).
    pub fn forward_client_data(&self, iid: String, bytes: Vec<u8>) -> Result<()> {
        self.sandbox.forward_client_data(iid, bytes)
    }

    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.sandbox.close();
    }
}

impl Drop for Agent {
    fn drop(&mut self) {
        self.close();
    }
}

/// The interaction policy of §4.4, driven by ordinary `async`/`await`
/// control flow between individual sequencer effects.
async fn run_interaction(ctx: &mut Context, model: &str, budget: &TokenBudget, streaming: bool) -> Result<RunOutcome> {
    let mut rounds_completed = 0u32;
    let mut remaining_invocation_tokens = budget.max_tokens_per_invocation;

    let session_info = ctx
        .run_one(Effect::ReplSessionInfo)
        .await?
        .into_session_info()
        .ok_or_else(|| AgenticaError::InternalServer("repl_session_info effect returned a non-session-info value".into()))?;
    let returns_text = session_info.return_type == "str";

    loop {
        max_rounds_exceeded(rounds_completed, budget.max_rounds)?;

        let per_call_cap = min_option(budget.max_tokens_per_round, remaining_invocation_tokens);
        let messages = ctx
            .history
            .iter()
            .map(|d| WireMessage {
                role: d.role,
                content: d.content.clone().unwrap_or_default(),
            })
            .collect();
        let request = CompletionRequest {
            model: model.to_string(),
            messages,
            streaming,
            max_tokens: per_call_cap.map(|t| t as u32),
            temperature: None,
        };

        let result = ctx.run_one(Effect::ModelInference { request }).await?;
        let fused = result
            .into_delta()
            .ok_or_else(|| AgenticaError::InternalServer("inference effect returned a non-delta value".into()))?;

        if let Some(usage) = &fused.usage {
            remaining_invocation_tokens = remaining_invocation_tokens
                .map(|remaining| remaining.saturating_sub(usage.completion_tokens));
        }

        ctx.run_one(Effect::InsertDelta(fused.clone())).await?;
        rounds_completed += 1;

        let Some(content) = fused.content.as_deref().filter(|c| !c.trim().is_empty()) else {
            insert_user_note(ctx, "empty-response: the previous turn produced no content.").await?;
            continue;
        };

        let blocks = extract_code_blocks(content);
        let code = if blocks.is_empty() {
            if looks_like_bare_return(content, returns_text) {
                Some(format!("return {:?}", strip_reasoning_tags(content)))
            } else {
                None
            }
        } else {
            Some(blocks[0].clone())
        };

        let Some(code) = code else {
            insert_user_note(ctx, "missing-code: no fenced code block was found in the previous turn.").await?;
            continue;
        };

        let exec_id = ctx
            .run_one(Effect::LogCodeBlock(code.clone()))
            .await?
            .into_exec_id()
            .unwrap_or_default();

        let eval = ctx
            .run_one(Effect::ReplRunCode {
                code,
                options: ReplRunOptions {
                    iid: Some(ctx.iid.clone()),
                    mode: None,
                },
            })
            .await?
            .into_evaluation()
            .ok_or_else(|| AgenticaError::InternalServer("repl_run_code effect returned a non-evaluation value".into()))?;

        ctx.run_one(Effect::LogExecuteResult {
            exec_id,
            summary: eval.out_str.clone(),
        })
        .await?;

        if eval.produced_future_result() {
            return Ok(RunOutcome { rounds_completed });
        }

        if eval.out_str.trim().is_empty() {
            insert_user_note(ctx, "empty-output: the code block produced no output.").await?;
        } else {
            insert_user_note(ctx, &format!("output:\n{}", eval.out_str)).await?;
        }

        if eval.exception_name.as_deref() == Some("SystemExit") {
            insert_user_note(ctx, "uncaught-exit: the code block called SystemExit, which is not supported here.")
                .await?;
        }

        if blocks.len() > 1 {
            insert_user_note(ctx, "multiple-code-blocks: only the first code block in a turn is executed.").await?;
        }
    }
}

async fn insert_user_note(ctx: &mut Context, note: &str) -> Result<()> {
    let delta = Delta::new(fresh_id(), Role::User).with_content(note.to_string());
    ctx.run_one(Effect::InsertDelta(delta)).await?;
    Ok(())
}

fn min_option(a: Option<u64>, b: Option<u64>) -> Option<u64> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (Some(a), None) => Some(a),
        (None, Some(b)) => Some(b),
        (None, None) => None,
    }
}

fn extract_code_blocks(content: &str) -> Vec<String> {
    let re = match Regex::new(r"(?s)```[a-zA-Z0-9_+-]*\n(.*?)```") {
        Ok(re) => re,
        Err(e) => {
            warn!(error = %e, "fenced code block pattern failed to compile");
            return Vec::new();
        }
    };
    re.captures_iter(content)
        .filter_map(|caps| caps.get(1).map(|m| m.as_str().to_string()))
        .collect()
}

fn strip_reasoning_tags(content: &str) -> String {
    let re = match Regex::new(r"(?s)<(thinking|reasoning)>.*?</(thinking|reasoning)>") {
        Ok(re) => re,
        Err(_) => return content.trim().to_string(),
    };
    re.replace_all(content, "").trim().to_string()
}

/// A fenced-code-block-free turn is only treated as an implicit `return
/// <text>` when the declared return type is `str` (§4.4 step 4); otherwise
/// it falls through to the "missing code" guidance, matching
/// `interaction_monad()`'s `session.is_returning_text` gate.
fn looks_like_bare_return(content: &str, returns_text: bool) -> bool {
    returns_text && !strip_reasoning_tags(content).is_empty()
}

pub fn invocation_event_for(outcome: &std::result::Result<RunOutcome, AgenticaError>) -> InvocationEventKind {
    match outcome {
        Ok(_) => InvocationEventKind::Exit,
        Err(_) => InvocationEventKind::Error,
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    #[test]
    fn extracts_single_fenced_code_block() {
        let content = "here:\n```python\nprint(1)\n```\ndone";
        let blocks = extract_code_blocks(content);
        assert_eq!(blocks, vec!["print(1)\n".to_string()]);
    }

    #[test]
    fn extracts_only_first_of_multiple_blocks_by_convention() {
        let content = "```python\na = 1\n```\n```python\nb = 2\n```";
        let blocks = extract_code_blocks(content);
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].trim(), "a = 1");
    }

    #[test]
    fn strips_reasoning_tags_before_treating_as_bare_return() {
        let content = "<thinking>scratch work</thinking>final answer";
        assert_eq!(strip_reasoning_tags(content), "final answer");
    }

    #[test]
    fn bare_return_is_only_recognized_when_the_session_returns_text() {
        assert!(looks_like_bare_return("the answer is 42", true));
        assert!(!looks_like_bare_return("the answer is 42", false));
        assert!(!looks_like_bare_return("   ", true));
    }

    #[test]
    fn min_option_picks_the_lower_bound() {
        assert_eq!(min_option(Some(10), Some(5)), Some(5));
        assert_eq!(min_option(None, Some(5)), Some(5));
        assert_eq!(min_option(None, None), None);
    }

    #[tokio::test]
    async fn full_agent_run_executes_code_and_completes() {
        use crate::sandbox::SandboxBridge;
        use crate::sandbox::StubGuest;
        use std::sync::Arc as StdArc;

        let bridge = StdArc::new(SandboxBridge::spawn(Box::new(StubGuest)));
        let sandbox = SandboxHandle::new(bridge);
        let inference = InferenceEndpoint::new(reqwest::Client::new(), "http://127.0.0.1:0", "unused");
        let notifier = crate::notifier::tracing_notifier();

        let agent = Agent::new(
            "u1".into(),
            "c1".into(),
            ModelSpec {
                provider: "openai".into(),
                model: "gpt-4.1".into(),
                via_router: false,
            },
            Some("be terse".into()),
            None,
            Vec::new(),
            TokenBudget {
                max_tokens_per_invocation: None,
                max_tokens_per_round: None,
                max_rounds: Some(1),
            },
            false,
            sandbox,
            inference,
            notifier,
        );

        // With `max_rounds=1` and a stub inference client unreachable at
        // 127.0.0.1:0, the first `ModelInference` effect fails with a
        // connection error rather than hanging: this exercises the
        // sandbox-priming and system-sequence paths without a live endpoint.
        let result = agent
            .run("iid-1".into(), Vec::new(), Some("do the thing".into()), Some(false))
            .await;
        assert!(result.is_err());
        agent.close();
    }
}
