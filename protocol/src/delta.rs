use serde::Deserialize;
use serde::Serialize;

/// Who produced a [`Delta`]. `Agent` is spelled `"assistant"` on the wire
/// so the same type doubles as the chat-message role sent to and parsed
/// from an OpenAI-compatible completion endpoint, which knows nothing of
/// this crate's own vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    #[serde(rename = "assistant")]
    Agent,
}

/// Why a model turn ended, as reported by the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    Stop,
    Length,
    ContentFilter,
    ToolCalls,
}

/// Token accounting for a single completed inference call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
}

impl Usage {
    /// Deep-merge another partial's usage into this one, per the streaming
    /// fusion rules: token counts accumulate across partials.
    pub fn merge(&mut self, other: &Usage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.total_tokens += other.total_tokens;
    }
}

/// A single append-only entry in an agent's conversation history.
///
/// The history is the ordered concatenation of deltas. `implicit` deltas are
/// system scaffolding inserted by the agent itself (e.g. the system prompt)
/// rather than content produced in response to user input; they remain part
/// of the history but are flagged for observability so UIs can fold them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Delta {
    pub id: String,
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refusal: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_reason: Option<EndReason>,
    #[serde(default)]
    pub implicit: bool,
}

impl Delta {
    pub fn new(id: impl Into<String>, role: Role) -> Self {
        Self {
            id: id.into(),
            role,
            content: None,
            reasoning_content: None,
            refusal: None,
            usage: None,
            end_reason: None,
            implicit: false,
        }
    }

    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = Some(content.into());
        self
    }

    pub fn implicit(mut self) -> Self {
        self.implicit = true;
        self
    }

    /// Fold a streamed partial delta into `self`, per the streaming fusion
    /// rules in the interaction policy: concatenate strings, deep-merge
    /// usage, and let any non-EOS end reason from a partial win.
    pub fn fuse(&mut self, partial: &Delta) {
        if let Some(content) = &partial.content {
            self.content.get_or_insert_with(String::new).push_str(content);
        }
        if let Some(reasoning) = &partial.reasoning_content {
            self.reasoning_content
                .get_or_insert_with(String::new)
                .push_str(reasoning);
        }
        if let Some(refusal) = &partial.refusal {
            self.refusal.get_or_insert_with(String::new).push_str(refusal);
        }
        if let Some(usage) = &partial.usage {
            self.usage.get_or_insert_with(Usage::default).merge(usage);
        }
        if let Some(end_reason) = partial.end_reason {
            self.end_reason = Some(end_reason);
        }
    }
}

/// Append-only ordered history of [`Delta`]s plus per-invocation token
/// bookkeeping.
#[derive(Debug, Clone, Default)]
pub struct History {
    deltas: Vec<Delta>,
}

impl History {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, delta: Delta) {
        self.deltas.push(delta);
    }

    pub fn iter(&self) -> impl Iterator<Item = &Delta> {
        self.deltas.iter()
    }

    pub fn len(&self) -> usize {
        self.deltas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deltas.is_empty()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    #[test]
    fn fuse_concatenates_content_in_arrival_order() {
        let mut fused = Delta::new("resp-1", Role::Agent);
        for chunk in ["He", "ll", "o", ""] {
            let mut partial = Delta::new("resp-1", Role::Agent);
            partial.content = Some(chunk.to_string());
            fused.fuse(&partial);
        }
        let mut last = Delta::new("resp-1", Role::Agent);
        last.end_reason = Some(EndReason::Stop);
        fused.fuse(&last);

        assert_eq!(fused.content.as_deref(), Some("Hello"));
        assert_eq!(fused.end_reason, Some(EndReason::Stop));
    }

    #[test]
    fn agent_role_is_spelled_assistant_on_the_wire() {
        let json = serde_json::to_string(&Role::Agent).expect("serialize");
        assert_eq!(json, "\"assistant\"");
        let back: Role = serde_json::from_str("\"assistant\"").expect("deserialize");
        assert_eq!(back, Role::Agent);
    }
}
