use serde::Deserialize;
use serde::Serialize;
use serde_bytes::ByteBuf;

/// Messages a client may send over the multiplexed connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MultiplexClientMessage {
    Invoke {
        match_id: String,
        uid: String,
        #[serde(with = "serde_bytes", default)]
        warp_locals_payload: Vec<u8>,
        #[serde(default)]
        prompt: Option<String>,
        #[serde(default)]
        streaming: bool,
        #[serde(default)]
        parent_uid: Option<String>,
        #[serde(default)]
        parent_iid: Option<String>,
    },
    Cancel {
        uid: String,
        iid: String,
    },
    Data {
        uid: String,
        iid: String,
        #[serde(with = "serde_bytes")]
        payload: Vec<u8>,
    },
}

/// The kind of lifecycle transition reported by an `InvocationEvent`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvocationEventKind {
    Enter,
    Exit,
    Error,
}

/// The closed set of error names the server can report back to a client.
///
/// This is intentionally exhaustive (§7 of the specification): every
/// terminal condition the multiplexer, registry, or inference client can
/// raise maps to exactly one stable, documented name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum_macros::Display)]
#[serde(rename_all = "PascalCase")]
#[strum(serialize_all = "PascalCase")]
pub enum ErrorName {
    // Admission
    TooManyInvocationsError,
    // Protocol-level
    MalformedInvokeMessageError,
    NotRunningError,
    // Validation
    BadModel,
    ValidationError,
    // Version
    UnsupportedVersionError,
    // Inference (see agentica-core's inference module for the full table)
    BadRequest,
    Unauthorized,
    InsufficientCredits,
    PermissionDenied,
    NotFound,
    Conflict,
    RequestTooLarge,
    UnprocessableEntity,
    RateLimit,
    ServiceUnavailable,
    ModelDown,
    DeadlineExceeded,
    Overloaded,
    InternalServer,
    ApiTimeout,
    ApiConnection,
    MaxTokensError,
    MaxRoundsError,
    ContentFilteringError,
    // Sandbox
    SandboxError,
    WarpShutdown,
    // Executable
    ExecutionError,
}

/// Messages the server may send over the multiplexed connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MultiplexServerMessage {
    NewIid {
        match_id: String,
        uid: String,
        iid: String,
    },
    InvocationEvent {
        uid: String,
        iid: String,
        event: InvocationEventKind,
    },
    Error {
        #[serde(default)]
        uid: Option<String>,
        iid: String,
        name: ErrorName,
        #[serde(default)]
        message: Option<String>,
    },
    Data {
        uid: String,
        iid: String,
        #[serde(with = "serde_bytes")]
        payload: Vec<u8>,
    },
}

/// Body of `POST /agent/create`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateAgentRequest {
    #[serde(default)]
    pub doc: Option<String>,
    #[serde(default)]
    pub system: Option<String>,
    pub model: String,
    #[serde(default)]
    pub json: bool,
    #[serde(default)]
    pub streaming: bool,
    #[serde(default)]
    pub warp_globals_payload: ByteBuf,
    #[serde(default)]
    pub max_tokens_per_invocation: Option<u64>,
    #[serde(default)]
    pub max_tokens_per_round: Option<u64>,
    #[serde(default)]
    pub max_rounds: Option<u32>,
    #[serde(default)]
    pub protocol: Option<String>,
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    #[test]
    fn invoke_round_trips_through_json() {
        let msg = MultiplexClientMessage::Invoke {
            match_id: "m1".into(),
            uid: "u".into(),
            warp_locals_payload: vec![1, 2, 3],
            prompt: Some("hi".into()),
            streaming: true,
            parent_uid: None,
            parent_iid: None,
        };
        let json = serde_json::to_string(&msg).expect("serialize");
        let back: MultiplexClientMessage = serde_json::from_str(&json).expect("deserialize");
        match back {
            MultiplexClientMessage::Invoke { match_id, uid, .. } => {
                assert_eq!(match_id, "m1");
                assert_eq!(uid, "u");
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn error_name_serializes_with_stable_name() {
        let json = serde_json::to_string(&ErrorName::TooManyInvocationsError).expect("serialize");
        assert_eq!(json, "\"TooManyInvocationsError\"");
    }
}
