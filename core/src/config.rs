//! Layered configuration: defaults, overridden by `config.toml`, overridden
//! by `AGENTICA_*` environment variables. Secrets are never read from the
//! TOML file — only from the environment.

use serde::Deserialize;

use crate::model::ProviderInfo;
use crate::model::built_in_providers;

fn default_max_concurrent_invocations() -> usize {
    64
}

fn default_sandbox_mode() -> SandboxMode {
    SandboxMode::FromEnv
}

fn default_backoff_base_ms() -> u64 {
    200
}

fn default_max_retries() -> u32 {
    4
}

/// `'no_sandbox' | 'wasm' | 'from_env'` (§6 `AGENTICA_NO_SANDBOX`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxMode {
    NoSandbox,
    Wasm,
    FromEnv,
}

impl SandboxMode {
    /// Resolve `from_env` against `AGENTICA_NO_SANDBOX`.
    pub fn resolve(self, no_sandbox_env: bool) -> SandboxMode {
        match self {
            SandboxMode::FromEnv if no_sandbox_env => SandboxMode::NoSandbox,
            SandboxMode::FromEnv => SandboxMode::Wasm,
            other => other,
        }
    }
}

/// Non-secret server configuration, deserializable from `config.toml`.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_max_concurrent_invocations")]
    pub max_concurrent_invocations: usize,
    #[serde(default = "default_sandbox_mode")]
    pub sandbox_mode: SandboxMode,
    #[serde(default)]
    pub inference_endpoint: Option<String>,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_invocations: default_max_concurrent_invocations(),
            sandbox_mode: default_sandbox_mode(),
            inference_endpoint: None,
            backoff_base_ms: default_backoff_base_ms(),
            max_retries: default_max_retries(),
        }
    }
}

impl ServerConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(s)
    }

    /// Apply `AGENTICA_*` environment variable overrides on top of whatever
    /// was loaded from `config.toml`. Unset or unparsable variables leave
    /// the existing value untouched.
    pub fn apply_env_overrides(mut self) -> Self {
        if let Ok(v) = std::env::var("AGENTICA_MAX_CONCURRENT_INVOCATIONS")
            && let Ok(parsed) = v.parse()
        {
            self.max_concurrent_invocations = parsed;
        }
        if let Ok(v) = std::env::var("AGENTICA_MAX_RETRIES")
            && let Ok(parsed) = v.parse()
        {
            self.max_retries = parsed;
        }
        if let Ok(v) = std::env::var("AGENTICA_BACKOFF_BASE_MS")
            && let Ok(parsed) = v.parse()
        {
            self.backoff_base_ms = parsed;
        }
        self
    }

    pub fn resolved_sandbox_mode(&self) -> SandboxMode {
        let no_sandbox_env = std::env::var("AGENTICA_NO_SANDBOX").as_deref() == Ok("1");
        self.sandbox_mode.resolve(no_sandbox_env)
    }
}

/// Secrets, sourced from the environment only — never persisted to disk or
/// logged.
#[derive(Clone)]
pub struct Secrets {
    pub inference_token: String,
}

impl Secrets {
    pub fn from_env() -> Option<Self> {
        std::env::var("AGENTICA_INFERENCE_TOKEN")
            .ok()
            .map(|inference_token| Self { inference_token })
    }
}

/// Whether SDK version checks should be bypassed entirely (§6).
pub fn version_check_disabled() -> bool {
    std::env::var("AGENTICA_SERVER_DISABLE_VERSION_CHECK").as_deref() == Ok("1")
}

/// Whether this server is running in local developer mode (§10).
pub fn is_local_mode() -> bool {
    agentica_protocol::version::is_local_mode(std::env::var("ORGANIZATION_ID").ok().as_deref())
}

pub fn providers() -> std::collections::HashMap<String, ProviderInfo> {
    built_in_providers()
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    #[test]
    fn default_config_has_expected_admission_cap() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.max_concurrent_invocations, 64);
    }

    #[test]
    fn parses_overridden_values_from_toml() {
        let cfg = ServerConfig::from_toml_str(
            r#"
            max_concurrent_invocations = 8
            max_retries = 2
            "#,
        )
        .expect("valid toml");
        assert_eq!(cfg.max_concurrent_invocations, 8);
        assert_eq!(cfg.max_retries, 2);
        // Fields not present fall back to defaults.
        assert_eq!(cfg.backoff_base_ms, 200);
    }

    #[test]
    fn sandbox_mode_resolves_from_env_flag() {
        assert_eq!(
            SandboxMode::FromEnv.resolve(true),
            SandboxMode::NoSandbox
        );
        assert_eq!(SandboxMode::FromEnv.resolve(false), SandboxMode::Wasm);
        assert_eq!(SandboxMode::Wasm.resolve(true), SandboxMode::Wasm);
    }
}
