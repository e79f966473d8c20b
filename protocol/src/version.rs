use std::cmp::Ordering;
use std::fmt;

/// SDKs that are known to connect to this server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Sdk {
    Python,
    Typescript,
}

impl fmt::Display for Sdk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Sdk::Python => "python",
            Sdk::Typescript => "typescript",
        };
        f.write_str(s)
    }
}

/// The protocol version string clients present on agent creation:
/// `"<sdk>/<version>"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MagicProtocol {
    pub sdk: Sdk,
    pub version: String,
}

impl MagicProtocol {
    /// Parse a `"<sdk>/<version>"` string. A missing protocol parses to the
    /// default (`python`, `0.0.0-dev`) rather than failing, matching the
    /// original implementation's tolerance for old clients that never sent
    /// the header.
    pub fn parse(protocol: Option<&str>) -> Result<Self, ParseProtocolError> {
        let Some(protocol) = protocol else {
            return Ok(Self::default());
        };
        let mut parts = protocol.splitn(2, '/');
        let (Some(sdk), Some(version)) = (parts.next(), parts.next()) else {
            return Err(ParseProtocolError::BadFormat(protocol.to_string()));
        };
        let sdk = match sdk {
            "python" => Sdk::Python,
            "typescript" => Sdk::Typescript,
            other => return Err(ParseProtocolError::UnknownSdk(other.to_string())),
        };
        Ok(Self {
            sdk,
            version: version.to_string(),
        })
    }
}

impl Default for MagicProtocol {
    fn default() -> Self {
        Self {
            sdk: Sdk::Python,
            version: "0.0.0-dev".to_string(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ParseProtocolError {
    #[error("invalid protocol format: {0:?} (expected 'sdk/version')")]
    BadFormat(String),
    #[error("unknown sdk: {0}")]
    UnknownSdk(String),
}

/// Result of checking a client's protocol version against policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionStatus {
    Ok,
    Deprecated,
    Unsupported,
}

/// `{min_supported, min_recommended}` policy for one SDK.
#[derive(Debug, Clone)]
pub struct SdkVersionPolicy {
    pub min_supported: Version,
    pub min_recommended: Version,
}

/// A minimal dotted-triple semver comparator. The server only ever compares
/// against its own release version, so this does not need pre-release or
/// build-metadata support.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Version {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
}

impl Version {
    pub fn parse(s: &str) -> Option<Self> {
        let mut parts = s.split('.');
        let major = parts.next()?.parse().ok()?;
        let minor = parts.next().unwrap_or("0").parse().ok()?;
        let patch = parts.next().unwrap_or("0").parse().ok()?;
        Some(Self { major, minor, patch })
    }

    pub fn public(&self) -> String {
        format!("{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.major, self.minor, self.patch).cmp(&(other.major, other.minor, other.patch))
    }
}

pub const UPGRADE_URL: &str = "https://agentica.symbolica.ai/quickstart";

/// The per-SDK policy table. Keyed by `Sdk` rather than a string so a
/// missing entry is a compile error, not a silent default.
pub fn policy_for(sdk: Sdk) -> SdkVersionPolicy {
    match sdk {
        Sdk::Python => SdkVersionPolicy {
            min_supported: Version { major: 0, minor: 4, patch: 0 },
            min_recommended: Version { major: 0, minor: 6, patch: 0 },
        },
        Sdk::Typescript => SdkVersionPolicy {
            min_supported: Version { major: 0, minor: 2, patch: 0 },
            min_recommended: Version { major: 0, minor: 4, patch: 0 },
        },
    }
}

/// Whether `"0.0.0-dev"` should be treated as a valid, local-only version.
///
/// Mirrors the original behavior: `ORGANIZATION_ID` unset (or set to the
/// sentinel `LOCAL_SESSION_MANAGER`) means this server is running in local
/// developer mode, where the placeholder dev version is accepted.
pub fn is_local_mode(organization_id: Option<&str>) -> bool {
    organization_id.unwrap_or("LOCAL_SESSION_MANAGER") == "LOCAL_SESSION_MANAGER"
}

pub fn check_sdk_version(
    policy: &SdkVersionPolicy,
    version: &str,
    disable_version_check: bool,
    local_mode: bool,
) -> VersionStatus {
    if disable_version_check {
        return VersionStatus::Ok;
    }
    if version == "0.0.0-dev" {
        return if local_mode {
            VersionStatus::Ok
        } else {
            VersionStatus::Unsupported
        };
    }
    match Version::parse(version) {
        Some(v) if v < policy.min_supported => VersionStatus::Unsupported,
        Some(v) if v < policy.min_recommended => VersionStatus::Deprecated,
        Some(_) => VersionStatus::Ok,
        None => VersionStatus::Unsupported,
    }
}

pub fn format_upgrade_message(sdk: Sdk, version: &str, policy: &SdkVersionPolicy) -> String {
    let _ = sdk;
    format!(
        "SDK update recommended: your version {version}, recommended {}+. Visit {UPGRADE_URL}",
        policy.min_recommended.public()
    )
}

pub fn format_unsupported_message(sdk: Sdk, version: &str, policy: &SdkVersionPolicy) -> String {
    let _ = sdk;
    let your_version_line = if version != "0.0.0-dev" {
        format!("  Your version: {version}\n")
    } else {
        String::new()
    };
    format!(
        "\n{bar}\n  SDK VERSION NOT SUPPORTED\n{bar}\n{your_version_line}  Minimum required: {min}\n\n  Please use your package manager to upgrade to the latest version.\n{bar}\n",
        bar = "=".repeat(60),
        min = policy.min_supported.public(),
    )
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    #[test]
    fn missing_protocol_parses_to_default() {
        let parsed = MagicProtocol::parse(None).expect("default parse");
        assert_eq!(parsed, MagicProtocol::default());
    }

    #[test]
    fn parses_sdk_and_version() {
        let parsed = MagicProtocol::parse(Some("typescript/1.2.3")).expect("parse");
        assert_eq!(parsed.sdk, Sdk::Typescript);
        assert_eq!(parsed.version, "1.2.3");
    }

    #[test]
    fn rejects_unknown_sdk() {
        let err = MagicProtocol::parse(Some("ruby/1.0.0")).unwrap_err();
        assert!(matches!(err, ParseProtocolError::UnknownSdk(_)));
    }

    #[test]
    fn below_min_supported_is_unsupported() {
        let policy = SdkVersionPolicy {
            min_supported: Version::parse("1.0.0").expect("valid"),
            min_recommended: Version::parse("2.0.0").expect("valid"),
        };
        assert_eq!(
            check_sdk_version(&policy, "0.5.0", false, false),
            VersionStatus::Unsupported
        );
        assert_eq!(
            check_sdk_version(&policy, "1.5.0", false, false),
            VersionStatus::Deprecated
        );
        assert_eq!(
            check_sdk_version(&policy, "2.0.0", false, false),
            VersionStatus::Ok
        );
    }

    #[test]
    fn dev_version_requires_local_mode() {
        let policy = SdkVersionPolicy {
            min_supported: Version::parse("1.0.0").expect("valid"),
            min_recommended: Version::parse("1.0.0").expect("valid"),
        };
        assert_eq!(
            check_sdk_version(&policy, "0.0.0-dev", false, true),
            VersionStatus::Ok
        );
        assert_eq!(
            check_sdk_version(&policy, "0.0.0-dev", false, false),
            VersionStatus::Unsupported
        );
    }

    #[test]
    fn policy_table_has_an_entry_for_every_sdk() {
        let python = policy_for(Sdk::Python);
        assert!(python.min_supported < python.min_recommended);
        let typescript = policy_for(Sdk::Typescript);
        assert!(typescript.min_supported < typescript.min_recommended);
    }

    #[test]
    fn disable_check_short_circuits() {
        let policy = SdkVersionPolicy {
            min_supported: Version::parse("99.0.0").expect("valid"),
            min_recommended: Version::parse("99.0.0").expect("valid"),
        };
        assert_eq!(
            check_sdk_version(&policy, "0.0.1", true, false),
            VersionStatus::Ok
        );
    }
}
