//! Wire protocol types shared between the session manager core and its clients.
#![deny(clippy::print_stdout, clippy::print_stderr)]

pub mod delta;
pub mod messages;
pub mod version;

pub use delta::Delta;
pub use delta::EndReason;
pub use delta::Role;
pub use delta::Usage;
pub use messages::CreateAgentRequest;
pub use messages::ErrorName;
pub use messages::InvocationEventKind;
pub use messages::MultiplexClientMessage;
pub use messages::MultiplexServerMessage;
pub use version::MagicProtocol;
pub use version::Sdk;
pub use version::VersionStatus;
pub use version::policy_for;
