//! Core concurrency and control plane for the session manager: the
//! multiplexer, session/agent registry, agent interaction loop, sandbox
//! bridge, and inference endpoint client.
#![deny(clippy::print_stdout, clippy::print_stderr)]

pub mod agent;
pub mod config;
pub mod error;
pub mod inference;
pub mod model;
pub mod multiplexer;
pub mod notifier;
pub mod orchestrator;
pub mod registry;
pub mod sandbox;
pub mod sequencer;
pub mod transport;
pub mod util;

pub use agent::Agent;
pub use agent::TokenBudget;
pub use error::AgenticaError;
pub use error::Result;
pub use multiplexer::Multiplexer;
pub use registry::Registry;
pub use transport::Transport;
