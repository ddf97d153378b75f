//! Local failover gateway for AI coding CLIs.
//!
//! Accepts requests from Claude Code / Codex / Gemini on a loopback port,
//! routes each request to one of the configured upstream providers, retries
//! across providers on failure with circuit breaking and cooldown, keeps
//! session affinity across a conversation, and publishes a structured event
//! stream (`gateway:*`) that external consumers subscribe to.

pub mod circuit;
pub mod cli_key;
pub mod config;
pub mod events;
pub mod gateway;
pub mod logging;
pub mod rectifier;
pub mod registry;
pub mod session;
pub mod trace;
pub mod usage;

pub use circuit::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use config::{ConfigFile, GatewaySettings};
pub use events::{EventBus, GatewayEvent};
pub use gateway::{CliConfigWriter, GatewayManager, GatewayStatus, NoopCliConfigWriter};
pub use registry::{Provider, ProviderRegistry, SortMode};
pub use session::SessionAffinity;
