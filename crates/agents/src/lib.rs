//! `warebus-agents` — the reaction-handler contract, registry, execution
//! harness, and the built-in agent population.
//!
//! Agents are polymorphic over `{name, description, subscriptions, handle}`
//! and never publish to the broker themselves; derived envelopes travel back
//! through the consumer into the outbox.

pub mod builtin;
pub mod contract;
pub mod registry;
pub mod runtime;

#[cfg(test)]
pub(crate) mod testing;

pub use contract::{
    domain_or_infra, Agent, AgentContext, AgentError, AgentResult, CATCH_ALL,
};
pub use registry::AgentRegistry;
pub use runtime::{
    AgentFailure, AgentOutcome, AgentRuntime, DispatchOutcome, RuntimeConfig,
};
