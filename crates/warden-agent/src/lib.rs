//! The specialist-agent contract and the fault-isolation primitives wrapped
//! around every agent call.
//!
//! # Main types
//!
//! - [`SpecialistAgent`] — Uniform `execute(capability, payload)` interface of an external agent.
//! - [`RetryPolicy`] — Bounded attempts with exponential backoff plus jitter.
//! - [`CircuitBreaker`] — Per-agent CLOSED/OPEN/HALF_OPEN state machine.

/// The [`SpecialistAgent`] trait.
pub mod agent;
/// Per-agent circuit breaker.
pub mod breaker;
/// Retry policy and backoff.
pub mod retry;

pub use agent::SpecialistAgent;
pub use breaker::{BreakerConfig, BreakerOutcome, CircuitBreaker, CircuitState, Transition};
pub use retry::{compute_backoff, is_retryable, RetryPolicy};
