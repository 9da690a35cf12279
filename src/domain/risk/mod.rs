// Account-size tiers
pub mod account_phase;

// Correlation-group concentration limits
pub mod correlation;

// Drawdown circuit breaker
pub mod drawdown;

// Structured risk events and the bounded journal
pub mod events;

// VIX regime classification and gating
pub mod vix_regime;
