//! Trade lifecycle engine for a fixed portfolio of five credit-selling
//! options strategies.
//!
//! The core is the coordination between the per-position lifecycle machine,
//! the atomic multi-leg executor, the volatility-regime and correlation
//! gates, the drawdown circuit breaker and the exit rules. Market data,
//! order routing and the clock are external collaborators behind the traits
//! in [`domain::ports`].

pub mod application;
pub mod config;
pub mod domain;
pub mod infrastructure;
