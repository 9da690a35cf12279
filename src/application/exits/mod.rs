// Portfolio-level defensive actions
pub mod defensive;

// Per-position exit rules
pub mod exit_engine;
