// Per-bar orchestration and control plane
pub mod engine;

// Atomic multi-leg execution
pub mod execution;

// Exit rules and defensive actions
pub mod exits;

// Performance tracking
pub mod monitoring;

// Sizing, manual mode, unified risk gate
pub mod risk_management;

// Strategy entry controllers
pub mod strategies;
