// Cumulative P&L, drawdown and win-rate tracking
pub mod performance_tracker;
