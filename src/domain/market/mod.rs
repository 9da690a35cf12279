// Instruments, legs and identifiers
pub mod instrument;

// Option chain snapshots
pub mod option_chain;

// Per-bar market data slice
pub mod bar_slice;

// Session times, entry windows, corporate events
pub mod calendar;

// Data freshness tiers and fail-fast validation
pub mod freshness;
