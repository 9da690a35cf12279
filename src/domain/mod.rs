// Domain-specific error taxonomy
pub mod errors;

// Market data: instruments, chains, bars, calendar, freshness
pub mod market;

// Port interfaces to external collaborators
pub mod ports;

// Risk management domain
pub mod risk;

// Core trading domain
pub mod trading;
