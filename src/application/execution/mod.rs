// Atomic multi-leg order groups
pub mod atomic_executor;

// Smart limit pricing
pub mod pricing;
