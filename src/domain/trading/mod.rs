// Fee models
pub mod fees;

// Position lifecycle state machine
pub mod lifecycle;

// Portfolio book
pub mod portfolio;

// Positions, legs, strategy kinds
pub mod position;
