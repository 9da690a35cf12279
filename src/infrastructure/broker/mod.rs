pub mod paper;

pub use paper::{PaperBroker, PaperOutcome};
