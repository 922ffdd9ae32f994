pub mod engine;

pub use engine::{MatchConfig, MatchEngine, MatchOutcome, MatchStrategy};
