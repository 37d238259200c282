//! Signals agents embed in their output.
//!
//! - `<discovery kind="ambiguity">Which database?</discovery>` - findings that
//!   may need a human; `blocker` and `ambiguity` kinds block the phase
//! - `<verdict>approve</verdict>` - reviewer decision
//! - `<issue>Missing error handling</issue>` - one reviewer finding

mod parser;
mod types;

pub use parser::{SignalParser, extract_signals};
pub use types::{AgentSignals, Discovery, DiscoveryKind};
