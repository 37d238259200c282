pub mod agent_loop;
pub mod runner;
pub mod state;

pub use agent_loop::{AgentLoop, CycleRecord, LoopLimits, LoopReport, LoopState};
pub use runner::CommandAgent;
pub use state::{StateEntry, StateManager};
