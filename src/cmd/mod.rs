//! CLI command implementations.
//!
//! | Module     | Commands handled                              |
//! |------------|-----------------------------------------------|
//! | `plan`     | `Plan`                                        |
//! | `run`      | `Apply`, `Task`                               |
//! | `control`  | `Pause`, `Resume`, `Stop`, `Retry`, `Status`  |
//! | `observer` | terminal rendering of events, gate/hail prompts |

pub mod control;
pub mod observer;
pub mod plan;
pub mod run;

pub use control::{cmd_pause, cmd_resume, cmd_retry, cmd_status, cmd_stop};
pub use plan::cmd_plan;
pub use run::{ApplyOptions, cmd_apply, cmd_task};
