mod git;

pub use git::{DiffSummary, GitTracker, capture_diff, head_commit};
