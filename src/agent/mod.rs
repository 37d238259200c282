//! The boundary between the orchestrator and whatever does the actual work.
//!
//! The orchestrator never assumes a prompting protocol. It hands an
//! `AgentRequest` to an `Agent` and reads back cost, duration, the reviewer's
//! verdict and any discovery.

mod scripted;

pub use scripted::{ScriptedAgent, ScriptedResponse};

use crate::errors::AgentError;
use crate::phase::PhaseId;
use crate::signals::{Discovery, extract_signals};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentRole {
    Coder,
    Reviewer,
}

impl fmt::Display for AgentRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentRole::Coder => write!(f, "coder"),
            AgentRole::Reviewer => write!(f, "reviewer"),
        }
    }
}

/// One invocation of a coder or reviewer.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentRequest {
    pub phase_id: PhaseId,
    pub title: String,
    pub role: AgentRole,
    /// 1-based cycle number
    pub cycle: u32,
    pub body: String,
    /// Reviewer findings from the previous cycle
    pub feedback: Option<String>,
    /// Answers to blocking hails, oldest first
    pub guidance: Vec<String>,
    pub diff: Option<String>,
}

impl AgentRequest {
    /// Render the request as a plain-text prompt.
    pub fn to_prompt(&self) -> String {
        let mut prompt = match self.role {
            AgentRole::Coder => format!(
                "## TASK\nImplement phase {}: {} (cycle {})\n\n{}\n",
                self.phase_id, self.title, self.cycle, self.body
            ),
            AgentRole::Reviewer => format!(
                "## REVIEW\nReview the work for phase {}: {} (cycle {})\n\n{}\n\n\
                 Reply with <verdict>approve</verdict> or <verdict>revise</verdict>, \
                 and one <issue>...</issue> per problem found.\n",
                self.phase_id, self.title, self.cycle, self.body
            ),
        };

        if let Some(feedback) = &self.feedback {
            prompt.push_str("\n## REVIEWER FEEDBACK\n");
            prompt.push_str(feedback);
            prompt.push('\n');
        }
        if !self.guidance.is_empty() {
            prompt.push_str("\n## GUIDANCE\n");
            for answer in &self.guidance {
                prompt.push_str("- ");
                prompt.push_str(answer);
                prompt.push('\n');
            }
        }
        if let Some(diff) = &self.diff {
            prompt.push_str("\n## CHANGES\n```diff\n");
            prompt.push_str(diff);
            prompt.push_str("\n```\n");
        }
        prompt.push_str(
            "\nIf you are blocked or something is ambiguous, say so with \
             <discovery kind=\"blocker\">...</discovery> or \
             <discovery kind=\"ambiguity\">...</discovery>.\n",
        );
        prompt
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AgentResponse {
    pub cost_usd: f64,
    pub duration_ms: u64,
    pub output: String,
    /// Reviewer verdict; `None` for coders or when no verdict was given
    pub approved: Option<bool>,
    pub issue_count: Option<u32>,
    pub discovery: Option<Discovery>,
}

impl AgentResponse {
    /// Build a response from raw agent text, reading its signals.
    pub fn from_output(output: String, cost_usd: f64, duration_ms: u64) -> Self {
        let signals = extract_signals(&output);
        let issue_count = (signals.verdict.is_some() || !signals.issues.is_empty())
            .then(|| signals.issue_count());
        Self {
            cost_usd,
            duration_ms,
            approved: signals.verdict,
            issue_count,
            discovery: signals.primary_discovery().cloned(),
            output,
        }
    }
}

#[async_trait]
pub trait Agent: Send + Sync {
    async fn invoke(&self, request: AgentRequest) -> Result<AgentResponse, AgentError>;
}
