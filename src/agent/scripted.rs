use super::{Agent, AgentRequest, AgentResponse, AgentRole};
use crate::errors::AgentError;
use crate::phase::PhaseId;
use crate::signals::{Discovery, DiscoveryKind};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

/// One scripted turn.
#[derive(Debug, Clone)]
pub enum ScriptedResponse {
    Reply(AgentResponse),
    /// Reply after sleeping
    Slow(Duration, AgentResponse),
    Fail(String),
    Panic(String),
}

impl ScriptedResponse {
    /// A coder turn costing `cost_usd`.
    pub fn work(cost_usd: f64) -> Self {
        ScriptedResponse::Reply(AgentResponse {
            cost_usd,
            output: "done".to_string(),
            ..Default::default()
        })
    }

    pub fn approve(cost_usd: f64) -> Self {
        ScriptedResponse::Reply(AgentResponse {
            cost_usd,
            output: "<verdict>approve</verdict>".to_string(),
            approved: Some(true),
            issue_count: Some(0),
            ..Default::default()
        })
    }

    pub fn revise(cost_usd: f64, issues: u32) -> Self {
        ScriptedResponse::Reply(AgentResponse {
            cost_usd,
            output: "<verdict>revise</verdict>".to_string(),
            approved: Some(false),
            issue_count: Some(issues),
            ..Default::default()
        })
    }

    /// A coder turn that raises a discovery.
    pub fn discover(cost_usd: f64, kind: DiscoveryKind, detail: &str) -> Self {
        ScriptedResponse::Reply(AgentResponse {
            cost_usd,
            output: detail.to_string(),
            discovery: Some(Discovery::new(kind, detail)),
            ..Default::default()
        })
    }
}

/// Replays a fixed script of responses per phase and role.
///
/// When a phase's script runs out, the role's default is used; with no
/// default the invocation fails with `AgentError::ScriptExhausted`.
#[derive(Default)]
pub struct ScriptedAgent {
    scripts: Mutex<HashMap<(PhaseId, AgentRole), VecDeque<ScriptedResponse>>>,
    defaults: HashMap<AgentRole, ScriptedResponse>,
    requests: Mutex<Vec<AgentRequest>>,
}

impl ScriptedAgent {
    pub fn new() -> Self {
        Self::default()
    }

    /// Free coder turns and immediate approvals for every phase.
    pub fn approving() -> Self {
        Self::new()
            .with_default(AgentRole::Coder, ScriptedResponse::work(0.0))
            .with_default(AgentRole::Reviewer, ScriptedResponse::approve(0.0))
    }

    pub fn with_default(mut self, role: AgentRole, response: ScriptedResponse) -> Self {
        self.defaults.insert(role, response);
        self
    }

    /// Append turns to the script of one phase and role.
    pub fn script(
        self,
        phase: &str,
        role: AgentRole,
        responses: impl IntoIterator<Item = ScriptedResponse>,
    ) -> Self {
        self.scripts
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .entry((PhaseId::new(phase), role))
            .or_default()
            .extend(responses);
        self
    }

    /// Every request received so far, in order.
    pub fn requests(&self) -> Vec<AgentRequest> {
        self.requests
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    fn next(&self, phase: &PhaseId, role: AgentRole) -> Option<ScriptedResponse> {
        let scripted = self
            .scripts
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get_mut(&(phase.clone(), role))
            .and_then(VecDeque::pop_front);
        scripted.or_else(|| self.defaults.get(&role).cloned())
    }
}

#[async_trait]
impl Agent for ScriptedAgent {
    async fn invoke(&self, request: AgentRequest) -> Result<AgentResponse, AgentError> {
        let phase = request.phase_id.clone();
        let role = request.role;
        self.requests
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(request);

        match self.next(&phase, role) {
            Some(ScriptedResponse::Reply(response)) => Ok(response),
            Some(ScriptedResponse::Slow(delay, response)) => {
                tokio::time::sleep(delay).await;
                Ok(response)
            }
            Some(ScriptedResponse::Fail(message)) => Err(AgentError::Reported(message)),
            Some(ScriptedResponse::Panic(message)) => panic!("{}", message),
            None => Err(AgentError::ScriptExhausted {
                phase: phase.to_string(),
                role: role.to_string(),
            }),
        }
    }
}
