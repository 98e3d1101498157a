//! 请求上下文：调用方身份、优先级、操作标签与取消信号，并据此推导限流键。
//!
//! Per-request context handed to the engine. It selects which limiter keys
//! apply, carries the priority used by the admission queue, and holds the
//! cancellation token and idempotency key shared by every attempt.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Queue priority. Higher priorities are admitted first once capacity exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Critical,
    High,
    #[default]
    Normal,
    Low,
}

impl Priority {
    pub fn rank(&self) -> u8 {
        match self {
            Priority::Critical => 3,
            Priority::High => 2,
            Priority::Normal => 1,
            Priority::Low => 0,
        }
    }
}

impl PartialOrd for Priority {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Priority {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.rank().cmp(&other.rank())
    }
}

/// Kinds of limiter key. A key is `global` or `<scope>:<id>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scope {
    Global,
    User,
    Agent,
    Workspace,
    Provider,
    Operation,
}

impl Scope {
    pub const ALL: [Scope; 6] = [
        Scope::Global,
        Scope::User,
        Scope::Agent,
        Scope::Workspace,
        Scope::Provider,
        Scope::Operation,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Scope::Global => "global",
            Scope::User => "user",
            Scope::Agent => "agent",
            Scope::Workspace => "workspace",
            Scope::Provider => "provider",
            Scope::Operation => "operation",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|sc| sc.name() == s)
    }

    pub fn key(&self, id: &str) -> String {
        match self {
            Scope::Global => "global".to_string(),
            _ => format!("{}:{}", self.name(), id),
        }
    }
}

/// Everything the core needs to know about one logical request.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: String,
    /// Reused across every attempt and target of this request.
    pub idempotency_key: String,
    pub caller_id: Option<String>,
    pub agent_id: Option<String>,
    pub workspace_id: Option<String>,
    pub operation: Option<String>,
    pub priority: Priority,
    /// Weighted admission units (e.g. estimated tokens); defaults to 1.
    pub cost: u32,
    /// Wait in the admission queue instead of skipping a denied target.
    pub wait_for_admission: bool,
    /// Overrides the configured overall request timeout.
    pub timeout: Option<Duration>,
    pub cancel: CancellationToken,
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestContext {
    pub fn new() -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            idempotency_key: uuid::Uuid::new_v4().to_string(),
            caller_id: None,
            agent_id: None,
            workspace_id: None,
            operation: None,
            priority: Priority::Normal,
            cost: 1,
            wait_for_admission: false,
            timeout: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_request_id(mut self, id: impl Into<String>) -> Self {
        self.request_id = id.into();
        self
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = key.into();
        self
    }

    pub fn with_caller(mut self, id: impl Into<String>) -> Self {
        self.caller_id = Some(id.into());
        self
    }

    pub fn with_agent(mut self, id: impl Into<String>) -> Self {
        self.agent_id = Some(id.into());
        self
    }

    pub fn with_workspace(mut self, id: impl Into<String>) -> Self {
        self.workspace_id = Some(id.into());
        self
    }

    pub fn with_operation(mut self, op: impl Into<String>) -> Self {
        self.operation = Some(op.into());
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_cost(mut self, cost: u32) -> Self {
        self.cost = cost;
        self
    }

    pub fn wait_for_admission(mut self, wait: bool) -> Self {
        self.wait_for_admission = wait;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Limiter keys for a call to `provider`, most general first.
    ///
    /// Keys for identities the context does not carry are omitted; whether a
    /// key is actually limited is decided by configuration.
    pub fn limit_keys(&self, provider: &str) -> Vec<String> {
        let mut keys = vec![Scope::Global.key("")];
        if let Some(ref id) = self.caller_id {
            keys.push(Scope::User.key(id));
        }
        if let Some(ref id) = self.agent_id {
            keys.push(Scope::Agent.key(id));
        }
        if let Some(ref id) = self.workspace_id {
            keys.push(Scope::Workspace.key(id));
        }
        keys.push(Scope::Provider.key(provider));
        if let Some(ref op) = self.operation {
            keys.push(Scope::Operation.key(op));
        }
        keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::Critical > Priority::High);
        assert!(Priority::High > Priority::Normal);
        assert!(Priority::Normal > Priority::Low);
        assert_eq!(Priority::default(), Priority::Normal);
    }

    #[test]
    fn test_limit_keys() {
        let ctx = RequestContext::new()
            .with_caller("42")
            .with_agent("support")
            .with_operation("chat");
        assert_eq!(
            ctx.limit_keys("openai"),
            vec!["global", "user:42", "agent:support", "provider:openai", "operation:chat"]
        );
        assert_eq!(RequestContext::new().limit_keys("groq"), vec!["global", "provider:groq"]);
    }

    #[test]
    fn test_new_context_has_distinct_ids() {
        let a = RequestContext::new();
        let b = RequestContext::new();
        assert_ne!(a.request_id, b.request_id);
        assert_ne!(a.idempotency_key, a.request_id);
        assert_eq!(a.cost, 1);
    }

    #[test]
    fn test_scope_parse() {
        assert_eq!(Scope::parse("workspace"), Some(Scope::Workspace));
        assert_eq!(Scope::parse("tenant"), None);
        assert_eq!(Scope::Agent.key("x"), "agent:x");
    }
}
