//! Least-privilege boundary for every action the orchestrator issues.
//!
//! The boundary is computed once from an [Identity] and is read-only thereafter. It is built
//! from two disjoint statement groups:
//!
//! 1. Observability: log-group/log-stream creation and event writes, scoped to the
//!    [LOG_GROUP_NAMESPACE] of the account and region.
//! 2. Deployment lifecycle: stack actions scoped to the stack, stack-set and change-set
//!    resource patterns of the account and region, plus the [WILDCARD_ACTIONS] that cannot be
//!    resource-scoped and are granted against `*`.
//!
//! Anything outside these statements is denied.

use crate::config::Identity;
use serde_json::json;

/// Log-group namespace observability actions are scoped to.
pub const LOG_GROUP_NAMESPACE: &str = "/aws/lambda/*";

/// Observability actions.
pub const LOG_ACTIONS: &[&str] = &[
    "logs:CreateLogGroup",
    "logs:CreateLogStream",
    "logs:PutLogEvents",
];

/// Deployment-lifecycle actions scoped to stack resources.
pub const STACK_ACTIONS: &[&str] = &[
    "cloudformation:SetStackPolicy",
    "cloudformation:DescribeStackResources",
    "cloudformation:SignalResource",
    "cloudformation:DescribeStackResource",
    "cloudformation:GetTemplateSummary",
    "cloudformation:DescribeStacks",
    "cloudformation:RollbackStack",
    "cloudformation:GetStackPolicy",
    "cloudformation:DescribeStackEvents",
    "cloudformation:CreateStack",
    "cloudformation:GetTemplate",
    "cloudformation:DeleteStack",
    "cloudformation:TagResource",
    "cloudformation:UpdateStack",
    "cloudformation:UntagResource",
    "cloudformation:ListStackResources",
    "cloudformation:CancelUpdateStack",
];

/// Actions that cannot be resource-scoped and are granted against the wildcard resource.
pub const WILDCARD_ACTIONS: &[&str] = &[
    "cloudformation:RegisterType",
    "cloudformation:ListStacks",
    "cloudformation:SetTypeDefaultVersion",
    "cloudformation:DescribeType",
    "cloudformation:PublishType",
    "cloudformation:ListTypes",
    "cloudformation:DeactivateType",
    "cloudformation:SetTypeConfiguration",
    "cloudformation:DeregisterType",
    "cloudformation:ListTypeRegistrations",
    "cloudformation:TestType",
    "cloudformation:ValidateTemplate",
    "cloudformation:ListTypeVersions",
];

/// The wildcard resource.
pub const ANY_RESOURCE: &str = "*";

/// Returns the ARN of a stack.
///
/// Before the backend has assigned a stack id, `id` is `None` and the ARN ends in a wildcard.
pub fn stack_arn(identity: &Identity, name: &str, id: Option<&str>) -> String {
    match id {
        Some(id) if id.starts_with("arn:") => id.to_string(),
        Some(id) => format!(
            "arn:aws:cloudformation:{}:{}:stack/{name}/{id}",
            identity.region, identity.account
        ),
        None => format!(
            "arn:aws:cloudformation:{}:{}:stack/{name}/*",
            identity.region, identity.account
        ),
    }
}

/// Matches `value` against an IAM-style pattern (`*` matches any run of characters, `?`
/// matches exactly one).
pub fn matches(pattern: &str, value: &str) -> bool {
    let pattern = pattern.as_bytes();
    let value = value.as_bytes();
    let (mut p, mut v) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;
    while v < value.len() {
        if p < pattern.len() && pattern[p] == b'*' {
            backtrack = Some((p, v));
            p += 1;
        } else if p < pattern.len() && (pattern[p] == b'?' || pattern[p] == value[v]) {
            p += 1;
            v += 1;
        } else if let Some((star, matched)) = backtrack {
            // Let the last `*` absorb one more character
            p = star + 1;
            v = matched + 1;
            backtrack = Some((star, v));
        } else {
            return false;
        }
    }
    pattern[p..].iter().all(|&c| c == b'*')
}

/// A single allow statement.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Statement {
    pub sid: String,
    pub actions: Vec<String>,
    pub resources: Vec<String>,
}

impl Statement {
    fn new(sid: &str, actions: &[&str], resources: Vec<String>) -> Self {
        Self {
            sid: sid.to_string(),
            actions: actions.iter().map(|a| a.to_string()).collect(),
            resources,
        }
    }

    fn allows(&self, action: &str, resource: &str) -> bool {
        self.actions.iter().any(|a| a.eq_ignore_ascii_case(action))
            && self.resources.iter().any(|r| matches(r, resource))
    }
}

/// The fixed set of actions the orchestrator may invoke.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PermissionSet {
    statements: Vec<Statement>,
}

impl PermissionSet {
    /// Computes the boundary for an account and region.
    pub fn for_identity(identity: &Identity) -> Self {
        let Identity { account, region } = identity;
        let logs = Statement::new(
            "LogDelivery",
            LOG_ACTIONS,
            vec![format!(
                "arn:aws:logs:{region}:{account}:log-group:{LOG_GROUP_NAMESPACE}"
            )],
        );
        let stacks = Statement::new(
            "StackLifecycle",
            STACK_ACTIONS,
            vec![
                format!("arn:aws:cloudformation:{region}:{account}:stackset/*"),
                format!("arn:aws:cloudformation:{region}:{account}:stack/*/*"),
                format!("arn:aws:cloudformation:{region}:{account}:changeSet/*/*"),
            ],
        );
        let types = Statement::new(
            "TypeRegistration",
            WILDCARD_ACTIONS,
            vec![ANY_RESOURCE.to_string()],
        );
        Self::new(vec![logs, stacks, types])
    }

    /// Creates a boundary from explicit statements.
    pub fn new(statements: Vec<Statement>) -> Self {
        Self { statements }
    }

    /// Returns true if `action` on `resource` is granted by some statement.
    pub fn is_allowed(&self, action: &str, resource: &str) -> bool {
        self.statements.iter().any(|s| s.allows(action, resource))
    }

    /// Returns every allowed action.
    pub fn allowed_actions(&self) -> impl Iterator<Item = &str> {
        self.statements
            .iter()
            .flat_map(|s| s.actions.iter().map(String::as_str))
    }

    /// Returns every resource pattern.
    pub fn resource_scopes(&self) -> impl Iterator<Item = &str> {
        self.statements
            .iter()
            .flat_map(|s| s.resources.iter().map(String::as_str))
    }

    /// Returns the actions granted against the wildcard resource.
    pub fn wildcard_actions(&self) -> Vec<&str> {
        self.statements
            .iter()
            .filter(|s| s.resources.iter().any(|r| r == ANY_RESOURCE))
            .flat_map(|s| s.actions.iter().map(String::as_str))
            .collect()
    }

    pub fn statements(&self) -> &[Statement] {
        &self.statements
    }

    /// Renders the boundary as an IAM policy document.
    pub fn policy_document(&self) -> serde_json::Value {
        json!({
            "Version": "2012-10-17",
            "Statement": self
                .statements
                .iter()
                .map(|s| {
                    json!({
                        "Sid": s.sid,
                        "Effect": "Allow",
                        "Action": s.actions,
                        "Resource": s.resources,
                    })
                })
                .collect::<Vec<_>>(),
        })
    }
}
