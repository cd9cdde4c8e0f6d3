//! Schedule policy chain
//!
//! Pluggable accept/reject policies evaluated on every remote schedule
//! proposal before commit. The chain runs left to right and the first
//! reject short-circuits; an empty chain admits everything.

use crate::error::FabricError;
use crate::node::NodeId;
use crate::resources::ResourceInfo;

/// Everything a policy may inspect about a proposal
#[derive(Debug, Clone)]
pub struct PolicyContext {
    /// Proposing node
    pub node_id: NodeId,
    /// Proposing node's name
    pub node_name: String,
    /// Candidate provider on that node
    pub provider_id: String,
    /// Provider headroom at proposal time
    pub available: ResourceInfo,
    /// The placement request
    pub request: ResourceInfo,
    /// Domain of the proposing node
    pub proposal_domain_id: String,
    /// The deciding node
    pub local_node_id: NodeId,
    /// The deciding node's domain
    pub local_domain_id: String,
}

/// Outcome of one policy
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyDecision {
    /// Proposal may proceed to commit
    Accept,
    /// Proposal is dropped; the caller tries the next one
    Reject {
        /// Name of the rejecting policy
        policy: String,
        /// Short human-readable reason
        reason: String,
    },
}

/// One pluggable policy
pub trait SchedulePolicy: Send + Sync {
    /// Stable policy name, used in reject messages
    fn name(&self) -> &str;

    /// Evaluate one proposal
    fn evaluate(&self, ctx: &PolicyContext) -> PolicyDecision;
}

/// An ordered chain of policies
#[derive(Default)]
pub struct PolicyChain {
    policies: Vec<Box<dyn SchedulePolicy>>,
}

impl PolicyChain {
    /// The empty, admit-everything chain
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a policy
    pub fn with(mut self, policy: Box<dyn SchedulePolicy>) -> Self {
        self.policies.push(policy);
        self
    }

    /// Evaluate left to right; the first reject wins.
    pub fn evaluate(&self, ctx: &PolicyContext) -> PolicyDecision {
        for policy in &self.policies {
            if let PolicyDecision::Reject { policy, reason } = policy.evaluate(ctx) {
                return PolicyDecision::Reject { policy, reason };
            }
        }
        PolicyDecision::Accept
    }

    /// Evaluate, mapping rejection to its error form.
    pub fn check(&self, ctx: &PolicyContext) -> Result<(), FabricError> {
        match self.evaluate(ctx) {
            PolicyDecision::Accept => Ok(()),
            PolicyDecision::Reject { policy, reason } => {
                Err(FabricError::PolicyRejected { policy, reason })
            }
        }
    }
}

/// The default policy: admits every proposal.
pub struct AdmitAll;

impl SchedulePolicy for AdmitAll {
    fn name(&self) -> &str {
        "admit-all"
    }

    fn evaluate(&self, _ctx: &PolicyContext) -> PolicyDecision {
        PolicyDecision::Accept
    }
}

/// Rejects proposals whose node lives in another domain. Gossip
/// already drops cross-domain records, so this is the policy-level
/// restatement of the same boundary.
pub struct DomainGuard;

impl SchedulePolicy for DomainGuard {
    fn name(&self) -> &str {
        "domain-guard"
    }

    fn evaluate(&self, ctx: &PolicyContext) -> PolicyDecision {
        if ctx.proposal_domain_id == ctx.local_domain_id {
            PolicyDecision::Accept
        } else {
            PolicyDecision::Reject {
                policy: self.name().to_string(),
                reason: format!(
                    "node {} is in domain {}, not {}",
                    ctx.node_id, ctx.proposal_domain_id, ctx.local_domain_id
                ),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(domain: &str) -> PolicyContext {
        PolicyContext {
            node_id: "node.b".to_string(),
            node_name: "b".to_string(),
            provider_id: "p1".to_string(),
            available: ResourceInfo::new(4000, 0, 0),
            request: ResourceInfo::new(1000, 0, 0),
            proposal_domain_id: domain.to_string(),
            local_node_id: "node.a".to_string(),
            local_domain_id: "dom".to_string(),
        }
    }

    struct RejectProvider(&'static str);

    impl SchedulePolicy for RejectProvider {
        fn name(&self) -> &str {
            "reject-provider"
        }

        fn evaluate(&self, ctx: &PolicyContext) -> PolicyDecision {
            if ctx.provider_id == self.0 {
                PolicyDecision::Reject {
                    policy: self.name().to_string(),
                    reason: format!("provider {} is deny-listed", self.0),
                }
            } else {
                PolicyDecision::Accept
            }
        }
    }

    #[test]
    fn empty_chain_accepts() {
        assert_eq!(PolicyChain::new().evaluate(&ctx("dom")), PolicyDecision::Accept);
    }

    #[test]
    fn first_reject_short_circuits() {
        let chain = PolicyChain::new()
            .with(Box::new(AdmitAll))
            .with(Box::new(RejectProvider("p1")))
            .with(Box::new(RejectProvider("p2")));
        match chain.evaluate(&ctx("dom")) {
            PolicyDecision::Reject { policy, reason } => {
                assert_eq!(policy, "reject-provider");
                assert!(reason.contains("p1"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn rejections_render_with_the_policy_name() {
        let chain = PolicyChain::new().with(Box::new(DomainGuard));
        let err = chain.check(&ctx("elsewhere")).unwrap_err();
        assert!(err.to_string().starts_with("[domain-guard]"));
    }

    #[test]
    fn domain_guard_accepts_same_domain() {
        let chain = PolicyChain::new().with(Box::new(DomainGuard));
        assert!(chain.check(&ctx("dom")).is_ok());
    }
}
