use muster_core::{ActionProposal, MusterError};
use tokio::sync::Mutex;

/// The conflict-free outcome of one reconciliation window.
#[derive(Debug)]
pub struct Resolution {
    /// Proposals whose claims do not overlap; the final action set.
    pub accepted: Vec<ActionProposal>,
    /// Proposals rejected with the conflict that excluded them.
    pub rejected: Vec<(ActionProposal, MusterError)>,
}

impl Resolution {
    /// Whether the window produced nothing at all.
    pub fn is_empty(&self) -> bool {
        self.accepted.is_empty() && self.rejected.is_empty()
    }
}

/// Reconciles concurrently proposed actions into one conflict-free set.
///
/// Proposals accumulate during a reconciliation window; `resolve` orders
/// them by task priority descending, then proposal timestamp ascending,
/// then task identifier, and accepts each proposal whose declared claims
/// are disjoint from every already-accepted proposal's claims. The same
/// proposal set always partitions the same way.
pub struct Coordinator {
    window: Mutex<Vec<ActionProposal>>,
}

impl Coordinator {
    /// Creates a coordinator with an empty window.
    pub fn new() -> Self {
        Self {
            window: Mutex::new(Vec::new()),
        }
    }

    /// Adds a proposal to the current window.
    pub async fn submit(&self, proposal: ActionProposal) {
        tracing::debug!(
            agent_id = %proposal.agent_id,
            task_id = %proposal.task_id,
            claims = proposal.claims.len(),
            "Proposal submitted"
        );
        self.window.lock().await.push(proposal);
    }

    /// Number of proposals waiting in the current window.
    pub async fn pending_count(&self) -> usize {
        self.window.lock().await.len()
    }

    /// Closes the window and partitions its proposals.
    pub async fn resolve(&self) -> Resolution {
        let mut proposals = {
            let mut window = self.window.lock().await;
            std::mem::take(&mut *window)
        };
        proposals.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.proposed_at.cmp(&b.proposed_at))
                .then_with(|| a.task_id.cmp(&b.task_id))
        });

        let mut taken: std::collections::BTreeSet<String> = std::collections::BTreeSet::new();
        let mut accepted = Vec::new();
        let mut rejected = Vec::new();
        for proposal in proposals {
            match proposal.claims.iter().find(|c| taken.contains(*c)) {
                None => {
                    taken.extend(proposal.claims.iter().cloned());
                    accepted.push(proposal);
                }
                Some(claim) => {
                    let err = MusterError::ProposalConflict {
                        agent: proposal.agent_id.clone(),
                        task: proposal.task_id.clone(),
                        claim: claim.clone(),
                    };
                    rejected.push((proposal, err));
                }
            }
        }
        if !accepted.is_empty() || !rejected.is_empty() {
            tracing::info!(
                accepted = accepted.len(),
                rejected = rejected.len(),
                "Reconciliation window resolved"
            );
        }
        Resolution { accepted, rejected }
    }
}

impl Default for Coordinator {
    fn default() -> Self {
        Self::new()
    }
}
