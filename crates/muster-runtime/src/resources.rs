use chrono::{DateTime, Utc};
use muster_core::{MusterError, MusterResult};
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use uuid::Uuid;

struct ResourceState {
    kind: String,
    capacity: u64,
    ledger: HashMap<String, u64>,
}

impl ResourceState {
    fn allocated(&self) -> u64 {
        self.ledger.values().sum()
    }

    fn free(&self) -> u64 {
        self.capacity - self.allocated()
    }
}

struct PendingRequest {
    id: Uuid,
    holder: String,
    resource: String,
    amount: u64,
    priority: u8,
    queued_at: DateTime<Utc>,
    waiter: oneshot::Sender<()>,
}

struct PoolState {
    resources: HashMap<String, ResourceState>,
    pending: Vec<PendingRequest>,
}

/// Tracks finite shared resources and their allocation ledger.
///
/// Resources are declared once at startup. Requests that cannot be granted
/// immediately suspend in a pending queue that is served in order of
/// requester priority (higher first), then arrival time, whenever a release
/// frees capacity. A request waiting longer than the promotion bound is
/// treated one priority tier higher for each full bound elapsed, so low
/// priority requesters are never starved forever.
///
/// Invariant: the sum of ledger holdings never exceeds total capacity.
pub struct ResourceManager {
    promotion_after: Duration,
    state: Mutex<PoolState>,
}

impl ResourceManager {
    /// Creates an empty pool with the given starvation-promotion bound.
    pub fn new(promotion_after: Duration) -> Self {
        Self {
            promotion_after,
            state: Mutex::new(PoolState {
                resources: HashMap::new(),
                pending: Vec::new(),
            }),
        }
    }

    /// Declares a resource. Startup/configuration time only; redeclaring an
    /// identifier or declaring zero capacity is a configuration error.
    pub async fn declare(
        &self,
        id: impl Into<String>,
        kind: impl Into<String>,
        capacity: u64,
    ) -> MusterResult<()> {
        let id = id.into();
        if capacity == 0 {
            return Err(MusterError::Config(format!(
                "resource '{id}' declared with zero capacity"
            )));
        }
        let mut state = self.state.lock().await;
        if state.resources.contains_key(&id) {
            return Err(MusterError::Config(format!(
                "resource '{id}' declared twice"
            )));
        }
        state.resources.insert(
            id.clone(),
            ResourceState {
                kind: kind.into(),
                capacity,
                ledger: HashMap::new(),
            },
        );
        tracing::info!(resource = %id, capacity, "Resource declared");
        Ok(())
    }

    /// Requests `amount` units of a resource on behalf of `holder`.
    ///
    /// Grants immediately when free capacity suffices, otherwise suspends
    /// until a release frees enough or `timeout` elapses
    /// ([`MusterError::ResourceTimeout`]). Unknown identifiers and amounts
    /// of zero or beyond total capacity fail synchronously.
    pub async fn request(
        &self,
        holder: &str,
        resource: &str,
        amount: u64,
        priority: u8,
        timeout: Duration,
    ) -> MusterResult<()> {
        let request_id = Uuid::new_v4();
        let mut rx = {
            let mut state = self.state.lock().await;
            let res = state
                .resources
                .get_mut(resource)
                .ok_or_else(|| MusterError::UnknownResource(resource.to_string()))?;
            if amount == 0 || amount > res.capacity {
                return Err(MusterError::InvalidAmount {
                    resource: resource.to_string(),
                    amount,
                    capacity: res.capacity,
                });
            }
            if res.free() >= amount {
                *res.ledger.entry(holder.to_string()).or_insert(0) += amount;
                tracing::debug!(holder, resource, amount, "Resource granted");
                return Ok(());
            }
            let (tx, rx) = oneshot::channel();
            state.pending.push(PendingRequest {
                id: request_id,
                holder: holder.to_string(),
                resource: resource.to_string(),
                amount,
                priority,
                queued_at: Utc::now(),
                waiter: tx,
            });
            tracing::debug!(holder, resource, amount, priority, "Resource request queued");
            rx
        };

        // Keep the receiver alive across the timer so a concurrent grant is
        // never lost between the timeout firing and the lock below.
        let granted = tokio::select! {
            res = &mut rx => res.is_ok(),
            () = tokio::time::sleep(timeout) => false,
        };
        if granted {
            return Ok(());
        }

        let mut state = self.state.lock().await;
        if let Some(pos) = state.pending.iter().position(|p| p.id == request_id) {
            state.pending.remove(pos);
            return Err(MusterError::ResourceTimeout(resource.to_string()));
        }
        // The grant landed while the timer was firing.
        Ok(())
    }

    /// Releases `amount` units held by `holder`, then serves the pending
    /// queue. Releasing more than is held fails with
    /// [`MusterError::OverRelease`] and changes nothing.
    pub async fn release(&self, holder: &str, resource: &str, amount: u64) -> MusterResult<()> {
        let mut state = self.state.lock().await;
        let res = state
            .resources
            .get_mut(resource)
            .ok_or_else(|| MusterError::UnknownResource(resource.to_string()))?;
        let held = res.ledger.get(holder).copied().unwrap_or(0);
        if amount > held {
            return Err(MusterError::OverRelease {
                holder: holder.to_string(),
                resource: resource.to_string(),
                amount,
                held,
            });
        }
        if held == amount {
            res.ledger.remove(holder);
        } else if let Some(entry) = res.ledger.get_mut(holder) {
            *entry -= amount;
        }
        tracing::debug!(holder, resource, amount, "Resource released");
        Self::grant_pass(&mut state, self.promotion_after);
        Ok(())
    }

    /// Re-runs the grant pass. Periodic calls apply starvation promotion
    /// even when no release happened.
    pub async fn kick(&self) {
        let mut state = self.state.lock().await;
        Self::grant_pass(&mut state, self.promotion_after);
    }

    fn effective_priority(request: &PendingRequest, now: DateTime<Utc>, bound: Duration) -> u8 {
        if bound.is_zero() {
            return request.priority;
        }
        let waited = (now - request.queued_at).to_std().unwrap_or_default();
        let tiers = (waited.as_millis() / bound.as_millis()).min(u64::from(u8::MAX) as u128) as u8;
        request.priority.saturating_add(tiers)
    }

    /// Serves pending requests in (effective priority desc, arrival asc)
    /// order. A request that does not fit blocks later requests for the
    /// same resource, so the grant order stays fair; other resources keep
    /// being served.
    fn grant_pass(state: &mut PoolState, promotion_after: Duration) {
        // Runs again whenever a grant was reclaimed from a vanished waiter:
        // the freed units may fit a request this iteration already skipped.
        while Self::grant_once(state, promotion_after) {}
    }

    /// One grant iteration. Returns whether any granted units were
    /// reclaimed because the requester dropped out before the grant landed.
    fn grant_once(state: &mut PoolState, promotion_after: Duration) -> bool {
        let now = Utc::now();
        let mut order: Vec<usize> = (0..state.pending.len()).collect();
        order.sort_by(|&a, &b| {
            let (pa, pb) = (
                Self::effective_priority(&state.pending[a], now, promotion_after),
                Self::effective_priority(&state.pending[b], now, promotion_after),
            );
            pb.cmp(&pa)
                .then_with(|| state.pending[a].queued_at.cmp(&state.pending[b].queued_at))
                .then_with(|| state.pending[a].id.cmp(&state.pending[b].id))
        });

        let mut blocked: HashSet<String> = HashSet::new();
        let mut granted: Vec<usize> = Vec::new();
        for idx in order {
            let (resource, holder, amount) = {
                let p = &state.pending[idx];
                (p.resource.clone(), p.holder.clone(), p.amount)
            };
            if blocked.contains(&resource) {
                continue;
            }
            let Some(res) = state.resources.get_mut(&resource) else {
                continue;
            };
            if res.free() >= amount {
                *res.ledger.entry(holder).or_insert(0) += amount;
                granted.push(idx);
            } else {
                blocked.insert(resource);
            }
        }

        granted.sort_unstable_by(|a, b| b.cmp(a));
        let mut reclaimed = false;
        for idx in granted {
            let request = state.pending.remove(idx);
            if request.waiter.send(()).is_err() {
                // The requester vanished before the grant arrived; take the
                // units back so they are not leaked.
                if let Some(res) = state.resources.get_mut(&request.resource) {
                    if let Some(held) = res.ledger.get_mut(&request.holder) {
                        *held = held.saturating_sub(request.amount);
                        if *held == 0 {
                            res.ledger.remove(&request.holder);
                        }
                    }
                }
                reclaimed = true;
            } else {
                tracing::debug!(
                    holder = %request.holder,
                    resource = %request.resource,
                    amount = request.amount,
                    "Queued resource request granted"
                );
            }
        }
        reclaimed
    }

    /// The allocation ledger for a resource: holder → units held.
    pub async fn ledger(&self, resource: &str) -> MusterResult<HashMap<String, u64>> {
        let state = self.state.lock().await;
        state
            .resources
            .get(resource)
            .map(|r| r.ledger.clone())
            .ok_or_else(|| MusterError::UnknownResource(resource.to_string()))
    }

    /// Allocated fraction of a resource's capacity, in `[0, 1]`.
    pub async fn utilization(&self, resource: &str) -> MusterResult<f64> {
        let state = self.state.lock().await;
        state
            .resources
            .get(resource)
            .map(|r| r.allocated() as f64 / r.capacity as f64)
            .ok_or_else(|| MusterError::UnknownResource(resource.to_string()))
    }

    /// The declared kind of a resource.
    pub async fn kind(&self, resource: &str) -> MusterResult<String> {
        let state = self.state.lock().await;
        state
            .resources
            .get(resource)
            .map(|r| r.kind.clone())
            .ok_or_else(|| MusterError::UnknownResource(resource.to_string()))
    }

    /// Declared resource identifiers, ordered.
    pub async fn resource_ids(&self) -> Vec<String> {
        let state = self.state.lock().await;
        let mut ids: Vec<String> = state.resources.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Number of requests waiting for capacity.
    pub async fn pending_count(&self) -> usize {
        self.state.lock().await.pending.len()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const NO_WAIT: Duration = Duration::from_millis(50);
    const PROMOTE_SLOW: Duration = Duration::from_secs(3600);

    async fn pool_with(id: &str, capacity: u64) -> ResourceManager {
        let pool = ResourceManager::new(PROMOTE_SLOW);
        pool.declare(id, "generic", capacity).await.unwrap();
        pool
    }

    #[tokio::test]
    async fn test_unknown_resource_and_invalid_amount() {
        let pool = pool_with("gpu", 4).await;
        let err = pool
            .request("h-1", "tpu", 1, 0, NO_WAIT)
            .await
            .unwrap_err();
        assert!(matches!(err, MusterError::UnknownResource(_)));

        let err = pool.request("h-1", "gpu", 5, 0, NO_WAIT).await.unwrap_err();
        assert!(matches!(err, MusterError::InvalidAmount { .. }));
        let err = pool.request("h-1", "gpu", 0, 0, NO_WAIT).await.unwrap_err();
        assert!(matches!(err, MusterError::InvalidAmount { .. }));
    }

    #[tokio::test]
    async fn test_immediate_grant_and_ledger() {
        let pool = pool_with("gpu", 4).await;
        pool.request("h-1", "gpu", 3, 0, NO_WAIT).await.unwrap();
        let ledger = pool.ledger("gpu").await.unwrap();
        assert_eq!(ledger.get("h-1"), Some(&3));
        assert_eq!(pool.utilization("gpu").await.unwrap(), 0.75);
    }

    #[tokio::test]
    async fn test_request_times_out_when_saturated() {
        let pool = pool_with("gpu", 2).await;
        pool.request("h-1", "gpu", 2, 0, NO_WAIT).await.unwrap();

        let err = pool
            .request("h-2", "gpu", 1, 0, Duration::from_millis(30))
            .await
            .unwrap_err();
        assert!(matches!(err, MusterError::ResourceTimeout(_)));
        assert_eq!(pool.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_release_wakes_pending_request() {
        let pool = Arc::new(pool_with("gpu", 2).await);
        pool.request("h-1", "gpu", 2, 0, NO_WAIT).await.unwrap();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move {
                pool.request("h-2", "gpu", 1, 0, Duration::from_secs(5)).await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(pool.pending_count().await, 1);

        pool.release("h-1", "gpu", 1).await.unwrap();
        waiter.await.unwrap().unwrap();
        let ledger = pool.ledger("gpu").await.unwrap();
        assert_eq!(ledger.get("h-1"), Some(&1));
        assert_eq!(ledger.get("h-2"), Some(&1));
    }

    #[tokio::test]
    async fn test_grants_by_priority_then_arrival() {
        let pool = Arc::new(pool_with("gpu", 2).await);
        pool.request("owner", "gpu", 2, 0, NO_WAIT).await.unwrap();

        let spawn_request = |holder: &str, priority: u8| {
            let pool = pool.clone();
            let holder = holder.to_string();
            tokio::spawn(async move {
                pool.request(&holder, "gpu", 1, priority, Duration::from_secs(5))
                    .await
            })
        };
        let h1 = spawn_request("h-1", 1);
        tokio::time::sleep(Duration::from_millis(10)).await;
        let h2 = spawn_request("h-2", 1);
        tokio::time::sleep(Duration::from_millis(10)).await;
        let h3 = spawn_request("h-3", 2);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(pool.pending_count().await, 3);

        // Two units free up: priority 2 first, then the earlier arrival.
        pool.release("owner", "gpu", 2).await.unwrap();
        h3.await.unwrap().unwrap();
        h1.await.unwrap().unwrap();
        assert_eq!(pool.pending_count().await, 1);

        pool.release("h-3", "gpu", 1).await.unwrap();
        h2.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_reclaimed_grant_serves_next_pending_same_pass() {
        let pool = Arc::new(pool_with("gpu", 1).await);
        pool.request("owner", "gpu", 1, 0, NO_WAIT).await.unwrap();

        // A high-priority waiter queues up, then drops out entirely.
        let ghost = {
            let pool = pool.clone();
            tokio::spawn(async move {
                pool.request("ghost", "gpu", 1, 9, Duration::from_secs(5)).await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        ghost.abort();
        let _ = ghost.await;

        let live = {
            let pool = pool.clone();
            tokio::spawn(async move {
                pool.request("live", "gpu", 1, 0, Duration::from_secs(5)).await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(pool.pending_count().await, 2);

        // The release lands on the vanished waiter first; the reclaimed
        // unit must reach the live request without another release.
        pool.release("owner", "gpu", 1).await.unwrap();
        live.await.unwrap().unwrap();
        assert_eq!(pool.ledger("gpu").await.unwrap().get("live"), Some(&1));
        assert_eq!(pool.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_over_release() {
        let pool = pool_with("gpu", 4).await;
        pool.request("h-1", "gpu", 2, 0, NO_WAIT).await.unwrap();
        let err = pool.release("h-1", "gpu", 3).await.unwrap_err();
        assert!(matches!(err, MusterError::OverRelease { .. }));
        // And nothing changed.
        assert_eq!(pool.ledger("gpu").await.unwrap().get("h-1"), Some(&2));

        let err = pool.release("ghost", "gpu", 1).await.unwrap_err();
        assert!(matches!(err, MusterError::OverRelease { .. }));
    }

    #[tokio::test]
    async fn test_starvation_promotion_overtakes() {
        let pool = Arc::new(ResourceManager::new(Duration::from_millis(30)));
        pool.declare("gpu", "generic", 1).await.unwrap();
        pool.request("owner", "gpu", 1, 0, NO_WAIT).await.unwrap();

        // Low priority waits first; high priority arrives later.
        let low = {
            let pool = pool.clone();
            tokio::spawn(async move {
                pool.request("low", "gpu", 1, 1, Duration::from_secs(5)).await
            })
        };
        tokio::time::sleep(Duration::from_millis(60)).await;
        let high = {
            let pool = pool.clone();
            tokio::spawn(
                async move { pool.request("high", "gpu", 1, 2, Duration::from_secs(5)).await },
            )
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        // "low" has aged two promotion bounds: effective priority 3 beats 2.
        pool.release("owner", "gpu", 1).await.unwrap();
        low.await.unwrap().unwrap();
        assert_eq!(pool.pending_count().await, 1);
        pool.release("low", "gpu", 1).await.unwrap();
        high.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_ledger_never_exceeds_capacity() {
        let pool = Arc::new(pool_with("gpu", 3).await);
        let mut handles = Vec::new();
        for i in 0..8 {
            let pool = pool.clone();
            handles.push(tokio::spawn(async move {
                let holder = format!("h-{i}");
                if pool
                    .request(&holder, "gpu", 1 + (i % 2), 0, Duration::from_millis(80))
                    .await
                    .is_ok()
                {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    pool.release(&holder, "gpu", 1 + (i % 2)).await.unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        let total: u64 = pool.ledger("gpu").await.unwrap().values().sum();
        assert_eq!(total, 0);
    }
}
