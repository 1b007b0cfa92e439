//! Lock arbitration state. Everything here runs under the lock manager's
//! single mutex and never awaits.

use crate::lock::deadlock::WaitForGraph;
use crate::lock::types::*;
use std::collections::HashMap;
use tokio::sync::oneshot;
use tracing::{debug, warn};

pub(crate) type GrantSender = oneshot::Sender<Result<(), DatastoreError>>;

#[derive(Debug, Clone)]
pub(crate) struct Holder {
    pub request_id: RequestId,
    pub owner: OwnerId,
    pub lock_type: LockType,
}

#[derive(Default)]
pub(crate) struct ResourceState {
    pub holders: Vec<Holder>,
    /// Waiting request ids, highest priority first then oldest first
    pub queue: Vec<RequestId>,
}

pub(crate) struct Waiter {
    pub request: LockRequest,
    pub grant: GrantSender,
}

#[derive(Default)]
pub(crate) struct LockTable {
    pub resources: HashMap<String, ResourceState>,
    pub waiters: HashMap<RequestId, Waiter>,
    /// Granted request id -> resource key
    pub granted: HashMap<RequestId, String>,
    pub graph: WaitForGraph,
    pub stats: LockStats,
}

pub(crate) enum Admission {
    Granted,
    Queued,
}

impl ResourceState {
    /// Whether `owner` may take `lock_type` now. Locks already held by the same
    /// owner never conflict with it.
    fn compatible(&self, owner: OwnerId, lock_type: LockType) -> bool {
        let mut others = self.holders.iter().filter(|h| h.owner != owner);
        match lock_type {
            LockType::Shared => !others.any(|h| h.lock_type == LockType::Exclusive),
            LockType::Exclusive => others.next().is_none(),
        }
    }

    fn conflicting_owners(&self, owner: OwnerId, lock_type: LockType) -> Vec<OwnerId> {
        let mut owners: Vec<OwnerId> = self
            .holders
            .iter()
            .filter(|h| h.owner != owner)
            .filter(|h| lock_type == LockType::Exclusive || h.lock_type == LockType::Exclusive)
            .map(|h| h.owner)
            .collect();
        owners.sort();
        owners.dedup();
        owners
    }
}

impl LockTable {
    /// Grant `request` if it is compatible with the current holders
    pub fn try_grant(&mut self, request: &LockRequest) -> bool {
        let resource = self.resources.entry(request.resource_key.clone()).or_default();
        if !resource.compatible(request.owner, request.lock_type) {
            return false;
        }
        resource.holders.push(Holder {
            request_id: request.id,
            owner: request.owner,
            lock_type: request.lock_type,
        });
        self.granted.insert(request.id, request.resource_key.clone());
        self.stats.granted_total += 1;
        true
    }

    /// Grant immediately when compatible, otherwise enqueue and record the
    /// wait-for edges.
    pub fn admit(&mut self, request: LockRequest, grant: GrantSender) -> Admission {
        if self.try_grant(&request) {
            return Admission::Granted;
        }

        let resource = self.resources.entry(request.resource_key.clone()).or_default();
        let blockers = resource.conflicting_owners(request.owner, request.lock_type);
        let position = resource
            .queue
            .iter()
            .position(|queued| {
                self.waiters.get(queued).is_some_and(|w| {
                    w.request.priority < request.priority
                        || (w.request.priority == request.priority
                            && w.request.requested_at > request.requested_at)
                })
            })
            .unwrap_or(resource.queue.len());
        resource.queue.insert(position, request.id);

        debug!(
            request = %request.id,
            owner = %request.owner,
            resource = %request.resource_key,
            lock_type = %request.lock_type,
            blockers = blockers.len(),
            "Lock request queued"
        );
        self.graph.set_waits(request.owner, blockers);
        self.waiters.insert(request.id, Waiter { request, grant });
        Admission::Queued
    }

    /// Release a granted lock and hand the resource to compatible waiters
    pub fn release(&mut self, request_id: RequestId) -> bool {
        let Some(key) = self.granted.remove(&request_id) else {
            return false;
        };
        if let Some(resource) = self.resources.get_mut(&key) {
            resource.holders.retain(|h| h.request_id != request_id);
        }
        self.promote_waiters(&key);
        true
    }

    /// Withdraw a queued request. Returns it when it was still waiting.
    pub fn withdraw(&mut self, request_id: RequestId) -> Option<Waiter> {
        let waiter = self.waiters.remove(&request_id)?;
        let key = waiter.request.resource_key.clone();
        if let Some(resource) = self.resources.get_mut(&key) {
            resource.queue.retain(|id| *id != request_id);
        }
        self.graph.clear_waits(waiter.request.owner);
        // A withdrawn head may have been blocking compatible requests behind it
        self.promote_waiters(&key);
        Some(waiter)
    }

    /// Grant queued requests in order until the first one that still conflicts
    fn promote_waiters(&mut self, key: &str) {
        loop {
            let Some(resource) = self.resources.get_mut(key) else {
                return;
            };
            let Some(&head) = resource.queue.first() else {
                break;
            };
            let Some(waiter) = self.waiters.get(&head) else {
                resource.queue.remove(0);
                continue;
            };
            if !resource.compatible(waiter.request.owner, waiter.request.lock_type) {
                break;
            }

            resource.queue.remove(0);
            let Some(waiter) = self.waiters.remove(&head) else {
                continue;
            };
            let owner = waiter.request.owner;
            resource.holders.push(Holder {
                request_id: head,
                owner,
                lock_type: waiter.request.lock_type,
            });

            if waiter.grant.send(Ok(())).is_ok() {
                self.granted.insert(head, key.to_string());
                self.graph.clear_waits(owner);
                self.stats.granted_total += 1;
                debug!(request = %head, resource = key, "Lock granted to waiter");
            } else {
                // Requester already gave up; undo the grant
                resource.holders.retain(|h| h.request_id != head);
                self.graph.clear_waits(owner);
            }
        }

        self.refresh_edges(key);
        self.forget_if_idle(key);
    }

    /// Recompute wait-for edges for everyone still queued on `key`
    fn refresh_edges(&mut self, key: &str) {
        let Some(resource) = self.resources.get(key) else {
            return;
        };
        let updates: Vec<(OwnerId, Vec<OwnerId>)> = resource
            .queue
            .iter()
            .filter_map(|id| self.waiters.get(id))
            .map(|w| {
                (
                    w.request.owner,
                    resource.conflicting_owners(w.request.owner, w.request.lock_type),
                )
            })
            .collect();
        for (owner, blockers) in updates {
            self.graph.set_waits(owner, blockers);
        }
    }

    fn forget_if_idle(&mut self, key: &str) {
        if self
            .resources
            .get(key)
            .is_some_and(|r| r.holders.is_empty() && r.queue.is_empty())
        {
            self.resources.remove(key);
        }
    }

    /// Run cycle detection and abort one victim per cycle
    pub fn resolve_deadlocks(&mut self) -> DeadlockReport {
        let cycles = self.graph.find_cycles();
        let mut victims: Vec<OwnerId> = Vec::new();

        for cycle in &cycles {
            if cycle.iter().any(|owner| victims.contains(owner)) {
                continue;
            }
            let Some(victim) = self.pick_victim(cycle) else {
                continue;
            };
            victims.push(victim.owner);
            self.abort_waiter(victim.id, victim.owner);
        }

        if !cycles.is_empty() {
            self.stats.deadlocks_detected += cycles.len() as u64;
            self.stats.victims_aborted += victims.len() as u64;
        }

        DeadlockReport { cycles, victims }
    }

    /// Lowest priority waiting request in the cycle; youngest on ties
    fn pick_victim(&self, cycle: &[OwnerId]) -> Option<LockRequest> {
        self.waiters
            .values()
            .filter(|w| cycle.contains(&w.request.owner))
            .map(|w| &w.request)
            .min_by(|a, b| {
                a.priority
                    .cmp(&b.priority)
                    .then_with(|| b.requested_at.cmp(&a.requested_at))
                    .then_with(|| b.id.cmp(&a.id))
            })
            .cloned()
    }

    fn abort_waiter(&mut self, request_id: RequestId, owner: OwnerId) {
        if let Some(waiter) = self.waiters.remove(&request_id) {
            let key = waiter.request.resource_key.clone();
            if let Some(resource) = self.resources.get_mut(&key) {
                resource.queue.retain(|id| *id != request_id);
            }
            warn!(
                request = %request_id,
                owner = %owner,
                resource = %key,
                priority = waiter.request.priority,
                "Aborting deadlock victim"
            );
            let _ = waiter.grant.send(Err(DatastoreError::Deadlock { owner }));
            self.graph.remove_node(owner);
            self.promote_waiters(&key);
        } else {
            self.graph.remove_node(owner);
        }
    }

    pub fn snapshot(&self) -> LockStats {
        LockStats {
            held_locks: self.granted.len(),
            waiting_requests: self.waiters.len(),
            locked_resources: self
                .resources
                .values()
                .filter(|r| !r.holders.is_empty())
                .count(),
            ..self.stats.clone()
        }
    }

    /// Holders of `key`, for invariant checks
    pub fn holders_of(&self, key: &str) -> Vec<(OwnerId, LockType)> {
        self.resources
            .get(key)
            .map(|r| r.holders.iter().map(|h| (h.owner, h.lock_type)).collect())
            .unwrap_or_default()
    }
}
