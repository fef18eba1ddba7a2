//! Correlation Registry - matches replies to the requests waiting for them.
//!
//! Flow:
//! 1. Client generates a `CorrelationId`
//! 2. Client calls `register()` and receives a `Waiter`
//! 3. Client sends the request frame carrying the id
//! 4. The dispatcher receives the reply and calls `resolve()`
//! 5. Client awaits the waiter, which yields the outcome or `Timeout`
//!
//! Every write to a result slot happens while the registry lock is held and
//! only after the entry has been removed from the map. Whoever removes the
//! entry decides the outcome; everyone else observes "unknown".

use crate::domain::correlation::{CorrelationId, PeerId};
use crate::domain::error::RegistryError;
use crate::domain::types::{CancelReason, Outcome};
use parking_lot::Mutex;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

/// A request waiting for its reply
struct PendingRequest {
    destination: PeerId,
    created_at: Instant,
    deadline: Instant,
    slot: oneshot::Sender<Outcome>,
}

/// Statistics for the correlation registry
#[derive(Debug, Default)]
pub struct PendingStats {
    /// Total requests registered
    pub total_registered: AtomicU64,
    /// Total requests resolved by a reply
    pub total_resolved: AtomicU64,
    /// Total requests that hit their deadline
    pub total_timeouts: AtomicU64,
    /// Total requests cancelled (connection lost, shutdown)
    pub total_cancelled: AtomicU64,
    /// Replies for ids that were not pending
    pub total_late_replies: AtomicU64,
    /// Waiters dropped before their outcome was known
    pub total_abandoned: AtomicU64,
}

/// Result of `resolve()`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveStatus {
    /// The waiter received the outcome.
    Resolved,
    /// Not pending: never registered, already resolved, or timed out.
    Unknown,
    /// The entry existed but its waiter was already gone.
    Abandoned,
}

/// Map from correlation id to pending waiter.
pub struct CorrelationRegistry {
    pending: Mutex<HashMap<CorrelationId, PendingRequest>>,
    stats: PendingStats,
}

impl CorrelationRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            pending: Mutex::new(HashMap::new()),
            stats: PendingStats::default(),
        })
    }

    /// Register a pending request.
    ///
    /// Fails with `DuplicateId` if the id is already pending; the existing
    /// entry is left untouched.
    pub fn register(
        self: &Arc<Self>,
        id: CorrelationId,
        destination: PeerId,
        deadline: Instant,
    ) -> Result<Waiter, RegistryError> {
        let (tx, rx) = oneshot::channel();

        match self.pending.lock().entry(id) {
            Entry::Occupied(_) => return Err(RegistryError::DuplicateId(id)),
            Entry::Vacant(slot) => {
                slot.insert(PendingRequest {
                    destination: destination.clone(),
                    created_at: Instant::now(),
                    deadline,
                    slot: tx,
                });
            }
        }
        self.stats.total_registered.fetch_add(1, Ordering::Relaxed);

        debug!(
            correlation_id = %id,
            peer = %destination,
            "Registered pending request"
        );

        Ok(Waiter {
            id,
            destination,
            deadline,
            rx,
            registry: Arc::clone(self),
            settled: false,
        })
    }

    /// Deliver the outcome for `id`.
    ///
    /// Unknown, late and duplicate ids are logged and ignored.
    pub fn resolve(&self, id: &CorrelationId, outcome: Outcome) -> ResolveStatus {
        let mut pending = self.pending.lock();
        let Some(request) = pending.remove(id) else {
            drop(pending);
            self.stats.total_late_replies.fetch_add(1, Ordering::Relaxed);
            debug!(
                correlation_id = %id,
                outcome = outcome.label(),
                "Reply for unknown, expired or already answered correlation id"
            );
            return ResolveStatus::Unknown;
        };

        let elapsed = request.created_at.elapsed();
        let label = outcome.label();
        let delivered = request.slot.send(outcome).is_ok();
        drop(pending);

        if delivered {
            self.stats.total_resolved.fetch_add(1, Ordering::Relaxed);
            debug!(
                correlation_id = %id,
                peer = %request.destination,
                outcome = label,
                elapsed_ms = elapsed.as_millis() as u64,
                "Resolved pending request"
            );
            ResolveStatus::Resolved
        } else {
            self.stats.total_abandoned.fetch_add(1, Ordering::Relaxed);
            debug!(
                correlation_id = %id,
                peer = %request.destination,
                "Waiter gone before its reply arrived"
            );
            ResolveStatus::Abandoned
        }
    }

    /// Wait for the outcome of a registered request.
    pub async fn await_result(&self, waiter: Waiter) -> Outcome {
        waiter.wait().await
    }

    /// Cancel every pending request.
    ///
    /// Returns the number of requests cancelled.
    pub fn cancel_all(&self, reason: CancelReason) -> usize {
        let mut pending = self.pending.lock();
        let count = pending.len();
        for (_, request) in pending.drain() {
            let _ = request.slot.send(Outcome::Cancelled(reason));
        }
        drop(pending);

        if count > 0 {
            self.stats
                .total_cancelled
                .fetch_add(count as u64, Ordering::Relaxed);
            warn!(count, reason = %reason, "Cancelled all pending requests");
        }
        count
    }

    /// Cancel the pending requests sent to one peer.
    pub fn cancel_destination(&self, peer: &PeerId, reason: CancelReason) -> usize {
        let mut pending = self.pending.lock();
        let ids: Vec<CorrelationId> = pending
            .iter()
            .filter(|(_, request)| &request.destination == peer)
            .map(|(id, _)| *id)
            .collect();
        for id in &ids {
            if let Some(request) = pending.remove(id) {
                let _ = request.slot.send(Outcome::Cancelled(reason));
            }
        }
        drop(pending);

        if !ids.is_empty() {
            self.stats
                .total_cancelled
                .fetch_add(ids.len() as u64, Ordering::Relaxed);
            warn!(
                peer = %peer,
                count = ids.len(),
                reason = %reason,
                "Cancelled pending requests for peer"
            );
        }
        ids.len()
    }

    /// Withdraw a registration without delivering an outcome.
    pub fn discard(&self, id: &CorrelationId) -> bool {
        let removed = self.pending.lock().remove(id).is_some();
        if removed {
            debug!(correlation_id = %id, "Discarded pending request");
        }
        removed
    }

    /// Time out every request whose deadline has passed.
    ///
    /// Returns the number of requests removed.
    pub fn remove_expired(&self) -> usize {
        let now = Instant::now();
        let mut pending = self.pending.lock();
        let expired: Vec<CorrelationId> = pending
            .iter()
            .filter(|(_, request)| request.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in &expired {
            if let Some(request) = pending.remove(id) {
                warn!(
                    correlation_id = %id,
                    peer = %request.destination,
                    elapsed_ms = now.duration_since(request.created_at).as_millis() as u64,
                    "Removing expired pending request"
                );
                let _ = request.slot.send(Outcome::Timeout);
            }
        }
        drop(pending);

        self.stats
            .total_timeouts
            .fetch_add(expired.len() as u64, Ordering::Relaxed);
        expired.len()
    }

    /// Run `remove_expired` every `interval` until the registry is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(sweep_task(Arc::downgrade(self), interval))
    }

    /// Get number of currently pending requests
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Number of pending requests sent to one peer
    pub fn pending_for(&self, peer: &PeerId) -> usize {
        self.pending
            .lock()
            .values()
            .filter(|request| &request.destination == peer)
            .count()
    }

    /// Check if a correlation ID is pending
    pub fn is_pending(&self, id: &CorrelationId) -> bool {
        self.pending.lock().contains_key(id)
    }

    /// Get statistics
    pub fn stats(&self) -> &PendingStats {
        &self.stats
    }

    /// Called when `deadline` elapsed on the waiter side.
    fn expire(&self, id: &CorrelationId, rx: &mut oneshot::Receiver<Outcome>) -> Outcome {
        let removed = self.pending.lock().remove(id);
        match removed {
            Some(request) => {
                self.stats.total_timeouts.fetch_add(1, Ordering::Relaxed);
                warn!(
                    correlation_id = %id,
                    peer = %request.destination,
                    elapsed_ms = request.created_at.elapsed().as_millis() as u64,
                    "Pending request timed out"
                );
                Outcome::Timeout
            }
            // Someone else removed the entry first and, holding the lock,
            // already wrote the slot (or dropped it via `discard`).
            None => rx
                .try_recv()
                .unwrap_or(Outcome::Cancelled(CancelReason::Discarded)),
        }
    }

    fn abandon(&self, id: &CorrelationId) {
        if self.pending.lock().remove(id).is_some() {
            self.stats.total_abandoned.fetch_add(1, Ordering::Relaxed);
            debug!(correlation_id = %id, "Waiter dropped, pending request removed");
        }
    }
}

/// Handle on one pending request, returned by `register()`.
///
/// Dropping it without awaiting removes the registration.
pub struct Waiter {
    id: CorrelationId,
    destination: PeerId,
    deadline: Instant,
    rx: oneshot::Receiver<Outcome>,
    registry: Arc<CorrelationRegistry>,
    settled: bool,
}

impl Waiter {
    pub fn id(&self) -> CorrelationId {
        self.id
    }

    pub fn destination(&self) -> &PeerId {
        &self.destination
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Suspend until the request is resolved, cancelled, or its deadline
    /// passes.
    pub async fn wait(mut self) -> Outcome {
        let outcome = match tokio::time::timeout_at(self.deadline, &mut self.rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Outcome::Cancelled(CancelReason::Discarded),
            Err(_) => self.registry.expire(&self.id, &mut self.rx),
        };
        self.settled = true;
        outcome
    }
}

impl Drop for Waiter {
    fn drop(&mut self) {
        if !self.settled {
            self.registry.abandon(&self.id);
        }
    }
}

impl std::fmt::Debug for Waiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Waiter")
            .field("id", &self.id)
            .field("destination", &self.destination)
            .field("deadline", &self.deadline)
            .finish()
    }
}

/// Background task sweeping overdue requests
async fn sweep_task(registry: Weak<CorrelationRegistry>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;
        let Some(registry) = registry.upgrade() else {
            debug!("Registry dropped, sweeper exiting");
            return;
        };
        let removed = registry.remove_expired();
        if removed > 0 {
            debug!(removed, "Swept expired pending requests");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn peer(name: &str) -> PeerId {
        PeerId::from(name)
    }

    fn in_secs(secs: u64) -> Instant {
        Instant::now() + Duration::from_secs(secs)
    }

    #[tokio::test]
    async fn test_register_and_resolve() {
        let registry = CorrelationRegistry::new();
        let id = CorrelationId::new();

        let waiter = registry.register(id, peer("agent-1"), in_secs(30)).unwrap();
        assert!(registry.is_pending(&id));
        assert_eq!(registry.pending_count(), 1);

        let status = registry.resolve(&id, Outcome::Success(json!({"pods": 3})));
        assert_eq!(status, ResolveStatus::Resolved);
        assert_eq!(registry.pending_count(), 0);

        let outcome = registry.await_result(waiter).await;
        assert_eq!(outcome, Outcome::Success(json!({"pods": 3})));
    }

    #[tokio::test]
    async fn test_second_resolve_is_noop() {
        let registry = CorrelationRegistry::new();
        let id = CorrelationId::new();
        let waiter = registry.register(id, peer("agent-1"), in_secs(30)).unwrap();

        assert_eq!(
            registry.resolve(&id, Outcome::Success(json!(1))),
            ResolveStatus::Resolved
        );
        assert_eq!(
            registry.resolve(&id, Outcome::Success(json!(2))),
            ResolveStatus::Unknown
        );

        assert_eq!(waiter.wait().await, Outcome::Success(json!(1)));
        assert_eq!(registry.stats().total_resolved.load(Ordering::Relaxed), 1);
        assert_eq!(
            registry.stats().total_late_replies.load(Ordering::Relaxed),
            1
        );
    }

    #[tokio::test]
    async fn test_duplicate_id_rejected() {
        let registry = CorrelationRegistry::new();
        let id = CorrelationId::new();
        let _waiter = registry.register(id, peer("a"), in_secs(30)).unwrap();

        let err = registry.register(id, peer("b"), in_secs(30)).unwrap_err();
        assert_eq!(err, RegistryError::DuplicateId(id));
        assert_eq!(registry.pending_count(), 1);
        assert_eq!(registry.pending_for(&peer("a")), 1);
    }

    #[tokio::test]
    async fn test_resolve_unknown_id() {
        let registry = CorrelationRegistry::new();
        assert_eq!(
            registry.resolve(&CorrelationId::new(), Outcome::Timeout),
            ResolveStatus::Unknown
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_removes_entry() {
        let registry = CorrelationRegistry::new();
        let id = CorrelationId::new();
        let start = Instant::now();
        let waiter = registry
            .register(id, peer("agent-2"), start + Duration::from_secs(1))
            .unwrap();

        assert_eq!(waiter.wait().await, Outcome::Timeout);
        assert!(Instant::now() >= start + Duration::from_secs(1));
        assert!(!registry.is_pending(&id));

        // A reply arriving after the timeout cannot touch anything
        assert_eq!(
            registry.resolve(&id, Outcome::Success(json!("late"))),
            ResolveStatus::Unknown
        );
        assert_eq!(registry.stats().total_timeouts.load(Ordering::Relaxed), 1);
        assert_eq!(registry.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_cancel_all() {
        let registry = CorrelationRegistry::new();
        let waiters: Vec<_> = (0..3)
            .map(|_| {
                registry
                    .register(CorrelationId::new(), peer("broker"), in_secs(30))
                    .unwrap()
            })
            .collect();

        assert_eq!(registry.cancel_all(CancelReason::ConnectionLost), 3);
        assert_eq!(registry.pending_count(), 0);

        for waiter in waiters {
            assert_eq!(
                waiter.wait().await,
                Outcome::Cancelled(CancelReason::ConnectionLost)
            );
        }
    }

    #[tokio::test]
    async fn test_cancel_destination_only_touches_that_peer() {
        let registry = CorrelationRegistry::new();
        let a = registry
            .register(CorrelationId::new(), peer("agent-a"), in_secs(30))
            .unwrap();
        let b = registry
            .register(CorrelationId::new(), peer("agent-b"), in_secs(30))
            .unwrap();
        let b_id = b.id();

        let cancelled = registry.cancel_destination(&peer("agent-a"), CancelReason::Superseded);
        assert_eq!(cancelled, 1);
        assert_eq!(a.wait().await, Outcome::Cancelled(CancelReason::Superseded));

        assert!(registry.is_pending(&b_id));
        registry.resolve(&b_id, Outcome::Success(json!("ok")));
        assert_eq!(b.wait().await, Outcome::Success(json!("ok")));
    }

    #[tokio::test]
    async fn test_dropped_waiter_removes_entry() {
        let registry = CorrelationRegistry::new();
        let id = CorrelationId::new();
        let waiter = registry.register(id, peer("a"), in_secs(30)).unwrap();

        drop(waiter);
        assert!(!registry.is_pending(&id));
        assert_eq!(registry.stats().total_abandoned.load(Ordering::Relaxed), 1);
        assert_eq!(
            registry.resolve(&id, Outcome::Success(json!(null))),
            ResolveStatus::Unknown
        );
    }

    #[tokio::test]
    async fn test_discard_does_not_resolve() {
        let registry = CorrelationRegistry::new();
        let id = CorrelationId::new();
        let waiter = registry.register(id, peer("a"), in_secs(30)).unwrap();

        assert!(registry.discard(&id));
        assert!(!registry.discard(&id));
        assert_eq!(
            waiter.wait().await,
            Outcome::Cancelled(CancelReason::Discarded)
        );
        assert_eq!(registry.stats().total_resolved.load(Ordering::Relaxed), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remove_expired() {
        let registry = CorrelationRegistry::new();
        let short = registry
            .register(
                CorrelationId::new(),
                peer("a"),
                Instant::now() + Duration::from_millis(10),
            )
            .unwrap();
        let _long = registry
            .register(CorrelationId::new(), peer("a"), in_secs(60))
            .unwrap();

        tokio::time::advance(Duration::from_millis(50)).await;

        assert_eq!(registry.remove_expired(), 1);
        assert_eq!(registry.pending_count(), 1);
        assert_eq!(short.wait().await, Outcome::Timeout);
        // Counted once even though the waiter also observed its deadline
        assert_eq!(registry.stats().total_timeouts.load(Ordering::Relaxed), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_clears_unawaited_requests() {
        let registry = CorrelationRegistry::new();
        let handle = registry.spawn_sweeper(Duration::from_millis(10));

        let waiter = registry
            .register(
                CorrelationId::new(),
                peer("a"),
                Instant::now() + Duration::from_millis(25),
            )
            .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(registry.pending_count(), 0);
        assert_eq!(waiter.wait().await, Outcome::Timeout);

        handle.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_exits_with_registry() {
        let registry = CorrelationRegistry::new();
        let handle = registry.spawn_sweeper(Duration::from_millis(10));
        drop(registry);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(handle.is_finished());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_resolve_racing_deadline_yields_one_outcome() {
        let registry = CorrelationRegistry::new();
        let mut waiters = Vec::new();
        let mut ids = Vec::new();

        for _ in 0..200 {
            let id = CorrelationId::new();
            let deadline = Instant::now() + Duration::from_millis(5);
            ids.push(id);
            waiters.push(tokio::spawn(
                registry.register(id, peer("a"), deadline).unwrap().wait(),
            ));
        }

        let resolver = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                let mut resolved = 0;
                for id in ids {
                    if registry.resolve(&id, Outcome::Success(json!(1))) == ResolveStatus::Resolved
                    {
                        resolved += 1;
                    }
                }
                resolved
            })
        };

        let resolved = resolver.await.unwrap();
        let mut successes = 0;
        let mut timeouts = 0;
        for waiter in waiters {
            match waiter.await.unwrap() {
                Outcome::Success(_) => successes += 1,
                Outcome::Timeout => timeouts += 1,
                other => panic!("unexpected outcome {other:?}"),
            }
        }

        assert_eq!(successes, resolved);
        assert_eq!(successes + timeouts, 200);
        assert_eq!(registry.pending_count(), 0);
    }

    proptest! {
        /// Each waiter observes the first outcome written for its id; later
        /// writes are reported as unknown and leave no trace.
        #[test]
        fn prop_first_resolve_wins(
            waiter_count in 1usize..12,
            resolves in proptest::collection::vec(0usize..12, 0..40),
        ) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .build()
                .unwrap();

            rt.block_on(async move {
                let registry = CorrelationRegistry::new();
                let waiters: Vec<_> = (0..waiter_count)
                    .map(|_| {
                        registry
                            .register(CorrelationId::new(), peer("p"), in_secs(3600))
                            .unwrap()
                    })
                    .collect();
                let ids: Vec<_> = waiters.iter().map(Waiter::id).collect();

                let mut first: Vec<Option<usize>> = vec![None; waiter_count];
                let mut expected_late = 0u64;
                for (step, target) in resolves.iter().enumerate() {
                    let id = if *target < waiter_count {
                        ids[*target]
                    } else {
                        CorrelationId::new()
                    };
                    let status = registry.resolve(&id, Outcome::Success(json!(step)));
                    if *target < waiter_count && first[*target].is_none() {
                        prop_assert_eq!(status, ResolveStatus::Resolved);
                        first[*target] = Some(step);
                    } else {
                        prop_assert_eq!(status, ResolveStatus::Unknown);
                        expected_late += 1;
                    }
                }

                let unresolved = first.iter().filter(|f| f.is_none()).count();
                prop_assert_eq!(registry.cancel_all(CancelReason::Shutdown), unresolved);
                prop_assert_eq!(registry.pending_count(), 0);
                prop_assert_eq!(
                    registry.stats().total_late_replies.load(Ordering::Relaxed),
                    expected_late
                );

                for (waiter, first) in waiters.into_iter().zip(first) {
                    let expected = match first {
                        Some(step) => Outcome::Success(json!(step)),
                        None => Outcome::Cancelled(CancelReason::Shutdown),
                    };
                    prop_assert_eq!(waiter.wait().await, expected);
                }
                Ok::<(), TestCaseError>(())
            })?;
        }
    }
}
