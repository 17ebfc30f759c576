//! Per-process coalescing of concurrent identical computations.
//!
//! The first caller for a fingerprint becomes the leader: its computation is
//! spawned as an independent task and its result is published to everyone
//! who joins while it is in flight. Leadership survives caller cancellation:
//! the computation keeps running as long as at least one participant is
//! still waiting, and is cancelled only when the last one leaves. This
//! prevents a flapping client from poisoning the work done on behalf of
//! others.
//!
//! Single-flight is a per-process optimization, not a correctness
//! requirement: two replicas may still compute the same fingerprint
//! concurrently, and the cache write policy keeps that harmless.

use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicUsize, Ordering},
};

use dashmap::DashMap;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::fingerprint::Fingerprint;

/// Result of participating in a flight.
#[derive(Debug, Clone)]
pub struct FlightOutcome<T> {
    pub value: T,
    /// True when this caller joined a flight led by someone else.
    pub coalesced: bool,
}

struct FlightSlot<T> {
    rx: watch::Receiver<Option<T>>,
    waiters: AtomicUsize,
    published: Arc<AtomicBool>,
    cancel: CancellationToken,
}

/// Registry of in-flight computations, one slot per fingerprint.
pub struct SingleFlightRegistry<T> {
    slots: Arc<DashMap<Fingerprint, Arc<FlightSlot<T>>>>,
}

impl<T> Default for SingleFlightRegistry<T> {
    fn default() -> Self {
        Self {
            slots: Arc::new(DashMap::new()),
        }
    }
}

impl<T> SingleFlightRegistry<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of fingerprints currently being computed.
    pub fn in_flight(&self) -> usize {
        self.slots.len()
    }

    /// Join or lead the flight for `fp`.
    ///
    /// If no flight exists, `compute` is spawned and this caller waits on it
    /// as leader. Otherwise `compute` is dropped unused and this caller
    /// waits on the existing flight. Every participant receives a clone of
    /// the same value.
    ///
    /// Dropping the returned future unregisters the caller; the spawned
    /// computation is cancelled only when the last participant leaves
    /// before publication.
    pub async fn run<F>(&self, fp: Fingerprint, compute: F) -> FlightOutcome<T>
    where
        F: Future<Output = T> + Send + 'static,
    {
        let mut compute = Some(compute);

        // Retried only when a slot is torn down between lookup and await
        // (abandoned flight); the next pass makes this caller the leader.
        loop {
            let (slot, leader) = self.join_or_create(fp, &mut compute);

            let _guard = WaiterGuard::new(Arc::clone(&slot));
            let mut rx = slot.rx.clone();

            match rx.wait_for(Option::is_some).await {
                Ok(value) => {
                    let value = value.as_ref().cloned().expect("waited for Some");
                    return FlightOutcome {
                        value,
                        coalesced: !leader,
                    };
                }
                // Sender dropped without publishing: the flight was
                // abandoned after every participant left. Try again.
                Err(_) => continue,
            }
        }
    }

    fn join_or_create<F>(
        &self,
        fp: Fingerprint,
        compute: &mut Option<F>,
    ) -> (Arc<FlightSlot<T>>, bool)
    where
        F: Future<Output = T> + Send + 'static,
    {
        use dashmap::mapref::entry::Entry;

        match self.slots.entry(fp) {
            Entry::Occupied(e) => (Arc::clone(e.get()), false),
            Entry::Vacant(e) => {
                let (tx, rx) = watch::channel(None);
                let published = Arc::new(AtomicBool::new(false));
                let cancel = CancellationToken::new();

                let slot = Arc::new(FlightSlot {
                    rx,
                    waiters: AtomicUsize::new(0),
                    published: Arc::clone(&published),
                    cancel: cancel.clone(),
                });
                e.insert(Arc::clone(&slot));

                let future = compute.take().expect("compute consumed once");
                let slots = Arc::clone(&self.slots);
                tokio::spawn(async move {
                    tokio::select! {
                        value = future => {
                            published.store(true, Ordering::SeqCst);
                            // Receivers may all be gone already; the value
                            // is still the flight's outcome.
                            let _ = tx.send(Some(value));
                        }
                        _ = cancel.cancelled() => {
                            tracing::debug!("Single-flight computation cancelled, no waiters left");
                        }
                    }
                    slots.remove(&fp);
                });

                (slot, true)
            }
        }
    }
}

/// Tracks one participant. Dropping the guard before publication decrements
/// the waiter count; the last participant out cancels the computation.
struct WaiterGuard<T> {
    slot: Arc<FlightSlot<T>>,
}

impl<T> WaiterGuard<T> {
    fn new(slot: Arc<FlightSlot<T>>) -> Self {
        slot.waiters.fetch_add(1, Ordering::SeqCst);
        Self { slot }
    }
}

impl<T> Drop for WaiterGuard<T> {
    fn drop(&mut self) {
        let remaining = self.slot.waiters.fetch_sub(1, Ordering::SeqCst) - 1;
        if remaining == 0 && !self.slot.published.load(Ordering::SeqCst) {
            self.slot.cancel.cancel();
        }
    }
}
