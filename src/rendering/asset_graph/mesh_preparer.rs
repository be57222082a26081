use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use log::{error, trace};
use portalview_files::ObjectId;
use portalview_files::object::types::ObjectKind;
use portalview_files::source::DataSource;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::rendering::asset_graph::bounds_cache::BoundsCache;
use crate::rendering::asset_graph::composite::flatten_composite;
use crate::rendering::asset_graph::resource_cache::ResourceCache;
use crate::rendering::common::errors::PrepareError;
use crate::rendering::common::types::{MeshContent, MeshData};
use crate::rendering::importer::leaf_importer::LeafImporter;

#[derive(Debug, Clone)]
enum Outcome {
    Prepared(Arc<MeshData>),
    Absent,
    Cancelled,
}

/// `None` while the preparation is running.
type PendingOutcome = Option<Outcome>;

/// A running preparation. Its token is cancelled once every caller waiting for it gave up.
#[derive(Clone)]
struct InFlight {
    outcome: watch::Receiver<PendingOutcome>,
    cancel: CancellationToken,
    waiters: Arc<AtomicUsize>,
}

#[derive(Debug, Default)]
struct PreparerCounters {
    started: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
}

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct PreparerStats {
    pub started: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub cancelled: u64,
}

/// Turns object ids into [`MeshData`] on the blocking pool, running at most one preparation per id.
///
/// Concurrent callers for the same id subscribe to the running preparation instead of starting
/// another one. The entry is removed once the preparation finished (whatever the outcome), so a
/// later call prepares again. A caller cancelling only stops waiting, the shared work is cancelled
/// when the last waiting caller is gone.
pub struct MeshPreparer {
    source: Arc<dyn DataSource>,
    bounds: Arc<BoundsCache>,
    cache: Arc<ResourceCache>,
    in_flight: DashMap<ObjectId, InFlight>,
    counters: PreparerCounters,
}

impl MeshPreparer {
    pub fn new(source: Arc<dyn DataSource>, bounds: Arc<BoundsCache>, cache: Arc<ResourceCache>) -> Self {
        Self {
            source,
            bounds,
            cache,
            in_flight: DashMap::with_capacity(256),
            counters: PreparerCounters::default(),
        }
    }

    /// Prepares `id`, or joins the preparation that is already running for it. Absent when the
    /// object is resident already, failed to prepare (which is logged) or `cancel` fired.
    ///
    /// `is_composite_hint` makes an id that the source cannot classify be treated as composite.
    /// A caller whose preparation got cancelled by the other callers while its own token is live
    /// starts over.
    pub async fn prepare(
        self: &Arc<Self>,
        id: ObjectId,
        is_composite_hint: bool,
        cancel: CancellationToken,
    ) -> Option<Arc<MeshData>> {
        loop {
            if self.cache.is_resident(id) {
                trace!("{id} is resident, nothing to prepare");
                return None;
            }
            if cancel.is_cancelled() {
                return None;
            }

            let (flight, started) = match self.in_flight.entry(id) {
                Entry::Occupied(entry) => {
                    trace!("Joining the running preparation of {id}");
                    let flight = entry.get().clone();
                    flight.waiters.fetch_add(1, Ordering::AcqRel);
                    (flight, None)
                }
                Entry::Vacant(entry) => {
                    let (sender, receiver) = watch::channel(None);
                    let flight = InFlight {
                        outcome: receiver,
                        cancel: CancellationToken::new(),
                        waiters: Arc::new(AtomicUsize::new(1)),
                    };
                    entry.insert(flight.clone());
                    (flight, Some(sender))
                }
            };

            if let Some(sender) = started {
                self.spawn_preparation(id, is_composite_hint, flight.cancel.clone(), sender);
            }

            let waiter = Waiter {
                cancel: flight.cancel,
                waiters: flight.waiters,
            };
            let mut receiver = flight.outcome;

            let outcome = tokio::select! {
                biased;
                // An error means the preparation was torn down without a result.
                finished = receiver.wait_for(Option::is_some) => finished.ok().and_then(|outcome| outcome.clone()),
                _ = cancel.cancelled() => {
                    trace!("Stopped waiting for the preparation of {id}");
                    return None;
                }
            };
            drop(waiter);

            match outcome {
                Some(Outcome::Prepared(mesh)) => return Some(mesh),
                Some(Outcome::Cancelled) if !cancel.is_cancelled() => {
                    trace!("The preparation of {id} was cancelled by the other callers, starting over");
                }
                _ => return None,
            }
        }
    }

    /// Callers currently waiting for the preparation of `id`.
    pub fn waiting_callers(&self, id: ObjectId) -> usize {
        self.in_flight
            .get(&id)
            .map_or(0, |flight| flight.waiters.load(Ordering::Acquire))
    }

    pub fn is_in_flight(&self, id: ObjectId) -> bool {
        self.in_flight.contains_key(&id)
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    pub fn stats(&self) -> PreparerStats {
        PreparerStats {
            started: self.counters.started.load(Ordering::Relaxed),
            succeeded: self.counters.succeeded.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            cancelled: self.counters.cancelled.load(Ordering::Relaxed),
        }
    }

    fn spawn_preparation(
        self: &Arc<Self>,
        id: ObjectId,
        is_composite_hint: bool,
        cancel: CancellationToken,
        sender: watch::Sender<PendingOutcome>,
    ) {
        self.counters.started.fetch_add(1, Ordering::Relaxed);
        let this = self.clone();

        tokio::spawn(async move {
            let guard = InFlightGuard {
                in_flight: &this.in_flight,
                id,
            };

            let worker = this.clone();
            let result =
                tokio::task::spawn_blocking(move || worker.prepare_blocking(id, is_composite_hint, &cancel)).await;

            let outcome = match result {
                Ok(Ok(mesh)) => {
                    this.counters.succeeded.fetch_add(1, Ordering::Relaxed);
                    Outcome::Prepared(Arc::new(mesh))
                }
                Ok(Err(PrepareError::Cancelled)) => {
                    trace!("Preparation of {id} has been cancelled");
                    this.counters.cancelled.fetch_add(1, Ordering::Relaxed);
                    Outcome::Cancelled
                }
                Ok(Err(err)) => {
                    error!("Failed to prepare {id}: {err}");
                    this.counters.failed.fetch_add(1, Ordering::Relaxed);
                    Outcome::Absent
                }
                Err(err) => {
                    error!("Preparation of {id} did not finish: {err}");
                    this.counters.failed.fetch_add(1, Ordering::Relaxed);
                    Outcome::Absent
                }
            };

            // Leave the map before publishing, so nobody can join a finished preparation.
            drop(guard);
            // Nobody listening anymore is fine.
            let _ = sender.send(Some(outcome));
        });
    }

    fn prepare_blocking(
        &self,
        id: ObjectId,
        is_composite_hint: bool,
        cancel: &CancellationToken,
    ) -> Result<MeshData, PrepareError> {
        profiling::scope!("MeshPreparer::prepare_blocking");
        if cancel.is_cancelled() {
            return Err(PrepareError::Cancelled);
        }

        match self.source.classify(id) {
            ObjectKind::Leaf => {
                let geometry = self
                    .source
                    .leaf(id)
                    .ok_or(PrepareError::missing("leaf geometry", id.0))?;
                LeafImporter::create_mesh(self.source.as_ref(), id, &geometry, cancel)
            }
            ObjectKind::Composite => self.prepare_composite(id, cancel),
            ObjectKind::Unknown if is_composite_hint => self.prepare_composite(id, cancel),
            ObjectKind::Unknown => Err(PrepareError::UnknownObject { id }),
        }
    }

    fn prepare_composite(&self, id: ObjectId, cancel: &CancellationToken) -> Result<MeshData, PrepareError> {
        let parts = flatten_composite(self.source.as_ref(), id, cancel)?;
        let bounds = self.bounds.get_composite_bounds(id).ok_or(PrepareError::InvalidGeometry {
            id,
            reason: "bounds cannot be resolved".into(),
        })?;

        Ok(MeshData {
            id,
            bounds,
            content: MeshContent::Composite { parts },
        })
    }
}

struct InFlightGuard<'a> {
    in_flight: &'a DashMap<ObjectId, InFlight>,
    id: ObjectId,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.in_flight.remove(&self.id);
    }
}

/// One caller waiting for a preparation, also when its future is dropped mid-wait.
struct Waiter {
    cancel: CancellationToken,
    waiters: Arc<AtomicUsize>,
}

impl Drop for Waiter {
    fn drop(&mut self) {
        if self.waiters.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.cancel.cancel();
        }
    }
}
