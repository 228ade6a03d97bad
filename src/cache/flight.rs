//! In-flight computation registry.
//!
//! At most one computation per key runs at a time. The first caller for a
//! cold key registers a shared future; later callers clone and await it. The
//! marker is removed by [`FlightGuard`] when the computation finishes, fails,
//! or panics.

use std::any::Any;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::future::{BoxFuture, Shared};

use super::error::HybridError;

/// Type-erased value shared between the local tier and flight waiters.
pub type LocalValue = Arc<dyn Any + Send + Sync>;

pub(crate) type FlightOutcome = Result<LocalValue, HybridError>;
pub(crate) type SharedFlight = Shared<BoxFuture<'static, FlightOutcome>>;

/// A running computation for one key.
#[derive(Clone)]
pub(crate) struct Flight {
    outcome: SharedFlight,
    invalidated: Arc<AtomicBool>,
}

impl Flight {
    pub(crate) fn outcome(&self) -> SharedFlight {
        self.outcome.clone()
    }
}

/// Whether the caller started the flight or joined one already running.
pub(crate) enum Joined {
    Leader(Flight),
    Waiter(Flight),
}

impl Joined {
    pub(crate) fn outcome(&self) -> SharedFlight {
        match self {
            Joined::Leader(flight) | Joined::Waiter(flight) => flight.outcome(),
        }
    }
}

#[derive(Default, Clone)]
pub(crate) struct FlightRegistry {
    flights: Arc<DashMap<String, Flight>>,
}

impl FlightRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Join the flight for `key`, or start one with `lead`.
    ///
    /// `lead` receives the guard that must live until the computation is
    /// done, and the flag raised when the key is invalidated mid-flight.
    pub(crate) fn join_or_start(
        &self,
        key: &str,
        lead: impl FnOnce(FlightGuard, Arc<AtomicBool>) -> SharedFlight,
    ) -> Joined {
        match self.flights.entry(key.to_string()) {
            Entry::Occupied(occupied) => Joined::Waiter(occupied.get().clone()),
            Entry::Vacant(vacant) => {
                let invalidated = Arc::new(AtomicBool::new(false));
                let guard = FlightGuard {
                    key: key.to_string(),
                    flights: Arc::clone(&self.flights),
                };
                let flight = Flight {
                    outcome: lead(guard, Arc::clone(&invalidated)),
                    invalidated,
                };
                vacant.insert(flight.clone());
                Joined::Leader(flight)
            }
        }
    }

    /// Flag the running flight for `key`, if any, as invalidated.
    pub(crate) fn mark_invalidated(&self, key: &str) -> bool {
        match self.flights.get(key) {
            Some(flight) => {
                flight.invalidated.store(true, Ordering::Release);
                true
            }
            None => false,
        }
    }

    pub(crate) fn contains(&self, key: &str) -> bool {
        self.flights.contains_key(key)
    }

    pub(crate) fn len(&self) -> usize {
        self.flights.len()
    }
}

/// Removes the flight marker when dropped.
pub(crate) struct FlightGuard {
    key: String,
    flights: Arc<DashMap<String, Flight>>,
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        self.flights.remove(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use futures::FutureExt;

    use super::*;

    fn ready_flight(value: u32) -> SharedFlight {
        let value: LocalValue = Arc::new(value);
        futures::future::ready(Ok(value)).boxed().shared()
    }

    #[tokio::test]
    async fn second_caller_joins_existing_flight() {
        let registry = FlightRegistry::new();
        let mut guards = Vec::new();

        let first = registry.join_or_start("k", |guard, _| {
            guards.push(guard);
            ready_flight(1)
        });
        let second = registry.join_or_start("k", |_, _| unreachable!("flight already running"));

        assert!(matches!(first, Joined::Leader(_)));
        assert!(matches!(second, Joined::Waiter(_)));

        let value = second.outcome().await.expect("resolved");
        assert_eq!(value.downcast_ref::<u32>(), Some(&1));
        assert_eq!(registry.len(), 1);

        drop(guards);
        assert!(!registry.contains("k"));
    }

    #[test]
    fn invalidation_flag_reaches_the_leader() {
        let registry = FlightRegistry::new();
        let mut seen = None;
        let mut guards = Vec::new();

        registry.join_or_start("k", |guard, flag| {
            guards.push(guard);
            seen = Some(flag);
            ready_flight(1)
        });

        assert!(registry.mark_invalidated("k"));
        assert!(!registry.mark_invalidated("other"));
        assert!(seen.expect("flag").load(Ordering::Acquire));
    }
}
