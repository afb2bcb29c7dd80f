//! Thread ids for the two kinds of execution unit: suspended messages and
//! live routes.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicI64, Ordering};

use backlog_wire::MessageSnapshot;
use dashmap::DashMap;

/// A message suspended at a step, keyed by its exchange id.
#[derive(Debug, Clone, PartialEq)]
pub struct ExchangeThread {
    pub id: i64,
    pub exchange_id: String,
    pub step_id: String,
    pub route_id: String,
    pub snapshot: MessageSnapshot,
    pub source: Option<String>,
    pub line: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteThread {
    pub id: i64,
    pub route_id: String,
    pub paused: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionUnit {
    Exchange(ExchangeThread),
    Route(RouteThread),
}

impl ExecutionUnit {
    pub fn id(&self) -> i64 {
        match self {
            ExecutionUnit::Exchange(thread) => thread.id,
            ExecutionUnit::Route(thread) => thread.id,
        }
    }
}

/// A suspension observed by the poll loop.
#[derive(Debug, Clone)]
pub struct Suspension {
    pub step_id: String,
    pub snapshot: MessageSnapshot,
    pub source: Option<String>,
    pub line: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Upsert {
    pub id: i64,
    pub created: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteDiff {
    pub started: Vec<i64>,
    pub exited: Vec<i64>,
}

#[derive(Debug)]
pub struct ExecutionUnitTracker {
    units: DashMap<i64, ExecutionUnit>,
    by_exchange: DashMap<String, i64>,
    by_route: DashMap<String, i64>,
    next_id: AtomicI64,
}

impl Default for ExecutionUnitTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutionUnitTracker {
    pub fn new() -> Self {
        Self {
            units: DashMap::new(),
            by_exchange: DashMap::new(),
            by_route: DashMap::new(),
            next_id: AtomicI64::new(1),
        }
    }

    fn allocate(&self) -> i64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Record a suspension. An exchange seen before keeps its thread id.
    pub fn upsert_exchange(&self, suspension: Suspension) -> Upsert {
        let exchange_id = suspension.snapshot.exchange_id.clone();
        let existing = self.by_exchange.get(&exchange_id).map(|id| *id);

        if let Some(id) = existing {
            if let Some(mut unit) = self.units.get_mut(&id) {
                if let ExecutionUnit::Exchange(thread) = unit.value_mut() {
                    thread.step_id = suspension.step_id;
                    thread.route_id = suspension.snapshot.route_id.clone();
                    thread.snapshot = suspension.snapshot;
                    // Without a new location the previous one is the best guess.
                    if suspension.source.is_some() {
                        thread.source = suspension.source;
                    }
                    if suspension.line.is_some() {
                        thread.line = suspension.line;
                    }
                    return Upsert { id, created: false };
                }
            }
        }

        let id = self.allocate();
        let thread = ExchangeThread {
            id,
            exchange_id: exchange_id.clone(),
            step_id: suspension.step_id,
            route_id: suspension.snapshot.route_id.clone(),
            snapshot: suspension.snapshot,
            source: suspension.source,
            line: suspension.line,
        };
        self.units.insert(id, ExecutionUnit::Exchange(thread));
        self.by_exchange.insert(exchange_id, id);
        Upsert { id, created: true }
    }

    pub fn get(&self, id: i64) -> Option<ExecutionUnit> {
        self.units.get(&id).map(|unit| unit.value().clone())
    }

    pub fn exchange(&self, id: i64) -> Option<ExchangeThread> {
        match self.get(id)? {
            ExecutionUnit::Exchange(thread) => Some(thread),
            ExecutionUnit::Route(_) => None,
        }
    }

    pub fn remove(&self, id: i64) -> Option<ExecutionUnit> {
        let (_, unit) = self.units.remove(&id)?;
        match &unit {
            ExecutionUnit::Exchange(thread) => {
                self.by_exchange.remove(&thread.exchange_id);
            }
            ExecutionUnit::Route(thread) => {
                self.by_route.remove(&thread.route_id);
            }
        }
        Some(unit)
    }

    /// Remove every exchange thread, returning their ids in ascending order.
    pub fn drain_exchanges(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self.by_exchange.iter().map(|entry| *entry.value()).collect();
        ids.sort_unstable();
        ids.into_iter().filter(|id| self.remove(*id).is_some()).collect()
    }

    /// Remove the exchange threads `keep` rejects, returning their ids in
    /// ascending order.
    pub fn retain_exchanges(&self, keep: impl Fn(&ExchangeThread) -> bool) -> Vec<i64> {
        let mut ids: Vec<i64> = self
            .units
            .iter()
            .filter_map(|unit| match unit.value() {
                ExecutionUnit::Exchange(thread) if !keep(thread) => Some(thread.id),
                _ => None,
            })
            .collect();
        ids.sort_unstable();
        ids.into_iter().filter(|id| self.remove(*id).is_some()).collect()
    }

    /// Diff tracked routes against the live set reported by the engine.
    pub fn sync_routes(&self, live: &[String]) -> RouteDiff {
        let live: BTreeSet<&str> = live.iter().map(String::as_str).collect();
        let mut diff = RouteDiff::default();

        let gone: Vec<i64> = self
            .by_route
            .iter()
            .filter(|entry| !live.contains(entry.key().as_str()))
            .map(|entry| *entry.value())
            .collect();
        for id in gone {
            if self.remove(id).is_some() {
                diff.exited.push(id);
            }
        }

        for route_id in live {
            if self.by_route.contains_key(route_id) {
                continue;
            }
            let id = self.allocate();
            self.units.insert(
                id,
                ExecutionUnit::Route(RouteThread {
                    id,
                    route_id: route_id.to_string(),
                    paused: false,
                }),
            );
            self.by_route.insert(route_id.to_string(), id);
            diff.started.push(id);
        }

        diff.exited.sort_unstable();
        diff
    }

    pub fn routes(&self) -> Vec<RouteThread> {
        let mut routes: Vec<RouteThread> = self
            .units
            .iter()
            .filter_map(|unit| match unit.value() {
                ExecutionUnit::Route(thread) => Some(thread.clone()),
                ExecutionUnit::Exchange(_) => None,
            })
            .collect();
        routes.sort_by_key(|route| route.id);
        routes
    }

    pub fn set_route_paused(&self, id: i64, paused: bool) {
        if let Some(mut unit) = self.units.get_mut(&id) {
            if let ExecutionUnit::Route(thread) = unit.value_mut() {
                thread.paused = paused;
            }
        }
    }

    pub fn update_snapshot(&self, id: i64, snapshot: MessageSnapshot) {
        if let Some(mut unit) = self.units.get_mut(&id) {
            if let ExecutionUnit::Exchange(thread) = unit.value_mut() {
                thread.snapshot = snapshot;
            }
        }
    }

    /// Remove everything, returning the removed ids in ascending order.
    pub fn clear(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self.units.iter().map(|unit| *unit.key()).collect();
        ids.sort_unstable();
        ids.into_iter().filter(|id| self.remove(*id).is_some()).collect()
    }

    /// All units ordered by id.
    pub fn list(&self) -> Vec<ExecutionUnit> {
        let mut units: Vec<ExecutionUnit> = self.units.iter().map(|unit| unit.value().clone()).collect();
        units.sort_by_key(ExecutionUnit::id);
        units
    }
}
