use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};

use dashmap::DashMap;

use crate::topology::Topology;

/// A line breakpoint as requested by the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakpointSpec {
    pub line: u32,
    pub condition: Option<String>,
}

impl BreakpointSpec {
    pub fn new(line: u32) -> Self {
        Self {
            line,
            condition: None,
        }
    }

    pub fn with_condition(line: u32, condition: impl Into<String>) -> Self {
        Self {
            line,
            condition: Some(condition.into()),
        }
    }
}

/// Outcome of mapping a source line to a step id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Resolved(String),
    /// No topology is loaded.
    NoTopology,
    /// No step carries the requested line.
    NoMatch,
    Internal(String),
}

impl Resolution {
    pub fn resolve(topology: &Topology, source: &str, line: u32) -> Self {
        match topology {
            Topology::Absent => Resolution::NoTopology,
            Topology::Unreadable(cause) => {
                Resolution::Internal(format!("cannot read route definitions: {cause}"))
            }
            Topology::Loaded(snapshot) => match snapshot.resolve_line(source, line) {
                Some(step_id) => Resolution::Resolved(step_id.to_string()),
                None => Resolution::NoMatch,
            },
        }
    }

    /// Diagnostic shown next to an unverified breakpoint.
    pub fn message(&self, source: &str, line: u32) -> Option<String> {
        match self {
            Resolution::Resolved(_) => None,
            Resolution::NoTopology => Some(format!(
                "no active routes found in the engine, cannot set breakpoint for {source} l.{line}"
            )),
            Resolution::NoMatch => Some(format!("cannot find related id for {source} l.{line}")),
            Resolution::Internal(cause) => Some(format!(
                "internal error while setting breakpoint for {source} l.{line}: {cause}"
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Breakpoint {
    /// Protocol-visible id, stable for a given source and line.
    pub id: i64,
    pub source: String,
    pub line: u32,
    pub condition: Option<String>,
    pub step_id: Option<String>,
    pub verified: bool,
    pub message: Option<String>,
}

impl Breakpoint {
    pub fn apply(&mut self, resolution: Resolution) {
        self.message = resolution.message(&self.source, self.line);
        match resolution {
            Resolution::Resolved(step_id) => {
                self.step_id = Some(step_id);
                self.verified = true;
            }
            _ => {
                self.step_id = None;
                self.verified = false;
            }
        }
    }
}

/// Line breakpoints per source, kept across reconnection.
#[derive(Debug)]
pub struct BreakpointRegistry {
    sources: DashMap<String, BTreeMap<u32, Breakpoint>>,
    next_id: AtomicI64,
}

impl Default for BreakpointRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl BreakpointRegistry {
    pub fn new() -> Self {
        Self {
            sources: DashMap::new(),
            next_id: AtomicI64::new(1),
        }
    }

    /// Fresh, unresolved entries for `specs`, in request order. Lines already
    /// registered for `source` keep their id.
    pub fn prepare(&self, source: &str, specs: &[BreakpointSpec]) -> Vec<Breakpoint> {
        let existing: BTreeMap<u32, i64> = self
            .sources
            .get(source)
            .map(|lines| lines.iter().map(|(line, bp)| (*line, bp.id)).collect())
            .unwrap_or_default();

        let mut assigned: BTreeMap<u32, i64> = BTreeMap::new();
        specs
            .iter()
            .map(|spec| {
                let id = *assigned.entry(spec.line).or_insert_with(|| {
                    existing
                        .get(&spec.line)
                        .copied()
                        .unwrap_or_else(|| self.next_id.fetch_add(1, Ordering::Relaxed))
                });
                Breakpoint {
                    id,
                    source: source.to_string(),
                    line: spec.line,
                    condition: spec.condition.clone(),
                    step_id: None,
                    verified: false,
                    message: None,
                }
            })
            .collect()
    }

    /// Replace every breakpoint of `source`.
    ///
    /// Returns step ids that no breakpoint references any more; those must be
    /// removed from the engine.
    pub fn commit(&self, source: &str, breakpoints: &[Breakpoint]) -> Vec<String> {
        let lines: BTreeMap<u32, Breakpoint> = breakpoints
            .iter()
            .map(|bp| (bp.line, bp.clone()))
            .collect();
        let previous = self.sources.insert(source.to_string(), lines);

        let Some(previous) = previous else {
            return Vec::new();
        };
        let in_use = self.resolved_steps();
        let mut stale: Vec<String> = previous
            .into_values()
            .filter_map(|bp| bp.step_id)
            .filter(|step| !in_use.contains(step))
            .collect();
        stale.sort();
        stale.dedup();
        stale
    }

    /// Store the re-resolved state of a breakpoint read earlier as `before`.
    ///
    /// Returns `false`, leaving the registry untouched, when the entry was
    /// replaced or removed in the meantime.
    pub fn update(&self, before: &Breakpoint, after: &Breakpoint) -> bool {
        let Some(mut lines) = self.sources.get_mut(&before.source) else {
            return false;
        };
        match lines.get_mut(&before.line) {
            Some(entry) if *entry == *before => {
                *entry = after.clone();
                true
            }
            _ => false,
        }
    }

    /// Remove a breakpoint by protocol id. Returns it together with whether its
    /// step is still referenced by another breakpoint.
    pub fn remove_by_id(&self, id: i64) -> Option<(Breakpoint, bool)> {
        let mut removed = None;
        for mut lines in self.sources.iter_mut() {
            let line = lines
                .iter()
                .find(|(_, bp)| bp.id == id)
                .map(|(line, _)| *line);
            if let Some(line) = line {
                removed = lines.remove(&line);
                break;
            }
        }
        let removed = removed?;
        let still_used = removed
            .step_id
            .as_ref()
            .is_some_and(|step| self.resolved_steps().contains(step));
        Some((removed, still_used))
    }

    /// The verified breakpoint registered on `step_id`, if any.
    pub fn find_by_step(&self, step_id: &str) -> Option<Breakpoint> {
        self.sources.iter().find_map(|lines| {
            lines
                .values()
                .find(|bp| bp.step_id.as_deref() == Some(step_id))
                .cloned()
        })
    }

    pub fn all(&self) -> Vec<Breakpoint> {
        let mut all: Vec<Breakpoint> = self
            .sources
            .iter()
            .flat_map(|lines| lines.values().cloned().collect::<Vec<_>>())
            .collect();
        all.sort_by_key(|bp| bp.id);
        all
    }

    fn resolved_steps(&self) -> HashSet<String> {
        self.sources
            .iter()
            .flat_map(|lines| {
                lines
                    .values()
                    .filter_map(|bp| bp.step_id.clone())
                    .collect::<Vec<_>>()
            })
            .collect()
    }
}
