//! Route topology as reported by the engine's `dumpRoutes`.
//!
//! The XML is flattened once into an arena of element nodes with parent and
//! sibling links, so "is this the last step of its route" is an O(depth) walk
//! and line lookups go through a prebuilt index.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use roxmltree::{Document, Node};

/// Topology state held by a session.
#[derive(Debug, Clone, Default)]
pub enum Topology {
    /// The engine reported no routing context, or no routes.
    #[default]
    Absent,
    /// The engine reported routes we could not parse.
    Unreadable(String),
    Loaded(Arc<TopologySnapshot>),
}

impl Topology {
    /// Build from the raw `dumpRoutes` reply.
    pub fn from_dump(xml: Option<&str>) -> Self {
        let Some(xml) = xml.map(str::trim).filter(|xml| !xml.is_empty()) else {
            return Topology::Absent;
        };
        match TopologySnapshot::parse(xml) {
            Ok(snapshot) if snapshot.route_count() == 0 => Topology::Absent,
            Ok(snapshot) => Topology::Loaded(Arc::new(snapshot)),
            Err(err) => Topology::Unreadable(err),
        }
    }

    pub fn snapshot(&self) -> Option<&Arc<TopologySnapshot>> {
        match self {
            Topology::Loaded(snapshot) => Some(snapshot),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepNode {
    pub step_id: Option<String>,
    pub line: Option<u32>,
    pub source: Option<String>,
    parent: Option<usize>,
    has_next_sibling: bool,
    is_route: bool,
}

#[derive(Debug, Clone, Default)]
pub struct TopologySnapshot {
    nodes: Vec<StepNode>,
    by_id: HashMap<String, usize>,
    by_line: HashMap<u32, Vec<usize>>,
    routes: usize,
}

impl TopologySnapshot {
    pub fn parse(xml: &str) -> Result<Self, String> {
        let doc = Document::parse(xml).map_err(|err| err.to_string())?;
        let mut snapshot = TopologySnapshot::default();
        for route in doc
            .descendants()
            .filter(|node| node.is_element() && node.tag_name().name() == "route")
        {
            snapshot.routes += 1;
            snapshot.push(route, None);
        }
        Ok(snapshot)
    }

    fn push(&mut self, element: Node<'_, '_>, parent: Option<usize>) {
        let index = self.nodes.len();
        let step_id = element.attribute("id").map(str::to_string);
        let line = element
            .attribute("sourceLineNumber")
            .and_then(|line| line.trim().parse::<i64>().ok())
            .and_then(|line| u32::try_from(line).ok())
            .filter(|line| *line > 0);
        let is_route = parent.is_none();

        self.nodes.push(StepNode {
            step_id: step_id.clone(),
            line,
            source: element.attribute("sourceLocation").map(str::to_string),
            parent,
            has_next_sibling: element.next_sibling_element().is_some(),
            is_route,
        });

        if let Some(step_id) = step_id {
            self.by_id.entry(step_id).or_insert(index);
            if let (Some(line), false) = (line, is_route) {
                self.by_line.entry(line).or_default().push(index);
            }
        }

        for child in element.children().filter(Node::is_element) {
            self.push(child, Some(index));
        }
    }

    pub fn route_count(&self) -> usize {
        self.routes
    }

    pub fn node(&self, step_id: &str) -> Option<&StepNode> {
        self.by_id.get(step_id).map(|&index| &self.nodes[index])
    }

    /// Step id annotated with `line`.
    ///
    /// A step whose `sourceLocation` names the same file as `source` wins over
    /// one that does not; otherwise the first step in document order.
    pub fn resolve_line(&self, source: &str, line: u32) -> Option<&str> {
        let candidates = self.by_line.get(&line)?;
        let wanted = file_name(source);
        let chosen = candidates
            .iter()
            .copied()
            .find(|&index| {
                self.nodes[index]
                    .source
                    .as_deref()
                    .is_some_and(|location| wanted.is_some() && file_name(location) == wanted)
            })
            .or_else(|| candidates.first().copied())?;
        self.nodes[chosen].step_id.as_deref()
    }

    /// Whether a message at `step_id` leaves its route on the next step.
    ///
    /// A step with a following element sibling is never last; otherwise the
    /// question moves up to the enclosing element until the route boundary.
    /// Unknown steps are never last.
    pub fn is_last_in_route(&self, step_id: &str) -> bool {
        let Some(&start) = self.by_id.get(step_id) else {
            return false;
        };
        let mut current = start;
        loop {
            let node = &self.nodes[current];
            if node.has_next_sibling {
                return false;
            }
            match node.parent {
                Some(parent) if !self.nodes[parent].is_route => current = parent,
                _ => return true,
            }
        }
    }
}

fn file_name(path: &str) -> Option<&str> {
    Path::new(path).file_name().and_then(|name| name.to_str())
}
