//! Per-request trace of `remember()` calls.
//!
//! Purely diagnostic: the tracker never influences what gets cached.

use std::collections::BTreeSet;
use std::fmt;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheOutcome {
    /// Served from the store.
    Hit,
    /// Generated and written to the store.
    New,
    /// Generated, but the scope ended up disabled or already stale.
    NoCache,
    /// Caching was switched off for the call; no scope was opened.
    Bypass,
    /// The generator failed.
    Failed,
}

impl CacheOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hit => "HIT",
            Self::New => "NEW",
            Self::NoCache => "NO_CACHE",
            Self::Bypass => "BYPASS",
            Self::Failed => "FAILED",
        }
    }
}

#[derive(Debug, Clone)]
pub struct TraceNode {
    pub label: String,
    pub outcome: CacheOutcome,
    pub tags: BTreeSet<String>,
    pub lifetime: Option<u64>,
    pub elapsed: Duration,
    pub children: Vec<TraceNode>,
}

impl TraceNode {
    fn write_indented(&self, f: &mut fmt::Formatter<'_>, level: usize) -> fmt::Result {
        write!(
            f,
            "{:indent$}{} {}",
            "",
            self.outcome.as_str(),
            self.label,
            indent = level * 2
        )?;
        if let Some(lifetime) = self.lifetime {
            write!(f, " lifetime={lifetime}")?;
        }
        if !self.tags.is_empty() {
            let tags: Vec<&str> = self.tags.iter().map(String::as_str).collect();
            write!(f, " tags=[{}]", tags.join(","))?;
        }
        writeln!(f, " ({:.1}ms)", self.elapsed.as_secs_f64() * 1000.0)?;
        for child in &self.children {
            child.write_indented(f, level + 1)?;
        }
        Ok(())
    }
}

/// Finished trace of one request.
#[derive(Debug, Clone, Default)]
pub struct MetricsReport {
    pub roots: Vec<TraceNode>,
}

impl MetricsReport {
    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }
}

impl fmt::Display for MetricsReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for root in &self.roots {
            root.write_indented(f, 0)?;
        }
        Ok(())
    }
}

struct PendingNode {
    label: String,
    started: Instant,
    children: Vec<TraceNode>,
}

#[derive(Default)]
pub struct MetricsTracker {
    open: Vec<PendingNode>,
    roots: Vec<TraceNode>,
}

impl MetricsTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a node that will wrap everything recorded until it is finished.
    /// Returns the depth the node must be finished at.
    pub fn begin(&mut self, label: impl Into<String>) -> usize {
        self.open.push(PendingNode {
            label: label.into(),
            started: Instant::now(),
            children: Vec::new(),
        });
        self.open.len() - 1
    }

    pub fn finish(
        &mut self,
        depth: usize,
        outcome: CacheOutcome,
        tags: BTreeSet<String>,
        lifetime: Option<u64>,
    ) {
        while self.open.len() > depth + 1 {
            self.close_top(CacheOutcome::Failed, BTreeSet::new(), None);
        }
        if self.open.len() == depth + 1 {
            self.close_top(outcome, tags, lifetime);
        }
    }

    /// Record a node without children.
    pub fn leaf(
        &mut self,
        label: impl Into<String>,
        outcome: CacheOutcome,
        tags: BTreeSet<String>,
        lifetime: Option<u64>,
    ) {
        self.attach(TraceNode {
            label: label.into(),
            outcome,
            tags,
            lifetime,
            elapsed: Duration::ZERO,
            children: Vec::new(),
        });
    }

    fn close_top(&mut self, outcome: CacheOutcome, tags: BTreeSet<String>, lifetime: Option<u64>) {
        if let Some(pending) = self.open.pop() {
            self.attach(TraceNode {
                label: pending.label,
                outcome,
                tags,
                lifetime,
                elapsed: pending.started.elapsed(),
                children: pending.children,
            });
        }
    }

    fn attach(&mut self, node: TraceNode) {
        match self.open.last_mut() {
            Some(parent) => parent.children.push(node),
            None => self.roots.push(node),
        }
    }

    /// Snapshot of every finished top-level node.
    pub fn report(&self) -> MetricsReport {
        MetricsReport {
            roots: self.roots.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_nodes_attach_to_their_parent() {
        let mut tracker = MetricsTracker::new();
        let outer = tracker.begin("page/1");
        tracker.leaf(
            "menu/main",
            CacheOutcome::Hit,
            BTreeSet::from(["pages_2".to_string()]),
            Some(30),
        );
        let inner = tracker.begin("content/7");
        tracker.finish(inner, CacheOutcome::New, BTreeSet::new(), Some(60));
        tracker.finish(outer, CacheOutcome::New, BTreeSet::new(), Some(30));

        let report = tracker.report();
        assert_eq!(report.roots.len(), 1);
        let root = &report.roots[0];
        assert_eq!(root.label, "page/1");
        assert_eq!(root.children.len(), 2);
        assert_eq!(root.children[0].outcome, CacheOutcome::Hit);
        assert_eq!(root.children[1].label, "content/7");
    }

    #[test]
    fn finishing_a_parent_fails_unfinished_children() {
        let mut tracker = MetricsTracker::new();
        let outer = tracker.begin("outer");
        tracker.begin("dangling");
        tracker.finish(outer, CacheOutcome::NoCache, BTreeSet::new(), None);

        let report = tracker.report();
        assert_eq!(report.roots[0].children[0].outcome, CacheOutcome::Failed);
    }

    #[test]
    fn report_renders_an_indented_tree() {
        let mut tracker = MetricsTracker::new();
        let outer = tracker.begin("outer");
        tracker.leaf(
            "inner",
            CacheOutcome::Hit,
            BTreeSet::from(["a".to_string(), "b".to_string()]),
            Some(5),
        );
        tracker.finish(outer, CacheOutcome::New, BTreeSet::new(), Some(5));

        let rendered = tracker.report().to_string();
        let lines: Vec<&str> = rendered.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("NEW outer lifetime=5"));
        assert!(lines[1].starts_with("  HIT inner lifetime=5 tags=[a,b]"));
    }
}
