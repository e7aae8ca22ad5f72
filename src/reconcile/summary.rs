//! What a reconcile or teardown run did

use std::fmt;

use serde::Serialize;
use tracing::{info, warn};

/// A machine the run meant to act on but could not
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Skipped {
    /// Machine (or planned machine) name
    pub name: String,
    /// Why it was skipped
    pub reason: String,
}

/// Outcome of one run
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileSummary {
    /// Machines created
    pub created: Vec<String>,
    /// Machines terminated
    pub terminated: Vec<String>,
    /// Machines left alone, with reasons
    pub skipped: Vec<Skipped>,
}

impl ReconcileSummary {
    /// True when the run changed nothing
    pub fn is_noop(&self) -> bool {
        self.created.is_empty() && self.terminated.is_empty()
    }

    pub(crate) fn skip(&mut self, name: impl Into<String>, reason: impl fmt::Display) {
        self.skipped.push(Skipped {
            name: name.into(),
            reason: reason.to_string(),
        });
    }

    pub(crate) fn merge(&mut self, other: ReconcileSummary) {
        self.created.extend(other.created);
        self.terminated.extend(other.terminated);
        self.skipped.extend(other.skipped);
    }

    /// Log the summary at info, or warn when anything was skipped
    pub fn log(&self) {
        if self.skipped.is_empty() {
            info!(
                created = self.created.len(),
                terminated = self.terminated.len(),
                "reconcile complete"
            );
        } else {
            for s in &self.skipped {
                warn!(machine = %s.name, reason = %s.reason, "skipped");
            }
            warn!(
                created = self.created.len(),
                terminated = self.terminated.len(),
                skipped = self.skipped.len(),
                "reconcile complete with skipped machines"
            );
        }
    }
}

impl fmt::Display for ReconcileSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} created, {} terminated, {} skipped",
            self.created.len(),
            self.terminated.len(),
            self.skipped.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_and_display() {
        let mut a = ReconcileSummary {
            created: vec!["m1".into()],
            ..Default::default()
        };
        assert!(!a.is_noop());

        let mut b = ReconcileSummary::default();
        assert!(b.is_noop());
        b.skip("w1", "clone failed");
        a.merge(b);

        assert_eq!(a.to_string(), "1 created, 0 terminated, 1 skipped");
        assert_eq!(a.skipped[0].reason, "clone failed");
    }
}
