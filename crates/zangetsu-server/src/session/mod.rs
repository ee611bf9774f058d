//! Per-connection sessions: the client command loop and the master-side
//! replica-slave driver.

pub mod client;
pub mod replica;

pub use client::{ApplyMode, CommandLoop};
pub use replica::ReplicaSession;

use std::collections::BTreeMap;

use crate::message::OpReply;

/// Outcome of one asynchronous `add`.
#[derive(Debug, Clone)]
pub(crate) enum OpOutcome {
    Done { offset: u64 },
    Failed { message: String },
}

/// Per-connection table of `opid -> outcome`, drained by `results`.
///
/// An opid stays reserved until the next `results`; reusing it before
/// then is a protocol violation.
#[derive(Debug, Default)]
pub(crate) struct OpidTable {
    entries: BTreeMap<u64, OpOutcome>,
}

impl OpidTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, opid: u64) -> bool {
        self.entries.contains_key(&opid)
    }

    pub fn record(&mut self, opid: u64, outcome: OpOutcome) {
        self.entries.insert(opid, outcome);
    }

    /// Take everything recorded since the last drain.
    pub fn drain(&mut self) -> BTreeMap<String, OpReply> {
        std::mem::take(&mut self.entries)
            .into_iter()
            .map(|(opid, outcome)| {
                let reply = match outcome {
                    OpOutcome::Done { offset } => OpReply::ok(offset),
                    OpOutcome::Failed { message } => OpReply::error(message),
                };
                (opid.to_string(), reply)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drain_empties_the_table() {
        let mut table = OpidTable::new();
        table.record(1, OpOutcome::Done { offset: 0 });
        table.record(2, OpOutcome::Failed { message: "disk full".to_string() });
        assert!(table.contains(1));

        let drained = table.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained["1"].status, "ok");
        assert_eq!(drained["1"].offset, Some(0));
        assert_eq!(drained["2"].status, "error");

        assert!(!table.contains(1));
        assert!(table.drain().is_empty());
    }
}
