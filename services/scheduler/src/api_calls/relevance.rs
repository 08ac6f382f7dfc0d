//! Relevance: how an incoming call interacts with a call already queued for
//! the same object.
//!
//! The table is total over `CallKind × CallKind`. Custom tables are checked
//! when built, so a missing pair is a startup error and never a surprise at
//! dispatch time.

use serde::Serialize;
use thiserror::Error;

use super::CallKind;

/// What to do with an incoming call given the call queued ahead of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Relevance {
    /// Drop the queued call and install the incoming one.
    Replace,
    /// Fold the incoming call into the queued one. Same kind only.
    Merge,
    /// Refuse the incoming call.
    Reject,
    /// Keep both, incoming runs after the queued call.
    Append,
}

/// Errors building a relevance table.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RelevanceError {
    #[error("no relevance defined for {incoming} arriving behind queued {queued}")]
    Missing { queued: CallKind, incoming: CallKind },

    #[error("relevance for {incoming} arriving behind queued {queued} defined twice")]
    Duplicate { queued: CallKind, incoming: CallKind },

    #[error("cannot merge {incoming} into {queued}: payloads of different kinds")]
    MergeAcrossKinds { queued: CallKind, incoming: CallKind },
}

/// Total mapping `(queued kind, incoming kind) -> Relevance`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelevanceTable {
    entries: [[Relevance; CallKind::COUNT]; CallKind::COUNT],
}

impl RelevanceTable {
    /// Build a table from explicit entries.
    ///
    /// Every pair of kinds must appear exactly once.
    pub fn new(
        entries: impl IntoIterator<Item = (CallKind, CallKind, Relevance)>,
    ) -> Result<Self, RelevanceError> {
        let mut slots: [[Option<Relevance>; CallKind::COUNT]; CallKind::COUNT] =
            [[None; CallKind::COUNT]; CallKind::COUNT];

        for (queued, incoming, relevance) in entries {
            if relevance == Relevance::Merge && queued != incoming {
                return Err(RelevanceError::MergeAcrossKinds { queued, incoming });
            }
            let slot = &mut slots[queued.index()][incoming.index()];
            if slot.is_some() {
                return Err(RelevanceError::Duplicate { queued, incoming });
            }
            *slot = Some(relevance);
        }

        let mut table = [[Relevance::Reject; CallKind::COUNT]; CallKind::COUNT];
        for queued in CallKind::ALL {
            for incoming in CallKind::ALL {
                table[queued.index()][incoming.index()] = slots[queued.index()]
                    [incoming.index()]
                .ok_or(RelevanceError::Missing { queued, incoming })?;
            }
        }

        Ok(Self { entries: table })
    }

    /// The table the scheduler runs with.
    ///
    /// A newer placement decision replaces an older one, deletes supersede
    /// everything except another delete, status patches merge, and nothing
    /// may be queued behind a delete.
    pub fn standard() -> Self {
        let mut entries = [[Relevance::Reject; CallKind::COUNT]; CallKind::COUNT];
        for queued in CallKind::ALL {
            for incoming in CallKind::ALL {
                entries[queued.index()][incoming.index()] = standard_relevance(queued, incoming);
            }
        }
        Self { entries }
    }

    pub fn relevance(&self, queued: CallKind, incoming: CallKind) -> Relevance {
        self.entries[queued.index()][incoming.index()]
    }

    /// All entries as `(queued, incoming, relevance)`.
    pub fn entries(&self) -> impl Iterator<Item = (CallKind, CallKind, Relevance)> + '_ {
        CallKind::ALL.into_iter().flat_map(move |queued| {
            CallKind::ALL
                .into_iter()
                .map(move |incoming| (queued, incoming, self.relevance(queued, incoming)))
        })
    }
}

impl Default for RelevanceTable {
    fn default() -> Self {
        Self::standard()
    }
}

fn standard_relevance(queued: CallKind, incoming: CallKind) -> Relevance {
    use CallKind::*;
    use Relevance::*;

    match (queued, incoming) {
        (Bind, Bind) => Replace,
        (Bind, StatusPatch) => Reject,
        (Bind, Delete) => Replace,
        (Bind, Update) => Append,

        (StatusPatch, Bind) => Replace,
        (StatusPatch, StatusPatch) => Merge,
        (StatusPatch, Delete) => Replace,
        (StatusPatch, Update) => Append,

        (Delete, Bind) => Reject,
        (Delete, StatusPatch) => Reject,
        (Delete, Delete) => Replace,
        (Delete, Update) => Reject,

        (Update, Bind) => Append,
        (Update, StatusPatch) => Append,
        (Update, Delete) => Replace,
        (Update, Update) => Replace,
    }
}
