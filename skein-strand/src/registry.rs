//! Id-keyed table of live strands.
//!
//! A strand is entered when it starts (ownership passes from its creator to
//! the strand itself) and removed when it terminates. Adopted OS threads are
//! entered on first use and removed when the thread exits.

use std::sync::LazyLock;

use dashmap::DashMap;

use crate::{Strand, StrandId};

static LIVE: LazyLock<DashMap<StrandId, Strand>> = LazyLock::new(DashMap::new);

pub(crate) fn insert(strand: &Strand) {
    LIVE.insert(strand.id(), strand.clone());
}

pub(crate) fn remove(id: StrandId) {
    LIVE.remove(&id);
}

/// Looks up a started, not yet terminated strand by id.
pub fn lookup(id: StrandId) -> Option<Strand> {
    LIVE.get(&id).map(|entry| entry.value().clone())
}

/// Number of started, not yet terminated strands, adopted threads included.
pub fn live_strands() -> usize {
    LIVE.len()
}
