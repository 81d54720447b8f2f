//! Bounded, sequence-indexed cache of recent collective results, used to
//! answer catch-up requests from lagging peers without re-running the
//! user's reduction.

use crate::types::SeqNo;

struct ResultEntry {
    seqno: SeqNo,
    type_nbytes: usize,
    count: usize,
    data: Vec<u8>,
}

/// Entries are strictly ordered by sequence number and unique. The scratch
/// region stages the in-flight result so the caller can fill it in place and
/// commit it once the collective succeeds.
#[derive(Default)]
pub(crate) struct ResultBuffer {
    entries: Vec<ResultEntry>,
    scratch: Vec<u8>,
}

impl ResultBuffer {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Reserve scratch space for a `type_nbytes * count` result and return
    /// it for staging.
    pub(crate) fn alloc_temp(&mut self, type_nbytes: usize, count: usize) -> &mut [u8] {
        self.scratch.clear();
        self.scratch.resize(type_nbytes * count, 0);
        &mut self.scratch
    }

    pub(crate) fn scratch_mut(&mut self) -> &mut [u8] {
        &mut self.scratch
    }

    /// Commit the staged scratch as the newest entry.
    pub(crate) fn push_temp(&mut self, seqno: SeqNo, type_nbytes: usize, count: usize) {
        debug_assert_eq!(self.scratch.len(), type_nbytes * count);
        if let Some(last) = self.entries.last() {
            assert!(last.seqno < seqno, "result seqnos must increase strictly");
        }
        self.entries.push(ResultEntry {
            seqno,
            type_nbytes,
            count,
            data: std::mem::take(&mut self.scratch),
        });
    }

    /// Discard the most recent entry.
    pub(crate) fn drop_last(&mut self) {
        self.entries.pop();
    }

    /// Payload of the result committed at `seqno`, if retained.
    pub(crate) fn query(&self, seqno: SeqNo) -> Option<&[u8]> {
        self.entries
            .binary_search_by_key(&seqno, |e| e.seqno)
            .ok()
            .map(|idx| {
                let entry = &self.entries[idx];
                debug_assert_eq!(entry.data.len(), entry.type_nbytes * entry.count);
                entry.data.as_slice()
            })
    }

    /// Sequence number of the newest entry, `None` when empty.
    pub(crate) fn last_seqno(&self) -> Option<SeqNo> {
        self.entries.last().map(|e| e.seqno)
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
        self.scratch.clear();
    }
}
