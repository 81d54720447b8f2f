//! The action summary: the record every rank reduces across the world
//! before each collective to agree on what to do next.

use crate::engine::base::ControlWord;
use crate::reduce::Reducer;
use crate::types::SeqNo;

pub(crate) const FLAG_LOAD_CHECK: u32 = 1 << 0;
pub(crate) const FLAG_CHECK_POINT: u32 = 1 << 1;
pub(crate) const FLAG_CHECK_ACK: u32 = 1 << 2;

/// Requested action + sequence position of one rank.
///
/// The reduction across ranks bit-ORs the flags and takes both the minimum
/// and maximum of the sequence numbers: tracking the maximum alongside the
/// minimum is what reveals whether the inputs disagreed (`diff_seq`), which
/// min alone cannot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ActionSummary {
    flags: u32,
    min_seq: SeqNo,
    max_seq: SeqNo,
}

impl ActionSummary {
    pub(crate) fn new(flags: u32, seqno: SeqNo) -> Self {
        Self {
            flags,
            min_seq: seqno,
            max_seq: seqno,
        }
    }

    pub(crate) fn load_check(&self) -> bool {
        self.flags & FLAG_LOAD_CHECK != 0
    }

    pub(crate) fn check_point(&self) -> bool {
        self.flags & FLAG_CHECK_POINT != 0
    }

    pub(crate) fn check_ack(&self) -> bool {
        self.flags & FLAG_CHECK_ACK != 0
    }

    pub(crate) fn min_seqno(&self) -> SeqNo {
        self.min_seq
    }

    /// True iff some rank reduced in a sequence number below `MAX_SEQ` and
    /// the ranks did not all submit the same one.
    pub(crate) fn diff_seq(&self) -> bool {
        self.min_seq != self.max_seq
    }

    pub(crate) fn merge(&mut self, other: &ActionSummary) {
        self.flags |= other.flags;
        self.min_seq = self.min_seq.min(other.min_seq);
        self.max_seq = self.max_seq.max(other.max_seq);
    }
}

impl ControlWord for ActionSummary {
    const WIRE_BYTES: usize = 12;

    fn encode(&self, out: &mut [u8]) {
        out[0..4].copy_from_slice(&self.flags.to_le_bytes());
        out[4..8].copy_from_slice(&self.min_seq.to_le_bytes());
        out[8..12].copy_from_slice(&self.max_seq.to_le_bytes());
    }

    fn decode(bytes: &[u8]) -> Self {
        Self {
            flags: u32::from_le_bytes(bytes[0..4].try_into().unwrap()),
            min_seq: u32::from_le_bytes(bytes[4..8].try_into().unwrap()),
            max_seq: u32::from_le_bytes(bytes[8..12].try_into().unwrap()),
        }
    }
}

/// Reducer over wire-encoded action summaries, fed to the base allreduce.
pub(crate) struct SummaryReducer;

impl Reducer for SummaryReducer {
    fn reduce(&self, src: &[u8], dst: &mut [u8], type_nbytes: usize, count: usize) {
        debug_assert_eq!(type_nbytes, ActionSummary::WIRE_BYTES);
        for idx in 0..count {
            let at = idx * ActionSummary::WIRE_BYTES;
            let span = at..at + ActionSummary::WIRE_BYTES;
            let mut acc = ActionSummary::decode(&dst[span.clone()]);
            acc.merge(&ActionSummary::decode(&src[span.clone()]));
            acc.encode(&mut dst[span]);
        }
    }
}
