//! The fault-tolerant engine: public collectives, checkpointing, and the
//! action-summary protocol that drives every recovery.

pub(crate) mod base;
pub(crate) mod recovery;
pub(crate) mod resbuf;
pub(crate) mod routing;
pub(crate) mod summary;

use crate::config::TenaxConfig;
use crate::error::{Result, TenaxError};
use crate::reduce::Reducer;
use crate::types::{MAX_SEQ, Rank, SeqNo};
use base::{BaseEngine, ControlWord};
use recovery::RecoverBuf;
use routing::RecoverRole;
use summary::{ActionSummary, FLAG_CHECK_ACK, FLAG_CHECK_POINT, FLAG_LOAD_CHECK, SummaryReducer};

/// A fault-tolerant communicator handle, one per worker process.
///
/// All collectives are in-place and must be called by every rank with the
/// same operation sequence. None of the entry points is re-entrant; the
/// `&mut self` receivers serialize callers.
pub struct TenaxEngine {
    base: BaseEngine,
    resbuf: resbuf::ResultBuffer,
    seq_counter: SeqNo,
    version_number: u32,
    global_checkpoint: Vec<u8>,
    result_buffer_round: u32,
}

impl TenaxEngine {
    /// Join the cluster through the configured tracker and stand up the
    /// first link mesh.
    pub async fn init(cfg: TenaxConfig) -> Result<Self> {
        let base = BaseEngine::connect(cfg).await?;
        let result_buffer_round = match base.cfg.result_replicate {
            Some(k) => (base.world_size / k.max(1)).max(1),
            None => base.cfg.result_buffer_round.max(1),
        };
        Ok(Self {
            base,
            resbuf: resbuf::ResultBuffer::new(),
            seq_counter: 0,
            version_number: 0,
            global_checkpoint: Vec::new(),
            result_buffer_round,
        })
    }

    pub fn rank(&self) -> Rank {
        self.base.rank
    }

    pub fn world_size(&self) -> u32 {
        self.base.world_size
    }

    /// Number of successful checkpoints so far; 0 means none yet.
    pub fn version_number(&self) -> u32 {
        self.version_number
    }

    /// Adjust an engine parameter.
    ///
    /// Recognized names: `result_buffer_round` (sets the retention period R
    /// directly) and `result_replicate` (sets `R = max(world_size / k, 1)`).
    /// Unrecognized names are ignored.
    pub fn set_param(&mut self, name: &str, value: &str) -> Result<()> {
        let parse = |value: &str| -> Result<u32> {
            match value.parse::<u32>() {
                Ok(v) if v > 0 => Ok(v),
                _ => Err(TenaxError::InvalidParam {
                    name: name.to_string(),
                    reason: format!("expected a positive integer, got {value:?}"),
                }),
            }
        };
        match name {
            "result_buffer_round" => self.result_buffer_round = parse(value)?,
            "result_replicate" => {
                self.result_buffer_round = (self.base.world_size / parse(value)?).max(1);
            }
            _ => {}
        }
        Ok(())
    }

    /// In-place associative reduction of `buf` across all ranks.
    ///
    /// `buf` holds `count` elements of `type_nbytes` bytes each. Transient
    /// network failures are absorbed by the recovery protocol; the call
    /// returns once every rank holds the reduced result (possibly served
    /// from a peer's result cache rather than recomputed).
    pub async fn allreduce(
        &mut self,
        buf: &mut [u8],
        type_nbytes: usize,
        count: usize,
        reducer: &dyn Reducer,
    ) -> Result<()> {
        assert_eq!(buf.len(), type_nbytes * count, "buffer/element shape mismatch");
        let mut recovered = self.recover_exec(Some(&mut *buf), 0, self.seq_counter).await?;
        self.apply_retention();
        self.resbuf.alloc_temp(type_nbytes, count);
        loop {
            if recovered {
                self.resbuf.scratch_mut().copy_from_slice(buf);
                break;
            }
            self.resbuf.scratch_mut().copy_from_slice(buf);
            let res = self
                .base
                .try_allreduce(self.resbuf.scratch_mut(), type_nbytes, count, reducer)
                .await;
            if self.base.check_and_recover(res).await? {
                buf.copy_from_slice(self.resbuf.scratch_mut());
                break;
            }
            recovered = self.recover_exec(Some(&mut *buf), 0, self.seq_counter).await?;
        }
        self.resbuf.push_temp(self.seq_counter, type_nbytes, count);
        self.seq_counter += 1;
        Ok(())
    }

    /// In-place broadcast of `buf` from `root` to all ranks.
    pub async fn broadcast(&mut self, buf: &mut [u8], root: Rank) -> Result<()> {
        let size = buf.len();
        let mut recovered = self.recover_exec(Some(&mut *buf), 0, self.seq_counter).await?;
        self.apply_retention();
        self.resbuf.alloc_temp(1, size);
        loop {
            if recovered {
                self.resbuf.scratch_mut().copy_from_slice(buf);
                break;
            }
            let res = self.base.try_broadcast(buf, root).await;
            if self.base.check_and_recover(res).await? {
                self.resbuf.scratch_mut().copy_from_slice(buf);
                break;
            }
            recovered = self.recover_exec(Some(&mut *buf), 0, self.seq_counter).await?;
        }
        self.resbuf.push_temp(self.seq_counter, 1, size);
        self.seq_counter += 1;
        Ok(())
    }

    /// Load the latest checkpoint into `global_model`.
    ///
    /// Returns the version number of the checkpoint loaded; 0 means no
    /// checkpoint exists yet and the model is untouched, so the caller
    /// initializes parameters itself. `local_model` must be `None`:
    /// rank-local state is not replicated.
    pub async fn load_checkpoint(
        &mut self,
        global_model: &mut Vec<u8>,
        local_model: Option<&mut Vec<u8>>,
    ) -> Result<u32> {
        if local_model.is_some() {
            return Err(TenaxError::LocalModelUnsupported);
        }
        if self.recover_exec(None, FLAG_LOAD_CHECK, MAX_SEQ).await? {
            self.resbuf.clear();
            self.seq_counter = 0;
            let version = checkpoint_version(&self.global_checkpoint);
            self.version_number = version;
            if version == 0 {
                return Ok(0);
            }
            global_model.clear();
            global_model.extend_from_slice(&self.global_checkpoint[4..]);
            // One more round of agreement so that every collaborator knows
            // the recovered model has been handed over.
            let acked = self.recover_exec(None, FLAG_CHECK_ACK, MAX_SEQ).await?;
            assert!(acked, "check ack must complete");
            Ok(version)
        } else {
            // Everyone asked to load at once: nothing to recover from.
            self.resbuf.clear();
            self.seq_counter = 0;
            Ok(0)
        }
    }

    /// Commit `global_model` as the new checkpoint on every rank,
    /// incrementing the version number and starting a fresh sequence epoch.
    pub async fn checkpoint(&mut self, global_model: &[u8]) -> Result<()> {
        let done = self.recover_exec(None, FLAG_CHECK_POINT, MAX_SEQ).await?;
        assert!(done, "checkpoint must complete");
        self.version_number += 1;
        self.global_checkpoint.clear();
        self.global_checkpoint
            .extend_from_slice(&self.version_number.to_le_bytes());
        self.global_checkpoint.extend_from_slice(global_model);
        self.resbuf.clear();
        self.seq_counter = 0;
        let acked = self.recover_exec(None, FLAG_CHECK_ACK, MAX_SEQ).await?;
        assert!(acked, "check ack must complete");
        Ok(())
    }

    /// Leave the communicator. Runs a pseudo-checkpoint so no peer is left
    /// waiting on this rank, then tells the tracker.
    pub async fn shutdown(mut self) -> Result<()> {
        let done = self.recover_exec(None, FLAG_CHECK_POINT, MAX_SEQ).await?;
        assert!(done, "checkpoint must complete");
        self.resbuf.clear();
        self.seq_counter = 0;
        let acked = self.recover_exec(None, FLAG_CHECK_ACK, MAX_SEQ).await?;
        assert!(acked, "check ack must complete");
        self.base.notify_tracker_shutdown().await
    }

    /// Drop the previous cached result unless this rank is its designated
    /// keeper (`seqno % R == rank % R`).
    fn apply_retention(&mut self) {
        if let Some(last) = self.resbuf.last_seqno() {
            if last % self.result_buffer_round != self.base.rank % self.result_buffer_round {
                self.resbuf.drop_last();
            }
        }
    }

    /// Reduce the requested action across the world and run whatever
    /// recovery it implies, until this rank's own request is either
    /// satisfied cooperatively (`true`: `buf` already holds the result) or
    /// agreed to be the next fresh operation (`false`: the caller executes
    /// the collective for real).
    ///
    /// `flag` is zero for normal collectives (with `seqno = seq_counter`)
    /// and one of the checkpoint flags otherwise (with `seqno = MAX_SEQ`).
    pub(crate) async fn recover_exec(
        &mut self,
        mut buf: Option<&mut [u8]>,
        flag: u32,
        seqno: SeqNo,
    ) -> Result<bool> {
        if flag != 0 {
            assert_eq!(seqno, MAX_SEQ, "flagged actions carry no sequence number");
        }
        let req = ActionSummary::new(flag, seqno);
        let mut wire = [0u8; 12];
        loop {
            req.encode(&mut wire);
            let res = self
                .base
                .try_allreduce(&mut wire, ActionSummary::WIRE_BYTES, 1, &SummaryReducer)
                .await;
            if !self.base.check_and_recover(res).await? {
                continue;
            }
            let act = ActionSummary::decode(&wire);

            if act.check_ack() {
                if act.check_point() {
                    // A checkpoint proposal and its ack phase cannot overlap
                    // normal operations.
                    assert!(!act.diff_seq(), "checkpoint mixed with pending collectives");
                    if req.check_point() {
                        return Ok(true);
                    }
                } else if act.load_check() {
                    let res = self.try_load_checkpoint(req.load_check()).await;
                    if !self.base.check_and_recover(res).await? {
                        continue;
                    }
                    if req.load_check() {
                        return Ok(true);
                    }
                } else if req.check_ack() {
                    return Ok(true);
                }
                // Someone else's request is still outstanding: next round.
            } else if act.check_point() {
                if act.diff_seq() {
                    // A peer lags behind the proposed checkpoint: feed it
                    // the result it is missing first.
                    assert_ne!(act.min_seqno(), MAX_SEQ, "lagging peer must carry a seqno");
                    let requester = req.min_seqno() == act.min_seqno();
                    let res = self
                        .try_get_result(buf.as_deref_mut(), act.min_seqno(), requester)
                        .await;
                    if !self.base.check_and_recover(res).await? {
                        continue;
                    }
                    if requester {
                        return Ok(true);
                    }
                } else if req.check_point() {
                    return Ok(true);
                }
            } else if act.load_check() {
                if !act.diff_seq() {
                    // Every rank asked to load at once: an incomplete
                    // action, nobody has anything to serve.
                    return Ok(false);
                }
                let res = self.try_load_checkpoint(req.load_check()).await;
                if !self.base.check_and_recover(res).await? {
                    continue;
                }
                if req.load_check() {
                    return Ok(true);
                }
            } else {
                assert_ne!(act.min_seqno(), MAX_SEQ, "plain action must carry a seqno");
                if act.diff_seq() {
                    let requester = req.min_seqno() == act.min_seqno();
                    let res = self
                        .try_get_result(buf.as_deref_mut(), act.min_seqno(), requester)
                        .await;
                    if !self.base.check_and_recover(res).await? {
                        continue;
                    }
                    if requester {
                        return Ok(true);
                    }
                } else {
                    // Every rank is at the same point: this is the freshly
                    // requested operation, run it for real.
                    return Ok(false);
                }
            }
        }
    }

    /// Cooperative fetch of the result committed at `seqno`. The requester
    /// receives it into its own buffer; everyone else serves from its cache
    /// or passes bytes through.
    async fn try_get_result(
        &mut self,
        buf: Option<&mut [u8]>,
        seqno: SeqNo,
        requester: bool,
    ) -> Result<()> {
        if requester {
            let buf = buf.expect("lagging requester supplies the result buffer");
            let mut size = buf.len();
            let plan = self
                .base
                .try_decide_routing(RecoverRole::RequestData, &mut size)
                .await?;
            assert_ne!(size, 0, "a committed result is never empty");
            if size != buf.len() {
                // The requester replays its own deterministic operation
                // sequence, so the cached payload must fit exactly.
                return Err(TenaxError::SizeMismatch {
                    local: buf.len() as u64,
                    remote: size as u64,
                });
            }
            self.base
                .try_recover_data(RecoverBuf::Request(buf), size, plan.recv_link, &plan.req_in)
                .await
        } else {
            match self.resbuf.query(seqno) {
                Some(payload) => {
                    let mut size = payload.len();
                    let plan = self
                        .base
                        .try_decide_routing(RecoverRole::HaveData, &mut size)
                        .await?;
                    self.base
                        .try_recover_data(RecoverBuf::Have(payload), size, plan.recv_link, &plan.req_in)
                        .await
                }
                None => {
                    let mut size = 0;
                    let plan = self
                        .base
                        .try_decide_routing(RecoverRole::PassData, &mut size)
                        .await?;
                    self.base
                        .try_recover_data(RecoverBuf::Pass, size, plan.recv_link, &plan.req_in)
                        .await
                }
            }
        }
    }

    /// Cooperative replication of the checkpoint blob toward the requester.
    async fn try_load_checkpoint(&mut self, requester: bool) -> Result<()> {
        let role = if requester {
            RecoverRole::RequestData
        } else {
            RecoverRole::HaveData
        };
        let mut size = self.global_checkpoint.len();
        let plan = self.base.try_decide_routing(role, &mut size).await?;
        if requester {
            self.global_checkpoint.resize(size, 0);
        }
        if size == 0 {
            return Ok(());
        }
        let data = if requester {
            RecoverBuf::Request(self.global_checkpoint.as_mut_slice())
        } else {
            RecoverBuf::Have(self.global_checkpoint.as_slice())
        };
        self.base
            .try_recover_data(data, size, plan.recv_link, &plan.req_in)
            .await
    }
}

fn checkpoint_version(blob: &[u8]) -> u32 {
    if blob.len() < 4 {
        0
    } else {
        u32::from_le_bytes(blob[0..4].try_into().unwrap())
    }
}
