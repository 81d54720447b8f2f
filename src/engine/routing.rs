//! Route selection for data recovery: who has the payload, who needs it,
//! and along which links it must flow.
//!
//! Two single-round message passes over the tree decide everything. The
//! first propagates, per edge, the hop distance to the nearest payload
//! holder; the second propagates demand back along each node's chosen
//! source edge.

use crate::engine::base::{BaseEngine, ControlWord};
use crate::error::{Result, TenaxError};
use crate::types::Rank;

/// Per-node role for one recovery transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RecoverRole {
    /// Wants the payload.
    RequestData,
    /// Holds the payload.
    HaveData,
    /// Neither; may forward between neighbours.
    PassData,
}

/// Hop count marking an unreachable direction.
pub(crate) const INF_HOPS: u32 = u32::MAX;

/// Distance word of the first pass: hops to the nearest payload holder and
/// the payload size that holder reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct DistMsg {
    pub(crate) hops: u32,
    pub(crate) size: u64,
}

impl DistMsg {
    pub(crate) const UNREACHABLE: DistMsg = DistMsg {
        hops: INF_HOPS,
        size: 0,
    };
}

impl ControlWord for DistMsg {
    const WIRE_BYTES: usize = 12;

    fn encode(&self, out: &mut [u8]) {
        out[0..4].copy_from_slice(&self.hops.to_le_bytes());
        out[4..12].copy_from_slice(&self.size.to_le_bytes());
    }

    fn decode(bytes: &[u8]) -> Self {
        Self {
            hops: u32::from_le_bytes(bytes[0..4].try_into().unwrap()),
            size: u64::from_le_bytes(bytes[4..12].try_into().unwrap()),
        }
    }
}

/// Demand word of the second pass: 1 asks the receiver for the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ReqMsg(pub(crate) u8);

impl ControlWord for ReqMsg {
    const WIRE_BYTES: usize = 1;

    fn encode(&self, out: &mut [u8]) {
        out[0] = self.0;
    }

    fn decode(bytes: &[u8]) -> Self {
        Self(bytes[0])
    }
}

/// First-pass combinator. A node holding the payload reports one hop and
/// its size on every edge; any other node forwards the best distance seen
/// on its *other* edges, one hop further. Unreachable propagates unchanged.
/// Ties break toward the lower link index.
pub(crate) fn shortest_dist(node: &(bool, u64), dist_in: &[DistMsg], out_index: usize) -> DistMsg {
    let (have_data, own_size) = *node;
    if have_data {
        return DistMsg {
            hops: 1,
            size: own_size,
        };
    }
    let mut best = DistMsg::UNREACHABLE;
    for (i, d) in dist_in.iter().enumerate() {
        if i == out_index || d.hops == INF_HOPS {
            continue;
        }
        if d.hops + 1 < best.hops {
            best = DistMsg {
                hops: d.hops + 1,
                size: d.size,
            };
        }
    }
    best
}

/// Second-pass combinator. A node emits a request on its chosen best link
/// iff it needs the payload itself or any *other* edge is asking it.
pub(crate) fn data_request(node: &(bool, i32), req_in: &[ReqMsg], out_index: usize) -> ReqMsg {
    let (request_data, best_link) = *node;
    if out_index as i32 == best_link {
        if request_data {
            return ReqMsg(1);
        }
        for (i, r) in req_in.iter().enumerate() {
            if i != out_index && r.0 != 0 {
                return ReqMsg(1);
            }
        }
    }
    ReqMsg(0)
}

/// Routing result: the link to receive on (`-1` when this node already has
/// the payload) and, per link, whether this node must send the payload there.
#[derive(Debug, Clone)]
pub(crate) struct RoutePlan {
    pub(crate) recv_link: i32,
    pub(crate) req_in: Vec<bool>,
}

/// Pick the source link from the inbound distance words.
///
/// On success `size` holds the payload size the chosen source reports.
/// Every reachable neighbour must report the same size; for a given seqno
/// all live peers agree on the payload size, so disagreement is a fatal
/// protocol error, as is having no reachable source at all.
pub(crate) fn select_source(
    dist_in: &[DistMsg],
    have_data: bool,
    size: &mut usize,
    rank: Rank,
) -> Result<i32> {
    if have_data {
        return Ok(-1);
    }
    let mut best: i32 = -2;
    for (i, d) in dist_in.iter().enumerate() {
        if d.hops == INF_HOPS {
            continue;
        }
        if best != -2 && *size as u64 != d.size {
            tracing::error!(
                rank,
                local = *size,
                remote = d.size,
                "recovery size disagreement between live peers"
            );
            return Err(TenaxError::SizeMismatch {
                local: *size as u64,
                remote: d.size,
            });
        }
        if best == -2 || d.hops < dist_in[best as usize].hops {
            best = i as i32;
            *size = d.size as usize;
        }
    }
    if best == -2 {
        return Err(TenaxError::Unrecoverable);
    }
    Ok(best)
}

impl BaseEngine {
    /// Compose the two message passes into a routing decision.
    ///
    /// `size` must hold the payload size when `role` is `HaveData`; for the
    /// other roles it is an output.
    pub(crate) async fn try_decide_routing(
        &mut self,
        role: RecoverRole,
        size: &mut usize,
    ) -> Result<RoutePlan> {
        let have = role == RecoverRole::HaveData;
        let (dist_in, _) = self
            .msg_passing((have, *size as u64), DistMsg::UNREACHABLE, shortest_dist)
            .await?;
        let recv_link = select_source(&dist_in, have, size, self.rank)?;

        let want = role == RecoverRole::RequestData;
        let (req_in_raw, req_out) = self
            .msg_passing((want, recv_link), ReqMsg(0), data_request)
            .await?;

        let mut req_in = Vec::with_capacity(req_in_raw.len());
        for (i, r) in req_in_raw.iter().enumerate() {
            req_in.push(r.0 != 0);
            if req_out[i].0 != 0 {
                assert_eq!(i as i32, recv_link, "data request sent on a non-optimal link");
                assert_eq!(r.0, 0, "cannot both request from and serve the same link");
            }
        }
        Ok(RoutePlan { recv_link, req_in })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INF: DistMsg = DistMsg::UNREACHABLE;

    fn d(hops: u32, size: u64) -> DistMsg {
        DistMsg { hops, size }
    }

    #[test]
    fn test_shortest_dist_holder_reports_itself() {
        let out = shortest_dist(&(true, 64), &[d(3, 64), INF], 0);
        assert_eq!(out, d(1, 64));
    }

    #[test]
    fn test_shortest_dist_forwards_minimum_plus_one() {
        let out = shortest_dist(&(false, 0), &[d(2, 64), d(5, 64), INF], 2);
        assert_eq!(out, d(3, 64));
    }

    #[test]
    fn test_shortest_dist_excludes_out_edge() {
        // The only finite distance arrives on the edge we are sending to,
        // so nothing can be offered there.
        let out = shortest_dist(&(false, 0), &[d(2, 64), INF], 0);
        assert_eq!(out, INF);
    }

    #[test]
    fn test_shortest_dist_unreachable_propagates_unchanged() {
        let out = shortest_dist(&(false, 0), &[INF, INF, INF], 1);
        assert_eq!(out, INF);
    }

    #[test]
    fn test_shortest_dist_tie_breaks_to_lower_index() {
        let out = shortest_dist(&(false, 0), &[d(2, 11), d(2, 22)], 2);
        assert_eq!(out, d(3, 11));
    }

    #[test]
    fn test_data_request_requester_asks_best_link() {
        assert_eq!(data_request(&(true, 1), &[ReqMsg(0), ReqMsg(0)], 1), ReqMsg(1));
        assert_eq!(data_request(&(true, 1), &[ReqMsg(0), ReqMsg(0)], 0), ReqMsg(0));
    }

    #[test]
    fn test_data_request_forwards_demand() {
        // Demand arriving on edge 0 is pushed out on the best link 2 only.
        let req_in = [ReqMsg(1), ReqMsg(0), ReqMsg(0)];
        assert_eq!(data_request(&(false, 2), &req_in, 2), ReqMsg(1));
        assert_eq!(data_request(&(false, 2), &req_in, 1), ReqMsg(0));
    }

    #[test]
    fn test_data_request_holder_stays_silent() {
        // A payload holder carries best_link = -1 and never emits requests.
        let req_in = [ReqMsg(1), ReqMsg(1)];
        assert_eq!(data_request(&(false, -1), &req_in, 0), ReqMsg(0));
        assert_eq!(data_request(&(false, -1), &req_in, 1), ReqMsg(0));
    }

    #[test]
    fn test_select_source_picks_nearest() {
        let mut size = 0usize;
        let best = select_source(&[d(4, 96), d(2, 96), INF], false, &mut size, 0).unwrap();
        assert_eq!(best, 1);
        assert_eq!(size, 96);
    }

    #[test]
    fn test_select_source_have_data_receives_nowhere() {
        let mut size = 96usize;
        let best = select_source(&[d(1, 96)], true, &mut size, 0).unwrap();
        assert_eq!(best, -1);
        assert_eq!(size, 96);
    }

    #[test]
    fn test_select_source_rejects_disagreeing_sizes() {
        let mut size = 0usize;
        let err = select_source(&[d(2, 64), d(3, 128)], false, &mut size, 0).unwrap_err();
        assert!(matches!(err, TenaxError::SizeMismatch { .. }));
    }

    #[test]
    fn test_select_source_fails_when_nobody_has_data() {
        let mut size = 0usize;
        let err = select_source(&[INF, INF], false, &mut size, 0).unwrap_err();
        assert!(matches!(err, TenaxError::Unrecoverable));
    }

    #[test]
    fn test_control_word_roundtrip() {
        let mut wire = [0u8; 12];
        let msg = d(7, 1 << 40);
        msg.encode(&mut wire);
        assert_eq!(DistMsg::decode(&wire), msg);

        let mut wire = [0u8; 1];
        ReqMsg(1).encode(&mut wire);
        assert_eq!(ReqMsg::decode(&wire), ReqMsg(1));
    }
}
