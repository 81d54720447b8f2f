use crate::types::Rank;

/// Control messages exchanged between workers and the rendezvous tracker.
///
/// Collective payloads do NOT flow through this enum; they travel on the
/// peer-to-peer data streams as raw bytes with counter-based framing.
#[derive(rkyv::Archive, rkyv::Serialize, rkyv::Deserialize, Debug, Clone, PartialEq)]
pub enum TrackerMessage {
    /// A worker asking to (re)join the communicator.
    Join {
        protocol_version: u16,
        /// Address of the worker's peer listener, e.g. `127.0.0.1:41523`.
        listen_addr: String,
        /// The rank this worker held before the links went down, if any.
        /// Restarted workers join without a hint and receive a free rank.
        prev_rank: Option<Rank>,
    },

    /// Tracker's response once every worker of the round has joined.
    Assign {
        rank: Rank,
        world_size: u32,
        /// Topology generation; stale link handshakes are discarded by it.
        epoch: u32,
        /// `(rank, listen_addr)` for every worker in the communicator.
        peers: Vec<(Rank, String)>,
    },

    /// A worker announcing it has completed its final collective.
    Shutdown { rank: Rank },
}
