use crate::config::TenaxConfig;
use crate::error::{Result, TenaxError};
use crate::protocol::{
    LINK_HELLO_BYTES, STREAM_KIND_CTRL, STREAM_KIND_DATA, TrackerMessage, decode_link_hello,
    encode_link_hello, recv_frame, send_frame,
};
use crate::reduce::Reducer;
use crate::transport::link::Link;
use crate::types::{PROTOCOL_VERSION, Rank};
use std::collections::{BTreeSet, HashMap};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// Delay between tracker rendezvous attempts when the previous one failed.
const RECONNECT_BACKOFF: std::time::Duration = std::time::Duration::from_millis(50);

/// Fixed-width value exchanged by `msg_passing`. Encodings are byte-exact
/// and identical on every peer.
pub(crate) trait ControlWord: Clone {
    const WIRE_BYTES: usize;
    fn encode(&self, out: &mut [u8]);
    fn decode(bytes: &[u8]) -> Self;
}

/// The non-fault-tolerant collective substrate: the link set, the tree/ring
/// topology for the current epoch, and the primitive collectives the
/// recovery machinery is built from.
///
/// The reduction tree is the binary heap tree rooted at rank 0
/// (`parent = (r - 1) / 2`); the ring is `(r ± 1) mod n`. The link set is
/// the deduplicated union of both neighbourhoods, ordered by peer rank.
pub(crate) struct BaseEngine {
    pub(crate) rank: Rank,
    pub(crate) world_size: u32,
    pub(crate) links: Vec<Link>,
    /// Index into `links` of the tree parent, if any.
    pub(crate) parent_index: Option<usize>,
    /// Indices into `links` of the tree children.
    pub(crate) children: Vec<usize>,
    /// Indices into `links` of all tree neighbours (parent + children).
    pub(crate) tree_links: Vec<usize>,
    pub(crate) epoch: u32,
    listener: TcpListener,
    listen_addr: String,
    assigned_rank: Option<Rank>,
    pub(crate) cfg: TenaxConfig,
}

impl BaseEngine {
    /// Bind the peer listener and run the first tracker rendezvous.
    pub(crate) async fn connect(cfg: TenaxConfig) -> Result<Self> {
        let listener = TcpListener::bind(&cfg.bind_addr).await?;
        let listen_addr = listener.local_addr()?.to_string();
        let mut engine = Self {
            rank: 0,
            world_size: 1,
            links: Vec::new(),
            parent_index: None,
            children: Vec::new(),
            tree_links: Vec::new(),
            epoch: 0,
            listener,
            listen_addr,
            assigned_rank: None,
            cfg,
        };
        engine.reconnect_links("start").await?;
        Ok(engine)
    }

    /// Drop every link. Peers observe the closed sockets as errors, which
    /// cascades the failure and funnels everyone back to the tracker.
    pub(crate) fn close_all_links(&mut self) {
        self.links.clear();
        self.parent_index = None;
        self.children.clear();
        self.tree_links.clear();
    }

    /// Tear down and rebuild the link set through a tracker rendezvous.
    /// Retries until a full mesh for a fresh epoch is standing.
    pub(crate) async fn reconnect_links(&mut self, reason: &str) -> Result<()> {
        loop {
            self.close_all_links();
            match self.try_rebuild_mesh(reason).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_recoverable() => {
                    tracing::warn!(error = %e, reason, "mesh build failed, retrying rendezvous");
                    tokio::time::sleep(RECONNECT_BACKOFF).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn try_rebuild_mesh(&mut self, reason: &str) -> Result<()> {
        tracing::info!(reason, prev_rank = ?self.assigned_rank, "joining tracker rendezvous");
        let mut stream = TcpStream::connect(&self.cfg.tracker_addr)
            .await
            .map_err(|e| TenaxError::Tracker(format!("connect {}: {e}", self.cfg.tracker_addr)))?;
        send_frame(
            &mut stream,
            &TrackerMessage::Join {
                protocol_version: PROTOCOL_VERSION,
                listen_addr: self.listen_addr.clone(),
                prev_rank: self.assigned_rank,
            },
        )
        .await?;
        let (rank, world_size, epoch, peers) = match recv_frame(&mut stream).await? {
            TrackerMessage::Assign {
                rank,
                world_size,
                epoch,
                peers,
            } => (rank, world_size, epoch, peers),
            other => {
                return Err(TenaxError::Tracker(format!(
                    "expected assignment, got {other:?}"
                )));
            }
        };
        drop(stream);

        self.rank = rank;
        self.world_size = world_size;
        self.epoch = epoch;
        self.assigned_rank = Some(rank);
        tracing::info!(rank, world_size, epoch, "assigned topology");

        let addr_of: HashMap<Rank, String> = peers.into_iter().collect();
        let neighbours = neighbour_set(rank, world_size);

        // Lower ranks accept, higher ranks connect.
        let mut streams: HashMap<(Rank, u8), TcpStream> = HashMap::new();
        for &peer in &neighbours {
            if peer >= rank {
                continue;
            }
            let addr = addr_of
                .get(&peer)
                .ok_or_else(|| TenaxError::Tracker(format!("no address for rank {peer}")))?;
            for kind in [STREAM_KIND_DATA, STREAM_KIND_CTRL] {
                let mut s = TcpStream::connect(addr)
                    .await
                    .map_err(|e| TenaxError::link_down(peer, format!("connect: {e}")))?;
                s.set_nodelay(true)?;
                s.write_all(&encode_link_hello(self.epoch, self.rank, kind))
                    .await
                    .map_err(|e| TenaxError::link_down(peer, format!("hello: {e}")))?;
                streams.insert((peer, kind), s);
            }
        }

        let expected: BTreeSet<Rank> = neighbours.iter().copied().filter(|&p| p > rank).collect();
        while !expected
            .iter()
            .all(|&p| streams.contains_key(&(p, STREAM_KIND_DATA)) && streams.contains_key(&(p, STREAM_KIND_CTRL)))
        {
            let (mut s, from) = self.listener.accept().await?;
            s.set_nodelay(true)?;
            let mut hello = [0u8; LINK_HELLO_BYTES];
            if s.read_exact(&mut hello).await.is_err() {
                continue;
            }
            match decode_link_hello(&hello) {
                Some((e, peer, kind)) if e == epoch && expected.contains(&peer) => {
                    streams.insert((peer, kind), s);
                }
                Some((stale, peer, _)) => {
                    tracing::debug!(%from, peer, stale, epoch, "discarding stale link handshake");
                }
                None => {
                    tracing::debug!(%from, "discarding malformed link handshake");
                }
            }
        }

        for &peer in &neighbours {
            let data = streams.remove(&(peer, STREAM_KIND_DATA)).expect("data half");
            let ctrl = streams.remove(&(peer, STREAM_KIND_CTRL)).expect("ctrl half");
            let mut link = Link::new(peer, data, ctrl);
            link.init_buffer(self.cfg.ring_buffer_bytes);
            self.links.push(link);
        }

        self.index_topology();
        Ok(())
    }

    /// Recompute the per-link role indices after the link set changed.
    fn index_topology(&mut self) {
        let rank = self.rank;
        let world = self.world_size;
        self.parent_index = tree_parent(rank).map(|p| self.link_index_of(p));
        self.children = tree_children(rank, world)
            .into_iter()
            .map(|c| self.link_index_of(c))
            .collect();
        self.tree_links = self
            .parent_index
            .into_iter()
            .chain(self.children.iter().copied())
            .collect();
        debug_assert!(
            ring_neighbours(rank, world)
                .map(|(prev, next)| {
                    self.links.iter().any(|l| l.peer() == prev)
                        && self.links.iter().any(|l| l.peer() == next)
                })
                .unwrap_or(true),
            "ring neighbours must be part of the mesh"
        );
    }

    pub(crate) fn link_index_of(&self, peer: Rank) -> usize {
        self.links
            .iter()
            .position(|l| l.peer() == peer)
            .expect("neighbour rank has a link")
    }

    /// `Ok` passes through as `true`. A recoverable failure closes every
    /// link, re-runs the rendezvous and yields `false` so the caller's
    /// action-summary loop rebuilds agreement. Fatal errors propagate.
    ///
    /// The old escalation ladder (drain-and-resync on a reset signal,
    /// resync + reconnect on a socket error) is intentionally bypassed:
    ///
    /// ```text
    /// loop {
    ///     match err {
    ///         ResetSignal => err = self.try_reset_links().await,
    ///         LinkDown { .. } => {
    ///             let _ = self.try_reset_links().await;
    ///             self.reconnect_links("recover").await?;
    ///             break;
    ///         }
    ///     }
    /// }
    /// ```
    pub(crate) async fn check_and_recover(&mut self, res: Result<()>) -> Result<bool> {
        match res {
            Ok(()) => Ok(true),
            Err(e) if e.is_recoverable() => {
                tracing::warn!(error = %e, rank = self.rank, "collective failed, rebuilding links");
                self.close_all_links();
                self.reconnect_links("recover").await?;
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// In-place tree allreduce: fold children into the local buffer, pass
    /// the partial result up, receive the final result from the parent and
    /// fan it back out.
    pub(crate) async fn try_allreduce(
        &mut self,
        buf: &mut [u8],
        type_nbytes: usize,
        count: usize,
        reducer: &dyn Reducer,
    ) -> Result<()> {
        debug_assert_eq!(buf.len(), type_nbytes * count);
        if self.links.is_empty() {
            return Ok(());
        }
        let mut child_buf = vec![0u8; buf.len()];
        for k in 0..self.children.len() {
            let ci = self.children[k];
            self.links[ci].recv_exact(&mut child_buf).await?;
            reducer.reduce(&child_buf, buf, type_nbytes, count);
        }
        if let Some(pi) = self.parent_index {
            self.links[pi].send_exact(buf).await?;
            self.links[pi].recv_exact(buf).await?;
        }
        for k in 0..self.children.len() {
            let ci = self.children[k];
            self.links[ci].send_exact(buf).await?;
        }
        Ok(())
    }

    /// In-place tree broadcast from `root`.
    pub(crate) async fn try_broadcast(&mut self, buf: &mut [u8], root: Rank) -> Result<()> {
        if self.links.is_empty() {
            return Ok(());
        }
        debug_assert!(root < self.world_size);
        let in_link = self.broadcast_in_link(root);
        if let Some(ii) = in_link {
            self.links[ii].recv_exact(buf).await?;
        }
        for k in 0..self.tree_links.len() {
            let li = self.tree_links[k];
            if Some(li) != in_link {
                self.links[li].send_exact(buf).await?;
            }
        }
        Ok(())
    }

    /// The tree neighbour on the unique path toward `root`, or `None` when
    /// this node is the root itself.
    fn broadcast_in_link(&self, root: Rank) -> Option<usize> {
        if root == self.rank {
            return None;
        }
        let mut node = root;
        while node > self.rank {
            let parent = (node - 1) / 2;
            if parent == self.rank {
                return Some(self.link_index_of(node));
            }
            node = parent;
        }
        Some(self.parent_index.expect("non-root node has a parent"))
    }

    /// Single-round edge-wise message passing over the tree: gather from
    /// children, combine up to the parent, receive from the parent, combine
    /// down to each child. For every link the outbound message is
    /// `combine(node_value, msgs from all *other* links, link index)`.
    ///
    /// Returns `(inbound, outbound)` message vectors over the whole link
    /// set; ring-only links keep the `init` value on both sides.
    pub(crate) async fn msg_passing<V, M, F>(
        &mut self,
        node_value: V,
        init: M,
        combine: F,
    ) -> Result<(Vec<M>, Vec<M>)>
    where
        M: ControlWord,
        F: Fn(&V, &[M], usize) -> M,
    {
        let nlink = self.links.len();
        let mut msg_in = vec![init.clone(); nlink];
        let mut msg_out = vec![init; nlink];
        if nlink == 0 {
            return Ok((msg_in, msg_out));
        }
        let mut wire = vec![0u8; M::WIRE_BYTES];

        for k in 0..self.children.len() {
            let ci = self.children[k];
            self.links[ci].recv_exact(&mut wire).await?;
            msg_in[ci] = M::decode(&wire);
        }
        if let Some(pi) = self.parent_index {
            let up = combine(&node_value, &msg_in, pi);
            up.encode(&mut wire);
            self.links[pi].send_exact(&wire).await?;
            msg_out[pi] = up;
            self.links[pi].recv_exact(&mut wire).await?;
            msg_in[pi] = M::decode(&wire);
        }
        for k in 0..self.children.len() {
            let ci = self.children[k];
            let down = combine(&node_value, &msg_in, ci);
            down.encode(&mut wire);
            self.links[ci].send_exact(&wire).await?;
            msg_out[ci] = down;
        }
        Ok((msg_in, msg_out))
    }

    /// Tell the tracker this worker has finished its final collective.
    pub(crate) async fn notify_tracker_shutdown(&self) -> Result<()> {
        let mut stream = TcpStream::connect(&self.cfg.tracker_addr)
            .await
            .map_err(|e| TenaxError::Tracker(format!("connect {}: {e}", self.cfg.tracker_addr)))?;
        send_frame(&mut stream, &TrackerMessage::Shutdown { rank: self.rank }).await
    }
}

pub(crate) fn tree_parent(rank: Rank) -> Option<Rank> {
    if rank == 0 { None } else { Some((rank - 1) / 2) }
}

pub(crate) fn tree_children(rank: Rank, world_size: u32) -> Vec<Rank> {
    [2 * rank + 1, 2 * rank + 2]
        .into_iter()
        .filter(|&c| c < world_size)
        .collect()
}

pub(crate) fn ring_neighbours(rank: Rank, world_size: u32) -> Option<(Rank, Rank)> {
    if world_size <= 1 {
        return None;
    }
    Some((
        (rank + world_size - 1) % world_size,
        (rank + 1) % world_size,
    ))
}

/// All distinct neighbour ranks (tree parent, tree children, ring prev/next),
/// in ascending order.
pub(crate) fn neighbour_set(rank: Rank, world_size: u32) -> Vec<Rank> {
    let mut set = BTreeSet::new();
    if let Some(p) = tree_parent(rank) {
        set.insert(p);
    }
    for c in tree_children(rank, world_size) {
        set.insert(c);
    }
    if let Some((prev, next)) = ring_neighbours(rank, world_size) {
        set.insert(prev);
        set.insert(next);
    }
    set.remove(&rank);
    set.into_iter().collect()
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Assemble an engine around pre-connected links, bypassing the tracker.
    pub(crate) async fn engine_with_links(
        rank: Rank,
        world_size: u32,
        links: Vec<Link>,
        parent_index: Option<usize>,
        children: Vec<usize>,
    ) -> BaseEngine {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let listen_addr = listener.local_addr().unwrap().to_string();
        let tree_links: Vec<usize> = parent_index
            .into_iter()
            .chain(children.iter().copied())
            .collect();
        BaseEngine {
            rank,
            world_size,
            links,
            parent_index,
            children,
            tree_links,
            epoch: 1,
            listener,
            listen_addr,
            assigned_rank: Some(rank),
            cfg: TenaxConfig::default(),
        }
    }
}
