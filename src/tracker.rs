//! Rendezvous tracker for cluster formation and post-failure reconnection.
//!
//! The tracker never touches collective data. It collects one `Join` per
//! worker, assigns ranks, and hands every worker the full peer table for the
//! new topology epoch. Every reconnection round after a failure repeats the
//! same rendezvous, so restarted workers and survivors meet here.

use crate::error::{Result, TenaxError};
use crate::protocol::{TrackerMessage, recv_frame, send_frame};
use crate::types::{PROTOCOL_VERSION, Rank};
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};

struct PendingWorker {
    stream: TcpStream,
    listen_addr: String,
    prev_rank: Option<Rank>,
}

/// The rendezvous coordinator. One per cluster.
pub struct Tracker {
    listener: TcpListener,
    world_size: u32,
}

impl Tracker {
    /// Bind the tracker to the given address.
    pub async fn bind(addr: &str, world_size: u32) -> Result<Self> {
        assert!(world_size > 0, "world size must be positive");
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            world_size,
        })
    }

    /// The address workers should put in `TenaxConfig::tracker_addr`.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve rendezvous rounds until every rank has announced shutdown.
    pub async fn run(self) -> Result<()> {
        let mut epoch: u32 = 0;
        let mut shut_down: u32 = 0;
        let mut pending: Vec<PendingWorker> = Vec::new();

        loop {
            let (mut stream, from) = self.listener.accept().await?;
            match recv_frame(&mut stream).await {
                Ok(TrackerMessage::Join {
                    protocol_version,
                    listen_addr,
                    prev_rank,
                }) => {
                    if protocol_version != PROTOCOL_VERSION {
                        tracing::warn!(
                            %from,
                            remote = protocol_version,
                            local = PROTOCOL_VERSION,
                            "rejecting join with mismatched protocol version"
                        );
                        continue;
                    }
                    tracing::debug!(%from, ?prev_rank, listen_addr, "worker joined");
                    pending.push(PendingWorker {
                        stream,
                        listen_addr,
                        prev_rank,
                    });
                    if pending.len() as u32 == self.world_size {
                        epoch += 1;
                        self.release_round(&mut pending, epoch).await?;
                    }
                }
                Ok(TrackerMessage::Shutdown { rank }) => {
                    shut_down += 1;
                    tracing::debug!(rank, shut_down, "worker shut down");
                    if shut_down == self.world_size {
                        return Ok(());
                    }
                }
                Ok(other) => {
                    tracing::warn!(%from, "unexpected tracker message: {other:?}");
                }
                Err(e) => {
                    tracing::warn!(%from, error = %e, "dropped connection before join");
                }
            }
        }
    }

    /// Assign ranks to the pending workers and send each its `Assign`.
    async fn release_round(&self, pending: &mut Vec<PendingWorker>, epoch: u32) -> Result<()> {
        let hints: Vec<Option<Rank>> = pending.iter().map(|w| w.prev_rank).collect();
        let ranks = assign_ranks(&hints, self.world_size)?;

        let mut peers: Vec<(Rank, String)> = ranks
            .iter()
            .zip(pending.iter())
            .map(|(&r, w)| (r, w.listen_addr.clone()))
            .collect();
        peers.sort_by_key(|(r, _)| *r);

        tracing::info!(epoch, world_size = self.world_size, "releasing topology");
        for (worker, rank) in pending.iter_mut().zip(ranks) {
            let assign = TrackerMessage::Assign {
                rank,
                world_size: self.world_size,
                epoch,
                peers: peers.clone(),
            };
            if let Err(e) = send_frame(&mut worker.stream, &assign).await {
                // The worker will fail its mesh build and re-join.
                tracing::warn!(rank, error = %e, "failed to deliver assignment");
            }
        }
        pending.clear();
        Ok(())
    }
}

/// Compute the rank of each pending worker. Hints from survivors are
/// honoured; hint-less (restarted) workers fill the free ranks in order.
fn assign_ranks(hints: &[Option<Rank>], world_size: u32) -> Result<Vec<Rank>> {
    let mut taken = vec![false; world_size as usize];
    for hint in hints.iter().flatten() {
        let idx = *hint as usize;
        if idx >= world_size as usize || taken[idx] {
            return Err(TenaxError::Tracker(format!(
                "conflicting rank hint {hint} in rendezvous round"
            )));
        }
        taken[idx] = true;
    }
    let mut free = (0..world_size).filter(|&r| !taken[r as usize]);
    hints
        .iter()
        .map(|hint| match hint {
            Some(r) => Ok(*r),
            None => free
                .next()
                .ok_or_else(|| TenaxError::Tracker("more workers than ranks".into())),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assign_honours_hints() {
        let ranks = assign_ranks(&[Some(3), Some(0), None, Some(1)], 4).unwrap();
        assert_eq!(ranks, vec![3, 0, 2, 1]);
    }

    #[test]
    fn test_assign_fills_free_ranks_in_order() {
        let ranks = assign_ranks(&[None, None, None], 3).unwrap();
        assert_eq!(ranks, vec![0, 1, 2]);
    }

    #[test]
    fn test_assign_rejects_duplicate_hint() {
        assert!(assign_ranks(&[Some(1), Some(1)], 2).is_err());
    }

    #[test]
    fn test_assign_rejects_out_of_range_hint() {
        assert!(assign_ranks(&[Some(5)], 2).is_err());
    }

    #[tokio::test]
    async fn test_rendezvous_round_assigns_all() {
        let tracker = Tracker::bind("127.0.0.1:0", 3).await.unwrap();
        let addr = tracker.local_addr().unwrap();
        let tracker_task = tokio::spawn(tracker.run());

        let mut assigns = Vec::new();
        let mut joins = Vec::new();
        for i in 0..3u32 {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            send_frame(
                &mut stream,
                &TrackerMessage::Join {
                    protocol_version: PROTOCOL_VERSION,
                    listen_addr: format!("127.0.0.1:{}", 6000 + i),
                    prev_rank: None,
                },
            )
            .await
            .unwrap();
            joins.push(stream);
        }
        for stream in &mut joins {
            assigns.push(recv_frame(stream).await.unwrap());
        }

        let mut ranks = Vec::new();
        for msg in assigns {
            match msg {
                TrackerMessage::Assign {
                    rank,
                    world_size,
                    epoch,
                    peers,
                } => {
                    assert_eq!(world_size, 3);
                    assert_eq!(epoch, 1);
                    assert_eq!(peers.len(), 3);
                    ranks.push(rank);
                }
                other => panic!("expected Assign, got {other:?}"),
            }
        }
        ranks.sort();
        assert_eq!(ranks, vec![0, 1, 2]);

        // All ranks shut down; run() should return.
        for rank in 0..3 {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            send_frame(&mut stream, &TrackerMessage::Shutdown { rank })
                .await
                .unwrap();
        }
        tracker_task.await.unwrap().unwrap();
    }
}
