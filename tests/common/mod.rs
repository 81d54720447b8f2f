#![allow(dead_code)]

//! Shared helpers for the cluster integration tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use tenax::{Reducer, Result, TenaxConfig, TenaxEngine, Tracker};
use tokio::task::JoinHandle;

/// Start a tracker for `world_size` workers on an ephemeral port.
pub async fn start_tracker(world_size: u32) -> (String, JoinHandle<Result<()>>) {
    let tracker = Tracker::bind("127.0.0.1:0", world_size).await.unwrap();
    let addr = tracker.local_addr().unwrap().to_string();
    (addr, tokio::spawn(tracker.run()))
}

/// Bring up `world_size` workers concurrently, returned in rank order.
pub async fn spawn_cluster(tracker: &str, world_size: u32) -> Vec<TenaxEngine> {
    let mut handles = Vec::new();
    for _ in 0..world_size {
        let addr = tracker.to_string();
        handles.push(tokio::spawn(async move {
            TenaxEngine::init(TenaxConfig::for_tracker(addr)).await.unwrap()
        }));
    }
    let mut engines = Vec::new();
    for h in handles {
        engines.push(h.await.unwrap());
    }
    engines.sort_by_key(|e| e.rank());
    engines
}

/// Join a single (restarted) worker into an existing cluster.
pub async fn join_worker(tracker: &str) -> TenaxEngine {
    TenaxEngine::init(TenaxConfig::for_tracker(tracker.to_string()))
        .await
        .unwrap()
}

/// u32 sum reducer that counts how many times the fold actually ran, so a
/// test can prove a round was served from cache instead of re-executed.
pub struct CountingSum {
    calls: AtomicUsize,
}

impl CountingSum {
    pub fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }
}

impl Reducer for CountingSum {
    fn reduce(&self, src: &[u8], dst: &mut [u8], type_nbytes: usize, _count: usize) {
        assert_eq!(type_nbytes, 4);
        self.calls.fetch_add(1, Ordering::Relaxed);
        for (d, s) in dst.chunks_exact_mut(4).zip(src.chunks_exact(4)) {
            let a = u32::from_le_bytes((&*d).try_into().unwrap());
            let b = u32::from_le_bytes(s.try_into().unwrap());
            d.copy_from_slice(&a.wrapping_add(b).to_le_bytes());
        }
    }
}

pub fn u32s(vals: &[u32]) -> Vec<u8> {
    vals.iter().flat_map(|v| v.to_le_bytes()).collect()
}

pub fn from_u32s(bytes: &[u8]) -> Vec<u32> {
    bytes
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
        .collect()
}
