//! Fault injection: killed and restarted workers rejoin mid-training and
//! the survivors feed them everything they missed.

mod common;

use common::*;
use std::sync::Arc;

fn round_input(rank: u32, round: u32) -> Vec<u32> {
    vec![round * 10 + rank + 1; 4]
}

/// Sum over four ranks of `round * 10 + r + 1` = `40 * round + 10`.
fn round_expected(round: u32) -> Vec<u32> {
    vec![round * 40 + 10; 4]
}

#[tokio::test]
async fn late_joiner_is_served_from_cache() {
    let (addr, tracker) = start_tracker(4).await;
    let mut engines = spawn_cluster(&addr, 4).await;
    for engine in &mut engines {
        engine.set_param("result_buffer_round", "2").unwrap();
    }
    let reducers: Vec<Arc<CountingSum>> = (0..4).map(|_| Arc::new(CountingSum::new())).collect();

    // Three clean rounds on the full cluster.
    let mut handles = Vec::new();
    for mut engine in engines {
        let reducer = Arc::clone(&reducers[engine.rank() as usize]);
        handles.push(tokio::spawn(async move {
            for round in 0..3u32 {
                let mut buf = u32s(&round_input(engine.rank(), round));
                engine.allreduce(&mut buf, 4, 4, &*reducer).await.unwrap();
                assert_eq!(from_u32s(&buf), round_expected(round));
            }
            engine
        }));
    }
    let mut engines = Vec::new();
    for h in handles {
        engines.push(h.await.unwrap());
    }
    engines.sort_by_key(|e| e.rank());

    // Kill rank 2: dropping the engine closes its sockets, which the
    // survivors observe as link failures on their next collective.
    let dead = engines.remove(2);
    drop(dead);

    // Survivors press on with rounds 3..6 while a fresh worker rejoins and
    // replays its schedule from round 0.
    let mut handles = Vec::new();
    for mut engine in engines {
        let reducer = Arc::clone(&reducers[engine.rank() as usize]);
        handles.push(tokio::spawn(async move {
            for round in 3..6u32 {
                let mut buf = u32s(&round_input(engine.rank(), round));
                engine.allreduce(&mut buf, 4, 4, &*reducer).await.unwrap();
                assert_eq!(from_u32s(&buf), round_expected(round));
            }
            engine.shutdown().await.unwrap();
        }));
    }
    {
        let addr = addr.clone();
        let reducer = Arc::new(CountingSum::new());
        handles.push(tokio::spawn(async move {
            let mut engine = join_worker(&addr).await;
            assert_eq!(engine.rank(), 2, "tracker hands back the freed rank");
            engine.set_param("result_buffer_round", "2").unwrap();
            for round in 0..6u32 {
                let mut buf = u32s(&round_input(engine.rank(), round));
                engine.allreduce(&mut buf, 4, 4, &*reducer).await.unwrap();
                // Rounds 0..3 come out of the survivors' result caches and
                // are byte-identical to what the dead worker once computed.
                assert_eq!(from_u32s(&buf), round_expected(round));
            }
            engine.shutdown().await.unwrap();
        }));
    }
    for h in handles {
        h.await.unwrap();
    }
    tracker.await.unwrap().unwrap();

    // Rank 0 reduces two child buffers per executed round. Rounds 0..6 each
    // ran exactly once; the catch-up rounds were served from the cache, not
    // re-reduced.
    assert_eq!(reducers[0].calls(), 12);
}

#[tokio::test]
async fn broadcast_cluster_recovers_from_rank_failure() {
    let payload = |round: u32| -> Vec<u8> {
        (0..1 << 20).map(|i| ((i as u32 + round * 7) % 253) as u8).collect()
    };

    let (addr, tracker) = start_tracker(4).await;
    let engines = spawn_cluster(&addr, 4).await;

    // Round 0 on the full cluster.
    let mut handles = Vec::new();
    for mut engine in engines {
        let expect = payload(0);
        handles.push(tokio::spawn(async move {
            let mut buf = if engine.rank() == 0 {
                payload(0)
            } else {
                vec![0u8; 1 << 20]
            };
            engine.broadcast(&mut buf, 0).await.unwrap();
            assert_eq!(buf, expect);
            engine
        }));
    }
    let mut engines = Vec::new();
    for h in handles {
        engines.push(h.await.unwrap());
    }
    engines.sort_by_key(|e| e.rank());

    // Rank 1 dies with three rounds still to go.
    let dead = engines.remove(1);
    drop(dead);

    let mut handles = Vec::new();
    for mut engine in engines {
        handles.push(tokio::spawn(async move {
            for round in 1..4u32 {
                let expect = payload(round);
                let mut buf = if engine.rank() == 0 {
                    expect.clone()
                } else {
                    vec![0u8; 1 << 20]
                };
                engine.broadcast(&mut buf, 0).await.unwrap();
                assert_eq!(buf, expect);
            }
            engine.shutdown().await.unwrap();
        }));
    }
    {
        let addr = addr.clone();
        handles.push(tokio::spawn(async move {
            let mut engine = join_worker(&addr).await;
            assert_eq!(engine.rank(), 1);
            for round in 0..4u32 {
                let expect = payload(round);
                let mut buf = vec![0u8; 1 << 20];
                engine.broadcast(&mut buf, 0).await.unwrap();
                assert_eq!(buf, expect);
            }
            engine.shutdown().await.unwrap();
        }));
    }
    for h in handles {
        h.await.unwrap();
    }
    tracker.await.unwrap().unwrap();
}

#[tokio::test]
async fn recovery_fails_fatally_when_every_holder_is_gone() {
    let (addr, tracker) = start_tracker(3).await;
    let mut engines = spawn_cluster(&addr, 3).await;
    // R = world: each result survives on exactly one worker.
    for engine in &mut engines {
        engine.set_param("result_buffer_round", "3").unwrap();
    }

    // Two rounds: after them, the round-0 result lives only on rank 0.
    let mut handles = Vec::new();
    for mut engine in engines {
        handles.push(tokio::spawn(async move {
            for round in 0..2u32 {
                let mut buf = u32s(&vec![engine.rank() + round; 2]);
                let sum = CountingSum::new();
                engine.allreduce(&mut buf, 4, 2, &sum).await.unwrap();
            }
            engine
        }));
    }
    let mut engines = Vec::new();
    for h in handles {
        engines.push(h.await.unwrap());
    }
    engines.sort_by_key(|e| e.rank());

    // Kill the only keeper of seqno 0 and bring in its replacement, which
    // immediately asks for that lost result.
    let dead = engines.remove(0);
    drop(dead);

    let mut handles = Vec::new();
    for mut engine in engines {
        handles.push(tokio::spawn(async move {
            let mut buf = u32s(&vec![engine.rank() + 2; 2]);
            let sum = CountingSum::new();
            engine.allreduce(&mut buf, 4, 2, &sum).await.unwrap_err()
        }));
    }
    {
        let addr = addr.clone();
        handles.push(tokio::spawn(async move {
            let mut engine = join_worker(&addr).await;
            assert_eq!(engine.rank(), 0);
            engine.set_param("result_buffer_round", "3").unwrap();
            let mut buf = u32s(&vec![engine.rank(); 2]);
            let sum = CountingSum::new();
            engine.allreduce(&mut buf, 4, 2, &sum).await.unwrap_err()
        }));
    }
    for h in handles {
        let err = h.await.unwrap();
        assert!(
            matches!(err, tenax::TenaxError::Unrecoverable),
            "expected the too-many-nodes-down error, got: {err}"
        );
    }
    tracker.abort();
}
