//! Minimal training loop: four workers reduce "gradients" each round and
//! checkpoint at the end of every epoch.
//!
//! ```bash
//! cargo run --example train
//! ```

use tenax::{DataType, OpReducer, ReduceOp, TenaxConfig, TenaxEngine, Tracker};

const WORLD: u32 = 4;
const ROUNDS: u32 = 3;

#[tokio::main]
async fn main() -> tenax::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tenax=info".into()),
        )
        .init();

    let tracker = Tracker::bind("127.0.0.1:0", WORLD).await?;
    let tracker_addr = tracker.local_addr()?.to_string();
    let tracker_task = tokio::spawn(tracker.run());

    let mut workers = Vec::new();
    for _ in 0..WORLD {
        let addr = tracker_addr.clone();
        workers.push(tokio::spawn(async move {
            let mut engine = TenaxEngine::init(TenaxConfig::for_tracker(addr)).await?;
            let rank = engine.rank();
            let sum = OpReducer::new(DataType::F32, ReduceOp::Sum);

            let mut model = vec![0f32; 8];
            for round in 0..ROUNDS {
                // Every rank contributes its own "gradient"; after the
                // reduction all ranks hold the same update.
                let grads = vec![(rank as f32 + 1.0) * 0.1; 8];
                let mut buf: Vec<u8> = grads.iter().flat_map(|g| g.to_le_bytes()).collect();
                engine.allreduce(&mut buf, 4, 8, &sum).await?;
                for (m, chunk) in model.iter_mut().zip(buf.chunks_exact(4)) {
                    *m += f32::from_le_bytes(chunk.try_into().unwrap()) / WORLD as f32;
                }
                tracing::info!(rank, round, first = model[0], "applied update");
            }

            let snapshot: Vec<u8> = model.iter().flat_map(|m| m.to_le_bytes()).collect();
            engine.checkpoint(&snapshot).await?;
            tracing::info!(rank, version = engine.version_number(), "checkpointed");
            engine.shutdown().await?;
            Ok::<_, tenax::TenaxError>(model[0])
        }));
    }

    for worker in workers {
        let first = worker.await.expect("worker task panicked")?;
        // sum of (r+1)*0.1 over 4 ranks = 1.0 per round, averaged over 4.
        assert!((first - ROUNDS as f32 * 0.25).abs() < 1e-5);
    }
    tracker_task.await.expect("tracker task panicked")?;
    println!("all {WORLD} workers agree after {ROUNDS} rounds");
    Ok(())
}
