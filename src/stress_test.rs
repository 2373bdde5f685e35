use async_stream::stream;
use futures::stream::Stream;
use futures::stream::StreamExt;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tessera_core::{DocId, FieldValue, Fields};
use tessera_db::{CollectionDescription, DocumentStore, FieldKind};
use tessera_sync::{MemoryNetwork, PeerId, SyncConfig, SyncEngine};
use tracing::{debug, info, warn};

/// Statistics collected during a convergence run
#[derive(Clone, Debug)]
pub struct StressTestStats {
    pub num_replicas: usize,
    pub num_documents: usize,
    pub writes: usize,
    pub failed_writes: usize,
    pub sync_rounds: usize,
    pub blocks_merged: usize,
    pub total_time: Duration,
    pub converged: bool,
}

impl StressTestStats {
    pub fn print(&self) {
        println!("\n╔════════════════════════════════════════════════════════════╗");
        println!("║              Convergence Statistics                        ║");
        println!("╠════════════════════════════════════════════════════════════╣");
        println!("║  Number of Replicas:        {:>30} ║", self.num_replicas);
        println!("║  Documents:                 {:>30} ║", self.num_documents);
        println!("║  Writes:                    {:>30} ║", self.writes);
        println!("║  Failed Writes:             {:>30} ║", self.failed_writes);
        println!("║  Targeted Sync Rounds:      {:>30} ║", self.sync_rounds);
        println!("║  Blocks Merged by Sync:     {:>30} ║", self.blocks_merged);
        println!("║  Total Time:                {:>29}s ║", format!("{:.3}", self.total_time.as_secs_f64()));
        println!("║  Converged:                 {:>30} ║", self.converged);
        println!("╚════════════════════════════════════════════════════════════╝");
    }
}

fn users() -> CollectionDescription {
    CollectionDescription::new("Users")
        .with_field("name", FieldKind::Register)
        .with_field("visits", FieldKind::Counter)
}

/// Generator that yields (replica, document, is_increment) write targets
fn write_generator(num_replicas: usize, num_docs: usize, num_writes: usize, seed: u64) -> impl Stream<Item = (usize, usize, bool)> {
    stream! {
        let mut rng = StdRng::seed_from_u64(seed);
        for _ in 0..num_writes {
            yield (rng.gen_range(0..num_replicas), rng.gen_range(0..num_docs), rng.gen_bool(0.3));
        }
    }
}

/// Start `num_replicas` engines on one in-memory network, all subscribed to
/// `Users` and connected in a full mesh.
async fn start_replicas(network: &MemoryNetwork, num_replicas: usize) -> Vec<SyncEngine> {
    let mut engines = Vec::with_capacity(num_replicas);
    for idx in 0..num_replicas {
        let db = DocumentStore::in_memory();
        if let Err(e) = db.create_collection(users()) {
            warn!(replica = idx, error = %e, "failed to create collection");
        }
        let transport = network.transport(PeerId::new(format!("replica-{}", idx)));
        match SyncEngine::start(Arc::new(db), transport, SyncConfig::default()) {
            Ok(engine) => engines.push(engine),
            Err(e) => warn!(replica = idx, error = %e, "failed to start engine"),
        }
    }

    for engine in &engines {
        if let Err(e) = engine.add_p2p_collections(&["Users"]).await {
            warn!(peer = %engine.local_peer(), error = %e, "failed to subscribe");
        }
    }
    for (i, engine) in engines.iter().enumerate() {
        for other in &engines[i + 1..] {
            if let Err(e) = engine.connect_peer(other.local_peer()).await {
                warn!(peer = %other.local_peer(), error = %e, "failed to connect");
            }
        }
    }
    engines
}

/// Whether every replica holds identical heads and values for every document.
fn converged(engines: &[SyncEngine], docs: &[DocId]) -> bool {
    docs.iter().all(|doc_id| {
        let views: Vec<_> = engines
            .iter()
            .map(|e| {
                let heads = e.db().heads(doc_id).ok();
                let value = e.db().get("Users", doc_id).ok().map(|d| d.to_json());
                (heads, value)
            })
            .collect();
        views.windows(2).all(|w| w[0] == w[1]) && views.iter().all(|(h, v)| h.is_some() && v.is_some())
    })
}

/// Random concurrent writes on every replica, then targeted sync until the
/// replicas agree.
pub async fn stress_test_convergence(num_replicas: usize, num_docs: usize, num_writes: usize, seed: u64) -> StressTestStats {
    println!("\n╔════════════════════════════════════════════════════════════╗");
    println!("║        Convergence Test                                    ║");
    println!("║  Replicas: {} | Documents: {} | Writes: {} ║", num_replicas, num_docs, num_writes);
    println!("╚════════════════════════════════════════════════════════════╝");

    let start = Instant::now();
    let network = MemoryNetwork::new();
    let engines = start_replicas(&network, num_replicas).await;
    let mut rng = StdRng::seed_from_u64(seed);

    println!("\n[Phase 1/3] Creating documents...");
    let mut docs = Vec::with_capacity(num_docs);
    for i in 0..num_docs {
        let Some(owner) = engines.choose(&mut rng) else {
            break;
        };
        let mut fields = Fields::new();
        fields.insert("name".to_string(), FieldValue::from(format!("user-{}", i)));
        match owner.db().create("Users", fields) {
            Ok(doc_id) => docs.push(doc_id),
            Err(e) => warn!(error = %e, "create failed"),
        }
    }
    let mut sync_rounds = 0;
    let mut blocks_merged = 0;
    for engine in &engines {
        sync_rounds += 1;
        match engine.sync_documents("Users", &docs, None).await {
            Ok(report) => blocks_merged += report.merged,
            Err(e) => warn!(peer = %engine.local_peer(), error = %e, "initial sync failed"),
        }
    }
    println!("[Phase 1/3] ✓ Completed");

    println!("[Phase 2/3] Writing concurrently...");
    let mut writes = 0;
    let mut failed_writes = 0;
    let mut targets = Box::pin(write_generator(engines.len().max(1), docs.len().max(1), num_writes, seed));
    while let Some((replica, doc, increment)) = targets.next().await {
        let (Some(engine), Some(doc_id)) = (engines.get(replica), docs.get(doc)) else {
            break;
        };
        let db = engine.db();
        let result = if increment {
            db.increment("Users", doc_id, "visits", 1)
        } else {
            db.set("Users", doc_id, "name", format!("replica-{}-{}", replica, writes).into())
        };
        match result {
            Ok(_) => writes += 1,
            Err(e) => {
                debug!(replica, error = %e, "write rejected");
                failed_writes += 1;
            }
        }
        if writes % 50 == 0 {
            tokio::task::yield_now().await;
        }
    }
    println!("[Phase 2/3] ✓ Completed");

    println!("[Phase 3/3] Synchronizing replicas...");
    let mut order: Vec<usize> = (0..engines.len()).collect();
    let mut is_converged = converged(&engines, &docs);
    for _ in 0..8 {
        if is_converged {
            break;
        }
        order.shuffle(&mut rng);
        for &idx in &order {
            sync_rounds += 1;
            match engines[idx].sync_documents("Users", &docs, None).await {
                Ok(report) => blocks_merged += report.merged,
                Err(e) => warn!(peer = %engines[idx].local_peer(), error = %e, "sync failed"),
            }
        }
        is_converged = converged(&engines, &docs);
    }
    println!("[Phase 3/3] ✓ Completed");

    info!(converged = is_converged, blocks_merged, "convergence run finished");
    for engine in engines {
        engine.shutdown().await;
    }

    StressTestStats {
        num_replicas,
        num_documents: docs.len(),
        writes,
        failed_writes,
        sync_rounds,
        blocks_merged,
        total_time: start.elapsed(),
        converged: is_converged,
    }
}

/// Scaling analysis for convergence time
pub async fn stress_test_scaling(max_replicas: usize, step: usize) {
    println!("\nReplicas | Time (ms) | Sync Rounds | Converged");
    println!("---------|-----------|-------------|----------");

    for num_replicas in (step..=max_replicas).step_by(step.max(1)) {
        let stats = stress_test_convergence(num_replicas, 10, 100, num_replicas as u64).await;
        println!(
            "{:>8} | {:>9} | {:>11} | {:>9}",
            num_replicas,
            stats.total_time.as_millis(),
            stats.sync_rounds,
            stats.converged
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_small_cluster_converges() {
        let stats = stress_test_convergence(3, 4, 60, 7).await;
        assert!(stats.converged);
        assert_eq!(stats.num_documents, 4);
        assert_eq!(stats.failed_writes, 0);
    }
}
