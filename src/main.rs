use stress_test::{stress_test_convergence, stress_test_scaling};
use tracing_subscriber::EnvFilter;
pub mod stress_test;

fn main() -> std::io::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async_main());
    Ok(())
}

async fn async_main() {
    println!("\n\n╔════════════════════════════════════════════════════════════╗");
    println!("║            REPLICA CONVERGENCE RUNS                        ║");
    println!("╚════════════════════════════════════════════════════════════╝");

    // Run 1: small cluster, few documents, heavy contention
    let stats = stress_test_convergence(3, 5, 200, 1).await;
    stats.print();

    // Run 2: medium cluster
    let stats = stress_test_convergence(6, 25, 1000, 2).await;
    stats.print();

    // Run 3: scaling analysis
    println!("\n\n╔════════════════════════════════════════════════════════════╗");
    println!("║          SCALING ANALYSIS                                  ║");
    println!("╚════════════════════════════════════════════════════════════╝");
    stress_test_scaling(10, 2).await;

    println!("\n✓ All convergence runs completed");
}
