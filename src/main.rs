// Esox ResourcePool demo binary
// Run the fuller demos with: cargo run --example backend_pool

use esox_resourcepool::{AlwaysHealthy, BoxError, PoolConfiguration, ResourcePool, init_tracing};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    init_tracing();

    println!("=== Esox ResourcePool ===");
    println!("Run: cargo run --example backend_pool");
    println!();

    let connections = Arc::new(AtomicU32::new(0));
    let factory = {
        let connections = Arc::clone(&connections);
        move || {
            let n = connections.fetch_add(1, Ordering::SeqCst);
            async move { Ok::<_, BoxError>(format!("conn-{n}")) }
        }
    };

    let pool = ResourcePool::launch(
        factory,
        AlwaysHealthy,
        PoolConfiguration::new()
            .with_min_capacity(2)
            .with_max_capacity(4),
    )
    .await?;

    {
        let conn = pool.acquire(Duration::from_secs(1)).await?;
        println!("  Got {} ({})", *conn, conn.id());
    }

    let health = pool.health_status();
    println!("  Idle after return: {}", health.idle_handles);
    println!("  Healthy: {}", health.is_healthy());

    pool.shutdown().await;
    println!("  Connections opened: {}", connections.load(Ordering::SeqCst));
    Ok(())
}
