//! Backend client pool: concurrency, waiting, maintenance and metrics

use esox_resourcepool::{
    BoxError, HandleFactory, PoolConfiguration, PoolError, ResourcePool, init_tracing,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

#[derive(Debug)]
struct BackendClient {
    id: usize,
    endpoint: String,
}

impl BackendClient {
    async fn query(&self, key: &str) -> Result<String, BoxError> {
        tokio::time::sleep(Duration::from_millis(20)).await;
        Ok(format!("{}#{} -> {key}", self.endpoint, self.id))
    }
}

struct BackendFactory {
    endpoint: String,
    opened: AtomicUsize,
}

#[async_trait]
impl HandleFactory<BackendClient> for BackendFactory {
    async fn create(&self) -> Result<BackendClient, BoxError> {
        tokio::time::sleep(Duration::from_millis(5)).await;
        Ok(BackendClient {
            id: self.opened.fetch_add(1, Ordering::SeqCst),
            endpoint: self.endpoint.clone(),
        })
    }
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    init_tracing();
    println!("=== Esox ResourcePool - Backend Clients ===\n");

    let factory = BackendFactory {
        endpoint: "db.internal:5432".to_string(),
        opened: AtomicUsize::new(0),
    };
    let probe = |client: Arc<BackendClient>| async move { client.query("ping").await.map(|_| ()) };

    let config = PoolConfiguration::new()
        .with_min_capacity(2)
        .with_max_capacity(4)
        .with_acquire_timeout(Duration::from_secs(2))
        .with_idle_timeout(Duration::from_secs(30))
        .with_maintenance_interval(Duration::from_secs(5));
    let pool = ResourcePool::launch(factory, probe, config).await?;

    concurrent_queries(&pool).await;
    saturation(&pool).await?;
    maintenance(&pool).await;
    report(&pool);

    pool.shutdown().await;
    println!("\nPool shut down");
    Ok(())
}

async fn concurrent_queries(pool: &ResourcePool<BackendClient>) {
    println!("1. Concurrent queries:");

    let mut tasks = Vec::new();
    for i in 0..10 {
        let pool = pool.clone();
        tasks.push(tokio::spawn(async move {
            pool.execute_default(|client| async move { client.query(&format!("user:{i}")).await })
                .await
        }));
    }
    for task in tasks {
        match task.await {
            Ok(Ok(row)) => println!("   {row}"),
            Ok(Err(err)) => println!("   query failed: {err}"),
            Err(err) => println!("   task panicked: {err}"),
        }
    }
    println!("   Live handles: {}\n", pool.size());
}

async fn saturation(pool: &ResourcePool<BackendClient>) -> Result<(), PoolError> {
    println!("2. Saturation and timeouts:");

    let mut held = Vec::new();
    while held.len() < pool.config().max_capacity {
        held.push(pool.acquire(Duration::from_millis(100)).await?);
    }
    match pool.acquire(Duration::from_millis(50)).await {
        Err(PoolError::AcquireTimeout(waited)) => println!("   Timed out after {waited:?}"),
        Ok(handle) => println!("   Unexpected handle {}", handle.id()),
        Err(err) => println!("   Unexpected error: {err}"),
    }

    let waiter = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.acquire(Duration::from_secs(1)).await.map(|h| h.id()) })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    let released = held.pop().map(|h| h.id());
    drop(held);
    println!("   Released {released:?}, waiter got {:?}\n", waiter.await.ok());
    Ok(())
}

async fn maintenance(pool: &ResourcePool<BackendClient>) {
    println!("3. Maintenance pass:");
    let report = pool.run_maintenance().await;
    println!("   {report:?}\n");
}

fn report(pool: &ResourcePool<BackendClient>) {
    println!("4. Metrics:");
    let metrics = pool.metrics();
    println!("   Created: {}", metrics.total_created);
    println!("   Ops: {} (success rate {:.2})", metrics.total_ops, metrics.success_rate);
    println!("   Average wait: {:.2} ms", metrics.avg_wait_ms);
    println!("   Acquire timeouts: {}", metrics.acquire_timeouts);

    let health = pool.health_status();
    println!("   Healthy: {} ({} warnings)", health.is_healthy(), health.warning_count);
    for warning in &health.warnings {
        println!("     - {warning}");
    }

    let mut tags = HashMap::new();
    tags.insert("service".to_string(), "accounts".to_string());
    match pool.export_metrics_prometheus("backend", Some(&tags)) {
        Ok(text) => println!("\n{text}"),
        Err(err) => println!("   prometheus export failed: {err}"),
    }
}
