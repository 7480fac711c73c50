//! Retrying execution against a flaky backend, with circuit breaker

use esox_resourcepool::{
    AlwaysHealthy, BoxError, CircuitBreakerState, PoolConfiguration, PoolError, ResourcePool,
    init_tracing,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    init_tracing();
    println!("=== Esox ResourcePool - Retry & Circuit Breaker ===\n");

    let config = PoolConfiguration::new()
        .with_min_capacity(1)
        .with_max_capacity(2)
        .with_retries(3, Duration::from_millis(50))
        .with_retry_max_delay(Duration::from_millis(400))
        .with_circuit_breaker(2, Duration::from_millis(500));
    let pool = ResourcePool::new(|| async { Ok::<_, BoxError>(()) }, AlwaysHealthy, config)?;
    pool.warmup().await?;

    println!("1. Transient failures:");
    let calls = Arc::new(AtomicU32::new(0));
    let result = {
        let calls = Arc::clone(&calls);
        pool.execute_default(move |_client| {
            let call = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if call < 2 {
                    Err::<u32, BoxError>(format!("transient failure #{call}").into())
                } else {
                    Ok(call)
                }
            }
        })
        .await
    };
    println!("   Result: {result:?} after {} calls", calls.load(Ordering::SeqCst));

    let metrics = pool.metrics();
    println!(
        "   Ops: {}, failed: {}, retried attempts: {}\n",
        metrics.total_ops, metrics.failed_ops, metrics.retried_attempts
    );

    println!("2. Persistent failure trips the breaker:");
    for round in 0..3 {
        let outcome: Result<(), PoolError> = pool
            .execute(|_client| async { Err::<(), BoxError>("backend down".into()) }, 1)
            .await;
        println!("   Round {round}: {}", outcome.err().map(|e| e.to_string()).unwrap_or_default());
    }
    if let Some(breaker) = pool.circuit_breaker() {
        println!("   Breaker state: {:?}", breaker.state());
    }

    tokio::time::sleep(Duration::from_millis(600)).await;
    let recovered = pool
        .execute(|_client| async { Ok::<_, BoxError>("recovered") }, 0)
        .await;
    println!("   After reset timeout: {recovered:?}");
    if let Some(breaker) = pool.circuit_breaker() {
        assert_ne!(breaker.state(), CircuitBreakerState::Open);
    }

    pool.shutdown().await;
    Ok(())
}
