//! Default tracing subscriber for binaries and demos

/// Install an env-filtered fmt subscriber unless one is already set.
///
/// Applications with their own subscriber can skip this entirely; pool events
/// are plain `tracing` records.
pub fn init_tracing() {
    if tracing::dispatcher::has_been_set() {
        return;
    }
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .try_init();
}
