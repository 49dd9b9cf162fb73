use tracing_subscriber::EnvFilter;

/// Install the process-wide subscriber. `filter` overrides the usual
/// `RUST_LOG`-style environment configuration.
pub fn setup(filter: Option<&str>) {
	let env_filter = match filter {
		Some(f) => EnvFilter::new(f),
		None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
	};
	tracing_subscriber::fmt()
		.with_env_filter(env_filter)
		.with_target(true)
		.init();
}

/// Subscriber for tests; safe to call repeatedly.
pub fn testing() {
	let _ = tracing_subscriber::fmt()
		.with_env_filter(EnvFilter::new("debug"))
		.with_test_writer()
		.try_init();
}
