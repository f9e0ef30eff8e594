pub mod config;
pub mod labels;
pub mod preprocess;
pub mod server;
pub mod torch;

/// Process setup shared by the binaries
pub mod util {
    use tracing_subscriber::EnvFilter;

    /// Install the global tracing subscriber. `RUST_LOG` overrides the
    /// default filter. Records from the `log` crate (actix's `Logger`) are
    /// forwarded too
    pub fn init_tracing() {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(super::config::RUST_LOG));
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}
