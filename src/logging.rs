use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "docfiler=info";

fn filter_for(verbose: bool) -> EnvFilter {
    if verbose {
        return EnvFilter::new("docfiler=debug");
    }
    EnvFilter::try_from_env("DOCFILER_LOG").unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Install the stderr subscriber. Safe to call more than once.
pub fn init(verbose: bool) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter_for(verbose))
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}
