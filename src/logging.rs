use tracing_subscriber::EnvFilter;

/// Install the global subscriber. `RUST_LOG` overrides `default_filter`;
/// `LOG_FORMAT=json` switches to JSON lines.
pub fn init(default_filter: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let json = std::env::var("LOG_FORMAT")
        .map(|format| format.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let result = if json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .try_init()
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).try_init()
    };

    if let Err(err) = result {
        eprintln!("failed to initialize tracing: {}", err);
    }
}
