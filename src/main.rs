use proctor_link::api::{self, RelayHub};
use proctor_link::config::Config;
use proctor_link::logging;

#[tokio::main]
async fn main() {
    // Logging first so config parse warnings are visible
    dotenv::dotenv().ok();
    logging::init("info");
    let config = Config::from_env();

    let hub = RelayHub::new();
    let routes = api::routes(hub, config.recording.output_dir.clone());

    let (host, port) = config.bind_address();
    tracing::info!(
        host = ?host,
        port,
        output_dir = %config.recording.output_dir,
        "Starting proctor relay"
    );

    warp::serve(routes).run((host, port)).await;
}
