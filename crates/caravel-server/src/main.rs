use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;

use caravel_server::config::NodeConfig;
use caravel_server::handlers;
use caravel_server::state::AppState;

#[derive(Parser)]
#[command(name = "caravel-server", version, about = "caravel transfer node")]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, default_value = "caravel.toml")]
    config: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config_str = std::fs::read_to_string(&cli.config).unwrap_or_else(|e| {
        eprintln!("Error: cannot read config file '{}': {e}", cli.config);
        std::process::exit(1);
    });
    let config: NodeConfig = toml::from_str(&config_str).unwrap_or_else(|e| {
        eprintln!("Error: invalid config file '{}': {e}", cli.config);
        std::process::exit(1);
    });

    match config.server.log_format.as_str() {
        "json" => {
            tracing_subscriber::fmt().json().init();
        }
        _ => {
            tracing_subscriber::fmt().init();
        }
    }

    if config.archive.url.is_none() {
        tracing::warn!(
            "no [archive] url configured; running on a private in-memory archive \
             (only suitable for testing)"
        );
    }

    let listen_addr = config.server.listen.clone();
    let state = AppState::from_config(&config).unwrap_or_else(|e| {
        eprintln!("Error: invalid transfer configuration: {e}");
        std::process::exit(1);
    });

    let app = handlers::router(state);

    info!("caravel-server listening on {listen_addr}");
    let listener = TcpListener::bind(&listen_addr).await.unwrap_or_else(|e| {
        eprintln!("Error: cannot bind to {listen_addr}: {e}");
        std::process::exit(1);
    });

    axum::serve(listener, app).await.unwrap_or_else(|e| {
        eprintln!("Error: server terminated: {e}");
        std::process::exit(1);
    });
}
