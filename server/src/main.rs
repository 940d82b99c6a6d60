use clap::Parser;
use server::auth::LocalIssuer;
use server::gateway::NoopStore;
use server::network::{RaceServer, ServerConfig};
use server::race::RaceSpec;
use shared::{Checkpoint, RaceSettings, Route};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

/// Parses command-line arguments, starts the race coordinator and runs it
/// until Ctrl+C.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Command line arguments
    #[derive(Parser, Debug)]
    #[clap(author, version, about)]
    struct Args {
        /// Server IP address to bind to
        #[clap(short = 'H', long, default_value = "127.0.0.1")]
        host: String,
        /// Server port to listen on
        #[clap(short, long, default_value = "8080")]
        port: u16,
        /// Lifecycle scheduler tick interval in milliseconds
        #[clap(long, default_value = "1000")]
        tick_interval_ms: u64,
        /// Delay between race creation and scheduled start, in seconds
        #[clap(long, default_value = "30")]
        start_delay_secs: u64,
        /// How long finished races stay queryable, in seconds
        #[clap(long, default_value = "60")]
        retention_secs: u64,
        /// Create a sample race on startup (local development)
        #[clap(long)]
        demo: bool,
    }

    env_logger::init();
    let args = Args::parse();

    let config = ServerConfig {
        start_delay_ms: args.start_delay_secs * 1_000,
        retention_ms: args.retention_secs * 1_000,
        tick_interval: Duration::from_millis(args.tick_interval_ms),
    };

    let server = RaceServer::new(Arc::new(LocalIssuer), Arc::new(NoopStore), config);

    if args.demo {
        let spec = RaceSpec {
            name: "Demo circuit".to_string(),
            route: Route {
                checkpoints: vec![
                    Checkpoint {
                        latitude: 45.0703,
                        longitude: 7.6869,
                        radius_m: 50.0,
                    },
                    Checkpoint {
                        latitude: 45.0750,
                        longitude: 7.6900,
                        radius_m: 50.0,
                    },
                ],
                total_distance_m: 2_500.0,
                laps: 3,
            },
            settings: RaceSettings::default(),
        };
        let race_id = server.create_race("demo-host", spec).await;
        println!("Demo race created: {}", race_id);
    }

    let address = format!("{}:{}", args.host, args.port);
    let listener = TcpListener::bind(&address).await?;

    // Run until the process is interrupted, then close connections cleanly
    tokio::select! {
        result = server.serve(listener) => {
            if let Err(e) = result {
                eprintln!("Coordinator stopped with error: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            println!("Received Ctrl+C, shutting down gracefully...");
            server.shutdown().await;
        }
    }

    Ok(())
}
