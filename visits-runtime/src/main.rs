// the counter endpoint is public, a request should never be able to crash the process
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::panic)]

use {
    std::{path::PathBuf, process::exit},
    tracing::{Level, info, error},
    tracing_subscriber::FmtSubscriber,
    clap::{Parser, Subcommand},
    visits_runtime::{
        HttpRequest,
        VisitsServer,
        config::{ServerConfig, kv_from_config},
        kv::KVStorage,
    },
};

#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    #[command(subcommand)]
    command: Command,

    #[arg(long)]
    metrics_port: Option<u16>,

    #[arg(long, default_value = "info")]
    log_level: Level,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the counter endpoint over http.
    Serve {
        config_file: String,
    },
    /// Invoke the counter once and print the response body.
    Increment {
        config_file: String,
    },
    /// Print the stored count without changing it.
    Get {
        config_file: String,
    },
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    FmtSubscriber::builder().with_max_level(args.log_level).init();

    run_command(args.command, args.metrics_port).await;
}

async fn run_command(command: Command, metrics_port: Option<u16>) {
    match command {
        Command::Serve { config_file } => {
            let mut config = load_config(&config_file);
            if let Some(port) = metrics_port {
                config = config.with_metrics_port(port);
            }

            let server = match VisitsServer::new(config) {
                Ok(v) => v,
                Err(err) => {
                    error!("failed to create server: {err}");
                    exit(1);
                }
            };

            if let Err(err) = server.serve().await {
                error!("server failed: {err}");
                exit(1);
            }
        },
        Command::Increment { config_file } => {
            let server = match VisitsServer::new(load_config(&config_file)) {
                Ok(v) => v,
                Err(err) => {
                    error!("failed to create server: {err}");
                    exit(1);
                }
            };

            let response = server.counter().handle(HttpRequest::new()).await;
            println!("{}", String::from_utf8_lossy(&response.body).trim_end());
            if !response.is_success() {
                exit(1);
            }
        },
        Command::Get { config_file } => {
            let config = load_config(&config_file);
            let storage = match kv_from_config(&config.kv, config.counter_timeout()) {
                Ok(v) => v,
                Err(err) => {
                    error!("failed to open counter store: {err}");
                    exit(1);
                }
            };

            match storage.get(config.counter_key().as_bytes()) {
                Ok(v) => println!("{}", v.unwrap_or(0)),
                Err(err) => {
                    error!("failed to read counter: {err}");
                    exit(1);
                }
            }
        },
    }
}

fn load_config(config_file: &str) -> ServerConfig {
    let config_path = match std::env::current_dir() {
        Ok(v) => v.join(config_file),
        Err(_) => PathBuf::from(config_file),
    };
    info!("loading config from {config_path:?}");

    match ServerConfig::load(config_path) {
        Ok(v) => v,
        Err(err) => {
            error!("failed to load config: {err}");
            exit(1);
        }
    }
}
