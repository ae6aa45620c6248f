use {
    std::time::Duration,
    tracing::Level,
    tracing_subscriber::FmtSubscriber,
    clap::Parser,
    visits_client::{CounterClient, display_text},
};

/// Fetches the visit counter and prints what a page would display.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    endpoint: String,

    /// Request timeout, 5 seconds when not set.
    #[arg(long)]
    timeout_ms: Option<u64>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    FmtSubscriber::builder().with_max_level(Level::WARN).with_writer(std::io::stderr).init();
    let args = Args::parse();

    let client = match args.timeout_ms {
        Some(timeout_ms) => CounterClient::with_timeout(args.endpoint, Duration::from_millis(timeout_ms)),
        None => CounterClient::new(args.endpoint),
    };

    let text = match client {
        Ok(client) => client.display_text().await,
        Err(err) => display_text(Err(err)),
    };
    println!("{text}");
}
