use clap::Parser;
use gantry_broker::Hub;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "gantry-broker", about = "HTTP pub/sub broker for gantry messaging")]
struct Cli {
    /// Address to listen on.
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Port to listen on.
    #[arg(long, default_value_t = 7878)]
    port: u16,

    /// Forget clients that have not polled for this many seconds.
    #[arg(long, default_value_t = gantry_broker::DEFAULT_IDLE_TIMEOUT.as_secs())]
    idle_timeout_secs: u64,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("GANTRY_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let addr = format!("{}:{}", cli.host, cli.port);

    let server = match gantry_broker::bind(&addr) {
        Ok(s) => Arc::new(s),
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };
    let srv = Arc::clone(&server);
    if let Err(e) = ctrlc::set_handler(move || {
        info!("shutting down");
        srv.unblock();
    }) {
        error!("failed to install signal handler: {e}");
        return ExitCode::FAILURE;
    }

    info!("gantry-broker listening on {addr}");
    let idle_timeout =
        Duration::from_secs(cli.idle_timeout_secs).max(2 * gantry_broker::MAX_POLL_WAIT);
    let hub = Arc::new(Hub::new().with_idle_timeout(idle_timeout));
    let sweeper = Arc::clone(&hub);
    if let Err(e) = std::thread::Builder::new()
        .name("gantry-broker-sweeper".to_owned())
        .spawn(move || loop {
            std::thread::sleep(idle_timeout);
            sweeper.evict_idle();
        })
    {
        warn!("idle clients will only be evicted on publish: {e}");
    }
    gantry_broker::serve(&server, &hub);
    ExitCode::SUCCESS
}
