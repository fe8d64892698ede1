use clap::Parser;
use gantry_agent::{build_runtime, run_until, AgentConfig};
use gantry_messaging::MessagingFactory;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::mpsc;
use tracing::{error, info};

#[derive(Parser)]
#[command(
    name = "gantry-agent",
    about = "Runs the instances of one gantry root instance and reports to the manager"
)]
struct Cli {
    /// Agent configuration file.
    #[arg(long, short, default_value = "/etc/gantry/agent.toml")]
    config: PathBuf,

    /// Override the root instance named in the configuration.
    #[arg(long)]
    root_instance: Option<String>,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("GANTRY_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let mut config = match AgentConfig::load(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            error!("{}: {e}", cli.config.display());
            return ExitCode::FAILURE;
        }
    };
    if let Some(root) = cli.root_instance {
        config.root_instance = root;
    }

    let runtime = match build_runtime(&config, &MessagingFactory::new()) {
        Ok(r) => r,
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };

    let (stop, shutdown) = mpsc::channel();
    if let Err(e) = ctrlc::set_handler(move || {
        let _ = stop.send(());
    }) {
        error!("failed to install signal handler: {e}");
        return ExitCode::FAILURE;
    }

    info!(
        "gantry-agent starting for {}/{}, work dir {}",
        config.application,
        config.root_instance,
        config.work_dir.display()
    );
    match run_until(runtime, &shutdown) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}
