use crate::{AgentConfig, AgentError};
use gantry_core::{AgentRuntime, AgentSettings};
use gantry_messaging::{Backoff, MessagingFactory};
use gantry_plugin::{PluginRegistry, ScriptPlugin};
use std::sync::mpsc;
use tracing::info;

/// Build, but do not start, the runtime described by `config`.
pub fn build_runtime(
    config: &AgentConfig,
    factory: &MessagingFactory,
) -> Result<AgentRuntime, AgentError> {
    config.validate()?;
    let client = factory.create_agent_client(
        &config.messaging,
        &config.application,
        &config.root_instance,
    )?;
    let mut plugins = PluginRegistry::from_names(&config.plugins)?;
    if plugins.contains("script") {
        plugins.register(Box::new(
            ScriptPlugin::new().with_timeout(config.script_timeout()),
        ));
    }
    let mut settings = AgentSettings::new(
        &config.application,
        &config.root_instance,
        &config.work_dir,
    )
    .with_cardinality(config.cardinality);
    if let Some(ip) = &config.ip_address {
        settings = settings.with_ip_address(ip);
    }
    Ok(AgentRuntime::new(settings, client, plugins)
        .with_heartbeat_interval(config.heartbeat_interval())
        .with_connect_retry(config.connect_attempts, Backoff::default()))
}

/// Start `runtime` and serve until `shutdown` receives a value or its sender
/// goes away. The runtime announces its shutdown to the manager on the way
/// out.
pub fn run_until(mut runtime: AgentRuntime, shutdown: &mpsc::Receiver<()>) -> Result<(), AgentError> {
    runtime.start()?;
    info!(
        "agent {}/{} running",
        runtime.application(),
        runtime.root_instance()
    );
    // Either outcome means stop.
    let _ = shutdown.recv();
    info!("shutting down");
    runtime.stop();
    Ok(())
}
