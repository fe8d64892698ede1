use crate::plugin::{ImportChange, Plugin, PluginContext, PluginOperation};
use crate::PluginError;
use gantry_model::InstanceStatus;
use std::collections::BTreeMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// How long a lifecycle script may run before it is killed.
pub const DEFAULT_SCRIPT_TIMEOUT: Duration = Duration::from_secs(300);

const WAIT_STEP: Duration = Duration::from_millis(10);

/// Runs `scripts/<operation>.sh` from the instance's resource directory.
///
/// The environment carries the instance identity, its exports (`tomcat.port`
/// becomes `tomcat_port`), and its imports: for every required prefix,
/// `GANTRY_IMPORT_COUNT_<prefix>` plus each exporter's variables suffixed by
/// the exporter index (`db_port_0`, `db_port_1`, ...). A missing script is a
/// successful no-op; a non-zero exit status is a plugin error. A script still
/// running after the timeout is killed and reported as failed.
#[derive(Debug)]
pub struct ScriptPlugin {
    shell: PathBuf,
    timeout: Duration,
    application: String,
    root_instance: String,
}

impl Default for ScriptPlugin {
    fn default() -> Self {
        Self {
            shell: PathBuf::from("sh"),
            timeout: DEFAULT_SCRIPT_TIMEOUT,
            application: String::new(),
            root_instance: String::new(),
        }
    }
}

/// `tomcat.port` → `tomcat_port`; anything outside `[A-Za-z0-9_]` becomes `_`.
pub fn env_name(key: &str) -> String {
    key.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}

impl ScriptPlugin {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_shell(mut self, shell: impl Into<PathBuf>) -> Self {
        self.shell = shell.into();
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn environment(
        &self,
        operation: PluginOperation,
        ctx: &PluginContext<'_>,
        change: Option<&ImportChange>,
        status: Option<InstanceStatus>,
    ) -> BTreeMap<String, String> {
        let instance = ctx.instance;
        let mut env = BTreeMap::new();
        env.insert("GANTRY_APPLICATION".to_owned(), self.application.clone());
        env.insert("GANTRY_ROOT_INSTANCE".to_owned(), self.root_instance.clone());
        env.insert("GANTRY_INSTANCE_PATH".to_owned(), instance.path.to_string());
        env.insert("GANTRY_INSTANCE_NAME".to_owned(), instance.name().to_owned());
        env.insert("GANTRY_COMPONENT".to_owned(), instance.component.clone());
        env.insert("GANTRY_OPERATION".to_owned(), operation.to_string());

        for (key, value) in &instance.exports {
            env.insert(env_name(key), value.clone());
        }
        for (prefix, exporters) in &instance.imports {
            env.insert(
                format!("GANTRY_IMPORT_COUNT_{}", env_name(prefix)),
                exporters.len().to_string(),
            );
            for (index, import) in exporters.values().enumerate() {
                for (key, value) in &import.variables {
                    env.insert(format!("{}_{index}", env_name(key)), value.clone());
                }
            }
        }

        if let Some(status) = status {
            env.insert("GANTRY_STATUS".to_owned(), status.to_string());
        }
        if let Some(change) = change {
            env.insert("GANTRY_CHANGE".to_owned(), change.kind().to_owned());
            env.insert("GANTRY_CHANGED_PREFIX".to_owned(), change.prefix().to_owned());
            env.insert(
                "GANTRY_CHANGED_EXPORTER".to_owned(),
                change.exporter_path().to_string(),
            );
        }
        env
    }

    fn run(
        &self,
        operation: PluginOperation,
        ctx: &PluginContext<'_>,
        change: Option<&ImportChange>,
        status: Option<InstanceStatus>,
    ) -> Result<(), PluginError> {
        let script = ctx
            .resources
            .join("scripts")
            .join(format!("{operation}.sh"));
        if !script.is_file() {
            debug!("{}: no {} script, skipping", ctx.instance.path, operation);
            return Ok(());
        }

        info!("{}: running {}", ctx.instance.path, script.display());
        let mut child = Command::new(&self.shell)
            .arg(&script)
            .current_dir(ctx.resources)
            .envs(self.environment(operation, ctx, change, status))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;
        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let Some(exit) = wait_with_timeout(&mut child, self.timeout, &script)? else {
            // Grandchildren may still hold the pipes; leave the readers behind.
            return Err(PluginError::ScriptTimedOut {
                script: script.display().to_string(),
                timeout: self.timeout,
            });
        };
        let stdout = collect(stdout);
        let stderr = collect(stderr);
        if !stdout.is_empty() {
            debug!("{} stdout: {}", script.display(), stdout.trim_end());
        }
        if exit.success() {
            Ok(())
        } else {
            Err(PluginError::ScriptFailed {
                script: script.display().to_string(),
                code: exit.code(),
                stderr: stderr.trim_end().to_owned(),
            })
        }
    }
}

/// Read a child pipe to the end on its own thread, so a chatty script never
/// blocks on a full pipe while we wait for it.
fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> Option<JoinHandle<String>> {
    let mut pipe = pipe?;
    std::thread::Builder::new()
        .name("script-output".to_owned())
        .spawn(move || {
            let mut bytes = Vec::new();
            let _ = pipe.read_to_end(&mut bytes);
            String::from_utf8_lossy(&bytes).into_owned()
        })
        .ok()
}

fn collect(reader: Option<JoinHandle<String>>) -> String {
    reader.and_then(|r| r.join().ok()).unwrap_or_default()
}

/// `None` when the child outlived `timeout` and was killed.
fn wait_with_timeout(
    child: &mut Child,
    timeout: Duration,
    script: &Path,
) -> Result<Option<ExitStatus>, PluginError> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        if Instant::now() >= deadline {
            warn!("{} still running after {timeout:?}, killing it", script.display());
            if let Err(e) = child.kill() {
                warn!("failed to kill {}: {e}", script.display());
            }
            child.wait()?;
            return Ok(None);
        }
        std::thread::sleep(WAIT_STEP);
    }
}

impl Plugin for ScriptPlugin {
    fn name(&self) -> &'static str {
        "script"
    }

    fn set_names(&mut self, application: &str, root_instance: &str) {
        application.clone_into(&mut self.application);
        root_instance.clone_into(&mut self.root_instance);
    }

    fn initialize(&mut self, ctx: &PluginContext<'_>) -> Result<(), PluginError> {
        self.run(PluginOperation::Initialize, ctx, None, None)
    }

    fn deploy(&mut self, ctx: &PluginContext<'_>) -> Result<(), PluginError> {
        self.run(PluginOperation::Deploy, ctx, None, None)
    }

    fn start(&mut self, ctx: &PluginContext<'_>) -> Result<(), PluginError> {
        self.run(PluginOperation::Start, ctx, None, None)
    }

    fn update(
        &mut self,
        ctx: &PluginContext<'_>,
        changed_import: Option<&ImportChange>,
        changed_status: InstanceStatus,
    ) -> Result<(), PluginError> {
        self.run(
            PluginOperation::Update,
            ctx,
            changed_import,
            Some(changed_status),
        )
    }

    fn stop(&mut self, ctx: &PluginContext<'_>) -> Result<(), PluginError> {
        self.run(PluginOperation::Stop, ctx, None, None)
    }

    fn undeploy(&mut self, ctx: &PluginContext<'_>) -> Result<(), PluginError> {
        self.run(PluginOperation::Undeploy, ctx, None, None)
    }
}
