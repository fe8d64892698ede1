use gantry_core::{AgentRuntime, AgentSettings, InProcessLauncher, Manager, ManagerConfig};
use gantry_messaging::{
    Channel, InMemoryBroker, Message, MessageQueue, MessagingClient, MessagingConfig, MessagingFactory,
};
use gantry_model::{parse_graph_str, Application, InstancePath, InstanceStatus, ResourceBundle};
use gantry_plugin::{ImportChange, MockPlugin, MockRecorder, PluginError, PluginOperation, PluginRegistry};
use gantry_target::{AzureTarget, EmbeddedTarget, InMemoryTarget, TargetError};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

const HEARTBEAT: Duration = Duration::from_millis(50);

const GRAPH: &str = r#"
[components.vm]
installer = "target"
children = ["app", "db"]

[components.app]
installer = "mock"
imports = [{ prefix = "db" }]

[components.db]
installer = "mock"
exports = { ip = "", port = "3306" }
"#;

fn p(raw: &str) -> InstancePath {
    InstancePath::parse(raw).unwrap()
}

fn application() -> Application {
    let mut app = Application::new("shop", parse_graph_str(GRAPH).unwrap()).unwrap();
    let x = app.add_root("x", "vm").unwrap();
    let y = app.add_root("y", "vm").unwrap();
    app.add_instance(&x, "app", "app").unwrap();
    app.add_instance(&y, "db", "db").unwrap();
    app
}

fn config() -> ManagerConfig {
    ManagerConfig {
        heartbeat_interval_ms: 50,
        missed_heartbeats: 4,
        check_period_ms: 20,
        ..ManagerConfig::default()
    }
}

fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(5));
    }
}

/// Kinds of the import changes the plugin of `path` was told about.
fn updates(recorder: &MockRecorder, path: &InstancePath) -> Vec<&'static str> {
    recorder
        .calls_for(path)
        .into_iter()
        .filter(|c| c.operation == PluginOperation::Update)
        .filter_map(|c| c.change.map(|change| change.kind()))
        .collect()
}

fn mock_registry(recorders: &Mutex<BTreeMap<String, MockRecorder>>, root: &str) -> PluginRegistry {
    let plugin = MockPlugin::new();
    recorders
        .lock()
        .unwrap()
        .insert(root.to_owned(), plugin.recorder());
    let mut registry = PluginRegistry::new();
    registry.register(Box::new(plugin));
    registry
}

struct Cluster {
    manager: Manager,
    broker: InMemoryBroker,
    recorders: Arc<Mutex<BTreeMap<String, MockRecorder>>>,
    work_dir: tempfile::TempDir,
}

/// A started manager whose roots get in-process agents.
fn in_memory_cluster() -> Cluster {
    let work_dir = tempfile::tempdir().unwrap();
    let factory = MessagingFactory::new();
    let recorders = Arc::new(Mutex::new(BTreeMap::new()));
    let shared = Arc::clone(&recorders);
    let local = InProcessLauncher::new(factory.clone(), work_dir.path(), move |_, root| {
        Ok::<_, PluginError>(mock_registry(&shared, root))
    })
    .with_heartbeat_interval(HEARTBEAT)
    .with_cardinality(config().cardinality)
    .into_local_agents();

    let messaging = MessagingConfig::in_memory();
    let dm = factory.create_dm_client(&messaging).unwrap();
    let mut manager = Manager::new(config(), messaging, dm);
    manager
        .register_application(application(), Box::new(InMemoryTarget::new(local)))
        .unwrap();
    manager.start().unwrap();
    Cluster {
        manager,
        broker: factory.in_memory_broker().clone(),
        recorders,
        work_dir,
    }
}

impl Cluster {
    fn recorder(&self, root: &str) -> MockRecorder {
        self.recorders.lock().unwrap()[root].clone()
    }

    fn bring_up(&self, root: &str) {
        self.manager.deploy_root("shop", root).unwrap().wait().unwrap();
        wait_until("agent connection", || {
            self.manager.is_agent_connected("shop", root)
        });
    }
}

fn wait_status(manager: &Manager, path: &InstancePath, status: InstanceStatus) {
    wait_until(&format!("{path} to be {status}"), || {
        manager.status("shop", path) == Some(status)
    });
}

fn deploy_and_start(manager: &Manager, path: &InstancePath) {
    manager
        .deploy_instance("shop", path, ResourceBundle::empty())
        .unwrap();
    manager.start_instance("shop", path).unwrap();
    wait_status(manager, path, InstanceStatus::DeployedStarted);
}

#[test]
fn instance_lifecycle_through_the_manager() {
    let cluster = in_memory_cluster();
    let manager = &cluster.manager;
    cluster.bring_up("x");
    let root = manager.snapshot("shop").unwrap();
    assert_eq!(
        root.get(&p("/x")).unwrap().machine_id(),
        Some("in-memory:shop:x")
    );

    let app = p("/x/app");
    let bundle = ResourceBundle::new(BTreeMap::from([(
        "scripts/deploy.sh".to_owned(),
        b"echo deploy".to_vec(),
    )]));
    manager.deploy_instance("shop", &app, bundle).unwrap();
    manager.start_instance("shop", &app).unwrap();
    wait_status(manager, &app, InstanceStatus::DeployedStarted);
    let resources = cluster.work_dir.path().join("x/shop/x/app");
    assert!(resources.join("scripts/deploy.sh").is_file());

    manager.stop_instance("shop", &app).unwrap();
    wait_status(manager, &app, InstanceStatus::DeployedStopped);
    manager.undeploy_instance("shop", &app).unwrap();
    wait_status(manager, &app, InstanceStatus::NotDeployed);
    assert!(!resources.exists());

    assert_eq!(
        cluster.recorder("x").operations_for(&app),
        vec![
            PluginOperation::Initialize,
            PluginOperation::Deploy,
            PluginOperation::Start,
            PluginOperation::Stop,
            PluginOperation::Undeploy,
        ]
    );

    manager.undeploy_root("shop", "x").unwrap().wait().unwrap();
    assert_eq!(manager.status("shop", &p("/x")), Some(InstanceStatus::NotDeployed));
    assert_eq!(cluster.broker.subscriber_count(&Channel::agent("shop", "x")), 0);
    assert!(manager.lost_agents("shop").is_empty());
}

#[test]
fn plugin_failure_surfaces_on_the_manager() {
    let cluster = in_memory_cluster();
    let manager = &cluster.manager;
    cluster.bring_up("x");
    cluster.recorder("x").fail_on(PluginOperation::Deploy);

    let app = p("/x/app");
    manager
        .deploy_instance("shop", &app, ResourceBundle::empty())
        .unwrap();
    wait_status(manager, &app, InstanceStatus::Problem);
    assert!(manager
        .problem("shop", &app)
        .is_some_and(|reason| reason.contains("injected failure")));

    // Undeploy is the way out of PROBLEM.
    cluster.recorder("x").clear_failures();
    manager.undeploy_instance("shop", &app).unwrap();
    wait_status(manager, &app, InstanceStatus::NotDeployed);
    assert!(manager.problem("shop", &app).is_none());
}

#[test]
fn exports_propagate_between_agents() {
    let cluster = in_memory_cluster();
    let manager = &cluster.manager;
    cluster.bring_up("x");
    cluster.bring_up("y");
    let (app, db) = (p("/x/app"), p("/y/db"));

    deploy_and_start(manager, &app);
    deploy_and_start(manager, &db);
    let x = cluster.recorder("x");
    wait_until("import added", || updates(&x, &app) == ["added"]);
    let added = x
        .calls_for(&app)
        .into_iter()
        .find_map(|c| c.change)
        .unwrap();
    let ImportChange::Added { import, .. } = added else {
        panic!("expected an added import");
    };
    assert_eq!(import.exporter_path, db);
    assert_eq!(import.variables["db.port"], "3306");
    assert_eq!(import.variables["db.ip"], "127.0.0.1");

    manager.stop_instance("shop", &db).unwrap();
    wait_until("import removed", || updates(&x, &app) == ["added", "removed"]);
    // The exporter never hears about its own exports.
    assert!(updates(&cluster.recorder("y"), &db).is_empty());
}

#[test]
fn consumers_started_late_receive_existing_exports() {
    let cluster = in_memory_cluster();
    let manager = &cluster.manager;
    cluster.bring_up("y");
    deploy_and_start(manager, &p("/y/db"));

    // x subscribes after db already exports, and asks for what it missed.
    cluster.bring_up("x");
    let app = p("/x/app");
    deploy_and_start(manager, &app);
    manager.stop_instance("shop", &p("/y/db")).unwrap();
    // A withdrawal only reaches consumers that knew the exporter.
    let x = cluster.recorder("x");
    wait_until("import removed", || {
        updates(&x, &app).last() == Some(&"removed")
    });
}

fn agent(
    factory: &MessagingFactory,
    messaging: &MessagingConfig,
    work_dir: &Path,
    root: &str,
) -> (AgentRuntime, MockRecorder) {
    let plugin = MockPlugin::new();
    let recorder = plugin.recorder();
    let mut plugins = PluginRegistry::new();
    plugins.register(Box::new(plugin));
    let client = factory.create_agent_client(messaging, "shop", root).unwrap();
    let settings =
        AgentSettings::new("shop", root, work_dir.join(root)).with_ip_address("10.0.0.9");
    let runtime = AgentRuntime::new(settings, client, plugins).with_heartbeat_interval(HEARTBEAT);
    (runtime, recorder)
}

#[test]
fn lost_agent_exports_are_withdrawn_once_then_restored() {
    let work_dir = tempfile::tempdir().unwrap();
    let factory = MessagingFactory::new();
    let messaging = MessagingConfig::in_memory();
    let mut manager = Manager::new(
        config(),
        messaging.clone(),
        factory.create_dm_client(&messaging).unwrap(),
    );
    manager
        .register_application(application(), Box::new(EmbeddedTarget::new()))
        .unwrap();
    manager.start().unwrap();

    let observer = factory.in_memory_broker().client("observer");
    let withdrawn = MessageQueue::new();
    observer.set_message_queue(withdrawn.clone());
    observer.open_connection().unwrap();
    observer.subscribe(&Channel::imports("shop", "db")).unwrap();

    let (mut x, x_plugin) = agent(&factory, &messaging, work_dir.path(), "x");
    let (mut y, _) = agent(&factory, &messaging, work_dir.path(), "y");
    for (root, runtime) in [("x", &mut x), ("y", &mut y)] {
        manager.deploy_root("shop", root).unwrap().wait().unwrap();
        runtime.start().unwrap();
        wait_until("agent connection", || manager.is_agent_connected("shop", root));
    }
    let (app, db) = (p("/x/app"), p("/y/db"));
    deploy_and_start(&manager, &app);
    deploy_and_start(&manager, &db);
    wait_until("import added", || updates(&x_plugin, &app) == ["added"]);

    y.stop_heartbeat();
    wait_until("loss of y", || manager.lost_agents("shop").contains("y"));
    assert_eq!(manager.status("shop", &db), Some(InstanceStatus::Problem));
    assert_eq!(manager.status("shop", &p("/y")), Some(InstanceStatus::Problem));
    wait_until("withdrawal", || updates(&x_plugin, &app) == ["added", "removed"]);
    // Several sweeps later there is still a single withdrawal.
    std::thread::sleep(Duration::from_millis(200));
    let removals = std::iter::from_fn(|| withdrawn.try_take())
        .filter(|m| matches!(m, Message::ImportRemoved { exporter_path, .. } if *exporter_path == db))
        .count();
    assert_eq!(removals, 1);
    assert!(manager.is_agent_connected("shop", "x"));

    y.start_heartbeat().unwrap();
    wait_until("resync of y", || {
        manager.lost_agents("shop").is_empty()
            && manager.status("shop", &db) == Some(InstanceStatus::DeployedStarted)
    });
    assert_eq!(y.status(&db), Some(InstanceStatus::DeployedStarted));
    wait_until("exports restored", || {
        updates(&x_plugin, &app) == ["added", "removed", "added"]
    });
}

#[test]
fn reconnected_agent_drops_imports_withdrawn_while_it_was_away() {
    let work_dir = tempfile::tempdir().unwrap();
    let factory = MessagingFactory::new();
    let messaging = MessagingConfig::in_memory();
    let mut manager = Manager::new(
        config(),
        messaging.clone(),
        factory.create_dm_client(&messaging).unwrap(),
    );
    manager
        .register_application(application(), Box::new(EmbeddedTarget::new()))
        .unwrap();
    manager.start().unwrap();

    let (mut x, x_plugin) = agent(&factory, &messaging, work_dir.path(), "x");
    let (mut y, _) = agent(&factory, &messaging, work_dir.path(), "y");
    for (root, runtime) in [("x", &mut x), ("y", &mut y)] {
        manager.deploy_root("shop", root).unwrap().wait().unwrap();
        runtime.start().unwrap();
        wait_until("agent connection", || manager.is_agent_connected("shop", root));
    }
    let (app, db) = (p("/x/app"), p("/y/db"));
    deploy_and_start(&manager, &app);
    deploy_and_start(&manager, &db);
    wait_until("import added", || updates(&x_plugin, &app) == ["added"]);

    x.disconnect();
    wait_until("loss of x", || manager.lost_agents("shop").contains("x"));
    // The withdrawal of db is published while x cannot hear it.
    manager.stop_instance("shop", &db).unwrap();
    wait_status(&manager, &db, InstanceStatus::DeployedStopped);
    assert_eq!(updates(&x_plugin, &app), ["added"]);

    x.reconnect().unwrap();
    wait_until("resync of x", || manager.lost_agents("shop").is_empty());
    wait_until("stale import dropped", || {
        updates(&x_plugin, &app) == ["added", "removed"]
    });
    // db is stopped, so asking again brings nothing back.
    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(updates(&x_plugin, &app), ["added", "removed"]);
    assert!(x.snapshot().unwrap().get(&app).unwrap().imports.is_empty());

    // Once db starts again x hears about it as usual.
    manager.start_instance("shop", &db).unwrap();
    wait_until("import restored", || {
        updates(&x_plugin, &app) == ["added", "removed", "added"]
    });
}

#[test]
fn unsupported_target_leaves_root_in_problem() {
    let factory = MessagingFactory::new();
    let messaging = MessagingConfig::in_memory();
    let mut manager = Manager::new(
        config(),
        messaging.clone(),
        factory.create_dm_client(&messaging).unwrap(),
    );
    manager
        .register_application(application(), Box::new(AzureTarget::new()))
        .unwrap();
    manager.start().unwrap();

    let err = manager.deploy_root("shop", "x").unwrap().wait().unwrap_err();
    assert!(matches!(err, TargetError::NotConfigured(_)));
    assert_eq!(manager.status("shop", &p("/x")), Some(InstanceStatus::Problem));
    assert!(manager.problem("shop", &p("/x")).is_some());

    // Nothing was provisioned, so undeploying just resets the subtree.
    manager.undeploy_root("shop", "x").unwrap().wait().unwrap();
    assert_eq!(manager.status("shop", &p("/x")), Some(InstanceStatus::NotDeployed));
    assert!(manager.problem("shop", &p("/x")).is_none());
    manager.stop();
    assert!(!manager.is_running());
}
