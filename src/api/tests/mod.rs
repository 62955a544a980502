mod unit;

use std::sync::Arc;

use tempfile::TempDir;

use crate::{
    api::ApiServer,
    audit::AuditLog,
    config::{test_config, Config},
    dispatch::Dispatcher,
    orchestrator::Orchestrator,
    planner::Planner,
    policy::{PolicyConfig, PolicyEngine},
    queue::JobQueue,
    registry::AgentRegistry,
    store::{JobStore, MemoryJobStore},
};

/// A wired ApiServer whose router can be driven directly with
/// `tower::ServiceExt::oneshot`, without binding a socket.
pub(crate) async fn build_router_only() -> (axum::Router, TempDir) {
    let data_dir = tempfile::tempdir().unwrap();
    let config = test_config(data_dir.path().to_str().unwrap());

    let store: Arc<dyn JobStore> = Arc::new(MemoryJobStore::new());
    let registry = Arc::new(AgentRegistry::new());
    let audit = AuditLog::open(store.clone(), data_dir.path()).await.unwrap();
    let policy = Arc::new(PolicyEngine::new(PolicyConfig::default()));
    let dispatcher = Dispatcher::new(store.clone(), registry.clone(), policy, audit.clone());
    let orchestrator = Orchestrator::new(
        store.clone(),
        JobQueue::new(),
        dispatcher,
        audit,
        config.dispatch.clone(),
    );
    let planner = Arc::new(Planner::new(registry.clone(), config.planner.clone()).unwrap());
    let api = ApiServer::new(config, orchestrator, planner, registry);
    (api.build_router(), data_dir)
}

/// An API server bound to a random port with the orchestrator run loop
/// live behind it.
pub(crate) struct ApiHarness {
    pub base_url: String,
    pub registry: Arc<AgentRegistry>,
    pub store: Arc<dyn JobStore>,
    _data_dir: TempDir,
}

pub(crate) async fn spawn_api(mut mutate: impl FnMut(&mut Config)) -> ApiHarness {
    let data_dir = tempfile::tempdir().unwrap();
    let mut config = test_config(data_dir.path().to_str().unwrap());
    mutate(&mut config);

    let store: Arc<dyn JobStore> = Arc::new(MemoryJobStore::new());
    let registry = Arc::new(AgentRegistry::new());
    let audit = AuditLog::open(store.clone(), data_dir.path()).await.unwrap();
    let policy = Arc::new(PolicyEngine::new(PolicyConfig::default()));
    let dispatcher = Dispatcher::new(store.clone(), registry.clone(), policy, audit.clone());
    let orchestrator = Orchestrator::new(
        store.clone(),
        JobQueue::new(),
        dispatcher,
        audit,
        config.dispatch.clone(),
    );
    let planner = Arc::new(Planner::new(registry.clone(), config.planner.clone()).unwrap());

    {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move {
            let _ = orchestrator.run().await;
        });
    }

    let api = ApiServer::new(config, orchestrator.clone(), planner, registry.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = api.build_router();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    // Give the server a beat to start accepting.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    ApiHarness {
        base_url: format!("http://{addr}"),
        registry,
        store,
        _data_dir: data_dir,
    }
}
