//! hived - blackboard work orchestrator for coding agents.
//!
//! External producers append work items to a shared SQLite store; the
//! dispatcher claims them under a concurrency limit and runs detached
//! workers, each driving one item through its pipeline inside an
//! isolated git checkout. The SpecFlow orchestrator advances features
//! through a phased state machine with a gate after every active phase.

pub mod dispatch;
pub mod launcher;
pub mod queue;
pub mod registry;
pub mod specflow;
pub mod storage;
pub mod tana;
pub mod vcs;
pub mod worker;
pub mod workspace;

use std::sync::Arc;
use std::time::Duration;

use hive_core::Config;

use crate::launcher::AgentCli;
use crate::queue::Queue;
use crate::registry::{Registry, RegisterOpts};
use crate::specflow::gate::LauncherScorer;
use crate::specflow::phase::LauncherExecutor;
use crate::specflow::Orchestrator;
use crate::storage::Storage;
use crate::vcs::AutoVcs;
use crate::worker::WorkerEnv;
use crate::workspace::{StoreCycleQuery, Workspaces};

/// Type alias for application-level errors with context.
pub type AppResult<T> = eyre::Result<T>;

/// Minimum budget granted to quality-gate scoring launches.
const SCORER_MIN_TIMEOUT: Duration = Duration::from_secs(120);

/// Open the store and assemble the shared worker environment.
pub async fn build_env(config: Config) -> AppResult<Arc<WorkerEnv>> {
    let storage = Arc::new(Storage::open(&config.db_path).await?);
    storage.migrate().await?;
    let config = Arc::new(config);

    let guard = Arc::new(StoreCycleQuery::new(Arc::clone(&storage)));
    let workspaces = Arc::new(Workspaces::new(config.workspace_root.clone(), guard));
    let launcher = Arc::new(AgentCli::new(
        config.agent_bin.clone(),
        config.log_dir.clone(),
    ));
    let vcs = Arc::new(AutoVcs::new(config.vcs_timeout));
    let tana: Arc<dyn tana::TanaClient> = match &config.tana_api_token {
        Some(token) => Arc::new(tana::HttpTana::new(token)),
        None => Arc::new(tana::NoopTana),
    };

    Ok(Arc::new(WorkerEnv {
        storage: Arc::clone(&storage),
        queue: Queue::new(Arc::clone(&storage)),
        registry: Registry::new(Arc::clone(&storage), Arc::clone(&config)),
        workspaces,
        launcher,
        vcs,
        tana,
        config,
    }))
}

/// Build the SpecFlow orchestrator over an environment.
pub fn build_orchestrator(env: &Arc<WorkerEnv>) -> Orchestrator {
    Orchestrator::new(
        Arc::clone(&env.storage),
        Arc::clone(&env.workspaces),
        Arc::new(LauncherExecutor::new(Arc::clone(&env.launcher))),
        Arc::new(LauncherScorer::new(
            Arc::clone(&env.launcher),
            env.config.vcs_timeout.max(SCORER_MIN_TIMEOUT),
        )),
        Arc::clone(&env.config),
    )
}

/// Register the orchestrator's own agent session for one tick. It is
/// excluded from the dispatcher's concurrency count by name.
pub async fn register_tick_session(env: &Arc<WorkerEnv>) -> AppResult<String> {
    let session = env
        .registry
        .register(RegisterOpts {
            name: env.config.orchestrator_agent_name.clone(),
            work: Some("orchestrator tick".to_string()),
            ..RegisterOpts::default()
        })
        .await?;
    Ok(session.session_id.as_ref().to_string())
}
