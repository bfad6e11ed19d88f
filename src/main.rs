//! Foreman CLI entry point.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;

use foreman::adapters::sqlite::{
    SqliteApprovalRepository, SqliteDagRunRepository, SqliteScheduleStateRepository,
    SqliteTaskRepository, SqliteTemplateRepository, Store,
};
use foreman::adapters::ShellAdapter;
use foreman::cli::{handle_approval, handle_dag, handle_queue, handle_task, Cli, Commands};
use foreman::domain::ports::{
    ApprovalRepository, DagRunRepository, ExecutionAdapter, ScheduleStateRepository,
    TaskRepository, TemplateRepository,
};
use foreman::infrastructure::{config::ConfigLoader, logging};
use foreman::services::{
    DagEngine, Dispatcher, DispatcherConfig, EventBus, GateRunner, PriorityQueue, ReviewHandler,
    Scheduler, TaskStore, Watchdog, WatchdogConfig, WebhookConfig, WebhookEmitter,
};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = ConfigLoader::load().context("failed to load configuration")?;
    logging::init(&config.logging);

    let store_db = Store::open(&config.database.path)
        .await
        .context("failed to open the task store")?;
    let pool = store_db.pool().clone();

    let task_repo: Arc<dyn TaskRepository> = Arc::new(SqliteTaskRepository::new(pool.clone()));
    let template_repo: Arc<dyn TemplateRepository> =
        Arc::new(SqliteTemplateRepository::new(pool.clone()));
    let schedule_repo: Arc<dyn ScheduleStateRepository> =
        Arc::new(SqliteScheduleStateRepository::new(pool.clone()));
    let approval_repo: Arc<dyn ApprovalRepository> =
        Arc::new(SqliteApprovalRepository::new(pool.clone()));
    let dag_repo: Arc<dyn DagRunRepository> = Arc::new(SqliteDagRunRepository::new(pool.clone()));

    let events = EventBus::default();
    let store = Arc::new(TaskStore::new(Arc::clone(&task_repo), events.clone()));
    let queue = PriorityQueue::new(Arc::clone(&task_repo));
    let gates = Arc::new(GateRunner::new());
    let engine = DagEngine::new(Arc::clone(&dag_repo), Arc::clone(&gates));
    let review = ReviewHandler::new(Arc::clone(&store), Arc::clone(&approval_repo));

    match cli.command {
        Commands::Serve => {
            serve(
                &config,
                store,
                queue,
                gates,
                task_repo,
                template_repo,
                schedule_repo,
                approval_repo,
            )
            .await
        }
        Commands::Task(cmd) => handle_task(&store, cmd, cli.json).await,
        Commands::Queue(cmd) => handle_queue(&queue, cmd, cli.json).await,
        Commands::Approval(cmd) => handle_approval(&review, &approval_repo, cmd, cli.json).await,
        Commands::Dag(cmd) => handle_dag(&engine, &dag_repo, cmd, cli.json).await,
    }
}

#[allow(clippy::too_many_arguments)]
async fn serve(
    config: &foreman::infrastructure::Config,
    store: Arc<TaskStore>,
    queue: PriorityQueue,
    gates: Arc<GateRunner>,
    task_repo: Arc<dyn TaskRepository>,
    template_repo: Arc<dyn TemplateRepository>,
    schedule_repo: Arc<dyn ScheduleStateRepository>,
    approval_repo: Arc<dyn ApprovalRepository>,
) -> Result<()> {
    let mut wip_limits = config.dispatcher.wip_limits.clone();
    let default_wip = wip_limits.remove("default").unwrap_or(2);

    let adapters: Vec<Arc<dyn ExecutionAdapter>> = vec![Arc::new(ShellAdapter::new(vec![
        "shell".to_string(),
        "chat".to_string(),
        "code".to_string(),
    ]))];

    let dispatcher = Arc::new(Dispatcher::new(
        Arc::clone(&store),
        queue,
        adapters,
        gates,
        DispatcherConfig {
            wip_limits,
            default_wip,
            lease_ttl: Duration::from_secs(config.dispatcher.lease_ttl_secs),
            heartbeat_interval: Duration::from_secs(config.dispatcher.heartbeat_secs),
            tick_interval: Duration::from_millis(config.dispatcher.tick_ms),
        },
    ));

    let watchdog = Arc::new(Watchdog::new(
        Arc::clone(&store),
        WatchdogConfig {
            interval: Duration::from_secs(config.watchdog.interval_secs),
            grace: Duration::from_secs(config.watchdog.grace_secs),
            policy: config.watchdog.policy,
        },
    ));

    let mut scheduler = Scheduler::new(
        template_repo,
        schedule_repo,
        Arc::clone(&store),
        config.schedules.clone(),
    );
    scheduler.start();

    let mut webhooks = WebhookEmitter::new(
        WebhookConfig {
            subscribers: config.webhooks.clone(),
            ..Default::default()
        },
        task_repo,
    );
    webhooks.start(store.events());

    let review = Arc::new(ReviewHandler::new(Arc::clone(&store), approval_repo));
    let review_task = {
        let review = Arc::clone(&review);
        tokio::spawn(async move { review.run().await })
    };

    let watchdog_task = {
        let watchdog = Arc::clone(&watchdog);
        tokio::spawn(async move { watchdog.run().await })
    };

    let dispatcher_task = {
        let dispatcher = Arc::clone(&dispatcher);
        tokio::spawn(async move { dispatcher.run().await })
    };

    tracing::info!("foreman serving; press Ctrl-C to stop");
    tokio::signal::ctrl_c().await.context("signal handler failed")?;
    tracing::info!("shutting down");

    dispatcher.stop().await;
    watchdog.stop();
    scheduler.stop();
    webhooks.stop();
    dispatcher_task.abort();
    watchdog_task.abort();
    review_task.abort();

    Ok(())
}
