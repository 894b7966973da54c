use std::fs;
use std::io::ErrorKind;
use std::os::unix::net::UnixStream as StdUnixStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::UnixListener;
use tokio::sync::{broadcast, mpsc, oneshot, RwLock};

use kurator_core::config::{self, ScheduleConfig};
use kurator_core::{Actor, EntityKind, Role, RunScope, SyncStatus, TriggerType};
use kurator_replica::{FileReplicaStore, ReplicaStore, RunLedger};
use kurator_source::{HttpSourceClient, SourceClient};
use kurator_sync::{EntityOutcome, RunOutcome, SyncEngine};

use crate::error::{io_err, DaemonError};
use crate::log_rotation::{RotatingFile, MAX_LOG_BYTES, MAX_ROTATED_FILES};
use crate::paths::{log_path, logs_dir, socket_path};
use crate::protocol::{DaemonRequest, DaemonResponse};
use crate::schedule::{next_daily_run, until};

const DEFAULT_HISTORY_LIMIT: usize = 10;

/// Runtime knobs that do not come from the sync engine itself.
#[derive(Debug, Clone)]
pub struct DaemonOptions {
    pub home: PathBuf,
    pub schedule: ScheduleConfig,
}

struct SyncJob {
    scope: RunScope,
    trigger: TriggerType,
    triggered_by: Option<String>,
    /// `None` for fire-and-forget jobs.
    respond_to: Option<oneshot::Sender<JobSummary>>,
}

/// What the processor reports for a finished job.
#[derive(Debug, Clone, Serialize)]
pub struct JobSummary {
    pub scope: String,
    pub trigger: TriggerType,
    pub status: String,
    pub run_id: Option<String>,
    pub duration_ms: u64,
    pub errors: Vec<String>,
}

impl JobSummary {
    fn from_outcome(scope: RunScope, trigger: TriggerType, outcome: &RunOutcome) -> Self {
        match outcome {
            RunOutcome::AlreadyRunning { run_id, .. } => Self {
                scope: scope.to_string(),
                trigger,
                status: "already_running".to_string(),
                run_id: run_id.clone(),
                duration_ms: 0,
                errors: vec![],
            },
            RunOutcome::Completed(result) => Self {
                scope: scope.to_string(),
                trigger,
                status: result.status.to_string(),
                run_id: Some(result.run_id.clone()),
                duration_ms: result.duration_ms,
                errors: result.errors.clone(),
            },
        }
    }
}

type NextRun = Arc<RwLock<Option<DateTime<Utc>>>>;

/// Start the daemon against the configured source and the on-disk replica,
/// blocking the current thread until it exits.
pub fn start_blocking(home: &Path) -> Result<(), DaemonError> {
    init_tracing(home)?;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| io_err("tokio-runtime", e))?;
    runtime.block_on(run(home.to_path_buf()))
}

/// Build the production engine from `<home>/.kurator/config.yaml` and run.
pub async fn run(home: PathBuf) -> Result<(), DaemonError> {
    let config = config::load_at(&home)?;
    let source = HttpSourceClient::from_config(config.source.clone())?;
    let replica = FileReplicaStore::open_at(&home)?;
    let engine = Arc::new(SyncEngine::new(source, replica, config.sync.clone()));
    run_with_engine(
        DaemonOptions {
            home,
            schedule: config.schedule,
        },
        engine,
    )
    .await
}

/// Run the daemon tasks around an existing engine.
pub async fn run_with_engine<S, R>(
    options: DaemonOptions,
    engine: Arc<SyncEngine<S, R>>,
) -> Result<(), DaemonError>
where
    S: SourceClient + 'static,
    R: ReplicaStore + RunLedger + 'static,
{
    let DaemonOptions { home, schedule } = options;
    ensure_runtime_dirs(&home)?;

    let started_at = Utc::now();
    let next_run: NextRun = Arc::new(RwLock::new(None));
    let (sync_tx, sync_rx) = mpsc::channel::<SyncJob>(64);
    let (shutdown_tx, _) = broadcast::channel::<()>(16);

    let scheduler_handle = {
        let shutdown = shutdown_tx.clone();
        let sync_tx = sync_tx.clone();
        let next_run = next_run.clone();
        tokio::spawn(async move {
            let result = scheduler_task(schedule, sync_tx, next_run, shutdown.subscribe()).await;
            let _ = shutdown.send(());
            result
        })
    };

    let processor_handle = {
        let shutdown = shutdown_tx.clone();
        let engine = engine.clone();
        tokio::spawn(async move {
            let result = sync_processor_task(engine, sync_rx, shutdown.subscribe()).await;
            let _ = shutdown.send(());
            result
        })
    };

    let socket_handle = {
        let shutdown = shutdown_tx.clone();
        let ctx = ClientContext {
            home: home.clone(),
            engine: engine.clone(),
            sync_tx: sync_tx.clone(),
            shutdown_tx: shutdown.clone(),
            next_run: next_run.clone(),
            started_at,
        };
        tokio::spawn(async move {
            let result = socket_server_task(ctx, shutdown.subscribe()).await;
            let _ = shutdown.send(());
            result
        })
    };

    let signal_handle = {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            let mut shutdown_rx = shutdown.subscribe();
            tokio::select! {
                _ = shutdown_rx.recv() => Ok(()),
                signal = tokio::signal::ctrl_c() => {
                    match signal {
                        Ok(()) => {
                            tracing::info!("received ctrl-c, shutting down daemon");
                            let _ = shutdown.send(());
                            Ok(())
                        }
                        Err(err) => Err(DaemonError::Protocol(format!("ctrl-c handler failed: {err}"))),
                    }
                }
            }
        })
    };

    tracing::info!(home = %home.display(), "kurator daemon started");
    let (scheduler_result, processor_result, socket_result, signal_result) = tokio::join!(
        scheduler_handle,
        processor_handle,
        socket_handle,
        signal_handle
    );

    handle_join("scheduler", scheduler_result)?;
    handle_join("sync_processor", processor_result)?;
    handle_join("socket_server", socket_result)?;
    handle_join("signal_handler", signal_result)?;
    tracing::info!("kurator daemon stopped");
    Ok(())
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// Once a day at the configured hour, queue a full run and wait for it.
async fn scheduler_task(
    schedule: ScheduleConfig,
    sync_tx: mpsc::Sender<SyncJob>,
    next_run: NextRun,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    if !schedule.enabled {
        tracing::info!("scheduled sync disabled");
        let _ = shutdown_rx.recv().await;
        return Ok(());
    }

    loop {
        let now = Utc::now();
        let at = next_daily_run(now, schedule.daily_hour_utc);
        *next_run.write().await = Some(at);
        tracing::info!(next_run = %at, "scheduled sync armed");

        tokio::select! {
            _ = shutdown_rx.recv() => break,
            _ = tokio::time::sleep(until(now, at)) => {
                match enqueue_and_wait(&sync_tx, RunScope::Full, TriggerType::Scheduled, None).await {
                    Ok(summary) if summary.errors.is_empty() => tracing::info!(
                        run_id = summary.run_id.as_deref().unwrap_or("-"),
                        status = %summary.status,
                        duration_ms = summary.duration_ms,
                        "scheduled sync completed",
                    ),
                    Ok(summary) => tracing::warn!(
                        run_id = summary.run_id.as_deref().unwrap_or("-"),
                        errors = ?summary.errors,
                        "scheduled sync completed with errors",
                    ),
                    Err(err) => {
                        tracing::error!(error = %err, "scheduled sync could not run");
                        if matches!(err, DaemonError::ChannelClosed(_)) {
                            break;
                        }
                    }
                }
            }
        }
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Sync processor
// ---------------------------------------------------------------------------

async fn sync_processor_task<S, R>(
    engine: Arc<SyncEngine<S, R>>,
    mut sync_rx: mpsc::Receiver<SyncJob>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError>
where
    S: SourceClient + 'static,
    R: ReplicaStore + RunLedger + 'static,
{
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            maybe_job = sync_rx.recv() => {
                let Some(job) = maybe_job else { break };
                let engine = engine.clone();
                let scope = job.scope;
                let trigger = job.trigger;
                let triggered_by = job.triggered_by;

                let outcome = tokio::task::spawn_blocking(move || match scope {
                    RunScope::Full => engine.run_full_sync(trigger, triggered_by),
                    RunScope::Kind(kind) => {
                        match engine.run_entity_sync(kind, trigger, triggered_by) {
                            EntityOutcome::AlreadyRunning { run_id, started_at } => {
                                RunOutcome::AlreadyRunning { run_id, started_at }
                            }
                            EntityOutcome::Completed { run, .. } => RunOutcome::Completed(run),
                        }
                    }
                })
                .await
                .map_err(|err| DaemonError::Protocol(format!("sync task join error: {err}")))?;

                let summary = JobSummary::from_outcome(scope, trigger, &outcome);
                tracing::info!(
                    scope = %summary.scope,
                    trigger = %summary.trigger,
                    status = %summary.status,
                    duration_ms = summary.duration_ms,
                    "sync job finished",
                );
                if let Some(respond_to) = job.respond_to {
                    let _ = respond_to.send(summary);
                }
            }
        }
    }

    Ok(())
}

async fn enqueue_and_wait(
    sync_tx: &mpsc::Sender<SyncJob>,
    scope: RunScope,
    trigger: TriggerType,
    triggered_by: Option<String>,
) -> Result<JobSummary, DaemonError> {
    let (tx, rx) = oneshot::channel();
    sync_tx
        .send(SyncJob {
            scope,
            trigger,
            triggered_by,
            respond_to: Some(tx),
        })
        .await
        .map_err(|_| DaemonError::ChannelClosed("sync queue"))?;
    rx.await
        .map_err(|_| DaemonError::ChannelClosed("sync response"))
}

// ---------------------------------------------------------------------------
// Socket server
// ---------------------------------------------------------------------------

struct ClientContext<S, R> {
    home: PathBuf,
    engine: Arc<SyncEngine<S, R>>,
    sync_tx: mpsc::Sender<SyncJob>,
    shutdown_tx: broadcast::Sender<()>,
    next_run: NextRun,
    started_at: DateTime<Utc>,
}

impl<S, R> Clone for ClientContext<S, R> {
    fn clone(&self) -> Self {
        Self {
            home: self.home.clone(),
            engine: self.engine.clone(),
            sync_tx: self.sync_tx.clone(),
            shutdown_tx: self.shutdown_tx.clone(),
            next_run: self.next_run.clone(),
            started_at: self.started_at,
        }
    }
}

async fn socket_server_task<S, R>(
    ctx: ClientContext<S, R>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError>
where
    S: SourceClient + 'static,
    R: ReplicaStore + RunLedger + 'static,
{
    let socket = socket_path(&ctx.home);
    prepare_socket_for_bind(&socket)?;

    let listener = UnixListener::bind(&socket).map_err(|e| io_err(&socket, e))?;
    set_socket_permissions(&socket)?;

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            accepted = listener.accept() => {
                let (stream, _) = accepted.map_err(|e| io_err(&socket, e))?;
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    let (reader, writer) = stream.into_split();
                    if let Err(err) = handle_client(BufReader::new(reader), writer, ctx).await {
                        tracing::error!(error = %err, "socket client error");
                    }
                });
            }
        }
    }

    if socket.exists() {
        let _ = fs::remove_file(&socket);
    }
    Ok(())
}

async fn handle_client<S, R, In, Out>(
    reader: In,
    mut writer: Out,
    ctx: ClientContext<S, R>,
) -> Result<(), DaemonError>
where
    S: SourceClient + 'static,
    R: ReplicaStore + RunLedger + 'static,
    In: AsyncBufRead + Unpin,
    Out: AsyncWrite + Unpin,
{
    let mut lines = reader.lines();

    while let Some(line) = lines
        .next_line()
        .await
        .map_err(|e| io_err("daemon socket read", e))?
    {
        if line.trim().is_empty() {
            continue;
        }

        let request: DaemonRequest = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(err) => {
                write_response(
                    &mut writer,
                    &DaemonResponse::error(format!("invalid request JSON: {err}")),
                )
                .await?;
                continue;
            }
        };

        let response = match request.cmd.as_str() {
            "status" => match status_payload(&ctx).await {
                Ok(payload) => DaemonResponse::ok(payload),
                Err(err) => DaemonResponse::error(err.to_string()),
            },
            "history" => {
                let limit = request.limit.unwrap_or(DEFAULT_HISTORY_LIMIT);
                let engine = ctx.engine.clone();
                match blocking(move || engine.get_recent_runs(limit)).await {
                    Ok(runs) => DaemonResponse::ok(json!(runs)),
                    Err(err) => DaemonResponse::error(err.to_string()),
                }
            }
            "sync" => queue_manual_sync(&ctx, &request).await,
            "invalidate" => invalidate(&ctx, &request).await,
            "stop" => {
                let _ = ctx.shutdown_tx.send(());
                DaemonResponse::ok(json!({ "stopping": true }))
            }
            other => DaemonResponse::error(format!("unknown command '{other}'")),
        };

        write_response(&mut writer, &response).await?;
        if request.cmd == "stop" {
            break;
        }
    }

    Ok(())
}

async fn status_payload<S, R>(ctx: &ClientContext<S, R>) -> Result<Value, DaemonError>
where
    S: SourceClient + 'static,
    R: ReplicaStore + RunLedger + 'static,
{
    let engine = ctx.engine.clone();
    let metadata = blocking(move || engine.get_status()).await?;
    let next_run = *ctx.next_run.read().await;
    Ok(json!({
        "running": true,
        "started_at": ctx.started_at,
        "next_scheduled_run": next_run,
        "socket": socket_path(&ctx.home).display().to_string(),
        "sync": metadata,
    }))
}

/// Accept a manual run and return without waiting for it. Declined up front
/// if the ledger already shows a run in progress.
async fn queue_manual_sync<S, R>(ctx: &ClientContext<S, R>, request: &DaemonRequest) -> DaemonResponse
where
    S: SourceClient + 'static,
    R: ReplicaStore + RunLedger + 'static,
{
    let scope = match request.kind.as_deref() {
        None => RunScope::Full,
        Some(kind) => match kind.parse::<EntityKind>() {
            Ok(kind) => RunScope::Kind(kind),
            Err(err) => return DaemonResponse::error(err.to_string()),
        },
    };

    let engine = ctx.engine.clone();
    match blocking(move || engine.get_status()).await {
        Ok(metadata) if metadata.sync_status == SyncStatus::Syncing => {
            return DaemonResponse::ok(json!({
                "accepted": false,
                "reason": "a sync run is already in progress",
                "run_id": metadata.run_id,
            }));
        }
        Ok(_) => {}
        Err(err) => return DaemonResponse::error(err.to_string()),
    }

    let job = SyncJob {
        scope,
        trigger: TriggerType::Manual,
        triggered_by: request.actor.clone(),
        respond_to: None,
    };
    match ctx.sync_tx.send(job).await {
        Ok(()) => DaemonResponse::ok(json!({ "accepted": true, "scope": scope.to_string() })),
        Err(_) => DaemonResponse::error(DaemonError::ChannelClosed("sync queue").to_string()),
    }
}

async fn invalidate<S, R>(ctx: &ClientContext<S, R>, request: &DaemonRequest) -> DaemonResponse
where
    S: SourceClient + 'static,
    R: ReplicaStore + RunLedger + 'static,
{
    let Some(actor) = request.actor.clone() else {
        return DaemonResponse::error("invalidate requires an actor");
    };
    let role = match request.role.as_deref().unwrap_or_default().parse::<Role>() {
        Ok(role) => role,
        Err(err) => return DaemonResponse::error(err),
    };

    let engine = ctx.engine.clone();
    match blocking(move || engine.invalidate_all(&Actor::new(actor, role))).await {
        Ok(report) => DaemonResponse::ok(json!(report)),
        Err(err) => DaemonResponse::error(err.to_string()),
    }
}

/// Run a blocking engine call off the async workers.
async fn blocking<T, E>(f: impl FnOnce() -> Result<T, E> + Send + 'static) -> Result<T, DaemonError>
where
    T: Send + 'static,
    E: Send + 'static,
    DaemonError: From<E>,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|err| DaemonError::Protocol(format!("blocking task join error: {err}")))?
        .map_err(DaemonError::from)
}

fn prepare_socket_for_bind(socket: &Path) -> Result<(), DaemonError> {
    if !socket.exists() {
        return Ok(());
    }

    match StdUnixStream::connect(socket) {
        Ok(_) => {
            return Err(DaemonError::Protocol(format!(
                "daemon socket already in use: {}",
                socket.display()
            )));
        }
        Err(err) => {
            tracing::warn!(
                socket = %socket.display(),
                error = %err,
                "removing stale daemon socket before bind",
            );
        }
    }

    match fs::remove_file(socket) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(io_err(socket, err)),
    }
}

fn ensure_runtime_dirs(home: &Path) -> Result<(), DaemonError> {
    for dir in [config::kurator_root(home), logs_dir(home)] {
        if !dir.exists() {
            fs::create_dir_all(&dir).map_err(|e| io_err(&dir, e))?;
        }
    }
    Ok(())
}

async fn write_response<W: AsyncWrite + Unpin>(
    writer: &mut W,
    response: &DaemonResponse,
) -> Result<(), DaemonError> {
    let payload = serde_json::to_string(response)?;
    writer
        .write_all(payload.as_bytes())
        .await
        .map_err(|e| io_err("daemon socket write", e))?;
    writer
        .write_all(b"\n")
        .await
        .map_err(|e| io_err("daemon socket write", e))?;
    writer
        .flush()
        .await
        .map_err(|e| io_err("daemon socket flush", e))?;
    Ok(())
}

fn handle_join(
    task: &str,
    result: Result<Result<(), DaemonError>, tokio::task::JoinError>,
) -> Result<(), DaemonError> {
    match result {
        Ok(inner) => inner,
        Err(err) => Err(DaemonError::Protocol(format!(
            "{task} task join failure: {err}"
        ))),
    }
}

/// Log to stderr and append to `<home>/.kurator/logs/daemon.log`, rotated by
/// size. Library crates log through the `log` facade, which the subscriber
/// bridges.
fn init_tracing(home: &Path) -> Result<(), DaemonError> {
    use std::sync::Mutex;
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let logs = logs_dir(home);
    fs::create_dir_all(&logs).map_err(|e| io_err(&logs, e))?;
    let path = log_path(home);
    let file = RotatingFile::open(&path, MAX_LOG_BYTES, MAX_ROTATED_FILES)
        .map_err(|e| io_err(&path, e))?;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .with(
            fmt::layer()
                .with_target(false)
                .with_ansi(false)
                .with_writer(Mutex::new(file)),
        )
        .try_init();
    Ok(())
}

#[cfg(unix)]
fn set_socket_permissions(path: &Path) -> Result<(), DaemonError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600)).map_err(|e| io_err(path, e))
}

#[cfg(not(unix))]
fn set_socket_permissions(_path: &Path) -> Result<(), DaemonError> {
    Ok(())
}
