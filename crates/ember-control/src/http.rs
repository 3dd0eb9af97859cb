//! JSON HTTP surface over the engine.

use std::{collections::BTreeMap, sync::Arc};

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::Utc;
use ember_core::{
    Agent, CharacterTransfer, Cluster, FailoverEvent, HeartbeatReport, InstallProgress, LogLine,
    Machine, Server, Task,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    cluster::{ClusterCoordinator, NewCluster, NewTransfer},
    error::ProvisionError,
    fleet::{Fleet, NewAgent, NewMachine, NewServer},
    heartbeat::HeartbeatService,
    installer::{JobHandle, JobState, Provisioner},
    metrics::MetricSample,
    store::Store,
    tasks::{NewTask, TaskQueue},
};

const MAX_MESSAGE_BYTES: usize = 1024;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub fleet: Arc<Fleet>,
    pub provisioner: Arc<Provisioner>,
    pub tasks: TaskQueue,
    pub heartbeat: HeartbeatService,
    pub clusters: Arc<ClusterCoordinator>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ApiError {
    #[serde(skip)]
    status: StatusCode,
    pub code: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub field_errors: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

fn truncate(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &s[..end])
}

impl From<ProvisionError> for ApiError {
    fn from(err: ProvisionError) -> Self {
        let code = err.code();
        let status = match &err {
            ProvisionError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ProvisionError::NotFound { .. } => StatusCode::NOT_FOUND,
            ProvisionError::ResourceConflict(_)
            | ProvisionError::NoPortsAvailable { .. }
            | ProvisionError::InvalidTransition { .. } => StatusCode::CONFLICT,
            ProvisionError::Connectivity { .. } | ProvisionError::RemoteExecution { .. } => {
                StatusCode::BAD_GATEWAY
            }
            ProvisionError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            ProvisionError::Cancelled => StatusCode::CONFLICT,
            ProvisionError::Render(_) | ProvisionError::Store(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let hint = match &err {
            ProvisionError::Connectivity { .. } | ProvisionError::Timeout { .. } => {
                Some("Check that the machine is reachable over SSH, then retry.".to_string())
            }
            ProvisionError::NoPortsAvailable { .. } => {
                Some("Free ports on the machine or choose another preferred base port.".to_string())
            }
            _ => None,
        };
        if status.is_server_error() {
            tracing::warn!(code = err.code(), error = %err, "request failed");
        }
        let (message, field_errors) = match err {
            ProvisionError::Validation(errs) => {
                ("Invalid request.".to_string(), errs.into_fields())
            }
            other => (other.to_string(), BTreeMap::new()),
        };
        ApiError {
            status,
            code,
            message: truncate(&message, MAX_MESSAGE_BYTES),
            field_errors,
            hint,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/machines", get(list_machines).post(create_machine))
        .route("/machines/:id", axum::routing::delete(delete_machine))
        .route("/machines/:id/ports/:port", get(port_availability))
        .route("/agents", post(register_agent))
        .route("/agents/:id", get(get_agent))
        .route("/agents/:id/heartbeat", post(heartbeat))
        .route("/agents/:id/metrics", get(agent_metrics))
        .route("/servers", post(create_server))
        .route("/servers/:id", get(get_server))
        .route("/servers/:id/install", post(install_server))
        .route("/servers/:id/reinstall", post(reinstall_server))
        .route("/servers/:id/job", get(job_state).delete(cancel_job))
        .route("/servers/:id/progress", get(progress))
        .route("/servers/:id/progress/log", get(progress_log))
        .route("/tasks", post(create_task))
        .route("/tasks/:id", get(get_task))
        .route("/tasks/:id/cancel", post(cancel_task))
        .route("/clusters", post(create_cluster))
        .route("/clusters/:id", get(get_cluster))
        .route("/clusters/:id/reinstall", post(reinstall_cluster))
        .route("/clusters/:id/failover", post(failover))
        .route("/clusters/:id/transfers", post(request_transfer))
        .route("/transfers/:id", get(get_transfer))
        .route("/transfers/:id/approve", post(approve_transfer))
        .route("/transfers/:id/reject", post(reject_transfer))
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct HealthzResponse {
    status: &'static str,
    version: &'static str,
}

async fn healthz() -> Json<HealthzResponse> {
    Json(HealthzResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn list_machines(State(state): State<AppState>) -> ApiResult<Json<Vec<Machine>>> {
    Ok(Json(state.fleet.list_machines().await?))
}

async fn create_machine(
    State(state): State<AppState>,
    Json(req): Json<NewMachine>,
) -> ApiResult<(StatusCode, Json<Machine>)> {
    let m = state.fleet.create_machine(req).await?;
    Ok((StatusCode::CREATED, Json(m)))
}

async fn delete_machine(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    state.fleet.delete_machine(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Serialize)]
struct PortAvailability {
    port: u16,
    available: bool,
}

async fn port_availability(
    State(state): State<AppState>,
    Path((id, port)): Path<(Uuid, u16)>,
) -> ApiResult<Json<PortAvailability>> {
    let machine = state.store.get_machine(id).await.map_err(ProvisionError::from)?;
    let available = state
        .provisioner
        .ports()
        .check_availability(&machine, port)
        .await?;
    Ok(Json(PortAvailability { port, available }))
}

async fn register_agent(
    State(state): State<AppState>,
    Json(req): Json<NewAgent>,
) -> ApiResult<(StatusCode, Json<Agent>)> {
    let a = state.fleet.register_agent(req).await?;
    Ok((StatusCode::CREATED, Json(a)))
}

async fn get_agent(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<Json<Agent>> {
    Ok(Json(state.fleet.get_agent(id).await?))
}

async fn heartbeat(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(report): Json<HeartbeatReport>,
) -> ApiResult<Json<Agent>> {
    Ok(Json(state.heartbeat.record(id, report, Utc::now()).await?))
}

#[derive(Debug, Deserialize)]
struct MetricsQuery {
    #[serde(default)]
    limit: Option<usize>,
}

async fn agent_metrics(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(q): Query<MetricsQuery>,
) -> ApiResult<Json<Vec<MetricSample>>> {
    state.fleet.get_agent(id).await?;
    let limit = q.limit.unwrap_or(60).clamp(1, 10_000);
    Ok(Json(state.heartbeat.metrics().recent(id, limit)))
}

async fn create_server(
    State(state): State<AppState>,
    Json(req): Json<NewServer>,
) -> ApiResult<(StatusCode, Json<Server>)> {
    let s = state.fleet.create_server(req).await?;
    Ok((StatusCode::CREATED, Json(s)))
}

async fn get_server(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<Json<Server>> {
    Ok(Json(state.fleet.get_server(id).await?))
}

#[derive(Debug, Default, Deserialize)]
struct InstallRequest {
    #[serde(default)]
    preferred_base_port: Option<u16>,
}

async fn install_server(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    body: Option<Json<InstallRequest>>,
) -> ApiResult<(StatusCode, Json<JobHandle>)> {
    state.fleet.get_server(id).await?;
    let req = body.map(|Json(r)| r).unwrap_or_default();
    let job = state.provisioner.spawn_install(id, req.preferred_base_port)?;
    Ok((StatusCode::ACCEPTED, Json(job)))
}

async fn reinstall_server(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<(StatusCode, Json<JobHandle>)> {
    state.fleet.get_server(id).await?;
    let job = state.provisioner.spawn_reinstall(id)?;
    Ok((StatusCode::ACCEPTED, Json(job)))
}

#[derive(Debug, Serialize)]
struct JobStatus {
    job: JobHandle,
    state: JobState,
}

async fn job_state(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<Json<JobStatus>> {
    let (job, s) = state
        .provisioner
        .jobs()
        .state(id)
        .ok_or_else(|| ApiError::from(ProvisionError::not_found("job", id)))?;
    Ok(Json(JobStatus { job, state: s }))
}

async fn cancel_job(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<StatusCode> {
    if state.provisioner.jobs().cancel(id) {
        tracing::info!(server_id = %id, "job cancellation requested");
        Ok(StatusCode::ACCEPTED)
    } else {
        Err(ApiError::from(ProvisionError::ResourceConflict(format!(
            "server {id} has no running job"
        ))))
    }
}

async fn progress(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<InstallProgress>> {
    Ok(Json(state.provisioner.progress().snapshot(id).await?))
}

#[derive(Debug, Deserialize)]
struct LogQuery {
    #[serde(default)]
    after: u64,
    #[serde(default)]
    limit: Option<u64>,
}

#[derive(Debug, Serialize)]
struct LogPage {
    lines: Vec<LogLine>,
    next: u64,
}

async fn progress_log(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(q): Query<LogQuery>,
) -> ApiResult<Json<LogPage>> {
    let lines = state
        .provisioner
        .progress()
        .read_log(id, q.after, q.limit.unwrap_or(200))
        .await?;
    let next = lines.last().map(|l| l.seq).unwrap_or(q.after);
    Ok(Json(LogPage { lines, next }))
}

async fn create_task(
    State(state): State<AppState>,
    Json(req): Json<NewTask>,
) -> ApiResult<(StatusCode, Json<Task>)> {
    let t = state.tasks.create(req).await?;
    Ok((StatusCode::CREATED, Json(t)))
}

async fn get_task(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<Json<Task>> {
    Ok(Json(state.tasks.get(id).await?))
}

async fn cancel_task(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<Json<Task>> {
    Ok(Json(state.tasks.cancel(id).await?))
}

async fn create_cluster(
    State(state): State<AppState>,
    Json(req): Json<NewCluster>,
) -> ApiResult<(StatusCode, Json<Cluster>)> {
    let c = state.clusters.create(req).await?;
    state.clusters.prepare(c.id).await?;
    Ok((StatusCode::CREATED, Json(c)))
}

#[derive(Debug, Serialize)]
struct ClusterView {
    #[serde(flatten)]
    cluster: Cluster,
    members: Vec<Uuid>,
    failovers: Vec<FailoverEvent>,
}

async fn get_cluster(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<ClusterView>> {
    let cluster = state.clusters.get(id).await?;
    let members = state.clusters.members(id).await?;
    let failovers = state
        .store
        .list_failover_events(id)
        .await
        .map_err(ProvisionError::from)?;
    Ok(Json(ClusterView {
        cluster,
        members: members.into_iter().map(|s| s.id).collect(),
        failovers,
    }))
}

async fn reinstall_cluster(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<(StatusCode, Json<Vec<JobHandle>>)> {
    let jobs = state.clusters.reinstall_cluster(id).await?;
    Ok((StatusCode::ACCEPTED, Json(jobs)))
}

#[derive(Debug, Deserialize)]
struct FailoverRequest {
    from: Uuid,
    to: Uuid,
    #[serde(default)]
    reason: Option<String>,
}

async fn failover(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<FailoverRequest>,
) -> ApiResult<Json<FailoverEvent>> {
    let reason = req.reason.unwrap_or_else(|| "operator request".to_string());
    Ok(Json(state.clusters.failover(id, req.from, req.to, &reason).await?))
}

async fn request_transfer(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<NewTransfer>,
) -> ApiResult<(StatusCode, Json<CharacterTransfer>)> {
    let t = state.clusters.request_transfer(id, req).await?;
    Ok((StatusCode::CREATED, Json(t)))
}

async fn get_transfer(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<CharacterTransfer>> {
    Ok(Json(state.clusters.get_transfer(id).await?))
}

#[derive(Debug, Deserialize)]
struct Decision {
    approver: Uuid,
}

async fn approve_transfer(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(d): Json<Decision>,
) -> ApiResult<Json<CharacterTransfer>> {
    Ok(Json(state.clusters.approve_transfer(id, d.approver).await?))
}

async fn reject_transfer(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(d): Json<Decision>,
) -> ApiResult<Json<CharacterTransfer>> {
    Ok(Json(state.clusters.reject_transfer(id, d.approver).await?))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use ember_core::{AgentStatus, ReportedState, ValidationErrors};

    use super::*;
    use crate::{
        config::CleanupPolicy,
        installer::ProvisionerSettings,
        metrics::MetricsStore,
        notifier::recording::RecordingNotifier,
        ports::PortAllocator,
        testing::{FakeExecutor, seeded_store},
    };

    async fn state() -> (AppState, Machine) {
        let (store, m) = seeded_store().await;
        let exec = FakeExecutor::new();
        let ports = Arc::new(PortAllocator::new(
            store.clone(),
            exec.clone(),
            10,
            Duration::from_secs(1),
        ));
        let provisioner = Arc::new(Provisioner::new(
            store.clone(),
            exec,
            ports,
            Arc::new(RecordingNotifier::default()),
            ProvisionerSettings {
                remote_root: "/srv/ember".into(),
                command_timeout: Duration::from_secs(5),
                install_timeout: Duration::from_secs(5),
                health_attempts: 1,
                health_interval: Duration::ZERO,
                cleanup_policy: CleanupPolicy::Warn,
            },
        ));
        let state = AppState {
            store: store.clone(),
            fleet: Arc::new(Fleet::new(store.clone())),
            tasks: TaskQueue::new(store.clone()),
            heartbeat: HeartbeatService::new(store.clone(), Arc::new(MetricsStore::new(10))),
            clusters: Arc::new(ClusterCoordinator::new(provisioner.clone())),
            provisioner,
        };
        (state, m)
    }

    #[test]
    fn validation_errors_carry_fields() {
        let mut errs = ValidationErrors::new();
        errs.add("name", "Required.");
        let api = ApiError::from(ProvisionError::Validation(errs));
        assert_eq!(api.status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(api.code, "validation_failed");
        assert_eq!(api.field_errors["name"], "Required.");

        let v = serde_json::to_value(&api).unwrap();
        assert!(v.get("hint").is_none());
        assert_eq!(v["field_errors"]["name"], "Required.");
    }

    #[test]
    fn long_messages_are_truncated() {
        let api = ApiError::from(ProvisionError::remote("install", 1, "é".repeat(2000)));
        assert_eq!(api.status, StatusCode::BAD_GATEWAY);
        assert_eq!(api.code, "remote_execution");
        assert!(api.message.len() <= MAX_MESSAGE_BYTES + "…".len());
    }

    #[test]
    fn unreachable_hosts_get_a_hint() {
        let api = ApiError::from(ProvisionError::Timeout {
            host: "10.0.0.5".into(),
            timeout_ms: 1000,
        });
        assert_eq!(api.status, StatusCode::GATEWAY_TIMEOUT);
        assert!(api.hint.is_some());
    }

    #[tokio::test]
    async fn heartbeat_then_metrics() {
        let (state, m) = state().await;
        let (_, Json(agent)) = register_agent(
            State(state.clone()),
            Json(NewAgent { machine_id: m.id }),
        )
        .await
        .unwrap();
        assert_eq!(agent.status, AgentStatus::Offline);

        let report = HeartbeatReport {
            agent_version: "0.2.0".into(),
            state: ReportedState::Ready,
            error: None,
            capabilities: vec!["systemd".into()],
            metrics: Some(ember_core::HostMetrics {
                cpu_load_1m: 0.5,
                mem_used_bytes: 1,
                mem_total_bytes: 2,
                disk_free_bytes: 3,
            }),
            ports: Vec::new(),
        };
        let Json(agent) = heartbeat(State(state.clone()), Path(agent.id), Json(report))
            .await
            .unwrap();
        assert_eq!(agent.status, AgentStatus::Online);

        let Json(samples) = agent_metrics(
            State(state),
            Path(agent.id),
            Query(MetricsQuery { limit: None }),
        )
        .await
        .unwrap();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].disk_free_bytes, 3);
    }

    #[tokio::test]
    async fn unknown_server_is_not_found() {
        let (state, _) = state().await;
        let err = install_server(State(state), Path(Uuid::new_v4()), None)
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::NOT_FOUND);
        assert_eq!(err.code, "not_found");
    }

    #[tokio::test]
    async fn cancelling_without_a_job_conflicts() {
        let (state, _) = state().await;
        let err = cancel_job(State(state), Path(Uuid::new_v4())).await.unwrap_err();
        assert_eq!(err.status, StatusCode::CONFLICT);
    }
}
