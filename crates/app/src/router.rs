use axum::{
    body::Body,
    extract::{rejection::JsonRejection, Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use tracing::{error, info};
use uuid::Uuid;

use oncall_core::{ExternalUserId, JobId};
use oncall_storage::{Database, OrganizationError};

use crate::problem::ProblemResponse;
use crate::tasks::ProvisioningTasks;
use crate::telemetry;

#[derive(Clone)]
pub struct AppState {
    metrics: PrometheusHandle,
    storage: Database,
    tasks: ProvisioningTasks,
}

impl AppState {
    pub fn new(metrics: PrometheusHandle, storage: Database, tasks: ProvisioningTasks) -> Self {
        Self {
            metrics,
            storage,
            tasks,
        }
    }

    pub fn metrics(&self) -> &PrometheusHandle {
        &self.metrics
    }

    pub fn storage(&self) -> &Database {
        &self.storage
    }

    pub fn tasks(&self) -> &ProvisioningTasks {
        &self.tasks
    }
}

pub fn app_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .route(
            "/organizations/:uuid/notification-policies/defaults",
            post(start_default_policies),
        )
        .with_state(state)
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

async fn metrics(State(state): State<AppState>) -> Response {
    let body = telemetry::render_metrics(state.metrics());
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        Body::from(body),
    )
        .into_response()
}

#[derive(Debug, Deserialize)]
struct DefaultPoliciesRequest {
    user_ids: Vec<i64>,
}

#[derive(Debug, Serialize)]
struct DefaultPoliciesAccepted {
    job_id: JobId,
}

async fn start_default_policies(
    State(state): State<AppState>,
    Path(raw_uuid): Path<String>,
    payload: Result<Json<DefaultPoliciesRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<DefaultPoliciesAccepted>), ProblemResponse> {
    let uuid = Uuid::parse_str(&raw_uuid).map_err(|_| {
        ProblemResponse::bad_request(
            "invalid_organization_uuid",
            format!("{raw_uuid:?} is not a valid organization uuid"),
        )
    })?;
    let Json(request) = payload
        .map_err(|rejection| ProblemResponse::bad_request("invalid_body", rejection.body_text()))?;

    let organization = state
        .storage()
        .organizations()
        .fetch_by_uuid(uuid)
        .await
        .map_err(|err| match err {
            OrganizationError::NotFound => ProblemResponse::not_found(
                "organization_not_found",
                format!("no organization with uuid {uuid}"),
            ),
            other => {
                error!(stage = "http", error = %other, %uuid, "failed to load organization");
                ProblemResponse::internal("failed to load organization")
            }
        })?;

    let external_user_ids: Vec<ExternalUserId> =
        request.user_ids.into_iter().map(ExternalUserId).collect();
    let requested = external_user_ids.len();
    let job_id = state
        .tasks()
        .submit_default_policies(organization.id, external_user_ids)
        .await
        .map_err(|err| {
            error!(
                stage = "http",
                error = %err,
                organization_id = %organization.id,
                "failed to enqueue dispatch job"
            );
            ProblemResponse::internal("failed to enqueue job")
        })?;

    info!(
        stage = "http",
        organization_id = %organization.id,
        requested,
        job_id = %job_id,
        "default policy provisioning accepted"
    );
    Ok((StatusCode::ACCEPTED, Json(DefaultPoliciesAccepted { job_id })))
}
