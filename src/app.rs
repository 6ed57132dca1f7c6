//! HTTP routes of the operator service.

use crate::app_state::{AppState, SharedAppState};
use crate::cli::CommandLineArgs;
use crate::engine::PROTOCOL_VERSION;
use crate::error::CubeError;
use crate::metrics::{metrics_handler, record_response_metrics, request_counter};
use crate::models;
use crate::operators::{self, OPERATORS};
use crate::report::Report;
use crate::validated_json::ValidatedJson;

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use tower::Layer;
use tower_http::normalize_path::{NormalizePath, NormalizePathLayer};
use tower_http::trace::TraceLayer;

/// [axum::Router] wrapped in a trailing slash normaliser
pub type Service = NormalizePath<Router>;

/// Returns a [axum::Router] with all routes of the service.
///
/// # Arguments
///
/// * `state`: Shared application state
fn router(state: SharedAppState) -> Router {
    fn v1() -> Router<SharedAppState> {
        Router::new()
            .route("/operators", get(list_operators))
            .route("/:operator", post(invoke))
    }

    Router::new()
        .route("/.well-known/cubeops-schema", get(schema))
        .route("/metrics", get(metrics_handler))
        .nest("/v1", v1())
        .layer(
            TraceLayer::new_for_http()
                .on_request(request_counter)
                .on_response(record_response_metrics),
        )
        .with_state(state)
}

/// Returns the service, with registered storage servers and an empty catalog.
///
/// # Arguments
///
/// * `args`: Command line arguments
pub async fn service(args: &CommandLineArgs) -> Service {
    let state = Arc::new(AppState::new(args).await);
    NormalizePathLayer::trim_trailing_slash().layer(router(state))
}

async fn schema() -> Json<Value> {
    Json(json!({
        "version": PROTOCOL_VERSION,
        "operators": OPERATORS,
        "request": {
            "params": "object of string parameters",
            "workers": "optional number of workers, 1 to 1024",
        },
        "statuses": [
            "SUCCESS",
            "UTILITY_ERROR",
            "INVALID_PARAM",
            "MEMORY_ERR",
            "CATALOG_ERROR",
            "NULL_OPERATOR_HANDLE",
        ],
    }))
}

async fn list_operators() -> Json<&'static [&'static str]> {
    Json(OPERATORS)
}

/// Run an operator invocation to completion.
///
/// # Arguments
///
/// * `state`: Shared application state
/// * `operator`: Operator name from the path
/// * `request`: Operator parameters and worker count
async fn invoke(
    State(state): State<SharedAppState>,
    Path(operator): Path<String>,
    ValidatedJson(request): ValidatedJson<models::InvocationRequest>,
) -> Result<Report, CubeError> {
    let workers = request
        .workers
        .unwrap_or_else(|| state.args.default_workers());
    operators::invoke(&operator, request.params, workers, &state.backends).await
}
