//! Custom handler HTTP surface: one POST route per function, named as the
//! Functions host addresses it.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use std::sync::Arc;
use tracing::{error, info};

use crate::clients::Clients;
use crate::config::Config;
use crate::events::{InvokeRequest, InvokeResponse};
use crate::Error;

#[derive(Clone)]
pub struct AppState {
    pub clients: Clients,
    pub config: Arc<Config>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/Telemetry_Processor", post(telemetry_handler))
        .route(
            "/DigitalTwin_EventGrid_Processor",
            post(event_grid_handler),
        )
        .route("/Dps_Processor", post(dps_handler))
        .route("/negotiate", post(negotiate_handler))
        .route("/SignalR_Test", post(signalr_test_handler))
        .with_state(state)
}

/// A failed invocation is reported to the host as a 500 carrying the error
/// in its logs, which fails the function execution.
fn respond(function: &str, result: Result<InvokeResponse, Error>) -> Response {
    match result {
        Ok(response) => (StatusCode::OK, Json(response)).into_response(),
        Err(e) => {
            error!("{} failed: {}", function, e);
            let response = InvokeResponse::default().log(format!("{} failed: {}", function, e));
            (StatusCode::INTERNAL_SERVER_ERROR, Json(response)).into_response()
        }
    }
}

async fn telemetry_handler(State(state): State<AppState>, Json(request): Json<InvokeRequest>) -> Response {
    info!("Handling Telemetry_Processor invocation");
    respond(
        "Telemetry_Processor",
        crate::telemetry::handle(&state.clients, &state.config, request).await,
    )
}

async fn event_grid_handler(State(state): State<AppState>, Json(request): Json<InvokeRequest>) -> Response {
    info!("Handling DigitalTwin_EventGrid_Processor invocation");
    respond(
        "DigitalTwin_EventGrid_Processor",
        crate::maps::handle(&state.clients, &state.config, request).await,
    )
}

async fn dps_handler(State(state): State<AppState>, Json(request): Json<InvokeRequest>) -> Response {
    info!("Handling Dps_Processor invocation");
    respond("Dps_Processor", crate::dps::handle(&state.clients, request).await)
}

async fn negotiate_handler(Json(request): Json<InvokeRequest>) -> Response {
    respond("negotiate", crate::signalr::negotiate(request).await)
}

async fn signalr_test_handler(Json(request): Json<InvokeRequest>) -> Response {
    respond("SignalR_Test", crate::signalr::test_message(request).await)
}
