//! Admin HTTP routes

use std::sync::Arc;

use axum::{
    Extension, Json, Router,
    extract::{Path, Request, State},
    http::header,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use courier_common::{MessageId, incoming};
use courier_delivery::{
    CircuitCommand, DeadLetterSummary, DeliveryAdmin, DeliverySnapshot, RequeueSummary,
};
use serde::Deserialize;
use serde_json::{Value, json};

use crate::{ControlAuthConfig, ControlError};

#[derive(Clone)]
struct ControlState {
    admin: Arc<dyn DeliveryAdmin>,
    auth: Arc<ControlAuthConfig>,
}

/// The authenticated operator behind a request
#[derive(Debug, Clone)]
pub struct Actor(pub String);

#[derive(Debug, Deserialize)]
struct CircuitRequest {
    state: CircuitCommand,
}

/// Build the admin routes.
///
/// Every route sits behind bearer authentication; the resolved [`Actor`] is
/// handed to the admin operations for the audit trail.
pub fn router(admin: Arc<dyn DeliveryAdmin>, auth: ControlAuthConfig) -> Router {
    if !auth.requires_auth() {
        tracing::warn!("Admin API authentication is disabled");
    }

    let state = ControlState {
        admin,
        auth: Arc::new(auth),
    };

    Router::new()
        .route("/admin/snapshot", get(snapshot))
        .route("/admin/dead-letters", get(dead_letters))
        .route("/admin/dead-letters/requeue-all", post(requeue_all))
        .route("/admin/dead-letters/{id}/requeue", post(requeue))
        .route("/admin/providers/{name}/circuit", post(set_circuit))
        .route_layer(middleware::from_fn_with_state(state.clone(), authenticate))
        .with_state(state)
}

async fn authenticate(
    State(state): State<ControlState>,
    mut request: Request,
    next: Next,
) -> Response {
    let token = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim);

    match state.auth.authenticate(token) {
        Ok(actor) => {
            incoming!(
                level = DEBUG,
                "Admin request {} {} by {actor}",
                request.method(),
                request.uri().path()
            );
            request.extensions_mut().insert(Actor(actor));
            next.run(request).await
        }
        Err(e) => {
            tracing::warn!(
                method = %request.method(),
                path = %request.uri().path(),
                error = %e,
                "Admin request rejected"
            );
            e.into_response()
        }
    }
}

async fn snapshot(State(state): State<ControlState>) -> Json<DeliverySnapshot> {
    Json(state.admin.snapshot())
}

async fn dead_letters(State(state): State<ControlState>) -> Json<Vec<DeadLetterSummary>> {
    Json(state.admin.dead_letters())
}

async fn set_circuit(
    State(state): State<ControlState>,
    Extension(Actor(actor)): Extension<Actor>,
    Path(name): Path<String>,
    Json(body): Json<CircuitRequest>,
) -> Result<Json<Value>, ControlError> {
    let circuit = state.admin.set_circuit(&actor, &name, body.state)?;
    Ok(Json(json!({ "provider": name, "state": circuit })))
}

async fn requeue(
    State(state): State<ControlState>,
    Extension(Actor(actor)): Extension<Actor>,
    Path(raw): Path<String>,
) -> Result<Json<Value>, ControlError> {
    let Ok(id) = raw.parse::<MessageId>() else {
        return Err(ControlError::InvalidId(raw));
    };
    let entry = state.admin.requeue(&actor, &id).await?;

    Ok(Json(json!({
        "id": entry.id(),
        "status": "queued",
        "next_attempt_at": entry.next_attempt_at,
    })))
}

async fn requeue_all(
    State(state): State<ControlState>,
    Extension(Actor(actor)): Extension<Actor>,
) -> Json<RequeueSummary> {
    Json(state.admin.requeue_all(&actor).await)
}
