use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::Json,
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use shared::*;
use uuid::Uuid;

use crate::error::LedgerError;
use crate::ledger::{MutationOutcome, DEFAULT_ACTOR};
use crate::service::InventoryService;

pub const ACTOR_HEADER: &str = "x-actor-id";

#[derive(Clone)]
pub struct AppState {
    pub service: InventoryService,
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<i64>,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route(
            "/products/:product_id/inventory",
            get(get_inventory).post(create_inventory).patch(adjust_inventory),
        )
        .route("/products/:product_id/inventory/history", get(list_history))
        .route("/products/:product_id/inventory/reservations", post(reserve_inventory))
        .route("/products/:product_id/inventory/release", post(release_inventory))
        .route("/products/:product_id/inventory/commit", post(commit_sale))
        .route("/health", get(health_check))
        .with_state(state)
        .layer(
            tower_http::cors::CorsLayer::new()
                .allow_origin(tower_http::cors::Any)
                .allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any),
        )
}

const MAX_ACTOR_LEN: usize = 255;

fn actor(headers: &HeaderMap) -> Result<String, LedgerError> {
    let actor = headers
        .get(ACTOR_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .unwrap_or(DEFAULT_ACTOR);

    if actor.chars().count() > MAX_ACTOR_LEN {
        return Err(LedgerError::InvalidArgument(format!(
            "{} must be at most {} characters",
            ACTOR_HEADER, MAX_ACTOR_LEN
        )));
    }
    Ok(actor.to_string())
}

/// Malformed bodies are the caller's fault, so they map to 400 like other invalid input.
fn body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, LedgerError> {
    payload
        .map(|Json(value)| value)
        .map_err(|rejection| LedgerError::InvalidArgument(rejection.body_text()))
}

pub async fn create_inventory(
    State(state): State<AppState>,
    Path(product_id): Path<Uuid>,
    payload: Option<Json<InventoryPolicy>>,
) -> Result<(StatusCode, Json<InventoryResponse>), LedgerError> {
    let policy = payload.map(|Json(p)| p).unwrap_or_default();
    let record = state.service.create(product_id, policy).await?;
    Ok((StatusCode::CREATED, Json(record.to_response())))
}

pub async fn get_inventory(
    State(state): State<AppState>,
    Path(product_id): Path<Uuid>,
) -> Result<Json<InventoryResponse>, LedgerError> {
    let record = state.service.get(product_id).await?;
    Ok(Json(record.to_response()))
}

pub async fn adjust_inventory(
    State(state): State<AppState>,
    Path(product_id): Path<Uuid>,
    headers: HeaderMap,
    payload: Result<Json<AdjustInventoryRequest>, JsonRejection>,
) -> Result<Json<AdjustmentResponse>, LedgerError> {
    let request = body(payload)?;
    let response = state
        .service
        .apply_adjustment(product_id, request, actor(&headers)?)
        .await?;
    Ok(Json(response))
}

pub async fn list_history(
    State(state): State<AppState>,
    Path(product_id): Path<Uuid>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<HistoryEntryResponse>>, LedgerError> {
    let entries = state.service.history(product_id, query.limit).await?;
    Ok(Json(entries.iter().map(|e| e.to_response()).collect()))
}

pub async fn reserve_inventory(
    State(state): State<AppState>,
    Path(product_id): Path<Uuid>,
    headers: HeaderMap,
    payload: Result<Json<ReserveRequest>, JsonRejection>,
) -> Result<Json<ReservationResponse>, LedgerError> {
    let request = body(payload)?;
    let outcome = state
        .service
        .reserve(product_id, request, actor(&headers)?)
        .await?;
    Ok(Json(reservation_response(outcome)))
}

pub async fn release_inventory(
    State(state): State<AppState>,
    Path(product_id): Path<Uuid>,
    headers: HeaderMap,
    payload: Result<Json<OrderQuantityRequest>, JsonRejection>,
) -> Result<Json<ReservationResponse>, LedgerError> {
    let request = body(payload)?;
    let outcome = state
        .service
        .release(product_id, request, actor(&headers)?)
        .await?;
    Ok(Json(reservation_response(outcome)))
}

pub async fn commit_sale(
    State(state): State<AppState>,
    Path(product_id): Path<Uuid>,
    headers: HeaderMap,
    payload: Result<Json<OrderQuantityRequest>, JsonRejection>,
) -> Result<Json<SaleResponse>, LedgerError> {
    let request = body(payload)?;
    let outcome = state
        .service
        .commit_sale(product_id, request, actor(&headers)?)
        .await?;
    Ok(Json(SaleResponse {
        inventory: outcome.record.to_response(),
        sold: outcome.sold,
        backordered: outcome.backordered,
        replayed: outcome.replayed,
    }))
}

fn reservation_response(outcome: MutationOutcome) -> ReservationResponse {
    ReservationResponse {
        inventory: outcome.record.to_response(),
        reservation: outcome.reservation.map(|r| r.to_view()),
        replayed: outcome.replayed,
    }
}

pub async fn health_check() -> &'static str {
    "OK"
}
