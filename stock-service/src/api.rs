use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, post, put},
    Router,
};
use diesel::result::{DatabaseErrorKind, Error as DieselError};
use shared::*;

use crate::compensation::CompensationHandler;
use crate::engine::ReservationEngine;
use crate::error::StockError;
use crate::store::StockStore;

#[derive(Clone)]
pub struct AppState<S> {
    pub engine: ReservationEngine<S>,
    pub compensation: CompensationHandler<S>,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

pub fn create_router<S: StockStore>(state: AppState<S>) -> Router {
    Router::new()
        .route("/stock", put(set_stock::<S>))
        .route("/stock/:goods_id", get(get_stock::<S>))
        .route("/stock/reduce", post(reduce_stock::<S>))
        .route("/stock/rollback", post(rollback_stock::<S>))
        .route("/health", get(health_check))
        .with_state(state)
        .layer(
            tower_http::cors::CorsLayer::new()
                .allow_origin(tower_http::cors::Any)
                .allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any),
        )
}

pub async fn set_stock<S: StockStore>(
    State(state): State<AppState<S>>,
    Json(request): Json<SetStockRequest>,
) -> Result<StatusCode, ApiError> {
    if request.goods_id <= 0 {
        return Err(reject("invalid goods id"));
    }
    if request.num < 0 {
        return Err(reject("stock cannot be negative"));
    }

    state
        .engine
        .set_stock(request.goods_id, request.num)
        .await
        .map_err(|e| {
            tracing::error!(goods_id = request.goods_id, num = request.num, error = %e, "SetStock failed");
            error_response(&e)
        })?;

    Ok(StatusCode::NO_CONTENT)
}

pub async fn get_stock<S: StockStore>(
    State(state): State<AppState<S>>,
    Path(goods_id): Path<i64>,
) -> Result<Json<GetStockResponse>, ApiError> {
    if goods_id <= 0 {
        return Err(reject("invalid goods id"));
    }

    let entry = state.engine.get_stock(goods_id).await.map_err(|e| {
        tracing::error!(goods_id, error = %e, "GetStock failed");
        error_response(&e)
    })?;

    Ok(Json(GetStockResponse {
        goods_id: entry.goods_id,
        stock: entry.total_stock,
    }))
}

pub async fn reduce_stock<S: StockStore>(
    State(state): State<AppState<S>>,
    Json(request): Json<ReduceStockRequest>,
) -> Result<StatusCode, ApiError> {
    if request.goods_id <= 0 || request.num <= 0 {
        return Err(reject("invalid goods id or quantity"));
    }

    state
        .engine
        .reserve(request.goods_id, request.num, request.order_id)
        .await
        .map_err(|e| error_response(&e))?;

    Ok(StatusCode::NO_CONTENT)
}

pub async fn rollback_stock<S: StockStore>(
    State(state): State<AppState<S>>,
    Json(request): Json<RollbackStockRequest>,
) -> Json<RollbackStockResponse> {
    if request.goods_id <= 0 || request.rollback_num <= 0 {
        return Json(RollbackStockResponse::failed(
            "invalid goods id or rollback quantity",
        ));
    }

    let signal = RollbackSignal::from(request);
    Json(state.compensation.handle_signal(&signal, 0).await)
}

pub async fn health_check() -> &'static str {
    "OK"
}

fn reject(message: &str) -> ApiError {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorResponse {
            error: message.to_string(),
        }),
    )
}

fn error_response(err: &StockError) -> ApiError {
    let status = match err {
        StockError::Validation(_) => StatusCode::BAD_REQUEST,
        StockError::GoodsNotFound(_) => StatusCode::NOT_FOUND,
        StockError::InsufficientStock { .. }
        | StockError::DuplicateReservation { .. }
        | StockError::Database(DieselError::DatabaseError(DatabaseErrorKind::CheckViolation, _)) => {
            StatusCode::CONFLICT
        }
        StockError::LockAcquisitionFailed { .. }
        | StockError::LockNotHeld { .. }
        | StockError::LockExpired { .. }
        | StockError::LockBackend(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(ErrorResponse {
            error: err.to_string(),
        }),
    )
}
