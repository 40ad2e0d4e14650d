use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetStockRequest {
    pub goods_id: i64,
    pub num: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetStockResponse {
    pub goods_id: i64,
    pub stock: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReduceStockRequest {
    pub goods_id: i64,
    pub num: i64,
    pub order_id: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackStockRequest {
    pub goods_id: i64,
    pub order_id: i64,
    pub rollback_num: i64,
}

/// Outcome of a rollback request. Rollback failures are business outcomes,
/// so they travel in this body rather than as a transport error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackStockResponse {
    pub success: bool,
    pub message: String,
}

/// Message published on the rollback topic when an order is cancelled or
/// times out. Delivery is at-least-once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackSignal {
    pub order_id: i64,
    pub goods_id: i64,
    pub num: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackReply {
    pub order_id: i64,
    pub goods_id: i64,
    pub success: bool,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl RollbackStockResponse {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

impl From<RollbackStockRequest> for RollbackSignal {
    fn from(req: RollbackStockRequest) -> Self {
        Self {
            order_id: req.order_id,
            goods_id: req.goods_id,
            num: req.rollback_num,
        }
    }
}

impl RollbackReply {
    pub fn new(signal: &RollbackSignal, response: RollbackStockResponse) -> Self {
        Self {
            order_id: signal.order_id,
            goods_id: signal.goods_id,
            success: response.success,
            message: response.message,
        }
    }
}
