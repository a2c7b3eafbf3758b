use axum::{Json, extract::State, response::IntoResponse};
use serde_json::json;

use crate::state::AppState;

/// `GET /status`. Always answers 200; availability is in the body.
pub async fn service_status(State(state): State<AppState>) -> impl IntoResponse {
    let status = state.product_status().await;
    let available = status.available();
    let mut body = json!({
        "status": if available { "service available" } else { "service not available" },
        "product info": status.info,
    });
    if !available {
        body["status_reason"] = json!(status.reasons);
    }
    Json(body)
}
