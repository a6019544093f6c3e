//! Handler for the `/health` endpoint.

use actix_web::{web, HttpResponse, Responder};
use serde_json::json;

use crate::models::ApplicationState;
use crate::store::JobStore;

/// Handle `GET /health` requests, reporting whether the backing store is
/// reachable.
pub async fn index(data: web::Data<ApplicationState>) -> impl Responder {
    match data.registry.store().ping().await {
        Ok(()) => HttpResponse::Ok().json(json!({"status": "ok"})),
        Err(err) => {
            HttpResponse::ServiceUnavailable().json(json!({"status": "unavailable", "error": err.to_string()}))
        }
    }
}
