//! Handler for the `/info` endpoint.

use actix_web::{web, HttpResponse, Responder};
use log::error;

use crate::models::{ApplicationState, Error};
use crate::store::JobStore;

/// Handle `GET /info` requests, returning per-queue job counts and lifetime
/// statistics.
pub async fn index(data: web::Data<ApplicationState>) -> impl Responder {
    match data.registry.store().server_info().await {
        Ok(info) => HttpResponse::Ok().json(info),
        Err(Error::RedisConnection(err)) => {
            error!("Failed to fetch server info: {}", err);
            HttpResponse::ServiceUnavailable().json(err)
        }
        Err(err) => {
            error!("Failed to fetch server info: {}", err);
            HttpResponse::InternalServerError().json(err.to_string())
        }
    }
}
