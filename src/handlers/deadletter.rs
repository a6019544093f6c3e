//! Handlers for all `/deadletter` endpoints.

use actix_web::{web, HttpResponse, Responder};
use log::error;

use crate::models::{ApplicationState, Error};

/// Handle `GET /deadletter` requests, returning dead-letter queue job ids
/// grouped by state.
pub async fn index(data: web::Data<ApplicationState>) -> impl Responder {
    match data.dead_letter.jobs().await {
        Ok(by_state) => HttpResponse::Ok().json(by_state),
        Err(Error::RedisConnection(err)) => {
            error!("{}", err);
            HttpResponse::ServiceUnavailable().json(err)
        }
        Err(err) => {
            error!("{}", err);
            HttpResponse::InternalServerError().json(err.to_string())
        }
    }
}

/// Handle `POST /deadletter/{id}/replay` requests, re-enqueueing a dead-letter
/// copy onto its original queue.
pub async fn replay(path: web::Path<u64>, data: web::Data<ApplicationState>) -> impl Responder {
    if data.config.server.read_only {
        return HttpResponse::Forbidden().json("Server is in read-only mode");
    }
    let job_id = path.into_inner();
    match data.dead_letter.replay(job_id).await {
        Ok(handle) => HttpResponse::Ok().json(handle),
        Err(Error::NoSuchJob(_)) => HttpResponse::NotFound().json("Job not found"),
        Err(err @ Error::BadRequest(_)) => HttpResponse::BadRequest().json(err.to_string()),
        Err(err @ Error::NoSuchQueue(_)) => HttpResponse::Conflict().json(err.to_string()),
        Err(Error::RedisConnection(err)) => {
            error!("[job:{}] {}", job_id, err);
            HttpResponse::ServiceUnavailable().json(err)
        }
        Err(err) => {
            error!("[job:{}] {}", job_id, err);
            HttpResponse::InternalServerError().json(err.to_string())
        }
    }
}
