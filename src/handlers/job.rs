//! Handlers for all `/job` endpoints.

use actix_web::{web, HttpResponse, Responder};
use log::error;

use crate::models::{ApplicationState, Error};
use crate::store::JobStore;

/// Handle `GET /job/{id}` requests, returning the full job record.
pub async fn index(path: web::Path<u64>, data: web::Data<ApplicationState>) -> impl Responder {
    let job_id = path.into_inner();
    match data.registry.store().job(job_id).await {
        Ok(record) => HttpResponse::Ok().json(record),
        Err(err) => error_response(job_id, err),
    }
}

/// Handle `GET /job/{id}/status` requests, returning just the job's state.
pub async fn status(path: web::Path<u64>, data: web::Data<ApplicationState>) -> impl Responder {
    let job_id = path.into_inner();
    match data.registry.store().job(job_id).await {
        Ok(record) => HttpResponse::Ok().json(record.state),
        Err(err) => error_response(job_id, err),
    }
}

fn error_response(job_id: u64, err: Error) -> HttpResponse {
    match err {
        Error::NoSuchJob(_) => HttpResponse::NotFound().json("Job not found"),
        Error::RedisConnection(err) => {
            error!("[job:{}] {}", job_id, err);
            HttpResponse::ServiceUnavailable().json(err)
        }
        err => {
            error!("[job:{}] {}", job_id, err);
            HttpResponse::InternalServerError().json(err.to_string())
        }
    }
}
