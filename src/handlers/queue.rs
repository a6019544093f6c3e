//! Handlers for all `/queue` endpoints.

use actix_web::{web, HttpResponse, Responder};
use log::error;

use crate::models::job::EnqueueRequest;
use crate::models::{queue, ApplicationState, Error};
use crate::store::JobStore;

/// Handle `GET /queue` requests to list all registered queue names.
pub async fn index(data: web::Data<ApplicationState>) -> impl Responder {
    HttpResponse::Ok().json(data.registry.names())
}

/// Handle `GET /queue/{name}` requests, returning the queue's current size and
/// settings.
pub async fn summary(
    path: web::Path<String>,
    data: web::Data<ApplicationState>,
) -> impl Responder {
    let name = path.into_inner();
    let settings = match data.registry.queue(&name) {
        Ok(handle) => handle.settings.clone(),
        Err(err) => return HttpResponse::NotFound().json(err.to_string()),
    };
    match data.registry.store().queue_size(&name).await {
        Ok(size) => HttpResponse::Ok().json(queue::Summary { size, settings }),
        Err(Error::NoSuchQueue(_)) => HttpResponse::NotFound().json("Queue not found"),
        Err(Error::RedisConnection(err)) => {
            error!("[{}] {}", &name, err);
            HttpResponse::ServiceUnavailable().json(err)
        }
        Err(err) => {
            error!("[{}] {}", &name, err);
            HttpResponse::InternalServerError().json(err.to_string())
        }
    }
}

/// Handle `GET /queue/{name}/jobs` requests, returning the queue's job ids
/// grouped by state.
pub async fn job_ids(
    path: web::Path<String>,
    data: web::Data<ApplicationState>,
) -> impl Responder {
    let name = path.into_inner();
    match data.registry.store().queue_job_ids(&name).await {
        Ok(by_state) => HttpResponse::Ok().json(by_state),
        Err(Error::NoSuchQueue(_)) => HttpResponse::NotFound().json("Queue not found"),
        Err(Error::RedisConnection(err)) => {
            error!("[{}] {}", &name, err);
            HttpResponse::ServiceUnavailable().json(err)
        }
        Err(err) => {
            error!("[{}] {}", &name, err);
            HttpResponse::InternalServerError().json(err.to_string())
        }
    }
}

/// Handle `GET /queue/{name}/events` requests, returning the queue's retained
/// lifecycle events, oldest first.
pub async fn events(path: web::Path<String>, data: web::Data<ApplicationState>) -> impl Responder {
    let name = path.into_inner();
    match data.registry.events(&name) {
        Ok(hub) => HttpResponse::Ok().json(hub.snapshot()),
        Err(err) => HttpResponse::NotFound().json(err.to_string()),
    }
}

/// Handle `POST /queue/{name}/job` requests to enqueue a new job.
pub async fn enqueue(
    path: web::Path<String>,
    json: web::Json<EnqueueRequest>,
    data: web::Data<ApplicationState>,
) -> impl Responder {
    if data.config.server.read_only {
        return HttpResponse::Forbidden().json("Server is in read-only mode");
    }
    let name = path.into_inner();
    match data.producer.enqueue(&name, json.into_inner()).await {
        Ok(handle) => HttpResponse::Created().json(handle),
        Err(Error::NoSuchQueue(_)) => HttpResponse::NotFound().json("Queue not found"),
        Err(err @ Error::Serialization(_)) | Err(err @ Error::BadRequest(_)) => {
            HttpResponse::BadRequest().json(err.to_string())
        }
        Err(Error::RedisConnection(err)) => {
            error!("[{}] {}", &name, err);
            HttpResponse::ServiceUnavailable().json(err)
        }
        Err(err) => {
            error!("[{}] {}", &name, err);
            HttpResponse::InternalServerError().json(err.to_string())
        }
    }
}
