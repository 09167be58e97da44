use std::sync::Arc;

use actix_web::{
    web, App, HttpResponse, HttpServer,
};
use chrono::Utc;
use log::{
    error, info
};
use serde_json::json;

use crate::{
    broker::Broker,
    config::Config,
    error::IntakeError,
    intake,
    job::JobRequest,
    process,
};

const ENDPOINTS: [&str; 6] = ["/", "/health", "/info", "/process", "/jobs", "/jobs/{id}"];

#[derive(Clone)]
pub struct AppState {
    pub broker: Arc<dyn Broker>,
    pub config: Arc<Config>,
}

async fn health(state: web::Data<AppState>) -> HttpResponse {
    match state.broker.ping().await {
        Ok(()) => HttpResponse::Ok().json(json!({
            "status": "healthy",
            "service": state.config.service_name,
            "timestamp": Utc::now().to_rfc3339(),
            "broker": "connected",
        })),

        Err(e) => HttpResponse::ServiceUnavailable().json(json!({
            "status": "unhealthy",
            "service": state.config.service_name,
            "timestamp": Utc::now().to_rfc3339(),
            "broker": "disconnected",
            "error": e.to_string(),
        })),
    }
}

async fn info(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(json!({
        "service": state.config.service_name,
        "endpoints": ENDPOINTS,
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn process_inline(
    state: web::Data<AppState>,
    req: web::Json<JobRequest>,
) -> HttpResponse {
    match process::process_now(state.broker.as_ref(), &state.config, &req).await {
        Ok(resp) => HttpResponse::Ok().json(resp),
        Err(e) => HttpResponse::BadRequest().json(json!({ "error": e.to_string() })),
    }
}

async fn submit_job(
    state: web::Data<AppState>,
    body: String,
) -> HttpResponse {
    match intake::submit_raw(state.broker.as_ref(), &state.config, &body, "/jobs").await {
        Ok(job_id) => HttpResponse::Accepted().json(json!({
            "request_id": job_id,
            "status": "queued",
            "message": "Request accepted for processing",
            "check_status": format!("/jobs/{job_id}"),
        })),

        Err(IntakeError::Invalid(e)) => HttpResponse::BadRequest().json(json!({
            "status": "error",
            "error": e.to_string(),
        })),

        Err(IntakeError::Store(e)) => {
            error!("Failed to queue request: `{e}`");
            HttpResponse::ServiceUnavailable().json(json!({
                "status": "error",
                "error": "Failed to queue request",
                "message": e.to_string(),
            }))
        },
    }
}

async fn job_status(
    state: web::Data<AppState>,
    job_id: web::Path<String>,
) -> HttpResponse {
    let job_id = job_id.into_inner();
    match intake::status(state.broker.as_ref(), &state.config, &job_id).await {
        Ok(Some(view)) => HttpResponse::Ok().json(view),

        Ok(None) => HttpResponse::NotFound().json(json!({
            "error": "Request not found",
            "request_id": job_id,
        })),

        Err(e) => HttpResponse::ServiceUnavailable().json(json!({
            "error": "Failed to fetch request status",
            "message": e.to_string(),
        })),
    }
}

pub fn routes(cfg: &mut web::ServiceConfig) {
    cfg
        .route("/", web::get().to(info))
        .route("/info", web::get().to(info))
        .route("/health", web::get().to(health))
        .route("/process", web::post().to(process_inline))
        .route("/jobs", web::post().to(submit_job))
        .route("/jobs/{id}", web::get().to(job_status));
}

// returns once the server has stopped, which happens on SIGINT/SIGTERM
pub async fn startup(state: AppState) -> std::io::Result<()> {
    let host = state.config.http.host.clone();
    let port = state.config.http.port;
    let workers = state.config.http.workers.max(1);
    let app_state = web::Data::new(state);

    info!("Starting HTTP server at {host}:{port}");
    HttpServer::new(move || {
        App::new()
            .wrap(actix_web::middleware::Logger::default())
            .app_data(app_state.clone())
            .configure(routes)
    })
    .bind((host, port))?
    .workers(workers)
    .run()
    .await
}
