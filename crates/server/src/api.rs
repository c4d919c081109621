//! API module for the quarry admin server.

use actix_web::{web, HttpResponse, Responder};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use quarry_core::{
    Backend, JobFilter, JobId, JobState, JobUpdate, QuarryError, QueueConfig, QueueState,
    QueueUpdate, SharedBackend, StateCounts, TimeRange,
};

/// Application state shared across handlers.
pub struct AppState {
    pub backend: SharedBackend,
}

/// Response for health check.
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

/// Generic API response.
#[derive(Serialize)]
pub struct ApiResponse {
    pub success: bool,
    pub message: String,
}

/// Query parameters for job-count statistics.
#[derive(Deserialize)]
pub struct StatsQuery {
    /// Lower `inserted_at` bound (epoch ms).
    pub since: Option<i64>,
    /// Upper `inserted_at` bound (epoch ms, exclusive).
    pub until: Option<i64>,
}

/// Response for job statistics.
#[derive(Serialize)]
pub struct StatsResponse {
    #[serde(flatten)]
    pub counts: StateCounts,
    pub total: u64,
}

/// Query parameters for the job list.
#[derive(Deserialize)]
pub struct JobsQuery {
    pub queue: Option<String>,
    pub state: Option<String>,
    pub class: Option<String>,
    #[serde(default = "default_limit")]
    pub limit: usize,
    #[serde(default)]
    pub offset: usize,
}

fn default_limit() -> usize {
    20
}

/// One queue with its configuration and per-state job counts.
#[derive(Serialize)]
pub struct QueueItem {
    pub name: String,
    pub concurrency: u32,
    pub priority: i32,
    pub paused: bool,
    pub counts: StateCounts,
}

impl QueueItem {
    fn new(config: QueueConfig, counts: StateCounts) -> Self {
        Self {
            name: config.name,
            concurrency: config.concurrency,
            priority: config.priority,
            paused: config.state == QueueState::Paused,
            counts,
        }
    }
}

/// Response for listing queues.
#[derive(Serialize)]
pub struct QueuesResponse {
    pub queues: Vec<QueueItem>,
    pub total: usize,
}

/// Configure API routes.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("")
            .route("/health", web::get().to(health))
            .service(
                web::scope("/api")
                    .route("/stats", web::get().to(stats))
                    .route("/jobs", web::get().to(list_jobs))
                    .route("/jobs/{id}", web::get().to(get_job))
                    .route("/jobs/{id}/cancel", web::post().to(cancel_job))
                    .route("/queues", web::get().to(list_queues))
                    .route("/queues/{name}/pause", web::post().to(pause_queue))
                    .route("/queues/{name}/resume", web::post().to(resume_queue)),
            ),
    );
}

/// Health check endpoint.
async fn health() -> impl Responder {
    HttpResponse::Ok().json(HealthResponse { status: "ok" })
}

/// Job counts by state, optionally bounded by insertion time.
async fn stats(state: web::Data<AppState>, query: web::Query<StatsQuery>) -> impl Responder {
    let range = TimeRange {
        since: query.since,
        until: query.until,
    };
    match state.backend.count_jobs(&range).await {
        Ok(counts) => HttpResponse::Ok().json(StatsResponse {
            counts,
            total: counts.total(),
        }),
        Err(e) => HttpResponse::InternalServerError().json(ApiResponse {
            success: false,
            message: format!("Failed to count jobs: {}", e),
        }),
    }
}

/// List jobs matching the filter, newest first.
async fn list_jobs(state: web::Data<AppState>, query: web::Query<JobsQuery>) -> impl Responder {
    let job_state = match query.state.as_deref() {
        Some(s) => match JobState::parse(s) {
            Some(state) => Some(state),
            None => {
                return HttpResponse::BadRequest().json(ApiResponse {
                    success: false,
                    message: format!("Unknown job state '{}'", s),
                });
            }
        },
        None => None,
    };

    let filter = JobFilter {
        queue: query.queue.clone(),
        state: job_state,
        class: query.class.clone(),
        limit: query.limit,
        offset: query.offset,
    };
    match state.backend.list_jobs(&filter).await {
        Ok(jobs) => HttpResponse::Ok().json(jobs),
        Err(e) => HttpResponse::InternalServerError().json(ApiResponse {
            success: false,
            message: format!("Failed to list jobs: {}", e),
        }),
    }
}

/// Fetch one job by id.
async fn get_job(state: web::Data<AppState>, path: web::Path<i64>) -> impl Responder {
    let id = JobId(path.into_inner());
    match state.backend.get_job(id).await {
        Ok(Some(job)) => HttpResponse::Ok().json(job),
        Ok(None) => HttpResponse::NotFound().json(ApiResponse {
            success: false,
            message: format!("Job {} not found", id),
        }),
        Err(e) => HttpResponse::InternalServerError().json(ApiResponse {
            success: false,
            message: format!("Failed to fetch job: {}", e),
        }),
    }
}

/// Cancel a job. A job already in a terminal state is returned
/// unchanged.
async fn cancel_job(state: web::Data<AppState>, path: web::Path<i64>) -> impl Responder {
    let id = JobId(path.into_inner());
    match state.backend.update_job(JobUpdate::canceled(id)).await {
        Ok(job) => HttpResponse::Ok().json(job),
        Err(QuarryError::NotFound(_)) => HttpResponse::NotFound().json(ApiResponse {
            success: false,
            message: format!("Job {} not found", id),
        }),
        Err(e) => HttpResponse::InternalServerError().json(ApiResponse {
            success: false,
            message: format!("Failed to cancel job: {}", e),
        }),
    }
}

/// List queue configurations with their per-state job counts.
async fn list_queues(state: web::Data<AppState>) -> impl Responder {
    let configs = match state.backend.list_queues().await {
        Ok(configs) => configs,
        Err(e) => {
            return HttpResponse::InternalServerError().json(ApiResponse {
                success: false,
                message: format!("Failed to list queues: {}", e),
            });
        }
    };
    let mut counts: HashMap<String, StateCounts> =
        state.backend.count_jobs_by_queue().await.unwrap_or_default();

    let queues: Vec<QueueItem> = configs
        .into_iter()
        .map(|config| {
            let c = counts.remove(&config.name).unwrap_or_default();
            QueueItem::new(config, c)
        })
        .collect();
    let total = queues.len();
    HttpResponse::Ok().json(QueuesResponse { queues, total })
}

async fn set_queue_state(state: &AppState, update: QueueUpdate) -> HttpResponse {
    let name = update.name.clone();
    match state.backend.update_queue(update).await {
        Ok(config) => HttpResponse::Ok().json(config),
        Err(QuarryError::Validation(_)) | Err(QuarryError::NotFound(_)) => {
            HttpResponse::NotFound().json(ApiResponse {
                success: false,
                message: format!("Queue '{}' not found", name),
            })
        }
        Err(e) => HttpResponse::InternalServerError().json(ApiResponse {
            success: false,
            message: format!("Failed to update queue: {}", e),
        }),
    }
}

/// Pause a queue: jobs accumulate but are not claimed.
async fn pause_queue(state: web::Data<AppState>, path: web::Path<String>) -> impl Responder {
    set_queue_state(&state, QueueUpdate::pause(path.into_inner())).await
}

/// Resume a paused queue.
async fn resume_queue(state: web::Data<AppState>, path: web::Path<String>) -> impl Responder {
    set_queue_state(&state, QueueUpdate::resume(path.into_inner())).await
}
