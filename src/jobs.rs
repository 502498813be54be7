use axum::extract::State;
use axum::Json;
use chrono::NaiveDateTime;
use diesel::prelude::*;
use serde::Serialize;

use crate::error::ApiError;
use crate::models::Job;
use crate::storage;
use crate::AppState;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct JobDto {
    id: String,
    order_id: String,
    recipient: Option<String>,
    status: String,
    attempts: i32,
    send_at: NaiveDateTime,
    expires_at: NaiveDateTime,
    sent_at: Option<NaiveDateTime>,
    used_at: Option<NaiveDateTime>,
    last_error: Option<String>,
}

fn transform_job(job: Job) -> JobDto {
    JobDto {
        id: job.id,
        order_id: job.order_id,
        recipient: job.recipient,
        status: job.status,
        attempts: job.attempts,
        send_at: job.send_at,
        expires_at: job.expires_at,
        sent_at: job.sent_at,
        used_at: job.used_at,
        last_error: job.last_error,
    }
}

#[derive(Serialize)]
pub struct ListJobsResponse {
    jobs: Vec<JobDto>,
}

pub async fn list_jobs_handler(
    State(state): State<AppState>,
) -> Result<Json<ListJobsResponse>, ApiError> {
    use crate::schema::review_jobs::dsl as jobs;

    let connection = &mut storage::request_connection(&state.config.database_url)?;

    let results = jobs::review_jobs
        .select(Job::as_select())
        .order(jobs::created_at.desc())
        .load(connection);

    match results {
        Ok(jobs) => {
            let jobs = jobs.into_iter().map(transform_job).collect();

            Ok(Json(ListJobsResponse { jobs }))
        }
        Err(e) => {
            log::error!("Failed to fetch review jobs. {}", e);

            Err(ApiError::Internal)
        }
    }
}
