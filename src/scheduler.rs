use axum::extract::State;
use axum::Json;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::Config;
use crate::error::ApiError;
use crate::models::{Job, JobStatus, NewJob, NewOrder};
use crate::schema;
use crate::snapshot::build_snapshot;
use crate::storage;
use crate::AppState;

/// Job ids are a deterministic function of the order id so that duplicate
/// deliveries of the "order archived" trigger map to the same record.
pub fn job_id_for_order(order_id: &str) -> String {
    format!("review_{}", order_id)
}

pub struct ScheduleOutcome {
    pub job_id: String,
    pub created: bool,
}

/// Reacts to a newly archived order. Inside one transaction: upserts the
/// raw document into the archive, no-ops if the job already exists, and
/// otherwise creates it together with the audit snapshot annotation.
/// The trigger is at-least-once, so the existence check is load-bearing.
pub fn schedule_review_job(
    connection: &mut SqliteConnection,
    config: &Config,
    order_id: &str,
    order: &Value,
    now: DateTime<Utc>,
) -> Result<ScheduleOutcome, diesel::result::Error> {
    use schema::review_jobs::dsl as jobs;

    let job_id = job_id_for_order(order_id);
    let snapshot = build_snapshot(order, now);
    let snapshot_json =
        serde_json::to_string(&snapshot).expect("snapshot serializes to JSON");
    let document_json = order.to_string();

    connection.transaction(|connection| {
        diesel::insert_into(schema::orders::table)
            .values(&NewOrder {
                id: order_id,
                document: &document_json,
                created_at: now.naive_utc(),
            })
            .on_conflict(schema::orders::id)
            .do_update()
            .set(schema::orders::document.eq(&document_json))
            .execute(connection)?;

        let existing = jobs::review_jobs
            .find(&job_id)
            .select(Job::as_select())
            .first(connection)
            .optional()?;

        if existing.is_some() {
            return Ok(ScheduleOutcome {
                job_id: job_id.clone(),
                created: false,
            });
        }

        let delivered_at = snapshot.delivered_at.naive_utc();
        let send_at = delivered_at + config.send_delay;
        let expires_at = send_at + config.link_ttl;

        let recipient = resolve_recipient(order);
        let user_id = resolve_user_id(order);

        let new_job = match (&recipient, &user_id) {
            (Some(recipient), Some(user_id)) => NewJob {
                id: &job_id,
                order_id,
                user_id: Some(user_id),
                recipient: Some(recipient),
                status: JobStatus::Scheduled.as_str(),
                attempts: 0,
                created_at: now.naive_utc(),
                delivered_at,
                send_at,
                expires_at,
                last_error: None,
            },
            // Without a recipient no send will ever succeed; park the job
            // as failed right away instead of burning sweep retries.
            _ => NewJob {
                id: &job_id,
                order_id,
                user_id: user_id.as_deref(),
                recipient: recipient.as_deref(),
                status: JobStatus::Failed.as_str(),
                attempts: config.max_attempts,
                created_at: now.naive_utc(),
                delivered_at,
                send_at,
                expires_at,
                last_error: Some("missing recipient email or user id"),
            },
        };

        diesel::insert_into(schema::review_jobs::table)
            .values(&new_job)
            .execute(connection)?;

        diesel::update(schema::orders::table.find(order_id))
            .set(schema::orders::snapshot.eq(&snapshot_json))
            .execute(connection)?;

        Ok(ScheduleOutcome {
            job_id: job_id.clone(),
            created: true,
        })
    })
}

fn resolve_recipient(order: &Value) -> Option<String> {
    non_empty_string(order.get("email"))
        .or_else(|| non_empty_string(order.get("customerEmail")))
        .or_else(|| non_empty_string(order.pointer("/customer/email")))
}

// User ids show up as strings or numbers depending on the archive era.
fn resolve_user_id(order: &Value) -> Option<String> {
    [
        order.get("userId"),
        order.get("customerId"),
        order.pointer("/customer/id"),
    ]
    .into_iter()
    .flatten()
    .find_map(|value| {
        non_empty_string(Some(value)).or_else(|| value.as_i64().map(|id| id.to_string()))
    })
}

fn non_empty_string(value: Option<&Value>) -> Option<String> {
    value
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .map(String::from)
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderArchivedInput {
    order_id: Option<String>,
    order: Option<Value>,
}

#[derive(Serialize)]
pub struct OrderArchivedResponse {
    ok: bool,
    created: bool,
}

pub async fn order_archived_handler(
    State(state): State<AppState>,
    Json(input): Json<OrderArchivedInput>,
) -> Result<Json<OrderArchivedResponse>, ApiError> {
    let order_id = match input.order_id.as_deref().map(str::trim) {
        Some(order_id) if !order_id.is_empty() => order_id.to_string(),
        _ => return Err(ApiError::InvalidRequest),
    };
    let order = input.order.ok_or(ApiError::InvalidRequest)?;

    let connection = &mut storage::request_connection(&state.config.database_url)?;

    let outcome = schedule_review_job(connection, &state.config, &order_id, &order, Utc::now())
        .map_err(|e| {
            log::error!("Failed to schedule review job for order {}. {}", order_id, e);
            ApiError::Internal
        })?;

    if outcome.created {
        log::info!("Scheduled review job {}.", outcome.job_id);
    } else {
        log::info!("Review job {} already exists, skipping.", outcome.job_id);
    }

    Ok(Json(OrderArchivedResponse {
        ok: true,
        created: outcome.created,
    }))
}
