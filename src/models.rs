// src/models.rs

use crate::schema::{orders, review_jobs, reviews};
use chrono::NaiveDateTime;

/// Lifecycle of a review invitation job. Transitions only move forward:
/// scheduled -> sent -> used, or scheduled -> revoked / failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Scheduled,
    Sent,
    Used,
    Revoked,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Scheduled => "scheduled",
            JobStatus::Sent => "sent",
            JobStatus::Used => "used",
            JobStatus::Revoked => "revoked",
            JobStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<JobStatus> {
        match value {
            "scheduled" => Some(JobStatus::Scheduled),
            "sent" => Some(JobStatus::Sent),
            "used" => Some(JobStatus::Used),
            "revoked" => Some(JobStatus::Revoked),
            "failed" => Some(JobStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Used | JobStatus::Revoked | JobStatus::Failed)
    }
}

#[derive(Queryable, Selectable)]
#[diesel(table_name = review_jobs)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct Job {
    pub id: String,
    pub order_id: String,
    pub user_id: Option<String>,
    pub recipient: Option<String>,
    pub status: String,
    pub attempts: i32,
    pub created_at: NaiveDateTime,
    pub delivered_at: NaiveDateTime,
    pub send_at: NaiveDateTime,
    pub expires_at: NaiveDateTime,
    pub sent_at: Option<NaiveDateTime>,
    pub used_at: Option<NaiveDateTime>,
    pub last_error: Option<String>,
}

#[derive(Insertable)]
#[diesel(table_name = review_jobs)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct NewJob<'a> {
    pub id: &'a str,
    pub order_id: &'a str,
    pub user_id: Option<&'a str>,
    pub recipient: Option<&'a str>,
    pub status: &'a str,
    pub attempts: i32,
    pub created_at: NaiveDateTime,
    pub delivered_at: NaiveDateTime,
    pub send_at: NaiveDateTime,
    pub expires_at: NaiveDateTime,
    pub last_error: Option<&'a str>,
}

#[derive(Queryable, Selectable)]
#[diesel(table_name = reviews)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct Review {
    pub id: String,
    pub order_id: String,
    pub user_id: Option<String>,
    pub rating: i32,
    pub comment: Option<String>,
    pub source: String,
    pub created_at: NaiveDateTime,
}

#[derive(Insertable)]
#[diesel(table_name = reviews)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct NewReview<'a> {
    pub id: &'a str,
    pub order_id: &'a str,
    pub user_id: Option<&'a str>,
    pub rating: i32,
    pub comment: Option<&'a str>,
    pub source: &'a str,
    pub created_at: NaiveDateTime,
}

#[derive(Queryable, Selectable)]
#[diesel(table_name = orders)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct ArchivedOrder {
    pub id: String,
    pub document: String,
    pub snapshot: Option<String>,
    pub review_submitted_at: Option<NaiveDateTime>,
    pub created_at: NaiveDateTime,
}

#[derive(Insertable)]
#[diesel(table_name = orders)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct NewOrder<'a> {
    pub id: &'a str,
    pub document: &'a str,
    pub created_at: NaiveDateTime,
}
