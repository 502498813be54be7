use chrono::{DateTime, Utc};
use diesel::prelude::*;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::config::Config;
use crate::mailer::{Mailer, OutboundMessage};
use crate::models::{Job, JobStatus};
use crate::schema::review_jobs::dsl as jobs;
use crate::signing::LinkSigner;
use crate::storage;

#[derive(Debug, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub sent: usize,
    pub revoked: usize,
    pub retried: usize,
    pub failed: usize,
}

/// Starts the periodic sweep as a single tokio task. One task plus
/// `MissedTickBehavior::Delay` means sweeps can never overlap, which the
/// lifecycle design requires.
pub fn spawn_sweep_loop(
    config: Arc<Config>,
    signer: Arc<LinkSigner>,
    mailer: Arc<dyn Mailer>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker =
            tokio::time::interval(Duration::from_secs(config.sweep_interval_secs));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;

            let mut connection = match storage::establish_connection(&config.database_url) {
                Ok(connection) => connection,
                Err(e) => {
                    log::error!("Sweep skipped, cannot open database connection. {}", e);
                    continue;
                }
            };

            match sweep_once(&mut connection, &config, &signer, mailer.as_ref(), Utc::now()) {
                Ok(stats) => {
                    if stats != SweepStats::default() {
                        log::info!(
                            "Sweep done: {} sent, {} revoked, {} retried, {} failed.",
                            stats.sent,
                            stats.revoked,
                            stats.retried,
                            stats.failed
                        );
                    }
                }
                Err(e) => log::error!("Sweep failed to load due jobs. {}", e),
            }
        }
    })
}

/// Processes one batch of due jobs. Jobs are independent: a failure on one
/// is recorded on its own row and the batch moves on.
pub fn sweep_once(
    connection: &mut SqliteConnection,
    config: &Config,
    signer: &LinkSigner,
    mailer: &dyn Mailer,
    now: DateTime<Utc>,
) -> Result<SweepStats, diesel::result::Error> {
    let due: Vec<Job> = jobs::review_jobs
        .select(Job::as_select())
        .filter(jobs::status.eq(JobStatus::Scheduled.as_str()))
        .filter(jobs::send_at.le(now.naive_utc()))
        .order(jobs::send_at.asc())
        .limit(config.sweep_batch_size)
        .load(connection)?;

    let mut stats = SweepStats::default();

    for job in due {
        let recipient = match required_fields(&job) {
            Ok(recipient) => recipient,
            Err(reason) => {
                record_failure(connection, config, &job, &reason, &mut stats);
                continue;
            }
        };

        let expires_at_millis = job.expires_at.and_utc().timestamp_millis();

        // Matured past expiry without ever being sent.
        if now.timestamp_millis() > expires_at_millis {
            match mark_revoked(connection, &job.id) {
                Ok(_) => {
                    stats.revoked += 1;
                    log::info!("Revoked review job {}, expired before dispatch.", job.id);
                }
                Err(e) => log::error!("Failed to revoke job {}. {}", job.id, e),
            }
            continue;
        }

        let signature = signer.sign(&job.id, expires_at_millis);
        let message = compose_invitation(config, &job, recipient, &signature);

        match mailer.send(&message) {
            Ok(()) => match mark_sent(connection, &job.id, now) {
                Ok(_) => {
                    stats.sent += 1;
                    log::info!("Sent review invitation for job {}.", job.id);
                }
                Err(e) => log::error!("Failed to mark job {} as sent. {}", job.id, e),
            },
            Err(e) => record_failure(connection, config, &job, &e.to_string(), &mut stats),
        }
    }

    Ok(stats)
}

fn required_fields(job: &Job) -> Result<&str, String> {
    if job.order_id.trim().is_empty() {
        return Err(String::from("job has no order id"));
    }

    match job.user_id.as_deref().map(str::trim) {
        Some(user_id) if !user_id.is_empty() => {}
        _ => return Err(String::from("job has no user id")),
    }

    match job.recipient.as_deref().map(str::trim) {
        Some(recipient) if !recipient.is_empty() => Ok(recipient),
        _ => Err(String::from("job has no recipient address")),
    }
}

fn compose_invitation(
    config: &Config,
    job: &Job,
    recipient: &str,
    signature: &str,
) -> OutboundMessage {
    let link = format!(
        "{}/review-link?token={}&sig={}",
        config.public_base_url.trim_end_matches('/'),
        job.id,
        signature
    );

    OutboundMessage {
        to: recipient.to_string(),
        subject: String::from("How was your order?"),
        text: format!(
            "Thanks for your purchase! Tell us how it went: {}",
            link
        ),
        html: format!(
            "<p>Thanks for your purchase!</p><p><a href=\"{}\">Rate your order</a></p>",
            link
        ),
    }
}

fn mark_sent(
    connection: &mut SqliteConnection,
    job_id: &str,
    now: DateTime<Utc>,
) -> QueryResult<usize> {
    diesel::update(jobs::review_jobs.find(job_id))
        .set((
            jobs::status.eq(JobStatus::Sent.as_str()),
            jobs::sent_at.eq(Some(now.naive_utc())),
            jobs::last_error.eq(None::<String>),
        ))
        .execute(connection)
}

fn mark_revoked(connection: &mut SqliteConnection, job_id: &str) -> QueryResult<usize> {
    diesel::update(jobs::review_jobs.find(job_id))
        .set(jobs::status.eq(JobStatus::Revoked.as_str()))
        .execute(connection)
}

// Validation and dispatch failures count the same toward the retry
// ceiling; a job that keeps failing lands in the terminal failed state
// after max_attempts tries.
fn record_failure(
    connection: &mut SqliteConnection,
    config: &Config,
    job: &Job,
    reason: &str,
    stats: &mut SweepStats,
) {
    let attempts = job.attempts + 1;
    let status = if attempts >= config.max_attempts {
        JobStatus::Failed
    } else {
        JobStatus::Scheduled
    };

    let result = diesel::update(jobs::review_jobs.find(&job.id))
        .set((
            jobs::attempts.eq(attempts),
            jobs::status.eq(status.as_str()),
            jobs::last_error.eq(Some(reason)),
        ))
        .execute(connection);

    match result {
        Ok(_) if status == JobStatus::Failed => {
            stats.failed += 1;
            log::error!(
                "Review job {} failed permanently after {} attempts: {}",
                job.id,
                attempts,
                reason
            );
        }
        Ok(_) => {
            stats.retried += 1;
            log::warn!(
                "Review job {} dispatch failed (attempt {}): {}",
                job.id,
                attempts,
                reason
            );
        }
        Err(e) => log::error!("Failed to record failure on job {}. {}", job.id, e),
    }
}
