use axum::extract::{Query, State};
use axum::Json;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ApiError;
use crate::models::{ArchivedOrder, Job, JobStatus, NewReview, Review};
use crate::schema;
use crate::signing::LinkSigner;
use crate::snapshot::{build_snapshot, SnapshotItem};
use crate::storage;
use crate::AppState;

pub struct VerifiedLink {
    pub job: Job,
    pub order: ArchivedOrder,
}

/// Loads the job for a token and authenticates the presented signature
/// against the job's own stored expiry, compared in constant time. This
/// runs on every request, including replayed submissions: a token alone
/// is never proof of anything.
fn authenticate_token(
    connection: &mut SqliteConnection,
    signer: &LinkSigner,
    token: &str,
    signature: &str,
) -> Result<Job, ApiError> {
    use schema::review_jobs::dsl as jobs;

    let job: Option<Job> = jobs::review_jobs
        .find(token)
        .select(Job::as_select())
        .first(connection)
        .optional()
        .map_err(|e| {
            log::error!("Failed to load review job {}. {}", token, e);
            ApiError::Internal
        })?;

    let Some(job) = job else {
        return Err(ApiError::NotFound);
    };

    let expires_at_millis = job.expires_at.and_utc().timestamp_millis();

    if !signer.verify(token, expires_at_millis, signature) {
        log::warn!("Signature mismatch for review job {}.", token);
        return Err(ApiError::InvalidSignature);
    }

    Ok(job)
}

/// Redemption gates for an authenticated job: not in a terminal unusable
/// state, not expired, and the archive record must still exist (fail
/// closed).
fn check_redeemable(
    connection: &mut SqliteConnection,
    job: &Job,
    now: DateTime<Utc>,
) -> Result<ArchivedOrder, ApiError> {
    // Unknown status strings are treated like terminal ones.
    match JobStatus::parse(&job.status) {
        Some(JobStatus::Used) | Some(JobStatus::Revoked) | None => {
            return Err(ApiError::NotAllowed);
        }
        Some(_) => {}
    }

    if now.timestamp_millis() > job.expires_at.and_utc().timestamp_millis() {
        return Err(ApiError::Expired);
    }

    use schema::orders::dsl as orders;

    let order: Option<ArchivedOrder> = orders::orders
        .find(&job.order_id)
        .select(ArchivedOrder::as_select())
        .first(connection)
        .optional()
        .map_err(|e| {
            log::error!("Failed to load archived order {}. {}", job.order_id, e);
            ApiError::Internal
        })?;

    let Some(order) = order else {
        return Err(ApiError::NotFound);
    };

    Ok(order)
}

/// Checks an externally presented (token, signature) pair against stored
/// state. Callers never get to skip this: the submission path re-runs it
/// inside its transaction because the job may have changed since any
/// earlier preview read.
pub fn verify_link(
    connection: &mut SqliteConnection,
    signer: &LinkSigner,
    token: &str,
    signature: &str,
    now: DateTime<Utc>,
) -> Result<VerifiedLink, ApiError> {
    let job = authenticate_token(connection, signer, token, signature)?;
    let order = check_redeemable(connection, &job, now)?;

    Ok(VerifiedLink { job, order })
}

pub enum SubmitFailure {
    Api(ApiError),
    Db(diesel::result::Error),
}

impl From<diesel::result::Error> for SubmitFailure {
    fn from(e: diesel::result::Error) -> SubmitFailure {
        SubmitFailure::Db(e)
    }
}

/// Finalizes a review exactly once. Authenticates and re-checks state
/// inside the transaction, then writes the review, the terminal `used`
/// transition and the archive stamp together. A replay with the same
/// token and a valid signature is a successful no-op. Returns whether a
/// new review was written.
pub fn submit_review(
    connection: &mut SqliteConnection,
    signer: &LinkSigner,
    token: &str,
    signature: &str,
    rating: i32,
    comment: Option<&str>,
    now: DateTime<Utc>,
) -> Result<bool, SubmitFailure> {
    connection.transaction(|connection| {
        // Authentication always runs, replay or not; a retried request
        // still has to present the original valid signature.
        let job = authenticate_token(connection, signer, token, signature)
            .map_err(SubmitFailure::Api)?;

        use schema::reviews::dsl as reviews;

        // The redemption gates are skipped only for replays: after the
        // first successful submission the job is terminal, so a retried
        // request would otherwise bounce off the status check instead of
        // succeeding as a no-op.
        let existing: Option<Review> = reviews::reviews
            .find(token)
            .select(Review::as_select())
            .first(connection)
            .optional()?;

        if existing.is_some() {
            return Ok(false);
        }

        check_redeemable(connection, &job, now).map_err(SubmitFailure::Api)?;

        diesel::insert_into(schema::reviews::table)
            .values(&NewReview {
                id: token,
                order_id: &job.order_id,
                user_id: job.user_id.as_deref(),
                rating,
                comment,
                source: "review_link",
                created_at: now.naive_utc(),
            })
            .execute(connection)?;

        use schema::review_jobs::dsl as jobs;

        diesel::update(jobs::review_jobs.find(token))
            .set((
                jobs::status.eq(JobStatus::Used.as_str()),
                jobs::used_at.eq(Some(now.naive_utc())),
                jobs::last_error.eq(None::<String>),
            ))
            .execute(connection)?;

        use schema::orders::dsl as orders;

        diesel::update(orders::orders.find(&job.order_id))
            .set(orders::review_submitted_at.eq(Some(now.naive_utc())))
            .execute(connection)?;

        Ok(true)
    })
}

#[derive(Deserialize)]
pub struct ReviewLinkQuery {
    token: Option<String>,
    sig: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewLinkResponse {
    ok: bool,
    order_id: String,
    delivered_at: DateTime<Utc>,
    items: Vec<SnapshotItem>,
    total: f64,
    currency: String,
}

pub async fn review_link_handler(
    State(state): State<AppState>,
    Query(query): Query<ReviewLinkQuery>,
) -> Result<Json<ReviewLinkResponse>, ApiError> {
    let token = required(query.token.as_deref())?;
    let signature = required(query.sig.as_deref())?;

    let connection = &mut storage::request_connection(&state.config.database_url)?;
    let verified = verify_link(connection, &state.signer, token, signature, Utc::now())?;

    // The stored snapshot column is audit-only; rebuild from the raw
    // document so verification never trusts a stale copy.
    let document: Value = serde_json::from_str(&verified.order.document).map_err(|e| {
        log::error!("Corrupt archived document for order {}. {}", verified.order.id, e);
        ApiError::Internal
    })?;
    let snapshot = build_snapshot(&document, Utc::now());

    Ok(Json(ReviewLinkResponse {
        ok: true,
        order_id: verified.job.order_id,
        delivered_at: snapshot.delivered_at,
        items: snapshot.items,
        total: snapshot.total,
        currency: snapshot.currency,
    }))
}

#[derive(Deserialize)]
pub struct ReviewSubmitInput {
    token: Option<String>,
    sig: Option<String>,
    rating: Option<Value>,
    comment: Option<String>,
}

#[derive(Serialize)]
pub struct ReviewSubmitResponse {
    ok: bool,
}

pub async fn review_submit_handler(
    State(state): State<AppState>,
    Json(input): Json<ReviewSubmitInput>,
) -> Result<Json<ReviewSubmitResponse>, ApiError> {
    let token = required(input.token.as_deref())?;
    let signature = required(input.sig.as_deref())?;
    let rating = validate_rating(input.rating.as_ref())?;
    let comment = validate_comment(input.comment.as_deref())?;

    let connection = &mut storage::request_connection(&state.config.database_url)?;

    match submit_review(
        connection,
        &state.signer,
        token,
        signature,
        rating,
        comment,
        Utc::now(),
    ) {
        Ok(true) => {
            log::info!("Recorded review for job {}.", token);
            Ok(Json(ReviewSubmitResponse { ok: true }))
        }
        Ok(false) => {
            log::info!("Duplicate submission for job {}, keeping original.", token);
            Ok(Json(ReviewSubmitResponse { ok: true }))
        }
        Err(SubmitFailure::Api(e)) => Err(e),
        Err(SubmitFailure::Db(e)) => {
            log::error!("Failed to record review for job {}. {}", token, e);
            Err(ApiError::Internal)
        }
    }
}

fn required(value: Option<&str>) -> Result<&str, ApiError> {
    match value.map(str::trim) {
        Some(value) if !value.is_empty() => Ok(value),
        _ => Err(ApiError::InvalidRequest),
    }
}

// Ratings must arrive as JSON integers; 3.5 and "4" are both rejected.
fn validate_rating(value: Option<&Value>) -> Result<i32, ApiError> {
    let rating = value.and_then(Value::as_i64).ok_or(ApiError::InvalidRating)?;

    if !(1..=5).contains(&rating) {
        return Err(ApiError::InvalidRating);
    }

    Ok(rating as i32)
}

const MAX_COMMENT_CHARS: usize = 2000;

fn validate_comment(comment: Option<&str>) -> Result<Option<&str>, ApiError> {
    match comment {
        Some(comment) if comment.chars().count() > MAX_COMMENT_CHARS => {
            Err(ApiError::CommentTooLong)
        }
        other => Ok(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NewJob;
    use crate::models::NewOrder;
    use chrono::{Duration, TimeZone};
    use serde_json::json;

    fn fixed_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    fn signer() -> LinkSigner {
        LinkSigner::new("test-secret")
    }

    struct Fixture {
        token: String,
        signature: String,
    }

    fn seed(connection: &mut SqliteConnection, status: JobStatus) -> Fixture {
        seed_expiring(connection, status, fixed_now() + Duration::days(7))
    }

    fn seed_expiring(
        connection: &mut SqliteConnection,
        status: JobStatus,
        expires_at: DateTime<Utc>,
    ) -> Fixture {
        let document = json!({
            "email": "sam@example.com",
            "userId": "user-7",
            "deliveredAt": "2024-05-30T10:00:00Z",
            "items": [{ "name": "Desk", "qty": 1, "price": 120 }]
        })
        .to_string();

        diesel::insert_into(schema::orders::table)
            .values(&NewOrder {
                id: "order-1",
                document: &document,
                created_at: fixed_now().naive_utc(),
            })
            .execute(connection)
            .unwrap();

        let delivered = fixed_now() - Duration::days(2);

        diesel::insert_into(schema::review_jobs::table)
            .values(&NewJob {
                id: "review_order-1",
                order_id: "order-1",
                user_id: Some("user-7"),
                recipient: Some("sam@example.com"),
                status: status.as_str(),
                attempts: 0,
                created_at: delivered.naive_utc(),
                delivered_at: delivered.naive_utc(),
                send_at: (delivered + Duration::hours(24)).naive_utc(),
                expires_at: expires_at.naive_utc(),
                last_error: None,
            })
            .execute(connection)
            .unwrap();

        let expires_at_millis = expires_at.naive_utc().and_utc().timestamp_millis();
        let signature = signer().sign("review_order-1", expires_at_millis);

        Fixture {
            token: String::from("review_order-1"),
            signature,
        }
    }

    fn load_job(connection: &mut SqliteConnection, id: &str) -> Job {
        use schema::review_jobs::dsl as jobs;

        jobs::review_jobs
            .find(id)
            .select(Job::as_select())
            .first(connection)
            .unwrap()
    }

    #[test]
    fn valid_link_verifies_and_exposes_order() {
        let connection = &mut storage::test_connection();
        let fixture = seed(connection, JobStatus::Sent);

        let verified = verify_link(
            connection,
            &signer(),
            &fixture.token,
            &fixture.signature,
            fixed_now(),
        )
        .unwrap();

        assert_eq!(verified.job.id, "review_order-1");
        assert_eq!(verified.order.id, "order-1");
    }

    #[test]
    fn tampered_signature_is_rejected() {
        let connection = &mut storage::test_connection();
        let fixture = seed(connection, JobStatus::Sent);

        let result = verify_link(connection, &signer(), &fixture.token, "deadbeef", fixed_now());
        assert!(matches!(result, Err(ApiError::InvalidSignature)));

        let wrong_key = LinkSigner::new("other-secret");
        let result = verify_link(
            connection,
            &wrong_key,
            &fixture.token,
            &fixture.signature,
            fixed_now(),
        );
        assert!(matches!(result, Err(ApiError::InvalidSignature)));
    }

    #[test]
    fn unknown_token_is_not_found() {
        let connection = &mut storage::test_connection();

        let result = verify_link(connection, &signer(), "review_nope", "00", fixed_now());
        assert!(matches!(result, Err(ApiError::NotFound)));
    }

    #[test]
    fn used_job_is_not_allowed_even_with_valid_signature() {
        let connection = &mut storage::test_connection();
        let fixture = seed(connection, JobStatus::Used);

        let result = verify_link(
            connection,
            &signer(),
            &fixture.token,
            &fixture.signature,
            fixed_now(),
        );
        assert!(matches!(result, Err(ApiError::NotAllowed)));
    }

    #[test]
    fn revoked_job_is_not_allowed() {
        let connection = &mut storage::test_connection();
        let fixture = seed(connection, JobStatus::Revoked);

        let result = verify_link(
            connection,
            &signer(),
            &fixture.token,
            &fixture.signature,
            fixed_now(),
        );
        assert!(matches!(result, Err(ApiError::NotAllowed)));
    }

    #[test]
    fn expired_link_is_rejected() {
        let connection = &mut storage::test_connection();
        let fixture =
            seed_expiring(connection, JobStatus::Sent, fixed_now() - Duration::hours(1));

        let result = verify_link(
            connection,
            &signer(),
            &fixture.token,
            &fixture.signature,
            fixed_now(),
        );
        assert!(matches!(result, Err(ApiError::Expired)));
    }

    #[test]
    fn missing_archive_record_fails_closed() {
        let connection = &mut storage::test_connection();
        let fixture = seed(connection, JobStatus::Sent);

        diesel::delete(schema::orders::table)
            .execute(connection)
            .unwrap();

        let result = verify_link(
            connection,
            &signer(),
            &fixture.token,
            &fixture.signature,
            fixed_now(),
        );
        assert!(matches!(result, Err(ApiError::NotFound)));
    }

    #[test]
    fn submission_writes_once_and_replays_quietly() {
        let connection = &mut storage::test_connection();
        let fixture = seed(connection, JobStatus::Sent);
        let signer = signer();

        let first = submit_review(
            connection,
            &signer,
            &fixture.token,
            &fixture.signature,
            5,
            Some("great chair"),
            fixed_now(),
        );
        assert!(matches!(first, Ok(true)));

        let job = load_job(connection, "review_order-1");
        assert_eq!(job.status, "used");
        assert!(job.used_at.is_some());

        // The used transition would normally block a second verify, but a
        // replay with the same token must still succeed without writing.
        let second = submit_review(
            connection,
            &signer,
            &fixture.token,
            &fixture.signature,
            1,
            None,
            fixed_now(),
        );
        assert!(matches!(second, Ok(false)));

        use schema::reviews::dsl as reviews;
        let count: i64 = reviews::reviews.count().get_result(connection).unwrap();
        assert_eq!(count, 1);

        let review: Review = reviews::reviews
            .find("review_order-1")
            .select(Review::as_select())
            .first(connection)
            .unwrap();
        assert_eq!(review.rating, 5);
        assert_eq!(review.comment.as_deref(), Some("great chair"));

        use schema::orders::dsl as orders;
        let stamped: Option<chrono::NaiveDateTime> = orders::orders
            .find("order-1")
            .select(orders::review_submitted_at)
            .first(connection)
            .unwrap();
        assert!(stamped.is_some());
    }

    #[test]
    fn replayed_submission_still_requires_a_valid_signature() {
        let connection = &mut storage::test_connection();
        let fixture = seed(connection, JobStatus::Sent);
        let signer = signer();

        let first = submit_review(
            connection,
            &signer,
            &fixture.token,
            &fixture.signature,
            4,
            None,
            fixed_now(),
        );
        assert!(matches!(first, Ok(true)));

        // Same token, garbage signature: the replay path must not hand
        // out a success for an unauthenticated request.
        let forged = submit_review(
            connection,
            &signer,
            &fixture.token,
            "deadbeef",
            4,
            None,
            fixed_now(),
        );
        assert!(matches!(
            forged,
            Err(SubmitFailure::Api(ApiError::InvalidSignature))
        ));

        let legit_retry = submit_review(
            connection,
            &signer,
            &fixture.token,
            &fixture.signature,
            4,
            None,
            fixed_now(),
        );
        assert!(matches!(legit_retry, Ok(false)));

        use schema::reviews::dsl as reviews;
        let count: i64 = reviews::reviews.count().get_result(connection).unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn rating_bounds_are_enforced() {
        assert!(matches!(
            validate_rating(Some(&json!(0))),
            Err(ApiError::InvalidRating)
        ));
        assert!(matches!(
            validate_rating(Some(&json!(6))),
            Err(ApiError::InvalidRating)
        ));
        assert!(matches!(
            validate_rating(Some(&json!(3.5))),
            Err(ApiError::InvalidRating)
        ));
        assert!(matches!(
            validate_rating(Some(&json!("4"))),
            Err(ApiError::InvalidRating)
        ));
        assert!(matches!(validate_rating(None), Err(ApiError::InvalidRating)));

        assert_eq!(validate_rating(Some(&json!(1))).unwrap(), 1);
        assert_eq!(validate_rating(Some(&json!(5))).unwrap(), 5);
    }

    #[test]
    fn overlong_comments_are_rejected() {
        let long = "x".repeat(2001);
        assert!(matches!(
            validate_comment(Some(&long)),
            Err(ApiError::CommentTooLong)
        ));

        let max = "x".repeat(2000);
        assert_eq!(validate_comment(Some(&max)).unwrap(), Some(max.as_str()));
        assert_eq!(validate_comment(None).unwrap(), None);
    }
}
