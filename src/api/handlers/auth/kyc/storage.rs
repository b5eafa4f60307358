//! KYC persistence: the document store seam and review bookkeeping.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use std::future::Future;
use std::pin::Pin;
use tracing::{Instrument, info_span};
use uuid::Uuid;

pub struct NewDocument<'a> {
    pub user_id: Uuid,
    pub document_type: &'a str,
    pub mime: &'a str,
    pub content: &'a [u8],
}

/// Where validated document bytes end up. The default keeps them in
/// Postgres; an object-store implementation plugs in here without touching
/// the handlers.
pub trait DocumentStore: Send + Sync {
    fn store<'a>(
        &'a self,
        pool: &'a PgPool,
        document: NewDocument<'a>,
    ) -> Pin<Box<dyn Future<Output = Result<Uuid>> + Send + 'a>>;
}

pub struct PostgresDocumentStore;

impl DocumentStore for PostgresDocumentStore {
    fn store<'a>(
        &'a self,
        pool: &'a PgPool,
        document: NewDocument<'a>,
    ) -> Pin<Box<dyn Future<Output = Result<Uuid>> + Send + 'a>> {
        Box::pin(async move {
            // Resubmitting a document type replaces the previous upload and
            // puts it back in review.
            let query = r"
                INSERT INTO kyc_documents (user_id, document_type, mime, content, status, submitted_at)
                VALUES ($1, $2, $3, $4, 'pending', NOW())
                ON CONFLICT (user_id, document_type)
                DO UPDATE SET mime = EXCLUDED.mime,
                              content = EXCLUDED.content,
                              status = 'pending',
                              submitted_at = NOW(),
                              reviewed_at = NULL
                RETURNING id
            ";
            let span = info_span!(
                "db.query",
                db.system = "postgresql",
                db.operation = "INSERT",
                db.statement = query
            );
            let row: (Uuid,) = sqlx::query_as(query)
                .bind(document.user_id)
                .bind(document.document_type)
                .bind(document.mime)
                .bind(document.content)
                .fetch_one(pool)
                .instrument(span)
                .await
                .context("failed to store document")?;
            Ok(row.0)
        })
    }
}

#[derive(Clone, Debug, sqlx::FromRow)]
pub struct DocumentRow {
    pub id: Uuid,
    pub document_type: String,
    pub mime: String,
    pub status: String,
    pub submitted_at: DateTime<Utc>,
    pub reviewed_at: Option<DateTime<Utc>>,
}

/// Documents on file for a user, without their content.
pub async fn list_documents(pool: &PgPool, user_id: Uuid) -> Result<Vec<DocumentRow>> {
    let query = r"
        SELECT id, document_type, mime, status, submitted_at, reviewed_at
        FROM kyc_documents
        WHERE user_id = $1
        ORDER BY submitted_at ASC
    ";
    let span = info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query
    );
    sqlx::query_as::<_, DocumentRow>(query)
        .bind(user_id)
        .fetch_all(pool)
        .instrument(span)
        .await
        .context("failed to list documents")
}

#[derive(Clone, Debug, sqlx::FromRow)]
pub struct KycProfile {
    pub kyc_level: String,
    pub kyc_status: String,
    pub kyc_verified_at: Option<DateTime<Utc>>,
    pub kyc_expires_at: Option<DateTime<Utc>>,
    pub kyc_rejection_reason: Option<String>,
}

pub async fn kyc_profile(pool: &PgPool, user_id: Uuid) -> Result<Option<KycProfile>> {
    let query = r"
        SELECT kyc_level, kyc_status, kyc_verified_at, kyc_expires_at, kyc_rejection_reason
        FROM users
        WHERE id = $1
    ";
    let span = info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query
    );
    sqlx::query_as::<_, KycProfile>(query)
        .bind(user_id)
        .fetch_optional(pool)
        .instrument(span)
        .await
        .context("failed to load kyc profile")
}

#[derive(Clone, Debug, sqlx::FromRow)]
pub struct DocumentOwnerRow {
    pub id: Uuid,
    pub user_id: Uuid,
    pub document_type: String,
    pub status: String,
}

/// Look up a single document for review, content excluded.
pub async fn find_document(pool: &PgPool, document_id: Uuid) -> Result<Option<DocumentOwnerRow>> {
    let query = r"
        SELECT id, user_id, document_type, status
        FROM kyc_documents
        WHERE id = $1
    ";
    let span = info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query
    );
    sqlx::query_as::<_, DocumentOwnerRow>(query)
        .bind(document_id)
        .fetch_optional(pool)
        .instrument(span)
        .await
        .context("failed to look up document")
}

/// Record the reviewer's verdict on one document.
pub async fn apply_document_decision(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    document_id: Uuid,
    status: &str,
) -> Result<()> {
    let query = r"
        UPDATE kyc_documents
        SET status = $2, reviewed_at = NOW()
        WHERE id = $1
    ";
    let span = info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "UPDATE",
        db.statement = query
    );
    sqlx::query(query)
        .bind(document_id)
        .bind(status)
        .execute(&mut **tx)
        .instrument(span)
        .await
        .context("failed to record document decision")?;
    Ok(())
}

/// Write the aggregate standing derived from the document set. A verification
/// stamps the expiry a year out; a rejection records the reason.
pub async fn set_kyc_standing(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    user_id: Uuid,
    status: &str,
    level: Option<&str>,
    reason: Option<&str>,
) -> Result<()> {
    let query = r"
        UPDATE users
        SET kyc_status = $2,
            kyc_level = COALESCE($3, kyc_level),
            kyc_rejection_reason = $4,
            kyc_verified_at = CASE WHEN $2 = 'verified' THEN NOW() ELSE kyc_verified_at END,
            kyc_expires_at = CASE WHEN $2 = 'verified' THEN NOW() + INTERVAL '1 year' ELSE kyc_expires_at END,
            updated_at = NOW()
        WHERE id = $1
    ";
    let span = info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "UPDATE",
        db.statement = query
    );
    sqlx::query(query)
        .bind(user_id)
        .bind(status)
        .bind(level)
        .bind(reason)
        .execute(&mut **tx)
        .instrument(span)
        .await
        .context("failed to update kyc standing")?;
    Ok(())
}

/// Move a user with pending documents into `pending` review state.
pub async fn mark_submission(pool: &PgPool, user_id: Uuid) -> Result<()> {
    let query = r"
        UPDATE users
        SET kyc_status = CASE
                WHEN kyc_status IN ('not_started', 'rejected') THEN 'pending'
                ELSE kyc_status
            END,
            updated_at = NOW()
        WHERE id = $1
    ";
    let span = info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "UPDATE",
        db.statement = query
    );
    sqlx::query(query)
        .bind(user_id)
        .execute(pool)
        .instrument(span)
        .await
        .context("failed to mark kyc submission")?;
    Ok(())
}
