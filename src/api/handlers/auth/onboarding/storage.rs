//! Onboarding progress persistence.
//!
//! One row per user. Step data accumulates into a JSONB document so a
//! later save never erases an earlier step's answers. The resume token is
//! stored as a SHA-256 hash, the raw value only ever goes back to the client.

use anyhow::{Context, Result};
use sqlx::{PgPool, Row};
use tracing::{Instrument, info_span};
use uuid::Uuid;

#[derive(Clone, Debug)]
pub struct ProgressRow {
    pub user_id: Uuid,
    pub account_type: String,
    pub current_step: String,
    pub completed_steps: Vec<String>,
    pub skipped_steps: Vec<String>,
    pub data: serde_json::Value,
    pub status: String,
}

fn row_to_progress(row: &sqlx::postgres::PgRow) -> Result<ProgressRow> {
    let data: String = row.get("data");
    Ok(ProgressRow {
        user_id: row.get("user_id"),
        account_type: row.get("account_type"),
        current_step: row.get("current_step"),
        completed_steps: row.get("completed_steps"),
        skipped_steps: row.get("skipped_steps"),
        data: serde_json::from_str(&data).context("invalid progress data")?,
        status: row.get("status"),
    })
}

const PROGRESS_COLUMNS: &str = r"
    user_id, account_type, current_step, completed_steps, skipped_steps,
    data::text AS data, status
";

pub async fn load_progress(pool: &PgPool, user_id: Uuid) -> Result<Option<ProgressRow>> {
    let query = format!("SELECT {PROGRESS_COLUMNS} FROM onboarding_progress WHERE user_id = $1");
    let span = info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query.as_str()
    );
    let row = sqlx::query(&query)
        .bind(user_id)
        .fetch_optional(pool)
        .instrument(span)
        .await
        .context("failed to load onboarding progress")?;
    row.as_ref().map(row_to_progress).transpose()
}

pub async fn find_by_resume_hash(pool: &PgPool, token_hash: &[u8]) -> Result<Option<ProgressRow>> {
    let query = format!(
        "SELECT {PROGRESS_COLUMNS} FROM onboarding_progress WHERE resume_token_hash = $1"
    );
    let span = info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query.as_str()
    );
    let row = sqlx::query(&query)
        .bind(token_hash)
        .fetch_optional(pool)
        .instrument(span)
        .await
        .context("failed to look up resume token")?;
    row.as_ref().map(row_to_progress).transpose()
}

/// Record a step. The caller supplies the already-merged step arrays; the
/// data document merges key-wise in SQL so a later save never clobbers an
/// earlier step's answers.
pub async fn save_step(
    pool: &PgPool,
    user_id: Uuid,
    account_type: &str,
    step: &str,
    completed_steps: &[String],
    skipped_steps: &[String],
    data_json: &str,
    resume_token_hash: &[u8],
) -> Result<()> {
    let query = r"
        INSERT INTO onboarding_progress
            (user_id, account_type, current_step, completed_steps, skipped_steps,
             data, status, resume_token_hash, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6::jsonb, 'in_progress', $7, NOW())
        ON CONFLICT (user_id) DO UPDATE SET
            current_step = EXCLUDED.current_step,
            completed_steps = EXCLUDED.completed_steps,
            skipped_steps = EXCLUDED.skipped_steps,
            data = onboarding_progress.data || EXCLUDED.data,
            resume_token_hash = EXCLUDED.resume_token_hash,
            updated_at = NOW()
    ";
    let span = info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "INSERT",
        db.statement = query
    );
    sqlx::query(query)
        .bind(user_id)
        .bind(account_type)
        .bind(step)
        .bind(completed_steps)
        .bind(skipped_steps)
        .bind(data_json)
        .bind(resume_token_hash)
        .execute(pool)
        .instrument(span)
        .await
        .context("failed to save onboarding step")?;
    Ok(())
}

/// Close out the plan and grant the account its entitlements, atomically.
pub async fn complete(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    user_id: Uuid,
    final_data_json: Option<&str>,
    entitlements: &[&str],
) -> Result<()> {
    let query = r"
        UPDATE onboarding_progress
        SET status = 'completed',
            data = CASE WHEN $2::jsonb IS NULL THEN data ELSE data || $2::jsonb END,
            resume_token_hash = NULL,
            updated_at = NOW()
        WHERE user_id = $1
    ";
    let span = info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "UPDATE",
        db.statement = query
    );
    sqlx::query(query)
        .bind(user_id)
        .bind(final_data_json)
        .execute(&mut **tx)
        .instrument(span)
        .await
        .context("failed to complete onboarding")?;

    let query = r"
        UPDATE users
        SET entitlements = $2::text[],
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
        .bind(entitlements)
        .execute(&mut **tx)
        .instrument(span)
        .await
        .context("failed to grant entitlements")?;
    Ok(())
}
