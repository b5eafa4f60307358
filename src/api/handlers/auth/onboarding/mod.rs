//! Onboarding save-and-resume endpoints.

pub mod steps;
pub mod storage;

use axum::{
    Json,
    extract::{Extension, Query},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::sync::Arc;
use tracing::{error, info};
use utoipa::ToSchema;

use self::steps::{
    entitlements_for, is_complete, is_skippable, is_valid_step, merge_step, next_steps, steps_for,
};
use self::storage::{ProgressRow, find_by_resume_hash, load_progress, save_step};
use super::session::require_access;
use super::state::AppState;
use super::storage::find_user_by_id;
use super::types::{ErrorBody, ErrorKind, error_response};
use super::utils::{extract_bearer_token, generate_opaque_token, hash_token};

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ProgressBody {
    pub success: bool,
    pub account_type: String,
    pub current_step: String,
    pub completed_steps: Vec<String>,
    pub skipped_steps: Vec<String>,
    pub next_steps: Vec<String>,
    pub total_steps: usize,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub save_token: Option<String>,
}

fn progress_body(
    progress: ProgressRow,
    save_token: Option<String>,
    include_data: bool,
) -> ProgressBody {
    let next = next_steps(
        &progress.account_type,
        &progress.completed_steps,
        &progress.skipped_steps,
    );
    ProgressBody {
        success: true,
        total_steps: steps_for(&progress.account_type).len(),
        next_steps: next.iter().map(|s| (*s).to_string()).collect(),
        account_type: progress.account_type,
        current_step: progress.current_step,
        completed_steps: progress.completed_steps,
        skipped_steps: progress.skipped_steps,
        status: progress.status,
        data: include_data.then_some(progress.data),
        save_token,
    }
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct SaveProgressRequest {
    step: String,
    data: Option<serde_json::Value>,
    skip: Option<bool>,
}

#[utoipa::path(
    post,
    path = "/v1/auth/onboarding/progress",
    request_body = SaveProgressRequest,
    responses(
        (status = 200, description = "Step recorded, resume token returned", body = ProgressBody),
        (status = 400, description = "Step not part of the account's plan", body = ErrorBody),
        (status = 401, description = "Missing or invalid token", body = ErrorBody),
        (status = 409, description = "Onboarding already completed", body = ErrorBody)
    ),
    tag = "onboarding"
)]
pub async fn save_progress(
    headers: HeaderMap,
    pool: Extension<PgPool>,
    state: Extension<Arc<AppState>>,
    payload: Option<Json<SaveProgressRequest>>,
) -> impl IntoResponse {
    let principal = match require_access(&headers, &state) {
        Ok(principal) => principal,
        Err(err) => return err.into_response(),
    };
    let request = match payload {
        Some(Json(payload)) => payload,
        None => {
            return error_response(ErrorKind::InvalidInput, "Missing payload").into_response();
        }
    };

    let user = match find_user_by_id(&pool, principal.user_id).await {
        Ok(Some(user)) => user,
        Ok(None) => {
            return error_response(ErrorKind::InvalidToken, "Invalid token").into_response();
        }
        Err(err) => {
            error!("User lookup failed: {err}");
            return error_response(ErrorKind::Internal, "Save failed").into_response();
        }
    };

    let step = request.step.trim();
    if !is_valid_step(&user.account_type, step) {
        return error_response(ErrorKind::InvalidInput, "Unknown step for this account type")
            .into_response();
    }
    let skipped = request.skip.unwrap_or(false);
    if skipped && !is_skippable(step) {
        return error_response(ErrorKind::InvalidInput, "Step cannot be skipped")
            .into_response();
    }

    let existing = match load_progress(&pool, user.id).await {
        Ok(Some(progress)) if progress.status == "completed" => {
            return error_response(ErrorKind::AlreadyExists, "Onboarding already completed")
                .into_response();
        }
        Ok(existing) => existing,
        Err(err) => {
            error!("Progress lookup failed: {err}");
            return error_response(ErrorKind::Internal, "Save failed").into_response();
        }
    };

    // The merged arrays are computed here so a re-saved step stays recorded
    // exactly once.
    let (mut completed_steps, mut skipped_steps) = existing
        .map(|progress| (progress.completed_steps, progress.skipped_steps))
        .unwrap_or_default();
    if skipped {
        skipped_steps = merge_step(&skipped_steps, step);
    } else {
        completed_steps = merge_step(&completed_steps, step);
    }

    // Answers are namespaced per step so later saves merge instead of
    // clobbering earlier ones.
    let data_json = serde_json::json!({
        step: request.data.unwrap_or(serde_json::Value::Null)
    })
    .to_string();

    let save_token = match generate_opaque_token() {
        Ok(token) => token,
        Err(err) => {
            error!("Resume token generation failed: {err}");
            return error_response(ErrorKind::Internal, "Save failed").into_response();
        }
    };

    if let Err(err) = save_step(
        &pool,
        user.id,
        &user.account_type,
        step,
        &completed_steps,
        &skipped_steps,
        &data_json,
        &hash_token(&save_token),
    )
    .await
    {
        error!("Progress save failed: {err}");
        return error_response(ErrorKind::Internal, "Save failed").into_response();
    }

    let progress = match load_progress(&pool, user.id).await {
        Ok(Some(progress)) => progress,
        Ok(None) | Err(_) => {
            return error_response(ErrorKind::Internal, "Save failed").into_response();
        }
    };

    (
        StatusCode::OK,
        Json(progress_body(progress, Some(save_token), false)),
    )
        .into_response()
}

#[derive(Debug, Deserialize, utoipa::IntoParams)]
#[serde(rename_all = "camelCase")]
pub struct ResumeQuery {
    resume_token: Option<String>,
}

#[utoipa::path(
    get,
    path = "/v1/auth/onboarding/progress",
    params(ResumeQuery),
    responses(
        (status = 200, description = "Saved progress with step data", body = ProgressBody),
        (status = 401, description = "No valid token or resume token", body = ErrorBody),
        (status = 404, description = "Nothing saved yet", body = ErrorBody)
    ),
    tag = "onboarding"
)]
pub async fn get_progress(
    headers: HeaderMap,
    pool: Extension<PgPool>,
    state: Extension<Arc<AppState>>,
    query: Query<ResumeQuery>,
) -> impl IntoResponse {
    // A bearer token wins; the resume token covers the logged-out return
    // visit.
    let progress = if extract_bearer_token(&headers).is_some() {
        let principal = match require_access(&headers, &state) {
            Ok(principal) => principal,
            Err(err) => return err.into_response(),
        };
        load_progress(&pool, principal.user_id).await
    } else if let Some(ref token) = query.resume_token {
        find_by_resume_hash(&pool, &hash_token(token.trim())).await
    } else {
        return error_response(ErrorKind::InvalidToken, "Missing bearer or resume token")
            .into_response();
    };

    match progress {
        Ok(Some(progress)) => {
            (StatusCode::OK, Json(progress_body(progress, None, true))).into_response()
        }
        Ok(None) => error_response(ErrorKind::NotFound, "No saved progress").into_response(),
        Err(err) => {
            error!("Progress lookup failed: {err}");
            error_response(ErrorKind::Internal, "Progress unavailable").into_response()
        }
    }
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CompleteRequest {
    final_data: Option<serde_json::Value>,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CompleteResponse {
    pub success: bool,
    pub status: String,
    pub entitlements: Vec<String>,
}

#[utoipa::path(
    patch,
    path = "/v1/auth/onboarding/progress",
    request_body = CompleteRequest,
    responses(
        (status = 200, description = "Onboarding completed, entitlements granted", body = CompleteResponse),
        (status = 401, description = "Missing or invalid token", body = ErrorBody),
        (status = 409, description = "Required steps are still outstanding", body = ErrorBody)
    ),
    tag = "onboarding"
)]
pub async fn complete_onboarding(
    headers: HeaderMap,
    pool: Extension<PgPool>,
    state: Extension<Arc<AppState>>,
    payload: Option<Json<CompleteRequest>>,
) -> impl IntoResponse {
    let principal = match require_access(&headers, &state) {
        Ok(principal) => principal,
        Err(err) => return err.into_response(),
    };
    let request = payload.map(|Json(payload)| payload);

    let progress = match load_progress(&pool, principal.user_id).await {
        Ok(Some(progress)) => progress,
        Ok(None) => {
            return error_response(ErrorKind::IncompleteOnboarding, "No steps saved yet")
                .into_response();
        }
        Err(err) => {
            error!("Progress lookup failed: {err}");
            return error_response(ErrorKind::Internal, "Completion failed").into_response();
        }
    };

    if progress.status == "completed" {
        return error_response(ErrorKind::AlreadyExists, "Onboarding already completed")
            .into_response();
    }
    if !is_complete(
        &progress.account_type,
        &progress.completed_steps,
        &progress.skipped_steps,
    ) {
        return error_response(
            ErrorKind::IncompleteOnboarding,
            "Required steps are still outstanding",
        )
        .into_response();
    }

    let entitlements = entitlements_for(&progress.account_type);
    let final_data_json = request
        .and_then(|request| request.final_data)
        .map(|data| data.to_string());

    let result = async {
        let mut tx = pool.begin().await?;
        storage::complete(
            &mut tx,
            principal.user_id,
            final_data_json.as_deref(),
            &entitlements,
        )
        .await?;
        tx.commit().await?;
        anyhow::Ok(())
    }
    .await;

    if let Err(err) = result {
        error!("Onboarding completion failed: {err}");
        return error_response(ErrorKind::Internal, "Completion failed").into_response();
    }

    info!(user_id = %principal.user_id, "onboarding completed");

    (
        StatusCode::OK,
        Json(CompleteResponse {
            success: true,
            status: "completed".to_string(),
            entitlements: entitlements.iter().map(|e| (*e).to_string()).collect(),
        }),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::super::state::{AppState, AuthConfig};
    use super::*;
    use anyhow::Result;
    use secrecy::SecretString;
    use sqlx::postgres::PgPoolOptions;
    use uuid::Uuid;

    fn app_state() -> Arc<AppState> {
        Arc::new(AppState::new(AuthConfig::new(
            SecretString::from("test-signing-secret"),
            "http://localhost:3000".to_string(),
        )))
    }

    #[tokio::test]
    async fn save_requires_token() -> Result<()> {
        let pool = PgPoolOptions::new().connect_lazy("postgres://postgres@localhost/postgres")?;
        let response = save_progress(
            HeaderMap::new(),
            Extension(pool),
            Extension(app_state()),
            None,
        )
        .await
        .into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        Ok(())
    }

    #[tokio::test]
    async fn get_requires_some_token() -> Result<()> {
        let pool = PgPoolOptions::new().connect_lazy("postgres://postgres@localhost/postgres")?;
        let response = get_progress(
            HeaderMap::new(),
            Extension(pool),
            Extension(app_state()),
            Query(ResumeQuery { resume_token: None }),
        )
        .await
        .into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        Ok(())
    }

    #[tokio::test]
    async fn complete_requires_token() -> Result<()> {
        let pool = PgPoolOptions::new().connect_lazy("postgres://postgres@localhost/postgres")?;
        let response = complete_onboarding(
            HeaderMap::new(),
            Extension(pool),
            Extension(app_state()),
            None,
        )
        .await
        .into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        Ok(())
    }

    #[test]
    fn progress_body_computes_next_and_totals() {
        let progress = ProgressRow {
            user_id: Uuid::new_v4(),
            account_type: "business".to_string(),
            current_step: "contact".to_string(),
            completed_steps: vec!["profile".to_string(), "contact".to_string()],
            skipped_steps: vec![],
            data: serde_json::json!({"profile": {"name": "Shop"}}),
            status: "in_progress".to_string(),
        };
        let body = progress_body(progress, Some("token".to_string()), true);
        assert_eq!(body.total_steps, 8);
        assert_eq!(body.next_steps.first().map(String::as_str), Some("business_details"));
        assert!(body.data.is_some());
        assert_eq!(body.save_token.as_deref(), Some("token"));
    }
}
