//! KYC endpoints: document submission, status, and the admin review decision.

pub mod models;
pub mod storage;

use axum::{
    Json,
    extract::{Extension, Multipart},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::sync::Arc;
use tracing::{error, info};
use utoipa::ToSchema;
use uuid::Uuid;

use self::models::{
    DocumentStatus, DocumentType, KycLevel, KycStatus, aggregate_status, validate_document,
};
use self::storage::{NewDocument, find_document, kyc_profile, list_documents, mark_submission};
use super::session::require_access;
use super::state::AppState;
use super::storage::{UserRow, find_user_by_id};
use super::types::{ErrorBody, ErrorKind, error_response};
use crate::api::delivery::enqueue_notification;

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct DocumentBody {
    pub id: Uuid,
    pub document_type: String,
    pub mime: String,
    pub status: String,
    pub submitted_at: DateTime<Utc>,
    pub reviewed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct KycSubmitResponse {
    pub success: bool,
    pub document_id: Uuid,
    pub document_type: DocumentType,
    pub mime: String,
    pub kyc_status: String,
}

#[utoipa::path(
    post,
    path = "/v1/auth/kyc/documents",
    request_body(content_type = "multipart/form-data"),
    responses(
        (status = 201, description = "Document accepted for review", body = KycSubmitResponse),
        (status = 400, description = "Invalid or unsupported document", body = ErrorBody),
        (status = 401, description = "Missing or invalid token", body = ErrorBody)
    ),
    tag = "kyc"
)]
pub async fn submit_document(
    headers: HeaderMap,
    pool: Extension<PgPool>,
    state: Extension<Arc<AppState>>,
    mut multipart: Multipart,
) -> impl IntoResponse {
    let principal = match require_access(&headers, &state) {
        Ok(principal) => principal,
        Err(err) => return err.into_response(),
    };

    let mut document_type: Option<DocumentType> = None;
    let mut content: Option<Vec<u8>> = None;

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(err) => {
                error!("Multipart read failed: {err}");
                return error_response(ErrorKind::InvalidInput, "Malformed upload")
                    .into_response();
            }
        };
        match field.name() {
            Some("documentType") => {
                let value = match field.text().await {
                    Ok(value) => value,
                    Err(_) => {
                        return error_response(ErrorKind::InvalidInput, "Malformed upload")
                            .into_response();
                    }
                };
                document_type = DocumentType::parse(value.trim());
                if document_type.is_none() {
                    return error_response(ErrorKind::InvalidInput, "Unknown document type")
                        .into_response();
                }
            }
            Some("file") => {
                content = match field.bytes().await {
                    Ok(bytes) => Some(bytes.to_vec()),
                    Err(_) => {
                        return error_response(
                            ErrorKind::InvalidDocument,
                            "Document exceeds the 10 MB limit",
                        )
                        .into_response();
                    }
                };
            }
            _ => {}
        }
    }

    let Some(document_type) = document_type else {
        return error_response(ErrorKind::InvalidInput, "Missing documentType field")
            .into_response();
    };
    let Some(content) = content else {
        return error_response(ErrorKind::InvalidInput, "Missing file field").into_response();
    };

    // Validate before anything is written.
    let format = match validate_document(&content) {
        Ok(format) => format,
        Err(rejection) => {
            return error_response(ErrorKind::InvalidDocument, rejection.message())
                .into_response();
        }
    };

    let document_id = match state
        .documents
        .store(
            &pool,
            NewDocument {
                user_id: principal.user_id,
                document_type: document_type.as_str(),
                mime: format.mime(),
                content: &content,
            },
        )
        .await
    {
        Ok(id) => id,
        Err(err) => {
            error!("Document store failed: {err}");
            return error_response(ErrorKind::Internal, "Document submission failed")
                .into_response();
        }
    };

    if let Err(err) = mark_submission(&pool, principal.user_id).await {
        error!("KYC submission update failed: {err}");
        return error_response(ErrorKind::Internal, "Document submission failed")
            .into_response();
    }

    info!(
        user_id = %principal.user_id,
        document_type = document_type.as_str(),
        "kyc document submitted"
    );

    (
        StatusCode::CREATED,
        Json(KycSubmitResponse {
            success: true,
            document_id,
            document_type,
            mime: format.mime().to_string(),
            kyc_status: KycStatus::Pending.as_str().to_string(),
        }),
    )
        .into_response()
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct KycStatusResponse {
    pub success: bool,
    pub level: String,
    pub status: String,
    pub verified_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub expired: bool,
    pub rejection_reason: Option<String>,
    pub documents: Vec<DocumentBody>,
    pub next_level: Option<KycLevel>,
    pub missing_documents: Vec<DocumentType>,
}

const fn next_level(level: KycLevel) -> Option<KycLevel> {
    match level {
        KycLevel::None => Some(KycLevel::Basic),
        KycLevel::Basic => Some(KycLevel::Intermediate),
        KycLevel::Intermediate => Some(KycLevel::Advanced),
        KycLevel::Advanced => Some(KycLevel::Enterprise),
        KycLevel::Enterprise => None,
    }
}

fn missing_for(target: KycLevel, on_file: &[String]) -> Vec<DocumentType> {
    target
        .required_documents()
        .iter()
        .copied()
        .filter(|required| !on_file.iter().any(|have| have == required.as_str()))
        .collect()
}

#[utoipa::path(
    get,
    path = "/v1/auth/kyc/status",
    responses(
        (status = 200, description = "Current KYC standing", body = KycStatusResponse),
        (status = 401, description = "Missing or invalid token", body = ErrorBody)
    ),
    tag = "kyc"
)]
pub async fn status(
    headers: HeaderMap,
    pool: Extension<PgPool>,
    state: Extension<Arc<AppState>>,
) -> impl IntoResponse {
    let principal = match require_access(&headers, &state) {
        Ok(principal) => principal,
        Err(err) => return err.into_response(),
    };

    let profile = match kyc_profile(&pool, principal.user_id).await {
        Ok(Some(profile)) => profile,
        Ok(None) => {
            return error_response(ErrorKind::NotFound, "Account not found").into_response();
        }
        Err(err) => {
            error!("KYC profile lookup failed: {err}");
            return error_response(ErrorKind::Internal, "Status unavailable").into_response();
        }
    };
    let documents = match list_documents(&pool, principal.user_id).await {
        Ok(documents) => documents,
        Err(err) => {
            error!("Document listing failed: {err}");
            return error_response(ErrorKind::Internal, "Status unavailable").into_response();
        }
    };

    let level = KycLevel::parse(&profile.kyc_level).unwrap_or(KycLevel::None);
    let expired = profile
        .kyc_expires_at
        .is_some_and(|expires_at| expires_at < Utc::now());
    let target = next_level(level);
    let on_file: Vec<String> = documents
        .iter()
        .map(|doc| doc.document_type.clone())
        .collect();
    let missing_documents = target.map_or_else(Vec::new, |target| missing_for(target, &on_file));

    (
        StatusCode::OK,
        Json(KycStatusResponse {
            success: true,
            level: profile.kyc_level,
            status: profile.kyc_status,
            verified_at: profile.kyc_verified_at,
            expires_at: profile.kyc_expires_at,
            expired,
            rejection_reason: profile.kyc_rejection_reason,
            documents: documents
                .into_iter()
                .map(|doc| DocumentBody {
                    id: doc.id,
                    document_type: doc.document_type,
                    mime: doc.mime,
                    status: doc.status,
                    submitted_at: doc.submitted_at,
                    reviewed_at: doc.reviewed_at,
                })
                .collect(),
            next_level: target,
            missing_documents,
        }),
    )
        .into_response()
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct KycReviewRequest {
    document_id: Uuid,
    decision: DocumentStatus,
    /// Level the review targets; defaults to the next level above the
    /// subject's current one.
    level: Option<KycLevel>,
    reason: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct KycReviewResponse {
    pub success: bool,
    pub document_id: Uuid,
    pub document_status: DocumentStatus,
    pub user_id: Uuid,
    pub status: KycStatus,
    pub level: String,
}

#[utoipa::path(
    patch,
    path = "/v1/auth/kyc/status",
    request_body = KycReviewRequest,
    responses(
        (status = 200, description = "Document decision recorded, aggregate status recomputed", body = KycReviewResponse),
        (status = 400, description = "Invalid decision or document not awaiting review", body = ErrorBody),
        (status = 401, description = "Missing or invalid token", body = ErrorBody),
        (status = 403, description = "Reviewer is not an administrator", body = ErrorBody),
        (status = 404, description = "Unknown document", body = ErrorBody)
    ),
    tag = "kyc"
)]
pub async fn review(
    headers: HeaderMap,
    pool: Extension<PgPool>,
    state: Extension<Arc<AppState>>,
    payload: Option<Json<KycReviewRequest>>,
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
    if request.decision == DocumentStatus::Pending {
        return error_response(ErrorKind::InvalidInput, "Decision must be verified or rejected")
            .into_response();
    }

    let reviewer = match find_user_by_id(&pool, principal.user_id).await {
        Ok(Some(reviewer)) => reviewer,
        Ok(None) => {
            return error_response(ErrorKind::InvalidToken, "Invalid token").into_response();
        }
        Err(err) => {
            error!("Reviewer lookup failed: {err}");
            return error_response(ErrorKind::Internal, "Review failed").into_response();
        }
    };
    if reviewer.role != "admin" {
        return error_response(ErrorKind::Forbidden, "Administrator role required")
            .into_response();
    }

    let document = match find_document(&pool, request.document_id).await {
        Ok(Some(document)) => document,
        Ok(None) => {
            return error_response(ErrorKind::NotFound, "Unknown document").into_response();
        }
        Err(err) => {
            error!("Document lookup failed: {err}");
            return error_response(ErrorKind::Internal, "Review failed").into_response();
        }
    };
    if document.status != DocumentStatus::Pending.as_str() {
        return error_response(ErrorKind::InvalidInput, "Document is not awaiting review")
            .into_response();
    }

    let subject = match find_user_by_id(&pool, document.user_id).await {
        Ok(Some(subject)) => subject,
        Ok(None) => {
            return error_response(ErrorKind::NotFound, "Unknown user").into_response();
        }
        Err(err) => {
            error!("Subject lookup failed: {err}");
            return error_response(ErrorKind::Internal, "Review failed").into_response();
        }
    };

    let current = KycStatus::parse(&subject.kyc_status).unwrap_or(KycStatus::NotStarted);
    let current_level = KycLevel::parse(&subject.kyc_level).unwrap_or(KycLevel::None);
    let target = request
        .level
        .unwrap_or_else(|| next_level(current_level).unwrap_or(current_level));

    // Aggregate over the document set as it will look once this decision
    // lands.
    let documents = match list_documents(&pool, subject.id).await {
        Ok(documents) => documents,
        Err(err) => {
            error!("Document listing failed: {err}");
            return error_response(ErrorKind::Internal, "Review failed").into_response();
        }
    };
    let decided: Vec<(DocumentType, DocumentStatus)> = documents
        .iter()
        .filter_map(|doc| {
            let kind = DocumentType::parse(&doc.document_type)?;
            let status = if doc.id == request.document_id {
                request.decision
            } else {
                DocumentStatus::parse(&doc.status)?
            };
            Some((kind, status))
        })
        .collect();
    let aggregate = aggregate_status(target, &decided);

    if aggregate != current && !current.can_transition(aggregate) {
        return error_response(ErrorKind::InvalidInput, "Invalid status transition")
            .into_response();
    }

    let result = apply_decision(&pool, &subject, &request, aggregate, target, current).await;
    if let Err(err) = result {
        error!("Review decision failed: {err}");
        return error_response(ErrorKind::Internal, "Review failed").into_response();
    }

    info!(
        user_id = %subject.id,
        document_id = %request.document_id,
        decision = request.decision.as_str(),
        status = aggregate.as_str(),
        "kyc review applied"
    );

    (
        StatusCode::OK,
        Json(KycReviewResponse {
            success: true,
            document_id: request.document_id,
            document_status: request.decision,
            user_id: subject.id,
            status: aggregate,
            level: if aggregate == KycStatus::Verified {
                target.as_str().to_string()
            } else {
                subject.kyc_level
            },
        }),
    )
        .into_response()
}

async fn apply_decision(
    pool: &PgPool,
    subject: &UserRow,
    request: &KycReviewRequest,
    aggregate: KycStatus,
    target: KycLevel,
    current: KycStatus,
) -> anyhow::Result<()> {
    let mut tx = pool.begin().await?;
    storage::apply_document_decision(&mut tx, request.document_id, request.decision.as_str())
        .await?;

    if aggregate != current {
        let level = (aggregate == KycStatus::Verified).then(|| target.as_str());
        let reason = if aggregate == KycStatus::Rejected {
            request.reason.as_deref()
        } else {
            None
        };
        storage::set_kyc_standing(&mut tx, subject.id, aggregate.as_str(), level, reason).await?;

        // The user hears about verdicts, not intermediate review states.
        if matches!(aggregate, KycStatus::Verified | KycStatus::Rejected)
            && let Some(ref email) = subject.email
        {
            let payload = serde_json::json!({
                "name": subject.name,
                "status": aggregate.as_str(),
                "reason": reason,
            })
            .to_string();
            enqueue_notification(&mut tx, "email", email, "kyc_decision", &payload).await?;
        }
    }

    tx.commit().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::super::state::{AppState, AuthConfig};
    use super::super::tokens;
    use super::super::utils::now_unix_seconds;
    use super::*;
    use anyhow::Result;
    use secrecy::SecretString;
    use sqlx::postgres::PgPoolOptions;

    fn app_state() -> Arc<AppState> {
        Arc::new(AppState::new(AuthConfig::new(
            SecretString::from("test-signing-secret"),
            "http://localhost:3000".to_string(),
        )))
    }

    fn bearer(state: &AppState) -> Result<HeaderMap> {
        let pair = tokens::issue_pair(
            state.auth.token_secret(),
            Uuid::new_v4(),
            Uuid::new_v4(),
            now_unix_seconds(),
        )?;
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::AUTHORIZATION,
            format!("Bearer {}", pair.access_token).parse()?,
        );
        Ok(headers)
    }

    #[tokio::test]
    async fn status_requires_token() -> Result<()> {
        let pool = PgPoolOptions::new().connect_lazy("postgres://postgres@localhost/postgres")?;
        let response = status(HeaderMap::new(), Extension(pool), Extension(app_state()))
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        Ok(())
    }

    #[tokio::test]
    async fn review_requires_token() -> Result<()> {
        let pool = PgPoolOptions::new().connect_lazy("postgres://postgres@localhost/postgres")?;
        let response = review(HeaderMap::new(), Extension(pool), Extension(app_state()), None)
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        Ok(())
    }

    #[tokio::test]
    async fn review_missing_payload() -> Result<()> {
        let pool = PgPoolOptions::new().connect_lazy("postgres://postgres@localhost/postgres")?;
        let state = app_state();
        let headers = bearer(&state)?;
        let response = review(headers, Extension(pool), Extension(state), None)
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        Ok(())
    }

    #[tokio::test]
    async fn review_rejects_pending_as_decision() -> Result<()> {
        let pool = PgPoolOptions::new().connect_lazy("postgres://postgres@localhost/postgres")?;
        let state = app_state();
        let headers = bearer(&state)?;
        let response = review(
            headers,
            Extension(pool),
            Extension(state),
            Some(Json(KycReviewRequest {
                document_id: Uuid::new_v4(),
                decision: DocumentStatus::Pending,
                level: None,
                reason: None,
            })),
        )
        .await
        .into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        Ok(())
    }

    #[test]
    fn review_request_addresses_a_single_document() -> Result<()> {
        let request: KycReviewRequest = serde_json::from_value(serde_json::json!({
            "documentId": Uuid::new_v4(),
            "decision": "rejected",
            "reason": "illegible scan",
        }))?;
        assert_eq!(request.decision, DocumentStatus::Rejected);
        assert_eq!(request.reason.as_deref(), Some("illegible scan"));
        Ok(())
    }

    #[test]
    fn next_level_walks_the_ladder() {
        assert_eq!(next_level(KycLevel::None), Some(KycLevel::Basic));
        assert_eq!(next_level(KycLevel::Advanced), Some(KycLevel::Enterprise));
        assert_eq!(next_level(KycLevel::Enterprise), None);
    }

    #[test]
    fn missing_for_reports_gaps_only() {
        let on_file = vec!["passport".to_string(), "tax_id".to_string()];
        assert_eq!(
            missing_for(KycLevel::Advanced, &on_file),
            vec![DocumentType::ProofOfAddress]
        );
        assert!(missing_for(KycLevel::Basic, &on_file).is_empty());
    }
}
