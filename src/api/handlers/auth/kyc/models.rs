//! KYC domain model: verification levels, document kinds, and the review
//! state machine.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Largest accepted document upload.
pub const MAX_DOCUMENT_BYTES: usize = 10 * 1024 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum KycLevel {
    None,
    Basic,
    Intermediate,
    Advanced,
    Enterprise,
}

impl KycLevel {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Basic => "basic",
            Self::Intermediate => "intermediate",
            Self::Advanced => "advanced",
            Self::Enterprise => "enterprise",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "none" => Some(Self::None),
            "basic" => Some(Self::Basic),
            "intermediate" => Some(Self::Intermediate),
            "advanced" => Some(Self::Advanced),
            "enterprise" => Some(Self::Enterprise),
            _ => None,
        }
    }

    /// Document kinds a user must have on file to reach this level. Levels
    /// are cumulative.
    pub const fn required_documents(self) -> &'static [DocumentType] {
        match self {
            Self::None => &[],
            Self::Basic => &[DocumentType::Passport],
            Self::Intermediate => &[DocumentType::Passport, DocumentType::ProofOfAddress],
            Self::Advanced => &[
                DocumentType::Passport,
                DocumentType::ProofOfAddress,
                DocumentType::TaxId,
            ],
            Self::Enterprise => &[
                DocumentType::Passport,
                DocumentType::ProofOfAddress,
                DocumentType::TaxId,
                DocumentType::BusinessLicense,
            ],
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum DocumentType {
    Passport,
    License,
    ProofOfAddress,
    TaxId,
    BusinessLicense,
    BankStatement,
}

impl DocumentType {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Passport => "passport",
            Self::License => "license",
            Self::ProofOfAddress => "proof_of_address",
            Self::TaxId => "tax_id",
            Self::BusinessLicense => "business_license",
            Self::BankStatement => "bank_statement",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "passport" => Some(Self::Passport),
            "license" => Some(Self::License),
            "proof_of_address" => Some(Self::ProofOfAddress),
            "tax_id" => Some(Self::TaxId),
            "business_license" => Some(Self::BusinessLicense),
            "bank_statement" => Some(Self::BankStatement),
            _ => None,
        }
    }
}

/// Review standing of a single uploaded document. A resubmission puts the
/// document back to `pending`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    Pending,
    Verified,
    Rejected,
}

impl DocumentStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Verified => "verified",
            Self::Rejected => "rejected",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "verified" => Some(Self::Verified),
            "rejected" => Some(Self::Rejected),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum KycStatus {
    NotStarted,
    Pending,
    UnderReview,
    Verified,
    Rejected,
}

impl KycStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::Pending => "pending",
            Self::UnderReview => "under_review",
            Self::Verified => "verified",
            Self::Rejected => "rejected",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "not_started" => Some(Self::NotStarted),
            "pending" => Some(Self::Pending),
            "under_review" => Some(Self::UnderReview),
            "verified" => Some(Self::Verified),
            "rejected" => Some(Self::Rejected),
            _ => None,
        }
    }

    /// Review state machine. A rejected user may resubmit (back to pending),
    /// and a verified user re-enters review when verification lapses.
    pub fn can_transition(self, to: Self) -> bool {
        matches!(
            (self, to),
            (Self::NotStarted, Self::Pending)
                | (Self::Pending, Self::UnderReview | Self::Verified | Self::Rejected)
                | (Self::UnderReview, Self::Verified | Self::Rejected)
                | (Self::Rejected, Self::Pending)
                | (Self::Verified, Self::UnderReview)
        )
    }
}

/// Aggregate review standing for a target level, derived from per-document
/// decisions. One rejected required document rejects the whole review until
/// it is resubmitted; verification needs every required document
/// individually verified.
pub fn aggregate_status(
    target: KycLevel,
    documents: &[(DocumentType, DocumentStatus)],
) -> KycStatus {
    let required = target.required_documents();
    let standing_of = |kind: DocumentType| {
        documents
            .iter()
            .filter(|(have, _)| *have == kind)
            .map(|(_, status)| *status)
            .next_back()
    };

    if required
        .iter()
        .any(|&kind| standing_of(kind) == Some(DocumentStatus::Rejected))
    {
        return KycStatus::Rejected;
    }
    if !required.is_empty()
        && required
            .iter()
            .all(|&kind| standing_of(kind) == Some(DocumentStatus::Verified))
    {
        return KycStatus::Verified;
    }
    if documents.is_empty() {
        KycStatus::NotStarted
    } else {
        KycStatus::UnderReview
    }
}

/// Accepted upload formats, detected from content rather than the declared
/// Content-Type.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DocumentFormat {
    Jpeg,
    Png,
    Webp,
    Pdf,
}

impl DocumentFormat {
    pub const fn mime(self) -> &'static str {
        match self {
            Self::Jpeg => "image/jpeg",
            Self::Png => "image/png",
            Self::Webp => "image/webp",
            Self::Pdf => "application/pdf",
        }
    }
}

fn sniff_format(bytes: &[u8]) -> Option<DocumentFormat> {
    if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
        Some(DocumentFormat::Jpeg)
    } else if bytes.starts_with(&[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A]) {
        Some(DocumentFormat::Png)
    } else if bytes.len() >= 12 && bytes.starts_with(b"RIFF") && &bytes[8..12] == b"WEBP" {
        Some(DocumentFormat::Webp)
    } else if bytes.starts_with(b"%PDF-") {
        Some(DocumentFormat::Pdf)
    } else {
        None
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum DocumentRejection {
    Empty,
    TooLarge,
    UnsupportedFormat,
}

impl DocumentRejection {
    pub const fn message(&self) -> &'static str {
        match self {
            Self::Empty => "Empty document",
            Self::TooLarge => "Document exceeds the 10 MB limit",
            Self::UnsupportedFormat => "Unsupported document format",
        }
    }
}

/// Validate an upload before anything touches storage.
pub fn validate_document(bytes: &[u8]) -> Result<DocumentFormat, DocumentRejection> {
    if bytes.is_empty() {
        return Err(DocumentRejection::Empty);
    }
    if bytes.len() > MAX_DOCUMENT_BYTES {
        return Err(DocumentRejection::TooLarge);
    }
    sniff_format(bytes).ok_or(DocumentRejection::UnsupportedFormat)
}
