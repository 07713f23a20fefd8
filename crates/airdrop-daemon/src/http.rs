//! HTTP routes.
//!
//! | Method | Path                          | Result                         |
//! |--------|-------------------------------|--------------------------------|
//! | GET    | `/`                           | plain-text liveness line       |
//! | POST   | `/claims`                     | run one claim to completion    |
//! | GET    | `/participants/{id}/status`   | state of one participant       |
//! | GET    | `/winners`                    | settled participants, in order |
//! | GET    | `/stats`                      | ledger counters and capacity   |
//!
//! Every error body is `{"kind": ..., "detail": ...}` so callers branch on
//! `kind` rather than on message text.

use airdrop_core::claim::{ClaimCoordinator, ClaimError, ClaimRequest};
use airdrop_core::ledger::{ClaimState, LedgerError};
use airdrop_core::status::{DistributionStats, StatusReader, WinnerEntry};
use airdrop_core::{TransferReference, WalletAddress};
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, warn};

/// Name shown in the winners list for participants without a display name.
pub const ANONYMOUS: &str = "Anonymous";

/// Shared handler state.
#[derive(Debug, Clone)]
pub struct AppState {
    pub coordinator: ClaimCoordinator,
    pub reader: StatusReader,
}

/// Builds the daemon's router.
#[must_use]
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(liveness))
        .route("/claims", post(submit_claim))
        .route("/participants/{id}/status", get(participant_status))
        .route("/winners", get(winners))
        .route("/stats", get(stats))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ClaimBody {
    participant_id: String,
    wallet_address: String,
    #[serde(default)]
    display_name: Option<String>,
}

#[derive(Debug, Serialize)]
struct ClaimAccepted {
    status: &'static str,
    participant_id: String,
    wallet_address: WalletAddress,
    transfer_reference: TransferReference,
}

#[derive(Debug, Serialize)]
struct StatusBody {
    participant_id: String,
    state: ClaimState,
    #[serde(skip_serializing_if = "Option::is_none")]
    transfer_reference: Option<TransferReference>,
    #[serde(skip_serializing_if = "Option::is_none")]
    failure_cause: Option<String>,
}

#[derive(Debug, Serialize)]
struct WinnersBody {
    total: usize,
    winners: Vec<WinnerBody>,
}

#[derive(Debug, Serialize)]
struct WinnerBody {
    username: String,
    wallet_address: WalletAddress,
    join_date: NaiveDate,
    transfer_reference: TransferReference,
}

impl From<WinnerEntry> for WinnerBody {
    fn from(entry: WinnerEntry) -> Self {
        Self {
            username: entry.display_name.unwrap_or_else(|| ANONYMOUS.to_string()),
            wallet_address: entry.wallet_address,
            join_date: entry.join_date.date_naive(),
            transfer_reference: entry.transfer_reference,
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<String>,
}

async fn liveness() -> &'static str {
    "Airdrop claim service is running\n"
}

async fn submit_claim(
    State(state): State<AppState>,
    body: Result<Json<ClaimBody>, JsonRejection>,
) -> Result<Json<ClaimAccepted>, ApiError> {
    let Json(body) = body.map_err(|rejection| ApiError::BadRequest(rejection.body_text()))?;

    let mut request = ClaimRequest::new(body.participant_id, body.wallet_address);
    if let Some(name) = body.display_name {
        request = request.with_display_name(name);
    }

    let settled = state.coordinator.submit_claim(request).await?;
    Ok(Json(ClaimAccepted {
        status: "accepted",
        participant_id: settled.participant_id,
        wallet_address: settled.wallet_address,
        transfer_reference: settled.transfer_reference,
    }))
}

async fn participant_status(
    State(state): State<AppState>,
    Path(participant_id): Path<String>,
) -> Result<Json<StatusBody>, ApiError> {
    let status = state
        .reader
        .status_of(&participant_id)
        .await?
        .ok_or(ApiError::NotFound)?;

    Ok(Json(StatusBody {
        participant_id,
        state: status.state,
        transfer_reference: status.transfer_reference,
        failure_cause: status.failure_cause,
    }))
}

async fn winners(State(state): State<AppState>) -> Result<Json<WinnersBody>, ApiError> {
    let list = state.reader.winners().await?;
    Ok(Json(WinnersBody {
        total: list.total,
        winners: list.winners.into_iter().map(WinnerBody::from).collect(),
    }))
}

async fn stats(State(state): State<AppState>) -> Result<Json<DistributionStats>, ApiError> {
    Ok(Json(state.reader.stats().await?))
}

/// Errors surfaced by the HTTP layer.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Claim(#[from] ClaimError),

    #[error("invalid request body: {0}")]
    BadRequest(String),

    #[error("participant not found")]
    NotFound,

    #[error("ledger unavailable: {0}")]
    Ledger(#[from] LedgerError),
}

impl ApiError {
    /// Stable machine-readable kind.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Claim(err) => err.kind(),
            Self::BadRequest(_) => "invalid_request",
            Self::NotFound => "not_found",
            Self::Ledger(_) => "unavailable",
        }
    }

    #[must_use]
    pub const fn status_code(&self) -> StatusCode {
        match self {
            Self::Claim(err) => match err {
                ClaimError::InvalidAddress(_) | ClaimError::InvalidParticipantId { .. } => {
                    StatusCode::BAD_REQUEST
                },
                ClaimError::Rejected(_) => StatusCode::CONFLICT,
                ClaimError::ProcessingFailed(_) => StatusCode::BAD_GATEWAY,
                ClaimError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::Ledger(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// Client-facing detail. Storage internals are logged, not returned.
    fn detail(&self) -> Option<String> {
        match self {
            Self::Claim(ClaimError::ProcessingFailed(failure)) => {
                Some(failure.cause.as_str().to_string())
            },
            Self::Claim(
                ClaimError::InvalidAddress(_)
                | ClaimError::InvalidParticipantId { .. }
                | ClaimError::Rejected(_),
            )
            | Self::BadRequest(_) => Some(self.to_string()),
            Self::Claim(ClaimError::ReconciliationFailed { participant_id, .. }) => Some(format!(
                "transfer outcome for {participant_id} could not be recorded; an operator has been alerted"
            )),
            Self::Claim(_) | Self::Ledger(_) => Some("service is temporarily unavailable".to_string()),
            Self::NotFound => None,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            error!(kind = self.kind(), error = %self, "Request failed");
        } else if status == StatusCode::BAD_GATEWAY {
            warn!(kind = self.kind(), error = %self, "Transfer failed");
        }

        let body = ErrorBody {
            kind: self.kind(),
            detail: self.detail(),
        };
        (status, Json(body)).into_response()
    }
}
