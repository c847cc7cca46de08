//! Quota routes

use axum::{
    extract::{Extension, Query, State},
    Json,
};
use serde::Deserialize;
use teranga_monetization::{QuotaPeriod, QuotaStatus};

use crate::{auth::AuthUser, error::ApiResult, state::AppState};

const DEFAULT_HISTORY_MONTHS: u32 = 6;

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub months: Option<u32>,
}

/// GET /quota
pub async fn get_quota(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<QuotaStatus>> {
    let status = state
        .monetization
        .quota
        .get_status(auth_user.user_id)
        .await?;

    Ok(Json(status))
}

/// GET /quota/history?months=
pub async fn get_quota_history(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Query(query): Query<HistoryQuery>,
) -> ApiResult<Json<Vec<QuotaPeriod>>> {
    let months = query.months.unwrap_or(DEFAULT_HISTORY_MONTHS);
    let periods = state
        .monetization
        .quota
        .get_history(auth_user.user_id, months)
        .await?;

    Ok(Json(periods))
}
