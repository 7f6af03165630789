//! /peer/* handlers: the dfget-facing piece protocol.

use axum::extract::rejection::JsonRejection;
use axum::extract::{Query, State};
use axum::Json;

use drift_core::types::{
    PullPieceParams, ReportPieceParams, ResultInfo, ServiceDownParams, TaskRegisterRequest,
};
use drift_core::wire::codes;
use drift_services::ProtocolError;

use super::{ApiError, ApiState};

type ApiResult = Result<Json<ResultInfo>, ApiError>;

// ── /peer/registry (POST) ─────────────────────────────────────────────────────

pub async fn handle_register(
    State(state): State<ApiState>,
    body: Result<Json<TaskRegisterRequest>, JsonRejection>,
) -> ApiResult {
    let Json(req) = body.map_err(|e| ProtocolError::InvalidParam(e.body_text()))?;
    let data = state.protocol.register(req).await?;
    Ok(Json(ResultInfo::with_data(codes::SUCCESS, &data)))
}

// ── /peer/task (GET) ──────────────────────────────────────────────────────────

pub async fn handle_pull_piece_task(
    State(state): State<ApiState>,
    Query(params): Query<PullPieceParams>,
) -> ApiResult {
    Ok(Json(state.protocol.pull_piece_task(params).await?))
}

// ── /peer/piece/suc (GET) ─────────────────────────────────────────────────────

pub async fn handle_report_piece(
    State(state): State<ApiState>,
    Query(params): Query<ReportPieceParams>,
) -> ApiResult {
    Ok(Json(state.protocol.report_piece(params).await?))
}

// ── /peer/service/down (GET) ──────────────────────────────────────────────────

pub async fn handle_service_down(
    State(state): State<ApiState>,
    Query(params): Query<ServiceDownParams>,
) -> ApiResult {
    Ok(Json(state.protocol.report_service_down(params).await?))
}
