//! /supernodes handler.

use axum::extract::State;
use axum::Json;
use serde::Serialize;

use drift_core::types::ResultInfo;
use drift_core::wire::codes;
use drift_services::membership::SupernodeStatus;

use super::ApiState;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SupernodesResponse {
    pub local_pid: String,
    pub ha_enabled: bool,
    pub supernodes: Vec<SupernodeStatus>,
}

pub async fn handle_supernodes(State(state): State<ApiState>) -> Json<ResultInfo> {
    let table = state.protocol.table();
    let resp = SupernodesResponse {
        local_pid: table.local_pid().to_string(),
        ha_enabled: state.ha_enabled,
        supernodes: table.status().await,
    };
    Json(ResultInfo::with_data(codes::SUCCESS, &resp))
}
