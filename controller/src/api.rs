use std::collections::HashMap;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::warn;

use heatzone_common::{DatagramCipher, EncryptionConfig, HeatingError, ZoneView};

use crate::host::{monotonic_ms, AppState};

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct HcUrlBody {
    url: Option<String>,
}

#[derive(Debug, Serialize)]
struct UdpKeyStatus {
    encrypted: bool,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/zones", get(handle_list_zones))
        .route("/api/zones/{name}", get(handle_get_zone))
        .route("/api/zones/{name}/clear", post(handle_clear_zone))
        .route(
            "/api/zones/{name}/relay",
            put(handle_put_relay).delete(handle_delete_relay),
        )
        .route("/api/temp/set", post(handle_temp_set))
        .route("/api/heating/hc", get(handle_get_hc).put(handle_put_hc))
        .route(
            "/api/udp/key",
            get(handle_get_udp_key)
                .put(handle_put_udp_key)
                .delete(handle_delete_udp_key),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn handle_list_zones(State(state): State<AppState>) -> impl IntoResponse {
    let zones: Vec<ZoneView> = state.heating.iter().map(|zone| ZoneView::from(&zone)).collect();
    Json(zones)
}

async fn handle_get_zone(State(state): State<AppState>, Path(name): Path<String>) -> Response {
    match state.heating.find_or_create(&name, false) {
        Some(zone) => Json(ZoneView::from(&zone)).into_response(),
        None => error_response(StatusCode::NOT_FOUND, "Unknown zone"),
    }
}

/// Ingests a value and/or a setpoint for one zone, as a local sensor or panel would.
async fn handle_temp_set(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let Some(name) = params.get("zone") else {
        return error_response(StatusCode::BAD_REQUEST, "Missing 'zone' parameter");
    };
    let value = match params.get("val").map(|raw| raw.parse::<f32>()) {
        Some(Ok(value)) => Some(value),
        Some(Err(_)) => return error_response(StatusCode::BAD_REQUEST, "Invalid 'val' parameter"),
        None => None,
    };
    let setpoint = match params.get("set").map(|raw| raw.parse::<f32>()) {
        Some(Ok(setpoint)) => Some(setpoint),
        Some(Err(_)) => return error_response(StatusCode::BAD_REQUEST, "Invalid 'set' parameter"),
        None => None,
    };
    if value.is_none() && setpoint.is_none() {
        return error_response(StatusCode::BAD_REQUEST, "Missing 'val' or 'set' parameter");
    }

    let now_ms = monotonic_ms();
    if let Some(setpoint) = setpoint {
        if let Err(err) = state.heating.record_setpoint(name, setpoint, true, now_ms) {
            return heating_error_response(err);
        }
    }
    if let Some(value) = value {
        if state.heating.record_sample(name, value, true, now_ms).is_none() {
            return error_response(StatusCode::BAD_REQUEST, "Invalid zone name");
        }
    }

    handle_get_zone(State(state), Path(name.clone())).await
}

async fn handle_put_relay(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let Some(value) = params.get("relay") else {
        return error_response(StatusCode::BAD_REQUEST, "Missing 'relay' parameter");
    };
    let Ok(relay) = value.parse::<u8>() else {
        return error_response(StatusCode::BAD_REQUEST, "Invalid relay number");
    };

    match state.heating.set_relay(&name, Some(relay)) {
        Ok(_) => {
            state.heating.evaluate(&name, monotonic_ms());
            handle_get_zone(State(state), Path(name)).await
        }
        Err(err) => heating_error_response(err),
    }
}

async fn handle_delete_relay(State(state): State<AppState>, Path(name): Path<String>) -> Response {
    match state.heating.set_relay(&name, None) {
        Ok(zone) => Json(ZoneView::from(&zone)).into_response(),
        Err(err) => heating_error_response(err),
    }
}

async fn handle_clear_zone(State(state): State<AppState>, Path(name): Path<String>) -> Response {
    if state.heating.find_or_create(&name, false).is_none() {
        return error_response(StatusCode::NOT_FOUND, "Unknown zone");
    }
    match state.heating.clear(&name) {
        Ok(zone) => Json(ZoneView::from(&zone)).into_response(),
        Err(err) => heating_error_response(err),
    }
}

async fn handle_get_hc(State(state): State<AppState>) -> impl IntoResponse {
    Json(HcUrlBody {
        url: state.heating.hc_url_get(),
    })
}

async fn handle_put_hc(State(state): State<AppState>, Json(body): Json<HcUrlBody>) -> Response {
    if let Err(err) = state.heating.hc_url_set(body.url.as_deref()) {
        return heating_error_response(err);
    }
    handle_get_hc(State(state)).await.into_response()
}

async fn handle_get_udp_key(State(state): State<AppState>) -> impl IntoResponse {
    Json(UdpKeyStatus {
        encrypted: state.framing.is_encrypted(),
    })
}

/// Rotates the shared UDP key. Peers must be re-provisioned with the same material.
async fn handle_put_udp_key(
    State(state): State<AppState>,
    Json(material): Json<EncryptionConfig>,
) -> Response {
    let cipher = match DatagramCipher::from_config(&material) {
        Ok(cipher) => cipher,
        Err(err) => return error_response(StatusCode::BAD_REQUEST, &err.to_string()),
    };
    state.framing.rekey(Some(cipher));
    store_encryption(&state, Some(material)).await
}

async fn handle_delete_udp_key(State(state): State<AppState>) -> Response {
    state.framing.rekey(None);
    store_encryption(&state, None).await
}

async fn store_encryption(state: &AppState, material: Option<EncryptionConfig>) -> Response {
    let snapshot = {
        let mut runtime = state.runtime.lock().await;
        runtime.sync.encryption = material;
        runtime.clone()
    };
    if let Err(err) = state.store.save_runtime_config(&snapshot).await {
        warn!("failed to persist udp key: {err:#}");
        return error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to persist runtime settings",
        );
    }
    handle_get_udp_key(State(state.clone())).await.into_response()
}

fn heating_error_response(err: HeatingError) -> Response {
    match err {
        HeatingError::Storage(err) => {
            warn!("zone storage failed: {err}");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to persist zone")
        }
        other => error_response(StatusCode::BAD_REQUEST, &other.to_string()),
    }
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (
        status,
        Json(ErrorBody {
            error: message.to_string(),
        }),
    )
        .into_response()
}
