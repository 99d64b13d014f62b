use std::fmt::Write;

use axum::Json;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use tracing::{debug, warn};

use lumberjack_lodge::{Directory, LodgeError};
use lumberjack_types::{Fellow, slug};

use super::{AppState, wants_json};

/// `GET /` - fellows currently within their curfew
pub async fn index(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let fellows = match state.lodge.alive_lumberjacks().await {
        Ok(fellows) => fellows,
        Err(e) => return unreachable_lodge(e),
    };

    if wants_json(&headers) {
        Json(Directory { fellows }).into_response()
    } else {
        render_fellows(&fellows).into_response()
    }
}

/// `GET /lodge` - every known fellow, dead or alive
pub async fn directory(State(state): State<AppState>) -> Response {
    match state.lodge.full_directory().await {
        Ok(directory) => Json(directory).into_response(),
        Err(e) => unreachable_lodge(e),
    }
}

/// `POST /lodge` - a fellow checking in
pub async fn check_in(State(state): State<AppState>, body: Bytes) -> Response {
    match state.lodge.receive_check_in_json(&body) {
        Ok(outcome) => {
            debug!(?outcome, "Check-in accepted");
            StatusCode::OK.into_response()
        }
        Err(e) => (status_for(&e), e.to_string()).into_response(),
    }
}

fn unreachable_lodge(error: LodgeError) -> Response {
    warn!(error = %error, "Failed to read the lodge");
    (StatusCode::BAD_GATEWAY, error.to_string()).into_response()
}

fn status_for(error: &LodgeError) -> StatusCode {
    match error {
        LodgeError::PastCurfew(_) => StatusCode::FORBIDDEN,
        LodgeError::NotAuthoritative(_) => StatusCode::CONFLICT,
        LodgeError::Wire(_) => StatusCode::BAD_REQUEST,
        LodgeError::Http(_) | LodgeError::Rejected { .. } => StatusCode::BAD_GATEWAY,
    }
}

fn render_fellows(fellows: &[Fellow]) -> String {
    let now = Utc::now();
    let mut out = String::new();

    if fellows.is_empty() {
        out.push_str("No lumberjacks checked in\n");
    }
    for fellow in fellows {
        let seen = (now - fellow.last_checked_in).num_seconds().max(0);
        let _ = writeln!(out, "{} (checked in {}s ago)", fellow.name, seen);
        for file in &fellow.lumberfiles {
            let _ = writeln!(out, "  {}  /proxy/{}/{}", file.path, fellow.name, slug(&file.path));
        }
    }
    out
}
