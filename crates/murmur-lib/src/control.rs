//! HTTP control API for a synthesis session.
//!
//! CORS-permissive so browser front-ends on localhost can drive it.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;

use murmur_core::types::{MessageType, SessionStatus, VoiceDescriptor, VoiceParams, VoiceType};

use crate::session::{SessionError, SynthesisSession};

/// Build the axum router around a shared session.
pub fn router(session: Arc<SynthesisSession>) -> Router {
    Router::new()
        .route("/speak", post(speak))
        .route("/stop", post(stop))
        .route("/pause", post(pause))
        .route("/status", get(status))
        .route("/voices", get(voices))
        .layer(CorsLayer::permissive())
        .with_state(session)
}

#[derive(Debug, Deserialize, Serialize)]
pub struct SpeakRequest {
    pub text: String,
    #[serde(default, rename = "type")]
    pub msg_type: MessageType,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub voice_type: Option<VoiceType>,
    #[serde(default)]
    pub voice: Option<String>,
    #[serde(default)]
    pub rate: Option<i32>,
    #[serde(default)]
    pub pitch: Option<i32>,
    #[serde(default)]
    pub volume: Option<i32>,
}

impl SpeakRequest {
    pub fn params(&self) -> VoiceParams {
        let defaults = VoiceParams::default();
        VoiceParams {
            language: self.language.clone().unwrap_or(defaults.language),
            voice_type: self.voice_type.unwrap_or(defaults.voice_type),
            synthesis_voice: self.voice.clone(),
            rate: self.rate.unwrap_or(defaults.rate),
            pitch: self.pitch.unwrap_or(defaults.pitch),
            volume: self.volume.unwrap_or(defaults.volume),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SpeakResponse {
    pub ok: bool,
    pub accepted: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct OkResponse {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

struct ApiError(StatusCode, String);

impl From<SessionError> for ApiError {
    fn from(e: SessionError) -> Self {
        let status = match e {
            SessionError::Params(_) => StatusCode::BAD_REQUEST,
            SessionError::Closed => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        ApiError(status, e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = OkResponse {
            ok: false,
            error: Some(self.1),
        };
        (self.0, Json(body)).into_response()
    }
}

async fn speak(
    State(session): State<Arc<SynthesisSession>>,
    Json(req): Json<SpeakRequest>,
) -> Result<Json<SpeakResponse>, ApiError> {
    let accepted = session.speak(req.text.as_bytes(), req.msg_type, &req.params())?;
    if accepted == 0 && !req.text.is_empty() {
        return Err(ApiError(StatusCode::CONFLICT, "busy".into()));
    }
    Ok(Json(SpeakResponse { ok: true, accepted }))
}

async fn stop(State(session): State<Arc<SynthesisSession>>) -> Result<Json<OkResponse>, ApiError> {
    session.stop()?;
    Ok(Json(OkResponse { ok: true, error: None }))
}

async fn pause(State(session): State<Arc<SynthesisSession>>) -> Result<Json<OkResponse>, ApiError> {
    match session.pause() {
        Ok(()) => Ok(Json(OkResponse { ok: true, error: None })),
        Err(e @ SessionError::PauseUnsupported) => Ok(Json(OkResponse {
            ok: false,
            error: Some(e.to_string()),
        })),
        Err(e) => Err(e.into()),
    }
}

async fn status(State(session): State<Arc<SynthesisSession>>) -> Json<SessionStatus> {
    Json(session.status())
}

async fn voices(
    State(session): State<Arc<SynthesisSession>>,
) -> Result<Json<Vec<VoiceDescriptor>>, ApiError> {
    Ok(Json(session.list_voices()?.to_vec()))
}
