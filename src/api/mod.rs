//! REST API (axum)
//!
//! `/v1/api/ml`, `/v1/api/history`, `/v1/api/auth` 와 루트 경로를 하나의 라우터로 묶는다.

pub mod auth;
pub mod history;
pub mod ml;
pub mod system;

use ab_glyph::FontVec;
use axum::extract::DefaultBodyLimit;
use axum::http::HeaderValue;
use axum::routing::get;
use axum::Router;
use std::sync::{Arc, Mutex};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::{AppConfig, ServerConfig};
use crate::database::HistoryDb;
use crate::models::InferenceEngine;
use crate::render;

/// 핸들러 공유 상태
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<HistoryDb>,
    pub engine: Arc<Mutex<InferenceEngine>>,
    pub config: Arc<AppConfig>,
    pub font: Option<Arc<FontVec>>,
}

impl AppState {
    pub fn new(db: HistoryDb, engine: InferenceEngine, config: AppConfig) -> Self {
        let font = config
            .render
            .font_path
            .as_deref()
            .and_then(|path| match render::load_font(path) {
                Ok(font) => Some(Arc::new(font)),
                Err(e) => {
                    tracing::warn!("라벨 폰트 로드 실패, 텍스트 없이 렌더링: {}", e);
                    None
                }
            });
        Self {
            db: Arc::new(db),
            engine: Arc::new(Mutex::new(engine)),
            config: Arc::new(config),
            font,
        }
    }
}

/// 전체 라우터 구성
pub fn router(state: AppState) -> Router {
    // 크기 초과는 핸들러에서 413 + 안내 메시지로 응답
    let body_limit = state.config.upload.max_file_size + 1024 * 1024;

    Router::new()
        .route("/", get(system::root))
        .route("/health", get(system::health))
        .route("/export/history", get(history::export_history))
        .nest("/v1/api/ml", ml::routes())
        .nest("/v1/api/history", history::routes())
        .nest("/v1/api/auth", auth::routes())
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(cors_layer(&state.config.server))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn cors_layer(config: &ServerConfig) -> CorsLayer {
    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if config.cors_origins.is_empty() {
        return layer.allow_origin(Any);
    }
    let origins: Vec<HeaderValue> = config
        .cors_origins
        .iter()
        .filter_map(|origin| match origin.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!("잘못된 CORS origin 무시: {}", origin);
                None
            }
        })
        .collect();
    layer.allow_origin(AllowOrigin::list(origins))
}
