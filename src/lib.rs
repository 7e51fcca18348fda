// 모듈 선언
pub mod config;
pub mod error;
pub mod utils;
pub mod models;
pub mod database;
pub mod duplicate;
pub mod history;
pub mod auth;
pub mod pipeline;
pub mod render;
pub mod api;
pub mod client;

// 자주 쓰는 타입 재export
pub use api::{router, AppState};
pub use config::AppConfig;
pub use database::HistoryDb;
pub use error::{AppError, AppResult};
pub use models::{Detection, DetectorKind, InferenceEngine, ModelVariant, ObjectDetector};

/// 설정으로 서버 상태 구성 (DB 열기, 모델 정보 등록, 엔진 준비)
///
/// 모델은 첫 예측 요청 때 로드된다.
pub fn build_state(config: AppConfig) -> AppResult<AppState> {
    let db = HistoryDb::open(&config.database.path)?;
    db.seed_model_info(&config.model)?;

    for kind in DetectorKind::ALL {
        let path = config.model.model_path(kind.config(&config.model));
        if !path.exists() {
            tracing::warn!("{} 모델 파일이 없습니다: {}", kind.display_name(), path.display());
        }
    }

    let engine = InferenceEngine::new(config.model.clone());
    Ok(AppState::new(db, engine, config))
}
