// `/v1/api/ml` 추론 엔드포인트
use axum::extract::multipart::MultipartError;
use axum::extract::{Multipart, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use std::collections::HashMap;

use super::AppState;
use crate::auth::CurrentUser;
use crate::error::{AppError, AppResult};
use crate::models::{DetectorKind, ModelStatus, ModelVariant};
use crate::pipeline::{self, PredictionRequest, UploadedImage};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/models/info", get(model_info))
        .route("/models", get(list_models))
        .route("/config", get(config))
        .route("/predict/rfdetr", post(predict_rfdetr))
        .route("/predict/yolo", post(predict_yolo))
        .route("/predict/both", post(predict_both))
        .route("/health", get(health))
}

/// 추론 엔진 상태 조회 (추론 중이면 잠금을 기다리므로 블로킹 스레드에서 실행)
async fn engine_status(state: &AppState) -> AppResult<HashMap<DetectorKind, ModelStatus>> {
    let engine = state.engine.clone();
    tokio::task::spawn_blocking(move || -> AppResult<HashMap<DetectorKind, ModelStatus>> {
        let engine = engine
            .lock()
            .map_err(|_| AppError::InferenceError("추론 엔진 잠금 실패".to_string()))?;
        Ok(DetectorKind::ALL
            .into_iter()
            .map(|kind| (kind, engine.model_status(kind)))
            .collect())
    })
    .await
    .map_err(|e| AppError::InferenceError(format!("작업 실행 실패: {}", e)))?
}

async fn model_info(State(state): State<AppState>, _user: CurrentUser) -> AppResult<Json<Value>> {
    let status = engine_status(&state).await?;
    Ok(Json(json!({
        "rfdetr": status.get(&DetectorKind::RfDetr),
        "yolo": status.get(&DetectorKind::Yolo),
    })))
}

async fn list_models(State(state): State<AppState>, _user: CurrentUser) -> AppResult<Json<Value>> {
    let models = state.db.list_active_models()?;
    Ok(Json(json!({ "models": models })))
}

async fn config(State(state): State<AppState>, _user: CurrentUser) -> Json<Value> {
    let config = &state.config;
    Json(json!({
        "upload": {
            "max_file_size_mb": config.upload.max_file_size_mb(),
            "max_file_size_bytes": config.upload.max_file_size,
            "allowed_extensions": config.upload.allowed_extensions,
        },
        "models": {
            "rfdetr": { "default_confidence_threshold": config.model.rfdetr.default_confidence_threshold },
            "yolo": { "default_confidence_threshold": config.model.yolo.default_confidence_threshold },
        }
    }))
}

async fn health(State(state): State<AppState>, _user: CurrentUser) -> (StatusCode, Json<Value>) {
    match engine_status(&state).await {
        Ok(status) => {
            let loaded = |kind: DetectorKind| status.get(&kind).map(|s| s.loaded).unwrap_or(false);
            (
                StatusCode::OK,
                Json(json!({
                    "status": "healthy",
                    "models": {
                        "rfdetr_loaded": loaded(DetectorKind::RfDetr),
                        "yolo_loaded": loaded(DetectorKind::Yolo),
                    }
                })),
            )
        }
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "status": "unhealthy", "error": e.to_string() })),
        ),
    }
}

/// multipart 본문: `image` 파일과 나머지 텍스트 필드
#[derive(Debug, Default)]
struct PredictForm {
    image: Option<UploadedImage>,
    fields: HashMap<String, String>,
}

impl PredictForm {
    fn threshold(&self, name: &str) -> AppResult<Option<f64>> {
        match self.fields.get(name).map(|v| v.trim()) {
            None | Some("") => Ok(None),
            Some(value) => value
                .parse()
                .map(Some)
                .map_err(|_| AppError::ValidationError(format!("{} must be a number", name))),
        }
    }
}

fn multipart_error(e: MultipartError) -> AppError {
    if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
        AppError::PayloadTooLarge(e.body_text())
    } else {
        AppError::ValidationError(format!("Invalid multipart body: {}", e.body_text()))
    }
}

async fn read_form(mut multipart: Multipart) -> AppResult<PredictForm> {
    let mut form = PredictForm::default();
    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        let name = field.name().unwrap_or_default().to_string();
        if name == "image" {
            let file_name = field.file_name().unwrap_or("upload").to_string();
            let content_type = field.content_type().map(|ct| ct.to_string());
            let bytes = field.bytes().await.map_err(multipart_error)?;
            form.image = Some(UploadedImage {
                file_name,
                content_type,
                bytes: bytes.to_vec(),
            });
        } else {
            let value = field.text().await.map_err(multipart_error)?;
            form.fields.insert(name, value);
        }
    }
    Ok(form)
}

async fn predict(state: AppState, user: CurrentUser, variant: ModelVariant, multipart: Multipart) -> AppResult<Json<Value>> {
    let mut form = read_form(multipart).await?;
    let image = form
        .image
        .take()
        .ok_or_else(|| AppError::ValidationError("No image field in request".to_string()))?;

    let (rfdetr_threshold, yolo_threshold) = match variant {
        ModelVariant::RfDetr => (form.threshold("confidence_threshold")?, None),
        ModelVariant::Yolo => (None, form.threshold("confidence_threshold")?),
        ModelVariant::Both => (
            form.threshold("rfdetr_confidence_threshold")?,
            form.threshold("yolo_confidence_threshold")?,
        ),
    };

    let CurrentUser(user) = user;
    let request = PredictionRequest {
        variant,
        image,
        rfdetr_threshold,
        yolo_threshold,
        comment: form.fields.remove("comment"),
        user_id: Some(user.id),
    };
    tracing::info!(
        model = %variant,
        user = %user.username,
        file = %request.image.file_name,
        bytes = request.image.bytes.len(),
        "예측 요청"
    );

    let outcome = tokio::task::spawn_blocking(move || {
        pipeline::run_prediction(&state.db, &state.engine, &state.config, request)
    })
    .await
    .map_err(|e| AppError::InferenceError(format!("추론 작업 실패: {}", e)))??;

    Ok(Json(outcome.to_json()?))
}

async fn predict_rfdetr(State(state): State<AppState>, user: CurrentUser, multipart: Multipart) -> AppResult<Json<Value>> {
    predict(state, user, ModelVariant::RfDetr, multipart).await
}

async fn predict_yolo(State(state): State<AppState>, user: CurrentUser, multipart: Multipart) -> AppResult<Json<Value>> {
    predict(state, user, ModelVariant::Yolo, multipart).await
}

async fn predict_both(State(state): State<AppState>, user: CurrentUser, multipart: Multipart) -> AppResult<Json<Value>> {
    predict(state, user, ModelVariant::Both, multipart).await
}
