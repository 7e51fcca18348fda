use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

/// 애플리케이션 에러 타입
#[derive(Error, Debug)]
pub enum AppError {
    #[error("이미지 처리 오류: {0}")]
    ImageError(#[from] image::ImageError),

    #[error("ONNX 런타임 오류: {0}")]
    OrtError(String),

    #[error("데이터베이스 오류: {0}")]
    DatabaseError(#[from] rusqlite::Error),

    #[error("데이터베이스 연결 사용 불가: {0}")]
    DatabaseUnavailable(String),

    #[error("JSON 직렬화 오류: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("파일 시스템 오류: {0}")]
    IoError(#[from] std::io::Error),

    #[error("HTTP 요청 오류: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("모델 로드 오류: {0}")]
    ModelError(String),

    #[error("추론 오류: {0}")]
    InferenceError(String),

    #[error("렌더링 오류: {0}")]
    RenderError(String),

    #[error("설정 오류: {0}")]
    ConfigError(String),

    #[error("유효하지 않은 입력: {0}")]
    ValidationError(String),

    #[error("업로드 크기 초과: {0}")]
    PayloadTooLarge(String),

    #[error("인증 실패: {0}")]
    Unauthorized(String),

    #[error("권한 없음: {0}")]
    Forbidden(String),

    #[error("찾을 수 없음: {0}")]
    NotFound(String),

    #[error("중복: {0}")]
    Conflict(String),

    #[error("비밀번호 해시 오류: {0}")]
    PasswordHash(String),

    /// 서버가 에러 응답을 돌려준 경우 (클라이언트 측)
    #[error("API 오류 ({status}): {detail}")]
    ApiError { status: u16, detail: String },
}

/// 결과 타입 별칭
pub type AppResult<T> = Result<T, AppError>;

#[cfg(feature = "onnx")]
impl From<ort::OrtError> for AppError {
    fn from(e: ort::OrtError) -> Self {
        AppError::OrtError(e.to_string())
    }
}

impl AppError {
    /// HTTP 상태 코드 매핑
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::ValidationError(_) | AppError::Conflict(_) => StatusCode::BAD_REQUEST,
            AppError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            AppError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AppError::Forbidden(_) => StatusCode::FORBIDDEN,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::ApiError { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// 응답 본문의 `detail` 문자열
    pub fn detail(&self) -> String {
        match self {
            AppError::ValidationError(msg)
            | AppError::PayloadTooLarge(msg)
            | AppError::Unauthorized(msg)
            | AppError::Forbidden(msg)
            | AppError::NotFound(msg)
            | AppError::Conflict(msg)
            | AppError::ModelError(msg)
            | AppError::InferenceError(msg) => msg.clone(),
            AppError::ApiError { detail, .. } => detail.clone(),
            other => other.to_string(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!("요청 처리 실패: {}", self);
        } else {
            tracing::debug!("요청 거부 ({}): {}", status, self);
        }

        let body = Json(serde_json::json!({ "detail": self.detail() }));
        if status == StatusCode::UNAUTHORIZED {
            (status, [(header::WWW_AUTHENTICATE, "Bearer")], body).into_response()
        } else {
            (status, body).into_response()
        }
    }
}

/// 에러 컨텍스트를 위한 확장 트레이트
pub trait ErrorContext<T> {
    fn with_context<C>(self, context: C) -> AppResult<T>
    where
        C: std::fmt::Display;
}

impl<T, E> ErrorContext<T> for Result<T, E>
where
    E: Into<AppError>,
{
    fn with_context<C>(self, context: C) -> AppResult<T>
    where
        C: std::fmt::Display,
    {
        self.map_err(|e| {
            let app_error: AppError = e.into();
            match app_error {
                AppError::ModelError(msg) => AppError::ModelError(format!("{}: {}", context, msg)),
                AppError::InferenceError(msg) => {
                    AppError::InferenceError(format!("{}: {}", context, msg))
                }
                AppError::ConfigError(msg) => {
                    AppError::ConfigError(format!("{}: {}", context, msg))
                }
                // 모델/설정 이외의 실패는 추론 실패 메시지로 감싼다
                AppError::ImageError(e) => AppError::InferenceError(format!("{}: {}", context, e)),
                AppError::OrtError(msg) => AppError::InferenceError(format!("{}: {}", context, msg)),
                _ => app_error,
            }
        })
    }
}

/// 유효성 검사 헬퍼 함수들
pub mod validation {
    use super::*;

    /// 이미지 데이터 유효성 검사
    pub fn validate_image_data(data: &[u8]) -> AppResult<()> {
        if data.is_empty() {
            return Err(AppError::ValidationError("Uploaded file is empty".to_string()));
        }
        Ok(())
    }

    /// 신뢰도 임계값 유효성 검사
    pub fn validate_confidence_threshold(threshold: f64) -> AppResult<()> {
        if !(0.0..=1.0).contains(&threshold) {
            return Err(AppError::ValidationError(format!(
                "Confidence threshold must be between 0.0 and 1.0: {}",
                threshold
            )));
        }
        Ok(())
    }

    /// NMS 임계값 유효성 검사
    pub fn validate_nms_threshold(threshold: f32) -> AppResult<()> {
        if !(0.0..=1.0).contains(&threshold) {
            return Err(AppError::ConfigError(format!(
                "NMS 임계값은 0.0과 1.0 사이여야 합니다: {}",
                threshold
            )));
        }
        Ok(())
    }

    /// 사용자 이름 / 비밀번호 형식 검사
    pub fn validate_credentials(username: &str, password: &str) -> AppResult<()> {
        let trimmed = username.trim();
        if trimmed.is_empty() || trimmed.chars().count() > 100 {
            return Err(AppError::ValidationError(
                "Username must be between 1 and 100 characters".to_string(),
            ));
        }
        if password.is_empty() {
            return Err(AppError::ValidationError("Password must not be empty".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_follow_error_kind() {
        assert_eq!(
            AppError::PayloadTooLarge("x".into()).status_code(),
            StatusCode::PAYLOAD_TOO_LARGE
        );
        assert_eq!(AppError::Conflict("x".into()).status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(AppError::Forbidden("x".into()).status_code(), StatusCode::FORBIDDEN);
        assert_eq!(
            AppError::ModelError("x".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn storage_and_render_failures_are_server_errors() {
        let db = AppError::DatabaseUnavailable("연결 잠금이 오염되었습니다".into());
        assert_eq!(db.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(db.to_string().starts_with("데이터베이스 연결 사용 불가"));

        let render = AppError::RenderError("task panicked".into());
        assert_eq!(render.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(render.to_string(), "렌더링 오류: task panicked");
    }

    #[test]
    fn detail_strips_kind_prefix_for_client_errors() {
        let err = AppError::Unauthorized("Authentication required".into());
        assert_eq!(err.detail(), "Authentication required");
    }

    #[test]
    fn context_wraps_model_errors() {
        let result: Result<(), AppError> = Err(AppError::ModelError("missing".into()));
        let err = result.with_context("yolo").unwrap_err();
        assert_eq!(err.detail(), "yolo: missing");
        assert_eq!(err.to_string(), "모델 로드 오류: yolo: missing");
    }

    #[test]
    fn threshold_validation_bounds() {
        assert!(validation::validate_confidence_threshold(0.0).is_ok());
        assert!(validation::validate_confidence_threshold(1.0).is_ok());
        assert!(validation::validate_confidence_threshold(1.01).is_err());
        assert!(validation::validate_credentials("  ", "pw").is_err());
        assert!(validation::validate_credentials("alice", "").is_err());
    }
}
