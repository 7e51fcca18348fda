use serde::{Deserialize, Deserializer, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{validation, AppError, AppResult};

/// 애플리케이션 설정 구조체
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    /// HTTP 서버 설정
    pub server: ServerConfig,
    /// 모델 관련 설정
    pub model: ModelConfig,
    /// 업로드 제한
    pub upload: UploadConfig,
    /// 데이터베이스 관련 설정
    pub database: DatabaseConfig,
    /// 검출 결과 렌더링 설정
    pub render: RenderConfig,
}

/// HTTP 서버 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: String,
    /// 비어 있으면 모든 origin 허용
    pub cors_origins: Vec<String>,
}

/// 모델 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// 모델 파일 루트 디렉토리
    pub models_dir: PathBuf,
    /// 추론 장치 ("cpu", "cuda")
    pub device: String,
    #[serde(deserialize_with = "rfdetr_table")]
    pub rfdetr: DetectorConfig,
    #[serde(deserialize_with = "yolo_table")]
    pub yolo: DetectorConfig,
}

/// 검출기별 설정
///
/// TOML 테이블에 빠진 항목은 해당 모델의 기본값으로 채운다.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectorConfig {
    /// `models_dir` 기준 상대 경로
    pub model_file: String,
    /// 정사각형 입력 크기
    pub input_size: u32,
    /// 요청에 임계값이 없을 때 사용하는 기본 신뢰도 임계값
    pub default_confidence_threshold: f64,
    /// NMS IoU 임계값 (None 이면 NMS 생략)
    pub nms_threshold: Option<f32>,
    /// 최대 검출 개수
    pub max_detections: usize,
    /// 클래스 이름 (비어 있으면 기본 이름 사용)
    pub class_names: Vec<String>,
    pub version: String,
    pub description: String,
}

/// 업로드 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    /// 최대 파일 크기 (바이트)
    pub max_file_size: usize,
    /// 허용 확장자 (소문자, 점 포함)
    pub allowed_extensions: Vec<String>,
}

/// 데이터베이스 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// SQLite 파일 경로
    pub path: PathBuf,
}

/// 렌더링 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderConfig {
    /// 최대 표시 너비
    pub max_display_width: u32,
    /// 최대 표시 높이
    pub max_display_height: u32,
    /// 바운딩 박스 색상 매핑 방식
    pub color_mode: ColorMappingMode,
    pub rfdetr_color: [u8; 3],
    pub yolo_color: [u8; 3],
    /// 병합된 폴리곤 색상
    pub merged_color: [u8; 3],
    /// 라벨 텍스트용 TTF 폰트 (없으면 라벨 배경만 그림)
    pub font_path: Option<PathBuf>,
    pub font_size: f32,
}

/// 바운딩 박스 색상 매핑 방식
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ColorMappingMode {
    /// 모델별 고정 색상
    Fixed,
    /// 범위별 색상 (5단계)
    RangeBased,
    /// 그라데이션 색상 (선형)
    Gradient,
    /// HSV 기반 색상 (자연스러운 전환)
    HsvBased,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8000".to_string(),
            cors_origins: Vec::new(),
        }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            models_dir: PathBuf::from("models"),
            device: "cpu".to_string(),
            rfdetr: DetectorConfig::rfdetr(),
            yolo: DetectorConfig::yolo(),
        }
    }
}

impl DetectorConfig {
    /// RF-DETR 기본 설정
    pub fn rfdetr() -> Self {
        Self {
            model_file: "rfdetr/checkpoint_best_ema_01.onnx".to_string(),
            input_size: 560,
            default_confidence_threshold: 0.5,
            nms_threshold: None,
            max_detections: 300,
            class_names: Vec::new(),
            version: "1.0".to_string(),
            description: "RF-DETR Medium, shelf items".to_string(),
        }
    }

    /// YOLO 기본 설정
    pub fn yolo() -> Self {
        Self {
            model_file: "yolo/best_01.onnx".to_string(),
            input_size: 640,
            default_confidence_threshold: 0.4,
            nms_threshold: Some(0.7),
            max_detections: 300,
            class_names: Vec::new(),
            version: "1.0".to_string(),
            description: "YOLO, shelf items".to_string(),
        }
    }
}

/// 일부 항목만 있는 테이블을 기본 설정 위에 덮어쓴다
fn overlay_detector<'de, D>(deserializer: D, base: DetectorConfig) -> Result<DetectorConfig, D::Error>
where
    D: Deserializer<'de>,
{
    let table = serde_json::Map::<String, serde_json::Value>::deserialize(deserializer)?;
    let mut merged = match serde_json::to_value(base).map_err(serde::de::Error::custom)? {
        serde_json::Value::Object(map) => map,
        _ => serde_json::Map::new(),
    };
    merged.extend(table);
    serde_json::from_value(serde_json::Value::Object(merged)).map_err(serde::de::Error::custom)
}

fn rfdetr_table<'de, D>(deserializer: D) -> Result<DetectorConfig, D::Error>
where
    D: Deserializer<'de>,
{
    overlay_detector(deserializer, DetectorConfig::rfdetr())
}

fn yolo_table<'de, D>(deserializer: D) -> Result<DetectorConfig, D::Error>
where
    D: Deserializer<'de>,
{
    overlay_detector(deserializer, DetectorConfig::yolo())
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_file_size: 50 * 1024 * 1024,
            allowed_extensions: [".jpg", ".jpeg", ".png", ".bmp", ".tiff", ".webp"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("shelf_detection.db"),
        }
    }
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            max_display_width: 800,
            max_display_height: 600,
            color_mode: ColorMappingMode::Fixed,
            rfdetr_color: [0, 200, 255],
            yolo_color: [255, 64, 64],
            merged_color: [160, 32, 240],
            font_path: None,
            font_size: 16.0,
        }
    }
}

impl ModelConfig {
    /// 모델 파일 절대 경로
    pub fn model_path(&self, detector: &DetectorConfig) -> PathBuf {
        self.models_dir.join(&detector.model_file)
    }
}

impl UploadConfig {
    pub fn max_file_size_mb(&self) -> f64 {
        self.max_file_size as f64 / (1024.0 * 1024.0)
    }
}

impl AppConfig {
    /// 기본값 → TOML 파일 → 환경 변수 순서로 설정 로드
    pub fn load(path: Option<&Path>) -> AppResult<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// 임계값 범위 검사
    pub fn validate(&self) -> AppResult<()> {
        for detector in [&self.model.rfdetr, &self.model.yolo] {
            validation::validate_confidence_threshold(detector.default_confidence_threshold)
                .map_err(|e| AppError::ConfigError(format!("{}: {}", detector.model_file, e.detail())))?;
            if let Some(iou) = detector.nms_threshold {
                validation::validate_nms_threshold(iou)?;
            }
        }
        Ok(())
    }

    /// TOML 설정 파일 읽기
    pub fn from_file(path: &Path) -> AppResult<Self> {
        let text = std::fs::read_to_string(path)?;
        toml::from_str(&text)
            .map_err(|e| AppError::ConfigError(format!("{}: {}", path.display(), e)))
    }

    /// 환경 변수 덮어쓰기
    pub fn apply_env<F>(&mut self, lookup: F) -> AppResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(addr) = lookup("BIND_ADDR") {
            self.server.bind_addr = addr;
        }
        if let Some(path) = lookup("DATABASE_PATH").or_else(|| lookup("DATABASE_URL")) {
            // SQLAlchemy 형식 URL (sqlite:///relative.db, sqlite:////abs.db)
            let file = path
                .strip_prefix("sqlite:///")
                .or_else(|| path.strip_prefix("sqlite://"))
                .unwrap_or(&path);
            self.database.path = PathBuf::from(file);
        }
        if let Some(dir) = lookup("ML_MODELS_DIR") {
            self.model.models_dir = PathBuf::from(dir);
        }
        if let Some(device) = lookup("ML_DEVICE") {
            self.model.device = device;
        }
        if let Some(value) = lookup("RFDETR_CONFIDENCE") {
            self.model.rfdetr.default_confidence_threshold = parse_env("RFDETR_CONFIDENCE", &value)?;
        }
        if let Some(value) = lookup("YOLO_CONFIDENCE") {
            self.model.yolo.default_confidence_threshold = parse_env("YOLO_CONFIDENCE", &value)?;
        }
        if let Some(value) = lookup("MAX_FILE_SIZE_MB") {
            let mb: usize = parse_env("MAX_FILE_SIZE_MB", &value)?;
            self.upload.max_file_size = mb.checked_mul(1024 * 1024).ok_or_else(|| {
                AppError::ConfigError(format!("환경 변수 MAX_FILE_SIZE_MB 값이 너무 큽니다: {}", value))
            })?;
        }
        if let Some(font) = lookup("RENDER_FONT_PATH") {
            self.render.font_path = Some(PathBuf::from(font));
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> AppResult<T> {
    value
        .trim()
        .parse()
        .map_err(|_| AppError::ConfigError(format!("환경 변수 {} 값이 올바르지 않습니다: {}", key, value)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_match_service_limits() {
        let config = AppConfig::default();
        assert_eq!(config.upload.max_file_size, 50 * 1024 * 1024);
        assert_eq!(config.model.rfdetr.default_confidence_threshold, 0.5);
        assert_eq!(config.model.yolo.default_confidence_threshold, 0.4);
        assert!(config.upload.allowed_extensions.contains(&".webp".to_string()));
        assert_eq!(config.render.max_display_width, 800);
    }

    #[test]
    fn env_overrides_apply() {
        let env: HashMap<&str, &str> = [
            ("MAX_FILE_SIZE_MB", "2"),
            ("YOLO_CONFIDENCE", "0.25"),
            ("DATABASE_URL", "sqlite:///tmp/test.db"),
        ]
        .into_iter()
        .collect();

        let mut config = AppConfig::default();
        config
            .apply_env(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.upload.max_file_size, 2 * 1024 * 1024);
        assert_eq!(config.model.yolo.default_confidence_threshold, 0.25);
        assert_eq!(config.database.path, PathBuf::from("tmp/test.db"));
    }

    #[test]
    fn invalid_env_value_is_config_error() {
        let mut config = AppConfig::default();
        let err = config
            .apply_env(|key| (key == "RFDETR_CONFIDENCE").then(|| "high".to_string()))
            .unwrap_err();
        assert!(matches!(err, AppError::ConfigError(_)));
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "[server]\nbind_addr = \"127.0.0.1:9000\"\n\n[model.yolo]\ninput_size = 320\n",
        )
        .unwrap();

        let config = AppConfig::from_file(&path).unwrap();
        assert_eq!(config.server.bind_addr, "127.0.0.1:9000");
        assert_eq!(config.model.yolo.input_size, 320);
        assert_eq!(config.model.yolo.default_confidence_threshold, 0.4);
        assert_eq!(config.model.rfdetr.input_size, 560);
    }

    #[test]
    fn partial_rfdetr_table_keeps_rfdetr_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[model.rfdetr]\ninput_size = 320\n").unwrap();

        let config = AppConfig::from_file(&path).unwrap();
        let rfdetr = &config.model.rfdetr;
        assert_eq!(rfdetr.input_size, 320);
        assert_eq!(rfdetr.model_file, "rfdetr/checkpoint_best_ema_01.onnx");
        assert_eq!(rfdetr.default_confidence_threshold, 0.5);
        assert_eq!(rfdetr.nms_threshold, None);
        assert_eq!(rfdetr.description, "RF-DETR Medium, shelf items");
        assert_eq!(config.model.yolo.model_file, "yolo/best_01.onnx");
    }

    #[test]
    fn huge_upload_limit_is_config_error() {
        let mut config = AppConfig::default();
        let err = config
            .apply_env(|key| (key == "MAX_FILE_SIZE_MB").then(|| usize::MAX.to_string()))
            .unwrap_err();
        assert!(matches!(err, AppError::ConfigError(_)));
        assert_eq!(config.upload.max_file_size, 50 * 1024 * 1024);
    }

    #[test]
    fn out_of_range_thresholds_are_rejected() {
        let mut config = AppConfig::default();
        assert!(config.validate().is_ok());

        config.model.yolo.nms_threshold = Some(1.5);
        assert!(matches!(config.validate(), Err(AppError::ConfigError(_))));

        config.model.yolo.nms_threshold = None;
        config.model.rfdetr.default_confidence_threshold = -0.1;
        assert!(matches!(config.validate(), Err(AppError::ConfigError(_))));
    }
}
