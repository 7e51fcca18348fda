// 모델 모듈 통합 관리
pub mod rf_detr;
pub mod yolo;

#[cfg(feature = "onnx")]
pub mod onnx;

use image::{Rgb, RgbImage};
use ndarray::{ArrayD, IxDyn};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::config::{DetectorConfig, ModelConfig};
use crate::error::{AppError, AppResult, ErrorContext};
use crate::utils::{fs_utils, math_utils, perf_utils::StageTimer};

pub use rf_detr::RfDetrDetector;
pub use yolo::YoloDetector;

/// 단일 검출기 종류
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectorKind {
    #[serde(rename = "rfdetr")]
    RfDetr,
    Yolo,
}

/// 예측 요청/기록의 모델 구분 (`both` 는 두 검출기를 모두 실행)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelVariant {
    #[serde(rename = "rfdetr")]
    RfDetr,
    Yolo,
    Both,
}

impl DetectorKind {
    pub const ALL: [DetectorKind; 2] = [DetectorKind::RfDetr, DetectorKind::Yolo];

    pub fn as_str(&self) -> &'static str {
        match self {
            DetectorKind::RfDetr => "rfdetr",
            DetectorKind::Yolo => "yolo",
        }
    }

    /// 라벨용 표시 이름
    pub fn display_name(&self) -> &'static str {
        match self {
            DetectorKind::RfDetr => "RF-DETR",
            DetectorKind::Yolo => "YOLO",
        }
    }

    pub fn config<'a>(&self, config: &'a ModelConfig) -> &'a DetectorConfig {
        match self {
            DetectorKind::RfDetr => &config.rfdetr,
            DetectorKind::Yolo => &config.yolo,
        }
    }
}

impl ModelVariant {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelVariant::RfDetr => "rfdetr",
            ModelVariant::Yolo => "yolo",
            ModelVariant::Both => "both",
        }
    }

    /// 이 변형이 실행하는 검출기 목록
    pub fn detectors(&self) -> &'static [DetectorKind] {
        match self {
            ModelVariant::RfDetr => &[DetectorKind::RfDetr],
            ModelVariant::Yolo => &[DetectorKind::Yolo],
            ModelVariant::Both => &DetectorKind::ALL,
        }
    }
}

impl From<DetectorKind> for ModelVariant {
    fn from(kind: DetectorKind) -> Self {
        match kind {
            DetectorKind::RfDetr => ModelVariant::RfDetr,
            DetectorKind::Yolo => ModelVariant::Yolo,
        }
    }
}

impl fmt::Display for DetectorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for ModelVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DetectorKind {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "rfdetr" | "rf-detr" | "rf_detr" => Ok(DetectorKind::RfDetr),
            "yolo" => Ok(DetectorKind::Yolo),
            other => Err(AppError::ValidationError(format!("Unknown model: {}", other))),
        }
    }
}

impl FromStr for ModelVariant {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "both" => Ok(ModelVariant::Both),
            other => other.parse::<DetectorKind>().map(ModelVariant::from),
        }
    }
}

/// 검출 결과 한 건 (원본 이미지 픽셀 좌표)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub xyxy: [f32; 4],
    pub confidence: f32,
    pub class_id: u32,
    pub class_name: String,
}

/// 단일 모델 실행 결과
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelOutput {
    pub detections: Vec<Detection>,
    /// 검출 신뢰도 평균 (검출이 없으면 0)
    pub confidence: f64,
    pub model: DetectorKind,
}

impl ModelOutput {
    pub fn new(model: DetectorKind, detections: Vec<Detection>) -> Self {
        let confidence = math_utils::mean(detections.iter().map(|d| d.confidence as f64));
        Self {
            detections,
            confidence,
            model,
        }
    }
}

/// 저장되는 결과 형태: 단일 모델 또는 `{ rfdetr, yolo }` 조합
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PredictionResults {
    Combined { rfdetr: ModelOutput, yolo: ModelOutput },
    Single(ModelOutput),
}

impl PredictionResults {
    pub fn variant(&self) -> ModelVariant {
        match self {
            PredictionResults::Combined { .. } => ModelVariant::Both,
            PredictionResults::Single(output) => output.model.into(),
        }
    }

    /// 검출기별 결과 순회
    pub fn outputs(&self) -> Vec<&ModelOutput> {
        match self {
            PredictionResults::Combined { rfdetr, yolo } => vec![rfdetr, yolo],
            PredictionResults::Single(output) => vec![output],
        }
    }

    pub fn output(&self, kind: DetectorKind) -> Option<&ModelOutput> {
        self.outputs().into_iter().find(|o| o.model == kind)
    }
}

/// 전처리된 입력 텐서를 실행해 원시 출력 텐서를 돌려주는 런타임
pub trait TensorBackend: Send {
    fn run(&mut self, input: &ArrayD<f32>) -> AppResult<Vec<ArrayD<f32>>>;
}

/// 객체 검출기 공통 인터페이스
pub trait ObjectDetector: Send {
    /// 이미지에서 객체 검출 수행
    fn detect(&mut self, image: &RgbImage, confidence_threshold: f32) -> AppResult<Vec<Detection>>;

    /// 모델 정보 반환
    fn model_info(&self) -> ModelInfo;

    /// 검출기 종류 반환
    fn kind(&self) -> DetectorKind;
}

/// 모델 정보 구조체
#[derive(Debug, Clone, Serialize)]
pub struct ModelInfo {
    pub kind: DetectorKind,
    pub input_size: u32,
    pub class_count: u32,
    pub description: String,
}

/// `/models/info` 응답 항목
#[derive(Debug, Clone, Serialize)]
pub struct ModelStatus {
    pub loaded: bool,
    pub model_path: String,
    pub available_files: Vec<String>,
}

/// 레터박스 변환 정보 (입력 텐서 좌표 ↔ 원본 좌표)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Letterbox {
    pub scale: f32,
    pub pad_x: f32,
    pub pad_y: f32,
    pub original_width: u32,
    pub original_height: u32,
}

impl Letterbox {
    pub fn new(original_width: u32, original_height: u32, input_size: u32) -> Self {
        let scale = (input_size as f32 / original_width as f32)
            .min(input_size as f32 / original_height as f32);
        let new_width = (original_width as f32 * scale).round();
        let new_height = (original_height as f32 * scale).round();
        Self {
            scale,
            pad_x: ((input_size as f32 - new_width) / 2.0).floor(),
            pad_y: ((input_size as f32 - new_height) / 2.0).floor(),
            original_width,
            original_height,
        }
    }

    /// 입력 텐서 픽셀 좌표 → 원본 픽셀 좌표 (이미지 범위로 클리핑)
    pub fn to_original(&self, bbox: [f32; 4]) -> [f32; 4] {
        let w = self.original_width as f32;
        let h = self.original_height as f32;
        [
            ((bbox[0] - self.pad_x) / self.scale).clamp(0.0, w),
            ((bbox[1] - self.pad_y) / self.scale).clamp(0.0, h),
            ((bbox[2] - self.pad_x) / self.scale).clamp(0.0, w),
            ((bbox[3] - self.pad_y) / self.scale).clamp(0.0, h),
        ]
    }
}

/// 종횡비 유지 리사이즈 + 회색(114) 패딩 후 NCHW 0~1 텐서 생성
pub fn letterbox_tensor(image: &RgbImage, input_size: u32) -> AppResult<(ArrayD<f32>, Letterbox)> {
    let letterbox = Letterbox::new(image.width(), image.height(), input_size);
    let new_width = ((image.width() as f32 * letterbox.scale).round() as u32).max(1);
    let new_height = ((image.height() as f32 * letterbox.scale).round() as u32).max(1);

    let resized = image::imageops::resize(
        image,
        new_width,
        new_height,
        image::imageops::FilterType::Triangle,
    );

    let mut canvas = RgbImage::from_pixel(input_size, input_size, Rgb([114, 114, 114]));
    image::imageops::replace(
        &mut canvas,
        &resized,
        letterbox.pad_x as i64,
        letterbox.pad_y as i64,
    );

    let tensor = chw_tensor(&canvas, |_, value| value as f32 / 255.0)?;
    Ok((tensor, letterbox))
}

/// HWC 이미지 → [1, 3, H, W] 텐서 (채널별 정규화 함수 적용)
pub fn chw_tensor<F>(image: &RgbImage, normalize: F) -> AppResult<ArrayD<f32>>
where
    F: Fn(usize, u8) -> f32,
{
    let (width, height) = image.dimensions();
    let mut input_data = Vec::with_capacity(3 * width as usize * height as usize);
    for c in 0..3 {
        for y in 0..height {
            for x in 0..width {
                input_data.push(normalize(c, image.get_pixel(x, y)[c]));
            }
        }
    }

    ArrayD::from_shape_vec(IxDyn(&[1, 3, height as usize, width as usize]), input_data)
        .map_err(|e| AppError::InferenceError(format!("입력 텐서 생성 실패: {}", e)))
}

/// 클래스별 Non-Maximum Suppression, 신뢰도 내림차순 결과
pub fn non_maximum_suppression(detections: &mut Vec<Detection>, iou_threshold: f32) {
    detections.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut suppressed = vec![false; detections.len()];
    for i in 0..detections.len() {
        if suppressed[i] {
            continue;
        }
        for j in (i + 1)..detections.len() {
            if suppressed[j] || detections[i].class_id != detections[j].class_id {
                continue;
            }
            if math_utils::calculate_iou(&detections[i].xyxy, &detections[j].xyxy) > iou_threshold {
                suppressed[j] = true;
            }
        }
    }

    let mut index = 0;
    detections.retain(|_| {
        let keep = !suppressed[index];
        index += 1;
        keep
    });
}

/// 클래스 ID → 이름 (설정 목록 우선, 없으면 기본값)
pub(crate) fn class_name_for(class_names: &[String], class_id: u32, fallback: impl FnOnce(u32) -> String) -> String {
    class_names
        .get(class_id as usize)
        .cloned()
        .unwrap_or_else(|| fallback(class_id))
}

/// 두 검출기를 관리하는 추론 엔진 (첫 사용 시 지연 로드)
pub struct InferenceEngine {
    config: ModelConfig,
    rfdetr: Option<Box<dyn ObjectDetector>>,
    yolo: Option<Box<dyn ObjectDetector>>,
}

impl InferenceEngine {
    /// 설정 기반 엔진 생성 (모델은 아직 로드하지 않음)
    pub fn new(config: ModelConfig) -> Self {
        Self {
            config,
            rfdetr: None,
            yolo: None,
        }
    }

    /// 외부에서 만든 검출기를 주입한 엔진
    pub fn with_detectors(
        config: ModelConfig,
        rfdetr: Box<dyn ObjectDetector>,
        yolo: Box<dyn ObjectDetector>,
    ) -> Self {
        Self {
            config,
            rfdetr: Some(rfdetr),
            yolo: Some(yolo),
        }
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn is_loaded(&self, kind: DetectorKind) -> bool {
        self.slot(kind).is_some()
    }

    fn slot(&self, kind: DetectorKind) -> &Option<Box<dyn ObjectDetector>> {
        match kind {
            DetectorKind::RfDetr => &self.rfdetr,
            DetectorKind::Yolo => &self.yolo,
        }
    }

    /// 검출기 로드 (이미 로드되어 있으면 그대로 사용)
    pub fn ensure_loaded(&mut self, kind: DetectorKind) -> AppResult<&mut dyn ObjectDetector> {
        let slot = match kind {
            DetectorKind::RfDetr => &mut self.rfdetr,
            DetectorKind::Yolo => &mut self.yolo,
        };

        if slot.is_none() {
            let path = self.config.model_path(kind.config(&self.config));
            tracing::info!("{} 모델 로드: {}", kind.display_name(), path.display());
            let detector = load_detector(kind, &self.config).with_context(kind.display_name())?;
            *slot = Some(detector);
        }

        match slot {
            Some(detector) => Ok(detector.as_mut()),
            None => Err(AppError::ModelError(format!("{} 모델이 초기화되지 않았습니다", kind))),
        }
    }

    /// 단일 검출기 실행
    pub fn predict(&mut self, kind: DetectorKind, image: &RgbImage, confidence_threshold: f64) -> AppResult<ModelOutput> {
        let detector = self.ensure_loaded(kind)?;
        let _timer = StageTimer::new(&format!("{} 추론", kind.display_name()));
        let detections = detector
            .detect(image, confidence_threshold as f32)
            .with_context(format!("Error running {} prediction", kind.display_name()))?;
        tracing::debug!("{}: {}개 검출", kind.display_name(), detections.len());
        Ok(ModelOutput::new(kind, detections))
    }

    /// 모델 상태 (로드 여부, 경로, 디렉토리 파일 목록)
    pub fn model_status(&self, kind: DetectorKind) -> ModelStatus {
        let path: PathBuf = self.config.model_path(kind.config(&self.config));
        let available_files = path
            .parent()
            .map(fs_utils::list_files)
            .unwrap_or_default();
        ModelStatus {
            loaded: self.is_loaded(kind),
            model_path: path.to_string_lossy().to_string(),
            available_files,
        }
    }
}

#[cfg(feature = "onnx")]
fn load_detector(kind: DetectorKind, config: &ModelConfig) -> AppResult<Box<dyn ObjectDetector>> {
    let detector_config = kind.config(config).clone();
    let path = config.model_path(&detector_config);
    if !path.exists() {
        return Err(AppError::ModelError(format!(
            "모델 파일을 찾을 수 없습니다: {}",
            path.display()
        )));
    }
    let session = onnx::OnnxSession::load(kind.as_str(), &path, &config.device)?;
    Ok(match kind {
        DetectorKind::RfDetr => Box::new(RfDetrDetector::new(detector_config, Box::new(session))),
        DetectorKind::Yolo => Box::new(YoloDetector::new(detector_config, Box::new(session))),
    })
}

#[cfg(not(feature = "onnx"))]
fn load_detector(kind: DetectorKind, _config: &ModelConfig) -> AppResult<Box<dyn ObjectDetector>> {
    Err(AppError::ModelError(format!(
        "{} 추론 백엔드가 비활성화되어 있습니다 (`onnx` 기능으로 빌드 필요)",
        kind.display_name()
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn det(xyxy: [f32; 4], confidence: f32, class_id: u32) -> Detection {
        Detection {
            xyxy,
            confidence,
            class_id,
            class_name: "item".to_string(),
        }
    }

    #[test]
    fn variant_parsing_and_names() {
        assert_eq!("both".parse::<ModelVariant>().unwrap(), ModelVariant::Both);
        assert_eq!("RFDETR".parse::<ModelVariant>().unwrap(), ModelVariant::RfDetr);
        assert!("ssd".parse::<ModelVariant>().is_err());
        assert_eq!(ModelVariant::Both.detectors().len(), 2);
        assert_eq!(serde_json::to_string(&DetectorKind::RfDetr).unwrap(), "\"rfdetr\"");
    }

    #[test]
    fn output_confidence_is_mean() {
        let output = ModelOutput::new(
            DetectorKind::Yolo,
            vec![det([0.0, 0.0, 1.0, 1.0], 0.5, 0), det([0.0, 0.0, 1.0, 1.0], 1.0, 0)],
        );
        assert!((output.confidence - 0.75).abs() < 1e-6);
        assert_eq!(ModelOutput::new(DetectorKind::Yolo, vec![]).confidence, 0.0);
    }

    #[test]
    fn combined_results_round_trip_shape() {
        let combined = PredictionResults::Combined {
            rfdetr: ModelOutput::new(DetectorKind::RfDetr, vec![]),
            yolo: ModelOutput::new(DetectorKind::Yolo, vec![det([1.0, 2.0, 3.0, 4.0], 0.9, 0)]),
        };
        let value = serde_json::to_value(&combined).unwrap();
        assert_eq!(value["yolo"]["model"], "yolo");
        assert_eq!(value["rfdetr"]["detections"].as_array().unwrap().len(), 0);

        let parsed: PredictionResults = serde_json::from_value(value).unwrap();
        assert_eq!(parsed.variant(), ModelVariant::Both);
        assert_eq!(parsed.output(DetectorKind::Yolo).unwrap().detections.len(), 1);
    }

    #[test]
    fn letterbox_maps_back_to_original_pixels() {
        // 1280x640 → 640x320, 세로 패딩 160
        let letterbox = Letterbox::new(1280, 640, 640);
        assert_eq!(letterbox.scale, 0.5);
        assert_eq!(letterbox.pad_y, 160.0);
        let original = letterbox.to_original([0.0, 160.0, 320.0, 320.0]);
        assert_eq!(original, [0.0, 0.0, 640.0, 320.0]);
    }

    #[test]
    fn letterbox_tensor_shape_and_padding() {
        let image = RgbImage::from_pixel(20, 10, Rgb([255, 255, 255]));
        let (tensor, letterbox) = letterbox_tensor(&image, 32).unwrap();
        assert_eq!(tensor.shape(), &[1, 3, 32, 32]);
        assert_eq!(letterbox.pad_y, 8.0);
        // 패딩 영역은 114/255
        assert!((tensor[[0, 0, 0, 0]] - 114.0 / 255.0).abs() < 1e-6);
        assert!((tensor[[0, 0, 16, 16]] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn nms_suppresses_same_class_only() {
        let mut detections = vec![
            det([0.0, 0.0, 10.0, 10.0], 0.6, 0),
            det([0.0, 0.0, 10.0, 9.0], 0.9, 0),
            det([0.0, 0.0, 10.0, 10.0], 0.5, 1),
        ];
        non_maximum_suppression(&mut detections, 0.5);
        assert_eq!(detections.len(), 2);
        assert_eq!(detections[0].confidence, 0.9);
        assert_eq!(detections[1].class_id, 1);
    }

    #[cfg(not(feature = "onnx"))]
    #[test]
    fn engine_without_backend_reports_model_error() {
        let mut engine = InferenceEngine::new(ModelConfig::default());
        let image = RgbImage::new(4, 4);
        let err = engine.predict(DetectorKind::Yolo, &image, 0.4).unwrap_err();
        assert!(matches!(err, AppError::ModelError(_)));
        assert!(!engine.is_loaded(DetectorKind::Yolo));
    }
}
