// 업로드 → 해시 → 중복 확인 → 추론 → 저장
use serde::Serialize;
use serde_json::json;
use std::sync::Mutex;

use crate::config::{AppConfig, UploadConfig};
use crate::database::{HistoryDb, NewPrediction};
use crate::duplicate::{check_duplicate, sha256_hex, DuplicateQuery};
use crate::error::{validation, AppError, AppResult, ErrorContext};
use crate::models::{DetectorKind, InferenceEngine, ModelOutput, ModelVariant, PredictionResults};
use crate::utils::image_utils;

/// 업로드된 이미지 파일
#[derive(Debug, Clone)]
pub struct UploadedImage {
    pub file_name: String,
    pub content_type: Option<String>,
    pub bytes: Vec<u8>,
}

/// 예측 요청
#[derive(Debug, Clone)]
pub struct PredictionRequest {
    pub variant: ModelVariant,
    pub image: UploadedImage,
    pub rfdetr_threshold: Option<f64>,
    pub yolo_threshold: Option<f64>,
    pub comment: Option<String>,
    pub user_id: Option<String>,
}

/// 예측 결과: 새 기록 또는 기존 기록
#[derive(Debug, Clone)]
pub enum PredictionOutcome {
    Created {
        prediction_id: String,
        results: PredictionResults,
        image_base64: String,
    },
    Duplicate {
        duplicate_id: String,
        results: serde_json::Value,
    },
}

#[derive(Serialize)]
struct CreatedResponse<'a> {
    #[serde(flatten)]
    results: &'a PredictionResults,
    prediction_id: &'a str,
    image_base64: &'a str,
}

impl PredictionOutcome {
    /// 예측 API 응답 본문
    pub fn to_json(&self) -> AppResult<serde_json::Value> {
        match self {
            PredictionOutcome::Created {
                prediction_id,
                results,
                image_base64,
            } => Ok(serde_json::to_value(CreatedResponse {
                results,
                prediction_id,
                image_base64,
            })?),
            PredictionOutcome::Duplicate {
                duplicate_id,
                results,
            } => Ok(json!({
                "error": "Duplicate prediction found",
                "is_duplicate": true,
                "duplicate_id": duplicate_id,
                "results": results,
            })),
        }
    }
}

/// 업로드 검사: 크기(413) → content-type 또는 확장자(400)
pub fn validate_upload(image: &UploadedImage, config: &UploadConfig) -> AppResult<()> {
    if image.bytes.len() > config.max_file_size {
        return Err(AppError::PayloadTooLarge(format!(
            "File size exceeds maximum allowed size of {:.1}MB",
            config.max_file_size_mb()
        )));
    }
    validation::validate_image_data(&image.bytes)?;

    let is_image_type = image
        .content_type
        .as_deref()
        .map(|ct| ct.starts_with("image/"))
        .unwrap_or(false);
    if is_image_type || image_utils::is_allowed_extension(&image.file_name, &config.allowed_extensions) {
        return Ok(());
    }
    Err(AppError::ValidationError("File must be an image".to_string()))
}

/// 요청 임계값 (없으면 모델 기본값)
fn resolve_threshold(requested: Option<f64>, kind: DetectorKind, config: &AppConfig) -> AppResult<f64> {
    let threshold = requested.unwrap_or_else(|| kind.config(&config.model).default_confidence_threshold);
    validation::validate_confidence_threshold(threshold)?;
    Ok(threshold)
}

/// 예측 실행 (블로킹, 중복이면 추론하지 않음)
pub fn run_prediction(
    db: &HistoryDb,
    engine: &Mutex<InferenceEngine>,
    config: &AppConfig,
    request: PredictionRequest,
) -> AppResult<PredictionOutcome> {
    validate_upload(&request.image, &config.upload)?;

    let variant = request.variant;
    let uses = |kind: DetectorKind| variant.detectors().contains(&kind);
    let rfdetr_threshold = if uses(DetectorKind::RfDetr) {
        Some(resolve_threshold(request.rfdetr_threshold, DetectorKind::RfDetr, config)?)
    } else {
        None
    };
    let yolo_threshold = if uses(DetectorKind::Yolo) {
        Some(resolve_threshold(request.yolo_threshold, DetectorKind::Yolo, config)?)
    } else {
        None
    };

    let image_hash = sha256_hex(&request.image.bytes);
    let query = DuplicateQuery::for_variant(&image_hash, variant, rfdetr_threshold, yolo_threshold);
    let check = check_duplicate(db, &query)?;
    if let Some(duplicate_id) = check.duplicate_id {
        let results = db
            .get_prediction(&duplicate_id)?
            .map(|record| record.results)
            .unwrap_or(serde_json::Value::Null);
        tracing::info!("중복 예측 요청, 기존 기록 반환: {}", duplicate_id);
        return Ok(PredictionOutcome::Duplicate {
            duplicate_id,
            results,
        });
    }

    let image = image_utils::decode_image(&request.image.bytes)
        .with_context(format!("Error running {} prediction", variant.as_str().to_uppercase()))?;
    let outputs: Vec<ModelOutput> = {
        let mut engine = engine
            .lock()
            .map_err(|_| AppError::InferenceError("추론 엔진 잠금 실패".to_string()))?;
        let mut outputs = Vec::new();
        for &kind in variant.detectors() {
            let threshold = match kind {
                DetectorKind::RfDetr => rfdetr_threshold,
                DetectorKind::Yolo => yolo_threshold,
            }
            .unwrap_or_default();
            outputs.push(engine.predict(kind, &image, threshold)?);
        }
        outputs
    };

    let results = match (variant, outputs.as_slice()) {
        (ModelVariant::Both, [rfdetr, yolo]) => PredictionResults::Combined {
            rfdetr: rfdetr.clone(),
            yolo: yolo.clone(),
        },
        (_, [single]) => PredictionResults::Single(single.clone()),
        _ => {
            return Err(AppError::InferenceError(format!(
                "{} 결과 개수가 올바르지 않습니다: {}",
                variant,
                outputs.len()
            )))
        }
    };

    let confidence_of = |kind| results.output(kind).map(|o| o.confidence);
    let image_base64 = image_utils::to_data_url(&request.image.bytes, &request.image.file_name);
    let new = NewPrediction {
        user_id: request.user_id,
        model: variant,
        image_url: None,
        image_base64: Some(image_base64.clone()),
        image_hash: Some(image_hash),
        results: serde_json::to_value(&results)?,
        confidence: match &results {
            PredictionResults::Single(output) => Some(output.confidence),
            PredictionResults::Combined { .. } => None,
        },
        rfdetr_confidence: if variant == ModelVariant::Both { confidence_of(DetectorKind::RfDetr) } else { None },
        yolo_confidence: if variant == ModelVariant::Both { confidence_of(DetectorKind::Yolo) } else { None },
        confidence_threshold: match variant {
            ModelVariant::RfDetr => rfdetr_threshold,
            ModelVariant::Yolo => yolo_threshold,
            ModelVariant::Both => None,
        },
        rfdetr_threshold,
        yolo_threshold,
        comment: request.comment.filter(|c| !c.trim().is_empty()),
    };

    let record = db.create_prediction(&new)?;
    tracing::info!("예측 저장: {} ({})", record.id, variant);

    Ok(PredictionOutcome::Created {
        prediction_id: record.id,
        results,
        image_base64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelConfig;
    use crate::models::{Detection, ModelInfo, ObjectDetector};
    use image::{ImageFormat, Rgb, RgbImage};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingDetector {
        kind: DetectorKind,
        calls: Arc<AtomicUsize>,
    }

    impl ObjectDetector for CountingDetector {
        fn detect(&mut self, _image: &RgbImage, threshold: f32) -> AppResult<Vec<Detection>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(vec![Detection {
                xyxy: [1.0, 1.0, 5.0, 5.0],
                confidence: threshold.max(0.8),
                class_id: 0,
                class_name: "item".to_string(),
            }])
        }

        fn model_info(&self) -> ModelInfo {
            ModelInfo {
                kind: self.kind,
                input_size: 64,
                class_count: 1,
                description: "stub".to_string(),
            }
        }

        fn kind(&self) -> DetectorKind {
            self.kind
        }
    }

    fn png_bytes() -> Vec<u8> {
        let image = RgbImage::from_pixel(8, 8, Rgb([200, 10, 10]));
        let mut bytes = std::io::Cursor::new(Vec::new());
        image.write_to(&mut bytes, ImageFormat::Png).unwrap();
        bytes.into_inner()
    }

    fn setup() -> (HistoryDb, Mutex<InferenceEngine>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let engine = InferenceEngine::with_detectors(
            ModelConfig::default(),
            Box::new(CountingDetector { kind: DetectorKind::RfDetr, calls: calls.clone() }),
            Box::new(CountingDetector { kind: DetectorKind::Yolo, calls: calls.clone() }),
        );
        (HistoryDb::open_in_memory().unwrap(), Mutex::new(engine), calls)
    }

    fn request(variant: ModelVariant, bytes: Vec<u8>) -> PredictionRequest {
        PredictionRequest {
            variant,
            image: UploadedImage {
                file_name: "shelf.png".to_string(),
                content_type: Some("image/png".to_string()),
                bytes,
            },
            rfdetr_threshold: None,
            yolo_threshold: Some(0.4),
            comment: Some("first".to_string()),
            user_id: None,
        }
    }

    #[test]
    fn repeated_submission_reuses_first_record() {
        let (db, engine, calls) = setup();
        let config = AppConfig::default();

        let first = run_prediction(&db, &engine, &config, request(ModelVariant::Yolo, png_bytes())).unwrap();
        let PredictionOutcome::Created { prediction_id, .. } = first else {
            panic!("expected a new record");
        };
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let second = run_prediction(&db, &engine, &config, request(ModelVariant::Yolo, png_bytes())).unwrap();
        match second {
            PredictionOutcome::Duplicate { duplicate_id, results } => {
                assert_eq!(duplicate_id, prediction_id);
                assert_eq!(results["model"], "yolo");
            }
            other => panic!("expected duplicate, got {:?}", other),
        }
        // 중복이면 추론하지 않는다
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(db.count_by_model().unwrap().yolo, 1);
    }

    #[test]
    fn both_variant_stores_per_model_fields() {
        let (db, engine, calls) = setup();
        let config = AppConfig::default();

        let outcome = run_prediction(&db, &engine, &config, request(ModelVariant::Both, png_bytes())).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        let PredictionOutcome::Created { prediction_id, .. } = &outcome else {
            panic!("expected a new record");
        };
        let record = db.get_prediction(prediction_id).unwrap().unwrap();
        assert_eq!(record.model, ModelVariant::Both);
        assert_eq!(record.confidence, None);
        assert_eq!(record.rfdetr_threshold, Some(0.5));
        assert_eq!(record.yolo_threshold, Some(0.4));
        assert!(record.yolo_confidence.is_some());
        assert!(record.image_base64.unwrap().starts_with("data:image/png;base64,"));

        let body = outcome.to_json().unwrap();
        assert!(body["rfdetr"]["detections"].is_array());
        assert_eq!(body["prediction_id"], prediction_id.as_str());
    }

    #[test]
    fn upload_validation_order() {
        let config = UploadConfig {
            max_file_size: 4,
            ..UploadConfig::default()
        };
        let image = |name: &str, ct: Option<&str>, bytes: &[u8]| UploadedImage {
            file_name: name.to_string(),
            content_type: ct.map(|s| s.to_string()),
            bytes: bytes.to_vec(),
        };

        let err = validate_upload(&image("a.txt", Some("text/plain"), b"12345"), &config).unwrap_err();
        assert!(matches!(err, AppError::PayloadTooLarge(_)));

        let err = validate_upload(&image("a.txt", Some("text/plain"), b"1"), &config).unwrap_err();
        assert_eq!(err.detail(), "File must be an image");

        assert!(validate_upload(&image("a.webp", None, b"1"), &config).is_ok());
        assert!(validate_upload(&image("blob", Some("image/jpeg"), b"1"), &config).is_ok());
    }

    #[test]
    fn out_of_range_threshold_is_rejected_before_inference() {
        let (db, engine, calls) = setup();
        let mut req = request(ModelVariant::Yolo, png_bytes());
        req.yolo_threshold = Some(1.5);
        let err = run_prediction(&db, &engine, &AppConfig::default(), req).unwrap_err();
        assert!(matches!(err, AppError::ValidationError(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
