use image::RgbImage;
use ndarray::{ArrayD, ArrayViewD};

use crate::config::DetectorConfig;
use crate::error::{AppError, AppResult};
use crate::models::{
    chw_tensor, class_name_for, non_maximum_suppression, Detection, DetectorKind, ModelInfo,
    ObjectDetector, TensorBackend,
};
use crate::utils::math_utils;

// ImageNet 정규화 값
const MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const STD: [f32; 3] = [0.229, 0.224, 0.225];

/// 이미지 전처리: 입력 크기로 리사이즈 후 ImageNet 정규화
pub fn preprocess_image(image: &RgbImage, input_size: u32) -> AppResult<ArrayD<f32>> {
    let resized = image::imageops::resize(
        image,
        input_size,
        input_size,
        image::imageops::FilterType::Triangle,
    );
    chw_tensor(&resized, |c, value| (value as f32 / 255.0 - MEAN[c]) / STD[c])
}

/// 출력 텐서 중 박스(마지막 차원 4)와 로짓을 구분
fn split_outputs(outputs: &[ArrayD<f32>]) -> AppResult<(ArrayViewD<'_, f32>, ArrayViewD<'_, f32>)> {
    if outputs.len() < 2 {
        return Err(AppError::InferenceError(format!(
            "RF-DETR 출력은 2개여야 합니다: {}개",
            outputs.len()
        )));
    }
    let is_boxes = |t: &ArrayD<f32>| t.shape().last() == Some(&4);
    if is_boxes(&outputs[0]) {
        Ok((outputs[0].view(), outputs[1].view()))
    } else if is_boxes(&outputs[1]) {
        Ok((outputs[1].view(), outputs[0].view()))
    } else {
        Err(AppError::InferenceError(
            "RF-DETR 박스 출력을 찾을 수 없습니다".to_string(),
        ))
    }
}

/// RF-DETR 출력 파싱
///
/// `boxes`: `[1, Q, 4]` 정규화된 (cx, cy, w, h), `logits`: `[1, Q, C]`.
/// 쿼리마다 시그모이드 최대 클래스를 취하고 임계값 이상만 남긴다.
pub fn parse_rf_detr_outputs(
    boxes: &ArrayViewD<f32>,
    logits: &ArrayViewD<f32>,
    original_width: u32,
    original_height: u32,
    confidence_threshold: f32,
    config: &DetectorConfig,
) -> AppResult<Vec<Detection>> {
    let (bs, ls) = (boxes.shape(), logits.shape());
    if bs.len() != 3 || ls.len() != 3 || bs[1] != ls[1] {
        return Err(AppError::InferenceError(format!(
            "RF-DETR 출력 형태가 맞지 않습니다: boxes {:?}, logits {:?}",
            bs, ls
        )));
    }

    let (num_queries, num_classes) = (ls[1], ls[2]);
    let w = original_width as f32;
    let h = original_height as f32;

    let mut detections = Vec::new();
    for q in 0..num_queries {
        let mut max_conf = 0.0;
        let mut best_class = 0;
        for c in 0..num_classes {
            let conf = math_utils::sigmoid(logits[[0, q, c]]);
            if conf > max_conf {
                max_conf = conf;
                best_class = c;
            }
        }
        if max_conf < confidence_threshold {
            continue;
        }

        let cx = boxes[[0, q, 0]];
        let cy = boxes[[0, q, 1]];
        let bw = boxes[[0, q, 2]];
        let bh = boxes[[0, q, 3]];
        if bw <= 0.0 || bh <= 0.0 {
            continue;
        }

        let xyxy = [
            ((cx - bw / 2.0) * w).clamp(0.0, w),
            ((cy - bh / 2.0) * h).clamp(0.0, h),
            ((cx + bw / 2.0) * w).clamp(0.0, w),
            ((cy + bh / 2.0) * h).clamp(0.0, h),
        ];

        let class_id = best_class as u32;
        detections.push(Detection {
            xyxy,
            confidence: max_conf,
            class_id,
            class_name: class_name_for(&config.class_names, class_id, |_| "item".to_string()),
        });
    }

    match config.nms_threshold {
        Some(iou) => non_maximum_suppression(&mut detections, iou),
        None => detections.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
        }),
    }
    detections.truncate(config.max_detections);

    Ok(detections)
}

/// RF-DETR 검출기
pub struct RfDetrDetector {
    config: DetectorConfig,
    backend: Box<dyn TensorBackend>,
}

impl RfDetrDetector {
    pub fn new(config: DetectorConfig, backend: Box<dyn TensorBackend>) -> Self {
        Self { config, backend }
    }
}

impl ObjectDetector for RfDetrDetector {
    fn detect(&mut self, image: &RgbImage, confidence_threshold: f32) -> AppResult<Vec<Detection>> {
        let input = preprocess_image(image, self.config.input_size)?;
        let outputs = self.backend.run(&input)?;
        let (boxes, logits) = split_outputs(&outputs)?;
        parse_rf_detr_outputs(
            &boxes,
            &logits,
            image.width(),
            image.height(),
            confidence_threshold,
            &self.config,
        )
    }

    fn model_info(&self) -> ModelInfo {
        ModelInfo {
            kind: DetectorKind::RfDetr,
            input_size: self.config.input_size,
            class_count: self.config.class_names.len().max(1) as u32,
            description: self.config.description.clone(),
        }
    }

    fn kind(&self) -> DetectorKind {
        DetectorKind::RfDetr
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelConfig;
    use image::Rgb;
    use ndarray::{Array3, IxDyn};

    fn outputs(queries: &[([f32; 4], [f32; 2])]) -> (ArrayD<f32>, ArrayD<f32>) {
        let mut boxes = Array3::<f32>::zeros((1, queries.len(), 4));
        let mut logits = Array3::<f32>::zeros((1, queries.len(), 2));
        for (q, (b, l)) in queries.iter().enumerate() {
            for i in 0..4 {
                boxes[[0, q, i]] = b[i];
            }
            for i in 0..2 {
                logits[[0, q, i]] = l[i];
            }
        }
        (boxes.into_dyn(), logits.into_dyn())
    }

    #[test]
    fn normalized_boxes_scale_to_original_size() {
        let config = ModelConfig::default().rfdetr;
        // sigmoid(2.0) ≈ 0.88, sigmoid(-3.0) ≈ 0.05
        let (boxes, logits) = outputs(&[
            ([0.5, 0.5, 0.2, 0.4], [2.0, -5.0]),
            ([0.1, 0.1, 0.1, 0.1], [-3.0, -3.0]),
        ]);
        let detections =
            parse_rf_detr_outputs(&boxes.view(), &logits.view(), 200, 100, 0.5, &config).unwrap();

        assert_eq!(detections.len(), 1);
        let [x1, y1, x2, y2] = detections[0].xyxy;
        assert!((x1 - 80.0).abs() < 1e-3 && (x2 - 120.0).abs() < 1e-3);
        assert!((y1 - 30.0).abs() < 1e-3 && (y2 - 70.0).abs() < 1e-3);
        assert_eq!(detections[0].class_name, "item");
        assert!((detections[0].confidence - math_utils::sigmoid(2.0)).abs() < 1e-6);
    }

    #[test]
    fn results_sorted_by_confidence() {
        let config = ModelConfig::default().rfdetr;
        let (boxes, logits) = outputs(&[
            ([0.2, 0.2, 0.1, 0.1], [0.5, 0.0]),
            ([0.7, 0.7, 0.1, 0.1], [0.0, 3.0]),
        ]);
        let detections =
            parse_rf_detr_outputs(&boxes.view(), &logits.view(), 100, 100, 0.5, &config).unwrap();
        assert_eq!(detections.len(), 2);
        assert_eq!(detections[0].class_id, 1);
        assert!(detections[0].confidence > detections[1].confidence);
    }

    #[test]
    fn mismatched_query_counts_are_rejected() {
        let config = ModelConfig::default().rfdetr;
        let boxes = ArrayD::<f32>::zeros(IxDyn(&[1, 3, 4]));
        let logits = ArrayD::<f32>::zeros(IxDyn(&[1, 2, 2]));
        assert!(parse_rf_detr_outputs(&boxes.view(), &logits.view(), 10, 10, 0.5, &config).is_err());
    }

    #[test]
    fn preprocess_normalizes_with_imagenet_stats() {
        let image = RgbImage::from_pixel(8, 4, Rgb([255, 0, 0]));
        let tensor = preprocess_image(&image, 16).unwrap();
        assert_eq!(tensor.shape(), &[1, 3, 16, 16]);
        assert!((tensor[[0, 0, 5, 5]] - (1.0 - 0.485) / 0.229).abs() < 1e-4);
        assert!((tensor[[0, 1, 5, 5]] - (0.0 - 0.456) / 0.224).abs() < 1e-4);
    }

    struct Swapped(ArrayD<f32>, ArrayD<f32>);

    impl TensorBackend for Swapped {
        fn run(&mut self, _input: &ArrayD<f32>) -> AppResult<Vec<ArrayD<f32>>> {
            // 로짓이 먼저 나오는 내보내기 형식
            Ok(vec![self.1.clone(), self.0.clone()])
        }
    }

    #[test]
    fn detector_accepts_either_output_order() {
        let (boxes, logits) = outputs(&[([0.5, 0.5, 1.0, 1.0], [4.0, 0.0])]);
        let mut detector =
            RfDetrDetector::new(ModelConfig::default().rfdetr, Box::new(Swapped(boxes, logits)));
        let image = RgbImage::new(50, 40);
        let detections = detector.detect(&image, 0.5).unwrap();
        assert_eq!(detections.len(), 1);
        assert_eq!(detections[0].xyxy, [0.0, 0.0, 50.0, 40.0]);
    }
}
