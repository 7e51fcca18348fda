use image::RgbImage;
use ndarray::{ArrayViewD, Axis};

use crate::config::DetectorConfig;
use crate::error::{AppError, AppResult};
use crate::models::{
    class_name_for, letterbox_tensor, non_maximum_suppression, Detection, DetectorKind, Letterbox,
    ModelInfo, ObjectDetector, TensorBackend,
};

/// YOLO 출력 파싱
///
/// 출력 텐서는 `[1, 4 + nc, N]` (cx, cy, w, h 는 입력 픽셀 좌표, 이후 클래스 확률).
/// 일부 내보내기 형식의 `[1, N, 4 + nc]` 도 허용한다.
pub fn parse_yolo_output(
    output: &ArrayViewD<f32>,
    letterbox: &Letterbox,
    confidence_threshold: f32,
    config: &DetectorConfig,
) -> AppResult<Vec<Detection>> {
    let shape = output.shape();
    if shape.len() != 3 || shape[0] != 1 {
        return Err(AppError::InferenceError(format!(
            "YOLO 출력 형태가 올바르지 않습니다: {:?}",
            shape
        )));
    }

    let table = output.index_axis(Axis(0), 0);
    // 행: 속성, 열: 후보 박스
    let table = if shape[1] > shape[2] { table.reversed_axes() } else { table };
    let (num_attrs, num_boxes) = (table.shape()[0], table.shape()[1]);
    if num_attrs <= 4 {
        return Err(AppError::InferenceError(format!(
            "YOLO 출력에 클래스 점수가 없습니다: {:?}",
            shape
        )));
    }
    let num_classes = num_attrs - 4;
    tracing::debug!("YOLO 출력 파싱: {}개 후보, {}개 클래스", num_boxes, num_classes);

    let mut detections = Vec::new();
    for box_idx in 0..num_boxes {
        let mut best_class = 0;
        let mut max_conf = f32::MIN;
        for class_idx in 0..num_classes {
            let score = table[[4 + class_idx, box_idx]];
            if score > max_conf {
                max_conf = score;
                best_class = class_idx;
            }
        }

        if max_conf < confidence_threshold {
            continue;
        }

        let cx = table[[0, box_idx]];
        let cy = table[[1, box_idx]];
        let w = table[[2, box_idx]];
        let h = table[[3, box_idx]];
        if w <= 0.0 || h <= 0.0 {
            continue;
        }

        let xyxy = letterbox.to_original([cx - w / 2.0, cy - h / 2.0, cx + w / 2.0, cy + h / 2.0]);
        if xyxy[2] <= xyxy[0] || xyxy[3] <= xyxy[1] {
            continue;
        }

        let class_id = best_class as u32;
        detections.push(Detection {
            xyxy,
            confidence: max_conf,
            class_id,
            class_name: class_name_for(&config.class_names, class_id, |id| format!("class_{}", id)),
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

/// YOLO 검출기
pub struct YoloDetector {
    config: DetectorConfig,
    backend: Box<dyn TensorBackend>,
}

impl YoloDetector {
    pub fn new(config: DetectorConfig, backend: Box<dyn TensorBackend>) -> Self {
        Self { config, backend }
    }
}

impl ObjectDetector for YoloDetector {
    fn detect(&mut self, image: &RgbImage, confidence_threshold: f32) -> AppResult<Vec<Detection>> {
        let (input, letterbox) = letterbox_tensor(image, self.config.input_size)?;
        let outputs = self.backend.run(&input)?;
        let output = outputs
            .first()
            .ok_or_else(|| AppError::InferenceError("YOLO 출력이 비어 있습니다".to_string()))?;
        parse_yolo_output(&output.view(), &letterbox, confidence_threshold, &self.config)
    }

    fn model_info(&self) -> ModelInfo {
        ModelInfo {
            kind: DetectorKind::Yolo,
            input_size: self.config.input_size,
            class_count: self.config.class_names.len() as u32,
            description: self.config.description.clone(),
        }
    }

    fn kind(&self) -> DetectorKind {
        DetectorKind::Yolo
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;
    use ndarray::{Array3, ArrayD};

    /// 후보 열 단위로 [1, 4 + nc, N] 텐서 구성
    fn output_tensor(candidates: &[[f32; 6]]) -> Array3<f32> {
        let mut tensor = Array3::<f32>::zeros((1, 6, candidates.len()));
        for (i, c) in candidates.iter().enumerate() {
            for (attr, value) in c.iter().enumerate() {
                tensor[[0, attr, i]] = *value;
            }
        }
        tensor
    }

    fn config() -> DetectorConfig {
        DetectorConfig {
            class_names: vec!["item".to_string(), "price_tag".to_string()],
            ..DetectorConfig::yolo()
        }
    }

    #[test]
    fn parses_boxes_into_original_pixels() {
        // 640x640 원본 → 스케일 1, 패딩 없음
        let letterbox = Letterbox::new(640, 640, 640);
        let tensor = output_tensor(&[
            [100.0, 100.0, 40.0, 20.0, 0.9, 0.1],
            [300.0, 300.0, 10.0, 10.0, 0.1, 0.2],
        ]);
        let detections =
            parse_yolo_output(&tensor.into_dyn().view(), &letterbox, 0.4, &config()).unwrap();

        assert_eq!(detections.len(), 1);
        assert_eq!(detections[0].xyxy, [80.0, 90.0, 120.0, 110.0]);
        assert_eq!(detections[0].class_name, "item");
        assert!((detections[0].confidence - 0.9).abs() < 1e-6);
    }

    #[test]
    fn threshold_is_inclusive_and_nms_applies() {
        let letterbox = Letterbox::new(640, 640, 640);
        let tensor = output_tensor(&[
            [100.0, 100.0, 40.0, 40.0, 0.0, 0.5],
            [101.0, 100.0, 40.0, 40.0, 0.0, 0.45],
            [400.0, 400.0, 40.0, 40.0, 0.0, 0.4],
        ]);
        let detections =
            parse_yolo_output(&tensor.into_dyn().view(), &letterbox, 0.4, &config()).unwrap();

        assert_eq!(detections.len(), 2);
        assert_eq!(detections[0].class_name, "price_tag");
        assert!((detections[1].confidence - 0.4).abs() < 1e-6);
    }

    #[test]
    fn unnamed_classes_fall_back_to_index() {
        let letterbox = Letterbox::new(640, 640, 640);
        let tensor = output_tensor(&[[50.0, 50.0, 10.0, 10.0, 0.0, 0.8]]);
        let detections = parse_yolo_output(
            &tensor.into_dyn().view(),
            &letterbox,
            0.5,
            &DetectorConfig::yolo(),
        )
        .unwrap();
        assert_eq!(detections[0].class_name, "class_1");
    }

    #[test]
    fn rejects_malformed_shape() {
        let letterbox = Letterbox::new(10, 10, 640);
        let tensor = ArrayD::<f32>::zeros(ndarray::IxDyn(&[1, 4]));
        assert!(parse_yolo_output(&tensor.view(), &letterbox, 0.5, &config()).is_err());
    }

    struct FixedOutput(ArrayD<f32>);

    impl TensorBackend for FixedOutput {
        fn run(&mut self, input: &ArrayD<f32>) -> AppResult<Vec<ArrayD<f32>>> {
            assert_eq!(input.shape(), &[1, 3, 640, 640]);
            Ok(vec![self.0.clone()])
        }
    }

    #[test]
    fn detector_maps_through_letterbox() {
        // 1280x640 원본: 스케일 0.5, 세로 패딩 160
        let tensor = output_tensor(&[[320.0, 320.0, 100.0, 100.0, 0.7, 0.0]]).into_dyn();
        let mut detector = YoloDetector::new(config(), Box::new(FixedOutput(tensor)));
        let image = RgbImage::from_pixel(1280, 640, Rgb([10, 20, 30]));

        let detections = detector.detect(&image, 0.5).unwrap();
        assert_eq!(detections.len(), 1);
        assert_eq!(detections[0].xyxy, [540.0, 220.0, 740.0, 420.0]);
        assert_eq!(detector.kind(), DetectorKind::Yolo);
    }
}
