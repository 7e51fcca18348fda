// 검출 결과 렌더링 (캔버스 맞춤, 폴리곤 병합, 오버레이 그리기)
use ab_glyph::FontVec;
use image::imageops::FilterType;
use image::{ImageFormat, Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_polygon_mut, draw_hollow_rect_mut, draw_text_mut, text_size};
use imageproc::point::Point;
use imageproc::rect::Rect;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use std::str::FromStr;

use crate::config::{ColorMappingMode, RenderConfig};
use crate::error::{AppError, AppResult};
use crate::models::DetectorKind;
use crate::utils::{color_utils, math_utils};

const LABEL_TEXT_COLOR: Rgb<u8> = Rgb([255, 255, 255]);
const LABEL_PADDING: u32 = 3;

/// 표시용 캔버스 크기
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DisplayCanvas {
    pub width: u32,
    pub height: u32,
    /// 원본 → 캔버스 배율 (1 이하)
    pub scale: f32,
}

/// 박스 모드 / 폴리곤(병합) 모드
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DisplayMode {
    #[default]
    Boxes,
    Polygons,
}

impl FromStr for DisplayMode {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "boxes" | "box" => Ok(DisplayMode::Boxes),
            "polygons" | "polygon" => Ok(DisplayMode::Polygons),
            other => Err(AppError::ValidationError(format!("Unknown display mode: {}", other))),
        }
    }
}

/// 신뢰도가 붙은 원본 좌표 박스
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoredBox {
    pub bbox: [f32; 4],
    pub confidence: f32,
}

/// 겹치는 박스 묶음의 외곽 영역
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MergedRegion {
    pub bbox: [f32; 4],
    /// 구성 박스 신뢰도의 산술 평균
    pub confidence: f32,
    pub members: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShapeKind {
    Rectangle,
    Polygon,
}

/// 캔버스 좌표로 변환된 도형 하나
#[derive(Debug, Clone, PartialEq)]
pub struct OverlayShape {
    pub model: DetectorKind,
    pub kind: ShapeKind,
    /// 캔버스 좌표 [x1, y1, x2, y2]
    pub bbox: [f32; 4],
    pub vertices: Vec<(f32, f32)>,
    pub color: Rgb<u8>,
    pub label: String,
    pub confidence: f32,
    pub members: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Overlay {
    pub canvas: DisplayCanvas,
    pub shapes: Vec<OverlayShape>,
}

/// 비율을 유지한 채 최대 표시 크기에 맞춤 (확대하지 않음)
pub fn fit_canvas(image_width: u32, image_height: u32, max_width: u32, max_height: u32) -> DisplayCanvas {
    if image_width == 0 || image_height == 0 {
        return DisplayCanvas {
            width: image_width,
            height: image_height,
            scale: 1.0,
        };
    }
    let scale = (max_width as f32 / image_width as f32)
        .min(max_height as f32 / image_height as f32)
        .min(1.0);
    DisplayCanvas {
        width: ((image_width as f32 * scale).round() as u32).max(1),
        height: ((image_height as f32 * scale).round() as u32).max(1),
        scale,
    }
}

/// AABB 겹침 (모서리가 닿기만 해도 겹침)
pub fn boxes_overlap(a: &[f32; 4], b: &[f32; 4]) -> bool {
    !(a[2] < b[0] || b[2] < a[0] || a[3] < b[1] || b[3] < a[1])
}

/// 겹침 관계의 연결 요소별 외곽 박스 (DFS, O(n²))
pub fn merge_overlapping(boxes: &[ScoredBox]) -> Vec<MergedRegion> {
    let mut visited = vec![false; boxes.len()];
    let mut regions = Vec::new();

    for start in 0..boxes.len() {
        if visited[start] {
            continue;
        }
        visited[start] = true;
        let mut stack = vec![start];
        let mut members = Vec::new();

        while let Some(i) = stack.pop() {
            members.push(i);
            for (j, other) in boxes.iter().enumerate() {
                if !visited[j] && boxes_overlap(&boxes[i].bbox, &other.bbox) {
                    visited[j] = true;
                    stack.push(j);
                }
            }
        }

        let mut envelope = [f32::MAX, f32::MAX, f32::MIN, f32::MIN];
        for &i in &members {
            let b = boxes[i].bbox;
            envelope[0] = envelope[0].min(b[0]);
            envelope[1] = envelope[1].min(b[1]);
            envelope[2] = envelope[2].max(b[2]);
            envelope[3] = envelope[3].max(b[3]);
        }
        let confidence = math_utils::mean(members.iter().map(|&i| boxes[i].confidence as f64)) as f32;
        regions.push(MergedRegion {
            bbox: envelope,
            confidence,
            members: members.len(),
        });
    }

    regions
}

/// 저장된 결과 JSON 에서 검출기별 박스 추출 (형식이 틀린 항목은 건너뜀)
pub fn extract_boxes(results: &Value) -> Vec<(DetectorKind, Vec<ScoredBox>)> {
    let mut outputs = Vec::new();
    let Some(object) = results.as_object() else {
        return outputs;
    };

    if object.contains_key("detections") {
        let kind = object
            .get("model")
            .and_then(Value::as_str)
            .and_then(|m| m.parse().ok())
            .unwrap_or(DetectorKind::RfDetr);
        outputs.push((kind, boxes_from_output(results)));
        return outputs;
    }

    for kind in DetectorKind::ALL {
        if let Some(output) = object.get(kind.as_str()) {
            outputs.push((kind, boxes_from_output(output)));
        }
    }
    outputs
}

fn boxes_from_output(output: &Value) -> Vec<ScoredBox> {
    match output.get("detections") {
        // [{ xyxy, confidence, ... }, ...]
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|item| {
                let bbox = parse_xyxy(item.get("xyxy").or_else(|| item.get("bbox"))?)?;
                let confidence = item.get("confidence")?.as_f64()? as f32;
                Some(ScoredBox { bbox, confidence })
            })
            .collect(),
        // { xyxy: [[..]], confidence: [..] }
        Some(Value::Object(columns)) => {
            let xyxy = columns.get("xyxy").and_then(Value::as_array);
            let confidence = columns.get("confidence").and_then(Value::as_array);
            match (xyxy, confidence) {
                (Some(xyxy), Some(confidence)) => xyxy
                    .iter()
                    .zip(confidence)
                    .filter_map(|(b, c)| {
                        Some(ScoredBox {
                            bbox: parse_xyxy(b)?,
                            confidence: c.as_f64()? as f32,
                        })
                    })
                    .collect(),
                _ => Vec::new(),
            }
        }
        _ => Vec::new(),
    }
}

fn parse_xyxy(value: &Value) -> Option<[f32; 4]> {
    let items = value.as_array()?;
    if items.len() != 4 {
        return None;
    }
    let mut bbox = [0.0f32; 4];
    for (slot, item) in bbox.iter_mut().zip(items) {
        *slot = item.as_f64()? as f32;
    }
    if !bbox.iter().all(|v| v.is_finite()) || bbox[2] < bbox[0] || bbox[3] < bbox[1] {
        return None;
    }
    Some(bbox)
}

fn shape_color(config: &RenderConfig, model: DetectorKind, merged: bool, confidence: f32) -> Rgb<u8> {
    match config.color_mode {
        ColorMappingMode::Fixed if merged => Rgb(config.merged_color),
        ColorMappingMode::Fixed => match model {
            DetectorKind::RfDetr => Rgb(config.rfdetr_color),
            DetectorKind::Yolo => Rgb(config.yolo_color),
        },
        ColorMappingMode::RangeBased => color_utils::range_color(confidence),
        ColorMappingMode::Gradient => color_utils::gradient_color(confidence),
        ColorMappingMode::HsvBased => color_utils::hsv_color(confidence),
    }
}

/// 도형 라벨 (`YOLO 85%`, 병합이면 `YOLO 70% (3)`)
pub fn shape_label(model: DetectorKind, confidence: f32, members: usize) -> String {
    let pct = (confidence * 100.0).round() as i32;
    if members > 1 {
        format!("{} {}% ({})", model.display_name(), pct, members)
    } else {
        format!("{} {}%", model.display_name(), pct)
    }
}

fn to_canvas(bbox: [f32; 4], canvas: &DisplayCanvas) -> [f32; 4] {
    let max_x = canvas.width.saturating_sub(1) as f32;
    let max_y = canvas.height.saturating_sub(1) as f32;
    [
        (bbox[0] * canvas.scale).clamp(0.0, max_x),
        (bbox[1] * canvas.scale).clamp(0.0, max_y),
        (bbox[2] * canvas.scale).clamp(0.0, max_x),
        (bbox[3] * canvas.scale).clamp(0.0, max_y),
    ]
}

/// 결과 JSON 으로 오버레이 구성 (데이터가 없거나 잘못되면 빈 오버레이)
pub fn build_overlay(
    results: &Value,
    image_width: u32,
    image_height: u32,
    config: &RenderConfig,
    mode: DisplayMode,
) -> Overlay {
    let canvas = fit_canvas(image_width, image_height, config.max_display_width, config.max_display_height);
    let mut shapes = Vec::new();

    for (model, boxes) in extract_boxes(results) {
        match mode {
            DisplayMode::Boxes => {
                for b in &boxes {
                    let bbox = to_canvas(b.bbox, &canvas);
                    shapes.push(OverlayShape {
                        model,
                        kind: ShapeKind::Rectangle,
                        bbox,
                        vertices: corners(bbox),
                        color: shape_color(config, model, false, b.confidence),
                        label: shape_label(model, b.confidence, 1),
                        confidence: b.confidence,
                        members: 1,
                    });
                }
            }
            DisplayMode::Polygons => {
                for region in merge_overlapping(&boxes) {
                    let merged = region.members > 1;
                    let bbox = to_canvas(region.bbox, &canvas);
                    shapes.push(OverlayShape {
                        model,
                        kind: if merged { ShapeKind::Polygon } else { ShapeKind::Rectangle },
                        bbox,
                        vertices: corners(bbox),
                        color: shape_color(config, model, merged, region.confidence),
                        label: shape_label(model, region.confidence, region.members),
                        confidence: region.confidence,
                        members: region.members,
                    });
                }
            }
        }
    }

    Overlay { canvas, shapes }
}

fn corners(bbox: [f32; 4]) -> Vec<(f32, f32)> {
    let [x1, y1, x2, y2] = bbox;
    vec![(x1, y1), (x2, y1), (x2, y2), (x1, y2)]
}

/// 라벨용 TTF 폰트 로드
pub fn load_font(path: &Path) -> AppResult<FontVec> {
    let data = std::fs::read(path)?;
    FontVec::try_from_vec(data)
        .map_err(|_| AppError::ConfigError(format!("폰트 파일을 읽을 수 없습니다: {}", path.display())))
}

/// 캔버스 크기로 줄인 이미지 위에 오버레이 그리기
pub fn rasterize(image: &RgbImage, overlay: &Overlay, font: Option<&FontVec>, font_size: f32) -> RgbImage {
    let canvas = overlay.canvas;
    let mut output = if (canvas.width, canvas.height) == image.dimensions() {
        image.clone()
    } else {
        image::imageops::resize(image, canvas.width, canvas.height, FilterType::Triangle)
    };
    if output.width() == 0 || output.height() == 0 {
        return output;
    }

    for shape in &overlay.shapes {
        let [x1, y1, x2, y2] = shape.bbox;
        match shape.kind {
            ShapeKind::Rectangle => {
                for inset in 0..2 {
                    let x = x1 as i32 + inset;
                    let y = y1 as i32 + inset;
                    let w = ((x2 - x1) as i32 - 2 * inset).max(1) as u32;
                    let h = ((y2 - y1) as i32 - 2 * inset).max(1) as u32;
                    draw_hollow_rect_mut(&mut output, Rect::at(x, y).of_size(w, h), shape.color);
                }
            }
            ShapeKind::Polygon => {
                for inset in [0.0f32, 1.0] {
                    // 폭이나 높이가 없는 영역은 다각형이 닫히지 않으므로 사각형으로 그린다
                    if x2 - x1 <= 2.0 * inset || y2 - y1 <= 2.0 * inset {
                        let w = ((x2 - x1) - 2.0 * inset).max(1.0) as u32;
                        let h = ((y2 - y1) - 2.0 * inset).max(1.0) as u32;
                        let rect = Rect::at((x1 + inset) as i32, (y1 + inset) as i32).of_size(w, h);
                        draw_hollow_rect_mut(&mut output, rect, shape.color);
                        continue;
                    }
                    let points: Vec<Point<f32>> = shape
                        .vertices
                        .iter()
                        .zip([(1.0, 1.0), (-1.0, 1.0), (-1.0, -1.0), (1.0, -1.0)])
                        .map(|(&(x, y), (dx, dy))| Point::new(x + dx * inset, y + dy * inset))
                        .collect();
                    draw_hollow_polygon_mut(&mut output, &points, shape.color);
                }
            }
        }
        draw_label(&mut output, shape, font, font_size);
    }

    output
}

fn draw_label(output: &mut RgbImage, shape: &OverlayShape, font: Option<&FontVec>, font_size: f32) {
    let (text_w, text_h) = match font {
        Some(font) => text_size(font_size, font, &shape.label),
        None => ((shape.label.len() as f32 * font_size * 0.5) as u32, font_size as u32),
    };
    let tab_w = text_w + 2 * LABEL_PADDING;
    let tab_h = text_h + 2 * LABEL_PADDING;

    // 박스 위에 자리가 없으면 박스 안쪽 상단
    let x = shape.bbox[0] as i32;
    let above = shape.bbox[1] as i32 - tab_h as i32;
    let y = if above >= 0 { above } else { shape.bbox[1] as i32 };

    draw_filled_rect_mut(output, Rect::at(x, y).of_size(tab_w.max(1), tab_h.max(1)), shape.color);
    if let Some(font) = font {
        draw_text_mut(
            output,
            LABEL_TEXT_COLOR,
            x + LABEL_PADDING as i32,
            y + LABEL_PADDING as i32,
            font_size,
            font,
            &shape.label,
        );
    }
}

/// 원본 이미지 바이트와 결과로 렌더링한 PNG
pub fn render_png(
    image_bytes: &[u8],
    results: &Value,
    config: &RenderConfig,
    mode: DisplayMode,
    font: Option<&FontVec>,
) -> AppResult<Vec<u8>> {
    let image = crate::utils::image_utils::decode_image(image_bytes)?;
    let overlay = build_overlay(results, image.width(), image.height(), config, mode);
    let rendered = rasterize(&image, &overlay, font, config.font_size);
    let mut buffer = std::io::Cursor::new(Vec::new());
    rendered.write_to(&mut buffer, ImageFormat::Png)?;
    Ok(buffer.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn scored(bbox: [f32; 4], confidence: f32) -> ScoredBox {
        ScoredBox { bbox, confidence }
    }

    #[test]
    fn canvas_fits_without_upscaling() {
        let canvas = fit_canvas(1600, 900, 800, 600);
        assert_eq!((canvas.width, canvas.height), (800, 450));
        assert!((canvas.scale - 0.5).abs() < 1e-6);

        let small = fit_canvas(320, 240, 800, 600);
        assert_eq!((small.width, small.height), (320, 240));
        assert_eq!(small.scale, 1.0);
    }

    #[test]
    fn touching_edges_overlap() {
        assert!(boxes_overlap(&[0.0, 0.0, 10.0, 10.0], &[10.0, 0.0, 20.0, 10.0]));
        assert!(!boxes_overlap(&[0.0, 0.0, 10.0, 10.0], &[10.5, 0.0, 20.0, 10.0]));
        assert!(!boxes_overlap(&[0.0, 0.0, 10.0, 10.0], &[0.0, 11.0, 10.0, 20.0]));
    }

    #[test]
    fn overlapping_pair_merges_into_envelope() {
        let regions = merge_overlapping(&[
            scored([0.0, 0.0, 10.0, 10.0], 0.8),
            scored([5.0, 5.0, 15.0, 15.0], 0.6),
        ]);
        assert_eq!(regions.len(), 1);
        assert_eq!(regions[0].bbox, [0.0, 0.0, 15.0, 15.0]);
        assert!((regions[0].confidence - 0.7).abs() < 1e-6);
        assert_eq!(regions[0].members, 2);
    }

    #[test]
    fn merge_is_transitive() {
        // a-b, b-c 는 겹치지만 a-c 는 겹치지 않음
        let regions = merge_overlapping(&[
            scored([0.0, 0.0, 10.0, 10.0], 0.9),
            scored([50.0, 50.0, 60.0, 60.0], 0.5),
            scored([8.0, 8.0, 20.0, 20.0], 0.6),
            scored([18.0, 18.0, 30.0, 30.0], 0.3),
        ]);
        assert_eq!(regions.len(), 2);
        assert_eq!(regions[0].bbox, [0.0, 0.0, 30.0, 30.0]);
        assert_eq!(regions[0].members, 3);
        assert_eq!(regions[1].members, 1);
    }

    #[test]
    fn malformed_results_yield_empty_overlay() {
        let config = RenderConfig::default();
        for results in [
            json!(null),
            json!("text"),
            json!({}),
            json!({"detections": "nope"}),
            json!({"detections": [{"xyxy": [1, 2], "confidence": 0.5}]}),
            json!({"yolo": {"detections": [{"xyxy": [1, 2, 3, 4]}]}}),
        ] {
            let overlay = build_overlay(&results, 100, 100, &config, DisplayMode::Boxes);
            assert!(overlay.shapes.is_empty(), "{}", results);
        }
    }

    #[test]
    fn polygon_mode_merges_per_model() {
        let results = json!({
            "rfdetr": {
                "model": "rfdetr",
                "confidence": 0.7,
                "detections": [
                    {"xyxy": [0, 0, 10, 10], "confidence": 0.8, "class_id": 0, "class_name": "item"},
                    {"xyxy": [5, 5, 15, 15], "confidence": 0.6, "class_id": 0, "class_name": "item"}
                ]
            },
            "yolo": {
                "model": "yolo",
                "confidence": 0.9,
                "detections": [
                    {"xyxy": [2, 2, 12, 12], "confidence": 0.9, "class_id": 0, "class_name": "item"}
                ]
            }
        });
        let config = RenderConfig::default();

        let boxes = build_overlay(&results, 100, 100, &config, DisplayMode::Boxes);
        assert_eq!(boxes.shapes.len(), 3);

        let polygons = build_overlay(&results, 100, 100, &config, DisplayMode::Polygons);
        assert_eq!(polygons.shapes.len(), 2);
        let merged = &polygons.shapes[0];
        assert_eq!(merged.model, DetectorKind::RfDetr);
        assert_eq!(merged.kind, ShapeKind::Polygon);
        assert_eq!(merged.label, "RF-DETR 70% (2)");
        assert_eq!(merged.color, Rgb(config.merged_color));
        assert_eq!(polygons.shapes[1].label, "YOLO 90%");
        assert_eq!(polygons.shapes[1].kind, ShapeKind::Rectangle);
    }

    #[test]
    fn columnar_detections_are_accepted_and_scaled() {
        let results = json!({
            "model": "yolo",
            "detections": {"xyxy": [[100, 100, 200, 200]], "confidence": [0.85]}
        });
        let config = RenderConfig::default();
        let overlay = build_overlay(&results, 1600, 1200, &config, DisplayMode::Boxes);
        assert_eq!(overlay.shapes.len(), 1);
        assert_eq!(overlay.shapes[0].bbox, [50.0, 50.0, 100.0, 100.0]);
        assert_eq!(overlay.shapes[0].label, "YOLO 85%");
        assert_eq!(overlay.shapes[0].color, Rgb(config.yolo_color));
    }

    #[test]
    fn rasterize_draws_on_resized_canvas() {
        let image = RgbImage::from_pixel(200, 100, Rgb([0, 0, 0]));
        let config = RenderConfig {
            max_display_width: 100,
            max_display_height: 100,
            ..RenderConfig::default()
        };
        let results = json!({"model": "yolo", "detections": [{"xyxy": [20, 40, 120, 90], "confidence": 0.5}]});
        let overlay = build_overlay(&results, 200, 100, &config, DisplayMode::Boxes);
        let output = rasterize(&image, &overlay, None, config.font_size);

        assert_eq!(output.dimensions(), (100, 50));
        // 박스 오른쪽 아래 모서리
        assert_eq!(*output.get_pixel(59, 44), Rgb(config.yolo_color));
        assert_eq!(*output.get_pixel(90, 10), Rgb([0, 0, 0]));
    }

    #[test]
    fn flat_merged_regions_draw_without_polygon() {
        let image = RgbImage::from_pixel(32, 24, Rgb([0, 0, 0]));
        let config = RenderConfig::default();

        // 이미지 아래로 벗어나 높이가 0 으로 잘리는 영역
        let clamped = json!({"model": "yolo", "detections": [
            {"xyxy": [2, 30, 10, 40], "confidence": 0.8},
            {"xyxy": [5, 30, 15, 40], "confidence": 0.6}
        ]});
        let overlay = build_overlay(&clamped, 32, 24, &config, DisplayMode::Polygons);
        assert_eq!(overlay.shapes.len(), 1);
        assert_eq!(overlay.shapes[0].kind, ShapeKind::Polygon);
        assert_eq!(overlay.shapes[0].bbox, [2.0, 23.0, 15.0, 23.0]);
        let output = rasterize(&image, &overlay, None, config.font_size);
        assert_eq!(*output.get_pixel(8, 23), Rgb(config.merged_color));

        // 높이 2px: 안쪽 선에서 위아래가 겹친다
        let thin = json!({"model": "yolo", "detections": [
            {"xyxy": [2, 5, 10, 7], "confidence": 0.8},
            {"xyxy": [5, 5, 15, 7], "confidence": 0.6}
        ]});
        let overlay = build_overlay(&thin, 32, 24, &config, DisplayMode::Polygons);
        assert_eq!(overlay.shapes[0].kind, ShapeKind::Polygon);
        let output = rasterize(&image, &overlay, None, config.font_size);
        assert_eq!(*output.get_pixel(8, 7), Rgb(config.merged_color));
    }

    #[test]
    fn display_mode_parsing() {
        assert_eq!("polygons".parse::<DisplayMode>().unwrap(), DisplayMode::Polygons);
        assert_eq!("Boxes".parse::<DisplayMode>().unwrap(), DisplayMode::Boxes);
        assert!("circles".parse::<DisplayMode>().is_err());
    }
}
