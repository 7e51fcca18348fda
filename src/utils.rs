use crate::error::{AppError, AppResult};
use image::RgbImage;
use std::path::Path;

/// 이미지 관련 유틸리티 함수들
pub mod image_utils {
    use super::*;
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use image::ImageReader;

    /// 업로드 바이트를 RGB 이미지로 디코딩
    pub fn decode_image(data: &[u8]) -> AppResult<RgbImage> {
        let image = ImageReader::new(std::io::Cursor::new(data))
            .with_guessed_format()?
            .decode()?
            .to_rgb8();
        Ok(image)
    }

    /// 파일 확장자 (소문자, 점 포함)
    pub fn extension_of(file_name: &str) -> Option<String> {
        Path::new(file_name)
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| format!(".{}", ext.to_lowercase()))
    }

    /// 허용된 이미지 확장자인지 확인
    pub fn is_allowed_extension(file_name: &str, allowed: &[String]) -> bool {
        match extension_of(file_name) {
            Some(ext) => allowed.iter().any(|a| a.eq_ignore_ascii_case(&ext)),
            None => false,
        }
    }

    /// 확장자로 MIME 타입 추정 (기본값 image/jpeg)
    pub fn mime_for_file_name(file_name: &str) -> &'static str {
        match extension_of(file_name).as_deref() {
            Some(".png") => "image/png",
            Some(".bmp") => "image/bmp",
            Some(".tif") | Some(".tiff") => "image/tiff",
            Some(".webp") => "image/webp",
            Some(".gif") => "image/gif",
            _ => "image/jpeg",
        }
    }

    /// `data:<mime>;base64,...` 형식 문자열 생성
    pub fn to_data_url(data: &[u8], file_name: &str) -> String {
        format!(
            "data:{};base64,{}",
            mime_for_file_name(file_name),
            STANDARD.encode(data)
        )
    }

    /// data URL (또는 순수 base64) 디코딩
    pub fn decode_data_url(data_url: &str) -> AppResult<Vec<u8>> {
        let payload = match data_url.split_once(";base64,") {
            Some((_, payload)) => payload,
            None => data_url,
        };
        STANDARD
            .decode(payload.trim())
            .map_err(|e| AppError::ValidationError(format!("Invalid base64 image data: {}", e)))
    }
}

/// 수학 관련 유틸리티 함수들
pub mod math_utils {

    /// 시그모이드 함수
    pub fn sigmoid(x: f32) -> f32 {
        1.0 / (1.0 + (-x).exp())
    }

    /// IoU (Intersection over Union) 계산
    pub fn calculate_iou(box1: &[f32; 4], box2: &[f32; 4]) -> f32 {
        let x1 = box1[0].max(box2[0]);
        let y1 = box1[1].max(box2[1]);
        let x2 = box1[2].min(box2[2]);
        let y2 = box1[3].min(box2[3]);

        if x2 <= x1 || y2 <= y1 {
            return 0.0;
        }

        let intersection = (x2 - x1) * (y2 - y1);
        let union = calculate_bbox_area(box1) + calculate_bbox_area(box2) - intersection;
        if union <= 0.0 {
            return 0.0;
        }

        intersection / union
    }

    /// 바운딩 박스 면적 계산
    pub fn calculate_bbox_area(bbox: &[f32; 4]) -> f32 {
        let [x1, y1, x2, y2] = bbox;
        (x2 - x1) * (y2 - y1)
    }

    /// 평균 (비어 있으면 0)
    pub fn mean(values: impl IntoIterator<Item = f64>) -> f64 {
        let (sum, count) = values
            .into_iter()
            .fold((0.0, 0usize), |(sum, count), v| (sum + v, count + 1));
        if count == 0 {
            0.0
        } else {
            sum / count as f64
        }
    }
}

/// 파일 시스템 관련 유틸리티 함수들
pub mod fs_utils {
    use super::*;

    /// 상위 디렉토리가 없으면 생성
    pub fn ensure_parent_dir(path: &Path) -> AppResult<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(AppError::IoError)?;
            }
        }
        Ok(())
    }

    /// 디렉토리 안의 파일 이름 목록 (없으면 빈 목록)
    pub fn list_files(dir: &Path) -> Vec<String> {
        let Ok(entries) = std::fs::read_dir(dir) else {
            return Vec::new();
        };
        let mut files: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().is_file())
            .filter_map(|entry| entry.file_name().to_str().map(|s| s.to_string()))
            .collect();
        files.sort();
        files
    }
}

/// 구간 실행 시간 측정
pub mod perf_utils {
    use std::time::Instant;

    /// 스코프를 벗어날 때 경과 시간을 debug 로그로 남긴다
    pub struct StageTimer {
        started: Instant,
        stage: String,
    }

    impl StageTimer {
        pub fn new(stage: &str) -> Self {
            Self {
                started: Instant::now(),
                stage: stage.to_string(),
            }
        }

        pub fn elapsed_ms(&self) -> f64 {
            self.started.elapsed().as_secs_f64() * 1000.0
        }
    }

    impl Drop for StageTimer {
        fn drop(&mut self) {
            tracing::debug!(stage = %self.stage, elapsed_ms = self.elapsed_ms(), "구간 완료");
        }
    }
}

/// 신뢰도 → 색상 매핑 (렌더링 색상 모드)
pub mod color_utils {
    use image::Rgb;

    /// 5단계 구간 색상
    ///
    /// - 0.9-1.0: 빨간색
    /// - 0.7-0.9: 주황색
    /// - 0.5-0.7: 노란색
    /// - 0.3-0.5: 초록색
    /// - 0.0-0.3: 파란색
    pub fn range_color(confidence: f32) -> Rgb<u8> {
        match confidence {
            conf if conf >= 0.9 => Rgb([255, 0, 0]),
            conf if conf >= 0.7 => Rgb([255, 165, 0]),
            conf if conf >= 0.5 => Rgb([255, 255, 0]),
            conf if conf >= 0.3 => Rgb([0, 255, 0]),
            _ => Rgb([0, 0, 255]),
        }
    }

    /// 파랑 → 초록 → 빨강 선형 보간
    pub fn gradient_color(confidence: f32) -> Rgb<u8> {
        let clamped = confidence.clamp(0.0, 1.0);

        if clamped < 0.5 {
            // 파란색 → 초록색
            let t = clamped * 2.0;
            Rgb([0, (t * 255.0) as u8, ((1.0 - t) * 255.0) as u8])
        } else {
            // 초록색 → 빨간색
            let t = (clamped - 0.5) * 2.0;
            Rgb([(t * 255.0) as u8, ((1.0 - t) * 255.0) as u8, 0])
        }
    }

    /// 색상환 240° (파랑) → 0° (빨강)
    pub fn hsv_color(confidence: f32) -> Rgb<u8> {
        let clamped = confidence.clamp(0.0, 1.0);
        hsv_to_rgb(240.0 - clamped * 240.0, 1.0, 1.0)
    }

    fn hsv_to_rgb(h: f32, s: f32, v: f32) -> Rgb<u8> {
        let c = v * s;
        let x = c * (1.0 - ((h / 60.0) % 2.0 - 1.0).abs());
        let m = v - c;

        let (r, g, b) = match (h / 60.0) as i32 {
            0 => (c, x, 0.0),
            1 => (x, c, 0.0),
            2 => (0.0, c, x),
            3 => (0.0, x, c),
            4 => (x, 0.0, c),
            5 => (c, 0.0, x),
            _ => (c, 0.0, x),
        };

        Rgb([
            ((r + m) * 255.0) as u8,
            ((g + m) * 255.0) as u8,
            ((b + m) * 255.0) as u8,
        ])
    }
}
