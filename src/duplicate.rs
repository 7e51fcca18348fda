// 중복 예측 판별과 이미지 콘텐츠 해시
use image::RgbImage;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::database::HistoryDb;
use crate::error::AppResult;
use crate::models::ModelVariant;

/// 중복 확인 조건: 이미지 해시 + 모델 + 임계값 조합
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DuplicateQuery {
    pub image_hash: String,
    pub model: ModelVariant,
    #[serde(default)]
    pub rfdetr_threshold: Option<f64>,
    #[serde(default)]
    pub yolo_threshold: Option<f64>,
}

/// `check-duplicate` 응답
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DuplicateCheck {
    pub is_duplicate: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duplicate_id: Option<String>,
}

impl DuplicateQuery {
    /// 단일 모델 요청 조건
    pub fn for_variant(image_hash: &str, model: ModelVariant, rfdetr_threshold: Option<f64>, yolo_threshold: Option<f64>) -> Self {
        Self {
            image_hash: image_hash.to_string(),
            model,
            rfdetr_threshold,
            yolo_threshold,
        }
    }
}

/// 기존 기록이 있는지 확인 (가장 오래된 기록이 우선)
pub fn check_duplicate(db: &HistoryDb, query: &DuplicateQuery) -> AppResult<DuplicateCheck> {
    let duplicate_id = db.find_duplicate(query)?;
    if let Some(id) = &duplicate_id {
        tracing::debug!("중복 예측 발견: {} ({}, {})", id, query.model, query.image_hash);
    }
    Ok(DuplicateCheck {
        is_duplicate: duplicate_id.is_some(),
        duplicate_id,
    })
}

/// 이미지 바이트의 SHA-256 (소문자 hex)
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

/// 콘텐츠 해시 종류 (우선순위 순)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentHash {
    /// 파일 바이트 SHA-256, 서버의 `image_hash` 와 동일
    Sha256(String),
    /// 디코딩된 픽셀 샘플 해시
    PixelSample(String),
    /// 파일 이름 + 크기 + 수정 시각
    Fingerprint(String),
}

impl ContentHash {
    pub fn as_str(&self) -> &str {
        match self {
            ContentHash::Sha256(s) | ContentHash::PixelSample(s) | ContentHash::Fingerprint(s) => s,
        }
    }

    /// 서버 중복 확인에 그대로 쓸 수 있는지 여부
    pub fn is_exact(&self) -> bool {
        matches!(self, ContentHash::Sha256(_))
    }
}

/// 해시 계산에 쓸 수 있는 입력
#[derive(Debug, Clone, Default)]
pub struct HashSource<'a> {
    pub file_name: &'a str,
    pub bytes: Option<&'a [u8]>,
    pub image: Option<&'a RgbImage>,
    pub size: u64,
    pub modified: Option<SystemTime>,
}

/// 폴백 체인: SHA-256 → 픽셀 샘플 → 파일 메타데이터
pub fn content_hash(source: &HashSource<'_>) -> ContentHash {
    if let Some(bytes) = source.bytes.filter(|b| !b.is_empty()) {
        return ContentHash::Sha256(sha256_hex(bytes));
    }
    if let Some(image) = source.image.filter(|i| i.width() > 0 && i.height() > 0) {
        return ContentHash::PixelSample(pixel_sample_hash(image));
    }
    tracing::warn!("콘텐츠 해시 폴백: 파일 메타데이터 사용 ({})", source.file_name);
    ContentHash::Fingerprint(fingerprint(source))
}

/// 크기와 격자 샘플 픽셀로 만든 해시
pub fn pixel_sample_hash(image: &RgbImage) -> String {
    const GRID: u32 = 16;
    let (width, height) = image.dimensions();
    let mut hasher = Sha256::new();
    hasher.update(width.to_le_bytes());
    hasher.update(height.to_le_bytes());
    for gy in 0..GRID {
        for gx in 0..GRID {
            let x = (gx * width / GRID).min(width - 1);
            let y = (gy * height / GRID).min(height - 1);
            hasher.update(image.get_pixel(x, y).0);
        }
    }
    format!("px-{:x}", hasher.finalize())
}

fn fingerprint(source: &HashSource<'_>) -> String {
    let modified = source
        .modified
        .and_then(|m| m.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_millis())
        .unwrap_or(0);
    format!("{}:{}:{}", source.file_name, source.size, modified)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::NewPrediction;
    use image::Rgb;
    use serde_json::json;

    fn store(db: &HistoryDb, model: ModelVariant, hash: &str, rfdetr: Option<f64>, yolo: Option<f64>) -> String {
        db.create_prediction(&NewPrediction {
            user_id: None,
            model,
            image_url: None,
            image_base64: None,
            image_hash: Some(hash.to_string()),
            results: json!({}),
            confidence: None,
            rfdetr_confidence: None,
            yolo_confidence: None,
            confidence_threshold: None,
            rfdetr_threshold: rfdetr,
            yolo_threshold: yolo,
            comment: None,
        })
        .unwrap()
        .id
    }

    #[test]
    fn same_hash_model_threshold_is_duplicate() {
        let db = HistoryDb::open_in_memory().unwrap();
        let id = store(&db, ModelVariant::Yolo, "abc", None, Some(0.4));

        let hit = check_duplicate(
            &db,
            &DuplicateQuery::for_variant("abc", ModelVariant::Yolo, None, Some(0.4)),
        )
        .unwrap();
        assert!(hit.is_duplicate);
        assert_eq!(hit.duplicate_id, Some(id));

        let other_threshold = check_duplicate(
            &db,
            &DuplicateQuery::for_variant("abc", ModelVariant::Yolo, None, Some(0.5)),
        )
        .unwrap();
        assert!(!other_threshold.is_duplicate);

        let other_model = check_duplicate(
            &db,
            &DuplicateQuery::for_variant("abc", ModelVariant::RfDetr, Some(0.4), None),
        )
        .unwrap();
        assert!(!other_model.is_duplicate);
    }

    #[test]
    fn missing_threshold_matches_null_for_single_models() {
        let db = HistoryDb::open_in_memory().unwrap();
        store(&db, ModelVariant::RfDetr, "h", None, None);
        let hit = check_duplicate(&db, &DuplicateQuery::for_variant("h", ModelVariant::RfDetr, None, None)).unwrap();
        assert!(hit.is_duplicate);
        let miss = check_duplicate(&db, &DuplicateQuery::for_variant("h", ModelVariant::RfDetr, Some(0.5), None)).unwrap();
        assert!(!miss.is_duplicate);
    }

    #[test]
    fn both_variant_only_filters_supplied_thresholds() {
        let db = HistoryDb::open_in_memory().unwrap();
        let id = store(&db, ModelVariant::Both, "h", Some(0.1), Some(0.4));

        let partial = check_duplicate(&db, &DuplicateQuery::for_variant("h", ModelVariant::Both, Some(0.1), None)).unwrap();
        assert_eq!(partial.duplicate_id, Some(id.clone()));

        let mismatch = check_duplicate(&db, &DuplicateQuery::for_variant("h", ModelVariant::Both, Some(0.1), Some(0.5))).unwrap();
        assert!(!mismatch.is_duplicate);
    }

    #[test]
    fn oldest_record_wins() {
        let db = HistoryDb::open_in_memory().unwrap();
        let first = store(&db, ModelVariant::Yolo, "h", None, Some(0.4));
        store(&db, ModelVariant::Yolo, "h", None, Some(0.4));
        let hit = check_duplicate(&db, &DuplicateQuery::for_variant("h", ModelVariant::Yolo, None, Some(0.4))).unwrap();
        assert_eq!(hit.duplicate_id, Some(first));
    }

    #[test]
    fn sha256_matches_known_digest() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn hash_fallback_chain() {
        let image = RgbImage::from_pixel(4, 4, Rgb([1, 2, 3]));
        let exact = content_hash(&HashSource {
            file_name: "a.png",
            bytes: Some(b"abc".as_slice()),
            image: Some(&image),
            ..HashSource::default()
        });
        assert!(exact.is_exact());
        assert_eq!(exact.as_str(), sha256_hex(b"abc"));

        let pixel = content_hash(&HashSource {
            file_name: "a.png",
            bytes: Some(&[][..]),
            image: Some(&image),
            ..HashSource::default()
        });
        assert!(matches!(pixel, ContentHash::PixelSample(_)));

        let fallback = content_hash(&HashSource {
            file_name: "a.png",
            size: 42,
            modified: Some(UNIX_EPOCH + std::time::Duration::from_millis(1500)),
            ..HashSource::default()
        });
        assert_eq!(fallback, ContentHash::Fingerprint("a.png:42:1500".to_string()));
    }

    #[test]
    fn pixel_hash_changes_with_content() {
        let a = RgbImage::from_pixel(40, 30, Rgb([10, 10, 10]));
        let mut b = a.clone();
        b.put_pixel(0, 0, Rgb([200, 0, 0]));
        assert_ne!(pixel_sample_hash(&a), pixel_sample_hash(&b));
        assert_eq!(pixel_sample_hash(&a), pixel_sample_hash(&a.clone()));
    }
}
