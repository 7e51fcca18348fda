// 예측 이력 조회, 통계, 내보내기
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::database::{HistoryDb, PredictionRecord, User};
use crate::error::{AppError, AppResult};
use crate::models::ModelVariant;

pub const DEFAULT_LIMIT: u32 = 100;
pub const MAX_LIMIT: u32 = 1000;

fn default_limit() -> u32 {
    DEFAULT_LIMIT
}

/// 이력 조회 조건
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryQuery {
    #[serde(default)]
    pub skip: u32,
    #[serde(default = "default_limit")]
    pub limit: u32,
    #[serde(default)]
    pub user_id: Option<String>,
    /// 모델 필터 (`all` 또는 생략 시 전체)
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub search_text: Option<String>,
    #[serde(default)]
    pub min_confidence: Option<f64>,
    #[serde(default)]
    pub max_confidence: Option<f64>,
}

impl Default for HistoryQuery {
    fn default() -> Self {
        Self {
            skip: 0,
            limit: DEFAULT_LIMIT,
            user_id: None,
            model: None,
            search_text: None,
            min_confidence: None,
            max_confidence: None,
        }
    }
}

impl HistoryQuery {
    /// 요청 파라미터 범위 검사
    pub fn validate(&self) -> AppResult<()> {
        if !(1..=MAX_LIMIT).contains(&self.limit) {
            return Err(AppError::ValidationError(format!(
                "limit must be between 1 and {}",
                MAX_LIMIT
            )));
        }
        for (name, value) in [
            ("min_confidence", self.min_confidence),
            ("max_confidence", self.max_confidence),
        ] {
            if let Some(v) = value {
                if !(0.0..=1.0).contains(&v) {
                    return Err(AppError::ValidationError(format!(
                        "{} must be between 0.0 and 1.0",
                        name
                    )));
                }
            }
        }
        self.model_filter()?;
        Ok(())
    }

    /// 모델 필터 해석
    pub fn model_filter(&self) -> AppResult<Option<ModelVariant>> {
        match self.model.as_deref().map(str::trim) {
            None | Some("") => Ok(None),
            Some(m) if m.eq_ignore_ascii_case("all") => Ok(None),
            Some(m) => m.parse().map(Some),
        }
    }
}

/// API 로 내보내는 예측 기록 (camelCase)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PredictionView {
    pub id: String,
    pub model: ModelVariant,
    pub image_url: Option<String>,
    pub image_base64: Option<String>,
    pub results: serde_json::Value,
    pub confidence: Option<f64>,
    pub rfdetr_confidence: Option<f64>,
    pub yolo_confidence: Option<f64>,
    pub confidence_threshold: Option<f64>,
    pub rfdetr_threshold: Option<f64>,
    pub yolo_threshold: Option<f64>,
    pub comment: Option<String>,
    pub timestamp: DateTime<Utc>,
    /// 소유자 사용자 이름 (익명이면 None)
    pub user: Option<String>,
}

impl From<PredictionRecord> for PredictionView {
    fn from(record: PredictionRecord) -> Self {
        Self {
            id: record.id,
            model: record.model,
            image_url: record.image_url,
            image_base64: record.image_base64,
            results: record.results,
            confidence: record.confidence,
            rfdetr_confidence: record.rfdetr_confidence,
            yolo_confidence: record.yolo_confidence,
            confidence_threshold: record.confidence_threshold,
            rfdetr_threshold: record.rfdetr_threshold,
            yolo_threshold: record.yolo_threshold,
            comment: record.comment,
            timestamp: record.created_at,
            user: record.username,
        }
    }
}

/// 이력 페이지 응답
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryPage {
    pub predictions: Vec<PredictionView>,
    /// 필터에 맞는 전체 기록 수
    pub total: i64,
    pub skip: u32,
    pub limit: u32,
    pub message: Option<String>,
}

/// 모델별 기록 수
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelCounts {
    pub rfdetr: i64,
    pub yolo: i64,
    pub both: i64,
}

impl ModelCounts {
    pub fn total(&self) -> i64 {
        self.rfdetr + self.yolo + self.both
    }
}

/// 통계 응답
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Statistics {
    pub total: i64,
    pub by_model: ModelCounts,
    pub message: Option<String>,
}

/// 이력 조회 (최신순)
pub fn query_history(db: &HistoryDb, query: &HistoryQuery) -> AppResult<HistoryPage> {
    query.validate()?;
    let (records, total) = db.list_predictions(query)?;
    let predictions: Vec<PredictionView> = records.into_iter().map(PredictionView::from).collect();
    let message = predictions.is_empty().then(|| "No predictions found".to_string());

    Ok(HistoryPage {
        predictions,
        total,
        skip: query.skip,
        limit: query.limit,
        message,
    })
}

pub fn statistics(db: &HistoryDb) -> AppResult<Statistics> {
    let by_model = db.count_by_model()?;
    let total = by_model.total();
    Ok(Statistics {
        total,
        by_model,
        message: (total == 0).then(|| "No predictions found".to_string()),
    })
}

// ---- 내보내기 ----

/// 내보내기용 사용자 정보
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportUser {
    pub id: String,
    pub username: String,
    pub email: Option<String>,
    pub created_at: DateTime<Utc>,
    pub is_active: bool,
    pub is_superuser: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub predictions_count: Option<i64>,
}

impl ExportUser {
    fn new(user: &User, predictions_count: Option<i64>) -> Self {
        Self {
            id: user.id.clone(),
            username: user.username.clone(),
            email: user.email.clone(),
            created_at: user.created_at,
            is_active: user.is_active,
            is_superuser: user.is_superuser,
            predictions_count,
        }
    }
}

/// 내보내기용 예측 기록 (소유자 전체 정보 포함)
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportPrediction {
    #[serde(flatten)]
    pub prediction: PredictionView,
    pub image_hash: Option<String>,
    pub owner: Option<ExportUser>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportInfo {
    pub timestamp: DateTime<Utc>,
    pub total_predictions: usize,
    pub total_users: usize,
    pub exported_by: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportStatistics {
    pub by_model: ModelCounts,
    /// 사용자 이름 → 기록 수
    pub by_user: BTreeMap<String, i64>,
}

/// 전체 이력 내보내기 문서
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportDocument {
    pub export_info: ExportInfo,
    pub predictions: Vec<ExportPrediction>,
    pub users: Vec<ExportUser>,
    pub statistics: ExportStatistics,
}

/// 내보내기 문서 생성
pub fn export_document(db: &HistoryDb, exported_by: &str) -> AppResult<ExportDocument> {
    let users = db.users_with_prediction_counts()?;
    let records = db.all_predictions()?;
    let by_model = db.count_by_model()?;

    let predictions: Vec<ExportPrediction> = records
        .into_iter()
        .map(|record| {
            let owner = record
                .user_id
                .as_deref()
                .and_then(|id| users.iter().find(|(u, _)| u.id == id))
                .map(|(u, _)| ExportUser::new(u, None));
            ExportPrediction {
                image_hash: record.image_hash.clone(),
                prediction: PredictionView::from(record),
                owner,
            }
        })
        .collect();

    let by_user: BTreeMap<String, i64> = users
        .iter()
        .map(|(u, count)| (u.username.clone(), *count))
        .collect();

    tracing::info!(
        "이력 내보내기: 예측 {}건, 사용자 {}명 ({})",
        predictions.len(),
        users.len(),
        exported_by
    );

    Ok(ExportDocument {
        export_info: ExportInfo {
            timestamp: Utc::now(),
            total_predictions: predictions.len(),
            total_users: users.len(),
            exported_by: exported_by.to_string(),
        },
        predictions,
        users: users.iter().map(|(u, count)| ExportUser::new(u, Some(*count))).collect(),
        statistics: ExportStatistics { by_model, by_user },
    })
}
