// 이미지 제출 흐름: 해시 → 중복 확인 → 예측 → 상태 반영
use std::path::Path;

use super::store::{Action, NotificationLevel, Store};
use super::{ApiClient, PredictResponse};
use crate::duplicate::{content_hash, DuplicateQuery, HashSource};
use crate::error::AppError;
use crate::models::{DetectorKind, ModelVariant};

/// 제출할 이미지와 옵션
#[derive(Debug, Clone)]
pub struct Submission {
    pub variant: ModelVariant,
    pub file_name: String,
    pub bytes: Vec<u8>,
    pub rfdetr_threshold: Option<f64>,
    pub yolo_threshold: Option<f64>,
    pub comment: Option<String>,
}

impl Submission {
    /// 파일에서 제출 항목 생성
    pub fn from_file(path: &Path, variant: ModelVariant) -> std::io::Result<Self> {
        let bytes = std::fs::read(path)?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "upload".to_string());
        Ok(Self {
            variant,
            file_name,
            bytes,
            rfdetr_threshold: None,
            yolo_threshold: None,
            comment: None,
        })
    }
}

fn failure_message(error: &AppError) -> String {
    match error {
        AppError::ApiError { detail, .. } => detail.clone(),
        other => other.to_string(),
    }
}

/// 이미지를 제출하고 표시된 기록 ID 를 돌려준다 (실패는 알림으로 남김)
pub async fn submit_image(client: &ApiClient, store: &mut Store, mut submission: Submission) -> Option<String> {
    store.dispatch(Action::PredictionStarted);

    // 요청에 빠진 임계값은 서버 기본값으로 채워 중복 확인 조건을 맞춘다
    let uses = |kind: DetectorKind| submission.variant.detectors().contains(&kind);
    let needs_rfdetr = uses(DetectorKind::RfDetr) && submission.rfdetr_threshold.is_none();
    let needs_yolo = uses(DetectorKind::Yolo) && submission.yolo_threshold.is_none();
    if needs_rfdetr || needs_yolo {
        match client.settings().await {
            Ok(settings) => {
                if needs_rfdetr {
                    submission.rfdetr_threshold = Some(settings.rfdetr_default_threshold);
                }
                if needs_yolo {
                    submission.yolo_threshold = Some(settings.yolo_default_threshold);
                }
            }
            Err(e) => tracing::warn!("서버 설정 조회 실패: {}", e),
        }
    }

    let hash = content_hash(&HashSource {
        file_name: &submission.file_name,
        bytes: Some(submission.bytes.as_slice()),
        size: submission.bytes.len() as u64,
        ..HashSource::default()
    });

    if hash.is_exact() {
        let query = DuplicateQuery::for_variant(
            hash.as_str(),
            submission.variant,
            submission.rfdetr_threshold,
            submission.yolo_threshold,
        );
        match client.check_duplicate(&query).await {
            Ok(check) => {
                if let Some(id) = check.duplicate_id {
                    return show_duplicate(client, store, id).await;
                }
            }
            // 서버에서 다시 확인하므로 계속 진행
            Err(e) => tracing::warn!("중복 확인 실패: {}", e),
        }
    }

    let response = client
        .predict(
            submission.variant,
            &submission.file_name,
            submission.bytes,
            submission.rfdetr_threshold,
            submission.yolo_threshold,
            submission.comment.as_deref(),
        )
        .await;

    match response {
        Ok(PredictResponse::Created { prediction_id, .. }) => match client.get_prediction(&prediction_id).await {
            Ok(view) => {
                store.dispatch(Action::PredictionCreated(view));
                Some(prediction_id)
            }
            Err(e) => {
                store.dispatch(Action::PredictionFailed(failure_message(&e)));
                None
            }
        },
        Ok(PredictResponse::Duplicate { duplicate_id }) => show_duplicate(client, store, duplicate_id).await,
        Err(e) => {
            if matches!(e, AppError::HttpError(_)) && !client.health().await {
                store.dispatch(Action::ApiStatus(false));
            }
            store.dispatch(Action::PredictionFailed(failure_message(&e)));
            None
        }
    }
}

async fn show_duplicate(client: &ApiClient, store: &mut Store, id: String) -> Option<String> {
    match client.get_prediction(&id).await {
        Ok(view) => {
            store.dispatch(Action::DuplicateFound(view));
            Some(id)
        }
        Err(e) => {
            store.dispatch(Action::Notify(
                NotificationLevel::Warning,
                format!("Duplicate found ({}) but it could not be loaded: {}", id, failure_message(&e)),
            ));
            store.dispatch(Action::PredictionFailed(failure_message(&e)));
            None
        }
    }
}
