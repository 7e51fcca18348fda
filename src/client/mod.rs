//! REST API 클라이언트와 클라이언트 상태 관리

pub mod store;
pub mod workflow;

use reqwest::multipart::{Form, Part};
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;

use crate::auth::{AuthResponse, Credentials};
use crate::duplicate::{DuplicateCheck, DuplicateQuery};
use crate::error::{AppError, AppResult};
use crate::history::{HistoryPage, HistoryQuery, PredictionView, Statistics};
use crate::models::ModelVariant;
use crate::render::DisplayMode;
use crate::utils::image_utils;

/// 요청 타임아웃 (재시도 없음)
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// 예측 API 응답
#[derive(Debug, Clone, PartialEq)]
pub enum PredictResponse {
    Created {
        prediction_id: String,
        results: Value,
        image_base64: Option<String>,
    },
    Duplicate {
        duplicate_id: String,
    },
}

/// `/config` 응답에서 쓰는 값
#[derive(Debug, Clone, PartialEq)]
pub struct ServerSettings {
    pub max_file_size_bytes: u64,
    pub allowed_extensions: Vec<String>,
    pub rfdetr_default_threshold: f64,
    pub yolo_default_threshold: f64,
}

#[derive(Deserialize)]
struct ErrorBody {
    detail: String,
}

/// 백엔드 REST 클라이언트
#[derive(Debug, Clone)]
pub struct ApiClient {
    http: Client,
    base_url: String,
    token: Option<String>,
}

impl ApiClient {
    pub fn new(base_url: &str) -> AppResult<Self> {
        let http = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: None,
        })
    }

    /// 베어러 토큰(사용자 ID) 설정
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn set_token(&mut self, token: Option<String>) {
        self.token = token;
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    /// 2xx 가 아니면 `detail` 을 담은 ApiError
    async fn check(response: Response) -> AppResult<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let text = response.text().await.unwrap_or_default();
        let detail = serde_json::from_str::<ErrorBody>(&text)
            .map(|body| body.detail)
            .unwrap_or(text);
        Err(AppError::ApiError {
            status: status.as_u16(),
            detail,
        })
    }

    async fn send_json<T: DeserializeOwned>(&self, request: RequestBuilder) -> AppResult<T> {
        let response = Self::check(self.authorized(request).send().await?).await?;
        Ok(response.json().await?)
    }

    /// 가벼운 상태 확인 (연결 실패도 false)
    pub async fn health(&self) -> bool {
        match self.http.get(self.url("/health")).send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                tracing::debug!("API 상태 확인 실패: {}", e);
                false
            }
        }
    }

    pub async fn register(&self, credentials: &Credentials) -> AppResult<AuthResponse> {
        self.send_json(self.http.post(self.url("/v1/api/auth/register")).json(credentials))
            .await
    }

    pub async fn login(&self, username: &str, password: &str) -> AppResult<AuthResponse> {
        let body = serde_json::json!({ "username": username, "password": password });
        self.send_json(self.http.post(self.url("/v1/api/auth/login")).json(&body))
            .await
    }

    pub async fn settings(&self) -> AppResult<ServerSettings> {
        let value: Value = self.send_json(self.http.get(self.url("/v1/api/ml/config"))).await?;
        let threshold = |model: &str| {
            value["models"][model]["default_confidence_threshold"]
                .as_f64()
                .ok_or_else(|| AppError::ApiError {
                    status: 200,
                    detail: format!("missing default threshold for {}", model),
                })
        };
        Ok(ServerSettings {
            max_file_size_bytes: value["upload"]["max_file_size_bytes"].as_u64().unwrap_or(0),
            allowed_extensions: value["upload"]["allowed_extensions"]
                .as_array()
                .map(|items| {
                    items
                        .iter()
                        .filter_map(|v| v.as_str().map(str::to_string))
                        .collect()
                })
                .unwrap_or_default(),
            rfdetr_default_threshold: threshold("rfdetr")?,
            yolo_default_threshold: threshold("yolo")?,
        })
    }

    pub async fn check_duplicate(&self, query: &DuplicateQuery) -> AppResult<DuplicateCheck> {
        self.send_json(
            self.http
                .get(self.url("/v1/api/history/check-duplicate"))
                .query(query),
        )
        .await
    }

    /// 이미지 업로드 후 예측 (`rfdetr`/`yolo` 는 해당 임계값만 전송)
    pub async fn predict(
        &self,
        variant: ModelVariant,
        file_name: &str,
        bytes: Vec<u8>,
        rfdetr_threshold: Option<f64>,
        yolo_threshold: Option<f64>,
        comment: Option<&str>,
    ) -> AppResult<PredictResponse> {
        let part = Part::bytes(bytes)
            .file_name(file_name.to_string())
            .mime_str(image_utils::mime_for_file_name(file_name))?;
        let mut form = Form::new().part("image", part);

        let thresholds: Vec<(&'static str, Option<f64>)> = match variant {
            ModelVariant::RfDetr => vec![("confidence_threshold", rfdetr_threshold)],
            ModelVariant::Yolo => vec![("confidence_threshold", yolo_threshold)],
            ModelVariant::Both => vec![
                ("rfdetr_confidence_threshold", rfdetr_threshold),
                ("yolo_confidence_threshold", yolo_threshold),
            ],
        };
        for (name, value) in thresholds {
            if let Some(value) = value {
                form = form.text(name, value.to_string());
            }
        }
        if let Some(comment) = comment {
            form = form.text("comment", comment.to_string());
        }

        let url = self.url(&format!("/v1/api/ml/predict/{}", variant));
        let value: Value = self.send_json(self.http.post(url).multipart(form)).await?;
        parse_predict_response(value)
    }

    pub async fn history(&self, query: &HistoryQuery) -> AppResult<HistoryPage> {
        self.send_json(self.http.get(self.url("/v1/api/history/predictions")).query(query))
            .await
    }

    pub async fn get_prediction(&self, id: &str) -> AppResult<PredictionView> {
        self.send_json(self.http.get(self.url(&format!("/v1/api/history/predictions/{}", id))))
            .await
    }

    pub async fn update_comment(&self, id: &str, comment: &str) -> AppResult<PredictionView> {
        self.send_json(
            self.http
                .put(self.url(&format!("/v1/api/history/predictions/{}/comment", id)))
                .form(&[("comment", comment)]),
        )
        .await
    }

    pub async fn delete_prediction(&self, id: &str) -> AppResult<()> {
        let _: Value = self
            .send_json(self.http.delete(self.url(&format!("/v1/api/history/predictions/{}", id))))
            .await?;
        Ok(())
    }

    pub async fn statistics(&self) -> AppResult<Statistics> {
        self.send_json(self.http.get(self.url("/v1/api/history/statistics")))
            .await
    }

    /// 렌더링된 PNG 바이트
    pub async fn render(&self, id: &str, mode: DisplayMode) -> AppResult<Vec<u8>> {
        let mode = match mode {
            DisplayMode::Boxes => "boxes",
            DisplayMode::Polygons => "polygons",
        };
        let request = self
            .http
            .get(self.url(&format!("/v1/api/history/predictions/{}/render", id)))
            .query(&[("mode", mode)]);
        let response = Self::check(self.authorized(request).send().await?).await?;
        Ok(response.bytes().await?.to_vec())
    }

    pub async fn export_history(&self) -> AppResult<Value> {
        self.send_json(self.http.get(self.url("/export/history"))).await
    }
}

/// 예측 응답 해석 (중복이면 200 + `is_duplicate`)
pub fn parse_predict_response(value: Value) -> AppResult<PredictResponse> {
    if value["is_duplicate"].as_bool() == Some(true) {
        let duplicate_id = value["duplicate_id"]
            .as_str()
            .ok_or_else(|| AppError::ApiError {
                status: 200,
                detail: "duplicate response without duplicate_id".to_string(),
            })?
            .to_string();
        return Ok(PredictResponse::Duplicate { duplicate_id });
    }

    let prediction_id = value["prediction_id"]
        .as_str()
        .ok_or_else(|| AppError::ApiError {
            status: 200,
            detail: "prediction response without prediction_id".to_string(),
        })?
        .to_string();
    let image_base64 = value["image_base64"].as_str().map(str::to_string);
    let mut results = value;
    if let Some(object) = results.as_object_mut() {
        object.remove("prediction_id");
        object.remove("image_base64");
    }
    Ok(PredictResponse::Created {
        prediction_id,
        results,
        image_base64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn duplicate_response_is_a_normal_branch() {
        let response = parse_predict_response(json!({
            "error": "Duplicate prediction found",
            "is_duplicate": true,
            "duplicate_id": "abc"
        }))
        .unwrap();
        assert_eq!(
            response,
            PredictResponse::Duplicate {
                duplicate_id: "abc".to_string()
            }
        );
    }

    #[test]
    fn created_response_splits_results() {
        let response = parse_predict_response(json!({
            "model": "yolo",
            "confidence": 0.5,
            "detections": [],
            "prediction_id": "p1",
            "image_base64": "data:image/png;base64,AA=="
        }))
        .unwrap();
        match response {
            PredictResponse::Created {
                prediction_id,
                results,
                image_base64,
            } => {
                assert_eq!(prediction_id, "p1");
                assert_eq!(results, json!({"model": "yolo", "confidence": 0.5, "detections": []}));
                assert!(image_base64.is_some());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn missing_id_is_an_error() {
        assert!(parse_predict_response(json!({"detections": []})).is_err());
    }

    #[test]
    fn base_url_trailing_slash_is_trimmed() {
        let client = ApiClient::new("http://localhost:8000/").unwrap();
        assert_eq!(client.url("/health"), "http://localhost:8000/health");
    }
}
