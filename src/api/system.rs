// 루트 / 헬스 체크
use axum::Json;
use serde::Serialize;

pub const SERVICE_NAME: &str = "CV Shelves ML API";

#[derive(Serialize)]
pub struct RootResponse {
    message: &'static str,
    version: &'static str,
}

#[derive(Serialize)]
pub struct HealthResponse {
    status: &'static str,
    service: &'static str,
}

pub async fn root() -> Json<RootResponse> {
    Json(RootResponse {
        message: SERVICE_NAME,
        version: env!("CARGO_PKG_VERSION"),
    })
}

pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        service: SERVICE_NAME,
    })
}
