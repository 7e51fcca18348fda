// `/v1/api/history` 이력 엔드포인트와 전체 내보내기
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Form, Json, Router};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};

use super::auth::UserView;
use super::AppState;
use crate::auth::{can_delete_prediction, hash_password, CurrentUser};
use crate::duplicate::{check_duplicate, DuplicateCheck, DuplicateQuery};
use crate::error::{AppError, AppResult};
use crate::history::{self, HistoryPage, HistoryQuery, PredictionView, Statistics};
use crate::render::{self, DisplayMode};
use crate::utils::image_utils;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/check-duplicate", get(check_duplicate_handler))
        .route("/predictions", get(list_predictions))
        .route("/predictions/:id", get(get_prediction).delete(delete_prediction))
        .route("/predictions/:id/comment", axum::routing::put(update_comment))
        .route("/predictions/:id/render", get(render_prediction))
        .route("/statistics", get(statistics))
        .route("/users", get(list_users).post(create_user))
}

fn not_found() -> AppError {
    AppError::NotFound("Prediction not found".to_string())
}

async fn check_duplicate_handler(
    State(state): State<AppState>,
    _user: CurrentUser,
    Query(query): Query<DuplicateQuery>,
) -> AppResult<Json<DuplicateCheck>> {
    Ok(Json(check_duplicate(&state.db, &query)?))
}

async fn list_predictions(
    State(state): State<AppState>,
    _user: CurrentUser,
    Query(query): Query<HistoryQuery>,
) -> AppResult<Json<HistoryPage>> {
    Ok(Json(history::query_history(&state.db, &query)?))
}

async fn get_prediction(
    State(state): State<AppState>,
    _user: CurrentUser,
    Path(id): Path<String>,
) -> AppResult<Json<PredictionView>> {
    let record = state.db.get_prediction(&id)?.ok_or_else(not_found)?;
    Ok(Json(record.into()))
}

#[derive(Debug, Deserialize)]
struct CommentForm {
    comment: String,
}

async fn update_comment(
    State(state): State<AppState>,
    _user: CurrentUser,
    Path(id): Path<String>,
    Form(form): Form<CommentForm>,
) -> AppResult<Json<PredictionView>> {
    let comment = form.comment.trim();
    let comment = (!comment.is_empty()).then_some(comment);
    let record = state.db.update_comment(&id, comment)?.ok_or_else(not_found)?;
    Ok(Json(record.into()))
}

async fn delete_prediction(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<String>,
) -> AppResult<Json<Value>> {
    let record = state.db.get_prediction(&id)?.ok_or_else(not_found)?;
    if !can_delete_prediction(&user, &record) {
        return Err(AppError::Forbidden(
            "Not allowed to delete this prediction".to_string(),
        ));
    }
    if !state.db.delete_prediction(&id)? {
        return Err(not_found());
    }
    tracing::info!("예측 삭제: {} ({})", id, user.username);
    Ok(Json(json!({ "message": "Prediction deleted successfully" })))
}

#[derive(Debug, Default, Deserialize)]
struct RenderParams {
    #[serde(default)]
    mode: Option<String>,
}

async fn render_prediction(
    State(state): State<AppState>,
    _user: CurrentUser,
    Path(id): Path<String>,
    Query(params): Query<RenderParams>,
) -> AppResult<Response> {
    let mode: DisplayMode = match params.mode.as_deref() {
        Some(mode) => mode.parse()?,
        None => DisplayMode::default(),
    };
    let record = state.db.get_prediction(&id)?.ok_or_else(not_found)?;
    let data_url = record
        .image_base64
        .ok_or_else(|| AppError::NotFound("Prediction has no stored image".to_string()))?;
    let image_bytes = image_utils::decode_data_url(&data_url)?;

    let results = record.results;
    let png = tokio::task::spawn_blocking(move || {
        render::render_png(
            &image_bytes,
            &results,
            &state.config.render,
            mode,
            state.font.as_deref(),
        )
    })
    .await
    .map_err(|e| AppError::RenderError(format!("렌더링 작업 실패: {}", e)))??;

    Ok(([(header::CONTENT_TYPE, "image/png")], png).into_response())
}

async fn statistics(State(state): State<AppState>, _user: CurrentUser) -> AppResult<Json<Statistics>> {
    Ok(Json(history::statistics(&state.db)?))
}

async fn list_users(State(state): State<AppState>, _user: CurrentUser) -> AppResult<Json<Value>> {
    let users: Vec<UserView> = state.db.list_users()?.iter().map(UserView::from).collect();
    let message = users.is_empty().then_some("No users found");
    Ok(Json(json!({ "users": users, "message": message })))
}

#[derive(Debug, Deserialize)]
struct CreateUserForm {
    username: String,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    password: Option<String>,
}

/// 관리 목적 사용자 생성 (비밀번호가 없으면 임의 값으로 잠금)
async fn create_user(
    State(state): State<AppState>,
    _user: CurrentUser,
    Form(form): Form<CreateUserForm>,
) -> AppResult<(StatusCode, Json<UserView>)> {
    let username = form.username.trim();
    if username.is_empty() {
        return Err(AppError::ValidationError("Username must not be empty".to_string()));
    }
    if state.db.get_user_by_username(username)?.is_some() {
        return Err(AppError::Conflict("User already exists".to_string()));
    }
    let password = form
        .password
        .filter(|p| !p.is_empty())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let email = form.email.as_deref().map(str::trim).filter(|e| !e.is_empty());
    let user = state
        .db
        .create_user(username, &hash_password(&password)?, email, false)?;
    Ok((StatusCode::CREATED, Json(UserView::from(&user))))
}

/// 전체 이력 JSON 다운로드
pub async fn export_history(State(state): State<AppState>, CurrentUser(user): CurrentUser) -> AppResult<Response> {
    let document = history::export_document(&state.db, &user.username)?;
    let body = serde_json::to_vec_pretty(&document)?;
    let disposition = format!(
        "attachment; filename=\"history_export_{}.json\"",
        Utc::now().format("%Y%m%d_%H%M%S")
    );
    Ok((
        [
            (header::CONTENT_TYPE, "application/json".to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        body,
    )
        .into_response())
}
