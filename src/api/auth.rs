// `/v1/api/auth` 회원가입, 로그인, 사용자 관리
use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Form, Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::AppState;
use crate::auth::{self, AuthResponse, Credentials, CurrentUser, Superuser};
use crate::database::{User, UserUpdate};
use crate::error::{AppError, AppResult};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/register", post(register))
        .route("/login", post(login))
        .route("/users", get(list_users))
        .route("/users/:id", get(get_user).put(update_user).delete(delete_user))
        .route("/me/superuser", get(superuser_status))
        .route("/superusers", get(list_superusers))
        .route("/users/:id/make-superuser", post(make_superuser))
        .route("/users/:id/remove-superuser", post(remove_superuser))
}

/// API 응답용 사용자 정보
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserView {
    pub id: String,
    pub username: String,
    pub email: Option<String>,
    pub created_at: DateTime<Utc>,
    pub is_active: bool,
    pub is_superuser: bool,
}

impl From<&User> for UserView {
    fn from(user: &User) -> Self {
        Self {
            id: user.id.clone(),
            username: user.username.clone(),
            email: user.email.clone(),
            created_at: user.created_at,
            is_active: user.is_active,
            is_superuser: user.is_superuser,
        }
    }
}

fn user_not_found() -> AppError {
    AppError::NotFound("User not found".to_string())
}

async fn register(State(state): State<AppState>, Json(credentials): Json<Credentials>) -> AppResult<Json<AuthResponse>> {
    let user = auth::register(&state.db, &credentials, false)?;
    Ok(Json(AuthResponse::new(&user, "User registered successfully")))
}

#[derive(Debug, Deserialize)]
struct LoginRequest {
    username: String,
    password: String,
}

async fn login(State(state): State<AppState>, Json(request): Json<LoginRequest>) -> AppResult<Json<AuthResponse>> {
    let user = auth::login(&state.db, &request.username, &request.password)?;
    tracing::info!("로그인: {}", user.username);
    Ok(Json(AuthResponse::new(&user, "Login successful")))
}

async fn list_users(State(state): State<AppState>, _user: CurrentUser) -> AppResult<Json<Value>> {
    let users: Vec<UserView> = state.db.list_users()?.iter().map(UserView::from).collect();
    let message = users.is_empty().then_some("No users found");
    Ok(Json(json!({ "users": users, "message": message })))
}

async fn get_user(
    State(state): State<AppState>,
    _user: CurrentUser,
    Path(id): Path<String>,
) -> AppResult<Json<UserView>> {
    let user = state.db.get_user(&id)?.ok_or_else(user_not_found)?;
    Ok(Json(UserView::from(&user)))
}

#[derive(Debug, Default, Deserialize)]
struct UpdateUserForm {
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    is_active: Option<bool>,
}

/// 본인 또는 관리자만 수정 가능
async fn update_user(
    State(state): State<AppState>,
    CurrentUser(current): CurrentUser,
    Path(id): Path<String>,
    Form(form): Form<UpdateUserForm>,
) -> AppResult<Json<Value>> {
    if current.id != id && !current.is_superuser {
        return Err(AppError::Forbidden("Not allowed to modify this user".to_string()));
    }
    state.db.get_user(&id)?.ok_or_else(user_not_found)?;

    let update = UserUpdate {
        username: form.username.map(|u| u.trim().to_string()).filter(|u| !u.is_empty()),
        email: form.email.map(|e| e.trim().to_string()),
        is_active: form.is_active,
    };
    let user = state.db.update_user(&id, &update)?.ok_or_else(user_not_found)?;

    let mut body = serde_json::to_value(UserView::from(&user))?;
    body["message"] = json!("User updated successfully");
    Ok(Json(body))
}

async fn delete_user(
    State(state): State<AppState>,
    Superuser(current): Superuser,
    Path(id): Path<String>,
) -> AppResult<Json<Value>> {
    let user = state.db.get_user(&id)?.ok_or_else(user_not_found)?;
    if user.id == current.id {
        return Err(AppError::ValidationError("Cannot delete your own account".to_string()));
    }
    state.db.delete_user(&id)?;
    tracing::info!("사용자 삭제: {} (요청자 {})", user.username, current.username);
    Ok(Json(json!({
        "message": format!("User {} deleted successfully", user.username),
        "deleted_user_id": id,
    })))
}

async fn superuser_status(CurrentUser(user): CurrentUser) -> Json<Value> {
    Json(json!({
        "is_superuser": user.is_superuser,
        "user_id": user.id,
        "username": user.username,
    }))
}

async fn list_superusers(State(state): State<AppState>, _admin: Superuser) -> AppResult<Json<Value>> {
    let superusers: Vec<UserView> = state.db.list_superusers()?.iter().map(UserView::from).collect();
    Ok(Json(json!({ "total": superusers.len(), "superusers": superusers })))
}

async fn make_superuser(
    State(state): State<AppState>,
    Superuser(admin): Superuser,
    Path(id): Path<String>,
) -> AppResult<Json<Value>> {
    let user = state.db.set_superuser(&id, true)?.ok_or_else(user_not_found)?;
    tracing::info!("관리자 권한 부여: {} (요청자 {})", user.username, admin.username);
    Ok(Json(json!({
        "message": "User successfully granted superuser privileges",
        "user": UserView::from(&user),
    })))
}

async fn remove_superuser(
    State(state): State<AppState>,
    Superuser(admin): Superuser,
    Path(id): Path<String>,
) -> AppResult<Json<Value>> {
    if admin.id == id {
        return Err(AppError::ValidationError(
            "Cannot remove superuser privileges from yourself".to_string(),
        ));
    }
    let user = state.db.set_superuser(&id, false)?.ok_or_else(user_not_found)?;
    tracing::info!("관리자 권한 해제: {} (요청자 {})", user.username, admin.username);
    Ok(Json(json!({
        "message": "Superuser privileges successfully removed from user",
        "user": UserView::from(&user),
    })))
}
