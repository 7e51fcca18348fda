// 사용자 인증 (비밀번호 해시, 로그인, 요청 추출기)
use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use axum::extract::FromRequestParts;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use axum::http::HeaderMap;
use serde::{Deserialize, Serialize};

use crate::api::AppState;
use crate::database::{HistoryDb, PredictionRecord, User};
use crate::error::{validation, AppError, AppResult};

/// 회원가입 / 로그인 요청
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub email: Option<String>,
}

/// 회원가입 / 로그인 응답
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthResponse {
    pub user_id: String,
    pub username: String,
    pub email: Option<String>,
    pub message: String,
}

impl AuthResponse {
    pub fn new(user: &User, message: &str) -> Self {
        Self {
            user_id: user.id.clone(),
            username: user.username.clone(),
            email: user.email.clone(),
            message: message.to_string(),
        }
    }
}

/// Argon2id 해시 생성 (PHC 문자열)
pub fn hash_password(password: &str) -> AppResult<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| AppError::PasswordHash(e.to_string()))
}

/// 저장된 해시와 비교 (해시 형식이 잘못되어도 false)
pub fn verify_password(password: &str, password_hash: &str) -> bool {
    match PasswordHash::new(password_hash) {
        Ok(parsed) => Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok(),
        Err(e) => {
            tracing::warn!("저장된 비밀번호 해시를 해석할 수 없습니다: {}", e);
            false
        }
    }
}

/// 회원가입 (이름 중복 시 사용자 테이블 변경 없음)
pub fn register(db: &HistoryDb, credentials: &Credentials, is_superuser: bool) -> AppResult<User> {
    validation::validate_credentials(&credentials.username, &credentials.password)?;
    let username = credentials.username.trim();
    if db.get_user_by_username(username)?.is_some() {
        return Err(AppError::Conflict("Username already exists".to_string()));
    }

    let password_hash = hash_password(&credentials.password)?;
    let email = credentials
        .email
        .as_deref()
        .map(str::trim)
        .filter(|e| !e.is_empty());
    let user = db.create_user(username, &password_hash, email, is_superuser)?;
    tracing::info!("사용자 등록: {} ({})", user.username, user.id);
    Ok(user)
}

/// 로그인: 비밀번호 확인 후 활성 사용자 반환
pub fn login(db: &HistoryDb, username: &str, password: &str) -> AppResult<User> {
    let invalid = || AppError::Unauthorized("Invalid username or password".to_string());
    let user = db.get_user_by_username(username.trim())?.ok_or_else(invalid)?;
    if !verify_password(password, &user.password_hash) {
        return Err(invalid());
    }
    if !user.is_active {
        return Err(AppError::Unauthorized("User account is disabled".to_string()));
    }
    Ok(user)
}

/// `Authorization: Bearer <token>` 헤더의 토큰
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}

/// 토큰(사용자 ID)으로 활성 사용자 확인
pub fn authenticate_token(db: &HistoryDb, token: &str) -> AppResult<User> {
    let user = db
        .get_user(token)?
        .ok_or_else(|| AppError::Unauthorized("Invalid user".to_string()))?;
    if !user.is_active {
        return Err(AppError::Unauthorized("User account is disabled".to_string()));
    }
    Ok(user)
}

/// 예측 삭제 권한: 소유자, 소유자 없는 기록, 또는 관리자
pub fn can_delete_prediction(user: &User, record: &PredictionRecord) -> bool {
    user.is_superuser
        || match &record.user_id {
            Some(owner) => owner == &user.id,
            None => true,
        }
}

/// 인증된 사용자 (없으면 401)
#[derive(Debug, Clone)]
pub struct CurrentUser(pub User);

/// 관리자 전용 경로용 (아니면 403)
#[derive(Debug, Clone)]
pub struct Superuser(pub User);

#[axum::async_trait]
impl FromRequestParts<AppState> for CurrentUser {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let token = bearer_token(&parts.headers)
            .ok_or_else(|| AppError::Unauthorized("Authentication required".to_string()))?;
        authenticate_token(&state.db, token).map(CurrentUser)
    }
}

#[axum::async_trait]
impl FromRequestParts<AppState> for Superuser {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let CurrentUser(user) = CurrentUser::from_request_parts(parts, state).await?;
        if !user.is_superuser {
            return Err(AppError::Forbidden("Superuser access required".to_string()));
        }
        Ok(Superuser(user))
    }
}
