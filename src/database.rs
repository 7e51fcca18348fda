// 예측 이력 데이터베이스 (사용자, 예측, 모델 정보)
use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSqlOutput, Value, ValueRef};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row, ToSql};
use serde::Serialize;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use crate::config::ModelConfig;
use crate::duplicate::DuplicateQuery;
use crate::error::{AppError, AppResult};
use crate::history::{HistoryQuery, ModelCounts};
use crate::models::{DetectorKind, ModelVariant};
use crate::utils::fs_utils;

/// 사용자 레코드
#[derive(Debug, Clone, Serialize)]
pub struct User {
    pub id: String,
    pub username: String,
    pub email: Option<String>,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub is_active: bool,
    pub is_superuser: bool,
    pub created_at: DateTime<Utc>,
}

/// 사용자 수정 항목 (None 은 변경 없음)
#[derive(Debug, Clone, Default)]
pub struct UserUpdate {
    pub username: Option<String>,
    pub email: Option<String>,
    pub is_active: Option<bool>,
}

/// 저장할 예측 기록
#[derive(Debug, Clone)]
pub struct NewPrediction {
    pub user_id: Option<String>,
    pub model: ModelVariant,
    pub image_url: Option<String>,
    pub image_base64: Option<String>,
    pub image_hash: Option<String>,
    pub results: serde_json::Value,
    pub confidence: Option<f64>,
    pub rfdetr_confidence: Option<f64>,
    pub yolo_confidence: Option<f64>,
    pub confidence_threshold: Option<f64>,
    pub rfdetr_threshold: Option<f64>,
    pub yolo_threshold: Option<f64>,
    pub comment: Option<String>,
}

/// 예측 기록 (소유자 이름 포함)
#[derive(Debug, Clone)]
pub struct PredictionRecord {
    pub id: String,
    pub user_id: Option<String>,
    pub username: Option<String>,
    pub model: ModelVariant,
    pub image_url: Option<String>,
    pub image_base64: Option<String>,
    pub image_hash: Option<String>,
    pub results: serde_json::Value,
    pub confidence: Option<f64>,
    pub rfdetr_confidence: Option<f64>,
    pub yolo_confidence: Option<f64>,
    pub confidence_threshold: Option<f64>,
    pub rfdetr_threshold: Option<f64>,
    pub yolo_threshold: Option<f64>,
    pub comment: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// 모델 메타데이터
#[derive(Debug, Clone, Serialize)]
pub struct ModelInfoRecord {
    pub id: i64,
    pub model_name: String,
    pub model_path: String,
    pub model_type: String,
    pub version: Option<String>,
    pub description: Option<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ToSql for ModelVariant {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for ModelVariant {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e: AppError| FromSqlError::Other(Box::new(e)))
    }
}

const USER_COLUMNS: &str =
    "u.id, u.username, u.email, u.password_hash, u.is_active, u.is_superuser, u.created_at";

const PREDICTION_COLUMNS: &str = "p.id, p.user_id, u.username, p.model, p.image_url, p.image_base64, \
     p.image_hash, p.results, p.confidence, p.rfdetr_confidence, p.yolo_confidence, \
     p.confidence_threshold, p.rfdetr_threshold, p.yolo_threshold, p.comment, p.created_at";

fn user_from_row(row: &Row) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get(0)?,
        username: row.get(1)?,
        email: row.get(2)?,
        password_hash: row.get(3)?,
        is_active: row.get(4)?,
        is_superuser: row.get(5)?,
        created_at: row.get(6)?,
    })
}

fn prediction_from_row(row: &Row) -> rusqlite::Result<PredictionRecord> {
    Ok(PredictionRecord {
        id: row.get(0)?,
        user_id: row.get(1)?,
        username: row.get(2)?,
        model: row.get(3)?,
        image_url: row.get(4)?,
        image_base64: row.get(5)?,
        image_hash: row.get(6)?,
        results: row.get(7)?,
        confidence: row.get(8)?,
        rfdetr_confidence: row.get(9)?,
        yolo_confidence: row.get(10)?,
        confidence_threshold: row.get(11)?,
        rfdetr_threshold: row.get(12)?,
        yolo_threshold: row.get(13)?,
        comment: row.get(14)?,
        created_at: row.get(15)?,
    })
}

/// LIKE 패턴 이스케이프 (`\` 를 이스케이프 문자로 사용)
fn like_pattern(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len() + 2);
    escaped.push('%');
    for ch in text.to_lowercase().chars() {
        if matches!(ch, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped.push('%');
    escaped
}

/// 예측 이력 데이터베이스 관리자
pub struct HistoryDb {
    conn: Mutex<Connection>,
}

impl HistoryDb {
    /// 파일 데이터베이스 열기 (없으면 생성)
    pub fn open(path: &Path) -> AppResult<Self> {
        fs_utils::ensure_parent_dir(path)?;
        let conn = Connection::open(path).map_err(AppError::DatabaseError)?;
        tracing::info!("데이터베이스 열기: {}", path.display());
        Self::from_connection(conn)
    }

    /// 메모리 데이터베이스 (테스트용)
    pub fn open_in_memory() -> AppResult<Self> {
        let conn = Connection::open_in_memory().map_err(AppError::DatabaseError)?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> AppResult<Self> {
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.initialize_schema()?;
        Ok(db)
    }

    fn conn(&self) -> AppResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| AppError::DatabaseUnavailable("연결 잠금이 오염되었습니다".to_string()))
    }

    /// 스키마 초기화
    fn initialize_schema(&self) -> AppResult<()> {
        let schema = r#"
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS users (
    id TEXT PRIMARY KEY,
    username TEXT NOT NULL UNIQUE,
    password_hash TEXT NOT NULL,
    email TEXT UNIQUE,
    created_at TEXT NOT NULL,
    is_active INTEGER NOT NULL DEFAULT 1,
    is_superuser INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS predictions (
    id TEXT PRIMARY KEY,
    user_id TEXT REFERENCES users(id) ON DELETE CASCADE,
    model TEXT NOT NULL, -- 'rfdetr', 'yolo', 'both'
    image_url TEXT,
    image_base64 TEXT,
    image_hash TEXT,
    results TEXT NOT NULL,
    confidence REAL,
    rfdetr_confidence REAL,
    yolo_confidence REAL,
    confidence_threshold REAL,
    rfdetr_threshold REAL,
    yolo_threshold REAL,
    comment TEXT,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_predictions_image_hash ON predictions(image_hash);
CREATE INDEX IF NOT EXISTS idx_predictions_created_at ON predictions(created_at);
CREATE INDEX IF NOT EXISTS idx_predictions_user ON predictions(user_id);

CREATE TABLE IF NOT EXISTS model_info (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    model_name TEXT NOT NULL UNIQUE,
    model_path TEXT NOT NULL,
    model_type TEXT NOT NULL,
    version TEXT,
    description TEXT,
    is_active INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
        "#;

        self.conn()?
            .execute_batch(schema)
            .map_err(AppError::DatabaseError)?;
        Ok(())
    }

    // ---- 사용자 ----

    /// 사용자 생성 (이름 중복 시 Conflict)
    pub fn create_user(
        &self,
        username: &str,
        password_hash: &str,
        email: Option<&str>,
        is_superuser: bool,
    ) -> AppResult<User> {
        let conn = self.conn()?;
        let tx = conn.unchecked_transaction().map_err(AppError::DatabaseError)?;

        let exists: bool = tx
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM users WHERE username = ?)",
                params![username],
                |row| row.get(0),
            )
            .map_err(AppError::DatabaseError)?;
        if exists {
            return Err(AppError::Conflict("Username already exists".to_string()));
        }

        if let Some(email) = email {
            let taken: bool = tx
                .query_row(
                    "SELECT EXISTS(SELECT 1 FROM users WHERE email = ?)",
                    params![email],
                    |row| row.get(0),
                )
                .map_err(AppError::DatabaseError)?;
            if taken {
                return Err(AppError::Conflict("Email already exists".to_string()));
            }
        }

        let user = User {
            id: uuid::Uuid::new_v4().to_string(),
            username: username.to_string(),
            email: email.map(|e| e.to_string()),
            password_hash: password_hash.to_string(),
            is_active: true,
            is_superuser,
            created_at: Utc::now(),
        };

        tx.execute(
            "INSERT INTO users (id, username, password_hash, email, created_at, is_active, is_superuser)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
            params![
                user.id,
                user.username,
                user.password_hash,
                user.email,
                user.created_at,
                user.is_active,
                user.is_superuser
            ],
        )
        .map_err(AppError::DatabaseError)?;

        tx.commit().map_err(AppError::DatabaseError)?;
        Ok(user)
    }

    pub fn get_user(&self, user_id: &str) -> AppResult<Option<User>> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("SELECT {} FROM users u WHERE u.id = ?", USER_COLUMNS),
            params![user_id],
            user_from_row,
        )
        .optional()
        .map_err(AppError::DatabaseError)
    }

    pub fn get_user_by_username(&self, username: &str) -> AppResult<Option<User>> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("SELECT {} FROM users u WHERE u.username = ?", USER_COLUMNS),
            params![username],
            user_from_row,
        )
        .optional()
        .map_err(AppError::DatabaseError)
    }

    /// 전체 사용자 (가입 순)
    pub fn list_users(&self) -> AppResult<Vec<User>> {
        self.query_users(&format!(
            "SELECT {} FROM users u ORDER BY u.created_at, u.rowid",
            USER_COLUMNS
        ))
    }

    pub fn list_superusers(&self) -> AppResult<Vec<User>> {
        self.query_users(&format!(
            "SELECT {} FROM users u WHERE u.is_superuser = 1 ORDER BY u.created_at, u.rowid",
            USER_COLUMNS
        ))
    }

    fn query_users(&self, sql: &str) -> AppResult<Vec<User>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(sql).map_err(AppError::DatabaseError)?;
        let rows = stmt
            .query_map([], user_from_row)
            .map_err(AppError::DatabaseError)?;

        let mut users = Vec::new();
        for row in rows {
            users.push(row.map_err(AppError::DatabaseError)?);
        }
        Ok(users)
    }

    /// 사용자별 예측 개수
    pub fn users_with_prediction_counts(&self) -> AppResult<Vec<(User, i64)>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {}, (SELECT COUNT(*) FROM predictions p WHERE p.user_id = u.id)
                 FROM users u ORDER BY u.created_at, u.rowid",
                USER_COLUMNS
            ))
            .map_err(AppError::DatabaseError)?;
        let rows = stmt
            .query_map([], |row| Ok((user_from_row(row)?, row.get::<_, i64>(7)?)))
            .map_err(AppError::DatabaseError)?;

        let mut users = Vec::new();
        for row in rows {
            users.push(row.map_err(AppError::DatabaseError)?);
        }
        Ok(users)
    }

    /// 사용자 정보 수정 (이름 변경 시 중복 확인)
    pub fn update_user(&self, user_id: &str, update: &UserUpdate) -> AppResult<Option<User>> {
        {
            let conn = self.conn()?;
            if let Some(username) = &update.username {
                let taken: bool = conn
                    .query_row(
                        "SELECT EXISTS(SELECT 1 FROM users WHERE username = ? AND id != ?)",
                        params![username, user_id],
                        |row| row.get(0),
                    )
                    .map_err(AppError::DatabaseError)?;
                if taken {
                    return Err(AppError::Conflict("Username already taken".to_string()));
                }
            }

            conn.execute(
                "UPDATE users SET
                    username = COALESCE(?, username),
                    email = COALESCE(?, email),
                    is_active = COALESCE(?, is_active)
                 WHERE id = ?",
                params![update.username, update.email, update.is_active, user_id],
            )
            .map_err(AppError::DatabaseError)?;
        }
        self.get_user(user_id)
    }

    pub fn set_superuser(&self, user_id: &str, is_superuser: bool) -> AppResult<Option<User>> {
        let updated = self
            .conn()?
            .execute(
                "UPDATE users SET is_superuser = ? WHERE id = ?",
                params![is_superuser, user_id],
            )
            .map_err(AppError::DatabaseError)?;
        if updated == 0 {
            return Ok(None);
        }
        self.get_user(user_id)
    }

    /// 사용자 삭제 (예측 기록도 함께 삭제)
    pub fn delete_user(&self, user_id: &str) -> AppResult<bool> {
        let deleted = self
            .conn()?
            .execute("DELETE FROM users WHERE id = ?", params![user_id])
            .map_err(AppError::DatabaseError)?;
        Ok(deleted > 0)
    }

    // ---- 예측 ----

    /// 예측 기록 저장
    pub fn create_prediction(&self, new: &NewPrediction) -> AppResult<PredictionRecord> {
        let id = uuid::Uuid::new_v4().to_string();
        self.conn()?
            .execute(
                "INSERT INTO predictions
                 (id, user_id, model, image_url, image_base64, image_hash, results,
                  confidence, rfdetr_confidence, yolo_confidence,
                  confidence_threshold, rfdetr_threshold, yolo_threshold, comment, created_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                params![
                    id,
                    new.user_id,
                    new.model,
                    new.image_url,
                    new.image_base64,
                    new.image_hash,
                    new.results,
                    new.confidence,
                    new.rfdetr_confidence,
                    new.yolo_confidence,
                    new.confidence_threshold,
                    new.rfdetr_threshold,
                    new.yolo_threshold,
                    new.comment,
                    Utc::now()
                ],
            )
            .map_err(AppError::DatabaseError)?;

        self.get_prediction(&id)?
            .ok_or_else(|| AppError::NotFound("Prediction not found".to_string()))
    }

    pub fn get_prediction(&self, prediction_id: &str) -> AppResult<Option<PredictionRecord>> {
        let conn = self.conn()?;
        conn.query_row(
            &format!(
                "SELECT {} FROM predictions p LEFT JOIN users u ON p.user_id = u.id WHERE p.id = ?",
                PREDICTION_COLUMNS
            ),
            params![prediction_id],
            prediction_from_row,
        )
        .optional()
        .map_err(AppError::DatabaseError)
    }

    /// 코멘트 수정 (기록이 없으면 None)
    pub fn update_comment(&self, prediction_id: &str, comment: Option<&str>) -> AppResult<Option<PredictionRecord>> {
        let updated = self
            .conn()?
            .execute(
                "UPDATE predictions SET comment = ? WHERE id = ?",
                params![comment, prediction_id],
            )
            .map_err(AppError::DatabaseError)?;
        if updated == 0 {
            return Ok(None);
        }
        self.get_prediction(prediction_id)
    }

    pub fn delete_prediction(&self, prediction_id: &str) -> AppResult<bool> {
        let deleted = self
            .conn()?
            .execute("DELETE FROM predictions WHERE id = ?", params![prediction_id])
            .map_err(AppError::DatabaseError)?;
        Ok(deleted > 0)
    }

    /// 같은 이미지/모델/임계값 조합의 가장 오래된 기록 ID
    ///
    /// 임계값 비교는 NULL 안전 동등 비교(`IS`)를 사용한다.
    pub fn find_duplicate(&self, query: &DuplicateQuery) -> AppResult<Option<String>> {
        let mut sql = String::from("SELECT id FROM predictions WHERE image_hash = ? AND model = ?");
        let mut values: Vec<Value> = vec![
            Value::Text(query.image_hash.clone()),
            Value::Text(query.model.as_str().to_string()),
        ];

        let threshold_value = |t: Option<f64>| t.map(Value::Real).unwrap_or(Value::Null);
        match query.model {
            ModelVariant::RfDetr => {
                sql.push_str(" AND rfdetr_threshold IS ?");
                values.push(threshold_value(query.rfdetr_threshold));
            }
            ModelVariant::Yolo => {
                sql.push_str(" AND yolo_threshold IS ?");
                values.push(threshold_value(query.yolo_threshold));
            }
            ModelVariant::Both => {
                if let Some(t) = query.rfdetr_threshold {
                    sql.push_str(" AND rfdetr_threshold = ?");
                    values.push(Value::Real(t));
                }
                if let Some(t) = query.yolo_threshold {
                    sql.push_str(" AND yolo_threshold = ?");
                    values.push(Value::Real(t));
                }
            }
        }
        sql.push_str(" ORDER BY created_at ASC, rowid ASC LIMIT 1");

        let conn = self.conn()?;
        conn.query_row(&sql, params_from_iter(values.iter()), |row| row.get(0))
            .optional()
            .map_err(AppError::DatabaseError)
    }

    /// 필터 조건에 맞는 기록 페이지와 전체 개수
    pub fn list_predictions(&self, query: &HistoryQuery) -> AppResult<(Vec<PredictionRecord>, i64)> {
        let mut clauses: Vec<&str> = Vec::new();
        let mut values: Vec<Value> = Vec::new();

        if let Some(user_id) = &query.user_id {
            clauses.push("p.user_id = ?");
            values.push(Value::Text(user_id.clone()));
        }
        if let Some(model) = query.model_filter()? {
            clauses.push("p.model = ?");
            values.push(Value::Text(model.as_str().to_string()));
        }
        if let Some(text) = query.search_text.as_deref().map(str::trim).filter(|t| !t.is_empty()) {
            clauses.push(
                "(LOWER(COALESCE(p.comment, '')) LIKE ? ESCAPE '\\' \
                 OR LOWER(COALESCE(u.username, '')) LIKE ? ESCAPE '\\' \
                 OR LOWER(p.id) LIKE ? ESCAPE '\\')",
            );
            let pattern = like_pattern(text);
            for _ in 0..3 {
                values.push(Value::Text(pattern.clone()));
            }
        }
        if let Some(min) = query.min_confidence {
            clauses.push("p.confidence >= ?");
            values.push(Value::Real(min));
        }
        if let Some(max) = query.max_confidence {
            clauses.push("p.confidence <= ?");
            values.push(Value::Real(max));
        }

        let where_sql = if clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", clauses.join(" AND "))
        };
        let from_sql = format!("FROM predictions p LEFT JOIN users u ON p.user_id = u.id{}", where_sql);

        let conn = self.conn()?;
        let total: i64 = conn
            .query_row(
                &format!("SELECT COUNT(*) {}", from_sql),
                params_from_iter(values.iter()),
                |row| row.get(0),
            )
            .map_err(AppError::DatabaseError)?;

        let mut page_values = values;
        page_values.push(Value::Integer(query.limit as i64));
        page_values.push(Value::Integer(query.skip as i64));

        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} {} ORDER BY p.created_at DESC, p.rowid DESC LIMIT ? OFFSET ?",
                PREDICTION_COLUMNS, from_sql
            ))
            .map_err(AppError::DatabaseError)?;
        let rows = stmt
            .query_map(params_from_iter(page_values.iter()), prediction_from_row)
            .map_err(AppError::DatabaseError)?;

        let mut predictions = Vec::new();
        for row in rows {
            predictions.push(row.map_err(AppError::DatabaseError)?);
        }
        Ok((predictions, total))
    }

    /// 전체 기록 (최신순)
    pub fn all_predictions(&self) -> AppResult<Vec<PredictionRecord>> {
        let (predictions, _) = self.list_predictions(&HistoryQuery {
            limit: u32::MAX,
            ..HistoryQuery::default()
        })?;
        Ok(predictions)
    }

    /// 모델별 기록 수
    pub fn count_by_model(&self) -> AppResult<ModelCounts> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT model, COUNT(*) FROM predictions GROUP BY model")
            .map_err(AppError::DatabaseError)?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, ModelVariant>(0)?, row.get::<_, i64>(1)?)))
            .map_err(AppError::DatabaseError)?;

        let mut counts = ModelCounts::default();
        for row in rows {
            let (model, count) = row.map_err(AppError::DatabaseError)?;
            match model {
                ModelVariant::RfDetr => counts.rfdetr = count,
                ModelVariant::Yolo => counts.yolo = count,
                ModelVariant::Both => counts.both = count,
            }
        }
        Ok(counts)
    }

    // ---- 모델 정보 ----

    /// 설정의 모델 정보를 등록 (이미 있으면 무시)
    pub fn seed_model_info(&self, config: &ModelConfig) -> AppResult<()> {
        for kind in DetectorKind::ALL {
            let detector = kind.config(config);
            self.create_model_info(
                kind.as_str(),
                &config.model_path(detector).to_string_lossy(),
                kind.as_str(),
                Some(&detector.version),
                Some(&detector.description),
            )?;
        }
        Ok(())
    }

    pub fn create_model_info(
        &self,
        model_name: &str,
        model_path: &str,
        model_type: &str,
        version: Option<&str>,
        description: Option<&str>,
    ) -> AppResult<()> {
        let now = Utc::now();
        self.conn()?
            .execute(
                "INSERT OR IGNORE INTO model_info
                 (model_name, model_path, model_type, version, description, is_active, created_at, updated_at)
                 VALUES (?, ?, ?, ?, ?, 1, ?, ?)",
                params![model_name, model_path, model_type, version, description, now, now],
            )
            .map_err(AppError::DatabaseError)?;
        Ok(())
    }

    pub fn list_active_models(&self) -> AppResult<Vec<ModelInfoRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, model_name, model_path, model_type, version, description, is_active, created_at, updated_at
                 FROM model_info WHERE is_active = 1 ORDER BY id",
            )
            .map_err(AppError::DatabaseError)?;
        let rows = stmt
            .query_map([], model_info_from_row)
            .map_err(AppError::DatabaseError)?;

        let mut models = Vec::new();
        for row in rows {
            models.push(row.map_err(AppError::DatabaseError)?);
        }
        Ok(models)
    }

    pub fn get_model_by_name(&self, model_name: &str) -> AppResult<Option<ModelInfoRecord>> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT id, model_name, model_path, model_type, version, description, is_active, created_at, updated_at
             FROM model_info WHERE model_name = ?",
            params![model_name],
            model_info_from_row,
        )
        .optional()
        .map_err(AppError::DatabaseError)
    }
}

fn model_info_from_row(row: &Row) -> rusqlite::Result<ModelInfoRecord> {
    Ok(ModelInfoRecord {
        id: row.get(0)?,
        model_name: row.get(1)?,
        model_path: row.get(2)?,
        model_type: row.get(3)?,
        version: row.get(4)?,
        description: row.get(5)?,
        is_active: row.get(6)?,
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn prediction(model: ModelVariant, hash: &str, confidence: Option<f64>) -> NewPrediction {
        NewPrediction {
            user_id: None,
            model,
            image_url: None,
            image_base64: None,
            image_hash: Some(hash.to_string()),
            results: json!({ "detections": [], "confidence": confidence.unwrap_or(0.0), "model": model.as_str() }),
            confidence,
            rfdetr_confidence: None,
            yolo_confidence: None,
            confidence_threshold: Some(0.4),
            rfdetr_threshold: (model == ModelVariant::RfDetr).then_some(0.4),
            yolo_threshold: (model == ModelVariant::Yolo).then_some(0.4),
            comment: None,
        }
    }

    #[test]
    fn poisoned_connection_is_reported_as_database_error() {
        let db = HistoryDb::open_in_memory().unwrap();
        std::thread::scope(|scope| {
            let _ = scope
                .spawn(|| {
                    let _guard = db.conn.lock().unwrap();
                    panic!("연결 사용 중 실패");
                })
                .join();
        });
        assert!(matches!(db.list_users(), Err(AppError::DatabaseUnavailable(_))));
    }

    #[test]
    fn duplicate_username_is_rejected_without_insert() {
        let db = HistoryDb::open_in_memory().unwrap();
        db.create_user("alice", "hash", None, false).unwrap();
        let err = db.create_user("alice", "other", Some("a@x.io"), false).unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
        assert_eq!(db.list_users().unwrap().len(), 1);
    }

    #[test]
    fn deleting_user_cascades_predictions() {
        let db = HistoryDb::open_in_memory().unwrap();
        let user = db.create_user("bob", "hash", None, false).unwrap();
        let mut new = prediction(ModelVariant::Yolo, "h1", Some(0.8));
        new.user_id = Some(user.id.clone());
        let record = db.create_prediction(&new).unwrap();
        assert_eq!(record.username.as_deref(), Some("bob"));

        assert!(db.delete_user(&user.id).unwrap());
        assert!(db.get_prediction(&record.id).unwrap().is_none());
    }

    #[test]
    fn update_user_checks_username_collision() {
        let db = HistoryDb::open_in_memory().unwrap();
        db.create_user("carol", "hash", None, false).unwrap();
        let dave = db.create_user("dave", "hash", None, false).unwrap();

        let err = db
            .update_user(
                &dave.id,
                &UserUpdate {
                    username: Some("carol".to_string()),
                    ..UserUpdate::default()
                },
            )
            .unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));

        let updated = db
            .update_user(
                &dave.id,
                &UserUpdate {
                    is_active: Some(false),
                    email: Some("d@x.io".to_string()),
                    ..UserUpdate::default()
                },
            )
            .unwrap()
            .unwrap();
        assert!(!updated.is_active);
        assert_eq!(updated.username, "dave");
        assert_eq!(updated.email.as_deref(), Some("d@x.io"));
    }

    #[test]
    fn comment_update_and_delete() {
        let db = HistoryDb::open_in_memory().unwrap();
        let record = db
            .create_prediction(&prediction(ModelVariant::RfDetr, "h", Some(0.5)))
            .unwrap();

        let updated = db.update_comment(&record.id, Some("shelf 3")).unwrap().unwrap();
        assert_eq!(updated.comment.as_deref(), Some("shelf 3"));
        assert!(db.update_comment("missing", Some("x")).unwrap().is_none());

        assert!(db.delete_prediction(&record.id).unwrap());
        assert!(!db.delete_prediction(&record.id).unwrap());
    }

    #[test]
    fn results_json_survives_storage() {
        let db = HistoryDb::open_in_memory().unwrap();
        let mut new = prediction(ModelVariant::Yolo, "h", Some(0.9));
        new.results = json!({
            "detections": [{ "xyxy": [1.0, 2.0, 3.0, 4.0], "confidence": 0.9, "class_id": 0, "class_name": "item" }],
            "confidence": 0.9,
            "model": "yolo"
        });
        let record = db.create_prediction(&new).unwrap();
        assert_eq!(record.results["detections"][0]["class_name"], "item");
        assert_eq!(record.model, ModelVariant::Yolo);
    }

    #[test]
    fn model_counts_and_seed() {
        let db = HistoryDb::open_in_memory().unwrap();
        db.create_prediction(&prediction(ModelVariant::Yolo, "a", Some(0.5))).unwrap();
        db.create_prediction(&prediction(ModelVariant::Yolo, "b", Some(0.5))).unwrap();
        db.create_prediction(&prediction(ModelVariant::Both, "c", None)).unwrap();

        let counts = db.count_by_model().unwrap();
        assert_eq!((counts.rfdetr, counts.yolo, counts.both), (0, 2, 1));

        let config = ModelConfig::default();
        db.seed_model_info(&config).unwrap();
        db.seed_model_info(&config).unwrap();
        assert_eq!(db.list_active_models().unwrap().len(), 2);
        assert!(db.get_model_by_name("yolo").unwrap().is_some());
    }

    #[test]
    fn like_pattern_escapes_wildcards() {
        assert_eq!(like_pattern("50%_Off"), "%50\\%\\_off%");
    }
}
