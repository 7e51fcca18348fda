// 클라이언트 상태 저장소 (타입 있는 액션 + 순수 리듀서)
use serde_json::Value;

use crate::history::PredictionView;

/// 로그인 세션 (토큰 = 사용자 ID)
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub user_id: String,
    pub username: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationLevel {
    Info,
    Success,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub id: u64,
    pub level: NotificationLevel,
    pub message: String,
}

/// 현재 화면에 표시 중인 결과
#[derive(Debug, Clone, PartialEq)]
pub struct DisplayedResult {
    pub prediction_id: String,
    pub results: Value,
    pub image_base64: Option<String>,
    /// 기존 기록을 다시 보여주는 경우
    pub is_duplicate: bool,
}

impl DisplayedResult {
    fn from_view(view: &PredictionView, is_duplicate: bool) -> Self {
        Self {
            prediction_id: view.id.clone(),
            results: view.results.clone(),
            image_base64: view.image_base64.clone(),
            is_duplicate,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClientState {
    pub session: Option<Session>,
    /// 최신순 이력
    pub predictions: Vec<PredictionView>,
    pub current: Option<DisplayedResult>,
    pub notifications: Vec<Notification>,
    pub api_online: bool,
    pub loading: bool,
    next_notification_id: u64,
}

impl Default for ClientState {
    fn default() -> Self {
        Self {
            session: None,
            predictions: Vec::new(),
            current: None,
            notifications: Vec::new(),
            api_online: true,
            loading: false,
            next_notification_id: 1,
        }
    }
}

/// 상태 변경 액션
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    LoggedIn(Session),
    LoggedOut,
    PredictionStarted,
    /// 새 기록: 이력 맨 앞에 추가
    PredictionCreated(PredictionView),
    /// 중복: 표시만 하고 이력에는 추가하지 않음
    DuplicateFound(PredictionView),
    PredictionFailed(String),
    HistoryLoaded(Vec<PredictionView>),
    CommentUpdated(PredictionView),
    PredictionDeleted(String),
    ApiStatus(bool),
    Notify(NotificationLevel, String),
    DismissNotification(u64),
}

fn notify(state: &mut ClientState, level: NotificationLevel, message: impl Into<String>) {
    let id = state.next_notification_id;
    state.next_notification_id += 1;
    state.notifications.push(Notification {
        id,
        level,
        message: message.into(),
    });
}

/// 순수 리듀서
pub fn reduce(mut state: ClientState, action: Action) -> ClientState {
    match action {
        Action::LoggedIn(session) => {
            notify(&mut state, NotificationLevel::Success, format!("Logged in as {}", session.username));
            state.session = Some(session);
        }
        Action::LoggedOut => {
            state.session = None;
            state.predictions.clear();
            state.current = None;
        }
        Action::PredictionStarted => {
            state.loading = true;
        }
        Action::PredictionCreated(view) => {
            state.loading = false;
            state.current = Some(DisplayedResult::from_view(&view, false));
            state.predictions.retain(|p| p.id != view.id);
            state.predictions.insert(0, view);
            notify(&mut state, NotificationLevel::Success, "Prediction completed");
        }
        Action::DuplicateFound(view) => {
            state.loading = false;
            state.current = Some(DisplayedResult::from_view(&view, true));
            notify(
                &mut state,
                NotificationLevel::Info,
                "Duplicate image: showing the existing result",
            );
        }
        Action::PredictionFailed(message) => {
            state.loading = false;
            notify(&mut state, NotificationLevel::Error, message);
        }
        Action::HistoryLoaded(predictions) => {
            state.predictions = predictions;
        }
        Action::CommentUpdated(view) => {
            if let Some(existing) = state.predictions.iter_mut().find(|p| p.id == view.id) {
                *existing = view;
            }
        }
        Action::PredictionDeleted(id) => {
            state.predictions.retain(|p| p.id != id);
            if state.current.as_ref().map(|c| c.prediction_id == id).unwrap_or(false) {
                state.current = None;
            }
        }
        Action::ApiStatus(online) => {
            if state.api_online && !online {
                notify(&mut state, NotificationLevel::Warning, "API server is unreachable");
            }
            state.api_online = online;
        }
        Action::Notify(level, message) => notify(&mut state, level, message),
        Action::DismissNotification(id) => {
            state.notifications.retain(|n| n.id != id);
        }
    }
    state
}

/// 상태 보관 + 디스패치
#[derive(Debug, Default)]
pub struct Store {
    state: ClientState,
}

impl Store {
    pub fn new(state: ClientState) -> Self {
        Self { state }
    }

    pub fn state(&self) -> &ClientState {
        &self.state
    }

    pub fn dispatch(&mut self, action: Action) {
        tracing::debug!("액션: {:?}", std::mem::discriminant(&action));
        let state = std::mem::take(&mut self.state);
        self.state = reduce(state, action);
    }
}
