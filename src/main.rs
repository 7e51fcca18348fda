//! CV Shelves 서버와 관리 CLI
//!
//! ```bash
//! cv-shelves serve --config shelves.toml
//! cv-shelves create-user admin secret123 --superuser
//! cv-shelves submit --server http://localhost:8000 --token <user-id> shelf.jpg --model both
//! cv-shelves render <prediction-id> --mode polygons -o shelf.png
//! ```

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

use cv_shelves_lib::auth::{self, Credentials};
use cv_shelves_lib::client::store::{NotificationLevel, Store};
use cv_shelves_lib::client::workflow::{submit_image, Submission};
use cv_shelves_lib::client::ApiClient;
use cv_shelves_lib::history;
use cv_shelves_lib::render::{self, DisplayMode};
use cv_shelves_lib::utils::image_utils;
use cv_shelves_lib::{build_state, router, AppConfig, HistoryDb, ModelVariant};

#[derive(Parser)]
#[command(name = "cv-shelves")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "선반 객체 검출 서버 및 관리 도구", long_about = None)]
struct Cli {
    /// TOML 설정 파일
    #[arg(long, short, global = true, env = "CV_SHELVES_CONFIG")]
    config: Option<PathBuf>,

    /// 디버그 로그 출력
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// HTTP API 서버 실행
    Serve {
        /// 바인드 주소 (설정값 덮어쓰기)
        #[arg(long)]
        bind: Option<String>,
    },
    /// 사용자 생성
    CreateUser {
        username: String,
        password: String,
        #[arg(long)]
        email: Option<String>,
        #[arg(long)]
        superuser: bool,
    },
    /// 사용자 목록
    ListUsers,
    /// 저장된 예측을 PNG 로 렌더링
    Render {
        prediction_id: String,
        /// boxes 또는 polygons
        #[arg(long, default_value = "boxes")]
        mode: DisplayMode,
        #[arg(long, short)]
        output: PathBuf,
    },
    /// 실행 중인 서버에 이미지 제출
    Submit {
        #[arg(long, default_value = "http://localhost:8000", env = "CV_SHELVES_SERVER")]
        server: String,
        /// 로그인 토큰 (사용자 ID)
        #[arg(long, env = "CV_SHELVES_TOKEN")]
        token: String,
        file: PathBuf,
        /// rfdetr, yolo, both
        #[arg(long, default_value = "rfdetr")]
        model: ModelVariant,
        #[arg(long)]
        rfdetr_threshold: Option<f64>,
        #[arg(long)]
        yolo_threshold: Option<f64>,
        #[arg(long)]
        comment: Option<String>,
    },
    /// 전체 이력을 JSON 파일로 내보내기
    Export {
        #[arg(long, short)]
        output: PathBuf,
    },
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    // .env 는 없어도 됨
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = AppConfig::load(cli.config.as_deref()).context("설정 로드 실패")?;

    match cli.command {
        Commands::Serve { bind } => {
            let mut config = config;
            if let Some(bind) = bind {
                config.server.bind_addr = bind;
            }
            serve(config).await?;
        }
        Commands::CreateUser {
            username,
            password,
            email,
            superuser,
        } => {
            let db = HistoryDb::open(&config.database.path)?;
            let user = auth::register(
                &db,
                &Credentials {
                    username,
                    password,
                    email,
                },
                superuser,
            )?;
            println!("{}\t{}", user.id, user.username);
        }
        Commands::ListUsers => {
            let db = HistoryDb::open(&config.database.path)?;
            for (user, count) in db.users_with_prediction_counts()? {
                println!(
                    "{}\t{}\t{}\t{}\t{}",
                    user.id,
                    user.username,
                    user.email.as_deref().unwrap_or("-"),
                    if user.is_superuser { "superuser" } else { "user" },
                    count
                );
            }
        }
        Commands::Render {
            prediction_id,
            mode,
            output,
        } => {
            let db = HistoryDb::open(&config.database.path)?;
            let record = db
                .get_prediction(&prediction_id)?
                .with_context(|| format!("예측 기록이 없습니다: {}", prediction_id))?;
            let Some(data_url) = record.image_base64 else {
                bail!("이미지가 저장되지 않은 기록입니다: {}", prediction_id);
            };
            let image_bytes = image_utils::decode_data_url(&data_url)?;
            let font = match &config.render.font_path {
                Some(path) => Some(render::load_font(path)?),
                None => None,
            };
            let png = render::render_png(&image_bytes, &record.results, &config.render, mode, font.as_ref())?;
            std::fs::write(&output, png).with_context(|| format!("{} 저장 실패", output.display()))?;
            info!("렌더링 저장: {}", output.display());
        }
        Commands::Submit {
            server,
            token,
            file,
            model,
            rfdetr_threshold,
            yolo_threshold,
            comment,
        } => {
            let client = ApiClient::new(&server)?.with_token(token);
            let mut submission = Submission::from_file(&file, model)
                .with_context(|| format!("{} 읽기 실패", file.display()))?;
            submission.rfdetr_threshold = rfdetr_threshold;
            submission.yolo_threshold = yolo_threshold;
            submission.comment = comment;

            let mut store = Store::default();
            let shown = submit_image(&client, &mut store, submission).await;
            for notification in &store.state().notifications {
                println!("[{:?}] {}", notification.level, notification.message);
            }
            if let Some(current) = &store.state().current {
                println!("{}", serde_json::to_string_pretty(&current.results)?);
            }
            let failed = store
                .state()
                .notifications
                .iter()
                .any(|n| n.level == NotificationLevel::Error);
            if shown.is_none() || failed {
                bail!("제출 실패");
            }
        }
        Commands::Export { output } => {
            let db = HistoryDb::open(&config.database.path)?;
            let document = history::export_document(&db, "cli")?;
            std::fs::write(&output, serde_json::to_vec_pretty(&document)?)
                .with_context(|| format!("{} 저장 실패", output.display()))?;
            info!("이력 내보내기: {}", output.display());
        }
    }

    Ok(())
}

async fn serve(config: AppConfig) -> Result<()> {
    let addr = config.server.bind_addr.clone();
    let state = build_state(config)?;
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("{} 바인드 실패", addr))?;
    info!("서버 시작: http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("서버 종료");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Ctrl+C 핸들러 설치 실패: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("SIGTERM 핸들러 설치 실패: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("종료 신호 수신, 서버를 정리합니다");
}
