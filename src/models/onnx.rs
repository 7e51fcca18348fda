use ndarray::{ArrayD, CowArray};
use ort::execution_providers::CPUExecutionProviderOptions;
use ort::{Environment, ExecutionProvider, GraphOptimizationLevel, LoggingLevel, Session, SessionBuilder, Value};
use std::path::Path;
use std::sync::Arc;

use crate::error::{AppError, AppResult};
use crate::models::TensorBackend;

/// ONNX Runtime 세션 래퍼
pub struct OnnxSession {
    // 세션보다 먼저 해제되면 안 됨
    _environment: Arc<Environment>,
    session: Session,
}

impl OnnxSession {
    /// 모델 파일에서 세션 생성
    pub fn load(name: &str, model_path: &Path, device: &str) -> AppResult<Self> {
        let environment = Arc::new(
            Environment::builder()
                .with_name(name)
                .with_log_level(LoggingLevel::Warning)
                .build()?,
        );

        let mut providers = Vec::new();
        if device.eq_ignore_ascii_case("cuda") {
            providers.push(ExecutionProvider::CUDA(Default::default()));
        }
        providers.push(ExecutionProvider::CPU(CPUExecutionProviderOptions::default()));

        let session = SessionBuilder::new(&environment)?
            .with_execution_providers(providers)?
            .with_optimization_level(GraphOptimizationLevel::Level1)?
            .with_intra_threads(4)?
            .with_model_from_file(model_path)?;

        tracing::info!("ONNX 세션 생성 완료: {} ({})", model_path.display(), device);

        Ok(Self {
            _environment: environment,
            session,
        })
    }
}

impl TensorBackend for OnnxSession {
    fn run(&mut self, input: &ArrayD<f32>) -> AppResult<Vec<ArrayD<f32>>> {
        let cow_array = CowArray::from(input.view());
        let input_value = Value::from_array(self.session.allocator(), &cow_array)?;
        let outputs = self.session.run(vec![input_value])?;

        outputs
            .iter()
            .map(|output| {
                let tensor = output.try_extract::<f32>()?;
                let view = tensor.view();
                Ok(view.to_owned())
            })
            .collect::<Result<Vec<_>, ort::OrtError>>()
            .map_err(|e| AppError::OrtError(e.to_string()))
    }
}
