// =============================================================================
// Model Scorer — probability-like score in [0, 1] from a model artifact
// =============================================================================
//
// Artifact routing by file signature:
//   .onnx             ONNX graph (the export target for xgboost / lightgbm /
//                     sklearn classifiers), served through `ort`
//   .json             serde-serialized smartcore random-forest regressor
//   anything else     Neutral
//
// The scorer is intentionally tolerant: a missing path, a failed load, or a
// failed prediction all yield the neutral score 1.0 so the rule policy keeps
// trading unmodulated. Feature generation happens elsewhere (FeatureMapper);
// this module only runs inference.
// =============================================================================

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use ort::session::Session;
use smartcore::ensemble::random_forest_regressor::RandomForestRegressor;
use smartcore::linalg::basic::matrix::DenseMatrix;
use tracing::{error, info, warn};

/// Requested artifact kind from `SCORER_MODEL_TYPE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScorerModelType {
    Auto,
    Onnx,
    Forest,
}

impl ScorerModelType {
    pub fn parse(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "onnx" => Self::Onnx,
            "forest" => Self::Forest,
            _ => Self::Auto,
        }
    }
}

type ForestModel = RandomForestRegressor<f64, f64, DenseMatrix<f64>, Vec<f64>>;

enum Backend {
    Onnx(Mutex<Session>),
    Forest(Box<ForestModel>),
    Neutral,
}

pub struct Scorer {
    backend: Backend,
    model_path: PathBuf,
}

impl Scorer {
    /// Neutral scorer: always 1.0. Used when no model is configured.
    pub fn neutral() -> Self {
        Self {
            backend: Backend::Neutral,
            model_path: PathBuf::new(),
        }
    }

    /// Load an artifact, degrading to neutral on any failure.
    pub fn from_config(model_path: Option<&str>, model_type: ScorerModelType) -> Self {
        let Some(path_str) = model_path.filter(|p| !p.trim().is_empty()) else {
            return Self::neutral();
        };
        let path = PathBuf::from(path_str);
        if !path.is_file() {
            warn!(path = %path.display(), "scorer model file not found — running neutral");
            return Self::neutral();
        }

        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_lowercase();

        let backend = match (model_type, ext.as_str()) {
            (ScorerModelType::Onnx, _) | (ScorerModelType::Auto, "onnx") => {
                Self::load_onnx(&path)
            }
            (ScorerModelType::Forest, _) | (ScorerModelType::Auto, "json") => {
                Self::load_forest(&path)
            }
            _ => {
                warn!(path = %path.display(), "unrecognized scorer artifact — running neutral");
                Backend::Neutral
            }
        };

        Self {
            backend,
            model_path: path,
        }
    }

    fn load_onnx(path: &Path) -> Backend {
        match Session::builder() {
            Ok(mut builder) => match builder.commit_from_file(path) {
                Ok(session) => {
                    info!(path = %path.display(), "ONNX scorer model loaded");
                    Backend::Onnx(Mutex::new(session))
                }
                Err(e) => {
                    error!(path = %path.display(), error = %e, "failed to load ONNX model");
                    Backend::Neutral
                }
            },
            Err(e) => {
                error!(error = %e, "failed to create ONNX session builder");
                Backend::Neutral
            }
        }
    }

    fn load_forest(path: &Path) -> Backend {
        let text = match std::fs::read_to_string(path) {
            Ok(t) => t,
            Err(e) => {
                error!(path = %path.display(), error = %e, "failed to read forest model");
                return Backend::Neutral;
            }
        };
        match serde_json::from_str::<ForestModel>(&text) {
            Ok(model) => {
                info!(path = %path.display(), "forest scorer model loaded");
                Backend::Forest(Box::new(model))
            }
            Err(e) => {
                error!(path = %path.display(), error = %e, "failed to deserialize forest model");
                Backend::Neutral
            }
        }
    }

    pub fn available(&self) -> bool {
        !matches!(self.backend, Backend::Neutral)
    }

    /// Score a feature vector. Always returns a value in [0, 1]; every
    /// failure path resolves to the neutral 1.0.
    pub fn score(&self, features: &[f32]) -> f64 {
        let raw = match &self.backend {
            Backend::Neutral => return 1.0,
            Backend::Onnx(session) => self.score_onnx(session, features),
            Backend::Forest(model) => Self::score_forest(model, features),
        };
        match raw {
            Ok(s) => s.clamp(0.0, 1.0),
            Err(e) => {
                warn!(path = %self.model_path.display(), error = %e, "scoring failed — neutral");
                1.0
            }
        }
    }

    fn score_onnx(&self, session: &Mutex<Session>, features: &[f32]) -> Result<f64, String> {
        let mut session = session
            .lock()
            .map_err(|e| format!("session lock failed: {e}"))?;

        let shape = vec![1usize, features.len()];
        let input_value = ort::value::Value::from_array((shape.as_slice(), features.to_vec()))
            .map_err(|e| format!("input value creation failed: {e}"))?;
        let inputs = ort::inputs![input_value];

        let outputs = session.run(inputs).map_err(|e| e.to_string())?;
        let output_value = outputs
            .iter()
            .next()
            .map(|(_, v)| v)
            .ok_or("no output found")?;
        let data = output_value
            .try_extract_tensor::<f32>()
            .map_err(|e| e.to_string())?;
        let first = data.1.iter().next().ok_or("empty output")?;
        Ok(*first as f64)
    }

    fn score_forest(model: &ForestModel, features: &[f32]) -> Result<f64, String> {
        let row: Vec<f64> = features.iter().map(|f| *f as f64).collect();
        let matrix = DenseMatrix::from_2d_vec(&vec![row])
            .map_err(|e| format!("matrix creation failed: {e}"))?;
        let preds = model.predict(&matrix).map_err(|e| format!("prediction failed: {e}"))?;
        preds.first().copied().ok_or_else(|| "no prediction returned".to_string())
    }
}

impl std::fmt::Debug for Scorer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self.backend {
            Backend::Onnx(_) => "onnx",
            Backend::Forest(_) => "forest",
            Backend::Neutral => "neutral",
        };
        f.debug_struct("Scorer")
            .field("backend", &kind)
            .field("model_path", &self.model_path)
            .finish()
    }
}
