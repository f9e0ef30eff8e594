use crate::labels::Class;
use serde::{Deserialize, Serialize};

pub const HEALTH_MESSAGE: &str = "Image Classification API is running";

/// An in-memory representation of an image, encoded as base 64. When given,
/// `height` and `width` must match the decoded image
#[derive(Deserialize, Serialize)]
pub struct B64Image {
    pub image: String,
    #[serde(default)]
    pub height: Option<u32>,
    #[serde(default)]
    pub width: Option<u32>,
}

impl std::fmt::Debug for B64Image {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "B64Image {{ image: <{} chars>, height: {:?}, width: {:?} }}",
            self.image.len(),
            self.height,
            self.width
        )
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub class: String,
    pub confidence: f64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PredictResponse {
    pub predictions: Vec<Prediction>,
}

impl From<Vec<Class>> for PredictResponse {
    fn from(classes: Vec<Class>) -> Self {
        PredictResponse {
            predictions: classes
                .into_iter()
                .map(|c| Prediction {
                    class: c.label,
                    confidence: c.probability,
                })
                .collect(),
        }
    }
}
