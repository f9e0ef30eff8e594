//! Runtime configuration. Defaults are compiled in, then overridden by an
//! optional TOML file and finally by `IMGCLASS__*` environment variables.

use anyhow::{anyhow, Result};
use config::{Config, Environment, File, Map};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Side length of the square model input
pub const INPUT_SIZE: u32 = 224;

/// Pick `TOP_N` largest softmax probabilities in a classifier model
pub const TOP_N: usize = 5;

/// Number of ImageNet classes MobileNetV2 is trained on
pub const IMAGENET_CLASSES: i64 = 1000;

/// Largest accepted upload (10MB)
pub const DEFAULT_MAX_UPLOAD_BYTES: usize = 10 * 1024 * 1024;

/// Config file read when none is given on the command line
pub const DEFAULT_CONFIG_FILE: &str = "imgclass.toml";

/// Prefix of environment overrides, e.g. `IMGCLASS__SERVER__PORT=9000`
pub const ENV_PREFIX: &str = "IMGCLASS";

/// Default tracing filter when `RUST_LOG` is unset
pub const RUST_LOG: &str = "info,actix_web=info";

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Settings {
    pub server: ServerSettings,
    pub model: ModelSettings,
    pub preprocess: PreprocessSettings,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    /// Number of actix workers, defaults to the number of cores
    pub workers: Option<usize>,
    /// Allow any origin, method and header
    pub cors: bool,
    pub max_upload_bytes: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ModelSettings {
    /// TorchScript module or MobileNetV2 weights
    pub path: PathBuf,
    pub device: DeviceKind,
    pub top_n: usize,
    /// Apply softmax to the raw model output
    pub softmax: bool,
    /// One label per line. ImageNet labels are used when unset
    pub labels: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PreprocessSettings {
    pub resize: ResizeMode,
    pub normalization: Normalization,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeviceKind {
    Cpu,
    Cuda,
    /// CUDA when available, CPU otherwise
    Auto,
}

impl DeviceKind {
    pub fn device(self) -> tch::Device {
        match self {
            DeviceKind::Cpu => tch::Device::Cpu,
            DeviceKind::Cuda => tch::Device::Cuda(0),
            DeviceKind::Auto => tch::Device::cuda_if_available(),
        }
    }
}

/// How an image is brought to `INPUT_SIZE` x `INPUT_SIZE`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResizeMode {
    /// Resize to exact size (may distort aspect ratio)
    Stretch,
    /// Resize keeping aspect ratio, then crop the centre
    CenterCrop,
}

/// Pixel normalization expected by the model weights
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Normalization {
    /// `(v / 255 - mean) / std` with the ImageNet channel statistics
    Imagenet,
    /// `v / 127.5 - 1`, into [-1, 1]
    Symmetric,
}

impl Settings {
    /// Load settings from `file` (may be missing) and the environment
    pub fn load(file: Option<&str>) -> Result<Self> {
        Self::load_with_env(file, None)
    }

    /// Like `load`, reading overrides from `env` instead of the process
    /// environment when it is given
    pub fn load_with_env(file: Option<&str>, env: Option<Map<String, String>>) -> Result<Self> {
        let file = file.unwrap_or(DEFAULT_CONFIG_FILE);
        let required = file != DEFAULT_CONFIG_FILE;

        let env = Environment::with_prefix(ENV_PREFIX)
            .prefix_separator("__")
            .separator("__")
            .source(env);
        let settings: Settings = Self::builder()?
            .add_source(File::with_name(file).required(required))
            .add_source(env)
            .build()?
            .try_deserialize()?;

        settings.validate()?;
        Ok(settings)
    }

    fn builder() -> Result<config::ConfigBuilder<config::builder::DefaultState>> {
        Ok(Config::builder()
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 8000)?
            .set_default("server.cors", true)?
            .set_default("server.max_upload_bytes", DEFAULT_MAX_UPLOAD_BYTES as i64)?
            .set_default("model.path", "models/mobilenet_v2.pt")?
            .set_default("model.device", "cpu")?
            .set_default("model.top_n", TOP_N as i64)?
            .set_default("model.softmax", true)?
            .set_default("preprocess.resize", "stretch")?
            .set_default("preprocess.normalization", "imagenet")?)
    }

    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow!("server.port must be non-zero"));
        }
        if self.model.top_n == 0 {
            return Err(anyhow!("model.top_n must be at least 1"));
        }
        if self.server.max_upload_bytes == 0 {
            return Err(anyhow!("server.max_upload_bytes must be non-zero"));
        }
        Ok(())
    }
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            server: ServerSettings {
                host: "0.0.0.0".into(),
                port: 8000,
                workers: None,
                cors: true,
                max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
            },
            model: ModelSettings {
                path: "models/mobilenet_v2.pt".into(),
                device: DeviceKind::Cpu,
                top_n: TOP_N,
                softmax: true,
                labels: None,
            },
            preprocess: PreprocessSettings {
                resize: ResizeMode::Stretch,
                normalization: Normalization::Imagenet,
            },
        }
    }
}
