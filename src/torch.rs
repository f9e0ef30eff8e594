//! Code for loading and running a (trained) MobileNetV2 classifier with
//! libtorch

use crate::config::{Normalization, ResizeMode, Settings, IMAGENET_CLASSES, INPUT_SIZE};
use crate::labels::{Class, Labels};
use crate::preprocess::{self, INPUT_LEN};
use anyhow::{anyhow, Context, Result};
use image::DynamicImage;
use serde::Serialize;
use std::fmt::{self, Debug};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tch::nn::{self, ModuleT};
use tch::vision::mobilenet;
use tch::{Device, Kind, Tensor};

/// How a model file on disk is interpreted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ModelFormat {
    /// A self-contained TorchScript module
    TorchScript,
    /// Weights for the built-in MobileNetV2 graph (`.ot` or `.safetensors`)
    Weights,
}

impl ModelFormat {
    pub fn from_path(path: &Path) -> Result<Self> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase);
        match ext.as_deref() {
            Some("pt" | "pth" | "torchscript" | "jit") => Ok(ModelFormat::TorchScript),
            Some("ot" | "safetensors") => Ok(ModelFormat::Weights),
            _ => Err(anyhow!(
                "cannot tell the model format of {}: expected .pt, .pth, .torchscript, .jit, .ot or .safetensors",
                path.display()
            )),
        }
    }
}

enum Backend {
    Script(tch::CModule),
    Graph {
        // Owns the variables `net` reads from
        vs: nn::VarStore,
        net: Box<dyn ModuleT>,
    },
}

/// A loaded model, either TorchScript or MobileNetV2 weights
pub struct TorchModel {
    backend: Backend,
    format: ModelFormat,
    device: Device,
}

impl Debug for TorchModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "TorchModel {{ format: {:?}, device: {:?} }}",
            self.format, self.device
        )
    }
}

/// Build the MobileNetV2 graph over `vs`, with randomly initialised variables
fn mobilenet_v2(vs: &nn::VarStore) -> Box<dyn ModuleT> {
    Box::new(mobilenet::v2(&vs.root(), IMAGENET_CLASSES))
}

impl TorchModel {
    /// Load a model file, picking the loader from its extension
    pub fn load(path: &Path, device: Device) -> Result<Self> {
        if !path.exists() {
            return Err(anyhow!("model file {} does not exist", path.display()));
        }

        match ModelFormat::from_path(path)? {
            ModelFormat::TorchScript => {
                let mut module = tch::CModule::load_on_device(path, device)
                    .with_context(|| format!("failed to load TorchScript {}", path.display()))?;
                module.set_eval();
                Ok(TorchModel {
                    backend: Backend::Script(module),
                    format: ModelFormat::TorchScript,
                    device,
                })
            }
            ModelFormat::Weights => {
                let mut model = Self::mobilenet_v2(device);
                if let Backend::Graph { vs, .. } = &mut model.backend {
                    vs.load(path)
                        .with_context(|| format!("failed to load weights {}", path.display()))?;
                }
                Ok(model)
            }
        }
    }

    /// An untrained MobileNetV2. Used by the exporter and in tests
    pub fn mobilenet_v2(device: Device) -> Self {
        Self::from_var_store(nn::VarStore::new(device))
    }

    /// Build the MobileNetV2 graph over `vs`. Variables already in `vs` with
    /// matching names are reused, the rest are freshly initialised
    pub fn from_var_store(vs: nn::VarStore) -> Self {
        let device = vs.device();
        let net = mobilenet_v2(&vs);
        TorchModel {
            backend: Backend::Graph { vs, net },
            format: ModelFormat::Weights,
            device,
        }
    }

    pub fn format(&self) -> ModelFormat {
        self.format
    }

    pub fn device(&self) -> Device {
        self.device
    }

    fn forward_tensor(&self, input: &Tensor) -> Result<Tensor> {
        let output = tch::no_grad(|| match &self.backend {
            Backend::Script(module) => module.forward_ts(&[input]),
            Backend::Graph { net, .. } => Ok(net.forward_t(input, false)),
        })?;
        Ok(output)
    }

    /// Run one preprocessed image (`INPUT_LEN` floats, CHW) through the model
    /// and return its output row
    pub fn forward(&self, input: &[f32], softmax: bool) -> Result<Vec<f32>> {
        if input.len() != INPUT_LEN {
            return Err(anyhow!(
                "expected {INPUT_LEN} input values, got {}",
                input.len()
            ));
        }
        let size = INPUT_SIZE as i64;
        let tensor = Tensor::from_slice(input)
            .view([1, 3, size, size])
            .to_device(self.device);

        let mut output = self.forward_tensor(&tensor)?;
        let dims = output.size();
        if dims.len() != 2 || dims[0] != 1 {
            return Err(anyhow!("expected a single output row, got shape {dims:?}"));
        }
        if softmax {
            output = output.softmax(-1, Some(Kind::Float));
        }

        let row = output
            .to_kind(Kind::Float)
            .to_device(Device::Cpu)
            .view([-1]);
        Ok(Vec::<f32>::try_from(&row)?)
    }

    /// Save the variables of a graph model. The format follows the extension
    fn save_weights(&self, path: &Path) -> Result<()> {
        match &self.backend {
            Backend::Graph { vs, .. } => Ok(vs.save(path)?),
            Backend::Script(_) => Err(anyhow!("a TorchScript module has no separate weights")),
        }
    }

    /// Trace the model into a self-contained TorchScript module
    fn trace(&self, path: &Path) -> Result<()> {
        let size = INPUT_SIZE as i64;
        let example = Tensor::zeros([1, 3, size, size], (Kind::Float, self.device));
        let module = match &self.backend {
            Backend::Graph { net, .. } => tch::CModule::create_by_tracing(
                "MobileNetV2",
                "forward",
                &[example],
                &mut |xs: &[Tensor]| vec![net.forward_t(&xs[0], false)],
            )?,
            Backend::Script(module) => {
                return Err(anyhow!(
                    "{module:?} is already TorchScript, copy the file instead"
                ))
            }
        };
        module.save(path)?;
        Ok(())
    }
}

/// Files written by `export`
#[derive(Debug)]
pub struct Exported {
    pub weights: PathBuf,
    pub torchscript: PathBuf,
}

/// Load MobileNetV2 weights, check that they produce ImageNet scores, and
/// persist them as `<stem>.safetensors` and `<stem>.pt`
pub fn export(weights: &Path, stem: &Path, device: Device) -> Result<Exported> {
    let model = TorchModel::load(weights, device)?;
    if model.format() != ModelFormat::Weights {
        return Err(anyhow!(
            "{} is not a MobileNetV2 weights file",
            weights.display()
        ));
    }
    export_model(&model, stem)
}

fn export_model(model: &TorchModel, stem: &Path) -> Result<Exported> {
    let scores = model.forward(&vec![0f32; INPUT_LEN], false)?;
    if scores.len() as i64 != IMAGENET_CLASSES {
        return Err(anyhow!(
            "model produced {} scores, expected {IMAGENET_CLASSES}",
            scores.len()
        ));
    }

    if let Some(dir) = stem.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;
    }

    let out = Exported {
        weights: stem.with_extension("safetensors"),
        torchscript: stem.with_extension("pt"),
    };
    model.save_weights(&out.weights)?;
    model.trace(&out.torchscript)?;
    Ok(out)
}

/// Description of the loaded model, served on `GET /model`
#[derive(Debug, Clone, Serialize)]
pub struct ModelInfo {
    pub path: PathBuf,
    pub format: ModelFormat,
    pub device: String,
    pub input_size: u32,
    pub top_n: usize,
    pub softmax: bool,
    pub resize: ResizeMode,
    pub normalization: Normalization,
    pub classes: usize,
}

/// A model plus everything needed to turn an image into ranked classes.
/// Forward passes are serialised through a lock
pub struct Classifier {
    model: Mutex<TorchModel>,
    labels: Labels,
    top_n: usize,
    softmax: bool,
    resize: ResizeMode,
    normalization: Normalization,
    info: ModelInfo,
}

impl Classifier {
    /// Load the model and labels named by `settings`
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let model = TorchModel::load(&settings.model.path, settings.model.device.device())?;
        let labels = match &settings.model.labels {
            Some(path) => Labels::from_file(path)?,
            None => Labels::imagenet(),
        };
        Self::checked(model, labels, settings)
    }

    /// Like `new`, but first runs a blank image through the model to make sure
    /// every output score has a label
    pub fn checked(model: TorchModel, labels: Labels, settings: &Settings) -> Result<Self> {
        let scores = model.forward(&vec![0f32; INPUT_LEN], false)?;
        if scores.len() != labels.len() {
            return Err(anyhow!(
                "model produces {} scores but {} labels are loaded",
                scores.len(),
                labels.len()
            ));
        }
        Ok(Self::new(model, labels, settings))
    }

    pub fn new(model: TorchModel, labels: Labels, settings: &Settings) -> Self {
        let info = ModelInfo {
            path: settings.model.path.clone(),
            format: model.format(),
            device: format!("{:?}", model.device()),
            input_size: INPUT_SIZE,
            top_n: settings.model.top_n,
            softmax: settings.model.softmax,
            resize: settings.preprocess.resize,
            normalization: settings.preprocess.normalization,
            classes: labels.len(),
        };
        Classifier {
            model: Mutex::new(model),
            labels,
            top_n: settings.model.top_n,
            softmax: settings.model.softmax,
            resize: settings.preprocess.resize,
            normalization: settings.preprocess.normalization,
            info,
        }
    }

    pub fn info(&self) -> &ModelInfo {
        &self.info
    }

    /// Run image classification
    pub fn classify(&self, image: &DynamicImage) -> Result<Vec<Class>> {
        let input = preprocess::preprocess(image, self.resize, self.normalization);
        let scores = {
            let model = self
                .model
                .lock()
                .map_err(|_| anyhow!("model lock poisoned by an earlier panic"))?;
            model.forward(&input, self.softmax)?
        };
        self.labels.top_n(&scores, self.top_n)
    }
}
