//! Class labels and top-N decoding of a model's output row

use anyhow::{anyhow, Context, Result};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tch::vision::imagenet;

/// Short ImageNet class names: the first synonym of each entry
static IMAGENET_SHORT: Lazy<Vec<String>> = Lazy::new(|| {
    imagenet::CLASSES
        .iter()
        .map(|entry| short_name(entry).to_string())
        .collect()
});

fn short_name(entry: &str) -> &str {
    entry.split(',').next().unwrap_or(entry).trim()
}

/// A class prediction outputted by a classifier model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Class {
    pub index: usize,
    pub label: String,
    pub probability: f64,
}

/// The label set a model's output indexes into
#[derive(Debug, Clone)]
pub struct Labels {
    names: Vec<String>,
}

impl Labels {
    /// The 1000 ImageNet classes
    pub fn imagenet() -> Self {
        Labels {
            names: IMAGENET_SHORT.clone(),
        }
    }

    /// Parse a label file: one label per line, blank lines ignored
    pub fn parse(text: &str) -> Result<Self> {
        let names: Vec<String> = text
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect();
        if names.is_empty() {
            return Err(anyhow!("label file contains no labels"));
        }
        Ok(Labels { names })
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read labels from {}", path.display()))?;
        Self::parse(&text)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&str> {
        self.names.get(index).map(String::as_str)
    }

    /// The `n` highest scoring classes, best first. Ties go to the lower
    /// class index and `n` is clamped to the number of classes
    pub fn top_n(&self, scores: &[f32], n: usize) -> Result<Vec<Class>> {
        if scores.len() != self.names.len() {
            return Err(anyhow!(
                "model produced {} scores but {} labels are loaded",
                scores.len(),
                self.names.len()
            ));
        }

        let mut ranked: Vec<(usize, f32)> = scores.iter().copied().enumerate().collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));

        Ok(ranked
            .into_iter()
            .take(n)
            .map(|(index, p)| Class {
                index,
                label: self.names[index].clone(),
                probability: p as f64,
            })
            .collect())
    }
}
