//! Ordered set of sign class names.
//!
//! Index `i` of the set is output index `i` of the classifier, so the order has to be the
//! same during training and inference.
use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{bail, Context, Result};

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LabelSet {
    labels: Vec<String>,
}

impl LabelSet {
    /// Create a label set, rejecting empty sets and duplicate names.
    pub fn new(labels: Vec<String>) -> Result<Self> {
        if labels.is_empty() {
            bail!("label set is empty");
        }
        for (index, label) in labels.iter().enumerate() {
            if labels[..index].contains(label) {
                bail!("duplicate label {label:?}");
            }
        }

        Ok(Self { labels })
    }

    /// Derive the label set from a directory-per-class dataset.
    ///
    /// Sub-directory names sorted lexicographically; plain files are skipped.
    pub fn from_dataset_dir(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let mut labels = vec![];
        for entry in fs::read_dir(dir)
            .with_context(|| format!("failed to read dataset directory {}", dir.display()))?
        {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                labels.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        labels.sort();

        Self::new(labels).with_context(|| format!("no classes found in {}", dir.display()))
    }

    /// Load a label set persisted with [`LabelSet::save`].
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = fs::read(path)
            .with_context(|| format!("failed to read label file {}", path.display()))?;
        let labels: Vec<String> = serde_json::from_slice(&data)
            .with_context(|| format!("malformed label file {}", path.display()))?;

        Self::new(labels)
    }

    /// Persist the label set as a JSON array.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let data = serde_json::to_vec_pretty(&self.labels)?;
        fs::write(path, data)
            .with_context(|| format!("failed to write label file {}", path.display()))?;

        Ok(())
    }

    pub fn get(&self, index: usize) -> Option<&str> {
        self.labels.get(index).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> + '_ {
        self.labels.iter().map(String::as_str)
    }
}

/// Path of the label file stored next to a model, `model.onnx` -> `model.labels.json`.
pub fn sidecar_path(model_path: impl AsRef<Path>) -> PathBuf {
    model_path.as_ref().with_extension("labels.json")
}
