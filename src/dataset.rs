//! Labeled image datasets and corruption variants.
//!
//! Inputs are flattened feature vectors. Clean splits live at
//! `{data_dir}/{problem}/{train|test}.json`; a corruption directory holds one
//! `{name}.json` input file per corruption plus a shared `labels.json`.

use crate::config::Problem;
use serde::{Deserialize, Serialize};
use std::ops::Range;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors that can occur during dataset loading
#[derive(Error, Debug)]
pub enum DatasetError {
    #[error("Dataset not found: {0}")]
    NotFound(String),

    #[error("{inputs} inputs but {labels} labels")]
    LengthMismatch { inputs: usize, labels: usize },

    #[error("No corruption datasets found in {0}")]
    NoCorruptions(String),

    #[error("Invalid glob pattern: {0}")]
    Pattern(#[from] glob::PatternError),

    #[error("Failed to parse dataset: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Train or test split
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Split {
    Train,
    Test,
}

impl Split {
    const fn file_name(self) -> &'static str {
        match self {
            Self::Train => "train.json",
            Self::Test => "test.json",
        }
    }
}

/// Inputs with their ground-truth labels
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Dataset {
    pub inputs: Vec<Vec<f32>>,
    pub labels: Vec<usize>,
}

impl Dataset {
    /// Pair inputs with labels
    ///
    /// # Errors
    ///
    /// Returns `DatasetError::LengthMismatch` if the counts differ.
    pub fn new(inputs: Vec<Vec<f32>>, labels: Vec<usize>) -> Result<Self, DatasetError> {
        if inputs.len() != labels.len() {
            return Err(DatasetError::LengthMismatch {
                inputs: inputs.len(),
                labels: labels.len(),
            });
        }
        Ok(Self { inputs, labels })
    }

    /// Read a dataset from a JSON file
    ///
    /// # Errors
    ///
    /// Returns an error if the file is missing, malformed or inconsistent.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, DatasetError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(DatasetError::NotFound(path.display().to_string()));
        }
        let content = std::fs::read_to_string(path)?;
        let dataset: Self = serde_json::from_str(&content)?;
        Self::new(dataset.inputs, dataset.labels)
    }

    /// Load one split of a problem from the data directory
    ///
    /// # Errors
    ///
    /// Returns an error if the split file cannot be loaded.
    pub fn load_split<P: AsRef<Path>>(
        data_dir: P,
        problem: Problem,
        split: Split,
    ) -> Result<Self, DatasetError> {
        Self::load(
            data_dir
                .as_ref()
                .join(problem.as_str())
                .join(split.file_name()),
        )
    }

    /// Write the dataset as JSON
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the write fails.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), DatasetError> {
        std::fs::write(path, serde_json::to_string(self)?)?;
        Ok(())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Samples whose true label equals `label`
    #[must_use]
    pub fn filter_label(&self, label: usize) -> Self {
        let (inputs, labels) = self
            .inputs
            .iter()
            .zip(&self.labels)
            .filter(|(_, y)| **y == label)
            .map(|(x, &y)| (x.clone(), y))
            .unzip();
        Self { inputs, labels }
    }

    /// Contiguous sub-range, truncated to the dataset length
    #[must_use]
    pub fn slice(&self, range: Range<usize>) -> Self {
        let end = range.end.min(self.len());
        let start = range.start.min(end);
        Self {
            inputs: self.inputs[start..end].to_vec(),
            labels: self.labels[start..end].to_vec(),
        }
    }

    /// Iterate in order over batches of at most `size` samples
    ///
    /// A `size` of zero is treated as one.
    pub fn batches(&self, size: usize) -> impl Iterator<Item = Batch<'_>> {
        let size = size.max(1);
        self.inputs
            .chunks(size)
            .zip(self.labels.chunks(size))
            .map(|(inputs, labels)| Batch { inputs, labels })
    }
}

/// Borrowed view of one minibatch
#[derive(Debug, Clone, Copy)]
pub struct Batch<'a> {
    pub inputs: &'a [Vec<f32>],
    pub labels: &'a [usize],
}

impl Batch<'_> {
    #[must_use]
    pub const fn len(&self) -> usize {
        self.labels.len()
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

/// One named corruption, all severities concatenated in order
#[derive(Debug, Clone, PartialEq)]
pub struct Corruption {
    pub name: String,
    pub data: Dataset,
}

impl Corruption {
    /// Severity `severity` (0-based) covering `[severity * size, (severity + 1) * size)`
    #[must_use]
    pub fn severity_slice(&self, severity: usize, size: usize) -> Dataset {
        let start = severity.saturating_mul(size);
        self.data.slice(start..start.saturating_add(size))
    }
}

/// Directory of corruption datasets sharing one label file
#[derive(Debug, Clone)]
pub struct CorruptionSource {
    root: PathBuf,
    files: Vec<(String, PathBuf)>,
}

impl CorruptionSource {
    /// Discover `*.json` corruption files next to `labels.json`, sorted by name
    ///
    /// # Errors
    ///
    /// Returns an error if the directory or label file is missing, or if
    /// no corruption files are present.
    pub fn discover<P: AsRef<Path>>(dir: P) -> Result<Self, DatasetError> {
        let root = dir.as_ref().to_path_buf();
        if !root.join("labels.json").exists() {
            return Err(DatasetError::NotFound(
                root.join("labels.json").display().to_string(),
            ));
        }

        let pattern = root.join("*.json");
        let mut files = Vec::new();
        for entry in glob::glob(&pattern.to_string_lossy())? {
            let path = entry.map_err(|e| DatasetError::IoError(e.into_error()))?;
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if stem == "labels" {
                continue;
            }
            files.push((stem.to_string(), path));
        }
        if files.is_empty() {
            return Err(DatasetError::NoCorruptions(root.display().to_string()));
        }
        files.sort_by(|a, b| a.0.cmp(&b.0));

        Ok(Self { root, files })
    }

    /// Corruption names in evaluation order
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.files.iter().map(|(name, _)| name.as_str())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.files.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Shared labels for every corruption
    ///
    /// # Errors
    ///
    /// Returns an error if `labels.json` cannot be read.
    pub fn labels(&self) -> Result<Vec<usize>, DatasetError> {
        let content = std::fs::read_to_string(self.root.join("labels.json"))?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Lazily load each corruption in order
    ///
    /// # Errors
    ///
    /// Returns an error if the label file cannot be read. Individual
    /// corruption files are read as the iterator advances.
    pub fn iter(
        &self,
    ) -> Result<impl Iterator<Item = Result<Corruption, DatasetError>> + '_, DatasetError> {
        let labels = self.labels()?;
        Ok(self.files.iter().map(move |(name, path)| -> Result<Corruption, DatasetError> {
            let content = std::fs::read_to_string(path)?;
            let inputs: Vec<Vec<f32>> = serde_json::from_str(&content)?;
            Ok(Corruption {
                name: name.clone(),
                data: Dataset::new(inputs, labels.clone())?,
            })
        }))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn sample_dataset() -> Dataset {
        Dataset::new(
            vec![vec![0.0], vec![1.0], vec![2.0], vec![3.0], vec![4.0]],
            vec![0, 1, 0, 2, 0],
        )
        .unwrap()
    }

    #[test]
    fn test_dataset_length_mismatch() {
        let result = Dataset::new(vec![vec![0.0]], vec![0, 1]);
        assert!(matches!(
            result,
            Err(DatasetError::LengthMismatch {
                inputs: 1,
                labels: 2
            })
        ));
    }

    #[test]
    fn test_filter_label() {
        let data = sample_dataset();
        let zeros = data.filter_label(0);
        assert_eq!(zeros.len(), 3);
        assert_eq!(zeros.inputs, vec![vec![0.0], vec![2.0], vec![4.0]]);
        assert!(data.filter_label(7).is_empty());
        // source untouched
        assert_eq!(data.len(), 5);
    }

    #[test]
    fn test_batches_cover_dataset_in_order() {
        let data = sample_dataset();
        let sizes: Vec<usize> = data.batches(2).map(|b| b.len()).collect();
        assert_eq!(sizes, vec![2, 2, 1]);
        let labels: Vec<usize> = data.batches(2).flat_map(|b| b.labels.to_vec()).collect();
        assert_eq!(labels, data.labels);
    }

    #[test]
    fn test_batches_zero_size() {
        let data = sample_dataset();
        assert_eq!(data.batches(0).count(), 5);
    }

    #[test]
    fn test_slice_truncates() {
        let data = sample_dataset();
        assert_eq!(data.slice(1..3).labels, vec![1, 0]);
        assert_eq!(data.slice(3..100).len(), 2);
        assert!(data.slice(10..20).is_empty());
    }

    #[test]
    fn test_severity_slice() {
        let corruption = Corruption {
            name: "fog".to_string(),
            data: sample_dataset(),
        };
        assert_eq!(corruption.severity_slice(0, 2).labels, vec![0, 1]);
        assert_eq!(corruption.severity_slice(1, 2).labels, vec![0, 2]);
        assert_eq!(corruption.severity_slice(2, 2).labels, vec![0]);
        assert!(corruption.severity_slice(3, 2).is_empty());
    }

    #[test]
    fn test_load_split_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("svhn")).unwrap();
        let data = sample_dataset();
        data.save(dir.path().join("svhn").join("test.json")).unwrap();

        let loaded = Dataset::load_split(dir.path(), Problem::Svhn, Split::Test).unwrap();
        assert_eq!(loaded, data);

        let missing = Dataset::load_split(dir.path(), Problem::Svhn, Split::Train);
        assert!(matches!(missing, Err(DatasetError::NotFound(_))));
    }

    #[test]
    fn test_corruption_source_discover() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("labels.json"), "[0, 1]").unwrap();
        std::fs::write(dir.path().join("snow.json"), "[[0.1], [0.2]]").unwrap();
        std::fs::write(dir.path().join("fog.json"), "[[0.3], [0.4]]").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let source = CorruptionSource::discover(dir.path()).unwrap();
        assert_eq!(source.len(), 2);
        assert_eq!(source.names().collect::<Vec<_>>(), vec!["fog", "snow"]);

        let corruptions: Vec<Corruption> = source
            .iter()
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(corruptions[0].name, "fog");
        assert_eq!(corruptions[0].data.labels, vec![0, 1]);
        assert_eq!(corruptions[1].data.inputs, vec![vec![0.1], vec![0.2]]);
    }

    #[test]
    fn test_corruption_source_label_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("labels.json"), "[0]").unwrap();
        std::fs::write(dir.path().join("snow.json"), "[[0.1], [0.2]]").unwrap();

        let source = CorruptionSource::discover(dir.path()).unwrap();
        let first = source.iter().unwrap().next().unwrap();
        assert!(matches!(first, Err(DatasetError::LengthMismatch { .. })));
    }

    #[test]
    fn test_corruption_source_missing_labels() {
        let dir = tempfile::tempdir().unwrap();
        let result = CorruptionSource::discover(dir.path());
        assert!(matches!(result, Err(DatasetError::NotFound(_))));
    }

    #[test]
    fn test_corruption_source_empty() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("labels.json"), "[]").unwrap();
        let result = CorruptionSource::discover(dir.path());
        assert!(matches!(result, Err(DatasetError::NoCorruptions(_))));
    }
}
