use crate::config::{LabelsConfig, Validatable};
use std::{
    fs::File,
    io::{self, BufRead},
    path::Path,
};

/// Class names indexed by the model's class id.
#[derive(Debug, Clone)]
pub struct ClassLabels {
    labels: Vec<String>,
}

impl ClassLabels {
    pub fn new(labels_cfg: &LabelsConfig) -> Result<Self, String> {
        match load_labels(&labels_cfg.get_path()) {
            Ok(labels) => Ok(Self::from(labels)),
            Err(e) => Err(format!("Failed to load labels: {}", e)),
        }
    }

    pub fn get(&self, class_id: usize) -> Option<&str> {
        self.labels.get(class_id).map(String::as_str)
    }

    /// Resolves a class id, falling back to a placeholder for ids the labels
    /// file does not cover.
    pub fn label_for(&self, class_id: usize) -> String {
        self.get(class_id)
            .map(str::to_string)
            .unwrap_or_else(|| format!("Unknown class {}", class_id))
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

impl From<Vec<String>> for ClassLabels {
    fn from(labels: Vec<String>) -> Self {
        Self { labels }
    }
}

/// Reads one class name per line. Lines may carry trailing comma separated
/// fields (e.g. a display color) which are ignored.
pub fn load_labels(filepath: &Path) -> io::Result<Vec<String>> {
    let file = File::open(filepath)?;
    let reader = io::BufReader::new(file);
    let mut labels = Vec::new();

    for line_result in reader.lines() {
        let line = line_result?;
        let label = line.split(',').next().unwrap_or_default().trim();
        if label.is_empty() {
            continue;
        }
        labels.push(label.to_string());
    }

    if labels.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("No labels found in {:?}", filepath),
        ));
    }

    Ok(labels)
}
