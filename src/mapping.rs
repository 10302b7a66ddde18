use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LabelsConfig {
    /// Optional labels file, one label per line, 0-based.
    pub path: Option<PathBuf>,
    /// Class index reported as abnormal.
    pub positive_class: usize,
}

impl Default for LabelsConfig {
    fn default() -> Self {
        Self {
            path: None,
            positive_class: 1,
        }
    }
}

pub fn load_class_mapping(file_path: &Path) -> std::io::Result<HashMap<usize, String>> {
    let file = File::open(file_path)?;
    let reader = BufReader::new(file);

    let mut mapping = HashMap::new();
    for (id, line) in reader.lines().enumerate() {
        let name = line?.trim().to_string();
        if !name.is_empty() {
            mapping.insert(id, name);
        }
    }
    Ok(mapping)
}

#[derive(Debug, Clone)]
pub struct ClassMapping {
    labels: HashMap<usize, String>,
    positive_class: usize,
}

impl Default for ClassMapping {
    fn default() -> Self {
        let labels = HashMap::from([(0, "Normal".to_string()), (1, "Tumor".to_string())]);
        Self {
            labels,
            positive_class: 1,
        }
    }
}

impl ClassMapping {
    pub fn new(labels: HashMap<usize, String>, positive_class: usize) -> Self {
        Self {
            labels,
            positive_class,
        }
    }

    pub fn from_config(config: &LabelsConfig) -> std::io::Result<Self> {
        let mut mapping = match &config.path {
            Some(path) => Self::new(load_class_mapping(path)?, config.positive_class),
            None => Self::default(),
        };
        mapping.positive_class = config.positive_class;
        Ok(mapping)
    }

    pub fn label(&self, class_index: usize) -> String {
        self.labels
            .get(&class_index)
            .cloned()
            .unwrap_or_else(|| format!("class_{class_index}"))
    }

    pub fn is_abnormal(&self, class_index: usize) -> bool {
        class_index == self.positive_class
    }
}
