//! Class-name registry.
//!
//! Allow-mask specs may refer to classes and taxonomy groups by name. Those
//! names resolve through an explicit registry owned by the camera session
//! and built from the inference endpoint's label list - never through
//! process-global state.

use std::collections::HashMap;

/// Per-session class-name -> index resolution.
#[derive(Clone, Debug, Default)]
pub struct ClassRegistry {
    labels: Vec<String>,
    by_name: HashMap<String, usize>,
    groups: HashMap<String, Vec<usize>>,
}

impl ClassRegistry {
    /// Build a registry from the inference metadata's label list. Each label
    /// name resolves to its own index.
    pub fn from_labels(labels: &[String]) -> Self {
        let by_name = labels
            .iter()
            .enumerate()
            .map(|(index, label)| (label.clone(), index))
            .collect();
        Self {
            labels: labels.to_vec(),
            by_name,
            groups: HashMap::new(),
        }
    }

    /// Register a named group covering several class indices, e.g. a
    /// taxonomy slice like `insects`.
    pub fn register_group(&mut self, name: &str, indices: Vec<usize>) {
        self.groups.insert(name.to_string(), indices);
    }

    /// Resolve a name to class indices: label names first, then groups.
    pub fn resolve(&self, name: &str) -> Option<Vec<usize>> {
        if let Some(&index) = self.by_name.get(name) {
            return Some(vec![index]);
        }
        self.groups.get(name).cloned()
    }

    pub fn label(&self, index: usize) -> Option<&str> {
        self.labels.get(index).map(String::as_str)
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    pub fn n_classes(&self) -> usize {
        self.labels.len()
    }
}
