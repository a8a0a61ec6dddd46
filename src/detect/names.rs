use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{DispatchError, Result};

/// Where a detector's class names come from.
///
/// Deserializes from either a JSON array of names or a single path string.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NameSource {
    List(Vec<String>),
    File(PathBuf),
}

impl NameSource {
    pub fn from_list<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        NameSource::List(names.into_iter().map(Into::into).collect())
    }

    /// Resolve into the concrete, ordered class list. Index = class id.
    pub fn resolve(&self) -> Result<Vec<String>> {
        let names = match self {
            NameSource::List(names) => names.clone(),
            NameSource::File(path) => read_name_file(path)?,
        };
        if names.is_empty() {
            return Err(DispatchError::validation("class name list is empty"));
        }
        if names.iter().any(|name| name.trim().is_empty()) {
            return Err(DispatchError::validation("class names must be non-empty"));
        }
        Ok(names)
    }
}

fn read_name_file(path: &Path) -> Result<Vec<String>> {
    let raw = std::fs::read_to_string(path).map_err(|e| {
        DispatchError::validation(format!(
            "failed to read class names from {}: {}",
            path.display(),
            e
        ))
    })?;
    Ok(raw
        .split('\n')
        .map(|line| line.trim_end_matches('\r'))
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect())
}
