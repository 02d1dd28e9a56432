//! Settings loading: JSON file defaults overlaid with DB-backed overrides.
//!
//! File defaults are read once by the caller and passed in; overrides are
//! read fresh from storage on every call site that needs them, since the
//! embedded database makes that cheap and overrides are expected to change
//! at runtime (e.g. via the admin CLI).

use std::collections::HashMap;
use std::path::Path;

use serde_json::Value;

use crate::storage::{Result, Storage};

/// Resolved settings: file defaults with DB overrides layered on top,
/// last-writer-wins.
#[derive(Debug, Clone, Default)]
pub struct Settings {
    values: HashMap<String, String>,
}

impl Settings {
    /// Load the JSON file at `path` (missing file treated as empty
    /// defaults) and overlay `settings_overrides` from storage.
    pub fn load(path: Option<&Path>, storage: &Storage) -> Result<Self> {
        let mut values = HashMap::new();

        if let Some(path) = path
            && let Ok(text) = std::fs::read_to_string(path)
            && let Ok(Value::Object(map)) = serde_json::from_str::<Value>(&text)
        {
            for (key, value) in map {
                values.insert(key, stringify(&value));
            }
        }

        for (key, value) in storage.get_all_overrides()? {
            values.insert(key, value);
        }

        Ok(Self { values })
    }

    /// `memory_extraction_threshold`, parsed tolerantly as `f64`. Any
    /// missing or malformed value defaults to 3.0 rather than erroring —
    /// the facade's gate is best-effort, not a hard dependency on
    /// well-formed config.
    pub fn memory_extraction_threshold(&self) -> f64 {
        self.values
            .get("memory_extraction_threshold")
            .and_then(|v| v.parse::<f64>().ok())
            .unwrap_or(3.0)
    }

    /// `allowed_subjects`, as a list of strings or a JSON-encoded string
    /// containing such a list. Defaults to `["*"]` (allow any subject) on
    /// anything malformed.
    pub fn allowed_subjects(&self) -> Vec<String> {
        let Some(raw) = self.values.get("allowed_subjects") else {
            return vec!["*".to_string()];
        };

        if let Ok(Value::Array(items)) = serde_json::from_str::<Value>(raw) {
            let subjects: Vec<String> = items
                .into_iter()
                .filter_map(|v| v.as_str().map(crate::model::normalize_subject))
                .collect();
            if !subjects.is_empty() {
                return subjects;
            }
        }

        vec!["*".to_string()]
    }
}

fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_storage() -> (tempfile::TempDir, Storage) {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(Some(dir.path().join("test.db"))).unwrap();
        (dir, storage)
    }

    #[test]
    fn defaults_when_nothing_set() {
        let (_dir, storage) = test_storage();
        let settings = Settings::load(None, &storage).unwrap();
        assert_eq!(settings.memory_extraction_threshold(), 3.0);
        assert_eq!(settings.allowed_subjects(), vec!["*".to_string()]);
    }

    #[test]
    fn db_override_wins() {
        let (_dir, storage) = test_storage();
        storage
            .set_setting_override("memory_extraction_threshold", "2.0")
            .unwrap();
        let settings = Settings::load(None, &storage).unwrap();
        assert_eq!(settings.memory_extraction_threshold(), 2.0);
    }

    #[test]
    fn allowed_subjects_from_json_array() {
        let (_dir, storage) = test_storage();
        storage
            .set_setting_override("allowed_subjects", r#"["work", "food"]"#)
            .unwrap();
        let settings = Settings::load(None, &storage).unwrap();
        assert_eq!(settings.allowed_subjects(), vec!["Work", "Food"]);
    }
}
