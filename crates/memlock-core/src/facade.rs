//! Memory Tool Facade
//!
//! Thin policy surface above the engine: subject normalization, date
//! validation, the importance/settings gate, and payload shaping. This is
//! the boundary dynamic, heterogeneously-typed LLM output is normalized at
//! — the engine underneath never sees raw extractor output.

use std::sync::Arc;

use chrono::NaiveDate;
use serde::Serialize;

use crate::model::{AccessMode, LifecycleState, Source, normalize_subject};
use crate::policy::{self, EvaluateInput, PolicyEngine, PolicyOutcome, ReasonCode, RetrieveInput, RetrieveOutcome};
use crate::settings::Settings;
use crate::storage::{MemoryRecord, Storage};

#[derive(Debug, thiserror::Error)]
pub enum FacadeError {
    #[error("invalid date: {0}")]
    InvalidDate(String),
    #[error(transparent)]
    Policy(#[from] policy::PolicyError),
    #[error(transparent)]
    Storage(#[from] crate::storage::StorageError),
}

pub struct StoreMemoryInput<'a> {
    pub content: &'a str,
    pub memory_date: &'a str,
    pub subject: &'a str,
    pub importance: i32,
    pub session_id: &'a str,
    pub user_id: &'a str,
    pub access_mode: AccessMode,
}

pub struct RetrieveMemoryInput<'a> {
    pub query: &'a str,
    pub scope: &'a [String],
    pub state_filter: &'a str,
    pub limit: u32,
    pub user_id: &'a str,
}

/// The four tool-surface outcome shapes of the external contract.
#[derive(Debug, Serialize)]
#[serde(tag = "status")]
pub enum StoreMemoryOutcome {
    #[serde(rename = "success")]
    Success {
        stored: bool,
        memory_id: i64,
        summary: String,
        reason_code: ReasonCode,
    },
    #[serde(rename = "rejected")]
    Rejected { reason: String, stored: bool },
    #[serde(rename = "exists")]
    Exists { stored: bool },
    #[serde(rename = "error")]
    Error { reason: String },
}

#[derive(Debug, Serialize)]
#[serde(tag = "status")]
pub enum RetrieveMemoryOutcome {
    #[serde(rename = "success")]
    Success {
        results: Vec<MemoryRecord>,
        result_count: usize,
    },
    #[serde(rename = "error")]
    Error { detail: String },
}

/// Facade over the policy engine; owns an `Arc<Storage>` so it's cheap to
/// clone and hand to async tool handlers.
pub struct MemoryFacade {
    storage: Arc<Storage>,
    settings_path: Option<std::path::PathBuf>,
}

impl MemoryFacade {
    pub fn new(storage: Arc<Storage>, settings_path: Option<std::path::PathBuf>) -> Self {
        Self {
            storage,
            settings_path,
        }
    }

    pub fn store_memory(&self, input: StoreMemoryInput<'_>) -> StoreMemoryOutcome {
        let memory_date = match NaiveDate::parse_from_str(input.memory_date, "%Y-%m-%d") {
            Ok(date) => date,
            Err(_) => {
                return StoreMemoryOutcome::Error {
                    reason: format!("invalid date: {}", input.memory_date),
                };
            }
        };

        let settings = match Settings::load(self.settings_path.as_deref(), &self.storage) {
            Ok(s) => s,
            Err(e) => return StoreMemoryOutcome::Error { reason: e.to_string() },
        };

        let normalized_subject = normalize_subject(input.subject);

        let threshold = settings.memory_extraction_threshold();
        if (input.importance as f64) < threshold {
            return StoreMemoryOutcome::Rejected {
                reason: "importance_below_threshold".to_string(),
                stored: false,
            };
        }

        let allowed_subjects = settings.allowed_subjects();
        let subject_allowed = allowed_subjects.iter().any(|s| s == "*")
            || allowed_subjects.iter().any(|s| s == &normalized_subject);
        if !subject_allowed {
            return StoreMemoryOutcome::Rejected {
                reason: "subject_not_allowed".to_string(),
                stored: false,
            };
        }

        let correlation_id = policy::new_correlation_id();
        let engine = PolicyEngine::new(&self.storage);

        let result = engine.evaluate_and_store(EvaluateInput {
            session_id: input.session_id,
            user_id: input.user_id,
            content: input.content,
            memory_date,
            subject: &normalized_subject,
            importance: input.importance,
            access_mode: input.access_mode,
            confidence_score: 0.6,
            source: Source::Inferred,
            correlation_id: &correlation_id,
        });

        match result {
            Ok(PolicyOutcome::Accept { memory_id, reason }) => StoreMemoryOutcome::Success {
                stored: true,
                memory_id,
                summary: format!("Stored new memory under subject '{normalized_subject}'"),
                reason_code: reason,
            },
            Ok(PolicyOutcome::Supersede {
                memory_id, reason, ..
            }) => StoreMemoryOutcome::Success {
                stored: true,
                memory_id,
                summary: format!("Superseded prior memory under subject '{normalized_subject}'"),
                reason_code: reason,
            },
            Ok(PolicyOutcome::Reject { reason }) => StoreMemoryOutcome::Rejected {
                reason: format!("{reason:?}"),
                stored: false,
            },
            Ok(PolicyOutcome::Exists { .. }) => StoreMemoryOutcome::Exists { stored: false },
            Err(e) => StoreMemoryOutcome::Error { reason: e.to_string() },
        }
    }

    pub fn retrieve_memory(&self, input: RetrieveMemoryInput<'_>) -> RetrieveMemoryOutcome {
        let settings = match Settings::load(self.settings_path.as_deref(), &self.storage) {
            Ok(s) => s,
            Err(e) => return RetrieveMemoryOutcome::Error { detail: e.to_string() },
        };

        let allowed_subjects = settings.allowed_subjects();
        let allow_all = allowed_subjects.iter().any(|s| s == "*");

        let mut final_scope = Vec::new();
        for subject in input.scope {
            let normalized = normalize_subject(subject);
            if !allow_all && !allowed_subjects.iter().any(|s| s == &normalized) {
                return RetrieveMemoryOutcome::Error {
                    detail: format!("subject '{normalized}' is not in the allowed scope"),
                };
            }
            final_scope.push(normalized);
        }
        if final_scope.is_empty() {
            final_scope.push("*".to_string());
        }

        let Ok(state_filter) = input.state_filter.parse::<LifecycleState>() else {
            return RetrieveMemoryOutcome::Error {
                detail: format!("invalid state_filter: {}", input.state_filter),
            };
        };

        let correlation_id = policy::new_correlation_id();
        let engine = PolicyEngine::new(&self.storage);

        match engine.retrieve_memory(RetrieveInput {
            user_id: input.user_id,
            query: input.query,
            scope: &final_scope,
            state_filter,
            limit: input.limit,
            shared_allowed_subjects: &allowed_subjects,
            correlation_id: &correlation_id,
        }) {
            Ok(RetrieveOutcome::Success { results }) => RetrieveMemoryOutcome::Success {
                result_count: results.len(),
                results,
            },
            Ok(RetrieveOutcome::RateLimited) => RetrieveMemoryOutcome::Error {
                detail: "Rate limit exceeded (50 requests per minute).".to_string(),
            },
            Ok(RetrieveOutcome::InvalidInput { detail }) => RetrieveMemoryOutcome::Error { detail },
            Err(e) => RetrieveMemoryOutcome::Error { detail: e.to_string() },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_facade() -> (tempfile::TempDir, MemoryFacade) {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(Storage::new(Some(dir.path().join("test.db"))).unwrap());
        (dir, MemoryFacade::new(storage, None))
    }

    #[test]
    fn importance_at_threshold_passes() {
        let (_dir, facade) = test_facade();
        let outcome = facade.store_memory(StoreMemoryInput {
            content: "User loves Python",
            memory_date: "2026-01-01",
            subject: "pref",
            importance: 3,
            session_id: "s1",
            user_id: "u1",
            access_mode: AccessMode::Private,
        });
        assert!(matches!(outcome, StoreMemoryOutcome::Success { .. }));
    }

    #[test]
    fn importance_below_threshold_rejected() {
        let (_dir, facade) = test_facade();
        let outcome = facade.store_memory(StoreMemoryInput {
            content: "User loves Python",
            memory_date: "2026-01-01",
            subject: "pref",
            importance: 2,
            session_id: "s1",
            user_id: "u1",
            access_mode: AccessMode::Private,
        });
        assert!(matches!(
            outcome,
            StoreMemoryOutcome::Rejected { reason, .. } if reason == "importance_below_threshold"
        ));
    }

    #[test]
    fn invalid_date_errors() {
        let (_dir, facade) = test_facade();
        let outcome = facade.store_memory(StoreMemoryInput {
            content: "x",
            memory_date: "01-01-2026",
            subject: "pref",
            importance: 5,
            session_id: "s1",
            user_id: "u1",
            access_mode: AccessMode::Private,
        });
        assert!(matches!(outcome, StoreMemoryOutcome::Error { .. }));
    }

    #[test]
    fn scope_wildcard_admits_any_subject() {
        let (_dir, facade) = test_facade();
        facade.store_memory(StoreMemoryInput {
            content: "User loves hiking",
            memory_date: "2026-01-01",
            subject: "hobbies",
            importance: 5,
            session_id: "s1",
            user_id: "u1",
            access_mode: AccessMode::Private,
        });

        let outcome = facade.retrieve_memory(RetrieveMemoryInput {
            query: "",
            scope: &["*".to_string()],
            state_filter: "active",
            limit: 5,
            user_id: "u1",
        });
        assert!(matches!(
            outcome,
            RetrieveMemoryOutcome::Success { result_count, .. } if result_count == 1
        ));
    }

    #[test]
    fn retrieve_limit_capped_at_20() {
        let (_dir, facade) = test_facade();
        let outcome = facade.retrieve_memory(RetrieveMemoryInput {
            query: "",
            scope: &["*".to_string()],
            state_filter: "active",
            limit: 100,
            user_id: "u1",
        });
        assert!(matches!(outcome, RetrieveMemoryOutcome::Success { .. }));
    }
}
