//! Policy & Lifecycle Engine
//!
//! Turns a candidate proposal into exactly one of ACCEPT / SUPERSEDE /
//! REJECT / EXISTS, under optimistic concurrency control with bounded
//! retry. See the engine's evaluation algorithm for the exact sequencing;
//! this is a direct transcription of it.

use std::collections::HashSet;
use std::thread;
use std::time::Duration;

use chrono::NaiveDate;
use tracing::{info, warn};
use uuid::Uuid;

use crate::model::{AccessMode, LifecycleState, Source};
use crate::storage::{ActiveMemory, InsertMemoryInput, InsertOutcome, RetrieveQuery, Storage};

/// Lexical conflict threshold (§9 open question: kept as a compile-time
/// constant rather than a runtime setting, to keep policy decisions
/// reproducible across configuration changes).
pub const CONFLICT_OVERLAP_THRESHOLD: f64 = 0.60;

const MAX_RETRIES: u32 = 5;
const BASE_DELAY: Duration = Duration::from_millis(100);
const JITTER_MAX_MS: u64 = 50;

/// Stable, machine-parseable reason for a policy decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReasonCode {
    AcceptReasonNewFact,
    SupersedeReasonContentOverlap,
    RejectReasonPrecedenceTooLow,
    ExistsReasonExactMatch,
    ExistsReasonNativeConstraint,
}

#[derive(Debug, Clone)]
pub enum PolicyOutcome {
    Accept {
        memory_id: i64,
        reason: ReasonCode,
    },
    Supersede {
        memory_id: i64,
        superseded_id: i64,
        reason: ReasonCode,
    },
    Reject {
        reason: ReasonCode,
    },
    Exists {
        reason: ReasonCode,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    #[error("storage error: {0}")]
    Storage(#[from] crate::storage::StorageError),
    #[error("max OCC retries ({0}) exceeded")]
    MaxRetriesExceeded(u32),
}

pub type Result<T> = std::result::Result<T, PolicyError>;

/// A candidate fact proposed by a caller.
pub struct EvaluateInput<'a> {
    pub session_id: &'a str,
    pub user_id: &'a str,
    pub content: &'a str,
    pub memory_date: NaiveDate,
    pub subject: &'a str,
    pub importance: i32,
    pub access_mode: AccessMode,
    pub confidence_score: f64,
    pub source: Source,
    pub correlation_id: &'a str,
}

pub struct RetrieveInput<'a> {
    pub user_id: &'a str,
    pub query: &'a str,
    pub scope: &'a [String],
    pub state_filter: LifecycleState,
    pub limit: u32,
    /// Subjects the caller's allow-list admits for other users' `shared`
    /// rows (I5, §9 open question). Empty admits none; `["*"]` admits any.
    pub shared_allowed_subjects: &'a [String],
    pub correlation_id: &'a str,
}

pub enum RetrieveOutcome {
    Success { results: Vec<crate::storage::MemoryRecord> },
    RateLimited,
    InvalidInput { detail: String },
}

/// Thin wrapper over `Storage` implementing the evaluation and retrieval
/// algorithms. Borrows rather than owns so multiple engines (or the
/// facade) can share one `Storage` behind an `Arc`.
pub struct PolicyEngine<'a> {
    storage: &'a Storage,
}

impl<'a> PolicyEngine<'a> {
    pub fn new(storage: &'a Storage) -> Self {
        Self { storage }
    }

    /// Evaluate and, on ACCEPT/SUPERSEDE, persist a candidate fact. See
    /// module docs for the algorithm.
    pub fn evaluate_and_store(&self, input: EvaluateInput<'_>) -> Result<PolicyOutcome> {
        for attempt in 0..MAX_RETRIES {
            info!(
                correlation_id = input.correlation_id,
                user_id = input.user_id,
                subject = input.subject,
                attempt,
                "policy_evaluation_started"
            );

            let active = self.storage.get_active_memories_by_subject(
                input.session_id,
                input.user_id,
                input.subject,
            )?;

            let conflict = find_conflict(input.content, &active);

            let Some(conflict) = conflict else {
                match self.storage.insert_memory(InsertMemoryInput {
                    session_id: input.session_id,
                    user_id: input.user_id,
                    memory_date: input.memory_date,
                    subject: input.subject,
                    importance: input.importance,
                    access_mode: input.access_mode,
                    state: LifecycleState::Active,
                    supersedes_memory_id: None,
                    confidence_score: input.confidence_score,
                    source: input.source,
                    content: input.content,
                })? {
                    InsertOutcome::Inserted(memory_id) => {
                        let reason = ReasonCode::AcceptReasonNewFact;
                        self.log_decision(&input, "accept", reason, memory_id, None, None);
                        return Ok(PolicyOutcome::Accept { memory_id, reason });
                    }
                    InsertOutcome::Duplicate => {
                        let reason = ReasonCode::ExistsReasonNativeConstraint;
                        self.log_decision(&input, "exists", reason, 0, None, None);
                        return Ok(PolicyOutcome::Exists { reason });
                    }
                }
            };

            if input.content.trim() == conflict.content.trim() {
                let reason = ReasonCode::ExistsReasonExactMatch;
                self.log_decision(&input, "exists", reason, 0, Some(conflict.id), None);
                return Ok(PolicyOutcome::Exists { reason });
            }

            if incoming_loses_precedence(&input, &conflict) {
                let reason = ReasonCode::RejectReasonPrecedenceTooLow;
                self.log_decision(&input, "reject", reason, 0, Some(conflict.id), None);
                return Ok(PolicyOutcome::Reject { reason });
            }

            let mutated = self
                .storage
                .set_memory_state(conflict.id, LifecycleState::Superseded)?;
            if !mutated {
                backoff_sleep(attempt);
                continue;
            }

            match self.storage.insert_memory(InsertMemoryInput {
                session_id: input.session_id,
                user_id: input.user_id,
                memory_date: input.memory_date,
                subject: input.subject,
                importance: input.importance,
                access_mode: input.access_mode,
                state: LifecycleState::Active,
                supersedes_memory_id: Some(conflict.id),
                confidence_score: input.confidence_score,
                source: input.source,
                content: input.content,
            })? {
                InsertOutcome::Inserted(memory_id) => {
                    let reason = ReasonCode::SupersedeReasonContentOverlap;
                    self.log_decision(
                        &input,
                        "supersede",
                        reason,
                        memory_id,
                        Some(conflict.id),
                        Some(conflict.id),
                    );
                    return Ok(PolicyOutcome::Supersede {
                        memory_id,
                        superseded_id: conflict.id,
                        reason,
                    });
                }
                InsertOutcome::Duplicate => {
                    // Best-effort rollback: another writer's insert beat
                    // ours after our CAS succeeded. Restore the row we
                    // just superseded and retry fresh.
                    let _ = self.storage.set_memory_state(conflict.id, LifecycleState::Active);
                    backoff_sleep(attempt);
                    continue;
                }
            }
        }

        warn!(
            correlation_id = input.correlation_id,
            user_id = input.user_id,
            "policy_evaluation_exhausted_retries"
        );
        Err(PolicyError::MaxRetriesExceeded(MAX_RETRIES))
    }

    /// Validate, rate-limit, then delegate a retrieval to storage.
    pub fn retrieve_memory(&self, input: RetrieveInput<'_>) -> Result<RetrieveOutcome> {
        if input.user_id.trim().is_empty() {
            return Ok(RetrieveOutcome::InvalidInput {
                detail: "user_id is required".to_string(),
            });
        }

        let limit = input.limit.min(20);

        let allowed = self
            .storage
            .check_rate_limit(input.user_id, "retrieve_memory", 50, 60)?;
        if !allowed {
            warn!(
                correlation_id = input.correlation_id,
                user_id = input.user_id,
                "rate_limit_exceeded"
            );
            return Ok(RetrieveOutcome::RateLimited);
        }

        let started = std::time::Instant::now();
        let results = self.storage.retrieve_memories(RetrieveQuery {
            user_id: input.user_id,
            query_substring: input.query,
            scope: input.scope,
            state_filter: input.state_filter,
            limit,
            shared_allowed_subjects: input.shared_allowed_subjects,
        })?;

        info!(
            correlation_id = input.correlation_id,
            user_id = input.user_id,
            result_ids = ?results.iter().map(|r| r.id).collect::<Vec<_>>(),
            duration_ms = started.elapsed().as_millis() as u64,
            "memory_retrieved_event"
        );

        Ok(RetrieveOutcome::Success { results })
    }

    #[allow(clippy::too_many_arguments)]
    fn log_decision(
        &self,
        input: &EvaluateInput<'_>,
        decision: &str,
        reason: ReasonCode,
        new_id: i64,
        conflicting_id: Option<i64>,
        supersedes_id: Option<i64>,
    ) {
        info!(
            correlation_id = input.correlation_id,
            user_id = input.user_id,
            session_id = input.session_id,
            policy_decision = decision,
            reason_code = ?reason,
            conflicting_id = conflicting_id,
            supersedes_id = supersedes_id,
            new_id = (new_id != 0).then_some(new_id),
            "policy_resolution_decided"
        );
    }
}

/// `|words(A) ∩ words(B)| / min(|A|, |B|) >= threshold`. Empty word sets
/// never collide. First colliding memory by scan order (ascending id, per
/// the storage layer's contract) wins.
fn find_conflict<'a>(content: &str, active: &'a [ActiveMemory]) -> Option<&'a ActiveMemory> {
    let incoming_words = word_set(content);
    if incoming_words.is_empty() {
        return None;
    }

    active.iter().find(|candidate| {
        let existing_words = word_set(&candidate.content);
        if existing_words.is_empty() {
            return false;
        }
        let overlap = incoming_words.intersection(&existing_words).count();
        let denom = incoming_words.len().min(existing_words.len());
        (overlap as f64 / denom as f64) >= CONFLICT_OVERLAP_THRESHOLD
    })
}

fn word_set(content: &str) -> HashSet<String> {
    content
        .to_lowercase()
        .split_whitespace()
        .map(str::to_string)
        .collect()
}

/// `incoming.source_weight < existing.source_weight OR (equal weight AND
/// incoming.confidence < existing.confidence)`.
fn incoming_loses_precedence(incoming: &EvaluateInput<'_>, existing: &ActiveMemory) -> bool {
    let incoming_weight = incoming.source.weight();
    let existing_weight = existing.source.weight();

    incoming_weight < existing_weight
        || (incoming_weight == existing_weight && incoming.confidence_score < existing.confidence_score)
}

fn backoff_sleep(attempt: u32) {
    let base = BASE_DELAY * 2u32.pow(attempt);
    let jitter = Duration::from_millis(fastrand::u64(0..=JITTER_MAX_MS));
    thread::sleep(base + jitter);
}

/// Generate a fresh correlation id for a single evaluation or retrieval.
pub fn new_correlation_id() -> String {
    Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Storage;
    use std::sync::Arc;

    fn test_storage() -> (tempfile::TempDir, Storage) {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(Some(dir.path().join("test.db"))).unwrap();
        (dir, storage)
    }

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 1, 1).unwrap()
    }

    #[test]
    fn clean_accept() {
        let (_dir, storage) = test_storage();
        let engine = PolicyEngine::new(&storage);
        let outcome = engine
            .evaluate_and_store(EvaluateInput {
                session_id: "s1",
                user_id: "u1",
                content: "User loves Python",
                memory_date: date(),
                subject: "Pref",
                importance: 4,
                access_mode: AccessMode::Private,
                confidence_score: 0.6,
                source: Source::Inferred,
                correlation_id: "c1",
            })
            .unwrap();

        assert!(matches!(outcome, PolicyOutcome::Accept { .. }));
    }

    #[test]
    fn overlap_supersedes_at_equal_precedence() {
        let (_dir, storage) = test_storage();
        let engine = PolicyEngine::new(&storage);
        let first = engine
            .evaluate_and_store(EvaluateInput {
                session_id: "s1",
                user_id: "u1",
                content: "User loves Python",
                memory_date: date(),
                subject: "Pref",
                importance: 4,
                access_mode: AccessMode::Private,
                confidence_score: 0.6,
                source: Source::Inferred,
                correlation_id: "c1",
            })
            .unwrap();
        let PolicyOutcome::Accept { memory_id: m1, .. } = first else {
            panic!("expected accept");
        };

        let second = engine
            .evaluate_and_store(EvaluateInput {
                session_id: "s1",
                user_id: "u1",
                content: "User loves Python for backend",
                memory_date: date(),
                subject: "Pref",
                importance: 4,
                access_mode: AccessMode::Private,
                confidence_score: 0.6,
                source: Source::Inferred,
                correlation_id: "c2",
            })
            .unwrap();

        match second {
            PolicyOutcome::Supersede { superseded_id, .. } => assert_eq!(superseded_id, m1),
            other => panic!("expected supersede, got {other:?}"),
        }
    }

    #[test]
    fn lower_confidence_rejected() {
        let (_dir, storage) = test_storage();
        let engine = PolicyEngine::new(&storage);
        engine
            .evaluate_and_store(EvaluateInput {
                session_id: "s1",
                user_id: "u1",
                content: "User loves Python",
                memory_date: date(),
                subject: "Pref",
                importance: 4,
                access_mode: AccessMode::Private,
                confidence_score: 0.6,
                source: Source::Inferred,
                correlation_id: "c1",
            })
            .unwrap();

        let outcome = engine
            .evaluate_and_store(EvaluateInput {
                session_id: "s1",
                user_id: "u1",
                content: "User loves Python and backend",
                memory_date: date(),
                subject: "Pref",
                importance: 4,
                access_mode: AccessMode::Private,
                confidence_score: 0.4,
                source: Source::Inferred,
                correlation_id: "c2",
            })
            .unwrap();

        assert!(matches!(
            outcome,
            PolicyOutcome::Reject {
                reason: ReasonCode::RejectReasonPrecedenceTooLow
            }
        ));
    }

    #[test]
    fn manual_beats_inferred() {
        let (_dir, storage) = test_storage();
        let engine = PolicyEngine::new(&storage);
        engine
            .evaluate_and_store(EvaluateInput {
                session_id: "s1",
                user_id: "u1",
                content: "User loves Python",
                memory_date: date(),
                subject: "Pref",
                importance: 4,
                access_mode: AccessMode::Private,
                confidence_score: 0.6,
                source: Source::Inferred,
                correlation_id: "c1",
            })
            .unwrap();

        let outcome = engine
            .evaluate_and_store(EvaluateInput {
                session_id: "s1",
                user_id: "u1",
                content: "User absolutely prefers Python",
                memory_date: date(),
                subject: "Pref",
                importance: 4,
                access_mode: AccessMode::Private,
                confidence_score: 1.0,
                source: Source::Manual,
                correlation_id: "c2",
            })
            .unwrap();

        assert!(matches!(outcome, PolicyOutcome::Supersede { .. }));
    }

    #[test]
    fn inferred_cannot_beat_manual() {
        let (_dir, storage) = test_storage();
        let engine = PolicyEngine::new(&storage);
        engine
            .evaluate_and_store(EvaluateInput {
                session_id: "s1",
                user_id: "u1",
                content: "User absolutely prefers Python",
                memory_date: date(),
                subject: "Pref",
                importance: 4,
                access_mode: AccessMode::Private,
                confidence_score: 1.0,
                source: Source::Manual,
                correlation_id: "c1",
            })
            .unwrap();

        let outcome = engine
            .evaluate_and_store(EvaluateInput {
                session_id: "s1",
                user_id: "u1",
                content: "User prefers Python and Rust",
                memory_date: date(),
                subject: "Pref",
                importance: 4,
                access_mode: AccessMode::Private,
                confidence_score: 0.8,
                source: Source::Inferred,
                correlation_id: "c2",
            })
            .unwrap();

        assert!(matches!(
            outcome,
            PolicyOutcome::Reject {
                reason: ReasonCode::RejectReasonPrecedenceTooLow
            }
        ));
    }

    #[test]
    fn user_isolation() {
        let (_dir, storage) = test_storage();
        let engine = PolicyEngine::new(&storage);
        engine
            .evaluate_and_store(EvaluateInput {
                session_id: "s1",
                user_id: "userA",
                content: "secret A",
                memory_date: date(),
                subject: "Pref",
                importance: 4,
                access_mode: AccessMode::Private,
                confidence_score: 0.6,
                source: Source::Inferred,
                correlation_id: "c1",
            })
            .unwrap();
        engine
            .evaluate_and_store(EvaluateInput {
                session_id: "s1",
                user_id: "userB",
                content: "secret B",
                memory_date: date(),
                subject: "Pref",
                importance: 4,
                access_mode: AccessMode::Private,
                confidence_score: 0.6,
                source: Source::Inferred,
                correlation_id: "c2",
            })
            .unwrap();

        let RetrieveOutcome::Success { results } = engine
            .retrieve_memory(RetrieveInput {
                user_id: "userA",
                query: "",
                scope: &["*".to_string()],
                state_filter: LifecycleState::Active,
                limit: 20,
                shared_allowed_subjects: &[],
                correlation_id: "c3",
            })
            .unwrap()
        else {
            panic!("expected success");
        };

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].content, "secret A");
    }

    #[test]
    fn shared_memory_visible_when_subject_allowed() {
        let (_dir, storage) = test_storage();
        let engine = PolicyEngine::new(&storage);
        engine
            .evaluate_and_store(EvaluateInput {
                session_id: "s1",
                user_id: "userA",
                content: "Team standup is at 9am",
                memory_date: date(),
                subject: "Schedule",
                importance: 4,
                access_mode: AccessMode::Shared,
                confidence_score: 0.6,
                source: Source::Inferred,
                correlation_id: "c1",
            })
            .unwrap();

        let RetrieveOutcome::Success { results } = engine
            .retrieve_memory(RetrieveInput {
                user_id: "userB",
                query: "",
                scope: &["*".to_string()],
                state_filter: LifecycleState::Active,
                limit: 20,
                shared_allowed_subjects: &["Schedule".to_string()],
                correlation_id: "c2",
            })
            .unwrap()
        else {
            panic!("expected success");
        };
        assert_eq!(results.len(), 1);

        let RetrieveOutcome::Success { results: unauthorized } = engine
            .retrieve_memory(RetrieveInput {
                user_id: "userB",
                query: "",
                scope: &["*".to_string()],
                state_filter: LifecycleState::Active,
                limit: 20,
                shared_allowed_subjects: &["Hobbies".to_string()],
                correlation_id: "c3",
            })
            .unwrap()
        else {
            panic!("expected success");
        };
        assert!(unauthorized.is_empty());
    }

    #[test]
    fn concurrent_identical_flood_yields_one_accept() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(Storage::new(Some(dir.path().join("test.db"))).unwrap());

        let handles: Vec<_> = (0..20)
            .map(|i| {
                let storage = Arc::clone(&storage);
                thread::spawn(move || {
                    let engine = PolicyEngine::new(&storage);
                    engine
                        .evaluate_and_store(EvaluateInput {
                            session_id: "s1",
                            user_id: "u1",
                            content: "User loves Python",
                            memory_date: date(),
                            subject: "Pref",
                            importance: 4,
                            access_mode: AccessMode::Private,
                            confidence_score: 0.6,
                            source: Source::Inferred,
                            correlation_id: &format!("flood-{i}"),
                        })
                        .unwrap()
                })
            })
            .collect();

        let outcomes: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        let accepts = outcomes
            .iter()
            .filter(|o| matches!(o, PolicyOutcome::Accept { .. }))
            .count();
        let exists = outcomes
            .iter()
            .filter(|o| matches!(o, PolicyOutcome::Exists { .. }))
            .count();

        assert_eq!(accepts, 1);
        assert_eq!(exists, 19);
    }
}
