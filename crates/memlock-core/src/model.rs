//! Core data model: the Memory entity, its lifecycle, and precedence.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Provenance of a memory proposal. Determines precedence weight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    Manual,
    Imported,
    Inferred,
}

impl Source {
    /// Precedence weight used by the policy engine (higher wins).
    pub fn weight(&self) -> u8 {
        match self {
            Source::Manual => 3,
            Source::Imported => 2,
            Source::Inferred => 1,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Manual => "manual",
            Source::Imported => "imported",
            Source::Inferred => "inferred",
        }
    }
}

impl std::str::FromStr for Source {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manual" => Ok(Source::Manual),
            "imported" => Ok(Source::Imported),
            "inferred" => Ok(Source::Inferred),
            _ => Err(()),
        }
    }
}

/// Visibility of a memory beyond its owning user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessMode {
    Private,
    Shared,
}

impl AccessMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessMode::Private => "private",
            AccessMode::Shared => "shared",
        }
    }
}

impl std::str::FromStr for AccessMode {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "private" => Ok(AccessMode::Private),
            "shared" => Ok(AccessMode::Shared),
            _ => Err(()),
        }
    }
}

/// Position of a memory in its state machine.
///
/// Transition graph: `active -> {superseded, archived, deleted}`,
/// `superseded -> {archived, deleted}`. `archived` and `deleted` are
/// terminal (I6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Active,
    Superseded,
    Archived,
    Deleted,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Active => "active",
            LifecycleState::Superseded => "superseded",
            LifecycleState::Archived => "archived",
            LifecycleState::Deleted => "deleted",
        }
    }

    /// Whether `self -> next` is an allowed transition per I6.
    pub fn can_transition_to(&self, next: LifecycleState) -> bool {
        use LifecycleState::*;
        matches!(
            (self, next),
            (Active, Superseded) | (Active, Archived) | (Active, Deleted)
                | (Superseded, Archived) | (Superseded, Deleted)
        )
    }
}

impl std::str::FromStr for LifecycleState {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(LifecycleState::Active),
            "superseded" => Ok(LifecycleState::Superseded),
            "archived" => Ok(LifecycleState::Archived),
            "deleted" => Ok(LifecycleState::Deleted),
            _ => Err(()),
        }
    }
}

/// A factual claim about a user, as persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Memory {
    pub id: i64,
    pub session_id: String,
    pub user_id: String,
    pub memory_date: NaiveDate,
    pub subject: String,
    pub importance: i32,
    pub access_mode: AccessMode,
    pub state: LifecycleState,
    pub supersedes_memory_id: Option<i64>,
    pub confidence_score: f64,
    pub source: Source,
    pub content_hash: String,
    pub created_at: DateTime<Utc>,
}

/// A single content revision of a Memory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryVersion {
    pub id: i64,
    pub memory_id: i64,
    pub content: String,
    pub version: i32,
    pub timestamp: DateTime<Utc>,
}

/// Canonicalize a free-text subject: trim, then Title Case. Empty becomes
/// `"General"`.
pub fn normalize_subject(subject: &str) -> String {
    let trimmed = subject.trim();
    if trimmed.is_empty() {
        return "General".to_string();
    }
    trimmed
        .split_whitespace()
        .map(title_case_word)
        .collect::<Vec<_>>()
        .join(" ")
}

fn title_case_word(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + &chars.as_str().to_lowercase(),
        None => String::new(),
    }
}
