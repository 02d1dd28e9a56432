//! `store_memory` tool: propose a fact for a user, subject to the policy
//! engine's accept/supersede/reject/exists resolution.

use std::sync::Arc;

use memlock_core::facade::{MemoryFacade, StoreMemoryInput};
use memlock_core::model::AccessMode;
use serde::Deserialize;
use serde_json::{Value, json};

use crate::protocol::messages::ToolDescription;

pub fn description() -> ToolDescription {
    ToolDescription {
        name: "store_memory".to_string(),
        description: Some(
            "Propose a fact to remember about a user. The policy engine accepts it as a new \
             memory, supersedes a conflicting prior memory, rejects it, or reports that it \
             already exists."
                .to_string(),
        ),
        input_schema: json!({
            "type": "object",
            "properties": {
                "content": {
                    "type": "string",
                    "description": "The fact to remember, in natural language."
                },
                "memoryDate": {
                    "type": "string",
                    "description": "The date the fact pertains to, as YYYY-MM-DD."
                },
                "subject": {
                    "type": "string",
                    "description": "A short subject/category for the fact, e.g. 'Preferences'."
                },
                "importance": {
                    "type": "integer",
                    "description": "Importance on a 1-5 scale; memories below the configured threshold are not stored."
                },
                "sessionId": {
                    "type": "string",
                    "description": "The conversation session this fact was observed in."
                },
                "userId": {
                    "type": "string",
                    "description": "The user this fact is about."
                },
                "accessMode": {
                    "type": "string",
                    "enum": ["private", "shared"],
                    "description": "Whether this memory may be retrieved by other users with the subject in their allow-list. Defaults to private."
                }
            },
            "required": ["content", "memoryDate", "subject", "importance", "userId"]
        }),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoreMemoryArgs {
    content: String,
    memory_date: String,
    subject: String,
    importance: i32,
    #[serde(default)]
    session_id: String,
    user_id: String,
    #[serde(default = "default_access_mode")]
    access_mode: String,
}

fn default_access_mode() -> String {
    "private".to_string()
}

pub async fn execute(facade: &Arc<MemoryFacade>, args: Option<Value>) -> Result<Value, String> {
    let args: StoreMemoryArgs = match args {
        Some(v) => serde_json::from_value(v).map_err(|e| format!("Invalid arguments: {e}"))?,
        None => return Err("Missing arguments".to_string()),
    };

    let access_mode: AccessMode = args
        .access_mode
        .parse()
        .map_err(|_| format!("Invalid accessMode: {}", args.access_mode))?;

    let facade = Arc::clone(facade);
    let content = args.content;
    let memory_date = args.memory_date;
    let subject = args.subject;
    let session_id = args.session_id;
    let user_id = args.user_id;

    let outcome = tokio::task::spawn_blocking(move || {
        facade.store_memory(StoreMemoryInput {
            content: &content,
            memory_date: &memory_date,
            subject: &subject,
            importance: args.importance,
            session_id: &session_id,
            user_id: &user_id,
            access_mode,
        })
    })
    .await
    .map_err(|e| format!("store_memory task panicked: {e}"))?;

    serde_json::to_value(outcome).map_err(|e| format!("Failed to serialize result: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use memlock_core::Storage;

    fn test_facade() -> (tempfile::TempDir, Arc<MemoryFacade>) {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(Storage::new(Some(dir.path().join("test.db"))).unwrap());
        (dir, Arc::new(MemoryFacade::new(storage, None)))
    }

    #[tokio::test]
    async fn missing_arguments_is_error() {
        let (_dir, facade) = test_facade();
        let result = execute(&facade, None).await;
        assert_eq!(result.unwrap_err(), "Missing arguments");
    }

    #[tokio::test]
    async fn accepts_a_new_fact() {
        let (_dir, facade) = test_facade();
        let result = execute(
            &facade,
            Some(json!({
                "content": "User loves Rust",
                "memoryDate": "2026-01-01",
                "subject": "Preferences",
                "importance": 5,
                "userId": "u1"
            })),
        )
        .await
        .unwrap();
        assert_eq!(result["status"], "success");
        assert_eq!(result["stored"], true);
    }

    #[tokio::test]
    async fn invalid_access_mode_is_error() {
        let (_dir, facade) = test_facade();
        let result = execute(
            &facade,
            Some(json!({
                "content": "User loves Rust",
                "memoryDate": "2026-01-01",
                "subject": "Preferences",
                "importance": 5,
                "userId": "u1",
                "accessMode": "public"
            })),
        )
        .await;
        assert!(result.is_err());
    }
}
