//! `retrieve_memory` tool: query the active (or otherwise-stated) facts
//! known about a user, deterministically ranked.

use std::sync::Arc;

use memlock_core::facade::{MemoryFacade, RetrieveMemoryInput};
use serde::Deserialize;
use serde_json::{Value, json};

use crate::protocol::messages::ToolDescription;

pub fn description() -> ToolDescription {
    ToolDescription {
        name: "retrieve_memory".to_string(),
        description: Some(
            "Retrieve the facts known about a user, ranked by source weight, confidence, and \
             recency. Results are scoped to the caller's user unless a memory was stored with \
             shared access and its subject is in the caller's allow-list."
                .to_string(),
        ),
        input_schema: json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "Free-text query; currently informational, does not filter results."
                },
                "scope": {
                    "type": "array",
                    "items": { "type": "string" },
                    "description": "Subjects to restrict the search to. Defaults to ['*'] (all allowed subjects)."
                },
                "stateFilter": {
                    "type": "string",
                    "enum": ["active", "superseded", "archived", "deleted"],
                    "description": "Lifecycle state to retrieve. Defaults to 'active'."
                },
                "limit": {
                    "type": "integer",
                    "description": "Maximum number of results, capped at 20."
                },
                "userId": {
                    "type": "string",
                    "description": "The user whose memories to retrieve."
                }
            },
            "required": ["userId"]
        }),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RetrieveMemoryArgs {
    #[serde(default)]
    query: String,
    #[serde(default)]
    scope: Vec<String>,
    #[serde(default = "default_state_filter")]
    state_filter: String,
    #[serde(default = "default_limit")]
    limit: u32,
    user_id: String,
}

fn default_state_filter() -> String {
    "active".to_string()
}

fn default_limit() -> u32 {
    20
}

pub async fn execute(facade: &Arc<MemoryFacade>, args: Option<Value>) -> Result<Value, String> {
    let args: RetrieveMemoryArgs = match args {
        Some(v) => serde_json::from_value(v).map_err(|e| format!("Invalid arguments: {e}"))?,
        None => return Err("Missing arguments".to_string()),
    };

    let facade = Arc::clone(facade);

    let outcome = tokio::task::spawn_blocking(move || {
        facade.retrieve_memory(RetrieveMemoryInput {
            query: &args.query,
            scope: &args.scope,
            state_filter: &args.state_filter,
            limit: args.limit,
            user_id: &args.user_id,
        })
    })
    .await
    .map_err(|e| format!("retrieve_memory task panicked: {e}"))?;

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
    async fn empty_store_returns_empty_results() {
        let (_dir, facade) = test_facade();
        let result = execute(&facade, Some(json!({"userId": "u1"}))).await.unwrap();
        assert_eq!(result["status"], "success");
        assert_eq!(result["result_count"], 0);
    }

    #[tokio::test]
    async fn invalid_state_filter_is_error_status() {
        let (_dir, facade) = test_facade();
        let result = execute(
            &facade,
            Some(json!({"userId": "u1", "stateFilter": "bogus"})),
        )
        .await
        .unwrap();
        assert_eq!(result["status"], "error");
    }
}
