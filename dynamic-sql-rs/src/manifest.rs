//! Toolset manifest for the dynamic SQL server

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const TEXT2SQL: &str = "text2sql";
pub const EXECUTE_GENERATED_SQL: &str = "execute_generated_sql";

/// Tool parameter definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParameterDefinition {
    pub name: String,
    #[serde(rename = "type")]
    pub param_type: String,
    pub description: String,
    pub required: bool,
}

/// Tool metadata as announced by `/api/toolset`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Vec<ParameterDefinition>,
}

fn param(name: &str, param_type: &str, description: &str, required: bool) -> ParameterDefinition {
    ParameterDefinition {
        name: name.to_string(),
        param_type: param_type.to_string(),
        description: description.to_string(),
        required,
    }
}

pub fn tool_definitions() -> Vec<ToolDefinition> {
    vec![
        ToolDefinition {
            name: TEXT2SQL.to_string(),
            description: "Generate a read-only SQL statement from a natural language question."
                .to_string(),
            parameters: vec![
                param("natural_language_query", "string", "The user's question", true),
                param("schema", "string", "Optional DB schema snapshot", false),
                param("max_results", "integer", "Advisory maximum number of results", false),
            ],
        },
        ToolDefinition {
            name: EXECUTE_GENERATED_SQL.to_string(),
            description: "Validate and execute a generated read-only SQL statement on the read-only DB."
                .to_string(),
            parameters: vec![
                param("preview_id", "string", "Preview id returned by text2sql", false),
                param("sql", "string", "Raw SQL to execute (alternative to preview_id)", false),
                param("params", "array", "Optional parameters for the SQL", false),
                param("max_results", "integer", "Maximum rows to return (server enforces cap)", false),
                param("mode", "string", "preview or execute", false),
            ],
        },
    ]
}

/// `{"tools": {name: definition}}`
pub fn toolset() -> Value {
    let tools: Map<String, Value> = tool_definitions()
        .into_iter()
        .filter_map(|tool| {
            let name = tool.name.clone();
            serde_json::to_value(tool).ok().map(|v| (name, v))
        })
        .collect();
    let mut manifest = Map::new();
    manifest.insert("tools".to_string(), Value::Object(tools));
    Value::Object(manifest)
}
