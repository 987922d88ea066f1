use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

pub const API_VERSION: &str = "1.0.0";

#[derive(Debug, Clone, Copy)]
pub struct ContractSchema {
    pub path: &'static str,
    pub body: &'static str,
}

/// Published JSON schemas, keyed by their path relative to `openapi/`.
pub const CONTRACT_SCHEMAS: &[ContractSchema] = &[
    ContractSchema {
        path: "../contracts/v1/chat_request.schema.json",
        body: include_str!("../../../contracts/v1/chat_request.schema.json"),
    },
    ContractSchema {
        path: "../contracts/v1/chat_response.schema.json",
        body: include_str!("../../../contracts/v1/chat_response.schema.json"),
    },
    ContractSchema {
        path: "../contracts/v1/intern_record.schema.json",
        body: include_str!("../../../contracts/v1/intern_record.schema.json"),
    },
];

pub fn contract_schema(name: &str) -> Option<&'static ContractSchema> {
    CONTRACT_SCHEMAS
        .iter()
        .find(|schema| schema.path.ends_with(&format!("/{name}.schema.json")))
}

/// Inbound chat turn. `message` stays untyped so that a non-string payload
/// can be told apart from a missing one and answered with a guidance reply.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatRequest {
    #[serde(default)]
    pub message: Option<Value>,
    #[serde(default)]
    pub user_id: Option<String>,
}

impl ChatRequest {
    pub fn message_text(&self) -> Option<&str> {
        self.message.as_ref().and_then(Value::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InternRecord {
    pub cin: String,
    pub nom: String,
    pub prenom: String,
    pub email: String,
    pub telephone: String,
    pub institut: String,
    pub specialite: String,
    pub date_debut: NaiveDate,
    pub date_fin: NaiveDate,
    pub objet_stage: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    pub reply: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record: Option<InternRecord>,
    pub timestamp: String,
    pub processed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatErrorResponse {
    pub error: String,
    pub reply: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelpTopic {
    pub name: String,
    pub keywords: Vec<String>,
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelpResponse {
    pub success: bool,
    pub message: String,
    pub topics: Vec<HelpTopic>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsResponse {
    pub success: bool,
    pub total_responses: usize,
    pub contextual_rules: usize,
    pub categories: Vec<String>,
    pub last_update: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContractsMetadata {
    pub api_version: String,
    pub schemas: BTreeMap<String, String>,
}
