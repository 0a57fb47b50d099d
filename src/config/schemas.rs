//! Built-in JSON Schemas written by `troubleshoot init`.
//!
//! Operators may edit or delete the files under `<home>/schemas/`; a
//! missing schema file simply disables that gate.

use serde_json::{json, Value};

use super::layout::MailboxName;

fn collection(key: &str, item: Value) -> Value {
    json!({
        "$schema": "https://json-schema.org/draft/2020-12/schema",
        "type": "object",
        "required": [key],
        "additionalProperties": false,
        "properties": {
            key: {"type": "array", "items": item}
        }
    })
}

fn request_item(field: &str) -> Value {
    json!({
        "type": "object",
        "required": ["requestId", field],
        "additionalProperties": false,
        "properties": {
            "requestId": {"type": "integer", "minimum": 0},
            field: {"type": "string", "minLength": 1}
        }
    })
}

fn response_item(payload_field: &str, payload: Value) -> Value {
    json!({
        "type": "object",
        "required": ["requestId", "status"],
        "additionalProperties": false,
        "properties": {
            "requestId": {"type": "integer", "minimum": 0},
            "status": {"enum": ["OK", "ERROR"]},
            payload_field: payload
        },
        "if": {"properties": {"status": {"const": "OK"}}},
        "then": {"required": [payload_field]}
    })
}

/// Schema of one mailbox document
pub fn mailbox_schema(name: MailboxName) -> Value {
    match name {
        MailboxName::SimilarProblemRequests => {
            collection("requests", request_item("problemDescription"))
        }
        MailboxName::SimilarProblemResponses => collection(
            "responses",
            response_item(
                "problemsIds",
                json!({"type": "array", "items": {"type": "string"}}),
            ),
        ),
        MailboxName::SolutionRequests => collection("requests", request_item("problemId")),
        MailboxName::SolutionResponses => collection(
            "responses",
            response_item("solutionDescription", json!({"type": "string"})),
        ),
        MailboxName::NewRecords => collection(
            "records",
            json!({
                "type": "object",
                "required": [
                    "problemDescription",
                    "solutionDescription",
                    "isSolutionManual",
                    "totalPresentedSolutions"
                ],
                "additionalProperties": false,
                "properties": {
                    "problemDescription": {"type": "string", "minLength": 1},
                    "solutionDescription": {"type": "string"},
                    "isSolutionManual": {"type": "boolean"},
                    "solutionIndex": {"type": "integer", "minimum": 1},
                    "totalPresentedSolutions": {"type": "integer", "minimum": 0}
                }
            }),
        ),
        MailboxName::PerformanceReports => collection(
            "reports",
            json!({
                "type": "object",
                "required": ["isManual", "totalPresented", "solutionIndex"],
                "additionalProperties": false,
                "properties": {
                    "isManual": {"type": "boolean"},
                    "totalPresented": {"type": "integer", "minimum": 0},
                    "solutionIndex": {"type": "integer", "minimum": -1}
                }
            }),
        ),
        MailboxName::IngestionRecords => collection(
            "records",
            json!({
                "type": "object",
                "required": ["id", "description", "solutionRef"],
                "additionalProperties": false,
                "properties": {
                    "id": {"type": "string", "minLength": 1},
                    "description": {"type": "string"},
                    "solutionRef": {"type": "string"}
                }
            }),
        ),
    }
}

fn period() -> Value {
    json!({"type": "integer", "minimum": 1})
}

fn percent() -> Value {
    json!({"type": "integer", "minimum": 0, "maximum": 100})
}

/// Schema of one stage configuration document, by stage name
pub fn stage_schema(stage: &str) -> Option<Value> {
    let properties = match stage {
        "repository" => json!({
            "solution_requests_period_ms": period(),
            "new_records_period_ms": period(),
            "ingestion_period_ms": period(),
            "max_problem_age_days": {"type": "integer", "minimum": 0},
            "max_records": {"type": "integer", "minimum": 1},
            "min_records": {"type": "integer", "minimum": 0},
            "banned_keywords": {"type": "array", "items": {"type": "string"}}
        }),
        "segregation" => json!({
            "period_ms": period(),
            "training_percent": percent(),
            "validation_percent": percent(),
            "test_percent": percent(),
            "seed": {"type": ["integer", "null"], "minimum": 0}
        }),
        "preparation" => json!({
            "period_ms": period()
        }),
        "training" => json!({
            "period_ms": period(),
            "min_training_pairs": {"type": "integer", "minimum": 0}
        }),
        "troubleshooting" => json!({
            "period_ms": period(),
            "max_candidates": {"type": "integer", "minimum": 1}
        }),
        "monitoring" => json!({
            "accuracy_threshold": {"type": "number", "minimum": 0, "maximum": 1}
        }),
        _ => return None,
    };

    Some(json!({
        "$schema": "https://json-schema.org/draft/2020-12/schema",
        "type": "object",
        "additionalProperties": false,
        "properties": properties
    }))
}
