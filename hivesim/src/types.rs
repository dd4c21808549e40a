use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub type SuiteID = u32;
pub type TestID = u32;

/// Suite and test registration payload. Only `name` and `description` are
/// required; the rest feeds display metadata in the result files.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestRequest {
    pub name: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub display_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub location: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub category: String,
}

/// Describes the outcome of a test.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TestResult {
    pub pass: bool,
    pub details: String,
}

/// The body of the end-test call: the mandatory summary plus optional
/// per-client verdicts keyed by container id.
#[derive(Clone, Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EndTestRequest {
    pub summary_result: TestResult,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_results: Option<BTreeMap<String, TestResult>>,
}

/// Returned by the client startup endpoint.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct StartNodeResponse {
    /// Container id.
    pub id: String,
    /// IP address in the default network.
    pub ip: String,
}

/// Returned by the node info endpoint.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct NodeResponse {
    pub id: String,
    pub name: String,
    pub ip: String,
    #[serde(default)]
    pub enode: Option<String>,
}

/// Roles and other metadata from the client's `hive.yaml`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ClientMetadata {
    pub roles: Vec<String>,
}

/// Served by the `/clients` endpoint to list the available clients.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClientDefinition {
    pub name: String,
    pub version: String,
    pub meta: ClientMetadata,
}

#[derive(Clone, Debug, Serialize)]
pub struct ExecRequest {
    pub command: Vec<String>,
}

/// Output of a command executed inside a client container.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_omits_empty_display_fields() {
        let req = TestRequest {
            name: "smoke".to_string(),
            description: "a suite".to_string(),
            ..Default::default()
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json, serde_json::json!({"name": "smoke", "description": "a suite"}));
    }

    #[test]
    fn end_test_request_wire_format() {
        let req = EndTestRequest {
            summary_result: TestResult { pass: true, details: "ok".to_string() },
            client_results: None,
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"summaryResult": {"pass": true, "details": "ok"}})
        );
    }

    #[test]
    fn exec_result_decodes_camel_case() {
        let result: ExecResult =
            serde_json::from_str(r#"{"stdout":"out","stderr":"","exitCode":3}"#).unwrap();
        assert_eq!(result.exit_code, 3);
        assert_eq!(result.stdout, "out");
    }
}
