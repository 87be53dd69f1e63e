//! GraphQL request and response types

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Field carrying the hub URL in a subscription registration response
pub const STREAM_URL_FIELD: &str = "mercureUrl";

/// A GraphQL request body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphQlRequest {
    pub query: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variables: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation_name: Option<String>,
}

impl GraphQlRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            variables: None,
            operation_name: None,
        }
    }

    pub fn with_variables(mut self, variables: Value) -> Self {
        self.variables = Some(variables);
        self
    }

    pub fn with_operation_name(mut self, name: impl Into<String>) -> Self {
        self.operation_name = Some(name.into());
        self
    }
}

/// One entry of a response's `errors` list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphQlError {
    pub message: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<Vec<Value>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extensions: Option<Value>,
}

impl GraphQlError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            path: None,
            extensions: None,
        }
    }
}

/// A GraphQL response body
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct GraphQlResponse {
    #[serde(default)]
    pub data: Option<Map<String, Value>>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<GraphQlError>,
}

/// The accumulated result of a subscription
///
/// Starts as the registration response and absorbs one patch per update.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SubscriptionResult {
    pub data: Map<String, Value>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<GraphQlError>,
}

impl SubscriptionResult {
    /// Current value of one selection
    pub fn selection(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    /// Shallow-merge `patch` into the object at `data[key]`.
    ///
    /// Patch keys overwrite, other keys and selections are left alone.
    /// Returns false when either side is not a JSON object.
    pub fn merge_patch(&mut self, key: &str, patch: &Value) -> bool {
        let Some(patch) = patch.as_object() else {
            return false;
        };
        let Some(Value::Object(target)) = self.data.get_mut(key) else {
            return false;
        };
        for (field, value) in patch {
            target.insert(field.clone(), value.clone());
        }
        true
    }
}
