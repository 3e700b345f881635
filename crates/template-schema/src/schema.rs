//! JSON schema for emitted root templates.

/// JSON Schema for the root clone template.
pub const TEMPLATE_SCHEMA: &str = r#"{
  "$schema": "http://json-schema.org/draft-07/schema#",
  "title": "AIO Clone Template",
  "type": "object",
  "required": ["$schema", "languageVersion", "contentVersion", "metadata", "parameters", "resources"],
  "properties": {
    "$schema": {
      "type": "string",
      "pattern": "deploymentTemplate\\.json#$"
    },
    "languageVersion": { "const": "2.0" },
    "contentVersion": {
      "type": "string",
      "pattern": "^\\d+\\.\\d+\\.\\d+\\.\\d+$"
    },
    "metadata": {
      "type": "object",
      "required": ["opsCliVersion", "clonedInstanceId"],
      "properties": {
        "opsCliVersion": { "type": "string", "minLength": 1 },
        "clonedInstanceId": { "type": "string", "pattern": "^/subscriptions/" }
      }
    },
    "parameters": {
      "type": "object",
      "additionalProperties": {
        "type": "object",
        "required": ["type"],
        "properties": {
          "type": { "enum": ["string", "bool", "int", "object"] }
        }
      }
    },
    "resources": {
      "type": "object",
      "additionalProperties": {
        "type": "object",
        "required": ["type", "apiVersion", "name"],
        "properties": {
          "type": { "type": "string" },
          "apiVersion": { "type": "string" },
          "name": { "type": "string" },
          "condition": { "type": "string" },
          "dependsOn": {
            "type": "array",
            "items": { "type": "string" }
          }
        }
      }
    }
  }
}"#;

/// Get the template schema as a parsed JSON value.
pub fn template_schema() -> serde_json::Value {
    serde_json::from_str(TEMPLATE_SCHEMA).expect("Invalid template schema")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_template_schema_parses() {
        let schema = template_schema();
        assert_eq!(schema["title"], "AIO Clone Template");
    }
}
