//! Bearer token sources.

use aioclone_common::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use std::collections::HashMap;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::debug;

/// Audience for Azure Resource Manager tokens.
pub const ARM_AUDIENCE: &str = "https://management.azure.com/";

/// Audience for Microsoft Graph tokens.
pub const GRAPH_AUDIENCE: &str = "https://graph.microsoft.com/";

/// Trait for acquiring bearer tokens.
#[async_trait]
pub trait TokenCredential: Send + Sync {
    async fn token(&self, audience: &str) -> Result<String>;
}

/// A fixed token, e.g. from `AZURE_ACCESS_TOKEN`.
///
/// Microsoft Graph requests use the separate Graph token when one is set and
/// fall back to the ARM token otherwise.
pub struct StaticToken {
    arm: String,
    graph: Option<String>,
}

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            arm: token.into(),
            graph: None,
        }
    }

    pub fn with_graph_token(mut self, token: impl Into<String>) -> Self {
        self.graph = Some(token.into());
        self
    }

    pub fn has_graph_token(&self) -> bool {
        self.graph.is_some()
    }
}

#[async_trait]
impl TokenCredential for StaticToken {
    async fn token(&self, audience: &str) -> Result<String> {
        match &self.graph {
            Some(graph) if audience == GRAPH_AUDIENCE => Ok(graph.clone()),
            _ => Ok(self.arm.clone()),
        }
    }
}

/// Tokens obtained through `az account get-access-token`.
///
/// Tokens are cached per audience until five minutes before they expire.
pub struct AzCliCredential {
    cache: Mutex<HashMap<String, (String, DateTime<Utc>)>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AzCliToken {
    access_token: String,
    #[serde(default, rename = "expires_on")]
    expires_on: Option<i64>,
}

impl AzCliCredential {
    pub fn new() -> Self {
        Self {
            cache: Mutex::new(HashMap::new()),
        }
    }

    async fn fetch(audience: &str) -> Result<(String, DateTime<Utc>)> {
        debug!("Acquiring token for {} from Azure CLI", audience);
        let output = Command::new("az")
            .args([
                "account",
                "get-access-token",
                "--resource",
                audience,
                "--output",
                "json",
            ])
            .output()
            .await
            .map_err(|e| Error::Config(format!("Failed to run Azure CLI: {}", e)))?;

        if !output.status.success() {
            return Err(Error::Config(format!(
                "Azure CLI could not provide a token: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let token: AzCliToken = serde_json::from_slice(&output.stdout)?;
        let expires_at = token
            .expires_on
            .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
            .unwrap_or_else(|| Utc::now() + Duration::minutes(30));
        Ok((token.access_token, expires_at))
    }
}

impl Default for AzCliCredential {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TokenCredential for AzCliCredential {
    async fn token(&self, audience: &str) -> Result<String> {
        let mut cache = self.cache.lock().await;
        if let Some((token, expires_at)) = cache.get(audience) {
            if *expires_at - Duration::minutes(5) > Utc::now() {
                return Ok(token.clone());
            }
        }

        let (token, expires_at) = Self::fetch(audience).await?;
        cache.insert(audience.to_string(), (token.clone(), expires_at));
        Ok(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_token_without_graph_token() {
        let cred = StaticToken::new("abc");
        assert!(!cred.has_graph_token());
        assert_eq!(cred.token(ARM_AUDIENCE).await.unwrap(), "abc");
        assert_eq!(cred.token(GRAPH_AUDIENCE).await.unwrap(), "abc");
    }

    #[tokio::test]
    async fn test_static_token_routes_graph_audience() {
        let cred = StaticToken::new("arm-token").with_graph_token("graph-token");
        assert!(cred.has_graph_token());
        assert_eq!(cred.token(ARM_AUDIENCE).await.unwrap(), "arm-token");
        assert_eq!(cred.token(GRAPH_AUDIENCE).await.unwrap(), "graph-token");
    }

    #[test]
    fn test_parse_cli_token() {
        let token: AzCliToken = serde_json::from_str(
            r#"{"accessToken": "t", "expiresOn": "2025-01-01 00:00:00.000000", "expires_on": 1735689600, "tokenType": "Bearer"}"#,
        )
        .unwrap();
        assert_eq!(token.access_token, "t");
        assert_eq!(token.expires_on, Some(1735689600));
    }
}
