//! Microsoft Graph lookups.

use crate::client::ArmClient;
use crate::credential::GRAPH_AUDIENCE;
use crate::transport::Method;
use aioclone_common::{Error, Result};
use serde::Deserialize;
use tracing::debug;

/// Application id of the Kubernetes Bridge first-party app.
pub const K8_BRIDGE_APP_ID: &str = "319f651f-7ddb-4fc6-9857-7aef9250bd05";

/// The fields of a service principal the engine reads.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServicePrincipal {
    pub id: String,
    pub app_id: String,
    #[serde(default)]
    pub display_name: Option<String>,
}

/// Microsoft Graph client sharing the ARM client's transport and retry policy.
#[derive(Clone)]
pub struct GraphClient {
    arm: ArmClient,
}

impl GraphClient {
    pub fn new(arm: ArmClient) -> Self {
        Self { arm }
    }

    /// Resolve a service principal by application id.
    pub async fn service_principal_by_app_id(&self, app_id: &str) -> Result<ServicePrincipal> {
        let url = format!(
            "{}/v1.0/servicePrincipals(appId='{}')",
            self.arm.env().graph_endpoint.trim_end_matches('/'),
            app_id
        );
        let response = self
            .arm
            .send(Method::Get, &url, None, GRAPH_AUDIENCE)
            .await?;

        match response.status {
            404 => Err(Error::NotFound(format!(
                "Service principal for app {} was not found.",
                app_id
            ))),
            s if (200..300).contains(&s) => {
                let sp: ServicePrincipal =
                    serde_json::from_value(response.body.unwrap_or_default())?;
                debug!("Resolved service principal {} for app {}", sp.id, app_id);
                Ok(sp)
            }
            s => Err(Error::provider(s, response.body)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{mock_env, MockTransport};
    use aioclone_common::ErrorKind;
    use serde_json::json;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_lookup_k8_bridge() {
        let transport = Arc::new(MockTransport::new());
        transport.on(
            Method::Get,
            "servicePrincipals(appId='319f651f",
            200,
            json!({"id": "sp-object", "appId": K8_BRIDGE_APP_ID, "displayName": "K8 Bridge"}),
        );
        let graph = GraphClient::new(ArmClient::new(mock_env(transport.clone())));

        let sp = graph.service_principal_by_app_id(K8_BRIDGE_APP_ID).await.unwrap();
        assert_eq!(sp.id, "sp-object");
        assert!(transport.requests()[0]
            .url
            .starts_with("https://graph.microsoft.com/v1.0/servicePrincipals"));
    }

    #[tokio::test]
    async fn test_unauthorized_surfaces_provider_error() {
        let transport = Arc::new(MockTransport::new());
        transport.on(
            Method::Get,
            "servicePrincipals",
            401,
            json!({"error": {"code": "Authorization_RequestDenied", "message": "Insufficient privileges"}}),
        );
        let graph = GraphClient::new(ArmClient::new(mock_env(transport)));

        let err = graph
            .service_principal_by_app_id(K8_BRIDGE_APP_ID)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Provider);
        assert_eq!(err.to_string(), "Insufficient privileges");
    }
}
