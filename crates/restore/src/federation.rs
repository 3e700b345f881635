//! Federated identity credentials for the target cluster.
//!
//! The dataflow and secret sync service accounts on the target cluster
//! authenticate as the captured user-assigned identities. Each identity
//! gets one federated credential per service account, trusting the
//! cluster's OIDC issuer.

use aioclone_analyzer::api_versions;
use aioclone_arm::ArmClient;
use aioclone_common::hash::stable_digest;
use aioclone_common::{Error, ResourceId, Result};
use serde_json::{json, Value};
use tracing::{debug, info};

/// Audience of every federated credential.
pub const TOKEN_EXCHANGE_AUDIENCE: &str = "api://AzureADTokenExchange";

/// Service accounts that need a credential, in creation order.
pub const SERVICE_ACCOUNTS: [&str; 2] = ["aio-dataflow", "aio-ssc-sa"];

const MAX_CREDENTIAL_NAME_LEN: usize = 120;

/// OIDC settings of a connected cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterOidc {
    pub cluster_name: String,
    pub resource_group: String,
    pub oidc_enabled: bool,
    pub workload_identity_enabled: bool,
    pub issuer_url: Option<String>,
    pub self_hosted_issuer_url: Option<String>,
}

impl ClusterOidc {
    /// Read the OIDC settings from a connected cluster resource.
    pub fn from_cluster(cluster_id: &ResourceId, cluster: &Value) -> Self {
        let flag = |pointer: &str| {
            cluster
                .pointer(pointer)
                .and_then(Value::as_bool)
                .unwrap_or(false)
        };
        let url = |pointer: &str| {
            cluster
                .pointer(pointer)
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };

        Self {
            cluster_name: cluster_id.name.clone(),
            resource_group: cluster_id.resource_group.clone(),
            oidc_enabled: flag("/properties/oidcIssuerProfile/enabled"),
            workload_identity_enabled: flag("/properties/securityProfile/workloadIdentity/enabled"),
            issuer_url: url("/properties/oidcIssuerProfile/issuerUrl"),
            self_hosted_issuer_url: url("/properties/oidcIssuerProfile/selfHostedIssuerUrl"),
        }
    }

    /// The issuer credentials should trust.
    pub fn issuer(&self, use_self_hosted: bool) -> Result<&str> {
        if !self.oidc_enabled || !self.workload_identity_enabled {
            return Err(Error::Validation(format!(
                "Cluster {} must have the OIDC issuer and workload identity enabled. Enable them with \
                 'az connectedk8s update --enable-oidc-issuer --enable-workload-identity -n {} -g {}'.",
                self.cluster_name, self.cluster_name, self.resource_group
            )));
        }

        let (issuer, which) = if use_self_hosted {
            (self.self_hosted_issuer_url.as_deref(), "self-hosted issuer URL")
        } else {
            (self.issuer_url.as_deref(), "OIDC issuer URL")
        };
        issuer.ok_or_else(|| {
            Error::Validation(format!(
                "Cluster {} has no {}.",
                self.cluster_name, which
            ))
        })
    }
}

/// `system:serviceaccount:<namespace>:<account>`
pub fn service_account_subject(namespace: &str, account: &str) -> String {
    format!("system:serviceaccount:{}:{}", namespace, account)
}

/// Deterministic credential name for a cluster, issuer and subject.
pub fn credential_name(cluster_name: &str, issuer: &str, subject: &str) -> String {
    let mut name = format!(
        "{}-{}",
        cluster_name,
        stable_digest(&[cluster_name, issuer, subject], 16)
    );
    name.truncate(MAX_CREDENTIAL_NAME_LEN);
    name
}

/// What federation did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FederationReport {
    /// Ids of credentials that were created or updated.
    pub created: Vec<String>,
    /// Ids of matching credentials that were already there.
    pub existing: Vec<String>,
}

/// Creates federated credentials on user-assigned identities.
pub struct IdentityFederator<'a> {
    arm: &'a ArmClient,
    use_self_hosted_issuer: bool,
}

impl<'a> IdentityFederator<'a> {
    pub fn new(arm: &'a ArmClient, use_self_hosted_issuer: bool) -> Self {
        Self {
            arm,
            use_self_hosted_issuer,
        }
    }

    /// Ensure every identity trusts both service accounts in `namespace`.
    pub async fn federate(
        &self,
        oidc: &ClusterOidc,
        namespace: &str,
        identities: &[String],
    ) -> Result<FederationReport> {
        let issuer = oidc.issuer(self.use_self_hosted_issuer)?;
        let subjects: Vec<String> = SERVICE_ACCOUNTS
            .iter()
            .map(|account| service_account_subject(namespace, account))
            .collect();

        let mut report = FederationReport::default();
        for identity in identities {
            self.arm.env().check_cancelled()?;
            let existing = self
                .arm
                .list(
                    identity,
                    "federatedIdentityCredentials",
                    api_versions::FEDERATED_CREDENTIAL,
                )
                .await?;

            for subject in &subjects {
                if let Some(found) = existing.iter().find(|c| trusts(c, issuer, subject)) {
                    debug!("Identity {} already trusts {}", identity, subject);
                    report.existing.push(
                        found
                            .get("id")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string(),
                    );
                    continue;
                }

                let id = format!(
                    "{}/federatedIdentityCredentials/{}",
                    identity,
                    credential_name(&oidc.cluster_name, issuer, subject)
                );
                let body = json!({
                    "properties": {
                        "issuer": issuer,
                        "subject": subject,
                        "audiences": [TOKEN_EXCHANGE_AUDIENCE],
                    }
                });
                self.arm
                    .put_and_wait(&id, api_versions::FEDERATED_CREDENTIAL, body)
                    .await?;
                report.created.push(id);
            }
        }

        info!(
            "Federated {} identity(ies) with {}: {} credential(s) created, {} already present",
            identities.len(),
            issuer,
            report.created.len(),
            report.existing.len()
        );
        Ok(report)
    }
}

fn trusts(credential: &Value, issuer: &str, subject: &str) -> bool {
    let field = |name: &str| {
        credential
            .pointer(&format!("/properties/{}", name))
            .and_then(Value::as_str)
            .unwrap_or_default()
    };
    field("issuer").eq_ignore_ascii_case(issuer) && field("subject").eq_ignore_ascii_case(subject)
}

#[cfg(test)]
mod tests {
    use super::*;
    use aioclone_arm::mock::{mock_env, MockTransport};
    use aioclone_arm::Method;
    use aioclone_common::ErrorKind;
    use std::sync::Arc;

    const ISSUER: &str = "https://oidc.example.com/tenant/cluster";
    const NAMESPACE: &str = "azure-iot-operations";

    fn cluster_id() -> ResourceId {
        ResourceId::new(
            "sub",
            "target-rg",
            "Microsoft.Kubernetes",
            "connectedClusters",
            "target",
        )
    }

    fn cluster(oidc: bool, workload_identity: bool) -> Value {
        json!({
            "properties": {
                "connectivityStatus": "Connected",
                "oidcIssuerProfile": {
                    "enabled": oidc,
                    "issuerUrl": ISSUER,
                    "selfHostedIssuerUrl": ""
                },
                "securityProfile": {"workloadIdentity": {"enabled": workload_identity}}
            }
        })
    }

    fn uami(name: &str) -> String {
        format!(
            "/subscriptions/sub/resourceGroups/rg/providers/Microsoft.ManagedIdentity/userAssignedIdentities/{}",
            name
        )
    }

    #[test]
    fn test_disabled_workload_identity_names_remediation() {
        let oidc = ClusterOidc::from_cluster(&cluster_id(), &cluster(true, false));
        let err = oidc.issuer(false).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(err
            .to_string()
            .contains("az connectedk8s update --enable-oidc-issuer --enable-workload-identity"));
    }

    #[test]
    fn test_issuer_selection() {
        let oidc = ClusterOidc::from_cluster(&cluster_id(), &cluster(true, true));
        assert_eq!(oidc.issuer(false).unwrap(), ISSUER);
        let err = oidc.issuer(true).unwrap_err();
        assert!(err.to_string().contains("self-hosted issuer URL"));
    }

    #[test]
    fn test_credential_name_is_stable() {
        let subject = service_account_subject(NAMESPACE, "aio-dataflow");
        assert_eq!(subject, "system:serviceaccount:azure-iot-operations:aio-dataflow");

        let name = credential_name("target", ISSUER, &subject);
        assert_eq!(name, credential_name("target", ISSUER, &subject));
        assert_eq!(name.len(), "target-".len() + 16);
        assert_ne!(
            name,
            credential_name("target", ISSUER, &service_account_subject(NAMESPACE, "aio-ssc-sa"))
        );

        let long = "c".repeat(200);
        assert_eq!(credential_name(&long, ISSUER, &subject).len(), 120);
    }

    #[tokio::test]
    async fn test_two_identities_get_two_credentials_each() {
        let transport = Arc::new(MockTransport::new());
        transport.on(Method::Get, "/federatedIdentityCredentials?", 200, json!({"value": []}));
        transport.on(Method::Put, "/federatedIdentityCredentials/", 200, json!({}));
        let arm = ArmClient::new(mock_env(transport.clone()));

        let oidc = ClusterOidc::from_cluster(&cluster_id(), &cluster(true, true));
        let identities = vec![uami("uami-dataflow"), uami("uami-secrets")];
        let report = IdentityFederator::new(&arm, false)
            .federate(&oidc, NAMESPACE, &identities)
            .await
            .unwrap();

        assert_eq!(report.created.len(), 4);
        assert!(report.existing.is_empty());

        let puts = transport.requests_matching(Method::Put, "/federatedIdentityCredentials/");
        assert_eq!(puts.len(), 4);
        let dataflow = service_account_subject(NAMESPACE, "aio-dataflow");
        let expected = credential_name("target", ISSUER, &dataflow);
        assert!(puts[0].url.contains("/uami-dataflow/federatedIdentityCredentials/"));
        assert!(puts[0].url.contains(&expected));
        let body = puts[0].body.as_ref().unwrap();
        assert_eq!(body["properties"]["issuer"], ISSUER);
        assert_eq!(body["properties"]["subject"], dataflow.as_str());
        assert_eq!(
            body["properties"]["audiences"],
            json!(["api://AzureADTokenExchange"])
        );
        assert!(puts[3].url.contains("/uami-secrets/"));
    }

    #[tokio::test]
    async fn test_matching_credential_is_left_alone() {
        let transport = Arc::new(MockTransport::new());
        transport.on(
            Method::Get,
            "/uami-dataflow/federatedIdentityCredentials?",
            200,
            json!({"value": [{
                "id": format!("{}/federatedIdentityCredentials/hand-made", uami("uami-dataflow")),
                "properties": {
                    "issuer": ISSUER.to_uppercase(),
                    "subject": "system:serviceaccount:azure-iot-operations:aio-dataflow"
                }
            }]}),
        );
        transport.on(Method::Put, "/federatedIdentityCredentials/", 200, json!({}));
        let arm = ArmClient::new(mock_env(transport.clone()));

        let oidc = ClusterOidc::from_cluster(&cluster_id(), &cluster(true, true));
        let report = IdentityFederator::new(&arm, false)
            .federate(&oidc, NAMESPACE, &[uami("uami-dataflow")])
            .await
            .unwrap();

        assert_eq!(report.existing.len(), 1);
        assert!(report.existing[0].ends_with("/hand-made"));
        let puts = transport.requests_matching(Method::Put, "/federatedIdentityCredentials/");
        assert_eq!(puts.len(), 1);
        assert_eq!(
            puts[0].body.as_ref().unwrap()["properties"]["subject"],
            "system:serviceaccount:azure-iot-operations:aio-ssc-sa"
        );
    }

    #[tokio::test]
    async fn test_disabled_cluster_makes_no_calls() {
        let transport = Arc::new(MockTransport::new());
        let arm = ArmClient::new(mock_env(transport.clone()));
        let oidc = ClusterOidc::from_cluster(&cluster_id(), &cluster(false, true));

        let result = IdentityFederator::new(&arm, false)
            .federate(&oidc, NAMESPACE, &[uami("uami-dataflow")])
            .await;
        assert!(result.is_err());
        assert!(transport.requests().is_empty());
    }
}
