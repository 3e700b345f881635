//! Deploying a clone template to a target cluster.

use crate::federation::{ClusterOidc, FederationReport, IdentityFederator};
use crate::pages::{split_pages, DeploymentPage};
use crate::params::ParameterOverrides;
use aioclone_analyzer::api_versions;
use aioclone_arm::{ArmClient, GraphClient, K8_BRIDGE_APP_ID};
use aioclone_common::{Error, ResourceId, Result, Timestamp};
use aioclone_template::{wrap_parameter_values, Template};
use indexmap::IndexMap;
use regex::Regex;
use serde_json::{json, Value};
use std::sync::LazyLock;
use tracing::{debug, info, warn};

const CONNECTED_CLUSTER_TYPE: &str = "Microsoft.Kubernetes/connectedClusters";
const PORTAL_DEPLOYMENT_BLADE: &str =
    "https://portal.azure.com/#blade/HubsExtension/DeploymentDetailsBlade/id/";
const BUNDLE_NAME_INSTANCE_LEN: usize = 32;

static UNSAFE_NAME_CHARS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^A-Za-z0-9_-]").unwrap());

/// `clone_<safe(instance)>_<YYYYMMDDTHHMMSS>_aio`
pub fn bundle_name(instance_name: &str, at: &Timestamp) -> String {
    let safe = UNSAFE_NAME_CHARS.replace_all(instance_name, "_");
    let safe: String = safe.chars().take(BUNDLE_NAME_INSTANCE_LEN).collect();
    format!("clone_{}_{}_aio", safe, at.to_compact())
}

/// Azure portal link for a deployment id.
pub fn portal_url(deployment_id: &str) -> String {
    let encoded: String = url::form_urlencoded::byte_serialize(deployment_id.as_bytes()).collect();
    format!("{}{}", PORTAL_DEPLOYMENT_BLADE, encoded)
}

/// How to restore.
#[derive(Debug, Clone, Default)]
pub struct RestoreOptions {
    pub target_cluster_id: String,
    pub bundle_name: String,
    pub overrides: ParameterOverrides,
    pub use_self_hosted_issuer: bool,
    pub skip_role_assignments: bool,
    pub skip_identity_federation: bool,
}

/// A page that was deployed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmittedDeployment {
    pub name: String,
    pub id: String,
    pub portal_url: String,
}

/// Result of a restore.
#[derive(Debug, Clone, Default)]
pub struct RestoreOutcome {
    pub bundle_name: String,
    pub deployments: Vec<SubmittedDeployment>,
    pub federation: Option<FederationReport>,
    /// Whether role assignments were deployed.
    pub role_assignments_applied: bool,
}

/// Runs the deployment protocol against a target cluster.
pub struct RestoreDriver<'a> {
    arm: &'a ArmClient,
}

impl<'a> RestoreDriver<'a> {
    pub fn new(arm: &'a ArmClient) -> Self {
        Self { arm }
    }

    /// Deploy `template` to the cluster in `options`, federating
    /// `identities` first.
    pub async fn restore(
        &self,
        template: &Template,
        identities: &[String],
        options: &RestoreOptions,
    ) -> Result<RestoreOutcome> {
        // Step 1: Check inputs before touching anything
        let cluster_id: ResourceId = options.target_cluster_id.parse()?;
        if !cluster_id
            .full_type()
            .eq_ignore_ascii_case(CONNECTED_CLUSTER_TYPE)
        {
            return Err(Error::Validation(format!(
                "Target {} is not a connected cluster.",
                options.target_cluster_id
            )));
        }
        let mut parameters = options.overrides.resolve(template)?;
        if template.parameters.contains_key("clusterName") && !parameters.contains_key("clusterName")
        {
            parameters.insert("clusterName".to_string(), json!(cluster_id.name));
        }

        // Step 2: The target cluster must be reachable through Arc
        let cluster = self
            .arm
            .get(&cluster_id.to_string(), api_versions::CONNECTED_CLUSTER)
            .await?;
        let connectivity = cluster
            .pointer("/properties/connectivityStatus")
            .and_then(Value::as_str)
            .unwrap_or_default();
        if !connectivity.eq_ignore_ascii_case("Connected") {
            return Err(Error::Validation(format!(
                "Cluster {} is not connected to Azure.",
                cluster_id.name
            )));
        }
        info!("Target cluster {} is connected", cluster_id.name);

        // Step 3: Federate captured identities with the cluster issuer
        let federation = if options.skip_identity_federation || identities.is_empty() {
            None
        } else {
            let namespace = cluster_namespace(template, &parameters)?;
            let oidc = ClusterOidc::from_cluster(&cluster_id, &cluster);
            match IdentityFederator::new(self.arm, options.use_self_hosted_issuer)
                .federate(&oidc, &namespace, identities)
                .await
            {
                Ok(report) => Some(report),
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(e) if options.skip_role_assignments => {
                    warn!("Identity federation failed, continuing without it: {}", e);
                    None
                }
                Err(e) => return Err(e),
            }
        };

        // Step 4: Decide on role assignments
        let role_assignments_applied = self
            .role_assignments_applied(template, &mut parameters, options)
            .await;

        // Step 5: Pre-flight the root page
        let pages = split_pages(template)?;
        let parameter_values = wrap_parameter_values(&parameters);
        let root_name = page_name(&options.bundle_name, 1);
        let root_id = deployment_id(&cluster_id, &root_name);
        self.what_if(&root_id, &pages[0], &parameter_values).await?;

        // Step 6: Deploy the pages in order
        let mut deployments = Vec::with_capacity(pages.len());
        for (i, page) in pages.iter().enumerate() {
            self.arm.env().check_cancelled()?;
            let name = page_name(&options.bundle_name, i + 1);
            let id = deployment_id(&cluster_id, &name);
            let link = portal_url(&id);
            info!(
                "Deploying page {}/{} as {}: {}",
                i + 1,
                pages.len(),
                name,
                link
            );
            self.deploy(&id, page, &parameter_values)
                .await
                .map_err(|e| with_portal_link(e, &link))?;
            deployments.push(SubmittedDeployment {
                name,
                id,
                portal_url: link,
            });
        }

        info!(
            "Restored {} page(s) of {} to {}",
            deployments.len(),
            options.bundle_name,
            cluster_id.name
        );
        Ok(RestoreOutcome {
            bundle_name: options.bundle_name.clone(),
            deployments,
            federation,
            role_assignments_applied,
        })
    }

    /// Force `applyRoleAssignments` off when the caller skips them or the
    /// K8 Bridge service principal cannot be resolved.
    async fn role_assignments_applied(
        &self,
        template: &Template,
        parameters: &mut IndexMap<String, Value>,
        options: &RestoreOptions,
    ) -> bool {
        if !template.parameters.contains_key("applyRoleAssignments") {
            return false;
        }
        let requested = parameters
            .get("applyRoleAssignments")
            .and_then(Value::as_bool)
            .unwrap_or(true);

        let applied = if options.skip_role_assignments || !requested {
            false
        } else {
            match GraphClient::new(self.arm.clone())
                .service_principal_by_app_id(K8_BRIDGE_APP_ID)
                .await
            {
                Ok(sp) => {
                    debug!("K8 Bridge service principal is {}", sp.id);
                    true
                }
                Err(e) => {
                    warn!(
                        "Could not resolve the K8 Bridge service principal, skipping role assignments: {}",
                        e
                    );
                    false
                }
            }
        };

        if !applied {
            parameters.insert("applyRoleAssignments".to_string(), json!(false));
        }
        applied
    }

    async fn what_if(&self, id: &str, page: &DeploymentPage, parameters: &Value) -> Result<()> {
        let lro = self
            .arm
            .post(
                &format!("{}/whatIf", id),
                api_versions::DEPLOYMENT,
                deployment_body(page, parameters)?,
            )
            .await?;
        let result = self.arm.poll(lro, self.arm.env().poll_interval).await?;

        let status = result.get("status").and_then(Value::as_str);
        if !status.is_some_and(|s| s.eq_ignore_ascii_case("Succeeded")) {
            return Err(Error::Provider {
                status: None,
                code: None,
                message: format!(
                    "What-if for the root template finished with status {}: {}",
                    status.unwrap_or("(none)"),
                    result
                ),
                body: Some(result.clone()),
            });
        }
        let changes = result
            .pointer("/properties/changes")
            .and_then(Value::as_array)
            .map(Vec::len)
            .unwrap_or(0);
        info!("What-if succeeded with {} predicted change(s)", changes);
        Ok(())
    }

    async fn deploy(&self, id: &str, page: &DeploymentPage, parameters: &Value) -> Result<Value> {
        let lro = self
            .arm
            .put(id, api_versions::DEPLOYMENT, deployment_body(page, parameters)?)
            .await?;
        self.arm.poll(lro, self.arm.env().poll_interval).await
    }
}

fn page_name(bundle_name: &str, index: usize) -> String {
    format!("{}_{}", bundle_name, index)
}

fn deployment_id(cluster_id: &ResourceId, name: &str) -> String {
    format!(
        "{}/providers/Microsoft.Resources/deployments/{}",
        cluster_id.resource_group_id(),
        name
    )
}

fn deployment_body(page: &DeploymentPage, parameters: &Value) -> Result<Value> {
    Ok(json!({
        "properties": {
            "mode": "Incremental",
            "template": serde_json::to_value(&page.template)?,
            "parameters": parameters,
        }
    }))
}

/// Namespace the service accounts live in on the target cluster.
fn cluster_namespace(template: &Template, parameters: &IndexMap<String, Value>) -> Result<String> {
    parameters
        .get("clusterNamespace")
        .or_else(|| {
            template
                .parameters
                .get("clusterNamespace")
                .and_then(|p| p.default_value.as_ref())
        })
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| {
            Error::Validation("The template does not declare a cluster namespace.".to_string())
        })
}

fn with_portal_link(err: Error, link: &str) -> Error {
    match err {
        Error::Provider {
            status,
            code,
            message,
            body,
        } => Error::Provider {
            status,
            code,
            message: format!("{} See {}", message, link),
            body,
        },
        other => other,
    }
}
