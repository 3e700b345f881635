//! Clone analyzer: capture a live instance and build its clone template.

pub mod api_versions;
pub mod builder;
pub mod dependencies;
pub mod enumerator;
#[cfg(any(test, feature = "test-util"))]
pub mod fixtures;
pub mod version;

use aioclone_arm::ArmClient;
use aioclone_common::Result;
use aioclone_template::Template;
use tracing::info;

pub use builder::{build_graph, build_parameters, build_template};
pub use enumerator::{ClusterExtensions, ExtensionKind, InstanceCapture, ResourceEnumerator};
pub use version::{VersionGuru, VersionInfo};

/// Options for [`analyze_instance`].
#[derive(Debug, Clone, Copy, Default)]
pub struct AnalyzeOptions {
    /// Let an unsupported instance version through with a warning.
    pub force: bool,
}

/// Result of analysis: the capture and the template built from it.
#[derive(Debug, Clone)]
pub struct Analysis {
    pub capture: InstanceCapture,
    pub template: Template,
}

impl Analysis {
    pub fn instance_name(&self) -> &str {
        &self.capture.instance.name
    }

    /// Identities that need federated credentials on the target cluster.
    pub fn user_assigned_identities(&self) -> &[String] {
        &self.capture.user_assigned_identities
    }
}

/// Run the full analysis pipeline on a source instance.
pub async fn analyze_instance(
    arm: &ArmClient,
    resource_group: &str,
    instance_name: &str,
    options: AnalyzeOptions,
) -> Result<Analysis> {
    // Step 1: Walk the source instance
    let capture = ResourceEnumerator::new(arm, VersionGuru::new(options.force))
        .enumerate(resource_group, instance_name)
        .await?;

    // Step 2: Build and validate the template
    let template = build_template(&capture)?;
    info!(
        "Built clone template with {} top-level resource(s)",
        template.resources.len()
    );

    Ok(Analysis { capture, template })
}
