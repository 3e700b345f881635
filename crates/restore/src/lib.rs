//! Emit and deploy: write clone templates to disk and restore them onto a
//! target cluster.

pub mod driver;
pub mod federation;
pub mod pages;
pub mod params;
pub mod writer;

pub use driver::{
    bundle_name, portal_url, RestoreDriver, RestoreOptions, RestoreOutcome, SubmittedDeployment,
};
pub use federation::{ClusterOidc, FederationReport, IdentityFederator};
pub use pages::{split_pages, DeploymentPage};
pub use params::ParameterOverrides;
pub use writer::{write_template, TemplateMode, WriteOptions, WrittenFiles};
