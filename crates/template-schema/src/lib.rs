//! Template schema definitions for the clone engine.
//!
//! This crate defines the captured-resource envelope, the symbolic
//! resource graph produced by analysis, and the ARM template it emits.

pub mod container;
pub mod resource;
pub mod schema;
pub mod template;
pub mod validation;

pub use container::{
    chunk_count, deployment_name, last_chunk_key, Container, DeploymentContainer,
    ResourceContainer, SymbolicGraph, CHUNK_LEN, NESTED_DEPLOYMENT_API_VERSION,
};
pub use resource::{CapturedResource, ExtendedLocation, CUSTOM_LOCATION_REF};
pub use template::{
    wrap_parameter_values, ParameterDef, ParameterType, Template, TemplateMetadata,
    DEPLOYMENTS_TYPE, SHARED_PARAMETERS,
};
pub use validation::{validate_template, validate_template_value, ValidationResult};
