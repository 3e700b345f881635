//! Resource provider api versions.

pub const EXTENSION: &str = "2023-05-01";
pub const CUSTOM_LOCATION: &str = "2021-08-31-preview";
pub const CONNECTED_CLUSTER: &str = "2024-07-15-preview";
pub const DEVICE_REGISTRY: &str = "2024-11-01";
pub const SECRET_SYNC: &str = "2024-08-21-preview";
pub const ROLE_ASSIGNMENT: &str = "2022-04-01";
pub const FEDERATED_CREDENTIAL: &str = "2023-01-31";

/// Top-level deployment PUTs and what-if.
pub const DEPLOYMENT: &str = "2024-03-01";

/// Instance family api versions, selected by the instance version.
pub const INSTANCE_2024_11: &str = "2024-11-01";
pub const INSTANCE_2025_04: &str = "2025-04-01";

