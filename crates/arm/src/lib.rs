//! Azure clients for the clone engine: ARM resources, Resource Graph,
//! Microsoft Graph, long-running operations and the shared environment.

pub mod client;
pub mod credential;
pub mod env;
pub mod graph;
pub mod lro;
#[cfg(any(test, feature = "test-util"))]
pub mod mock;
pub mod retry;
pub mod transport;

pub use client::ArmClient;
pub use credential::{AzCliCredential, StaticToken, TokenCredential};
pub use env::{Env, SessionCache};
pub use graph::{GraphClient, ServicePrincipal, K8_BRIDGE_APP_ID};
pub use lro::{Lro, LroState};
pub use retry::RetryConfig;
pub use transport::{HttpRequest, HttpResponse, Method, ReqwestTransport, Transport};
