//! Typed Azure Resource Manager client.

use crate::credential::ARM_AUDIENCE;
use crate::env::Env;
use crate::lro::Lro;
use crate::retry::{is_retryable_status, parse_retry_after};
use crate::transport::{HttpRequest, HttpResponse, Method};
use aioclone_common::{Error, Result};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Api version of the Resource Graph `resources` endpoint.
pub const RESOURCE_GRAPH_API_VERSION: &str = "2022-10-01";

/// Client for ARM resource CRUD, listing, Resource Graph and LRO polling.
#[derive(Clone)]
pub struct ArmClient {
    env: Arc<Env>,
}

impl ArmClient {
    pub fn new(env: Arc<Env>) -> Self {
        Self { env }
    }

    pub fn env(&self) -> &Arc<Env> {
        &self.env
    }

    /// Absolute url for a resource id (or any ARM path) at an api version.
    pub fn resource_url(&self, path: &str, api_version: &str) -> String {
        let sep = if path.contains('?') { '&' } else { '?' };
        format!(
            "{}{}{}api-version={}",
            self.env.arm_endpoint.trim_end_matches('/'),
            path,
            sep,
            api_version
        )
    }

    /// Send a request, retrying throttling, server errors and connection
    /// failures with exponential backoff. Any other status is returned.
    pub async fn send(
        &self,
        method: Method,
        url: &str,
        body: Option<Value>,
        audience: &str,
    ) -> Result<HttpResponse> {
        let retry = &self.env.retry;
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            self.env.check_cancelled()?;

            let token = self.env.credential.token(audience).await?;
            let request = HttpRequest {
                method,
                url: url.to_string(),
                headers: vec![
                    ("Authorization".to_string(), format!("Bearer {}", token)),
                    ("CommandName".to_string(), self.env.command_name.clone()),
                    (
                        "x-ms-correlation-request-id".to_string(),
                        self.env.correlation_id.to_string(),
                    ),
                    (
                        "User-Agent".to_string(),
                        format!("aioclone/{}", env!("CARGO_PKG_VERSION")),
                    ),
                ],
                body: body.clone(),
            };

            debug!("{} {}", method, url);
            let outcome = self.env.transport.send(&request).await;

            let retry_after = match &outcome {
                Ok(response) => parse_retry_after(response.header("retry-after")),
                Err(_) => None,
            };
            match outcome {
                Ok(response) if !is_retryable_status(response.status) => return Ok(response),
                Err(e) if !matches!(e, Error::Transport(_)) => return Err(e),
                Ok(response) if attempt >= retry.max_attempts => return Ok(response),
                Err(e) if attempt >= retry.max_attempts => {
                    return Err(Error::Transport(format!("{} (after {} attempts)", e, attempt)))
                }
                Ok(response) => warn!(
                    attempt = attempt,
                    status = response.status,
                    "{} {} is retryable, backing off",
                    method,
                    url
                ),
                Err(e) => warn!(
                    attempt = attempt,
                    error = %e,
                    "{} {} failed, backing off",
                    method,
                    url
                ),
            }

            let delay = retry_after
                .map(|d| d.min(retry.max_delay))
                .unwrap_or_else(|| retry.delay_for(attempt));
            self.sleep(delay).await?;
        }
    }

    async fn sleep(&self, delay: Duration) -> Result<()> {
        tokio::select! {
            _ = self.env.cancel.cancelled() => Err(Error::Cancelled),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }

    async fn arm(&self, method: Method, url: &str, body: Option<Value>) -> Result<HttpResponse> {
        self.send(method, url, body, ARM_AUDIENCE).await
    }

    /// GET a resource; 404 maps to `NotFound`.
    pub async fn get(&self, id: &str, api_version: &str) -> Result<Value> {
        self.try_get(id, api_version)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Resource {} was not found.", id)))
    }

    /// GET a resource; 404 maps to `None`.
    pub async fn try_get(&self, id: &str, api_version: &str) -> Result<Option<Value>> {
        let response = self
            .arm(Method::Get, &self.resource_url(id, api_version), None)
            .await?;
        match response.status {
            404 => Ok(None),
            s if (200..300).contains(&s) => Ok(Some(response.body.unwrap_or(Value::Null))),
            s => Err(Error::provider(s, response.body)),
        }
    }

    /// PUT a resource body; the returned handle is polled with [`ArmClient::poll`].
    pub async fn put(&self, id: &str, api_version: &str, body: Value) -> Result<Lro> {
        let url = self.resource_url(id, api_version);
        let response = self.arm(Method::Put, &url, Some(body)).await?;
        if !response.is_success() {
            return Err(Error::provider(response.status, response.body));
        }
        Ok(Lro::from_response(response, Some(url)))
    }

    /// DELETE a resource. A missing resource is already deleted.
    pub async fn delete(&self, id: &str, api_version: &str) -> Result<Lro> {
        let url = self.resource_url(id, api_version);
        let response = self.arm(Method::Delete, &url, None).await?;
        if response.status == 404 {
            return Ok(Lro::from_response(HttpResponse::new(204, None), None));
        }
        if !response.is_success() {
            return Err(Error::provider(response.status, response.body));
        }
        Ok(Lro::from_response(response, None))
    }

    /// POST an action such as `whatIf` under an ARM path.
    pub async fn post(&self, path: &str, api_version: &str, body: Value) -> Result<Lro> {
        let url = self.resource_url(path, api_version);
        let response = self.arm(Method::Post, &url, Some(body)).await?;
        if !response.is_success() {
            return Err(Error::provider(response.status, response.body));
        }
        Ok(Lro::from_response(response, None))
    }

    /// List `{parent_scope}/{type_suffix}`, following `nextLink` until absent.
    pub async fn list(
        &self,
        parent_scope: &str,
        type_suffix: &str,
        api_version: &str,
    ) -> Result<Vec<Value>> {
        let path = format!(
            "{}/{}",
            parent_scope.trim_end_matches('/'),
            type_suffix.trim_start_matches('/')
        );
        let mut url = Some(self.resource_url(&path, api_version));
        let mut items = Vec::new();

        while let Some(next) = url.take() {
            let response = self.arm(Method::Get, &next, None).await?;
            if response.status == 404 {
                return Err(Error::NotFound(format!("Scope {} was not found.", parent_scope)));
            }
            if !response.is_success() {
                return Err(Error::provider(response.status, response.body));
            }
            let body = response.body.unwrap_or(Value::Null);
            if let Some(values) = body.get("value").and_then(Value::as_array) {
                items.extend(values.iter().cloned());
            }
            url = body
                .get("nextLink")
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(str::to_string);
        }

        debug!("Listed {} item(s) under {}", items.len(), path);
        Ok(items)
    }

    /// Run a Resource Graph query in the current subscription, following
    /// `$skipToken` pages.
    pub async fn query_resource_graph(&self, query: &str) -> Result<Vec<Value>> {
        let url = self.resource_url(
            "/providers/Microsoft.ResourceGraph/resources",
            RESOURCE_GRAPH_API_VERSION,
        );
        let mut skip_token: Option<String> = None;
        let mut rows = Vec::new();

        loop {
            let mut options = json!({"resultFormat": "objectArray"});
            if let Some(token) = &skip_token {
                options["$skipToken"] = json!(token);
            }
            let body = json!({
                "subscriptions": [self.env.subscription_id],
                "query": query,
                "options": options,
            });

            let response = self.arm(Method::Post, &url, Some(body)).await?;
            if !response.is_success() {
                return Err(Error::provider(response.status, response.body));
            }
            let body = response.body.unwrap_or(Value::Null);
            if let Some(data) = body.get("data").and_then(Value::as_array) {
                rows.extend(data.iter().cloned());
            }

            let next = body
                .get("$skipToken")
                .and_then(Value::as_str)
                .map(str::to_string);
            if next.is_none() || next == skip_token {
                break;
            }
            skip_token = next;
        }

        Ok(rows)
    }

    /// Advance an operation by one poll.
    pub async fn step(&self, lro: &mut Lro) -> Result<()> {
        let url = lro.target.url().to_string();
        let response = self.arm(Method::Get, &url, None).await?;
        lro.advance(response)
    }

    /// Poll until terminal, waiting `step` between polls. `Succeeded` yields the
    /// final body; `Failed`/`Canceled` yield a provider error with that body.
    pub async fn poll(&self, mut lro: Lro, step: Duration) -> Result<Value> {
        while !lro.is_terminal() {
            self.sleep(step).await?;
            self.step(&mut lro).await?;
        }
        lro.into_result()
    }

    /// PUT and wait for the terminal state using the environment's interval.
    pub async fn put_and_wait(&self, id: &str, api_version: &str, body: Value) -> Result<Value> {
        let lro = self.put(id, api_version, body).await?;
        self.poll(lro, self.env.poll_interval).await
    }
}
