//! In-memory transport with canned responses, for tests.

use crate::credential::StaticToken;
use crate::env::Env;
use crate::retry::RetryConfig;
use crate::transport::{HttpRequest, HttpResponse, Method, Transport};
use aioclone_common::{Error, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Clone)]
enum Reply {
    Respond(HttpResponse),
    Fail(String),
}

struct Route {
    method: Method,
    fragment: String,
    body_contains: Option<String>,
    responses: VecDeque<Reply>,
}

impl Route {
    fn matches(&self, request: &HttpRequest, body: &str) -> bool {
        self.method == request.method
            && request.url.contains(&self.fragment)
            && self
                .body_contains
                .as_ref()
                .map(|needle| body.contains(needle.as_str()))
                .unwrap_or(true)
    }
}

/// Transport answering from registered routes.
///
/// A request matches a route when the method is equal and the url contains
/// the route's fragment; routes with a body filter beat plain ones, then the
/// longest matching fragment wins. Responses and connection failures queued
/// on a route are served in order and the last one repeats. Unmatched
/// requests get a 404.
#[derive(Default)]
pub struct MockTransport {
    routes: Mutex<Vec<Route>>,
    requests: Mutex<Vec<HttpRequest>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a JSON response for `method` requests whose url contains `fragment`.
    pub fn on(&self, method: Method, fragment: &str, status: u16, body: Value) -> &Self {
        self.on_response(method, fragment, HttpResponse::new(status, Some(body)))
    }

    /// Queue an arbitrary response.
    pub fn on_response(&self, method: Method, fragment: &str, response: HttpResponse) -> &Self {
        self.push(method, fragment, None, Reply::Respond(response))
    }

    /// Queue a connection failure: the request never gets a response.
    pub fn on_error(&self, method: Method, fragment: &str, reason: &str) -> &Self {
        self.push(method, fragment, None, Reply::Fail(reason.to_string()))
    }

    /// Queue a JSON response for requests whose serialized body also
    /// contains `body_contains`, e.g. one Resource Graph query among several.
    pub fn on_body(
        &self,
        method: Method,
        fragment: &str,
        body_contains: &str,
        status: u16,
        body: Value,
    ) -> &Self {
        self.push(
            method,
            fragment,
            Some(body_contains.to_string()),
            Reply::Respond(HttpResponse::new(status, Some(body))),
        )
    }

    fn push(
        &self,
        method: Method,
        fragment: &str,
        body_contains: Option<String>,
        response: Reply,
    ) -> &Self {
        if let Ok(mut routes) = self.routes.lock() {
            match routes.iter_mut().find(|r| {
                r.method == method && r.fragment == fragment && r.body_contains == body_contains
            }) {
                Some(route) => route.responses.push_back(response),
                None => routes.push(Route {
                    method,
                    fragment: fragment.to_string(),
                    body_contains,
                    responses: VecDeque::from([response]),
                }),
            }
        }
        self
    }

    /// Every request received so far, in order.
    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    /// Requests with the given method whose url contains `fragment`.
    pub fn requests_matching(&self, method: Method, fragment: &str) -> Vec<HttpRequest> {
        self.requests()
            .into_iter()
            .filter(|r| r.method == method && r.url.contains(fragment))
            .collect()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, request: &HttpRequest) -> Result<HttpResponse> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request.clone());
        }

        let not_found = HttpResponse::new(
            404,
            Some(json!({"error": {"code": "ResourceNotFound", "message": format!("{} not found", request.url)}})),
        );
        let mut routes = match self.routes.lock() {
            Ok(routes) => routes,
            Err(_) => return Ok(not_found),
        };

        let body = request
            .body
            .as_ref()
            .map(Value::to_string)
            .unwrap_or_default();
        let route = routes
            .iter_mut()
            .filter(|r| r.matches(request, &body))
            .max_by_key(|r| (r.body_contains.is_some(), r.fragment.len()));

        let reply = match route {
            Some(route) if route.responses.len() > 1 => route.responses.pop_front(),
            Some(route) => route.responses.front().cloned(),
            None => None,
        };
        match reply {
            Some(Reply::Respond(response)) => Ok(response),
            Some(Reply::Fail(reason)) => Err(Error::Transport(reason)),
            None => Ok(not_found),
        }
    }
}

/// An environment wired to `transport` with a static token, fast retries and
/// a near-zero poll interval.
pub fn mock_env(transport: Arc<MockTransport>) -> Arc<Env> {
    let retry = RetryConfig {
        initial_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
        ..RetryConfig::default()
    };
    Arc::new(
        Env::new("sub", transport, Arc::new(StaticToken::new("test-token")))
            .with_retry(retry)
            .with_poll_interval(Duration::from_millis(1)),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn get(url: &str) -> HttpRequest {
        HttpRequest {
            method: Method::Get,
            url: url.to_string(),
            headers: Vec::new(),
            body: None,
        }
    }

    #[tokio::test]
    async fn test_longest_fragment_wins_and_last_response_repeats() {
        let mock = MockTransport::new();
        mock.on(Method::Get, "/instances/i", 200, json!({"n": "instance"}));
        mock.on(Method::Get, "/instances/i/brokers", 200, json!({"n": 1}));
        mock.on(Method::Get, "/instances/i/brokers", 200, json!({"n": 2}));

        let brokers = get("https://arm/instances/i/brokers?api-version=v");
        assert_eq!(mock.send(&brokers).await.unwrap().body, Some(json!({"n": 1})));
        assert_eq!(mock.send(&brokers).await.unwrap().body, Some(json!({"n": 2})));
        assert_eq!(mock.send(&brokers).await.unwrap().body, Some(json!({"n": 2})));

        let instance = get("https://arm/instances/i?api-version=v");
        assert_eq!(
            mock.send(&instance).await.unwrap().body,
            Some(json!({"n": "instance"}))
        );
        assert_eq!(mock.send(&get("https://arm/other")).await.unwrap().status, 404);
        assert_eq!(mock.requests().len(), 5);
    }

    #[tokio::test]
    async fn test_body_filter_selects_route() {
        let mock = MockTransport::new();
        mock.on(Method::Post, "/resources", 200, json!({"data": []}));
        mock.on_body(Method::Post, "/resources", "assets'", 200, json!({"data": [1]}));

        let mut request = get("https://arm/resources");
        request.method = Method::Post;
        request.body = Some(json!({"query": "where type =~ 'assets'"}));
        assert_eq!(mock.send(&request).await.unwrap().body, Some(json!({"data": [1]})));

        request.body = Some(json!({"query": "where type =~ 'profiles'"}));
        assert_eq!(mock.send(&request).await.unwrap().body, Some(json!({"data": []})));
        assert_eq!(mock.requests_matching(Method::Post, "/resources").len(), 2);
    }

    #[tokio::test]
    async fn test_queued_connection_failure() {
        let mock = MockTransport::new();
        mock.on_error(Method::Get, "/instances/i", "connection reset");
        mock.on(Method::Get, "/instances/i", 200, json!({"n": "instance"}));

        let instance = get("https://arm/instances/i?api-version=v");
        let err = mock.send(&instance).await.unwrap_err();
        assert!(matches!(err, Error::Transport(ref r) if r == "connection reset"));
        assert_eq!(mock.send(&instance).await.unwrap().status, 200);
    }
}
