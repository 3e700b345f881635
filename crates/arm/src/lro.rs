//! Long-running operation state machine.
//!
//! `Submitted -> InProgress* -> Succeeded | Failed`. Each poll response
//! advances the machine by one transition; the client owns the waiting.

use crate::transport::HttpResponse;
use aioclone_common::{Error, Result};
use serde_json::Value;

/// Coarse classification of a provisioning state string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    InProgress,
    Succeeded,
    Failed,
}

/// Classify a provisioning state, case-insensitively.
pub fn classify(state: &str) -> Phase {
    if state.eq_ignore_ascii_case("succeeded") {
        Phase::Succeeded
    } else if state.eq_ignore_ascii_case("failed") || state.eq_ignore_ascii_case("canceled") {
        Phase::Failed
    } else {
        Phase::InProgress
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LroState {
    Submitted,
    InProgress(String),
    Succeeded(Value),
    Failed { state: String, body: Value },
}

/// What to GET to observe progress.
#[derive(Debug, Clone, PartialEq)]
pub enum PollTarget {
    /// The resource itself; progress is `properties.provisioningState`.
    Resource { url: String },
    /// An `Azure-AsyncOperation` status monitor; progress is `status`.
    AsyncOperation {
        url: String,
        result_url: Option<String>,
    },
    /// A `Location` monitor; 202 while running, final body when done.
    Location { url: String },
}

impl PollTarget {
    pub fn url(&self) -> &str {
        match self {
            PollTarget::Resource { url }
            | PollTarget::AsyncOperation { url, .. }
            | PollTarget::Location { url } => url,
        }
    }
}

/// A long-running operation handle.
#[derive(Debug, Clone)]
pub struct Lro {
    pub target: PollTarget,
    pub state: LroState,
}

fn provisioning_state(body: &Option<Value>) -> Option<&str> {
    body.as_ref()
        .and_then(|b| b.pointer("/properties/provisioningState"))
        .and_then(Value::as_str)
}

fn status_field(body: &Option<Value>) -> Option<&str> {
    body.as_ref()
        .and_then(|b| b.get("status"))
        .and_then(Value::as_str)
}

fn phase_to_state(state: &str, body: Option<Value>) -> LroState {
    match classify(state) {
        Phase::Succeeded => LroState::Succeeded(body.unwrap_or(Value::Null)),
        Phase::Failed => LroState::Failed {
            state: state.to_string(),
            body: body.unwrap_or(Value::Null),
        },
        Phase::InProgress => LroState::InProgress(state.to_string()),
    }
}

impl Lro {
    /// Build a handle from the initial response of a PUT/POST/DELETE.
    ///
    /// `resource_url` is the GET url of the target resource, when there is one.
    pub fn from_response(response: HttpResponse, resource_url: Option<String>) -> Self {
        let async_url = response.header("azure-asyncoperation").map(str::to_string);
        let location_url = response.header("location").map(str::to_string);

        let target = if let Some(url) = async_url {
            PollTarget::AsyncOperation {
                url,
                result_url: resource_url.clone(),
            }
        } else if let (202, Some(url)) = (response.status, location_url) {
            PollTarget::Location { url }
        } else {
            PollTarget::Resource {
                url: resource_url.unwrap_or_default(),
            }
        };

        let state = match provisioning_state(&response.body).map(str::to_string) {
            Some(state) => match phase_to_state(&state, response.body) {
                LroState::InProgress(_) => LroState::Submitted,
                terminal => terminal,
            },
            None if response.status == 202 => LroState::Submitted,
            None => LroState::Succeeded(response.body.unwrap_or(Value::Null)),
        };

        Self { target, state }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.state, LroState::Succeeded(_) | LroState::Failed { .. })
    }

    /// Advance the machine with one poll response.
    pub fn advance(&mut self, response: HttpResponse) -> Result<()> {
        if response.status == 404 {
            return Err(Error::NotFound(format!(
                "Long-running operation target {} not found",
                self.target.url()
            )));
        }
        if !response.is_success() {
            return Err(Error::provider(response.status, response.body));
        }

        let body = response.body;
        self.state = match &self.target {
            PollTarget::Resource { .. } => match provisioning_state(&body).map(str::to_string) {
                Some(state) => phase_to_state(&state, body),
                None => LroState::Succeeded(body.unwrap_or(Value::Null)),
            },
            PollTarget::AsyncOperation { result_url, .. } => {
                let state = status_field(&body).unwrap_or("InProgress").to_string();
                match (classify(&state), result_url) {
                    (Phase::Succeeded, Some(url)) => {
                        self.target = PollTarget::Resource { url: url.clone() };
                        LroState::InProgress(state)
                    }
                    _ => phase_to_state(&state, body),
                }
            }
            PollTarget::Location { .. } => {
                if response.status == 202 {
                    LroState::InProgress("Accepted".to_string())
                } else {
                    match status_field(&body).map(str::to_string) {
                        Some(state) => match phase_to_state(&state, body.clone()) {
                            LroState::InProgress(_) => LroState::Succeeded(body.unwrap_or(Value::Null)),
                            terminal => terminal,
                        },
                        None => LroState::Succeeded(body.unwrap_or(Value::Null)),
                    }
                }
            }
        };
        Ok(())
    }

    /// The final body, or the terminal error.
    pub fn into_result(self) -> Result<Value> {
        match self.state {
            LroState::Succeeded(body) => Ok(body),
            LroState::Failed { state, body } => Err(Error::terminal(&state, body)),
            LroState::Submitted | LroState::InProgress(_) => Err(Error::Other(
                "Long-running operation has not reached a terminal state".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn resource_body(state: &str) -> Option<Value> {
        Some(json!({"properties": {"provisioningState": state}}))
    }

    #[test]
    fn test_classify_is_case_insensitive() {
        assert_eq!(classify("SUCCEEDED"), Phase::Succeeded);
        assert_eq!(classify("succeeded"), Phase::Succeeded);
        assert_eq!(classify("Failed"), Phase::Failed);
        assert_eq!(classify("canceled"), Phase::Failed);
        assert_eq!(classify("Accepted"), Phase::InProgress);
        assert_eq!(classify("Running"), Phase::InProgress);
    }

    #[test]
    fn test_resource_poll_transitions() {
        let initial = HttpResponse::new(201, resource_body("Accepted"));
        let mut lro = Lro::from_response(initial, Some("https://arm/x".to_string()));
        assert_eq!(lro.state, LroState::Submitted);
        assert_eq!(lro.target.url(), "https://arm/x");

        lro.advance(HttpResponse::new(200, resource_body("Running")))
            .unwrap();
        assert_eq!(lro.state, LroState::InProgress("Running".to_string()));
        assert!(!lro.is_terminal());

        lro.advance(HttpResponse::new(200, resource_body("succeeded")))
            .unwrap();
        assert!(lro.is_terminal());
        assert!(lro.into_result().is_ok());
    }

    #[test]
    fn test_failed_state_carries_body() {
        let mut lro = Lro::from_response(
            HttpResponse::new(201, resource_body("Accepted")),
            Some("u".to_string()),
        );
        lro.advance(HttpResponse::new(
            200,
            Some(json!({"properties": {"provisioningState": "Canceled", "error": {"message": "stop"}}})),
        ))
        .unwrap();
        let err = lro.into_result().unwrap_err();
        assert!(err.to_string().contains("Canceled"));
        assert!(err.provider_body().is_some());
    }

    #[test]
    fn test_immediate_success_without_state() {
        let lro = Lro::from_response(HttpResponse::new(200, Some(json!({"name": "fic"}))), None);
        assert!(lro.is_terminal());
        assert_eq!(lro.into_result().unwrap()["name"], "fic");
    }

    #[test]
    fn test_location_monitor() {
        let initial = HttpResponse::new(202, None).with_header("Location", "https://arm/op");
        let mut lro = Lro::from_response(initial, None);
        assert_eq!(
            lro.target,
            PollTarget::Location {
                url: "https://arm/op".to_string()
            }
        );
        lro.advance(HttpResponse::new(202, None)).unwrap();
        assert!(!lro.is_terminal());
        lro.advance(HttpResponse::new(200, Some(json!({"status": "Failed", "error": {"message": "bad"}}))))
            .unwrap();
        assert!(matches!(lro.state, LroState::Failed { .. }));
    }

    #[test]
    fn test_async_operation_then_result() {
        let initial = HttpResponse::new(201, resource_body("Accepted"))
            .with_header("Azure-AsyncOperation", "https://arm/status");
        let mut lro = Lro::from_response(initial, Some("https://arm/res".to_string()));
        lro.advance(HttpResponse::new(200, Some(json!({"status": "InProgress"}))))
            .unwrap();
        lro.advance(HttpResponse::new(200, Some(json!({"status": "Succeeded"}))))
            .unwrap();
        assert_eq!(lro.target.url(), "https://arm/res");
        assert!(!lro.is_terminal());
        lro.advance(HttpResponse::new(200, resource_body("Succeeded")))
            .unwrap();
        assert!(lro.is_terminal());
    }

    #[test]
    fn test_poll_error_status_surfaces() {
        let mut lro = Lro::from_response(
            HttpResponse::new(201, resource_body("Accepted")),
            Some("u".to_string()),
        );
        assert!(lro.advance(HttpResponse::new(404, None)).is_err());
        assert!(lro
            .advance(HttpResponse::new(400, Some(json!({"error": {"message": "bad"}}))))
            .is_err());
    }
}
