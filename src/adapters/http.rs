//! HTTP transport speaking the JSON tool-invocation contract.
//!
//! Endpoints:
//! - `POST {base}/execute`
//! - `GET {base}/status/{execution_id}`
//! - `DELETE {base}/executions/{execution_id}`
//! - `GET {base}/tools`, `GET {base}/tools/{tool_name}`
//! - `GET {health_url}`

use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;

use super::{ExecuteRequest, ExecutionReport, ToolFilter, Transport, TransportError};
use crate::domain::ServiceEndpoint;

/// reqwest-backed transport
#[derive(Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpTransport {
    /// Create a transport with a fresh connection pool
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
        timeout: Duration,
    ) -> Result<T, TransportError> {
        let response = request
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| classify(e, timeout))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::Http {
                status: status.as_u16(),
                body: body.trim().to_string(),
            });
        }

        response.json::<T>().await.map_err(|e| {
            if e.is_timeout() {
                TransportError::Timeout(timeout)
            } else {
                TransportError::Decode(e.to_string())
            }
        })
    }

    /// Send and only check the status; the body is ignored
    async fn send_unit(
        &self,
        request: reqwest::RequestBuilder,
        timeout: Duration,
    ) -> Result<(), TransportError> {
        let response = request
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| classify(e, timeout))?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(TransportError::Http {
                status: status.as_u16(),
                body: String::new(),
            })
        }
    }
}

/// Map a reqwest failure onto the retryable/non-retryable split
fn classify(error: reqwest::Error, timeout: Duration) -> TransportError {
    if error.is_timeout() {
        TransportError::Timeout(timeout)
    } else if error.is_decode() {
        TransportError::Decode(error.to_string())
    } else {
        TransportError::Connect(error.to_string())
    }
}

#[async_trait]
impl Transport for HttpTransport {
    fn name(&self) -> &str {
        "http"
    }

    async fn execute(
        &self,
        endpoint: &ServiceEndpoint,
        request: &ExecuteRequest,
        timeout: Duration,
    ) -> Result<ExecutionReport, TransportError> {
        let builder = self.client.post(endpoint.execute_url()).json(request);
        self.send_json(builder, timeout).await
    }

    async fn execution_status(
        &self,
        endpoint: &ServiceEndpoint,
        execution_id: &str,
        timeout: Duration,
    ) -> Result<ExecutionReport, TransportError> {
        let builder = self.client.get(endpoint.status_url(execution_id));
        self.send_json(builder, timeout).await
    }

    async fn cancel_execution(
        &self,
        endpoint: &ServiceEndpoint,
        execution_id: &str,
        timeout: Duration,
    ) -> Result<(), TransportError> {
        let builder = self.client.delete(endpoint.cancel_url(execution_id));
        self.send_unit(builder, timeout).await
    }

    async fn list_tools(
        &self,
        endpoint: &ServiceEndpoint,
        filter: &ToolFilter,
        timeout: Duration,
    ) -> Result<Value, TransportError> {
        let builder = self.client.get(endpoint.tools_url()).query(&filter.query());
        self.send_json(builder, timeout).await
    }

    async fn tool_info(
        &self,
        endpoint: &ServiceEndpoint,
        tool_name: &str,
        timeout: Duration,
    ) -> Result<Value, TransportError> {
        let builder = self.client.get(endpoint.tool_url(tool_name));
        self.send_json(builder, timeout).await
    }

    async fn health_check(
        &self,
        endpoint: &ServiceEndpoint,
        timeout: Duration,
    ) -> Result<(), TransportError> {
        let builder = self.client.get(&endpoint.health_url);
        self.send_unit(builder, timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::RemoteStatus;
    use serde_json::json;
    use wiremock::matchers::{body_json, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_execute_posts_contract_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/execute"))
            .and(body_json(json!({
                "tool_name": "climada_impact_assessment",
                "parameters": {"intensity": 3.5},
                "priority": 0
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": "completed",
                "result": {"loss": 12},
                "execution_id": "e1"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let transport = HttpTransport::new();
        let endpoint = ServiceEndpoint::new("climada", server.uri());
        let request = ExecuteRequest::new("climada_impact_assessment", json!({"intensity": 3.5}));

        let report = transport
            .execute(&endpoint, &request, Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(report.status, RemoteStatus::Completed);
        assert_eq!(report.result, json!({"loss": 12}));
        assert_eq!(report.execution_id.as_deref(), Some("e1"));
    }

    #[tokio::test]
    async fn test_error_status_is_not_retryable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/execute"))
            .respond_with(ResponseTemplate::new(422).set_body_string("bad parameters"))
            .mount(&server)
            .await;

        let transport = HttpTransport::new();
        let endpoint = ServiceEndpoint::new("lisflood", server.uri());
        let request = ExecuteRequest::new("lisflood_simulation", json!({}));

        let err = transport
            .execute(&endpoint, &request, Duration::from_secs(5))
            .await
            .unwrap_err();

        assert_eq!(
            err,
            TransportError::Http {
                status: 422,
                body: "bad parameters".to_string()
            }
        );
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_cancel_execution_sends_delete() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/executions/e7"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"cancelled": true})))
            .expect(1)
            .mount(&server)
            .await;

        let transport = HttpTransport::new();
        let endpoint = ServiceEndpoint::new("climada", server.uri());

        transport
            .cancel_execution(&endpoint, "e7", Duration::from_secs(5))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_list_tools_passes_filters() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/tools"))
            .and(query_param("category", "fire"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "tools": [{"name": "nfdrs4_fire_danger", "category": "fire"}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let transport = HttpTransport::new();
        let endpoint = ServiceEndpoint::new("nfdrs4", server.uri());

        let tools = transport
            .list_tools(&endpoint, &ToolFilter::category("fire"), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(tools["tools"][0]["name"], "nfdrs4_fire_danger");
    }

    #[tokio::test]
    async fn test_slow_response_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
            .mount(&server)
            .await;

        let transport = HttpTransport::new();
        let endpoint = ServiceEndpoint::new("aurora", server.uri());

        let err = transport
            .health_check(&endpoint, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_connection_refused_is_retryable() {
        let transport = HttpTransport::new();
        // Nothing listens on port 1
        let endpoint = ServiceEndpoint::new("offline", "http://127.0.0.1:1");

        let err = transport
            .health_check(&endpoint, Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }
}
