/// Provider runtime reached over HTTP
use async_trait::async_trait;
use reqwest::{header, Client, ClientBuilder, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info};
use url::Url;

use super::protocol::{ConfigureRequest, ProviderRequest, ProviderResponse};
use super::ProviderRuntime;
use crate::error::DispatchError;
use crate::utils::PollingConfig;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Error body returned by the provider service
#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: ErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

/// Body of `202 Accepted`
#[derive(Debug, Deserialize)]
struct Accepted {
    operation: String,
}

/// Long-running operation as reported by `GET /v1/operations/{id}`
#[derive(Debug, Deserialize)]
struct OperationStatus {
    state: String,
    #[serde(default)]
    response: Option<ProviderResponse>,
}

/// HTTP provider runtime client
#[derive(Clone)]
pub struct HttpRuntime {
    client: Client,
    endpoint: Url,
    timeout: Duration,
    poll_interval: Duration,
}

impl HttpRuntime {
    /// Create a client for the provider service at `endpoint`
    pub fn new(endpoint: &str, token: Option<&str>, timeout: Duration) -> Result<Self, DispatchError> {
        let invalid = |reason: String| DispatchError::InvalidEndpoint {
            endpoint: endpoint.to_string(),
            reason,
        };

        let mut url = Url::parse(endpoint).map_err(|e| invalid(e.to_string()))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(invalid(format!("unsupported scheme {}", url.scheme())));
        }
        // Url::join replaces the last segment unless the base ends with '/'.
        if !url.path().ends_with('/') {
            let path = format!("{}/", url.path());
            url.set_path(&path);
        }

        let client = client_builder(token, timeout)
            .map_err(invalid)?
            .build()
            .map_err(|e| invalid(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            endpoint: url,
            timeout,
            poll_interval: DEFAULT_POLL_INTERVAL,
        })
    }

    /// How often long-running operations are polled
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    fn url(&self, path: &str) -> Result<Url, DispatchError> {
        self.endpoint
            .join(path)
            .map_err(|e| DispatchError::InvalidEndpoint {
                endpoint: self.endpoint.to_string(),
                reason: e.to_string(),
            })
    }

    async fn send(&self, request: RequestBuilder, what: &str) -> Result<Response, DispatchError> {
        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                DispatchError::Timeout {
                    operation: what.to_string(),
                    secs: REQUEST_TIMEOUT.min(self.timeout).as_secs(),
                }
            } else {
                DispatchError::Unreachable(format!("{}: {}", what, e))
            }
        })?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let error_text = response.text().await.unwrap_or_default();
        let message = match serde_json::from_str::<ErrorResponse>(&error_text) {
            Ok(body) => format!("{} - {}", body.error.code, body.error.message),
            Err(_) => error_text,
        };
        Err(DispatchError::Rejected {
            status: status.as_u16(),
            message,
        })
    }

    async fn json<T: DeserializeOwned>(response: Response, what: &str) -> Result<T, DispatchError> {
        response
            .json::<T>()
            .await
            .map_err(|e| DispatchError::Protocol(format!("{}: {}", what, e)))
    }

    async fn wait_for_operation(&self, operation: &str) -> Result<ProviderResponse, DispatchError> {
        let url = self.url(&format!("v1/operations/{}", operation))?;
        let polling = PollingConfig::new(
            self.timeout,
            self.poll_interval,
            format!("waiting for provider operation {}", operation),
        );

        polling
            .poll(|| {
                let url = url.clone();
                async move {
                    debug!("GET {}", url);
                    let response = self.send(self.client.get(url), "poll operation").await?;
                    let status: OperationStatus = Self::json(response, "operation status").await?;
                    match (status.state.as_str(), status.response) {
                        ("done", Some(response)) => Ok(Some(response)),
                        ("done", None) => Err(DispatchError::Protocol(format!(
                            "operation {} is done but carries no response",
                            operation
                        ))),
                        _ => Ok(None),
                    }
                }
            })
            .await
    }
}

fn client_builder(token: Option<&str>, timeout: Duration) -> Result<ClientBuilder, String> {
    let mut headers = header::HeaderMap::new();
    if let Some(token) = token {
        headers.insert(
            header::AUTHORIZATION,
            header::HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|_| "token is not a valid header value".to_string())?,
        );
    }
    headers.insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("application/json"),
    );

    Ok(Client::builder()
        .default_headers(headers)
        .timeout(REQUEST_TIMEOUT.min(timeout)))
}

#[async_trait]
impl ProviderRuntime for HttpRuntime {
    async fn configure(&self, variables: &BTreeMap<String, String>) -> Result<(), DispatchError> {
        let url = self.url("v1/configure")?;
        debug!("POST {}", url);
        let body = ConfigureRequest {
            variables: variables.clone(),
        };
        self.send(self.client.post(url).json(&body), "configure")
            .await?;
        info!("Provider runtime configured at {}", self.endpoint);
        Ok(())
    }

    async fn dispatch(&self, request: ProviderRequest) -> Result<ProviderResponse, DispatchError> {
        let url = self.url("v1/resources")?;
        debug!("POST {} ({} {})", url, request.operation, request.urn);

        let what = format!("{} {}", request.operation, request.urn);
        let response = self.send(self.client.post(url).json(&request), &what).await?;

        if response.status() == StatusCode::ACCEPTED {
            let accepted: Accepted = Self::json(response, "accepted operation").await?;
            debug!("{} running as operation {}", what, accepted.operation);
            return self.wait_for_operation(&accepted.operation).await;
        }

        Self::json(response, "provider response").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::protocol::Operation;
    use crate::resource::{Cluster, PropertyMap, Urn};
    use axum::extract::{Path, State};
    use axum::http::{HeaderMap, StatusCode as AxumStatus};
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct FakeProvider {
        requests: Mutex<Vec<Value>>,
        configured: Mutex<Option<Value>>,
        auth: Mutex<Option<String>>,
        polls: AtomicU32,
    }

    async fn configure(
        State(fake): State<Arc<FakeProvider>>,
        headers: HeaderMap,
        Json(body): Json<Value>,
    ) -> AxumStatus {
        *fake.auth.lock().unwrap() = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        *fake.configured.lock().unwrap() = Some(body);
        AxumStatus::NO_CONTENT
    }

    async fn resources(
        State(fake): State<Arc<FakeProvider>>,
        Json(body): Json<Value>,
    ) -> (AxumStatus, Json<Value>) {
        fake.requests.lock().unwrap().push(body.clone());
        match body["name"].as_str() {
            Some("slow") => (AxumStatus::ACCEPTED, Json(json!({"operation": "op-1"}))),
            Some("forbidden") => (
                AxumStatus::FORBIDDEN,
                Json(json!({"error": {"code": "forbidden", "message": "token lacks scope"}})),
            ),
            Some("garbled") => (AxumStatus::OK, Json(json!({"status": "maybe"}))),
            Some("missing") => (
                AxumStatus::OK,
                Json(json!({"status": "error", "kind": "NotFound", "message": "gone"})),
            ),
            _ => (
                AxumStatus::OK,
                Json(json!({
                    "status": "ok",
                    "id": body["name"],
                    "outputs": {"name": body["name"], "kubeconfig": "apiVersion: v1"}
                })),
            ),
        }
    }

    async fn operation(
        State(fake): State<Arc<FakeProvider>>,
        Path(id): Path<String>,
    ) -> Json<Value> {
        if fake.polls.fetch_add(1, Ordering::SeqCst) < 2 {
            return Json(json!({"state": "running"}));
        }
        Json(json!({
            "state": "done",
            "response": {"status": "ok", "id": id, "outputs": {"name": "slow-x1", "kubeconfig": "apiVersion: v1"}}
        }))
    }

    async fn serve() -> (String, Arc<FakeProvider>) {
        let fake = Arc::new(FakeProvider::default());
        let app = Router::new()
            .route("/api/v1/configure", post(configure))
            .route("/api/v1/resources", post(resources))
            .route("/api/v1/operations/:id", get(operation))
            .with_state(fake.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{}/api", addr), fake)
    }

    fn runtime(endpoint: &str) -> HttpRuntime {
        let mut runtime = HttpRuntime::new(endpoint, Some("secret"), Duration::from_secs(5))
            .unwrap()
            .with_poll_interval(Duration::from_millis(10));
        // Talk to the local fake directly even when the environment sets a proxy.
        runtime.client = client_builder(Some("secret"), Duration::from_secs(5))
            .unwrap()
            .no_proxy()
            .build()
            .unwrap();
        runtime
    }

    fn create(name: &str) -> ProviderRequest {
        let mut inputs = PropertyMap::new();
        inputs.insert("nodes".to_string(), json!([{"role": "control-plane"}]));
        ProviderRequest::create(
            Cluster::type_tag(),
            Urn::new("dev", &Cluster::type_tag(), name),
            inputs,
        )
    }

    #[test]
    fn test_endpoint_validation() {
        assert!(matches!(
            HttpRuntime::new("not a url", None, Duration::from_secs(5)),
            Err(DispatchError::InvalidEndpoint { .. })
        ));
        assert!(matches!(
            HttpRuntime::new("ftp://provider", None, Duration::from_secs(5)),
            Err(DispatchError::InvalidEndpoint { .. })
        ));

        let runtime = HttpRuntime::new("http://provider:8080/api", None, Duration::from_secs(5)).unwrap();
        assert_eq!(
            runtime.url("v1/resources").unwrap().as_str(),
            "http://provider:8080/api/v1/resources"
        );
    }

    #[tokio::test]
    async fn test_configure_and_create() {
        let (endpoint, fake) = serve().await;
        let runtime = runtime(&endpoint);

        let mut variables = BTreeMap::new();
        variables.insert("kind:config:provider".to_string(), "docker".to_string());
        runtime.configure(&variables).await.unwrap();
        assert_eq!(
            fake.configured.lock().unwrap().clone().unwrap(),
            json!({"variables": {"kind:config:provider": "docker"}})
        );
        assert_eq!(fake.auth.lock().unwrap().as_deref(), Some("Bearer secret"));

        let response = runtime.dispatch(create("kind-example")).await.unwrap();
        let ProviderResponse::Ok { id, outputs } = response else {
            panic!("expected ok");
        };
        assert_eq!(id.as_deref(), Some("kind-example"));
        assert_eq!(outputs["kubeconfig"], "apiVersion: v1");

        let sent = fake.requests.lock().unwrap()[0].clone();
        assert_eq!(sent["operation"], "create");
        assert_eq!(sent["type"], "kind:cluster:Cluster");
    }

    #[tokio::test]
    async fn test_accepted_operations_are_polled() {
        let (endpoint, fake) = serve().await;
        let response = runtime(&endpoint).dispatch(create("slow")).await.unwrap();

        assert!(matches!(response, ProviderResponse::Ok { id: Some(ref id), .. } if id == "op-1"));
        assert_eq!(fake.polls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_faults_and_rejections() {
        let (endpoint, _fake) = serve().await;
        let runtime = runtime(&endpoint);

        let mut read = create("missing");
        read.operation = Operation::Read;
        let ProviderResponse::Error(fault) = runtime.dispatch(read).await.unwrap() else {
            panic!("expected a fault");
        };
        assert!(fault.is_not_found());

        assert_eq!(
            runtime.dispatch(create("forbidden")).await,
            Err(DispatchError::Rejected {
                status: 403,
                message: "forbidden - token lacks scope".to_string()
            })
        );
        assert!(matches!(
            runtime.dispatch(create("garbled")).await,
            Err(DispatchError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn test_unreachable_runtime() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let runtime = runtime(&format!("http://{}", addr));
        assert!(matches!(
            runtime.dispatch(create("kind-example")).await,
            Err(DispatchError::Unreachable(_))
        ));
    }
}
