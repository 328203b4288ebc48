//! Hypervisor Gateway Adapter
//!
//! Talks to the hypervisor management gateway over HTTP. One adapter
//! covers the hardware device query, the guest directory (existence,
//! dedicate, undedicate) and in-guest volume configuration.
//!
//! Reads are retried with exponential backoff on transient failures.
//! Mutations are sent once; the orchestrator owns their rollback.

use crate::domain::ports::{
    AttachConfig, DetachConfig, FcpId, GuestConfigurator, GuestDirectory, HardwareQuery,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use backoff::ExponentialBackoff;
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::Serialize;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

// =============================================================================
// Configuration
// =============================================================================

/// Gateway connection settings
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Base URL, e.g. "https://zvm-gateway:8080"
    pub endpoint: String,
    /// Bearer token sent with every request
    pub token: Option<String>,
    /// Per-request timeout
    pub timeout: Duration,
    /// Give up retrying reads after this long
    pub retry_max_elapsed: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:8080".to_string(),
            token: None,
            timeout: Duration::from_secs(300),
            retry_max_elapsed: Duration::from_secs(30),
        }
    }
}

// =============================================================================
// REST Gateway
// =============================================================================

/// HTTP client for the hypervisor management gateway
pub struct RestGateway {
    config: GatewayConfig,
    client: reqwest::Client,
}

impl RestGateway {
    pub fn new(config: GatewayConfig) -> Result<Self> {
        reqwest::Url::parse(&config.endpoint).map_err(|e| {
            Error::Configuration(format!("invalid gateway endpoint '{}': {}", config.endpoint, e))
        })?;
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()?;
        Ok(Self { config, client })
    }

    /// Join escaped path segments onto the endpoint
    fn url(&self, segments: &[&str]) -> String {
        let mut url = self.config.endpoint.trim_end_matches('/').to_string();
        for segment in segments {
            url.push('/');
            url.push_str(&urlencoding::encode(segment));
        }
        url
    }

    fn request(&self, method: Method, url: &str) -> RequestBuilder {
        let builder = self.client.request(method, url);
        match &self.config.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    fn retry_policy(&self) -> ExponentialBackoff {
        const INITIAL_INTERVAL: Duration = Duration::from_millis(100);
        ExponentialBackoff {
            current_interval: INITIAL_INTERVAL,
            initial_interval: INITIAL_INTERVAL,
            max_interval: Duration::from_secs(5),
            max_elapsed_time: Some(self.config.retry_max_elapsed),
            ..ExponentialBackoff::default()
        }
    }

    /// Retry a read while it fails transiently
    async fn with_retry<T, F, Fut>(&self, operation: &str, mut call: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        backoff::future::retry(self.retry_policy(), || {
            let attempt = call();
            async move {
                attempt.await.map_err(|e| {
                    if e.is_transient() {
                        warn!("Gateway {} failed, retrying: {}", operation, e);
                        backoff::Error::transient(e)
                    } else {
                        backoff::Error::permanent(e)
                    }
                })
            }
        })
        .await
    }

    async fn get_text(&self, url: &str) -> Result<String> {
        let response = self.request(Method::GET, url).send().await?;
        Ok(check(url, response).await?.text().await?)
    }

    /// 404 means absent, any other failure is an error
    async fn get_exists(&self, url: &str) -> Result<bool> {
        let response = self.request(Method::GET, url).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        check(url, response).await?;
        Ok(true)
    }

    async fn send_json<T: Serialize + ?Sized>(&self, method: Method, url: &str, body: &T) -> Result<()> {
        let response = self.request(method, url).json(body).send().await?;
        check(url, response).await?;
        Ok(())
    }
}

/// Turn a non-success status into an error carrying the body
async fn check(endpoint: &str, response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(Error::RemoteStatus {
        endpoint: endpoint.to_string(),
        status: status.as_u16(),
        body,
    })
}

#[async_trait]
impl HardwareQuery for RestGateway {
    async fn query_fcp_devices(&self, target: &str) -> Result<String> {
        let url = self.url(&["hosts", target, "fcp"]);
        debug!("Querying FCP devices of {}", target);
        self.with_retry("query_fcp_devices", || self.get_text(&url))
            .await
    }
}

#[async_trait]
impl GuestDirectory for RestGateway {
    async fn guest_exists(&self, userid: &str) -> Result<bool> {
        let url = self.url(&["guests", userid]);
        self.with_retry("guest_exists", || self.get_exists(&url))
            .await
    }

    async fn dedicate(&self, fcp_id: &FcpId, userid: &str) -> Result<()> {
        let url = self.url(&["guests", userid, "fcp", fcp_id.as_str()]);
        let response = self.request(Method::POST, &url).send().await?;
        check(&url, response).await?;
        Ok(())
    }

    async fn undedicate(&self, fcp_id: &FcpId, userid: &str) -> Result<()> {
        let url = self.url(&["guests", userid, "fcp", fcp_id.as_str()]);
        let response = self.request(Method::DELETE, &url).send().await?;
        check(&url, response).await?;
        Ok(())
    }
}

#[async_trait]
impl GuestConfigurator for RestGateway {
    async fn configure_attach(&self, request: &AttachConfig) -> Result<()> {
        let url = self.url(&["guests", &request.userid, "volumes", "attach"]);
        self.send_json(Method::POST, &url, request).await
    }

    async fn configure_detach(&self, request: &DetachConfig) -> Result<()> {
        let url = self.url(&["guests", &request.userid, "volumes", "detach"]);
        self.send_json(Method::POST, &url, request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::{Path, State};
    use axum::http::{HeaderMap, StatusCode as AxumStatus};
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Default)]
    struct GatewayState {
        query_calls: AtomicUsize,
        dedicate_calls: AtomicUsize,
        attach_requests: Mutex<Vec<AttachConfig>>,
        authorization: Mutex<Option<String>>,
    }

    async fn spawn_gateway() -> (String, Arc<GatewayState>) {
        let state = Arc::new(GatewayState::default());

        let app = Router::new()
            .route(
                "/hosts/:target/fcp",
                get(|State(s): State<Arc<GatewayState>>, Path(target): Path<String>| async move {
                    // First call fails to exercise the retry
                    if s.query_calls.fetch_add(1, Ordering::SeqCst) == 0 {
                        return (AxumStatus::SERVICE_UNAVAILABLE, "busy".to_string());
                    }
                    (AxumStatus::OK, format!("{}: FCP device number: 1A00\n", target))
                }),
            )
            .route(
                "/guests/:userid",
                get(|Path(userid): Path<String>| async move {
                    if userid == "USER 1" {
                        AxumStatus::OK
                    } else {
                        AxumStatus::NOT_FOUND
                    }
                }),
            )
            .route(
                "/guests/:userid/fcp/:fcp",
                post(|State(s): State<Arc<GatewayState>>| async move {
                    s.dedicate_calls.fetch_add(1, Ordering::SeqCst);
                    (AxumStatus::SERVICE_UNAVAILABLE, "busy")
                }),
            )
            .route(
                "/guests/:userid/volumes/attach",
                post(
                    |State(s): State<Arc<GatewayState>>, headers: HeaderMap, Json(body): Json<AttachConfig>| async move {
                        *s.authorization.lock() = headers
                            .get("authorization")
                            .and_then(|v| v.to_str().ok())
                            .map(String::from);
                        s.attach_requests.lock().push(body);
                        AxumStatus::OK
                    },
                ),
            )
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        (format!("http://{}", addr), state)
    }

    fn gateway(endpoint: String) -> RestGateway {
        RestGateway::new(GatewayConfig {
            endpoint,
            token: Some("secret".into()),
            timeout: Duration::from_secs(5),
            retry_max_elapsed: Duration::from_secs(5),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_query_retries_transient_failure() {
        let (endpoint, state) = spawn_gateway().await;
        let gateway = gateway(endpoint);

        let listing = gateway.query_fcp_devices("opnstk1").await.unwrap();
        assert_eq!(listing, "opnstk1: FCP device number: 1A00\n");
        assert_eq!(state.query_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_guest_exists_escapes_userid() {
        let (endpoint, _) = spawn_gateway().await;
        let gateway = gateway(endpoint);

        assert!(gateway.guest_exists("USER 1").await.unwrap());
        assert!(!gateway.guest_exists("NOBODY").await.unwrap());
    }

    #[tokio::test]
    async fn test_mutation_is_not_retried() {
        let (endpoint, state) = spawn_gateway().await;
        let gateway = gateway(endpoint);

        let err = gateway
            .dedicate(&FcpId::parse("1a00").unwrap(), "USER1")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RemoteStatus { status: 503, .. }));
        assert_eq!(state.dedicate_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_configure_attach_sends_body_and_token() {
        let (endpoint, state) = spawn_gateway().await;
        let gateway = gateway(endpoint);

        let request = AttachConfig {
            userid: "USER1".into(),
            fcp_list: vec![FcpId::parse("1a00").unwrap()],
            target_wwpns: vec!["5005076802100c1b".into()],
            target_lun: "0000000000000000".into(),
            multipath: true,
            os_version: "rhel8".into(),
            mount_point: "/dev/sdz".into(),
        };
        gateway.configure_attach(&request).await.unwrap();

        let received = state.attach_requests.lock();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].fcp_list, request.fcp_list);
        assert_eq!(state.authorization.lock().as_deref(), Some("Bearer secret"));
    }

    #[test]
    fn test_invalid_endpoint() {
        let result = RestGateway::new(GatewayConfig {
            endpoint: "not a url".into(),
            ..Default::default()
        });
        assert!(matches!(result, Err(Error::Configuration(_))));
    }
}
