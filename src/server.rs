//! Webhook HTTP server
//!
//! Routes:
//! - `POST /webhook`: GitHub push event, deploys the pushed repository
//! - `GET /health`: liveness
//! - `GET /version`: package name and version as JSON

use crate::deployer::Deployer;
use crate::webhooks::{parse_github_push, verify_github_signature, SIGNATURE_HEADER};
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::{Body, Bytes};
use hyper::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Largest accepted webhook body
pub const MAX_BODY_BYTES: usize = 5 * 1024 * 1024;

fn response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut resp = Response::new(Full::new(body.into()));
    *resp.status_mut() = status;
    resp
}

fn json_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut resp = response(status, body);
    resp.headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    resp
}

/// Shared request handling state
pub struct WebhookState {
    pub deployer: Arc<Deployer>,
    /// HMAC secret; signatures are not checked when unset
    pub secret: Option<String>,
    pub deploy_branches: Vec<String>,
}

/// HTTP server accepting push webhooks
pub struct WebhookServer {
    bind_addr: SocketAddr,
    state: Arc<WebhookState>,
    shutdown_rx: watch::Receiver<bool>,
}

impl WebhookServer {
    pub fn new(bind_addr: SocketAddr, state: Arc<WebhookState>, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            bind_addr,
            state,
            shutdown_rx,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener until shutdown is signalled
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, "Webhook server listening");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let state = Arc::clone(&self.state);
                            tokio::spawn(async move {
                                if let Err(e) = serve_connection(stream, state).await {
                                    debug!(addr = %addr, error = %e, "Webhook connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept webhook connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Webhook server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn serve_connection(stream: tokio::net::TcpStream, state: Arc<WebhookState>) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);
    let service = service_fn(move |req| {
        let state = Arc::clone(&state);
        async move { handle_request(req, state).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Webhook connection error: {}", e))?;

    Ok(())
}

/// Collect the body and dispatch the request
pub async fn handle_request<B>(
    req: Request<B>,
    state: Arc<WebhookState>,
) -> Result<Response<Full<Bytes>>, hyper::Error>
where
    B: Body,
    B::Error: std::error::Error + Send + Sync + 'static,
{
    let (parts, body) = req.into_parts();

    let body = match Limited::new(body, MAX_BODY_BYTES).collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) if e.is::<LengthLimitError>() => {
            warn!(limit = MAX_BODY_BYTES, "Rejected oversized request body");
            return Ok(response(StatusCode::PAYLOAD_TOO_LARGE, "Request body too large"));
        }
        Err(e) => {
            warn!(error = %e, "Failed to read request body");
            return Ok(response(StatusCode::BAD_REQUEST, "Bad request"));
        }
    };

    Ok(route(&parts.method, parts.uri.path(), &parts.headers, body, &state).await)
}

/// Dispatch a fully read request
pub async fn route(
    method: &Method,
    path: &str,
    headers: &HeaderMap,
    body: Bytes,
    state: &WebhookState,
) -> Response<Full<Bytes>> {
    debug!(%method, %path, "Webhook request");

    match (method, path) {
        (&Method::GET, "/health") => response(StatusCode::OK, "OK"),

        (&Method::GET, "/version") => {
            let version_info = serde_json::json!({
                "name": PKG_NAME,
                "version": VERSION,
            });
            json_response(StatusCode::OK, version_info.to_string())
        }

        (&Method::POST, "/webhook") => handle_push(headers, &body, state).await,

        (_, "/webhook") => response(StatusCode::METHOD_NOT_ALLOWED, "Method not allowed"),

        _ => response(StatusCode::NOT_FOUND, "Not found"),
    }
}

async fn handle_push(headers: &HeaderMap, body: &[u8], state: &WebhookState) -> Response<Full<Bytes>> {
    if let Some(secret) = &state.secret {
        let signature = headers
            .get(SIGNATURE_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if !verify_github_signature(secret, body, signature) {
            warn!("Rejected webhook with missing or invalid signature");
            return response(StatusCode::UNAUTHORIZED, "Invalid signature");
        }
    }

    let event = match parse_github_push(body) {
        Ok(event) => event,
        Err(e) => {
            warn!(error = %e, "Malformed webhook payload");
            return response(StatusCode::BAD_REQUEST, "Bad request");
        }
    };

    if !event.should_deploy(&state.deploy_branches) {
        info!(repo = %event.site, branch = %event.branch, "Ignoring push");
        return response(StatusCode::OK, "Ignored - not main/master branch");
    }

    info!(repo = %event.site, branch = %event.branch, "Deploying push");

    // The deploy runs on its own task so a dropped connection cannot cancel
    // it between removing the old container and starting the new one
    let deployer = Arc::clone(&state.deployer);
    let (site, clone_url) = (event.site.clone(), event.clone_url.clone());
    let deploy = tokio::spawn(async move { deployer.deploy(&site, &clone_url).await });

    match deploy.await {
        Ok(Ok(report)) => response(
            StatusCode::OK,
            format!("Deployed {} successfully", report.site),
        ),
        Ok(Err(e)) if e.kind() == "invalid_site" => {
            warn!(repo = %event.site, error = %e, "Rejected push for invalid site name");
            response(StatusCode::BAD_REQUEST, "Bad request")
        }
        Ok(Err(_)) => response(StatusCode::INTERNAL_SERVER_ERROR, "Deployment failed"),
        Err(e) => {
            error!(repo = %event.site, error = %e, "Deploy task did not complete");
            response(StatusCode::INTERNAL_SERVER_ERROR, "Deployment failed")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::caddyfile::ProxyConfigSynthesizer;
    use crate::deployer::DeployerSettings;
    use crate::lifecycle::LifecycleConfig;
    use crate::registry::SiteRegistry;
    use crate::reload::ProxyReloader;
    use crate::testing::{FakeEngine, FakeSource};
    use crate::webhooks::sign_payload;
    use std::time::Duration;
    use tempfile::TempDir;

    async fn state(engine: FakeEngine, secret: Option<&str>) -> (TempDir, Arc<FakeEngine>, WebhookState) {
        let dir = tempfile::tempdir().unwrap();
        let engine = Arc::new(engine);
        let registry = SiteRegistry::open(dir.path().join("sites.yaml")).await.unwrap();
        let deployer = Deployer::new(
            DeployerSettings {
                deployments_dir: dir.path().join("deployments"),
                domain: "example.com".to_string(),
                lifecycle: LifecycleConfig {
                    settle_delay: Duration::ZERO,
                    ..Default::default()
                },
            },
            engine.clone(),
            Arc::new(FakeSource::new().with_file("index.html", "hi")),
            Arc::new(registry),
            ProxyConfigSynthesizer::default(),
            ProxyReloader::new(dir.path().join("Caddyfile"), "true").unwrap(),
        );
        let state = WebhookState {
            deployer: Arc::new(deployer),
            secret: secret.map(str::to_string),
            deploy_branches: vec!["main".to_string(), "master".to_string()],
        };
        (dir, engine, state)
    }

    fn push_body(repo: &str, git_ref: &str) -> Bytes {
        Bytes::from(
            serde_json::json!({
                "ref": git_ref,
                "repository": {
                    "name": repo,
                    "clone_url": format!("https://github.com/owner/{repo}.git"),
                }
            })
            .to_string(),
        )
    }

    async fn body_text(resp: Response<Full<Bytes>>) -> String {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let (_dir, _engine, state) = state(FakeEngine::new(), None).await;
        let resp = route(&Method::GET, "/health", &HeaderMap::new(), Bytes::new(), &state).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_text(resp).await, "OK");
    }

    #[tokio::test]
    async fn test_version() {
        let (_dir, _engine, state) = state(FakeEngine::new(), None).await;
        let resp = route(&Method::GET, "/version", &HeaderMap::new(), Bytes::new(), &state).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let json: serde_json::Value = serde_json::from_str(&body_text(resp).await).unwrap();
        assert_eq!(json["name"], PKG_NAME);
    }

    #[tokio::test]
    async fn test_unknown_path() {
        let (_dir, _engine, state) = state(FakeEngine::new(), None).await;
        let resp = route(&Method::GET, "/nope", &HeaderMap::new(), Bytes::new(), &state).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_webhook_requires_post() {
        let (_dir, _engine, state) = state(FakeEngine::new(), None).await;
        let resp = route(&Method::GET, "/webhook", &HeaderMap::new(), Bytes::new(), &state).await;
        assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn test_bad_json() {
        let (_dir, _engine, state) = state(FakeEngine::new(), None).await;
        let resp = route(&Method::POST, "/webhook", &HeaderMap::new(), Bytes::from("{"), &state).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_other_branch_is_ignored() {
        let (_dir, engine, state) = state(FakeEngine::new(), None).await;
        let body = push_body("blog", "refs/heads/dev");

        let resp = route(&Method::POST, "/webhook", &HeaderMap::new(), body, &state).await;

        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_text(resp).await, "Ignored - not main/master branch");
        assert!(engine.calls().is_empty());
    }

    #[tokio::test]
    async fn test_push_deploys() {
        let (_dir, engine, state) = state(FakeEngine::new(), None).await;
        let body = push_body("blog", "refs/heads/main");

        let resp = route(&Method::POST, "/webhook", &HeaderMap::new(), body, &state).await;

        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_text(resp).await, "Deployed blog successfully");
        assert!(engine.container("blog").unwrap().running);
    }

    #[tokio::test]
    async fn test_invalid_site_name() {
        let (_dir, engine, state) = state(FakeEngine::new(), None).await;
        let body = push_body("../../etc", "refs/heads/main");

        let resp = route(&Method::POST, "/webhook", &HeaderMap::new(), body, &state).await;

        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert!(engine.calls().is_empty());
    }

    #[tokio::test]
    async fn test_failed_deploy() {
        let (_dir, _engine, state) = state(FakeEngine::new().failing_run("blog"), None).await;
        let body = push_body("blog", "refs/heads/master");

        let resp = route(&Method::POST, "/webhook", &HeaderMap::new(), body, &state).await;

        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body_text(resp).await, "Deployment failed");
    }

    #[tokio::test]
    async fn test_deploy_survives_dropped_request() {
        let engine = FakeEngine::new()
            .with_running("blog", "nginx:alpine")
            .slow_run("blog", Duration::from_millis(200));
        let (_dir, engine, state) = state(engine, None).await;
        let previous = engine.container("blog").unwrap();
        let body = push_body("blog", "refs/heads/main");

        // Client goes away while the canonical container is being replaced
        let headers = HeaderMap::new();
        let request = route(&Method::POST, "/webhook", &headers, body, &state);
        assert!(tokio::time::timeout(Duration::from_millis(50), request).await.is_err());

        let mut recorded = 0;
        for _ in 0..100 {
            recorded = state.deployer.registry().records().await.unwrap().len();
            if recorded == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(recorded, 1);

        let current = engine.container("blog").unwrap();
        assert_ne!(current.id, previous.id);
        assert!(current.running);
    }

    #[tokio::test]
    async fn test_signature_required_when_secret_set() {
        let (_dir, engine, state) = state(FakeEngine::new(), Some("s3cret")).await;
        let body = push_body("blog", "refs/heads/main");

        let resp = route(&Method::POST, "/webhook", &HeaderMap::new(), body.clone(), &state).await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert!(engine.calls().is_empty());

        let mut headers = HeaderMap::new();
        headers.insert(
            SIGNATURE_HEADER,
            HeaderValue::from_str(&sign_payload("s3cret", &body).unwrap()).unwrap(),
        );
        let resp = route(&Method::POST, "/webhook", &headers, body, &state).await;
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_oversized_body() {
        let (_dir, _engine, state) = state(FakeEngine::new(), None).await;
        let req = Request::builder()
            .method(Method::POST)
            .uri("/webhook")
            .body(Full::new(Bytes::from(vec![b'x'; MAX_BODY_BYTES + 1])))
            .unwrap();

        let resp = handle_request(req, Arc::new(state)).await.unwrap();

        assert_eq!(resp.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn test_server_shutdown() {
        let (_dir, _engine, state) = state(FakeEngine::new(), None).await;
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (tx, rx) = watch::channel(false);
        let server = WebhookServer::new(listener.local_addr().unwrap(), Arc::new(state), rx);

        let handle = tokio::spawn(server.serve(listener));
        tx.send(true).unwrap();

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
