//! External upload proxy
//!
//! Long-lived HTTP(S) entrypoint for out-of-cluster uploads. Every request
//! is authenticated with a bearer token signed by the apiserver, gated on
//! the target PVC's upload server being ready, and then streamed to the
//! per-target in-cluster upload server through a client built fresh for the
//! request.
//!
//! The per-request client construction is deliberate: certificates rotate
//! underneath a running proxy, and a cached client would pin the old
//! material until restart. Requests are independent; the only shared state
//! is the immutable token validator and the injected fetchers.

use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use futures::TryStreamExt;
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use kube::api::Api;
use kube::Client;
use regex::Regex;
use tracing::{debug, error, info, warn};

#[cfg(test)]
use mockall::automock;

use crate::controller::{pod_ready_from_pvc, pod_succeeded_from_pvc, upload_server_url};
use crate::pki::{CertBundleFetcher, CertFetcher};
use crate::token::{Operation, TokenValidator, TOKEN_LEEWAY, UPLOAD_TOKEN_ISSUER};
use crate::{Error, Result};

/// Health check path
pub const HEALTHZ_PATH: &str = "/healthz";

/// How long a handler polls for the upload server to become ready
const WAIT_READY_TIMEOUT: Duration = Duration::from_secs(10);

/// Cadence of the readiness poll
const WAIT_READY_INTERVAL: Duration = Duration::from_secs(1);

/// Outbound request timeout; upload streams may be very large
const PROXY_REQUEST_TIMEOUT: Duration = Duration::from_secs(24 * 3600);

/// How often the serving certificate is refreshed from the watcher
const CERT_RELOAD_INTERVAL: Duration = Duration::from_secs(60);

static AUTH_HEADER_MATCHER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^Bearer\s+([A-Za-z0-9\-\._~\+/]+)$").expect("valid auth header regex")
});

/// Looks up PVCs for the readiness gate
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PvcLookup: Send + Sync {
    /// Fetch a PVC; `None` when it does not exist
    async fn get_pvc(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<PersistentVolumeClaim>>;
}

/// Builds the outbound mTLS client for a single proxied request
#[cfg_attr(test, automock)]
#[async_trait]
pub trait UploadClientCreator: Send + Sync {
    /// Construct a client from the current certificate material
    async fn create_client(&self) -> Result<reqwest::Client>;
}

/// Supplies the proxy's own serving certificate.
///
/// Polled periodically while serving so a rotated certificate is picked up
/// without downtime.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CertWatcher: Send + Sync {
    /// Current serving certificate and key, both PEM
    async fn current_keypair(&self) -> Result<(Vec<u8>, Vec<u8>)>;
}

/// Real PVC lookup backed by the Kubernetes API
pub struct KubePvcLookup {
    client: Client,
}

impl KubePvcLookup {
    /// Create a lookup wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl PvcLookup for KubePvcLookup {
    async fn get_pvc(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<PersistentVolumeClaim>> {
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }
}

/// Client creator that assembles an mTLS client from fetched material
pub struct CertUploadClientCreator {
    cert_fetcher: Arc<dyn CertFetcher>,
    bundle_fetcher: Arc<dyn CertBundleFetcher>,
}

impl CertUploadClientCreator {
    /// Create a client creator from the given fetchers
    pub fn new(
        cert_fetcher: Arc<dyn CertFetcher>,
        bundle_fetcher: Arc<dyn CertBundleFetcher>,
    ) -> Self {
        Self {
            cert_fetcher,
            bundle_fetcher,
        }
    }
}

#[async_trait]
impl UploadClientCreator for CertUploadClientCreator {
    async fn create_client(&self) -> Result<reqwest::Client> {
        let client_cert = self.cert_fetcher.cert_bytes().await?;
        let client_key = self.cert_fetcher.key_bytes().await?;
        let server_bundle = self.bundle_fetcher.bundle_bytes().await?;

        let mut identity_pem = Vec::with_capacity(client_key.len() + client_cert.len());
        identity_pem.extend_from_slice(&client_key);
        identity_pem.extend_from_slice(&client_cert);
        let identity = reqwest::Identity::from_pem(&identity_pem)
            .map_err(|e| Error::proxy(format!("error parsing upload client key pair: {}", e)))?;

        let mut builder = reqwest::Client::builder()
            .use_rustls_tls()
            .identity(identity)
            .timeout(PROXY_REQUEST_TIMEOUT);

        let roots = pem::parse_many(&server_bundle)
            .map_err(|e| Error::proxy(format!("error parsing upload server CA bundle: {}", e)))?;
        if roots.is_empty() {
            return Err(Error::proxy("upload server CA bundle is empty"));
        }
        for root in &roots {
            let cert = reqwest::Certificate::from_der(root.contents()).map_err(|e| {
                Error::proxy(format!("error parsing upload server CA certificate: {}", e))
            })?;
            builder = builder.add_root_certificate(cert);
        }

        builder
            .build()
            .map_err(|e| Error::proxy(format!("error building upload client: {}", e)))
    }
}

/// Serving certificate watcher backed by files (e.g. a mounted Secret that
/// the deployment rotates in place)
pub struct FileCertWatcher {
    /// Path to the serving certificate PEM
    pub cert_path: std::path::PathBuf,
    /// Path to the serving key PEM
    pub key_path: std::path::PathBuf,
}

#[async_trait]
impl CertWatcher for FileCertWatcher {
    async fn current_keypair(&self) -> Result<(Vec<u8>, Vec<u8>)> {
        let cert = tokio::fs::read(&self.cert_path).await?;
        let key = tokio::fs::read(&self.key_path).await?;
        Ok((cert, key))
    }
}

/// Resolves the upstream URL for `(namespace, pvc, path)`
pub type UrlResolver = Box<dyn Fn(&str, &str, &str) -> String + Send + Sync>;

/// Shared state behind the proxy's routes
pub struct ProxyState {
    /// Validator for upload tokens
    pub token_validator: TokenValidator,
    /// PVC lookup for the readiness gate
    pub pvc_lookup: Arc<dyn PvcLookup>,
    /// Per-request client factory
    pub client_creator: Arc<dyn UploadClientCreator>,
    /// Upstream URL resolver
    pub url_resolver: UrlResolver,
    /// Readiness poll cadence
    pub wait_ready_interval: Duration,
    /// Total time the readiness poll may take
    pub wait_ready_timeout: Duration,
}

impl ProxyState {
    /// Create proxy state with the default URL resolver and poll timings
    pub fn new(
        apiserver_public_key_pem: &[u8],
        pvc_lookup: Arc<dyn PvcLookup>,
        client_creator: Arc<dyn UploadClientCreator>,
    ) -> Result<Self> {
        Ok(Self {
            token_validator: TokenValidator::new(
                UPLOAD_TOKEN_ISSUER,
                apiserver_public_key_pem,
                TOKEN_LEEWAY,
            )?,
            pvc_lookup,
            client_creator,
            url_resolver: Box::new(|namespace, pvc, path| {
                upload_server_url(namespace, pvc, path)
            }),
            wait_ready_interval: WAIT_READY_INTERVAL,
            wait_ready_timeout: WAIT_READY_TIMEOUT,
        })
    }
}

/// The upload proxy server
pub struct UploadProxy {
    bind_address: String,
    bind_port: u16,
    cert_watcher: Option<Arc<dyn CertWatcher>>,
    state: Arc<ProxyState>,
}

impl UploadProxy {
    /// Create a proxy serving `state` on `bind_address:bind_port`.
    ///
    /// With a cert watcher the listener terminates TLS and refreshes its
    /// certificate periodically; without one it serves plain HTTP (test
    /// mode only).
    pub fn new(
        bind_address: &str,
        bind_port: u16,
        cert_watcher: Option<Arc<dyn CertWatcher>>,
        state: ProxyState,
    ) -> Self {
        Self {
            bind_address: bind_address.to_string(),
            bind_port,
            cert_watcher,
            state: Arc::new(state),
        }
    }

    /// Serve until the listener fails. Blocking.
    pub async fn start(self) -> Result<()> {
        let addr: std::net::SocketAddr = format!("{}:{}", self.bind_address, self.bind_port)
            .parse()
            .map_err(|e| Error::config(format!("invalid bind address: {}", e)))?;

        let app = router(self.state.clone());

        match self.cert_watcher {
            Some(watcher) => {
                let (cert, key) = watcher.current_keypair().await?;
                let tls_config = RustlsConfig::from_pem(cert, key)
                    .await
                    .map_err(|e| Error::config(format!("TLS config failed: {}", e)))?;

                // Refresh the serving certificate so rotation needs no restart
                let reload_config = tls_config.clone();
                tokio::spawn(async move {
                    let mut ticker = tokio::time::interval(CERT_RELOAD_INTERVAL);
                    ticker.tick().await;
                    loop {
                        ticker.tick().await;
                        match watcher.current_keypair().await {
                            Ok((cert, key)) => {
                                if let Err(e) = reload_config.reload_from_pem(cert, key).await {
                                    warn!(error = %e, "failed to reload serving certificate");
                                }
                            }
                            Err(e) => {
                                warn!(error = %e, "failed to fetch serving certificate")
                            }
                        }
                    }
                });

                info!(%addr, "upload proxy listening (TLS)");
                axum_server::bind_rustls(addr, tls_config)
                    .serve(app.into_make_service())
                    .await
                    .map_err(|e| Error::proxy(format!("server failed: {}", e)))
            }
            None => {
                info!(%addr, "upload proxy listening (plain HTTP)");
                let listener = tokio::net::TcpListener::bind(addr).await?;
                axum::serve(listener, app)
                    .await
                    .map_err(|e| Error::proxy(format!("server failed: {}", e)))
            }
        }
    }
}

/// Build the proxy router over the given state
pub fn router(state: Arc<ProxyState>) -> Router {
    Router::new()
        .route(HEALTHZ_PATH, any(handle_healthz))
        .route(crate::UPLOAD_PATH_SYNC, any(handle_upload))
        .route(crate::UPLOAD_PATH_ASYNC, any(handle_upload))
        .with_state(state)
}

async fn handle_healthz() -> &'static str {
    "OK"
}

fn bearer_token(request: &Request) -> Option<String> {
    let value = request.headers().get(header::AUTHORIZATION)?.to_str().ok()?;
    AUTH_HEADER_MATCHER
        .captures(value)
        .map(|c| c[1].to_string())
}

async fn handle_upload(State(state): State<Arc<ProxyState>>, request: Request) -> Response {
    let Some(token) = bearer_token(&request) else {
        return StatusCode::BAD_REQUEST.into_response();
    };

    let token_data = match state.token_validator.validate(&token) {
        Ok(data) => data,
        Err(e) => {
            debug!(error = %e, "rejecting upload with invalid token");
            return StatusCode::UNAUTHORIZED.into_response();
        }
    };

    if token_data.operation != Operation::Upload
        || token_data.name.is_empty()
        || token_data.namespace.is_empty()
        || token_data.resource.resource != "persistentvolumeclaims"
    {
        warn!(?token_data, "rejecting upload with mis-scoped token");
        return StatusCode::BAD_REQUEST.into_response();
    }

    debug!(
        pvc = %token_data.name,
        namespace = %token_data.namespace,
        "received valid upload token"
    );

    if let Err(e) = upload_ready(&state, &token_data.namespace, &token_data.name).await {
        warn!(error = %e, "upload target not ready");
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }

    proxy_upload_request(&state, &token_data.namespace, &token_data.name, request).await
}

/// Poll the target PVC until its upload server reports ready.
///
/// Any terminal condition (PVC missing, upload already finished, API error,
/// poll timeout) surfaces as an error; the handler maps them all to 503.
async fn upload_ready(state: &ProxyState, namespace: &str, name: &str) -> Result<()> {
    let deadline = tokio::time::Instant::now() + state.wait_ready_timeout;

    loop {
        let pvc = state
            .pvc_lookup
            .get_pvc(namespace, name)
            .await?
            .ok_or_else(|| {
                Error::proxy(format!(
                    "rejecting upload request for PVC {}/{} that doesn't exist",
                    namespace, name
                ))
            })?;

        if pod_succeeded_from_pvc(&pvc) {
            return Err(Error::proxy(format!(
                "rejecting upload request for PVC {}/{} that already finished uploading",
                namespace, name
            )));
        }

        if pod_ready_from_pvc(&pvc) == Some(true) {
            return Ok(());
        }

        if tokio::time::Instant::now() + state.wait_ready_interval > deadline {
            return Err(Error::proxy(format!(
                "timed out waiting for upload server of PVC {}/{}",
                namespace, name
            )));
        }
        tokio::time::sleep(state.wait_ready_interval).await;
    }
}

async fn proxy_upload_request(
    state: &ProxyState,
    namespace: &str,
    pvc: &str,
    request: Request,
) -> Response {
    let path = request.uri().path().to_string();
    let url = (state.url_resolver)(namespace, pvc, &path);

    let client = match state.client_creator.create_client().await {
        Ok(client) => client,
        Err(e) => {
            error!(error = %e, "error creating upload client");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let Ok(method) = reqwest::Method::from_bytes(request.method().as_str().as_bytes()) else {
        return StatusCode::BAD_REQUEST.into_response();
    };

    let content_length = request
        .headers()
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .map(String::from);

    debug!(method = %method, %url, "proxying upload");

    let body_stream = request.into_body().into_data_stream();
    let mut outbound = client
        .request(method, &url)
        .body(reqwest::Body::wrap_stream(body_stream));
    if let Some(len) = content_length {
        outbound = outbound.header("content-length", len);
    }

    let upstream = match outbound.send().await {
        Ok(response) => response,
        Err(e) => {
            error!(error = %e, %url, "error proxying upload");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let status = StatusCode::from_u16(upstream.status().as_u16())
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    debug!(status = %status, %url, "upstream response");

    // The status is committed here; a failure while streaming the body back
    // can only be logged and the connection aborted.
    let body = upstream
        .bytes_stream()
        .inspect_err(move |e| error!(error = %e, %url, "error streaming upload response"));

    match Response::builder().status(status).body(Body::from_stream(body)) {
        Ok(response) => response,
        Err(e) => {
            error!(error = %e, "error building proxied response");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::{ANN_POD_PHASE, ANN_POD_READY};
    use crate::token::{
        testkeys, GroupVersionResource, TokenData, TokenGenerator, CLONE_TOKEN_ISSUER,
    };
    use axum::body::to_bytes;
    use axum::http::Request as HttpRequest;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::collections::{BTreeMap, HashMap};
    use tower::ServiceExt;

    fn upload_token(overrides: impl FnOnce(&mut TokenData)) -> String {
        let mut data = TokenData {
            operation: Operation::Upload,
            name: "pvc-dst".to_string(),
            namespace: "prod".to_string(),
            resource: GroupVersionResource::persistent_volume_claims(),
            params: HashMap::new(),
        };
        overrides(&mut data);
        TokenGenerator::new(UPLOAD_TOKEN_ISSUER, testkeys::RSA_PRIVATE_KEY.as_bytes())
            .unwrap()
            .generate(&data, Duration::from_secs(300))
            .unwrap()
    }

    fn pvc_with_annotations(annotations: &[(&str, &str)]) -> PersistentVolumeClaim {
        let map: BTreeMap<String, String> = annotations
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some("pvc-dst".to_string()),
                namespace: Some("prod".to_string()),
                annotations: (!map.is_empty()).then_some(map),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Test state with compressed poll timings and injectable mocks
    fn state(
        pvc_lookup: MockPvcLookup,
        client_creator: MockUploadClientCreator,
        url_resolver: Option<UrlResolver>,
    ) -> Arc<ProxyState> {
        let mut state = ProxyState::new(
            testkeys::RSA_PUBLIC_KEY.as_bytes(),
            Arc::new(pvc_lookup),
            Arc::new(client_creator),
        )
        .unwrap();
        state.wait_ready_interval = Duration::from_millis(1);
        state.wait_ready_timeout = Duration::from_millis(5);
        if let Some(resolver) = url_resolver {
            state.url_resolver = resolver;
        }
        Arc::new(state)
    }

    fn ready_lookup() -> MockPvcLookup {
        let mut lookup = MockPvcLookup::new();
        lookup.expect_get_pvc().returning(|_, _| {
            Ok(Some(pvc_with_annotations(&[(ANN_POD_READY, "true")])))
        });
        lookup
    }

    fn plain_client_creator() -> MockUploadClientCreator {
        let mut creator = MockUploadClientCreator::new();
        creator
            .expect_create_client()
            .returning(|| Ok(reqwest::Client::new()));
        creator
    }

    async fn send(
        router: Router,
        request: HttpRequest<Body>,
    ) -> (StatusCode, String) {
        let response = router.oneshot(request).await.unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), 1024 * 1024).await.unwrap();
        (status, String::from_utf8_lossy(&body).to_string())
    }

    fn upload_request(auth: Option<&str>, body: &str) -> HttpRequest<Body> {
        let mut builder = HttpRequest::builder()
            .method("POST")
            .uri(crate::UPLOAD_PATH_SYNC);
        if let Some(auth) = auth {
            builder = builder.header("authorization", auth);
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    /// Spawn a real upstream that answers `status` and echoes the request
    /// body prefixed with `got:`. Returns a resolver pointing at it.
    async fn spawn_upstream(status: StatusCode) -> UrlResolver {
        let app = Router::new().route(
            crate::UPLOAD_PATH_SYNC,
            any(move |body: String| async move { (status, format!("got:{}", body)) }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Box::new(move |_, _, path| format!("http://{}{}", addr, path))
    }

    #[tokio::test]
    async fn healthz_returns_ok() {
        let router = router(state(
            MockPvcLookup::new(),
            MockUploadClientCreator::new(),
            None,
        ));
        let request = HttpRequest::builder()
            .method("GET")
            .uri(HEALTHZ_PATH)
            .body(Body::empty())
            .unwrap();

        let (status, body) = send(router, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "OK");
    }

    #[tokio::test]
    async fn missing_and_malformed_auth_headers_are_bad_requests() {
        for auth in [
            None,
            Some("Basic xxx"),
            Some("Bearer"),
            Some("Bearer two tokens"),
            Some("Bearer bad token !!"),
        ] {
            let router = router(state(
                MockPvcLookup::new(),
                MockUploadClientCreator::new(),
                None,
            ));
            let (status, _) = send(router, upload_request(auth, "")).await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "auth header {:?}", auth);
        }
    }

    #[tokio::test]
    async fn bearer_scheme_is_case_insensitive() {
        let token = upload_token(|_| {});
        let router = router(state(
            ready_lookup(),
            plain_client_creator(),
            Some(spawn_upstream(StatusCode::OK).await),
        ));

        let (status, _) = send(
            router,
            upload_request(Some(&format!("bEaReR {}", token)), "x"),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn unverifiable_token_is_unauthorized() {
        let router = router(state(
            MockPvcLookup::new(),
            MockUploadClientCreator::new(),
            None,
        ));
        let (status, _) = send(router, upload_request(Some("Bearer notajwt"), "")).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn clone_issuer_token_is_unauthorized() {
        let token = TokenGenerator::new(CLONE_TOKEN_ISSUER, testkeys::RSA_PRIVATE_KEY.as_bytes())
            .unwrap()
            .generate(
                &TokenData {
                    operation: Operation::Upload,
                    name: "pvc-dst".to_string(),
                    namespace: "prod".to_string(),
                    resource: GroupVersionResource::persistent_volume_claims(),
                    params: HashMap::new(),
                },
                Duration::from_secs(300),
            )
            .unwrap();

        let router = router(state(
            MockPvcLookup::new(),
            MockUploadClientCreator::new(),
            None,
        ));
        let (status, _) = send(router, upload_request(Some(&format!("Bearer {}", token)), "")).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn mis_scoped_tokens_are_bad_requests() {
        let mutations: Vec<Box<dyn FnOnce(&mut TokenData)>> = vec![
            Box::new(|d| d.operation = Operation::Clone),
            Box::new(|d| d.name = String::new()),
            Box::new(|d| d.namespace = String::new()),
            Box::new(|d| d.resource.resource = "pods".to_string()),
        ];

        for mutation in mutations {
            let token = upload_token(mutation);
            let router = router(state(
                MockPvcLookup::new(),
                MockUploadClientCreator::new(),
                None,
            ));
            let (status, _) =
                send(router, upload_request(Some(&format!("Bearer {}", token)), "")).await;
            assert_eq!(status, StatusCode::BAD_REQUEST);
        }
    }

    #[tokio::test]
    async fn never_ready_target_times_out_with_503() {
        let mut lookup = MockPvcLookup::new();
        lookup
            .expect_get_pvc()
            .returning(|_, _| Ok(Some(pvc_with_annotations(&[]))));

        // The client creator mock has no expectations: any attempt to reach
        // upstream panics the test.
        let token = upload_token(|_| {});
        let router = router(state(lookup, MockUploadClientCreator::new(), None));

        let (status, _) =
            send(router, upload_request(Some(&format!("Bearer {}", token)), "")).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn missing_pvc_is_503() {
        let mut lookup = MockPvcLookup::new();
        lookup.expect_get_pvc().returning(|_, _| Ok(None));

        let token = upload_token(|_| {});
        let router = router(state(lookup, MockUploadClientCreator::new(), None));

        let (status, _) =
            send(router, upload_request(Some(&format!("Bearer {}", token)), "")).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn finished_upload_is_503() {
        let mut lookup = MockPvcLookup::new();
        lookup.expect_get_pvc().returning(|_, _| {
            Ok(Some(pvc_with_annotations(&[
                (ANN_POD_READY, "true"),
                (ANN_POD_PHASE, "Succeeded"),
            ])))
        });

        let token = upload_token(|_| {});
        let router = router(state(lookup, MockUploadClientCreator::new(), None));

        let (status, _) =
            send(router, upload_request(Some(&format!("Bearer {}", token)), "")).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn upload_streams_body_and_mirrors_upstream_status() {
        let token = upload_token(|_| {});
        let router = router(state(
            ready_lookup(),
            plain_client_creator(),
            Some(spawn_upstream(StatusCode::OK).await),
        ));

        let (status, body) = send(
            router,
            upload_request(Some(&format!("Bearer {}", token)), "disk-bytes"),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "got:disk-bytes");
    }

    #[tokio::test]
    async fn upstream_error_status_is_mirrored_verbatim() {
        let token = upload_token(|_| {});
        let router = router(state(
            ready_lookup(),
            plain_client_creator(),
            Some(spawn_upstream(StatusCode::IM_A_TEAPOT).await),
        ));

        let (status, _) = send(
            router,
            upload_request(Some(&format!("Bearer {}", token)), "x"),
        )
        .await;
        assert_eq!(status, StatusCode::IM_A_TEAPOT);
    }

    #[tokio::test]
    async fn unreachable_upstream_is_500() {
        let token = upload_token(|_| {});
        // TCP port 1 is never listening
        let resolver: UrlResolver =
            Box::new(|_, _, path| format!("http://127.0.0.1:1{}", path));
        let router = router(state(ready_lookup(), plain_client_creator(), Some(resolver)));

        let (status, _) = send(
            router,
            upload_request(Some(&format!("Bearer {}", token)), "x"),
        )
        .await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn default_resolver_points_at_per_target_service() {
        let state = ProxyState::new(
            testkeys::RSA_PUBLIC_KEY.as_bytes(),
            Arc::new(MockPvcLookup::new()),
            Arc::new(MockUploadClientCreator::new()),
        )
        .unwrap();

        assert_eq!(
            (state.url_resolver)("prod", "pvc-dst", crate::UPLOAD_PATH_SYNC),
            "https://cdi-upload-pvc-dst.prod.svc/upload/sync"
        );
    }
}
