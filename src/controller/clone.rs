//! Clone reconciler
//!
//! Level-triggered control loop over target PVCs. For every PVC annotated
//! with a clone request it validates the request against the signed clone
//! token and the source PVC, places a finalizer, launches the source worker
//! pod, records completion on the PVC, and owns cleanup of the worker.
//!
//! The loop is a pure function of current cluster state: every invocation
//! re-fetches the PVC and derives all decisions from object annotations and
//! the source pod's live status. No per-PVC state is held in memory;
//! retries, deduplication and backoff belong to the controller runtime's
//! queue.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::core::v1::{
    ObjectReference, PersistentVolumeClaim, Pod, ResourceRequirements,
};
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::runtime::controller::Action;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Client, Resource, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use super::pod::make_clone_source_pod_spec;
use super::{
    actions, annotation, clone_source_pod_name, parse_clone_request_annotation,
    parse_quantity, pod_ready_from_pvc, pod_succeeded_from_pvc, reasons, ANN_CLONE_OF,
    ANN_CLONE_REQUEST, ANN_CLONE_TOKEN, ANN_OWNER_REF, ANN_POD_RESTARTS,
    ANN_UPLOAD_CLIENT_NAME, CLONE_SOURCE_POD_FINALIZER, LABEL_CLONE_UNIQUE_ID,
};
use crate::pki::{CertBundleFetcher, ClientCertGenerator};
use crate::token::{Operation, TokenValidator};
use crate::{Error, Result};

/// Name this controller reports on Events it emits
pub const CLONE_CONTROLLER_NAME: &str = "clone-controller";

/// Validity of the client certificate minted for each source worker
const UPLOAD_CLIENT_CERT_DURATION: Duration = Duration::from_secs(365 * 24 * 3600);

/// Trait abstracting the Kubernetes object operations the reconciler needs
///
/// This allows mocking the API server in tests while using the real client
/// in production.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Fetch a PVC; `None` when it does not exist
    async fn get_pvc(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<PersistentVolumeClaim>>;

    /// Persist a mutated PVC and return the stored object
    async fn update_pvc(&self, pvc: &PersistentVolumeClaim) -> Result<PersistentVolumeClaim>;

    /// List pods in `namespace` carrying the label `key=value`
    async fn list_pods_by_label(
        &self,
        namespace: &str,
        key: &str,
        value: &str,
    ) -> Result<Vec<Pod>>;

    /// Create a pod in its namespace
    async fn create_pod(&self, pod: &Pod) -> Result<Pod>;

    /// Delete a pod; not-found counts as success
    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()>;
}

/// Trait for publishing Kubernetes Events.
///
/// Implementations are fire-and-forget: `publish()` logs failures but never
/// propagates them. A failed event must never break reconciliation.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish an Event on the given resource
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// Real Kubernetes client implementation
pub struct KubeClusterClient {
    client: Client,
}

impl KubeClusterClient {
    /// Create a new KubeClusterClient wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    async fn get_pvc(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<PersistentVolumeClaim>> {
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn update_pvc(&self, pvc: &PersistentVolumeClaim) -> Result<PersistentVolumeClaim> {
        let namespace = pvc.namespace().unwrap_or_default();
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), &namespace);
        Ok(api
            .replace(&pvc.name_any(), &PostParams::default(), pvc)
            .await?)
    }

    async fn list_pods_by_label(
        &self,
        namespace: &str,
        key: &str,
        value: &str,
    ) -> Result<Vec<Pod>> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let params = ListParams::default().labels(&format!("{}={}", key, value));
        Ok(api.list(&params).await?.items)
    }

    async fn create_pod(&self, pod: &Pod) -> Result<Pod> {
        let namespace = pod.namespace().unwrap_or_default();
        let api: Api<Pod> = Api::namespaced(self.client.clone(), &namespace);
        Ok(api.create(&PostParams::default(), pod).await?)
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Production event publisher wrapping `kube::runtime::events::Recorder`
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// Create a new publisher reporting as `controller_name`
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: None,
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, resource_ref).await {
            warn!(reason, action, error = %e, "failed to publish event");
        }
    }
}

/// Controller context shared across all reconciliation calls
pub struct Context {
    /// Kubernetes object operations (trait object for testability)
    pub client: Arc<dyn ClusterClient>,
    /// Event sink for user-visible outcomes
    pub events: Arc<dyn EventPublisher>,
    /// Mints the per-worker client certificate
    pub cert_generator: Arc<dyn ClientCertGenerator>,
    /// Fetches the upload server CA bundle handed to the worker
    pub server_ca_fetcher: Arc<dyn CertBundleFetcher>,
    /// Validator for clone tokens
    pub token_validator: TokenValidator,
    /// Image the source worker runs
    pub image: String,
    /// Pull policy for the worker image
    pub pull_policy: String,
    /// Optional resource requirements copied onto the worker container
    pub resource_requirements: Option<ResourceRequirements>,
}

impl Context {
    /// Create a production context wiring the real client implementations
    pub fn new(
        client: Client,
        token_validator: TokenValidator,
        cert_generator: Arc<dyn ClientCertGenerator>,
        server_ca_fetcher: Arc<dyn CertBundleFetcher>,
        image: String,
        pull_policy: String,
    ) -> Self {
        Self {
            client: Arc::new(KubeClusterClient::new(client.clone())),
            events: Arc::new(KubeEventPublisher::new(client, CLONE_CONTROLLER_NAME)),
            cert_generator,
            server_ca_fetcher,
            token_validator,
            image,
            pull_policy,
            resource_requirements: None,
        }
    }
}

fn has_finalizer(pvc: &PersistentVolumeClaim) -> bool {
    pvc.metadata
        .finalizers
        .as_ref()
        .map(|f| f.iter().any(|x| x == CLONE_SOURCE_POD_FINALIZER))
        .unwrap_or(false)
}

fn should_reconcile(pvc: &PersistentVolumeClaim) -> bool {
    annotation(pvc, ANN_CLONE_REQUEST).is_some()
        && annotation(pvc, ANN_CLONE_OF).is_none()
}

/// Readiness gate: true when the target's upload server reported ready, or
/// when it reported `false` but the upload already succeeded (late events
/// after completion still need to flow into the success path).
fn target_ready_or_succeeded(pvc: &PersistentVolumeClaim) -> bool {
    match pod_ready_from_pvc(pvc) {
        None => false,
        Some(true) => true,
        Some(false) => pod_succeeded_from_pvc(pvc),
    }
}

fn object_ref(pvc: &PersistentVolumeClaim) -> ObjectReference {
    pvc.object_ref(&())
}

/// Reconcile one target PVC
///
/// Invoked by the controller runtime whenever a PVC of interest or an owned
/// pod changes. Always acts on the live object, never the cached event.
#[instrument(skip(pvc, ctx), fields(pvc = %pvc.name_any(), namespace = %pvc.namespace().unwrap_or_default()))]
pub async fn reconcile(
    pvc: Arc<PersistentVolumeClaim>,
    ctx: Arc<Context>,
) -> Result<Action> {
    let namespace = pvc.namespace().unwrap_or_default();
    let name = pvc.name_any();

    let Some(mut pvc) = ctx.client.get_pvc(&namespace, &name).await? else {
        debug!("PVC is gone, nothing to do");
        return Ok(Action::await_change());
    };

    debug!("reconciling clone PVC");

    if !should_reconcile(&pvc) {
        debug!(
            has_clone_request = annotation(&pvc, ANN_CLONE_REQUEST).is_some(),
            has_clone_of = annotation(&pvc, ANN_CLONE_OF).is_some(),
            has_finalizer = has_finalizer(&pvc),
            "PVC needs no reconciliation"
        );
        if has_finalizer(&pvc) {
            // Clone completed or request withdrawn: remove source pod and
            // finalizer.
            cleanup(&pvc, &ctx).await?;
        }
        return Ok(Action::await_change());
    }

    if !target_ready_or_succeeded(&pvc) {
        // Retriggered by the informer when the readiness annotation changes
        debug!("clone target upload pod not ready yet");
        return Ok(Action::await_change());
    }

    let source_pod = find_clone_source_pod(ctx.client.as_ref(), &pvc).await?;

    if source_pod.is_none() {
        match ensure_source_pod(&pvc, &ctx).await {
            Ok(updated) => pvc = updated,
            Err(e) if e.is_validation() => {
                warn!(error = %e, "clone request rejected");
                ctx.events
                    .publish(
                        &object_ref(&pvc),
                        EventType::Warning,
                        reasons::CLONE_VALIDATION_FAILED,
                        actions::RECONCILE,
                        Some(e.to_string()),
                    )
                    .await;
                // User must edit the PVC; retrying cannot help
                return Ok(Action::await_change());
            }
            Err(e) => return Err(e),
        }
    }

    update_pvc_from_pod(source_pod.as_ref(), &pvc, &ctx).await?;
    Ok(Action::await_change())
}

/// Error policy for the controller: log and requeue shortly; exponential
/// backoff beyond that belongs to the runtime's queue.
pub fn error_policy(
    pvc: Arc<PersistentVolumeClaim>,
    error: &Error,
    _ctx: Arc<Context>,
) -> Action {
    error!(?error, pvc = %pvc.name_any(), "reconciliation failed");
    Action::requeue(Duration::from_secs(5))
}

/// Locate the clone source pod for a target PVC by its unique-id label.
///
/// More than one match means the at-most-one invariant broke (split-brain);
/// that is a hard error surfaced to the queue, never auto-healed.
async fn find_clone_source_pod(
    client: &dyn ClusterClient,
    pvc: &PersistentVolumeClaim,
) -> Result<Option<Pod>> {
    let Some((source_namespace, _)) = parse_clone_request_annotation(pvc) else {
        return Ok(None);
    };
    let unique_id = clone_source_pod_name(pvc);

    let mut pods = client
        .list_pods_by_label(&source_namespace, LABEL_CLONE_UNIQUE_ID, &unique_id)
        .await?;

    if pods.len() > 1 {
        return Err(Error::invariant_violated(format!(
            "multiple source pods found for clone PVC {}/{}",
            pvc.namespace().unwrap_or_default(),
            pvc.name_any()
        )));
    }

    Ok(pods.pop())
}

/// Validate the clone request and launch the source worker pod.
///
/// Returns the PVC as persisted after the finalizer write so subsequent
/// bookkeeping acts on the stored object.
async fn ensure_source_pod(
    pvc: &PersistentVolumeClaim,
    ctx: &Context,
) -> Result<PersistentVolumeClaim> {
    let Some((source_namespace, source_name)) = parse_clone_request_annotation(pvc) else {
        return Err(Error::validation("error parsing clone request annotation"));
    };

    let source_pvc = ctx
        .client
        .get_pvc(&source_namespace, &source_name)
        .await?
        .ok_or_else(|| {
            Error::validation(format!(
                "clone source PVC {}/{} not found",
                source_namespace, source_name
            ))
        })?;

    validate_clone_token(&ctx.token_validator, &source_pvc, pvc)?;
    validate_spec_compatibility(&source_pvc, pvc)?;

    let client_name = annotation(pvc, ANN_UPLOAD_CLIENT_NAME)
        .ok_or_else(|| {
            Error::validation(format!(
                "PVC {}/{} missing required {} annotation",
                pvc.namespace().unwrap_or_default(),
                pvc.name_any(),
                ANN_UPLOAD_CLIENT_NAME
            ))
        })?
        .to_string();

    // The finalizer must be durable before the pod exists, otherwise a
    // deletion racing the create could orphan the worker.
    let pvc = add_finalizer_and_persist(pvc, ctx).await?;

    let client_cert = ctx
        .cert_generator
        .make_client_cert(&client_name, UPLOAD_CLIENT_CERT_DURATION)?;
    let server_ca_bundle = ctx.server_ca_fetcher.bundle_bytes().await?;

    let owner_ref = format!(
        "{}/{}",
        pvc.namespace().unwrap_or_default(),
        pvc.name_any()
    );

    let pod = make_clone_source_pod_spec(
        &ctx.image,
        &ctx.pull_policy,
        &source_name,
        &source_namespace,
        &owner_ref,
        &client_cert.key_pem,
        &client_cert.cert_pem,
        &server_ca_bundle,
        &pvc,
        ctx.resource_requirements.as_ref(),
    );

    let created = ctx.client.create_pod(&pod).await?;
    info!(
        pod = %created.name_any(),
        namespace = %source_namespace,
        image = %ctx.image,
        "created clone source pod"
    );

    Ok(pvc)
}

async fn add_finalizer_and_persist(
    pvc: &PersistentVolumeClaim,
    ctx: &Context,
) -> Result<PersistentVolumeClaim> {
    if has_finalizer(pvc) {
        return Ok(pvc.clone());
    }

    let mut updated = pvc.clone();
    updated
        .metadata
        .finalizers
        .get_or_insert_with(Vec::new)
        .push(CLONE_SOURCE_POD_FINALIZER.to_string());
    ctx.client.update_pvc(&updated).await
}

/// Record worker progress on the target PVC: finalizer, completion marker,
/// restart high-water mark. Persists only when something actually changed.
async fn update_pvc_from_pod(
    source_pod: Option<&Pod>,
    pvc: &PersistentVolumeClaim,
    ctx: &Context,
) -> Result<()> {
    let mut updated = pvc.clone();

    if !has_finalizer(&updated) {
        updated
            .metadata
            .finalizers
            .get_or_insert_with(Vec::new)
            .push(CLONE_SOURCE_POD_FINALIZER.to_string());
    }

    if pod_succeeded_from_pvc(pvc) && annotation(pvc, ANN_CLONE_OF) != Some("true") {
        info!("clone completed, marking PVC");
        updated
            .metadata
            .annotations
            .get_or_insert_with(Default::default)
            .insert(ANN_CLONE_OF.to_string(), "true".to_string());
        ctx.events
            .publish(
                &object_ref(pvc),
                EventType::Normal,
                reasons::CLONE_SUCCEEDED,
                actions::RECONCILE,
                Some("Clone Successful".to_string()),
            )
            .await;
    }

    if let Some(restarts) = source_pod
        .and_then(|p| p.status.as_ref())
        .and_then(|s| s.container_statuses.as_ref())
        .and_then(|cs| cs.first())
        .map(|c| c.restart_count)
    {
        // High-water mark only; the annotation never decreases
        let recorded: i32 = annotation(pvc, ANN_POD_RESTARTS)
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        if restarts > recorded {
            updated
                .metadata
                .annotations
                .get_or_insert_with(Default::default)
                .insert(ANN_POD_RESTARTS.to_string(), restarts.to_string());
        }
    }

    if updated != *pvc {
        ctx.client.update_pvc(&updated).await?;
    }
    Ok(())
}

/// Remove the source pod and release the finalizer.
///
/// When the clone succeeded but the source pod is still running, wait for
/// it to exit on its own rather than racing its final write.
async fn cleanup(pvc: &PersistentVolumeClaim, ctx: &Context) -> Result<()> {
    debug!("cleaning up clone source");

    if let Some(pod) = find_clone_source_pod(ctx.client.as_ref(), pvc).await? {
        let terminating = pod.metadata.deletion_timestamp.is_some();
        let running =
            pod.status.as_ref().and_then(|s| s.phase.as_deref()) == Some("Running");

        if !terminating {
            if pod_succeeded_from_pvc(pvc) && running {
                debug!(
                    pod = %pod.name_any(),
                    "clone succeeded, waiting for source pod to stop running"
                );
                return Ok(());
            }

            ctx.client
                .delete_pod(&pod.namespace().unwrap_or_default(), &pod.name_any())
                .await?;
        }
    }

    let mut updated = pvc.clone();
    if let Some(finalizers) = updated.metadata.finalizers.as_mut() {
        finalizers.retain(|f| f != CLONE_SOURCE_POD_FINALIZER);
    }
    if updated != *pvc {
        ctx.client.update_pvc(&updated).await?;
    }
    Ok(())
}

/// Check that the clone token binds exactly this (source, target) pair
fn validate_clone_token(
    validator: &TokenValidator,
    source: &PersistentVolumeClaim,
    target: &PersistentVolumeClaim,
) -> Result<()> {
    let token = annotation(target, ANN_CLONE_TOKEN)
        .ok_or_else(|| Error::token("clone token missing"))?;

    let data = validator.validate(token)?;

    let source_name = source.metadata.name.as_deref().unwrap_or_default();
    let source_namespace = source.metadata.namespace.as_deref().unwrap_or_default();
    let target_name = target.metadata.name.as_deref().unwrap_or_default();
    let target_namespace = target.metadata.namespace.as_deref().unwrap_or_default();

    if data.operation != Operation::Clone
        || data.name != source_name
        || data.namespace != source_namespace
        || data.resource.resource != "persistentvolumeclaims"
        || data.params.get("targetNamespace").map(String::as_str) != Some(target_namespace)
        || data.params.get("targetName").map(String::as_str) != Some(target_name)
    {
        return Err(Error::token("invalid token"));
    }

    Ok(())
}

/// Check that the source can be cloned into the target: the target's storage
/// request is at least the source's, and both volume modes match.
fn validate_spec_compatibility(
    source: &PersistentVolumeClaim,
    target: &PersistentVolumeClaim,
) -> Result<()> {
    let source_request = storage_request_bytes(source)?;
    let target_request = storage_request_bytes(target)?;

    if source_request > target_request {
        return Err(Error::validation(
            "target resources requests storage size is smaller than the source",
        ));
    }

    let source_mode = volume_mode(source);
    let target_mode = volume_mode(target);
    if source_mode != target_mode {
        return Err(Error::validation(format!(
            "source volumeMode ({}) and target volumeMode ({}) do not match",
            source_mode, target_mode
        )));
    }

    Ok(())
}

fn storage_request_bytes(pvc: &PersistentVolumeClaim) -> Result<i128> {
    match pvc
        .spec
        .as_ref()
        .and_then(|s| s.resources.as_ref())
        .and_then(|r| r.requests.as_ref())
        .and_then(|m| m.get("storage"))
    {
        Some(q) => parse_quantity(q),
        None => Ok(0),
    }
}

fn volume_mode(pvc: &PersistentVolumeClaim) -> &str {
    // Absent volume mode means filesystem
    pvc.spec
        .as_ref()
        .and_then(|s| s.volume_mode.as_deref())
        .unwrap_or("Filesystem")
}

/// Map a pod event to the target PVC named by its `ownerRef` annotation.
///
/// Native owner references cannot cross namespaces, so source pods carry
/// their parent's key as an annotation instead.
pub fn pod_to_owner_pvc(pod: Pod) -> Option<ObjectRef<PersistentVolumeClaim>> {
    let ann = pod.metadata.annotations.as_ref()?.get(ANN_OWNER_REF)?;
    let (namespace, name) = ann.split_once('/')?;
    if namespace.is_empty() || name.is_empty() {
        return None;
    }
    Some(ObjectRef::new(name).within(namespace))
}

/// Run the clone controller until shutdown.
///
/// Two informer sources feed the queue: all PVCs, and all pods mapped back
/// to their owning PVC.
pub async fn run(client: Client, ctx: Arc<Context>) {
    let pvcs: Api<PersistentVolumeClaim> = Api::all(client.clone());
    let pods: Api<Pod> = Api::all(client);

    Controller::new(pvcs, WatcherConfig::default())
        .watches(pods, WatcherConfig::default(), pod_to_owner_pvc)
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok(obj) => debug!(?obj, "reconciliation completed"),
                Err(e) => error!(error = ?e, "reconciliation error"),
            }
        })
        .await;
}
