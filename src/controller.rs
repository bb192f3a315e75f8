use crate::cloner::{CloneError, ImageCloner, mirror_reference};
use crate::finalizers;
use crate::predicates::{self, TemplateTracker};
use crate::workload::Workload;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Container;
use kube::api::PostParams;
use kube::runtime::Controller;
use kube::runtime::controller::Action;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::{Api, Client, ResourceExt};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Finalizer that guards mirrored workloads against deletion. The reconciler
/// removes it as part of every mutation; nothing here ever adds it.
static DEL_PROTECTION_FINALIZER: &str = "image-cloner/del-protection";

/// Bounds for the optimistic-concurrency retry on workload updates.
const UPDATE_ATTEMPTS: u32 = 5;
const UPDATE_RETRY_DELAY: Duration = Duration::from_millis(10);

/// Requeue delay after a failed reconciliation.
const ERROR_REQUEUE_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("failed to clone image {image}: {source}")]
    CloneImage { image: String, source: CloneError },
    #[error("failed to update workload: {0}")]
    Update(#[from] kube::Error),
}

/// State shared by both workload controllers. Built once at start-up and
/// read-only afterwards, except for the template tracker which synchronizes
/// internally.
pub struct Context<C> {
    pub client: Client,
    pub cloner: C,
    pub mirror_prefix: String,
    pub templates: TemplateTracker,
}

pub async fn create_client() -> anyhow::Result<Client> {
    let client = Client::try_default().await?;
    let api_server_info = client.apiserver_version().await?;
    info!(
        "Connected to namespace {}, in-cluster Kubernetes API server with version {}.{}",
        client.default_namespace(),
        api_server_info.major,
        api_server_info.minor
    );
    Ok(client)
}

/// Reconciles a single workload: clone every image that is not yet mirrored,
/// rewrite the references, drop the deletion-protection finalizer and persist
/// the result.
pub async fn reconcile<K, C>(object: Arc<K>, ctx: Arc<Context<C>>) -> Result<Action, ReconcileError>
where
    K: Workload,
    C: ImageCloner + Send + Sync,
{
    // Event admission: namespace filter, already-mirrored filter, unchanged-spec filter
    if !predicates::outside_kube_system(object.as_ref())
        || !predicates::first_image_unmirrored(&ctx.mirror_prefix, object.as_ref())
        || !ctx.templates.accepts(object.as_ref())
    {
        return Ok(Action::await_change());
    }

    let namespace = object.namespace().unwrap_or_default();
    let name = object.name_any();
    let api: Api<K> = Api::namespaced(ctx.client.clone(), &namespace);

    // Work from the latest revision, not the event snapshot
    let mut workload = match api.get(&name).await {
        Ok(workload) => workload,
        Err(err) => {
            // The watch redelivers; nothing to retry here
            warn!(
                "failed to get {} {}/{}: {}",
                K::kind_name(),
                namespace,
                name,
                err
            );
            return Ok(Action::await_change());
        }
    };

    let changed = mirror_images(&mut workload, &ctx.cloner, &ctx.mirror_prefix).await?;
    if changed {
        persist(&api, &name, &workload).await?;
        info!(
            "reconciliation of {} {}/{} successfully finished",
            K::kind_name(),
            namespace,
            name
        );
    } else {
        debug!(
            "nothing to mirror in {} {}/{}",
            K::kind_name(),
            namespace,
            name
        );
    }

    ctx.templates.record_success(&workload);
    Ok(Action::await_change())
}

/// Walks the containers in declared order, cloning each unmirrored image and
/// rewriting its reference in memory. Returns whether anything changed;
/// nothing is persisted here.
async fn mirror_images<K, C>(
    workload: &mut K,
    cloner: &C,
    mirror_prefix: &str,
) -> Result<bool, ReconcileError>
where
    K: Workload,
    C: ImageCloner,
{
    let images: Vec<Option<String>> = workload
        .containers()
        .iter()
        .map(|container| container.image.clone())
        .collect();
    let mut changed = false;

    for (index, image) in images.into_iter().enumerate() {
        let Some(image) = image else {
            continue;
        };
        debug!("starting reconciling image {}", image);

        if cloner.is_mirrored(&image) {
            debug!("image {} has already been cloned", image);
            continue;
        }

        let destination = mirror_reference(mirror_prefix, &image);
        cloner
            .clone_image(&image, &destination)
            .await
            .map_err(|source| ReconcileError::CloneImage {
                image: image.clone(),
                source,
            })?;

        if let Some(spec) = workload.pod_spec_mut() {
            spec.containers[index].image = Some(destination);
        }
        let remaining = finalizers::remove(workload.finalizers(), DEL_PROTECTION_FINALIZER);
        *workload.finalizers_mut() = remaining;
        changed = true;
    }

    Ok(changed)
}

/// Splices the mutated container list and finalizer list into a freshly
/// fetched revision of the object.
fn graft<K: Workload>(latest: &mut K, containers: &[Container], finalizer_list: &[String]) {
    if let Some(spec) = latest.pod_spec_mut() {
        spec.containers = containers.to_vec();
    }
    *latest.finalizers_mut() = finalizer_list.to_vec();
}

/// Persists the mutation under optimistic-concurrency retry: re-fetch the
/// latest revision, graft the mutated fields in, and update. Version conflicts
/// retry with a short ramped delay; any other error propagates.
async fn persist<K: Workload>(api: &Api<K>, name: &str, mutated: &K) -> Result<(), ReconcileError> {
    let containers = mutated.containers().to_vec();
    let finalizer_list = mutated.finalizers().to_vec();

    let mut attempt = 1;
    loop {
        let mut latest = api.get(name).await?;
        graft(&mut latest, &containers, &finalizer_list);

        match api.replace(name, &PostParams::default(), &latest).await {
            Ok(_) => return Ok(()),
            Err(kube::Error::Api(response))
                if response.code == 409 && attempt < UPDATE_ATTEMPTS =>
            {
                debug!(
                    "update conflict on {}, attempt {}/{}",
                    name, attempt, UPDATE_ATTEMPTS
                );
                sleep(UPDATE_RETRY_DELAY * attempt).await;
                attempt += 1;
            }
            Err(err) => return Err(err.into()),
        }
    }
}

pub fn error_policy<K, C>(object: Arc<K>, error: &ReconcileError, _ctx: Arc<Context<C>>) -> Action
where
    K: Workload,
    C: ImageCloner,
{
    warn!(
        "reconciliation of {} {} failed: {}",
        K::kind_name(),
        object.name_any(),
        error
    );
    Action::requeue(ERROR_REQUEUE_DELAY)
}

/// Binds the reconciler for one workload kind to the manager: watch all
/// namespaces, gate events through the predicate chain and drive the work
/// queue until shutdown.
pub async fn run<K, C>(ctx: Arc<Context<C>>)
where
    K: Workload,
    C: ImageCloner + Send + Sync + 'static,
{
    let api: Api<K> = Api::all(ctx.client.clone());
    info!("Starting {} controller", K::kind_name());

    Controller::new(api, WatcherConfig::default())
        .shutdown_on_signal()
        .run(reconcile::<K, C>, error_policy::<K, C>, ctx)
        .for_each(|result| async move {
            match result {
                Ok((object, _)) => debug!("reconciled {:?}", object),
                Err(err) => warn!("reconciler stream error: {}", err),
            }
        })
        .await;
}
