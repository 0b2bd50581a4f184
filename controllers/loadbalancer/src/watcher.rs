//! Kubernetes resource watchers.
//!
//! Every watched kind runs one reflector: the watch stream keeps a
//! [`Store`](kube_runtime::reflector::Store) current and each applied or
//! deleted object is turned into a [`WorkItem`] on the shared queue. The
//! reflector writes the cache before the item is enqueued, so the worker
//! always reads state at least as new as the event it is processing.
//! Watchers never touch generated state.

use crate::error::ControllerError;
use crate::queue::WorkQueue;
use crate::resource::{Resource, WorkItem};
use futures::StreamExt;
use kube::Api;
use kube_runtime::reflector::{self, store::Writer};
use kube_runtime::watcher::{self, Event};
use kube_runtime::WatchStreamExt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Maps a watched object to the work item kind it feeds, if any
pub type ToResource<K> = fn(Arc<K>) -> Resource;

/// Watch `api`, keep `writer` current and enqueue work for every change.
///
/// Kinds that are only read from the cache (Secrets, Nodes) pass `None` as
/// `to_resource`. Returns only if the watch stream ends.
pub async fn watch_resource<K>(
    api: Api<K>,
    config: watcher::Config,
    writer: Writer<K>,
    queue: Arc<WorkQueue>,
    to_resource: Option<ToResource<K>>,
    resource_name: &'static str,
) -> Result<(), ControllerError>
where
    K: kube::Resource + Clone + Send + Sync + std::fmt::Debug + serde::de::DeserializeOwned + 'static,
    K::DynamicType: Default + Eq + std::hash::Hash + Clone + Send + Sync,
{
    info!("Starting {} watcher", resource_name);
    let stream = reflector::reflector(writer, watcher::watcher(api, config).default_backoff());
    let mut stream = std::pin::pin!(stream);

    while let Some(event) = stream.next().await {
        match event {
            Ok(Event::Apply(obj)) | Ok(Event::InitApply(obj)) => {
                if let Some(to_resource) = to_resource {
                    queue.add(WorkItem::new(to_resource(Arc::new(obj)), false));
                }
            }
            Ok(Event::Delete(obj)) => {
                if let Some(to_resource) = to_resource {
                    queue.add(WorkItem::new(to_resource(Arc::new(obj)), true));
                }
            }
            Ok(Event::Init) => debug!("{} watcher relisting", resource_name),
            Ok(Event::InitDone) => debug!("{} watcher initialized", resource_name),
            Err(e) => warn!(error = %e, "{} watcher error, will retry", resource_name),
        }
    }

    Err(ControllerError::Watch(format!("{} watch stream ended", resource_name)))
}
