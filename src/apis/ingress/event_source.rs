//! Kubernetes event source
//!
//! Watches Ingress (all namespaces), Service (all namespaces) and Secret
//! (server-side filtered to `type=kubernetes.io/tls`) resources, mirrors
//! them into reflector stores for point-in-time lookup, and turns change
//! notifications into debounced reconcile batches.
//!
//! Service and Secret events are mapped onto the owned Ingresses whose spec
//! references them; events for resources nothing references are dropped.

use futures::StreamExt;
use k8s_openapi::api::core::v1::{Secret, Service};
use k8s_openapi::api::networking::v1::Ingress;
use kube::api::Api;
use kube::runtime::reflector::store::{store, Writer};
use kube::runtime::reflector::{reflector, Store};
use kube::runtime::watcher::{self, Config as WatcherConfig, Event};
use kube::runtime::WatchStreamExt;
use kube::{Client, ResourceExt};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::debounce::{debounce, Debouncer};
use super::reconciler::{safe_read, IngressKey, OwnedSet};

const TLS_SECRET_FIELD_SELECTOR: &str = "type=kubernetes.io/tls";

/// Shared by the watch mappers: pending reconcile keys plus the debouncer
/// that collapses event bursts into one batch.
#[derive(Clone)]
struct KeyQueue {
    pending: Arc<Mutex<HashSet<IngressKey>>>,
    debouncer: Debouncer,
    /// Triggers are held back until the initial list of all caches is done,
    /// so the debouncer never fires during the unsynced phase.
    synced: Arc<AtomicBool>,
}

impl KeyQueue {
    fn note(&self, keys: Vec<IngressKey>) {
        if keys.is_empty() {
            return;
        }
        {
            let mut pending = self
                .pending
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            for key in keys {
                pending.insert(key);
            }
        }
        if self.synced.load(Ordering::Relaxed) {
            self.debouncer.trigger();
        }
    }
}

/// Drain the pending set into a sorted batch.
fn drain_sorted(pending: &Mutex<HashSet<IngressKey>>) -> Vec<IngressKey> {
    let mut keys: Vec<IngressKey> = {
        let mut set = pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        set.drain().collect()
    };
    keys.sort();
    keys
}

/// Does the Ingress spec reference the given Service (same namespace)?
fn references_service(ingress: &Ingress, service_name: &str) -> bool {
    ingress
        .spec
        .iter()
        .flat_map(|spec| spec.rules.iter().flatten())
        .filter_map(|rule| rule.http.as_ref())
        .flat_map(|http| &http.paths)
        .any(|path| {
            path.backend
                .service
                .as_ref()
                .map(|service| service.name == service_name)
                .unwrap_or(false)
        })
}

/// Does the Ingress spec reference the given TLS Secret (same namespace)?
fn references_secret(ingress: &Ingress, secret_name: &str) -> bool {
    ingress
        .spec
        .iter()
        .flat_map(|spec| spec.tls.iter().flatten())
        .any(|tls| tls.secret_name.as_deref() == Some(secret_name))
}

/// Owned Ingress keys affected by a change to the given resource.
fn owned_keys_referencing<F>(owned: &OwnedSet, namespace: &str, matches: F) -> Vec<IngressKey>
where
    F: Fn(&Ingress) -> bool,
{
    safe_read(owned)
        .iter()
        .filter(|(key, ingress)| key.namespace == namespace && matches(ingress))
        .map(|(key, _)| key.clone())
        .collect()
}

/// Watcher trio feeding the reconcile queue.
pub struct EventSource {
    client: Client,
    owned: OwnedSet,
    queue: KeyQueue,
    ingress_store: Store<Ingress>,
    service_store: Store<Service>,
    secret_store: Store<Secret>,
    ingress_writer: Writer<Ingress>,
    service_writer: Writer<Service>,
    secret_writer: Writer<Secret>,
}

impl EventSource {
    /// Create the event source and the batch channel the reconciler
    /// consumes. The debouncer driver is owned by the given token.
    pub fn new(
        client: Client,
        owned: OwnedSet,
        debounce_window: Duration,
        cancel: CancellationToken,
    ) -> (Self, mpsc::UnboundedReceiver<Vec<IngressKey>>) {
        let (batch_tx, batch_rx) = mpsc::unbounded_channel();
        let pending: Arc<Mutex<HashSet<IngressKey>>> = Arc::new(Mutex::new(HashSet::new()));

        let debouncer = {
            let pending = pending.clone();
            debounce(cancel, debounce_window, move || {
                let keys = drain_sorted(&pending);
                if keys.is_empty() {
                    return;
                }
                debug!(keys = keys.len(), "dispatching reconcile batch");
                let _ = batch_tx.send(keys);
            })
        };

        let (ingress_store, ingress_writer) = store();
        let (service_store, service_writer) = store();
        let (secret_store, secret_writer) = store();

        let source = Self {
            client,
            owned,
            queue: KeyQueue {
                pending,
                debouncer,
                synced: Arc::new(AtomicBool::new(false)),
            },
            ingress_store,
            service_store,
            secret_store,
            ingress_writer,
            service_writer,
            secret_writer,
        };
        (source, batch_rx)
    }

    /// Read handle on the Ingress cache.
    pub fn ingresses(&self) -> Store<Ingress> {
        self.ingress_store.clone()
    }

    /// Read handle on the Service cache.
    pub fn services(&self) -> Store<Service> {
        self.service_store.clone()
    }

    /// Read handle on the TLS Secret cache.
    pub fn secrets(&self) -> Store<Secret> {
        self.secret_store.clone()
    }

    /// Resolves once all three caches have completed their initial list.
    pub async fn wait_synced(&self, cancel: &CancellationToken) {
        let ready = futures::future::join3(
            self.ingress_store.wait_until_ready(),
            self.service_store.wait_until_ready(),
            self.secret_store.wait_until_ready(),
        );
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = ready => {}
        }
    }

    /// Run the watcher streams until cancelled.
    pub async fn run(self, cancel: CancellationToken) {
        let ingress_api: Api<Ingress> = Api::all(self.client.clone());
        let service_api: Api<Service> = Api::all(self.client.clone());
        let secret_api: Api<Secret> = Api::all(self.client.clone());

        // once every cache has listed, release the first (complete) batch
        {
            let queue = self.queue.clone();
            let ingresses = self.ingress_store.clone();
            let services = self.service_store.clone();
            let secrets = self.secret_store.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let ready = futures::future::join3(
                    ingresses.wait_until_ready(),
                    services.wait_until_ready(),
                    secrets.wait_until_ready(),
                );
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ready => {}
                }
                info!("informer caches synced");
                queue.synced.store(true, Ordering::Relaxed);
                queue.debouncer.trigger();
            });
        }

        let queue = self.queue;
        let owned = self.owned;

        let ingress_stream = reflector(
            self.ingress_writer,
            watcher(ingress_api, WatcherConfig::default()),
        )
        .default_backoff();
        let service_stream = reflector(
            self.service_writer,
            watcher(service_api, WatcherConfig::default()),
        )
        .default_backoff();
        let secret_stream = reflector(
            self.secret_writer,
            watcher(
                secret_api,
                WatcherConfig::default().fields(TLS_SECRET_FIELD_SELECTOR),
            ),
        )
        .default_backoff();

        let ingress_loop = {
            let queue = queue.clone();
            async move {
                futures::pin_mut!(ingress_stream);
                while let Some(event) = ingress_stream.next().await {
                    match event {
                        Ok(Event::Apply(ingress)) | Ok(Event::InitApply(ingress)) => {
                            queue.note(vec![IngressKey::from_ingress(&ingress)]);
                        }
                        Ok(Event::Delete(ingress)) => {
                            debug!(
                                ingress = %ingress.name_any(),
                                namespace = %ingress.namespace().unwrap_or_default(),
                                "ingress deleted"
                            );
                            queue.note(vec![IngressKey::from_ingress(&ingress)]);
                        }
                        Ok(Event::Init) => debug!("ingress watcher (re)started"),
                        Ok(Event::InitDone) => debug!("ingress watcher initial sync complete"),
                        Err(e) => warn!(error = %e, "ingress watcher error"),
                    }
                }
            }
        };

        let service_loop = {
            let queue = queue.clone();
            let owned = owned.clone();
            async move {
                futures::pin_mut!(service_stream);
                while let Some(event) = service_stream.next().await {
                    match event {
                        Ok(Event::Apply(service))
                        | Ok(Event::InitApply(service))
                        | Ok(Event::Delete(service)) => {
                            let namespace = service.namespace().unwrap_or_default();
                            let name = service.name_any();
                            queue.note(owned_keys_referencing(&owned, &namespace, |ingress| {
                                references_service(ingress, &name)
                            }));
                        }
                        Ok(Event::Init) => debug!("service watcher (re)started"),
                        Ok(Event::InitDone) => debug!("service watcher initial sync complete"),
                        Err(e) => warn!(error = %e, "service watcher error"),
                    }
                }
            }
        };

        let secret_loop = {
            let queue = queue.clone();
            let owned = owned.clone();
            async move {
                futures::pin_mut!(secret_stream);
                while let Some(event) = secret_stream.next().await {
                    match event {
                        Ok(Event::Apply(secret))
                        | Ok(Event::InitApply(secret))
                        | Ok(Event::Delete(secret)) => {
                            let namespace = secret.namespace().unwrap_or_default();
                            let name = secret.name_any();
                            queue.note(owned_keys_referencing(&owned, &namespace, |ingress| {
                                references_secret(ingress, &name)
                            }));
                        }
                        Ok(Event::Init) => debug!("secret watcher (re)started"),
                        Ok(Event::InitDone) => debug!("secret watcher initial sync complete"),
                        Err(e) => warn!(error = %e, "secret watcher error"),
                    }
                }
            }
        };

        tokio::select! {
            _ = cancel.cancelled() => {
                info!("event source stopped");
            }
            _ = futures::future::join3(ingress_loop, service_loop, secret_loop) => {
                warn!("watcher streams ended");
            }
        }
    }
}
