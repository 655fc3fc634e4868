//! Ingress reconciliation
//!
//! Single-writer loop that converges watched Ingress/Service/Secret state
//! into routing snapshots. Per reconcile request the owned copy of the
//! Ingress spec is refreshed (or dropped when the object vanished or changed
//! class); when anything changed, a complete snapshot is rebuilt from the
//! whole owned set, published, and the desired status is pushed back.

use k8s_openapi::api::core::v1::{Secret, Service};
use k8s_openapi::api::networking::v1::{Ingress, IngressServiceBackend};
use kube::runtime::reflector::{ObjectRef, Store};
use kube::ResourceExt;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::status::StatusWriter;
use crate::error::IngressError;
use crate::proxy::snapshot::{BackendPath, PathKind, PathRoute, Snapshot, SnapshotCell, TlsBundle};
use crate::proxy::tls::parse_certified_key;

/// Legacy class annotation, honored when `spec.ingressClassName` is unset.
pub const LEGACY_CLASS_ANNOTATION: &str = "kubernetes.io/ingress.class";

const TLS_SECRET_TYPE: &str = "kubernetes.io/tls";

/// Key for an owned Ingress: (namespace, name)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IngressKey {
    pub namespace: String,
    pub name: String,
}

impl IngressKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn from_ingress(ingress: &Ingress) -> Self {
        Self {
            namespace: ingress.namespace().unwrap_or_default(),
            name: ingress.name_any(),
        }
    }
}

impl fmt::Display for IngressKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// The set of Ingress objects this controller currently owns.
///
/// Read-locked by the watch mappers, write-locked by the reconcile step.
pub type OwnedSet = Arc<RwLock<HashMap<IngressKey, Arc<Ingress>>>>;

/// Read lock with poison recovery.
pub(crate) fn safe_read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Write lock with poison recovery.
pub(crate) fn safe_write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Class filter: accept iff `spec.ingressClassName` matches, or the legacy
/// annotation matches while `spec.ingressClassName` is unset.
pub fn class_matches(ingress: &Ingress, class_name: &str) -> bool {
    match ingress
        .spec
        .as_ref()
        .and_then(|spec| spec.ingress_class_name.as_deref())
    {
        Some(name) => name == class_name,
        None => ingress
            .annotations()
            .get(LEGACY_CLASS_ANNOTATION)
            .map(|value| value == class_name)
            .unwrap_or(false),
    }
}

/// Single-writer reconciler over the owned Ingress set.
pub struct Reconciler {
    ingresses: Store<Ingress>,
    services: Store<Service>,
    secrets: Store<Secret>,
    owned: OwnedSet,
    class_name: String,
    snapshots: Arc<SnapshotCell>,
    status: Option<StatusWriter>,
}

impl Reconciler {
    pub fn new(
        ingresses: Store<Ingress>,
        services: Store<Service>,
        secrets: Store<Secret>,
        owned: OwnedSet,
        class_name: String,
        snapshots: Arc<SnapshotCell>,
        status: Option<StatusWriter>,
    ) -> Self {
        Self {
            ingresses,
            services,
            secrets,
            owned,
            class_name,
            snapshots,
            status,
        }
    }

    /// Consume reconcile batches until cancelled. Waits for the initial
    /// list of all three caches before the first reconcile.
    pub async fn run(
        &self,
        mut requests: mpsc::UnboundedReceiver<Vec<IngressKey>>,
        cancel: CancellationToken,
    ) {
        let synced = futures::future::join3(
            self.ingresses.wait_until_ready(),
            self.services.wait_until_ready(),
            self.secrets.wait_until_ready(),
        );
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = synced => {
                debug!("reconciler sees synced caches");
            }
        }

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                batch = requests.recv() => {
                    let Some(keys) = batch else { return };
                    self.reconcile(keys).await;
                }
            }
        }
    }

    /// Reconcile a batch of keys. Rebuild, publication and status push are
    /// skipped entirely when no key changed the owned set.
    pub async fn reconcile(&self, keys: Vec<IngressKey>) {
        let mut changed = false;
        for key in &keys {
            changed |= self.apply_key(key);
        }
        if !changed {
            debug!(keys = keys.len(), "no spec changes, keeping current snapshot");
            return;
        }

        let (snapshot, build_results) = self.build_snapshot();
        self.snapshots.publish(snapshot);
        info!("routing snapshot updated");

        if let Some(status) = &self.status {
            // blocks so a new reconcile never races its own status reads
            status.apply_errors(build_results).await;
        }
    }

    /// Refresh the owned copy for one key. Returns whether anything changed.
    fn apply_key(&self, key: &IngressKey) -> bool {
        let current = self
            .ingresses
            .get(&ObjectRef::new(&key.name).within(&key.namespace));

        let Some(ingress) = current else {
            return self.remove_owned(key, "ingress deleted");
        };
        if !class_matches(&ingress, &self.class_name) {
            return self.remove_owned(key, "ingress class does not match");
        }

        let mut owned = safe_write(&self.owned);
        match owned.get(key) {
            Some(existing) if existing.spec == ingress.spec => false,
            _ => {
                info!(ingress = %key, "accepted ingress spec");
                owned.insert(key.clone(), ingress);
                true
            }
        }
    }

    fn remove_owned(&self, key: &IngressKey, reason: &str) -> bool {
        let removed = safe_write(&self.owned).remove(key).is_some();
        if removed {
            info!(ingress = %key, reason = reason, "dropped ingress from owned set");
        }
        removed
    }

    /// Build a fresh snapshot from the whole owned set. Also returns the
    /// per-Ingress build errors for the status write-back.
    pub(crate) fn build_snapshot(&self) -> (Snapshot, Vec<(Arc<Ingress>, Vec<IngressError>)>) {
        // deterministic iteration so sort ties are stable across rebuilds
        let owned: Vec<(IngressKey, Arc<Ingress>)> = {
            let guard = safe_read(&self.owned);
            let mut items: Vec<_> = guard
                .iter()
                .map(|(key, ingress)| (key.clone(), ingress.clone()))
                .collect();
            items.sort_by(|a, b| a.0.cmp(&b.0));
            items
        };

        let mut snapshot = Snapshot::default();
        let mut build_results = Vec::with_capacity(owned.len());
        for (key, ingress) in owned {
            let mut errors = self.collect_backend_paths(&ingress, &mut snapshot);
            errors.extend(self.collect_tls_secrets(&ingress, &mut snapshot));
            debug!(ingress = %key, errors = errors.len(), "collected ingress state");
            build_results.push((ingress, errors));
        }

        for domain in snapshot.routing.values_mut() {
            domain.sort_routes();
        }
        (snapshot, build_results)
    }

    /// Collect the backend paths of one Ingress into the snapshot, resolving
    /// service ports. Unresolvable paths are dropped and reported.
    fn collect_backend_paths(&self, ingress: &Ingress, snapshot: &mut Snapshot) -> Vec<IngressError> {
        let mut errors = Vec::new();
        let namespace = ingress.namespace().unwrap_or_default();
        let Some(spec) = &ingress.spec else {
            return errors;
        };

        for rule in spec.rules.iter().flatten() {
            let Some(http) = &rule.http else { continue };
            let host = rule.host.clone().unwrap_or_default();
            for path_spec in &http.paths {
                let path = path_spec.path.clone().unwrap_or_default();
                let Some(service) = &path_spec.backend.service else {
                    warn!(
                        ingress = %ingress.name_any(),
                        namespace = %namespace,
                        path = %path,
                        "backend has no service reference"
                    );
                    errors.push(IngressError::InvalidBackendService { path });
                    continue;
                };
                match self.resolve_service_port(&namespace, service, &path) {
                    Ok(service_port) => {
                        let backend = BackendPath {
                            kind: PathKind::parse(&path_spec.path_type),
                            path,
                            namespace: namespace.clone(),
                            service_name: service.name.clone(),
                            service_port,
                        };
                        snapshot.domain_mut(&host).routes.push(PathRoute::new(backend));
                    }
                    Err(error) => {
                        warn!(
                            ingress = %ingress.name_any(),
                            namespace = %namespace,
                            service = %service.name,
                            error = %error,
                            "could not determine service port, skipping path"
                        );
                        errors.push(error);
                    }
                }
            }
        }
        errors
    }

    /// Resolve the backend port against the referenced Service. A matching
    /// port number takes precedence over a matching port name.
    fn resolve_service_port(
        &self,
        namespace: &str,
        backend: &IngressServiceBackend,
        path: &str,
    ) -> Result<i32, IngressError> {
        let number = backend.port.as_ref().and_then(|port| port.number);
        let name = backend.port.as_ref().and_then(|port| port.name.as_deref());
        if number.is_none() && name.is_none() {
            return Err(IngressError::InvalidBackendService {
                path: path.to_string(),
            });
        }

        let service = self
            .services
            .get(&ObjectRef::new(&backend.name).within(namespace))
            .ok_or_else(|| IngressError::ServicePortNotFound {
                service: backend.name.clone(),
                port: number.unwrap_or_default(),
            })?;
        let ports = service
            .spec
            .as_ref()
            .and_then(|spec| spec.ports.as_deref())
            .unwrap_or_default();

        if let Some(number) = number {
            if ports.iter().any(|port| port.port == number) {
                return Ok(number);
            }
        }
        if let Some(name) = name {
            if let Some(port) = ports.iter().find(|port| port.name.as_deref() == Some(name)) {
                return Ok(port.port);
            }
            return Err(IngressError::ServicePortNameNotFound {
                service: backend.name.clone(),
                name: name.to_string(),
                namespace: namespace.to_string(),
            });
        }
        Err(IngressError::ServicePortNotFound {
            service: backend.name.clone(),
            port: number.unwrap_or_default(),
        })
    }

    /// Collect the TLS bundles referenced by one Ingress into the snapshot.
    /// The raw bytes always land in the host's domain config; only key pairs
    /// that parse become SNI certificates.
    fn collect_tls_secrets(&self, ingress: &Ingress, snapshot: &mut Snapshot) -> Vec<IngressError> {
        let mut errors = Vec::new();
        let namespace = ingress.namespace().unwrap_or_default();
        let Some(spec) = &ingress.spec else {
            return errors;
        };

        for rule in spec.tls.iter().flatten() {
            let secret_name = rule.secret_name.clone().unwrap_or_default();
            let Some(secret) = self
                .secrets
                .get(&ObjectRef::new(&secret_name).within(&namespace))
            else {
                warn!(
                    ingress = %ingress.name_any(),
                    namespace = %namespace,
                    secret = %secret_name,
                    "referenced TLS secret not found"
                );
                errors.push(IngressError::TlsCertMissing {
                    secret: secret_name,
                });
                continue;
            };

            let secret_type = secret.type_.clone().unwrap_or_default();
            if secret_type != TLS_SECRET_TYPE {
                warn!(
                    secret = %secret_name,
                    namespace = %namespace,
                    type_ = %secret_type,
                    "secret type mismatch, required kubernetes.io/tls"
                );
                errors.push(IngressError::TlsCertWrongType {
                    secret: secret_name,
                    type_: secret_type,
                });
                continue;
            }

            let data = secret.data.as_ref();
            let cert = data
                .and_then(|d| d.get("tls.crt"))
                .map(|b| b.0.clone())
                .unwrap_or_default();
            let key = data
                .and_then(|d| d.get("tls.key"))
                .map(|b| b.0.clone())
                .unwrap_or_default();

            for host in rule.hosts.iter().flatten() {
                snapshot.domain_mut(host).tls = Some(TlsBundle {
                    cert: cert.clone(),
                    key: key.clone(),
                });
            }

            match parse_certified_key(&cert, &key) {
                Ok(certified) => {
                    let certified = Arc::new(certified);
                    for host in rule.hosts.iter().flatten() {
                        info!(host = %host, secret = %secret_name, "loaded certificate");
                        snapshot.certs.insert(host.clone(), certified.clone());
                    }
                }
                Err(e) => {
                    warn!(
                        secret = %secret_name,
                        namespace = %namespace,
                        error = %e,
                        "TLS key pair does not parse, no SNI certificate for its hosts"
                    );
                }
            }
        }
        errors
    }

    /// Remove this controller's status entries from every owned Ingress.
    /// Called once during shutdown.
    pub async fn clean_ingress_status(&self) {
        let Some(status) = &self.status else { return };
        let owned: Vec<Arc<Ingress>> = safe_read(&self.owned).values().cloned().collect();
        status.clean_all(owned).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::tls::test_support::{init_crypto, self_signed};
    use k8s_openapi::api::core::v1::{ServicePort, ServiceSpec};
    use k8s_openapi::api::networking::v1::{
        HTTPIngressPath, HTTPIngressRuleValue, IngressBackend, IngressRule, IngressSpec,
        IngressTLS, ServiceBackendPort,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use k8s_openapi::ByteString;
    use kube::runtime::reflector::store::store;
    use kube::runtime::watcher::Event;
    use std::collections::BTreeMap;

    const CLASS: &str = "test";
    const NAMESPACE: &str = "default";
    const HOST: &str = "localhost";

    struct Fixture {
        reconciler: Reconciler,
        snapshots: Arc<SnapshotCell>,
        ingress_writer: kube::runtime::reflector::store::Writer<Ingress>,
        service_writer: kube::runtime::reflector::store::Writer<Service>,
        secret_writer: kube::runtime::reflector::store::Writer<Secret>,
    }

    impl Fixture {
        fn new() -> Self {
            let (ingress_store, ingress_writer) = store();
            let (service_store, service_writer) = store();
            let (secret_store, secret_writer) = store();
            let snapshots = Arc::new(SnapshotCell::new());
            let reconciler = Reconciler::new(
                ingress_store,
                service_store,
                secret_store,
                Arc::new(RwLock::new(HashMap::new())),
                CLASS.to_string(),
                snapshots.clone(),
                None,
            );
            Self {
                reconciler,
                snapshots,
                ingress_writer,
                service_writer,
                secret_writer,
            }
        }

        fn add_ingress(&mut self, ingress: Ingress) {
            self.ingress_writer
                .apply_watcher_event(&Event::Apply(ingress));
        }

        fn delete_ingress(&mut self, ingress: Ingress) {
            self.ingress_writer
                .apply_watcher_event(&Event::Delete(ingress));
        }

        fn add_service(&mut self, service: Service) {
            self.service_writer
                .apply_watcher_event(&Event::Apply(service));
        }

        fn add_secret(&mut self, secret: Secret) {
            self.secret_writer
                .apply_watcher_event(&Event::Apply(secret));
        }
    }

    fn metadata(name: &str) -> ObjectMeta {
        ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(NAMESPACE.to_string()),
            ..Default::default()
        }
    }

    fn backend(service: &str, port: ServiceBackendPort) -> IngressBackend {
        IngressBackend {
            service: Some(IngressServiceBackend {
                name: service.to_string(),
                port: Some(port),
            }),
            ..Default::default()
        }
    }

    fn ingress_with_path(
        name: &str,
        class: Option<&str>,
        path: &str,
        path_type: &str,
        backend: IngressBackend,
    ) -> Ingress {
        Ingress {
            metadata: metadata(name),
            spec: Some(IngressSpec {
                ingress_class_name: class.map(str::to_string),
                rules: Some(vec![IngressRule {
                    host: Some(HOST.to_string()),
                    http: Some(HTTPIngressRuleValue {
                        paths: vec![HTTPIngressPath {
                            backend,
                            path: Some(path.to_string()),
                            path_type: path_type.to_string(),
                        }],
                    }),
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn ingress_with_tls(name: &str, secret_name: &str) -> Ingress {
        Ingress {
            metadata: metadata(name),
            spec: Some(IngressSpec {
                ingress_class_name: Some(CLASS.to_string()),
                tls: Some(vec![IngressTLS {
                    hosts: Some(vec![HOST.to_string()]),
                    secret_name: Some(secret_name.to_string()),
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn service_with_port(name: &str, port_name: &str, port: i32) -> Service {
        Service {
            metadata: metadata(name),
            spec: Some(ServiceSpec {
                ports: Some(vec![ServicePort {
                    name: Some(port_name.to_string()),
                    port,
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn tls_secret(name: &str, type_: &str, cert: &[u8], key: &[u8]) -> Secret {
        let mut data = BTreeMap::new();
        data.insert("tls.crt".to_string(), ByteString(cert.to_vec()));
        data.insert("tls.key".to_string(), ByteString(key.to_vec()));
        Secret {
            metadata: metadata(name),
            type_: Some(type_.to_string()),
            data: Some(data),
            ..Default::default()
        }
    }

    fn key(name: &str) -> IngressKey {
        IngressKey::new(NAMESPACE, name)
    }

    #[test]
    fn test_class_matches_spec_field_and_legacy_annotation() {
        let by_field = ingress_with_path(
            "a",
            Some(CLASS),
            "/",
            "Prefix",
            backend("svc", ServiceBackendPort::default()),
        );
        assert!(class_matches(&by_field, CLASS));
        assert!(!class_matches(&by_field, "other"));

        let mut by_annotation = ingress_with_path(
            "b",
            None,
            "/",
            "Prefix",
            backend("svc", ServiceBackendPort::default()),
        );
        let mut annotations = BTreeMap::new();
        annotations.insert(LEGACY_CLASS_ANNOTATION.to_string(), CLASS.to_string());
        by_annotation.metadata.annotations = Some(annotations);
        assert!(class_matches(&by_annotation, CLASS));

        // annotation is ignored once the spec field is set
        let mut both = ingress_with_path(
            "c",
            Some("other"),
            "/",
            "Prefix",
            backend("svc", ServiceBackendPort::default()),
        );
        both.metadata.annotations = by_annotation.metadata.annotations.clone();
        assert!(!class_matches(&both, CLASS));
    }

    #[tokio::test]
    async fn test_port_resolved_by_number() {
        let mut fixture = Fixture::new();
        fixture.add_service(service_with_port("svc", "port", 8080));
        fixture.add_ingress(ingress_with_path(
            "ing",
            Some(CLASS),
            "/test",
            "Prefix",
            backend(
                "svc",
                ServiceBackendPort {
                    number: Some(8080),
                    ..Default::default()
                },
            ),
        ));

        fixture.reconciler.reconcile(vec![key("ing")]).await;

        let snapshot = fixture.snapshots.load().unwrap();
        let routes = &snapshot.routing[HOST].routes;
        assert_eq!(routes.len(), 1);
        let backend = &routes[0].backend;
        assert_eq!(backend.namespace, NAMESPACE);
        assert_eq!(backend.path, "/test");
        assert_eq!(backend.service_name, "svc");
        assert_eq!(backend.service_port, 8080);
        assert_eq!(backend.kind, PathKind::Prefix);
    }

    #[tokio::test]
    async fn test_port_resolved_by_name() {
        let mut fixture = Fixture::new();
        fixture.add_service(service_with_port("svc", "port", 8080));
        fixture.add_ingress(ingress_with_path(
            "ing",
            Some(CLASS),
            "/test",
            "Prefix",
            backend(
                "svc",
                ServiceBackendPort {
                    name: Some("port".to_string()),
                    ..Default::default()
                },
            ),
        ));

        fixture.reconciler.reconcile(vec![key("ing")]).await;

        let snapshot = fixture.snapshots.load().unwrap();
        let routes = &snapshot.routing[HOST].routes;
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].backend.service_port, 8080);
    }

    #[tokio::test]
    async fn test_port_number_takes_precedence_over_name() {
        let mut fixture = Fixture::new();
        let mut service = service_with_port("svc", "http", 8080);
        if let Some(spec) = service.spec.as_mut() {
            if let Some(ports) = spec.ports.as_mut() {
                ports.push(ServicePort {
                    name: Some("alt".to_string()),
                    port: 9090,
                    ..Default::default()
                });
            }
        }
        fixture.add_service(service);
        fixture.add_ingress(ingress_with_path(
            "ing",
            Some(CLASS),
            "/test",
            "Prefix",
            backend(
                "svc",
                ServiceBackendPort {
                    number: Some(9090),
                    name: Some("http".to_string()),
                },
            ),
        ));

        fixture.reconciler.reconcile(vec![key("ing")]).await;

        let snapshot = fixture.snapshots.load().unwrap();
        assert_eq!(snapshot.routing[HOST].routes[0].backend.service_port, 9090);
    }

    #[tokio::test]
    async fn test_unresolvable_port_drops_path_and_records_error() {
        let mut fixture = Fixture::new();
        fixture.add_service(service_with_port("svc", "port", 8080));
        fixture.add_ingress(ingress_with_path(
            "ing",
            Some(CLASS),
            "/test",
            "Prefix",
            backend(
                "svc",
                ServiceBackendPort {
                    number: Some(9999),
                    ..Default::default()
                },
            ),
        ));

        fixture.reconciler.reconcile(vec![key("ing")]).await;

        let (snapshot, results) = fixture.reconciler.build_snapshot();
        assert!(snapshot.routing[HOST].routes.is_empty());
        assert_eq!(results.len(), 1);
        assert_eq!(
            results[0].1,
            vec![IngressError::ServicePortNotFound {
                service: "svc".to_string(),
                port: 9999,
            }]
        );
    }

    #[tokio::test]
    async fn test_backend_without_port_is_invalid() {
        let mut fixture = Fixture::new();
        fixture.add_service(service_with_port("svc", "port", 8080));
        fixture.add_ingress(ingress_with_path(
            "ing",
            Some(CLASS),
            "/test",
            "Prefix",
            backend("svc", ServiceBackendPort::default()),
        ));

        fixture.reconciler.reconcile(vec![key("ing")]).await;

        let (_, results) = fixture.reconciler.build_snapshot();
        assert_eq!(
            results[0].1,
            vec![IngressError::InvalidBackendService {
                path: "/test".to_string(),
            }]
        );
    }

    #[tokio::test]
    async fn test_missing_port_name_is_reported() {
        let mut fixture = Fixture::new();
        fixture.add_service(service_with_port("svc", "port", 8080));
        fixture.add_ingress(ingress_with_path(
            "ing",
            Some(CLASS),
            "/test",
            "Prefix",
            backend(
                "svc",
                ServiceBackendPort {
                    name: Some("nope".to_string()),
                    ..Default::default()
                },
            ),
        ));

        fixture.reconciler.reconcile(vec![key("ing")]).await;

        let (_, results) = fixture.reconciler.build_snapshot();
        assert_eq!(
            results[0].1,
            vec![IngressError::ServicePortNameNotFound {
                service: "svc".to_string(),
                name: "nope".to_string(),
                namespace: NAMESPACE.to_string(),
            }]
        );
    }

    #[tokio::test]
    async fn test_tls_secret_raw_bytes_kept_verbatim() {
        let mut fixture = Fixture::new();
        // arbitrary 20-byte blobs, nothing close to PEM
        let cert: [u8; 20] = *b"certcertcertcertcert";
        let cert_key: [u8; 20] = *b"keykeykeykeykeykeyke";
        fixture.add_secret(tls_secret("secret", TLS_SECRET_TYPE, &cert, &cert_key));
        fixture.add_ingress(ingress_with_tls("ing", "secret"));

        fixture.reconciler.reconcile(vec![key("ing")]).await;

        let snapshot = fixture.snapshots.load().unwrap();
        let tls = snapshot.routing[HOST].tls.as_ref().unwrap();
        assert_eq!(tls.cert, cert.to_vec());
        assert_eq!(tls.key, cert_key.to_vec());
        // unparseable bytes never become SNI material
        assert!(snapshot.certs.is_empty());
    }

    #[tokio::test]
    async fn test_tls_secret_parseable_pair_becomes_sni_certificate() {
        init_crypto();
        let mut fixture = Fixture::new();
        let (cert_pem, key_pem) = self_signed(HOST);
        fixture.add_secret(tls_secret("secret", TLS_SECRET_TYPE, &cert_pem, &key_pem));
        fixture.add_ingress(ingress_with_tls("ing", "secret"));

        fixture.reconciler.reconcile(vec![key("ing")]).await;

        let snapshot = fixture.snapshots.load().unwrap();
        assert!(snapshot.certs.contains_key(HOST));
        assert!(snapshot.routing[HOST].tls.is_some());

        let (_, results) = fixture.reconciler.build_snapshot();
        assert!(results[0].1.is_empty());
    }

    #[tokio::test]
    async fn test_tls_secret_missing_is_reported() {
        let mut fixture = Fixture::new();
        fixture.add_ingress(ingress_with_tls("ing", "absent"));

        fixture.reconciler.reconcile(vec![key("ing")]).await;

        let (snapshot, results) = fixture.reconciler.build_snapshot();
        assert_eq!(
            results[0].1,
            vec![IngressError::TlsCertMissing {
                secret: "absent".to_string(),
            }]
        );
        assert!(!snapshot.routing.contains_key(HOST));
    }

    #[tokio::test]
    async fn test_tls_secret_wrong_type_is_reported() {
        let mut fixture = Fixture::new();
        fixture.add_secret(tls_secret("secret", "Opaque", b"c", b"k"));
        fixture.add_ingress(ingress_with_tls("ing", "secret"));

        fixture.reconciler.reconcile(vec![key("ing")]).await;

        let (snapshot, results) = fixture.reconciler.build_snapshot();
        assert_eq!(
            results[0].1,
            vec![IngressError::TlsCertWrongType {
                secret: "secret".to_string(),
                type_: "Opaque".to_string(),
            }]
        );
        assert!(!snapshot.routing.contains_key(HOST));
    }

    #[tokio::test]
    async fn test_snapshot_orders_paths_exact_first_longest_prefix() {
        let mut fixture = Fixture::new();
        fixture.add_service(service_with_port("svc", "port", 8080));
        let port = || ServiceBackendPort {
            number: Some(8080),
            ..Default::default()
        };
        let mut ingress = ingress_with_path("ing", Some(CLASS), "/", "Prefix", backend("svc", port()));
        if let Some(spec) = ingress.spec.as_mut() {
            if let Some(rules) = spec.rules.as_mut() {
                if let Some(http) = rules[0].http.as_mut() {
                    http.paths.push(HTTPIngressPath {
                        backend: backend("svc", port()),
                        path: Some("/test123".to_string()),
                        path_type: "Exact".to_string(),
                    });
                    http.paths.push(HTTPIngressPath {
                        backend: backend("svc", port()),
                        path: Some("/test".to_string()),
                        path_type: "Prefix".to_string(),
                    });
                }
            }
        }
        fixture.add_ingress(ingress);

        fixture.reconciler.reconcile(vec![key("ing")]).await;

        let snapshot = fixture.snapshots.load().unwrap();
        let order: Vec<&str> = snapshot.routing[HOST]
            .routes
            .iter()
            .map(|route| route.backend.path.as_str())
            .collect();
        assert_eq!(order, vec!["/test123", "/test", "/"]);
        assert!(snapshot.routing[HOST].routes[0].backend.kind.is_exact());
    }

    #[tokio::test]
    async fn test_class_mismatch_never_enters_snapshot() {
        let mut fixture = Fixture::new();
        fixture.add_service(service_with_port("svc", "port", 8080));
        fixture.add_ingress(ingress_with_path(
            "ing",
            Some("someone-else"),
            "/test",
            "Prefix",
            backend(
                "svc",
                ServiceBackendPort {
                    number: Some(8080),
                    ..Default::default()
                },
            ),
        ));

        fixture.reconciler.reconcile(vec![key("ing")]).await;

        // nothing owned, nothing published
        assert!(fixture.snapshots.load().is_none());
        let (snapshot, results) = fixture.reconciler.build_snapshot();
        assert!(snapshot.routing.is_empty());
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn test_class_change_removes_from_owned_set() {
        let mut fixture = Fixture::new();
        fixture.add_service(service_with_port("svc", "port", 8080));
        let port = ServiceBackendPort {
            number: Some(8080),
            ..Default::default()
        };
        fixture.add_ingress(ingress_with_path(
            "ing",
            Some(CLASS),
            "/test",
            "Prefix",
            backend("svc", port.clone()),
        ));
        fixture.reconciler.reconcile(vec![key("ing")]).await;
        assert!(fixture
            .snapshots
            .load()
            .unwrap()
            .routing
            .contains_key(HOST));

        // the ingress moves to a different class
        fixture.add_ingress(ingress_with_path(
            "ing",
            Some("someone-else"),
            "/test",
            "Prefix",
            backend("svc", port),
        ));
        fixture.reconciler.reconcile(vec![key("ing")]).await;

        let snapshot = fixture.snapshots.load().unwrap();
        assert!(!snapshot.routing.contains_key(HOST));
    }

    #[tokio::test]
    async fn test_deleted_ingress_is_removed() {
        let mut fixture = Fixture::new();
        fixture.add_service(service_with_port("svc", "port", 8080));
        let ingress = ingress_with_path(
            "ing",
            Some(CLASS),
            "/test",
            "Prefix",
            backend(
                "svc",
                ServiceBackendPort {
                    number: Some(8080),
                    ..Default::default()
                },
            ),
        );
        fixture.add_ingress(ingress.clone());
        fixture.reconciler.reconcile(vec![key("ing")]).await;
        assert!(fixture
            .snapshots
            .load()
            .unwrap()
            .routing
            .contains_key(HOST));

        fixture.delete_ingress(ingress);
        fixture.reconciler.reconcile(vec![key("ing")]).await;
        assert!(fixture.snapshots.load().unwrap().routing.is_empty());
    }

    #[tokio::test]
    async fn test_unchanged_spec_skips_rebuild() {
        let mut fixture = Fixture::new();
        fixture.add_service(service_with_port("svc", "port", 8080));
        fixture.add_ingress(ingress_with_path(
            "ing",
            Some(CLASS),
            "/test",
            "Prefix",
            backend(
                "svc",
                ServiceBackendPort {
                    number: Some(8080),
                    ..Default::default()
                },
            ),
        ));
        fixture.reconciler.reconcile(vec![key("ing")]).await;

        // plant a sentinel; an unchanged reconcile must not replace it
        let mut sentinel = Snapshot::default();
        sentinel.domain_mut("sentinel.example.com");
        fixture.snapshots.publish(sentinel);

        fixture.reconciler.reconcile(vec![key("ing")]).await;
        let snapshot = fixture.snapshots.load().unwrap();
        assert!(snapshot.routing.contains_key("sentinel.example.com"));
    }

    #[tokio::test]
    async fn test_rule_without_http_section_is_skipped() {
        let mut fixture = Fixture::new();
        let ingress = Ingress {
            metadata: metadata("ing"),
            spec: Some(IngressSpec {
                ingress_class_name: Some(CLASS.to_string()),
                rules: Some(vec![IngressRule {
                    host: Some(HOST.to_string()),
                    http: None,
                }]),
                ..Default::default()
            }),
            ..Default::default()
        };
        fixture.add_ingress(ingress);

        fixture.reconciler.reconcile(vec![key("ing")]).await;

        let snapshot = fixture.snapshots.load().unwrap();
        assert!(!snapshot.routing.contains_key(HOST));
    }
}
