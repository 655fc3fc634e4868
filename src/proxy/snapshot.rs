//! Compiled routing and certificate state
//!
//! A [`Snapshot`] is built from scratch on every reconcile and published by
//! atomic pointer swap into the [`SnapshotCell`]. Readers load the pointer
//! once per request and keep that reference for the whole request, so a
//! publication mid-request never tears. Everything inside a published
//! snapshot is immutable.

use arc_swap::ArcSwapOption;
use rustls::sign::CertifiedKey;
use std::cmp::Reverse;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Kubernetes Ingress path matching modes.
///
/// `ImplementationSpecific` is normalized to `Prefix` matching semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathKind {
    Exact,
    Prefix,
    ImplementationSpecific,
}

impl PathKind {
    /// Parse the Ingress `pathType` field. Unknown values fall back to
    /// `ImplementationSpecific` (prefix matching).
    pub fn parse(path_type: &str) -> Self {
        match path_type {
            "Exact" => PathKind::Exact,
            "Prefix" => PathKind::Prefix,
            _ => PathKind::ImplementationSpecific,
        }
    }

    #[inline]
    pub fn is_exact(&self) -> bool {
        matches!(self, PathKind::Exact)
    }
}

/// One routing rule: path match plus the backend service it resolves to.
///
/// `service_port` is always a concrete port number; named ports are resolved
/// against the Service spec during the snapshot build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendPath {
    pub kind: PathKind,
    pub path: String,
    pub namespace: String,
    pub service_name: String,
    pub service_port: i32,
}

/// The upstream authority a backend path proxies to.
///
/// Constructed exactly once per backend path when the snapshot is built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upstream {
    authority: String,
}

impl Upstream {
    /// Cluster-internal authority for a backend path:
    /// `<service>.<namespace>.svc.cluster.local:<port>`
    pub fn for_backend(backend: &BackendPath) -> Self {
        Self {
            authority: format!(
                "{}.{}.svc.cluster.local:{}",
                backend.service_name, backend.namespace, backend.service_port
            ),
        }
    }

    /// Explicit authority, used by tests to point at loopback backends.
    pub fn from_authority(authority: impl Into<String>) -> Self {
        Self {
            authority: authority.into(),
        }
    }

    pub fn authority(&self) -> &str {
        &self.authority
    }
}

impl fmt::Display for Upstream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "http://{}", self.authority)
    }
}

/// A backend path together with its reverse-proxy target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathRoute {
    pub backend: BackendPath,
    pub upstream: Upstream,
}

impl PathRoute {
    pub fn new(backend: BackendPath) -> Self {
        let upstream = Upstream::for_backend(&backend);
        Self { backend, upstream }
    }
}

/// Raw TLS key pair bytes exactly as read from the Secret.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsBundle {
    pub cert: Vec<u8>,
    pub key: Vec<u8>,
}

/// Per-host routing state: ordered path routes and the optional TLS bundle.
#[derive(Debug, Clone, Default)]
pub struct DomainConfig {
    pub routes: Vec<PathRoute>,
    pub tls: Option<TlsBundle>,
}

impl DomainConfig {
    /// Order routes for matching: every Exact entry before every Prefix
    /// entry, longer paths before shorter ones. The sort is stable, so
    /// entries that tie keep their input order.
    pub fn sort_routes(&mut self) {
        self.routes
            .sort_by_key(|route| (!route.backend.kind.is_exact(), Reverse(route.backend.path.len())));
    }

    /// First matching route for a request path. Exact entries match on
    /// string equality; every entry participates in prefix matching.
    pub fn matching_route(&self, path: &str) -> Option<&PathRoute> {
        self.routes.iter().find(|route| {
            (route.backend.kind.is_exact() && path == route.backend.path)
                || path.starts_with(&route.backend.path)
        })
    }
}

/// The immutable compiled state the data plane reads.
#[derive(Default)]
pub struct Snapshot {
    /// host -> ordered path routes + TLS bundle
    pub routing: HashMap<String, DomainConfig>,
    /// host -> parsed certificate material for SNI selection
    pub certs: HashMap<String, Arc<CertifiedKey>>,
}

impl Snapshot {
    /// The domain entry for a host, created empty when absent.
    pub fn domain_mut(&mut self, host: &str) -> &mut DomainConfig {
        self.routing.entry(host.to_string()).or_default()
    }
}

impl fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Snapshot")
            .field("hosts", &self.routing.keys().collect::<Vec<_>>())
            .field("certs", &self.certs.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Atomically replaceable snapshot cell.
///
/// Holds `Snapshot | nil`; readers that observe `nil` (no reconcile has
/// completed yet) answer 503. Publication is a lock-free pointer swap and
/// never blocks readers; a superseded snapshot is dropped once its last
/// in-flight reader releases it.
#[derive(Debug, Default)]
pub struct SnapshotCell {
    inner: ArcSwapOption<Snapshot>,
}

impl SnapshotCell {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a freshly built snapshot, replacing the previous one.
    pub fn publish(&self, snapshot: Snapshot) {
        self.inner.store(Some(Arc::new(snapshot)));
    }

    /// The currently published snapshot, or None before the first publish.
    pub fn load(&self) -> Option<Arc<Snapshot>> {
        self.inner.load_full()
    }
}
