use thiserror::Error;

/// Non-fatal errors collected while building a routing snapshot.
///
/// These never abort a reconcile. The offending path or TLS entry is dropped
/// from the snapshot and the error is reported back on the owning Ingress
/// status, semicolon-joined with its siblings.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IngressError {
    #[error("InvalidBackendService: backend service contains neither port name nor port number for path {path}")]
    InvalidBackendService { path: String },

    #[error("ServicePortNotFound: {port} for backend service {service}")]
    ServicePortNotFound { service: String, port: i32 },

    #[error("ServicePortNameNotFound: port name {name} not found in service {service} in namespace {namespace}")]
    ServicePortNameNotFound {
        service: String,
        name: String,
        namespace: String,
    },

    #[error("TlsCertMissing: referenced secret {secret}")]
    TlsCertMissing { secret: String },

    #[error("TlsCertWrongType: secret {secret} has type {type_}, has to be kubernetes.io/tls")]
    TlsCertWrongType { secret: String, type_: String },
}

/// Fatal setup errors. Runtime errors never panic the process; only an
/// impossible startup (listeners, Kubernetes client, TLS policy) aborts.
#[derive(Error, Debug)]
pub enum ControllerError {
    #[error("Kubernetes client error: {0}")]
    Kubernetes(#[from] kube::Error),

    #[error("TLS configuration error: {0}")]
    Tls(#[from] rustls::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
