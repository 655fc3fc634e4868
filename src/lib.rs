//! portti - Kubernetes ingress controller
//!
//! Watches Ingress, Service and TLS-Secret resources, compiles them into an
//! immutable routing + certificate snapshot and serves live HTTP, HTTPS and
//! optionally HTTP/3 traffic reverse-proxied to cluster services.

pub mod apis;
pub mod config;
pub mod error;
pub mod proxy;
