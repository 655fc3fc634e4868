//! Ingress load-balancer status write-back
//!
//! Every owned Ingress gets a `status.loadBalancer.ingress` entry for this
//! controller's host IP with port statuses 80/TCP and 443/TCP. Both port
//! entries carry the same optional error message, the semicolon-joined
//! snapshot build errors of that Ingress. Writes use optimistic concurrency:
//! GET, patch the entry list, UpdateStatus, retry on conflict.

use futures::future::join_all;
use k8s_openapi::api::networking::v1::{
    Ingress, IngressLoadBalancerIngress, IngressLoadBalancerStatus, IngressPortStatus,
    IngressStatus,
};
use kube::api::{Api, PostParams};
use kube::{Client, ResourceExt};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::IngressError;

const HTTP_PORT: i32 = 80;
const HTTPS_PORT: i32 = 443;

const CONFLICT_RETRIES: u32 = 5;
const CONFLICT_BACKOFF: Duration = Duration::from_millis(10);

/// Desired status for one owned Ingress.
pub struct StatusUpdate {
    pub ingress: Arc<Ingress>,
    pub status: IngressLoadBalancerIngress,
}

/// Build the load-balancer entry for this controller from the snapshot
/// build errors of one Ingress.
pub fn status_from_errors(errors: &[IngressError], host_ip: IpAddr) -> IngressLoadBalancerIngress {
    let error_message = if errors.is_empty() {
        None
    } else {
        Some(
            errors
                .iter()
                .map(|e| e.to_string())
                .collect::<Vec<_>>()
                .join(";"),
        )
    };
    IngressLoadBalancerIngress {
        hostname: None,
        ip: Some(host_ip.to_string()),
        ports: Some(vec![
            IngressPortStatus {
                port: HTTP_PORT,
                protocol: "TCP".to_string(),
                error: error_message.clone(),
            },
            IngressPortStatus {
                port: HTTPS_PORT,
                protocol: "TCP".to_string(),
                error: error_message,
            },
        ]),
    }
}

/// Field-wise status equality; the ports array is compared element-wise and
/// order-sensitive.
pub fn status_equal(a: &IngressLoadBalancerIngress, b: &IngressLoadBalancerIngress) -> bool {
    if a.hostname != b.hostname || a.ip != b.ip {
        return false;
    }
    let a_ports = a.ports.as_deref().unwrap_or_default();
    let b_ports = b.ports.as_deref().unwrap_or_default();
    a_ports.len() == b_ports.len()
        && a_ports.iter().zip(b_ports).all(|(p1, p2)| {
            p1.port == p2.port && p1.protocol == p2.protocol && p1.error == p2.error
        })
}

/// Index of the entry with the given IP.
pub fn find_status(entries: &[IngressLoadBalancerIngress], host_ip: &str) -> Option<usize> {
    entries.iter().position(|el| el.ip.as_deref() == Some(host_ip))
}

/// Replace the entry with the matching IP, or append when none matches.
pub fn set_status(
    mut entries: Vec<IngressLoadBalancerIngress>,
    target: IngressLoadBalancerIngress,
) -> Vec<IngressLoadBalancerIngress> {
    match find_status(&entries, target.ip.as_deref().unwrap_or_default()) {
        Some(i) => entries[i] = target,
        None => entries.push(target),
    }
    entries
}

fn load_balancer_entries(ingress: &Ingress) -> Vec<IngressLoadBalancerIngress> {
    ingress
        .status
        .as_ref()
        .and_then(|status| status.load_balancer.as_ref())
        .and_then(|lb| lb.ingress.clone())
        .unwrap_or_default()
}

/// Writes desired statuses back to the API server.
pub struct StatusWriter {
    client: Client,
    host_ip: IpAddr,
}

impl StatusWriter {
    pub fn new(client: Client, host_ip: IpAddr) -> Self {
        Self { client, host_ip }
    }

    /// Compute and push the desired status for every owned Ingress.
    /// Blocks until all writes finished so the reconcile loop never reads
    /// back state it has not written yet.
    pub async fn apply_errors(&self, results: Vec<(Arc<Ingress>, Vec<IngressError>)>) {
        let updates: Vec<StatusUpdate> = results
            .into_iter()
            .map(|(ingress, errors)| StatusUpdate {
                status: status_from_errors(&errors, self.host_ip),
                ingress,
            })
            .collect();
        self.apply(updates).await;
    }

    /// Push a list of desired statuses, concurrently, waiting for all.
    pub async fn apply(&self, updates: Vec<StatusUpdate>) {
        join_all(updates.into_iter().map(|update| self.update_one(update))).await;
    }

    async fn update_one(&self, update: StatusUpdate) {
        let host_ip = self.host_ip.to_string();

        // fast path: observed copy already carries the desired entry
        let entries = load_balancer_entries(&update.ingress);
        if let Some(i) = find_status(&entries, &host_ip) {
            if status_equal(&entries[i], &update.status) {
                return;
            }
        }

        let desired = update.status;
        let result = self
            .sync_status(&update.ingress, |entries| {
                if let Some(i) = find_status(&entries, &host_ip) {
                    if status_equal(&entries[i], &desired) {
                        return (entries, false);
                    }
                }
                (set_status(entries, desired.clone()), true)
            })
            .await;
        if let Err(e) = result {
            warn!(
                ingress = %update.ingress.name_any(),
                namespace = %update.ingress.namespace().unwrap_or_default(),
                error = %e,
                "failed to update ingress status"
            );
        }
    }

    /// Remove this controller's entry from every given Ingress. Called on
    /// shutdown; only the matching load-balancer entry is touched.
    pub async fn clean_all(&self, ingresses: Vec<Arc<Ingress>>) {
        join_all(ingresses.iter().map(|ingress| self.remove_entry(ingress))).await;
    }

    async fn remove_entry(&self, ingress: &Ingress) {
        let host_ip = self.host_ip.to_string();
        if find_status(&load_balancer_entries(ingress), &host_ip).is_none() {
            return;
        }
        let result = self
            .sync_status(ingress, |mut entries| match find_status(&entries, &host_ip) {
                Some(i) => {
                    entries.remove(i);
                    (entries, true)
                }
                None => (entries, false),
            })
            .await;
        if let Err(e) = result {
            warn!(
                ingress = %ingress.name_any(),
                namespace = %ingress.namespace().unwrap_or_default(),
                error = %e,
                "failed to clean ingress status"
            );
        }
    }

    /// GET, patch, UpdateStatus with conflict retry.
    async fn sync_status<F>(&self, ingress: &Ingress, patch: F) -> Result<(), kube::Error>
    where
        F: Fn(Vec<IngressLoadBalancerIngress>) -> (Vec<IngressLoadBalancerIngress>, bool),
    {
        let namespace = ingress.namespace().unwrap_or_default();
        let name = ingress.name_any();
        let api: Api<Ingress> = Api::namespaced(self.client.clone(), &namespace);

        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = async {
                let mut current = api.get(&name).await?;
                let (patched, needs_sync) = patch(load_balancer_entries(&current));
                if !needs_sync {
                    return Ok(());
                }
                debug!(
                    ingress = %name,
                    namespace = %namespace,
                    "updating ingress load balancer status"
                );
                current.status = Some(IngressStatus {
                    load_balancer: Some(IngressLoadBalancerStatus {
                        ingress: if patched.is_empty() {
                            None
                        } else {
                            Some(patched)
                        },
                    }),
                });
                let data = serde_json::to_vec(&current).map_err(kube::Error::SerdeError)?;
                api.replace_status(&name, &PostParams::default(), data).await?;
                Ok(())
            }
            .await;

            match result {
                Ok(()) => return Ok(()),
                Err(kube::Error::Api(ae)) if ae.code == 409 && attempt < CONFLICT_RETRIES => {
                    debug!(
                        ingress = %name,
                        namespace = %namespace,
                        attempt = attempt,
                        "conflict while updating ingress status, retrying"
                    );
                    tokio::time::sleep(CONFLICT_BACKOFF).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
