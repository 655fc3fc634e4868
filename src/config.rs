//! Configuration for the portti ingress controller
//!
//! Every option is a CLI flag; defaults match the in-cluster deployment
//! (container ports 8080/8443, 10s request timeouts, 1s debounce window).

use clap::Parser;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::time::Duration;

/// Controller configuration
#[derive(Debug, Clone, Parser)]
#[command(name = "portti", version, about = "Kubernetes ingress controller", long_about = None)]
pub struct Config {
    /// Corresponds to spec.ingressClassName. Only ingress definitions that match are evaluated.
    #[arg(long = "ingress-class-name", default_value = "ingress")]
    pub ingress_class_name: String,

    /// Host IP address. Optional, but needs to be set if the ingress status should be updated.
    #[arg(long = "host-ip")]
    pub host_ip: Option<IpAddr>,

    /// TCP port for the HTTP endpoint (redirect + ACME pass-through)
    #[arg(long = "http-port", default_value_t = 8080)]
    pub http_port: u16,

    /// TCP port for the HTTPS endpoint
    #[arg(long = "https-port", default_value_t = 8443)]
    pub https_port: u16,

    /// Whether HTTP/3 is enabled
    #[arg(long = "http3", default_value_t = false)]
    pub http3: bool,

    /// UDP port for the HTTP/3 endpoint
    #[arg(long = "http3-port", default_value_t = 8444)]
    pub http3_port: u16,

    /// h2 TCP port for the Alt-Svc header. May differ from https-port behind port mappings. 0 disables the h2 entry.
    #[arg(long = "http2-alt-svc", default_value_t = 443)]
    pub http2_alt_svc: u16,

    /// h3 UDP port for the Alt-Svc header. May differ from http3-port behind port mappings. 0 disables the h3 entry.
    #[arg(long = "http3-alt-svc", default_value_t = 443)]
    pub http3_alt_svc: u16,

    /// Set the Strict-Transport-Security header
    #[arg(long = "hsts", default_value_t = false)]
    pub hsts: bool,

    /// Max-Age for the HSTS header, only relevant if hsts is activated
    #[arg(long = "hsts-max-age", default_value_t = 63072000)]
    pub hsts_max_age: u64,

    /// Whether HSTS, if activated, should add the includeSubDomains directive
    #[arg(long = "hsts-subdomains", default_value_t = true, action = clap::ArgAction::Set)]
    pub hsts_subdomains: bool,

    /// Whether the HSTS preload directive should be active
    #[arg(long = "hsts-preload", default_value_t = false)]
    pub hsts_preload: bool,

    /// Timeout to read the entire request in seconds
    #[arg(long = "read-timeout", default_value_t = 10)]
    pub read_timeout: u64,

    /// Timeout to write the complete response in seconds
    #[arg(long = "write-timeout", default_value_t = 10)]
    pub write_timeout: u64,

    /// Timeout for idle TCP connections with keep-alive in seconds
    #[arg(long = "idle-timeout", default_value_t = 30)]
    pub idle_timeout: u64,

    /// Timeout to gracefully shut down the servers in seconds
    #[arg(long = "shutdown-timeout", default_value_t = 10)]
    pub shutdown_timeout: u64,

    /// Delay before starting the shutdown in seconds, to give surrounding load balancers time to drain
    #[arg(long = "shutdown-delay", default_value_t = 5)]
    pub shutdown_delay: u64,

    /// Queries per second above which Kubernetes client throttling occurs
    #[arg(long = "k8s-client-qps", default_value_t = 20)]
    pub k8s_client_qps: u32,

    /// Absolute queries-in-flight threshold for Kubernetes client throttling
    #[arg(long = "k8s-client-burst", default_value_t = 40)]
    pub k8s_client_burst: u32,

    /// Quiescence window in milliseconds for coalescing bursts of Kubernetes events
    #[arg(long = "debounce-duration", default_value_t = 1000)]
    pub debounce_duration: u64,
}

/// HSTS (HTTP Strict Transport Security) header settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HstsConfig {
    pub max_age: u64,
    pub include_subdomains: bool,
    pub preload: bool,
}

impl HstsConfig {
    /// The Strict-Transport-Security header value
    pub fn header_value(&self) -> String {
        let mut result = format!("max-age={}", self.max_age);
        if self.include_subdomains {
            result.push_str("; includeSubDomains");
        }
        if self.preload {
            result.push_str("; preload");
        }
        result
    }
}

impl Config {
    /// HSTS settings, present only when the hsts flag is set
    pub fn hsts_config(&self) -> Option<HstsConfig> {
        self.hsts.then(|| HstsConfig {
            max_age: self.hsts_max_age,
            include_subdomains: self.hsts_subdomains,
            preload: self.hsts_preload,
        })
    }

    /// The Alt-Svc header value advertising h3 and h2 endpoints, or None if
    /// neither advertised port is configured.
    pub fn alt_svc_header(&self) -> Option<String> {
        let mut parts = Vec::new();
        if self.http3 && self.http3_alt_svc != 0 {
            parts.push(format!("h3=\":{}\"", self.http3_alt_svc));
        }
        if self.http2_alt_svc != 0 {
            parts.push(format!("h2=\":{}\"", self.http2_alt_svc));
        }
        if parts.is_empty() {
            None
        } else {
            Some(parts.join(", "))
        }
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout)
    }

    /// Upper bound for a complete upstream round trip, also used as the dial timeout.
    pub fn backend_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout + self.write_timeout)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout)
    }

    pub fn shutdown_delay(&self) -> Duration {
        Duration::from_secs(self.shutdown_delay)
    }

    pub fn debounce_duration(&self) -> Duration {
        Duration::from_millis(self.debounce_duration)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn default_config() -> Config {
        Config::parse_from(["portti"])
    }

    #[test]
    fn test_default_config() {
        let config = default_config();
        assert_eq!(config.ingress_class_name, "ingress");
        assert_eq!(config.http_port, 8080);
        assert_eq!(config.https_port, 8443);
        assert!(!config.http3);
        assert!(config.host_ip.is_none());
        assert_eq!(config.backend_timeout(), Duration::from_secs(20));
    }

    #[test]
    fn test_hsts_header_composition() {
        let hsts = HstsConfig {
            max_age: 63072000,
            include_subdomains: true,
            preload: false,
        };
        assert_eq!(hsts.header_value(), "max-age=63072000; includeSubDomains");

        let hsts = HstsConfig {
            max_age: 300,
            include_subdomains: false,
            preload: true,
        };
        assert_eq!(hsts.header_value(), "max-age=300; preload");
    }

    #[test]
    fn test_hsts_disabled_by_default() {
        let config = default_config();
        assert!(config.hsts_config().is_none());
    }

    #[test]
    fn test_alt_svc_header() {
        let mut config = default_config();
        // http3 disabled: only h2 advertised
        assert_eq!(config.alt_svc_header().as_deref(), Some("h2=\":443\""));

        config.http3 = true;
        assert_eq!(
            config.alt_svc_header().as_deref(),
            Some("h3=\":443\", h2=\":443\"")
        );

        config.http2_alt_svc = 0;
        assert_eq!(config.alt_svc_header().as_deref(), Some("h3=\":443\""));

        config.http3 = false;
        assert_eq!(config.alt_svc_header(), None);
    }

    #[test]
    fn test_flag_parsing() {
        let config = Config::parse_from([
            "portti",
            "--ingress-class-name",
            "portti",
            "--host-ip",
            "10.0.0.7",
            "--hsts",
            "--hsts-subdomains",
            "false",
            "--debounce-duration",
            "250",
        ]);
        assert_eq!(config.ingress_class_name, "portti");
        assert_eq!(config.host_ip, Some("10.0.0.7".parse().unwrap()));
        let hsts = config.hsts_config().unwrap();
        assert!(!hsts.include_subdomains);
        assert_eq!(config.debounce_duration(), Duration::from_millis(250));
    }
}
