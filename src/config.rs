//! # Runtime Configuration
//!
//! JSON configuration for endpoints, interfaces, SD timing and per-instance
//! service wiring. The schema mirrors what deployment tooling generates:
//!
//! ```json
//! {
//!     "endpoints": { "uc1": { "ip": "10.0.1.1", "port": 0, "protocol": "udp" } },
//!     "interfaces": {
//!         "primary": {
//!             "name": "eth0",
//!             "endpoints": {
//!                 "uc1": { "ip": "10.0.1.1", "port": 0, "protocol": "udp" },
//!                 "sd_mc": { "ip": "224.0.0.1", "port": 30490, "protocol": "udp" }
//!             },
//!             "sd": { "endpoint": "sd_mc" }
//!         }
//!     },
//!     "sd": { "cycle_offer_ms": 1000, "request_timeout_ms": 5000 },
//!     "instances": {
//!         "server": {
//!             "unicast_bind": { "primary": "uc1" },
//!             "providing": {
//!                 "math": { "service_id": 4097, "instance_id": 1,
//!                           "offer_on": { "primary": "uc1" } }
//!             }
//!         }
//!     }
//! }
//! ```
//!
//! Unknown keys are ignored everywhere, so configs carrying fields for
//! other tools load unchanged. A `port` of 0 requests an ephemeral port;
//! the bound port is read back and advertised in offers.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;

use serde::Deserialize;

use crate::error::ConfigError;
use crate::wire::{L4Protocol, SdEntry};

/// Default SD multicast group (IPv4)
pub const DEFAULT_SD_MULTICAST_V4: &str = "224.0.0.1";
/// Default SD multicast group (IPv6)
pub const DEFAULT_SD_MULTICAST_V6: &str = "ff02::1";
/// Default SD port
pub const DEFAULT_SD_PORT: u16 = 30490;

fn default_cycle_offer_ms() -> u64 {
    1000
}
fn default_request_response_delay_ms() -> u64 {
    0
}
fn default_request_timeout_ms() -> u64 {
    5000
}
fn default_multicast_hops() -> u32 {
    1
}
fn default_offer_ttl() -> u32 {
    SdEntry::TTL_INFINITE
}
fn default_instance_id() -> u16 {
    1
}
fn default_any_instance() -> u16 {
    0xFFFF
}
fn default_major_version() -> u8 {
    1
}

/// Transport protocol of an endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    #[default]
    Udp,
    Tcp,
}

impl Transport {
    pub fn l4(&self) -> L4Protocol {
        match self {
            Transport::Udp => L4Protocol::Udp,
            Transport::Tcp => L4Protocol::Tcp,
        }
    }
}

/// A named endpoint: an address, a port and a transport
#[derive(Debug, Clone, Deserialize)]
pub struct EndpointConfig {
    pub ip: IpAddr,
    /// Physical interface hint; normally inherited from the interface block
    #[serde(default)]
    pub interface: Option<String>,
    /// IP version (4 or 6); derived from `ip` when missing
    #[serde(default)]
    pub version: Option<u8>,
    /// 0 requests an ephemeral port
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub protocol: Transport,
}

impl EndpointConfig {
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }

    pub fn ip_version(&self) -> u8 {
        self.version
            .unwrap_or(if self.ip.is_ipv6() { 6 } else { 4 })
    }

    pub fn is_multicast(&self) -> bool {
        self.ip.is_multicast()
    }
}

/// SD endpoints of one interface, by name
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SdEndpoints {
    /// IPv4 SD multicast endpoint name
    #[serde(default, alias = "endpoint_v4")]
    pub endpoint: Option<String>,
    /// IPv6 SD multicast endpoint name
    #[serde(default)]
    pub endpoint_v6: Option<String>,
}

/// One network interface and the endpoints configured on it
#[derive(Debug, Clone, Deserialize)]
pub struct InterfaceConfig {
    /// OS-level interface name (eth0, veth0, lo, ..)
    pub name: String,
    #[serde(default)]
    pub endpoints: HashMap<String, EndpointConfig>,
    #[serde(default)]
    pub sd: Option<SdEndpoints>,
}

/// Global SD timing knobs; per-instance blocks may override individual
/// fields
#[derive(Debug, Clone, Deserialize)]
pub struct SdTiming {
    #[serde(default = "default_cycle_offer_ms")]
    pub cycle_offer_ms: u64,
    /// Delay before answering FindService / Subscribe with unicast SD
    #[serde(default = "default_request_response_delay_ms")]
    pub request_response_delay_ms: u64,
    /// Deadline for `send_request`, `wait_for_service` and `create_client`
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_multicast_hops")]
    pub multicast_hops: u32,
    /// TTL advertised in OfferService entries (seconds, 24-bit)
    #[serde(default = "default_offer_ttl")]
    pub offer_ttl: u32,
}

impl Default for SdTiming {
    fn default() -> Self {
        Self {
            cycle_offer_ms: default_cycle_offer_ms(),
            request_response_delay_ms: default_request_response_delay_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            multicast_hops: default_multicast_hops(),
            offer_ttl: default_offer_ttl(),
        }
    }
}

/// Partial SD timing override carried by an instance block
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SdTimingOverride {
    #[serde(default)]
    pub cycle_offer_ms: Option<u64>,
    #[serde(default)]
    pub request_response_delay_ms: Option<u64>,
    #[serde(default)]
    pub request_timeout_ms: Option<u64>,
    #[serde(default)]
    pub multicast_hops: Option<u32>,
    #[serde(default)]
    pub offer_ttl: Option<u32>,
}

impl SdTiming {
    /// Apply a per-instance override on top of the global block
    pub fn merged(&self, with: &SdTimingOverride) -> SdTiming {
        SdTiming {
            cycle_offer_ms: with.cycle_offer_ms.unwrap_or(self.cycle_offer_ms),
            request_response_delay_ms: with
                .request_response_delay_ms
                .unwrap_or(self.request_response_delay_ms),
            request_timeout_ms: with.request_timeout_ms.unwrap_or(self.request_timeout_ms),
            multicast_hops: with.multicast_hops.unwrap_or(self.multicast_hops),
            offer_ttl: with.offer_ttl.unwrap_or(self.offer_ttl),
        }
    }
}

/// A service this instance provides
#[derive(Debug, Clone, Deserialize)]
pub struct ProvidedService {
    pub service_id: u16,
    #[serde(default = "default_instance_id")]
    pub instance_id: u16,
    #[serde(default = "default_major_version")]
    pub major_version: u8,
    #[serde(default)]
    pub minor_version: u32,
    /// Endpoint name used on every interface unless `offer_on` overrides it
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Optional event multicast endpoint advertised alongside the unicast
    /// endpoint
    #[serde(default)]
    pub multicast: Option<String>,
    /// Interfaces to offer on; empty means every configured interface
    #[serde(default)]
    pub interfaces: Vec<String>,
    /// Per-interface endpoint override: interface alias -> endpoint name
    #[serde(default)]
    pub offer_on: HashMap<String, String>,
    /// Per-service cyclic offer period
    #[serde(default)]
    pub cycle_offer_ms: Option<u64>,
}

/// A service this instance consumes
#[derive(Debug, Clone, Deserialize)]
pub struct RequiredService {
    pub service_id: u16,
    #[serde(default = "default_any_instance")]
    pub instance_id: u16,
    #[serde(default = "default_major_version")]
    pub major_version: u8,
    #[serde(default)]
    pub minor_version: u32,
    /// Static endpoint name; set when the peer is known without SD
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Interface whose sockets carry requests to this service
    #[serde(default)]
    pub preferred_interface: Option<String>,
    /// Accept offers only from these interfaces; empty means all
    #[serde(default)]
    pub find_on: Vec<String>,
}

/// One runtime instance: what it binds, provides and requires
#[derive(Debug, Clone, Default, Deserialize)]
pub struct InstanceConfig {
    #[serde(default)]
    pub providing: HashMap<String, ProvidedService>,
    #[serde(default)]
    pub required: HashMap<String, RequiredService>,
    /// Interface alias -> endpoint name bound as the unicast RPC socket
    #[serde(default)]
    pub unicast_bind: HashMap<String, String>,
    #[serde(default)]
    pub sd: Option<SdTimingOverride>,
}

/// Top-level configuration document
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Global endpoints, resolvable from any interface
    #[serde(default)]
    pub endpoints: HashMap<String, EndpointConfig>,
    #[serde(default)]
    pub interfaces: HashMap<String, InterfaceConfig>,
    #[serde(default)]
    pub sd: SdTiming,
    #[serde(default)]
    pub instances: HashMap<String, InstanceConfig>,
}

impl Config {
    /// Load from a JSON file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::new(format!("cannot read {}: {}", path.display(), e)))?;
        Self::from_json(&raw)
    }

    /// Parse from a JSON string
    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(raw).map_err(|e| ConfigError::new(format!("invalid config: {}", e)))
    }

    pub fn instance(&self, name: &str) -> Result<&InstanceConfig, ConfigError> {
        self.instances
            .get(name)
            .ok_or_else(|| ConfigError::new(format!("instance '{}' not found", name)))
    }

    /// Effective SD timing for one instance
    pub fn sd_timing(&self, instance: &InstanceConfig) -> SdTiming {
        match &instance.sd {
            Some(overrides) => self.sd.merged(overrides),
            None => self.sd.clone(),
        }
    }

    /// Resolve an endpoint name: interface-local endpoints shadow the
    /// global table
    pub fn resolve_endpoint<'a>(
        &'a self,
        iface: &'a InterfaceConfig,
        name: &str,
    ) -> Option<&'a EndpointConfig> {
        iface
            .endpoints
            .get(name)
            .or_else(|| self.endpoints.get(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "endpoints": {
            "global_uc": { "ip": "10.0.2.1", "port": 40100, "protocol": "tcp" }
        },
        "interfaces": {
            "primary": {
                "name": "veth0",
                "endpoints": {
                    "uc_v4": { "ip": "10.0.1.1", "port": 0 },
                    "uc_v6": { "ip": "fd00::1", "port": 0, "protocol": "udp" },
                    "sd_mc": { "ip": "224.224.224.245", "port": 30890 }
                },
                "sd": { "endpoint": "sd_mc" }
            }
        },
        "sd": { "cycle_offer_ms": 500, "request_timeout_ms": 3000 },
        "instances": {
            "server": {
                "unicast_bind": { "primary": "uc_v4" },
                "providing": {
                    "math": {
                        "service_id": 4097,
                        "offer_on": { "primary": "uc_v4" },
                        "future_knob": true
                    }
                },
                "sd": { "cycle_offer_ms": 250 }
            },
            "client": {
                "required": {
                    "math": { "service_id": 4097, "find_on": ["primary"] },
                    "static_math": { "service_id": 4098, "endpoint": "global_uc" }
                }
            }
        },
        "tooling_section": { "ignored": 1 }
    }"#;

    #[test_log::test]
    fn parses_sample_and_ignores_unknown_keys() {
        let config = Config::from_json(SAMPLE).unwrap();

        let iface = &config.interfaces["primary"];
        assert_eq!(iface.name, "veth0");
        assert_eq!(
            iface.sd.as_ref().unwrap().endpoint.as_deref(),
            Some("sd_mc")
        );

        let uc = &iface.endpoints["uc_v4"];
        assert_eq!(uc.port, 0);
        assert_eq!(uc.protocol, Transport::Udp);
        assert_eq!(uc.ip_version(), 4);
        assert_eq!(iface.endpoints["uc_v6"].ip_version(), 6);
        assert!(iface.endpoints["sd_mc"].is_multicast());

        let server = config.instance("server").unwrap();
        let math = &server.providing["math"];
        assert_eq!(math.service_id, 4097);
        assert_eq!(math.instance_id, 1);
        assert_eq!(math.major_version, 1);
        assert_eq!(math.offer_on["primary"], "uc_v4");
    }

    #[test_log::test]
    fn instance_sd_overrides_merge_over_global() {
        let config = Config::from_json(SAMPLE).unwrap();

        assert_eq!(config.sd.cycle_offer_ms, 500);
        assert_eq!(config.sd.request_timeout_ms, 3000);
        assert_eq!(config.sd.multicast_hops, 1);

        let server = config.instance("server").unwrap();
        let timing = config.sd_timing(server);
        assert_eq!(timing.cycle_offer_ms, 250);
        assert_eq!(timing.request_timeout_ms, 3000);

        let client = config.instance("client").unwrap();
        assert_eq!(config.sd_timing(client).cycle_offer_ms, 500);
    }

    #[test_log::test]
    fn required_service_defaults() {
        let config = Config::from_json(SAMPLE).unwrap();
        let client = config.instance("client").unwrap();

        let math = &client.required["math"];
        assert_eq!(math.instance_id, 0xFFFF);
        assert_eq!(math.find_on, vec!["primary"]);
        assert!(math.endpoint.is_none());

        let fixed = &client.required["static_math"];
        assert_eq!(fixed.endpoint.as_deref(), Some("global_uc"));
    }

    #[test_log::test]
    fn endpoint_resolution_prefers_interface_local_names() {
        let config = Config::from_json(SAMPLE).unwrap();
        let iface = &config.interfaces["primary"];

        assert_eq!(
            config.resolve_endpoint(iface, "uc_v4").unwrap().ip,
            "10.0.1.1".parse::<IpAddr>().unwrap()
        );
        let global = config.resolve_endpoint(iface, "global_uc").unwrap();
        assert_eq!(global.port, 40100);
        assert_eq!(global.protocol, Transport::Tcp);
        assert!(config.resolve_endpoint(iface, "nope").is_none());
    }

    #[test_log::test]
    fn missing_instance_is_an_error() {
        let config = Config::from_json(SAMPLE).unwrap();
        assert!(config.instance("ghost").is_err());
        assert!(Config::from_json("{ not json").is_err());
    }
}
