//! # Interface Table
//!
//! One context per configured network interface: the unicast RPC sockets
//! (UDP per IP version, TCP listeners where endpoints ask for TCP), the SD
//! sockets joined to the configured multicast groups, and the table of
//! actually-bound ports so offers advertise real ports even when the
//! config requested ephemeral ones.
//!
//! Socket setup goes through `socket2` because tokio's binder cannot
//! express the SD socket options: `SO_REUSEADDR`/`SO_REUSEPORT`, multicast
//! join with an explicit interface, multicast TTL/hops and loopback. The
//! per-OS bind policy lives in `bind_sd_socket_v4`/`_v6`: on Linux the SD
//! socket binds the wildcard (binding the unicast address blocks multicast
//! reception) and pins the device with `SO_BINDTODEVICE` when permitted;
//! elsewhere it binds the interface address.

use std::collections::{BTreeSet, HashMap};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpListener, UdpSocket};

use crate::config::{
    Config, EndpointConfig, InstanceConfig, InterfaceConfig, SdTiming, Transport,
};
use crate::error::{ConfigError, Error, Result};

/// A bound unicast UDP endpoint
pub struct UdpEndpoint {
    pub name: String,
    pub socket: Arc<UdpSocket>,
    pub addr: SocketAddr,
}

/// A bound TCP listener endpoint
pub struct TcpEndpoint {
    pub name: String,
    pub listener: Arc<TcpListener>,
    pub addr: SocketAddr,
}

/// An SD socket joined to its multicast group
pub struct SdSocket {
    pub socket: Arc<UdpSocket>,
    /// Group address and port; cyclic offers and finds are sent here
    pub group: SocketAddr,
}

/// Everything the runtime owns on one network interface
pub struct InterfaceContext {
    pub index: usize,
    pub alias: String,
    /// OS-level name (eth0, veth0, lo, ..)
    pub os_name: String,
    pub ifindex: u32,
    /// Interface addresses taken from the configured unicast endpoints
    pub local_v4: Option<Ipv4Addr>,
    pub local_v6: Option<Ipv6Addr>,
    pub udp: Vec<UdpEndpoint>,
    pub tcp: Vec<TcpEndpoint>,
    pub sd_v4: Option<SdSocket>,
    pub sd_v6: Option<SdSocket>,
    /// Endpoint name -> actually bound port
    pub bound_ports: HashMap<String, u16>,
    /// Endpoint name named by `unicast_bind`; requests prefer this socket
    default_udp: Option<String>,
}

impl InterfaceContext {
    /// The UDP socket used for requests of the given address family
    pub fn udp_for_family(&self, v6: bool) -> Option<&UdpEndpoint> {
        let matches_family = |ep: &&UdpEndpoint| ep.addr.is_ipv6() == v6;
        self.default_udp
            .as_ref()
            .and_then(|name| self.udp.iter().filter(matches_family).find(|ep| &ep.name == name))
            .or_else(|| self.udp.iter().find(matches_family))
    }

    /// The SD socket of the given address family
    pub fn sd_for_family(&self, v6: bool) -> Option<&SdSocket> {
        if v6 {
            self.sd_v6.as_ref()
        } else {
            self.sd_v4.as_ref()
        }
    }

    /// The unicast SD endpoint of a peer on this interface: the peer's
    /// address at the SD port
    pub fn sd_unicast_target(&self, peer: SocketAddr) -> Option<SocketAddr> {
        self.sd_for_family(peer.is_ipv6())
            .map(|sd| SocketAddr::new(peer.ip(), sd.group.port()))
    }

    /// The address advertised in endpoint options for a bound endpoint
    pub fn advertised_addr(&self, bound: SocketAddr) -> SocketAddr {
        if !bound.ip().is_unspecified() {
            return bound;
        }
        let ip = if bound.is_ipv6() {
            self.local_v6.map(IpAddr::V6)
        } else {
            self.local_v4.map(IpAddr::V4)
        };
        match ip {
            Some(ip) => SocketAddr::new(ip, bound.port()),
            None => bound,
        }
    }
}

/// The set of interface contexts a runtime instance owns
pub struct InterfaceTable {
    pub contexts: Vec<InterfaceContext>,
}

impl InterfaceTable {
    /// Bind every socket the instance needs. Any bind or join failure here
    /// is fatal; the runtime does not come up half-wired.
    pub fn bind(config: &Config, instance: &InstanceConfig, timing: &SdTiming) -> Result<Self> {
        let mut contexts = Vec::new();

        for (index, alias) in instance_interfaces(config, instance)?.into_iter().enumerate() {
            let iface = config
                .interfaces
                .get(&alias)
                .ok_or_else(|| ConfigError::new(format!("unknown interface '{}'", alias)))?;
            contexts.push(Self::bind_interface(
                config, instance, timing, index, &alias, iface,
            )?);
        }

        if contexts.is_empty() {
            return Err(ConfigError::new("no interfaces configured").into());
        }

        Ok(Self { contexts })
    }

    fn bind_interface(
        config: &Config,
        instance: &InstanceConfig,
        timing: &SdTiming,
        index: usize,
        alias: &str,
        iface: &InterfaceConfig,
    ) -> Result<InterfaceContext> {
        let ifindex = interface_index(&iface.name);
        let local_v4 = iface.endpoints.values().find_map(|ep| match ep.ip {
            IpAddr::V4(ip) if !ip.is_multicast() => Some(ip),
            _ => None,
        });
        let local_v6 = iface.endpoints.values().find_map(|ep| match ep.ip {
            IpAddr::V6(ip) if !ip.is_multicast() => Some(ip),
            _ => None,
        });

        let mut context = InterfaceContext {
            index,
            alias: alias.to_string(),
            os_name: iface.name.clone(),
            ifindex,
            local_v4,
            local_v6,
            udp: Vec::new(),
            tcp: Vec::new(),
            sd_v4: None,
            sd_v6: None,
            bound_ports: HashMap::new(),
            default_udp: instance.unicast_bind.get(alias).cloned(),
        };

        // Unicast endpoints: the RPC bind plus everything services offer on
        let mut endpoint_names = BTreeSet::new();
        if let Some(name) = instance.unicast_bind.get(alias) {
            endpoint_names.insert(name.clone());
        }
        for service in instance.providing.values() {
            if !offers_on(service, alias) {
                continue;
            }
            if let Some(name) = offer_endpoint_name(service, alias, instance) {
                endpoint_names.insert(name);
            }
        }

        for name in endpoint_names {
            let endpoint = config.resolve_endpoint(iface, &name).ok_or_else(|| {
                ConfigError::new(format!(
                    "endpoint '{}' referenced on interface '{}' is not defined",
                    name, alias
                ))
            })?;
            if endpoint.is_multicast() {
                continue;
            }
            match endpoint.protocol {
                Transport::Udp => {
                    let socket = bind_udp(endpoint.socket_addr())?;
                    let addr = socket.local_addr()?;
                    context.bound_ports.insert(name.clone(), addr.port());
                    tracing::info!(
                        "Bound {} (udp) on {} (endpoint={})",
                        addr,
                        alias,
                        name
                    );
                    context.udp.push(UdpEndpoint {
                        name,
                        socket: Arc::new(socket),
                        addr,
                    });
                }
                Transport::Tcp => {
                    let listener = bind_tcp(endpoint.socket_addr())?;
                    let addr = listener.local_addr()?;
                    context.bound_ports.insert(name.clone(), addr.port());
                    tracing::info!(
                        "Bound {} (tcp) on {} (endpoint={})",
                        addr,
                        alias,
                        name
                    );
                    context.tcp.push(TcpEndpoint {
                        name,
                        listener: Arc::new(listener),
                        addr,
                    });
                }
            }
        }

        // SD sockets joined to the configured multicast groups
        if let Some(sd) = &iface.sd {
            if let Some(name) = &sd.endpoint {
                let group = resolve_sd_endpoint(config, iface, name)?;
                if let IpAddr::V4(group_ip) = group.ip() {
                    let socket = bind_sd_socket_v4(
                        group_ip,
                        group.port(),
                        local_v4.unwrap_or(Ipv4Addr::UNSPECIFIED),
                        &iface.name,
                        timing,
                    )?;
                    context.sd_v4 = Some(SdSocket {
                        socket: Arc::new(socket),
                        group,
                    });
                } else {
                    return Err(ConfigError::new(format!(
                        "SD endpoint '{}' on '{}' must be IPv4",
                        name, alias
                    ))
                    .into());
                }
            }
            if let Some(name) = &sd.endpoint_v6 {
                let group = resolve_sd_endpoint(config, iface, name)?;
                if let IpAddr::V6(group_ip) = group.ip() {
                    let socket =
                        bind_sd_socket_v6(group_ip, group.port(), ifindex, &iface.name, timing)?;
                    context.sd_v6 = Some(SdSocket {
                        socket: Arc::new(socket),
                        group,
                    });
                } else {
                    return Err(ConfigError::new(format!(
                        "SD endpoint '{}' on '{}' must be IPv6",
                        name, alias
                    ))
                    .into());
                }
            }
        }

        Ok(context)
    }

    pub fn by_alias(&self, alias: &str) -> Option<&InterfaceContext> {
        self.contexts.iter().find(|context| context.alias == alias)
    }

    /// The context used to reach a target: the preferred interface when it
    /// matches the address family, otherwise the first context that does
    pub fn context_for_target(
        &self,
        target: SocketAddr,
        preferred: Option<&str>,
    ) -> Option<&InterfaceContext> {
        let family_ok = |context: &&InterfaceContext| {
            context.udp_for_family(target.is_ipv6()).is_some()
                || context
                    .tcp
                    .iter()
                    .any(|ep| ep.addr.is_ipv6() == target.is_ipv6())
        };
        preferred
            .and_then(|alias| self.by_alias(alias))
            .filter(family_ok)
            .or_else(|| self.contexts.iter().find(family_ok))
    }
}

/// The interface aliases an instance actually uses, in deterministic order.
/// An instance that names none uses every configured interface.
fn instance_interfaces(config: &Config, instance: &InstanceConfig) -> Result<Vec<String>> {
    let mut aliases = BTreeSet::new();
    aliases.extend(instance.unicast_bind.keys().cloned());
    for service in instance.providing.values() {
        aliases.extend(service.interfaces.iter().cloned());
        aliases.extend(service.offer_on.keys().cloned());
    }
    for required in instance.required.values() {
        aliases.extend(required.find_on.iter().cloned());
        aliases.extend(required.preferred_interface.iter().cloned());
    }

    if aliases.is_empty() {
        let mut all: Vec<String> = config.interfaces.keys().cloned().collect();
        all.sort();
        return Ok(all);
    }

    for alias in &aliases {
        if !config.interfaces.contains_key(alias) {
            return Err(ConfigError::new(format!("unknown interface '{}'", alias)).into());
        }
    }
    Ok(aliases.into_iter().collect())
}

/// Whether a provided service is offered on the given interface alias.
/// Unconstrained services ride on every interface the instance binds.
pub fn offers_on(service: &crate::config::ProvidedService, alias: &str) -> bool {
    if !service.interfaces.is_empty() {
        return service.interfaces.iter().any(|a| a == alias);
    }
    if !service.offer_on.is_empty() {
        return service.offer_on.contains_key(alias);
    }
    true
}

/// The endpoint name a service binds on one interface
pub fn offer_endpoint_name(
    service: &crate::config::ProvidedService,
    alias: &str,
    instance: &InstanceConfig,
) -> Option<String> {
    service
        .offer_on
        .get(alias)
        .or(service.endpoint.as_ref())
        .or_else(|| instance.unicast_bind.get(alias))
        .cloned()
}

fn resolve_sd_endpoint(
    config: &Config,
    iface: &InterfaceConfig,
    name: &str,
) -> Result<SocketAddr> {
    let endpoint: &EndpointConfig = config.resolve_endpoint(iface, name).ok_or_else(|| {
        Error::from(ConfigError::new(format!("SD endpoint '{}' is not defined", name)))
    })?;
    if !endpoint.is_multicast() {
        return Err(ConfigError::new(format!(
            "SD endpoint '{}' must name a multicast group",
            name
        ))
        .into());
    }
    Ok(endpoint.socket_addr())
}

// ============================================================================
// SOCKET SETUP
// ============================================================================

fn bind_udp(addr: SocketAddr) -> Result<UdpSocket> {
    let domain = if addr.is_ipv6() {
        Domain::IPV6
    } else {
        Domain::IPV4
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    if addr.is_ipv6() {
        socket.set_only_v6(true)?;
    }
    socket.bind(&addr.into())?;
    socket.set_nonblocking(true)?;
    Ok(UdpSocket::from_std(socket.into())?)
}

fn bind_tcp(addr: SocketAddr) -> Result<TcpListener> {
    let domain = if addr.is_ipv6() {
        Domain::IPV6
    } else {
        Domain::IPV4
    };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    if addr.is_ipv6() {
        socket.set_only_v6(true)?;
    }
    socket.bind(&addr.into())?;
    socket.listen(128)?;
    socket.set_nonblocking(true)?;
    Ok(TcpListener::from_std(socket.into())?)
}

/// SD socket policy, IPv4.
///
/// Linux delivers multicast only to sockets bound to the wildcard or the
/// group itself, so the socket binds `0.0.0.0:<port>` and pins the device
/// with `SO_BINDTODEVICE` where permitted (it needs CAP_NET_RAW; without it
/// reception is loose across interfaces, which only matters on multi-homed
/// hosts). Other platforms bind the interface address.
fn bind_sd_socket_v4(
    group: Ipv4Addr,
    port: u16,
    iface_ip: Ipv4Addr,
    os_name: &str,
    timing: &SdTiming,
) -> Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
    socket.set_reuse_port(true)?;

    if cfg!(target_os = "linux") {
        socket.bind(&SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port).into())?;
        #[cfg(target_os = "linux")]
        if let Err(e) = socket.bind_device(Some(os_name.as_bytes())) {
            tracing::warn!(
                "SO_BINDTODEVICE on {} failed ({}); multicast reception may be loose",
                os_name,
                e
            );
        }
    } else {
        socket.bind(&SocketAddr::new(IpAddr::V4(iface_ip), port).into())?;
    }

    socket.join_multicast_v4(&group, &iface_ip)?;
    socket.set_multicast_if_v4(&iface_ip)?;
    socket.set_multicast_ttl_v4(timing.multicast_hops)?;
    socket.set_multicast_loop_v4(true)?;
    socket.set_nonblocking(true)?;
    tracing::debug!(
        "SD socket joined {}:{} on {} (if {})",
        group,
        port,
        iface_ip,
        os_name
    );
    Ok(UdpSocket::from_std(socket.into())?)
}

/// SD socket policy, IPv6: wildcard bind plus scoped join by interface
/// index.
fn bind_sd_socket_v6(
    group: Ipv6Addr,
    port: u16,
    ifindex: u32,
    os_name: &str,
    timing: &SdTiming,
) -> Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV6, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
    socket.set_reuse_port(true)?;
    socket.set_only_v6(true)?;
    socket.bind(&SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), port).into())?;

    socket.join_multicast_v6(&group, ifindex)?;
    socket.set_multicast_if_v6(ifindex)?;
    socket.set_multicast_hops_v6(timing.multicast_hops)?;
    socket.set_multicast_loop_v6(true)?;
    socket.set_nonblocking(true)?;
    tracing::debug!(
        "SD socket joined [{}]:{} on {} (ifindex {})",
        group,
        port,
        os_name,
        ifindex
    );
    Ok(UdpSocket::from_std(socket.into())?)
}

/// Interface name to index. Linux exposes it in sysfs; elsewhere 0 lets
/// the kernel pick the default interface.
#[cfg(target_os = "linux")]
fn interface_index(name: &str) -> u32 {
    std::fs::read_to_string(format!("/sys/class/net/{}/ifindex", name))
        .ok()
        .and_then(|content| content.trim().parse().ok())
        .unwrap_or(0)
}

#[cfg(not(target_os = "linux"))]
fn interface_index(_name: &str) -> u32 {
    0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    const LOOPBACK: &str = r#"{
        "interfaces": {
            "primary": {
                "name": "lo",
                "endpoints": {
                    "uc": { "ip": "127.0.0.1", "port": 0 },
                    "uc_tcp": { "ip": "127.0.0.1", "port": 0, "protocol": "tcp" }
                }
            }
        },
        "instances": {
            "server": {
                "unicast_bind": { "primary": "uc" },
                "providing": {
                    "svc": { "service_id": 4097, "offer_on": { "primary": "uc_tcp" } }
                }
            }
        }
    }"#;

    #[tokio::test]
    async fn binds_ephemeral_ports_and_records_them() {
        let config = Config::from_json(LOOPBACK).unwrap();
        let instance = config.instance("server").unwrap();
        let table = InterfaceTable::bind(&config, instance, &config.sd).unwrap();

        assert_eq!(table.contexts.len(), 1);
        let context = &table.contexts[0];
        assert_eq!(context.alias, "primary");
        assert_eq!(context.local_v4, Some(Ipv4Addr::LOCALHOST));

        // both the RPC bind and the TCP offer endpoint got real ports
        assert!(context.bound_ports["uc"] != 0);
        assert!(context.bound_ports["uc_tcp"] != 0);
        assert_eq!(context.udp.len(), 1);
        assert_eq!(context.tcp.len(), 1);

        let udp = context.udp_for_family(false).unwrap();
        assert_eq!(udp.name, "uc");
        assert!(context.udp_for_family(true).is_none());
    }

    #[tokio::test]
    async fn unknown_endpoint_reference_is_fatal() {
        let config = Config::from_json(
            r#"{
                "interfaces": { "primary": { "name": "lo", "endpoints": {} } },
                "instances": {
                    "broken": { "unicast_bind": { "primary": "ghost" } }
                }
            }"#,
        )
        .unwrap();
        let instance = config.instance("broken").unwrap();
        assert!(InterfaceTable::bind(&config, instance, &config.sd).is_err());
    }

    #[test_log::test]
    fn interface_selection_collects_referenced_aliases() {
        let config = Config::from_json(LOOPBACK).unwrap();
        let instance = config.instance("server").unwrap();
        let aliases = instance_interfaces(&config, instance).unwrap();
        assert_eq!(aliases, vec!["primary".to_string()]);
    }
}
