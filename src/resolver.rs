// resolver.rs - Locating the SIP server through DNS SRV

use crate::config::{AccountConfig, DEFAULT_SIP_PORT};
use crate::transport::TransportProtocol;
use crate::{SipError, SipResult};
use hickory_resolver::TokioAsyncResolver;
use std::net::{IpAddr, SocketAddr};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SrvRecord {
    pub priority: u16,
    pub weight: u16,
    pub port: u16,
    pub target: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedTarget {
    pub host: String,
    pub port: u16,
}

/// Lowest priority wins, then the highest weight. Without usable records
/// the configured connect host is used. A configured port always wins.
pub fn select_target(records: &[SrvRecord], config: &AccountConfig) -> ResolvedTarget {
    let best = records
        .iter()
        .filter(|record| !record.target.is_empty() && record.target != ".")
        .min_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then_with(|| b.weight.cmp(&a.weight))
        });

    let (host, srv_port) = match best {
        Some(record) => (record.target.trim_end_matches('.').to_string(), record.port),
        None => (config.connect_host().to_string(), DEFAULT_SIP_PORT),
    };

    let port = match config.port {
        0 if srv_port != 0 => srv_port,
        0 => DEFAULT_SIP_PORT,
        port => port,
    };

    ResolvedTarget { host, port }
}

/// SRV records for `_sip._udp.<domain>` or `_sip._tcp.<domain>`. Lookup
/// failures are logged and yield no records.
pub async fn lookup_srv(protocol: TransportProtocol, domain: &str) -> Vec<SrvRecord> {
    let name = format!("{}.{}.", protocol.srv_prefix(), domain.trim_end_matches('.'));

    let resolver = match TokioAsyncResolver::tokio_from_system_conf() {
        Ok(resolver) => resolver,
        Err(e) => {
            warn!("No system resolver configuration: {}", e);
            return Vec::new();
        }
    };

    match resolver.srv_lookup(name.as_str()).await {
        Ok(lookup) => lookup
            .iter()
            .map(|srv| SrvRecord {
                priority: srv.priority(),
                weight: srv.weight(),
                port: srv.port(),
                target: srv.target().to_utf8(),
            })
            .collect(),
        Err(e) => {
            debug!("SRV lookup for {} failed: {}", name, e);
            Vec::new()
        }
    }
}

pub async fn resolve_addr(target: &ResolvedTarget) -> SipResult<SocketAddr> {
    let all: Vec<SocketAddr> = tokio::net::lookup_host((target.host.as_str(), target.port))
        .await
        .map_err(|e| {
            SipError::ConnectionError(format!("Couldn't resolve host {}: {}", target.host, e))
        })?
        .collect();

    // the session binds an IPv4 socket, prefer a matching address
    all.iter()
        .find(|addr| addr.is_ipv4())
        .or_else(|| all.first())
        .copied()
        .ok_or_else(|| {
            SipError::ConnectionError(format!("Couldn't resolve host {}", target.host))
        })
}

/// SRV lookup on the connect host, then address resolution. Address
/// literals skip the SRV step.
pub async fn resolve(config: &AccountConfig) -> SipResult<(ResolvedTarget, SocketAddr)> {
    let records = if config.connect_host().parse::<IpAddr>().is_ok() {
        Vec::new()
    } else {
        lookup_srv(config.transport, config.connect_host()).await
    };
    let target = select_target(&records, config);
    let addr = resolve_addr(&target).await?;
    info!("SIP server {}:{} resolved to {}", target.host, target.port, addr);
    Ok((target, addr))
}
