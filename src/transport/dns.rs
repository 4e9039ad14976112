//! DNS resolution for the default TCP connector.
//!
//! Grounded on the teacher's `connect::DnsConfig`/`Tcp::resolve_with_srv`
//! (`connect/dns.rs`, `connect/mod.rs`): try an SRV lookup for the service
//! first, fall back to A/AAAA plus the hinted port on failure. `hickory`
//! only exposes an async resolver, so each lookup runs on a throwaway
//! current-thread runtime rather than keeping one alive for the process.

use std::net::{IpAddr, SocketAddr, TcpStream};
#[cfg(not(feature = "dns"))]
use std::net::ToSocketAddrs;

use crate::config::SessionOptions;
use crate::error::Error;

#[cfg(feature = "dns")]
fn block_on<F: std::future::Future>(fut: F) -> F::Output {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("failed to start local DNS runtime")
        .block_on(fut)
}

fn bind_and_connect(addr: SocketAddr, options: &SessionOptions) -> std::io::Result<TcpStream> {
    use socket2::{Domain, Socket, Type};

    let domain = if addr.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
    let socket = Socket::new(domain, Type::STREAM, None)?;
    if let Some(ip) = options.local_ip {
        let port = options.local_port.unwrap_or(0);
        socket.bind(&SocketAddr::new(ip, port).into())?;
    }
    socket.connect(&addr.into())?;
    Ok(socket.into())
}

#[cfg(feature = "dns")]
pub(super) fn resolve(
    domain: &str,
    srv_name: &str,
    fallback_port: u16,
    options: &SessionOptions,
) -> Result<TcpStream, Error> {
    use hickory_resolver::{IntoName, TokioAsyncResolver};

    let ascii_domain = idna::domain_to_ascii(domain).map_err(|_| Error::Connect(format!(
        "invalid domain name: {domain}"
    )))?;

    if let Ok(ip) = ascii_domain.parse::<IpAddr>() {
        log::debug!("connecting directly to {ip}:{fallback_port}");
        return bind_and_connect(SocketAddr::new(ip, fallback_port), options)
            .map_err(|e| Error::Connect(e.to_string()));
    }

    if options.port.is_some() {
        log::debug!("explicit port override set, skipping SRV lookup for {ascii_domain}");
        let ip = block_on(async {
            let resolver = TokioAsyncResolver::tokio_from_system_conf()
                .map_err(|e| Error::Connect(e.to_string()))?;
            resolver
                .lookup_ip(ascii_domain.clone())
                .await
                .map_err(|e| Error::Connect(e.to_string()))?
                .into_iter()
                .next()
                .ok_or_else(|| Error::Connect(format!("no address found for {ascii_domain}")))
        })?;
        return bind_and_connect(SocketAddr::new(ip, fallback_port), options)
            .map_err(|e| Error::Connect(e.to_string()));
    }

    let attempt = block_on(async {
        let resolver = TokioAsyncResolver::tokio_from_system_conf()
            .map_err(|e| Error::Connect(e.to_string()))?;
        let srv_domain = format!("{srv_name}.{ascii_domain}.")
            .into_name()
            .map_err(|e| Error::Connect(e.to_string()))?;
        if let Ok(lookup) = resolver.srv_lookup(srv_domain.clone()).await {
            for srv in lookup.iter() {
                log::debug!("trying SRV target {} port {}", srv.target(), srv.port());
                let host = srv.target().to_ascii();
                if let Ok(ips) = resolve_host(&resolver, &host).await {
                    for ip in ips {
                        return Ok((ip, srv.port()));
                    }
                }
            }
        }
        let ips = resolver
            .lookup_ip(ascii_domain.clone())
            .await
            .map_err(|e| Error::Connect(e.to_string()))?;
        ips.into_iter()
            .next()
            .map(|ip| (ip, fallback_port))
            .ok_or_else(|| Error::Connect(format!("no address found for {ascii_domain}")))
    })?;

    let (ip, port) = attempt;
    bind_and_connect(SocketAddr::new(ip, port), options).map_err(|e| Error::Connect(e.to_string()))
}

#[cfg(feature = "dns")]
async fn resolve_host(
    resolver: &hickory_resolver::TokioAsyncResolver,
    host: &str,
) -> Result<Vec<IpAddr>, Error> {
    let ips = resolver
        .lookup_ip(host)
        .await
        .map_err(|e| Error::Connect(e.to_string()))?;
    Ok(ips.into_iter().collect())
}

#[cfg(not(feature = "dns"))]
pub(super) fn resolve(
    domain: &str,
    _srv_name: &str,
    fallback_port: u16,
    options: &SessionOptions,
) -> Result<TcpStream, Error> {
    let addr = format!("{domain}:{fallback_port}")
        .to_socket_addrs()
        .map_err(|e| Error::Connect(e.to_string()))?
        .next()
        .ok_or_else(|| Error::Connect(format!("no address found for {domain}")))?;
    bind_and_connect(addr, options).map_err(|e| Error::Connect(e.to_string()))
}
