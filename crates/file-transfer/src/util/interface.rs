use std::io::{Error, ErrorKind, Result};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use nix::ifaddrs::getifaddrs;

/// First IPv4 address assigned to the interface called `name`
pub fn get_interface_ip(name: &str) -> Result<Ipv4Addr> {
    getifaddrs()?
        .find_map(|ifa| {
            if ifa.interface_name != name {
                return None;
            }
            ifa.address.and_then(|addr| addr.as_sockaddr_in().map(|sin| sin.ip()))
        })
        .ok_or_else(|| Error::new(ErrorKind::NotFound, format!("no IPv4 address on interface {name}")))
}

/// `bind_address` with its host replaced by `ip`, keeping the port
pub fn service_address(bind_address: &str, ip: Ipv4Addr) -> Result<String> {
    let addr: SocketAddr = bind_address
        .parse()
        .map_err(|e| Error::new(ErrorKind::InvalidInput, format!("{bind_address}: {e}")))?;
    Ok(SocketAddrV4::new(ip, addr.port()).to_string())
}
