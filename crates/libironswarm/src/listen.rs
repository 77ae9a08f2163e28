use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;

use anyhow::Context;

/// How the peer listener binds and what address it advertises.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindMode {
    /// Bind and advertise 127.0.0.1.
    Local,
    /// Bind all interfaces, advertise the primary outbound interface.
    Public,
    /// Bind and advertise an explicit IP.
    Ip(IpAddr),
}

impl FromStr for BindMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local" => Ok(BindMode::Local),
            "public" => Ok(BindMode::Public),
            other => Ok(BindMode::Ip(
                other
                    .parse()
                    .with_context(|| format!("invalid bind mode {other:?}"))?,
            )),
        }
    }
}

impl BindMode {
    /// Resolves the mode into a (listen, advertise) address pair for the
    /// given port. The port may be 0; the node reflects the real port after
    /// binding.
    pub fn resolve(&self, port: u16) -> anyhow::Result<(SocketAddr, SocketAddr)> {
        let listen_ip: IpAddr = match self {
            BindMode::Local => Ipv4Addr::LOCALHOST.into(),
            BindMode::Public => Ipv4Addr::UNSPECIFIED.into(),
            BindMode::Ip(ip) => *ip,
        };
        let advertise_ip = match self {
            BindMode::Local => Ipv4Addr::LOCALHOST.into(),
            BindMode::Public => detect_outbound_ip()?,
            BindMode::Ip(ip) => *ip,
        };
        Ok((
            SocketAddr::new(listen_ip, port),
            SocketAddr::new(advertise_ip, port),
        ))
    }
}

/// The IP the default route would use. Connecting a UDP socket does not
/// send any packets.
fn detect_outbound_ip() -> anyhow::Result<IpAddr> {
    let socket =
        std::net::UdpSocket::bind(("0.0.0.0", 0)).context("error binding probe socket")?;
    socket
        .connect(("8.8.8.8", 53))
        .context("error probing outbound interface")?;
    Ok(socket
        .local_addr()
        .context("error reading probe address")?
        .ip())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_mode_parse() {
        assert_eq!(BindMode::from_str("local").unwrap(), BindMode::Local);
        assert_eq!(BindMode::from_str("public").unwrap(), BindMode::Public);
        assert_eq!(
            BindMode::from_str("10.1.2.3").unwrap(),
            BindMode::Ip("10.1.2.3".parse().unwrap())
        );
        assert!(BindMode::from_str("nonsense").is_err());
    }

    #[test]
    fn test_local_resolve() {
        let (listen, advertise) = BindMode::Local.resolve(42042).unwrap();
        assert_eq!(listen, "127.0.0.1:42042".parse().unwrap());
        assert_eq!(advertise, listen);
    }
}
