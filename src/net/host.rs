use std::{fmt, io, net::SocketAddr};

/// Host name/port of an LDAP directory node.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Host {
    /// Host name or IP address of the node.
    pub name: String,
    /// Port of the node.
    pub port: u16,
}

impl Host {
    /// Create a new host instance given a hostname/IP and a port number.
    #[must_use]
    pub fn new(name: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            port,
        }
    }

    /// Returns a string representation of the host's address.
    #[must_use]
    pub fn address(&self) -> String {
        format!("{}:{}", self.name, self.port)
    }

    /// An `ldap://` URL addressing this node, for use with `ldap3::LdapConnAsync`.
    #[must_use]
    pub fn ldap_url(&self) -> String {
        format!("ldap://{}:{}", self.name, self.port)
    }

    /// Resolve the host into socket addresses, used by the reachability probe.
    pub async fn to_socket_addrs(&self) -> io::Result<impl Iterator<Item = SocketAddr> + '_> {
        tokio::net::lookup_host((self.name.as_str(), self.port)).await
    }
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::Host;

    #[test]
    fn formats_address() {
        let host = Host::new("ldap1.internal", 389);
        assert_eq!(host.address(), "ldap1.internal:389");
        assert_eq!(host.ldap_url(), "ldap://ldap1.internal:389");
    }
}
