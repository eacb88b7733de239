//! Transport protocols and destination specifications.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::NetError;

/// The transports a reader or writer can be opened over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// Plain TCP stream.
    Tcp,
    /// TCP with an identification preamble written by the connecting side.
    Itcp,
    /// Plain datagrams, no sequence numbers.
    Udp,
    /// Datagrams with a 64-bit sequence number prefix.
    Udps,
    /// One whole block per datagram, sequence-number prefixed.
    Vtp,
    /// UNIX-domain stream socket.
    Unix,
}

impl Protocol {
    pub fn is_datagram(self) -> bool {
        matches!(self, Protocol::Udp | Protocol::Udps | Protocol::Vtp)
    }

    pub fn is_stream(self) -> bool {
        !self.is_datagram()
    }

    /// Bytes of per-datagram header this protocol puts on the wire.
    pub fn seqnr_size(self) -> usize {
        match self {
            Protocol::Udps | Protocol::Vtp => crate::wire::SEQNR_SIZE,
            _ => 0,
        }
    }
}

impl FromStr for Protocol {
    type Err = NetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tcp" => Ok(Protocol::Tcp),
            "itcp" => Ok(Protocol::Itcp),
            "udp" => Ok(Protocol::Udp),
            "udps" => Ok(Protocol::Udps),
            "vtp" => Ok(Protocol::Vtp),
            "unix" => Ok(Protocol::Unix),
            other => Err(NetError::UnsupportedProtocol(other.to_string())),
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Protocol::Tcp => "tcp",
            Protocol::Itcp => "itcp",
            Protocol::Udp => "udp",
            Protocol::Udps => "udps",
            Protocol::Vtp => "vtp",
            Protocol::Unix => "unix",
        };
        f.write_str(s)
    }
}

/// Where a writer should deliver data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DestSpec {
    /// `proto://host:port`
    Net { proto: Protocol, addr: String },
    /// `unix://</path>`
    UnixSock { path: String },
    /// `file://</path>` or a bare path.
    File { path: String },
}

impl DestSpec {
    /// Parse a destination. `default_proto` covers bare `host:port` specs.
    pub fn parse(s: &str, default_proto: Protocol) -> Result<DestSpec, NetError> {
        if let Some((scheme, rest)) = s.split_once("://") {
            return match scheme {
                "file" => Ok(DestSpec::File {
                    path: rest.to_string(),
                }),
                "unix" => Ok(DestSpec::UnixSock {
                    path: rest.to_string(),
                }),
                proto => Ok(DestSpec::Net {
                    proto: proto.parse()?,
                    addr: require_host_port(s, rest)?,
                }),
            };
        }
        if s.contains('/') {
            return Ok(DestSpec::File {
                path: s.to_string(),
            });
        }
        Ok(DestSpec::Net {
            proto: default_proto,
            addr: require_host_port(s, s)?,
        })
    }

    /// The string identifying the shared connection target; destinations
    /// with equal keys share one file descriptor and one writer thread.
    pub fn target_key(&self) -> String {
        match self {
            DestSpec::Net { proto, addr } => format!("{proto}://{addr}"),
            DestSpec::UnixSock { path } => format!("unix://{path}"),
            DestSpec::File { path } => format!("file://{path}"),
        }
    }
}

fn require_host_port(full: &str, hp: &str) -> Result<String, NetError> {
    match hp.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => {
            Ok(hp.to_string())
        }
        _ => Err(NetError::BadDest(full.to_string())),
    }
}
