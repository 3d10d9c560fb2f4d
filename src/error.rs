// SPDX-License-Identifier: (Apache-2.0 OR MIT)

//! Error taxonomy of the filter compiler. Every error is fatal to the compile; no partial
//! bytecode is ever returned.

use thiserror::Error;

/// Failure of the injected name resolver.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    /// The name does not exist.
    #[error("lookup {0}: no such host")]
    NotFound(String),
    /// The caller's deadline or context cancelled the lookup.
    #[error("lookup cancelled")]
    Cancelled,
    /// Transport-level failure, carried as text so errors stay comparable.
    #[error("{0}")]
    Other(String),
}

/// Everything that can go wrong between a filter string and a cBPF program.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompileError {
    /// A token was encountered in a position where it cannot be interpreted.
    #[error("parse error")]
    Parse,
    /// A `host` qualifier with no identifier after defaulting.
    #[error("blank host")]
    BlankHost,
    /// A qualifier other than `host` with no identifier.
    #[error("blank {0} qualifier")]
    BlankQualifier(&'static str),
    /// The resolver returned no usable address for a hostname.
    #[error("unknown host: {0}")]
    UnknownHost(String),
    /// `host` may not carry a CIDR suffix; only `net` may.
    #[error("invalid host address with CIDR: {0}")]
    HostWithCidr(String),
    /// Malformed network address or CIDR.
    #[error("invalid net: {0}")]
    InvalidNet(String),
    /// Address bits are set in positions the mask clears.
    #[error("invalid network, network bits extend past mask bits: {0}")]
    NetBitsPastMask(String),
    /// MAC literal does not parse.
    #[error("invalid ethernet address: {0}")]
    InvalidEthernetAddress(String),
    /// Port identifier is neither a 16-bit integer, a `lo-hi` range, nor a known service name.
    #[error("invalid port: {0}")]
    InvalidPort(String),
    /// `proto X` where X is not a recognized or emittable sub-protocol.
    #[error("unknown protocol {0}")]
    UnknownProtocol(String),
    /// The emitted stream would exceed the 255-instruction bound of 8-bit skips.
    #[error("program too long: {0} instructions")]
    ProgramTooLong(usize),
    /// The resolver failed.
    #[error("resolver error: {0}")]
    Resolver(#[from] ResolveError),
}
