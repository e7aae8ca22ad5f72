//! Error types for fleet operations

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Main error type for fleet operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// HTTP error talking to a service registry
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Invalid or unreadable configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// A safety check failed before any mutation was attempted
    #[error("precondition failed: {0}")]
    Precondition(String),

    /// Virtualization provider error
    #[error("provider error: {0}")]
    Provider(String),

    /// Master discovery failed to resolve or publish endpoints
    #[error("discovery error: {0}")]
    Discovery(String),

    /// Building an instance bootstrap payload failed
    #[error("bootstrap error: {0}")]
    Bootstrap(String),

    /// Cordon or eviction of a node's workloads failed
    #[error("drain of node {node} failed: {message}")]
    Drain {
        /// Node being drained
        node: String,
        /// What went wrong
        message: String,
    },

    /// A bounded wait ran out
    #[error("timed out after {timeout:?} waiting for {what}")]
    Timeout {
        /// What was being waited on
        what: String,
        /// The budget that was exhausted
        timeout: Duration,
    },

    /// A node did not come back after maintenance
    #[error("node {node} did not become ready: {message}")]
    NodeNotReady {
        /// Node name
        node: String,
        /// Detail
        message: String,
    },

    /// Port-forward tunnel could not be negotiated
    #[error("tunnel to {node} failed: {message}")]
    Tunnel {
        /// Node whose etcd pod was targeted
        node: String,
        /// Detail
        message: String,
    },

    /// TLS material or handshake error
    #[error("tls error: {0}")]
    Tls(String),

    /// RPC error returned by an etcd member
    #[error("etcd {rpc} on {node} failed: {status}")]
    EtcdRpc {
        /// Node the client is connected to
        node: String,
        /// RPC name (e.g. "MemberList")
        rpc: &'static str,
        /// gRPC status returned
        #[source]
        status: tonic::Status,
    },

    /// No member with this name in the etcd member list
    #[error("etcd member {0} not found")]
    MemberNotFound(String),

    /// Every candidate node failed while looking for the etcd leader
    #[error("no etcd member reachable: {}", DialFailures(.0))]
    EtcdUnavailable(Vec<DialFailure>),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// A failed attempt to reach the etcd member on one node
#[derive(Debug)]
pub struct DialFailure {
    /// Node that was tried
    pub node: String,
    /// Why it failed
    pub error: Error,
}

impl fmt::Display for DialFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.node, self.error)
    }
}

struct DialFailures<'a>(&'a [DialFailure]);

impl fmt::Display for DialFailures<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str("no candidate nodes");
        }
        for (i, failure) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{}", failure)?;
        }
        Ok(())
    }
}

impl Error {
    /// Create a configuration error with the given message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a precondition error with the given message
    pub fn precondition(msg: impl Into<String>) -> Self {
        Self::Precondition(msg.into())
    }

    /// Create a provider error with the given message
    pub fn provider(msg: impl Into<String>) -> Self {
        Self::Provider(msg.into())
    }

    /// Create a discovery error with the given message
    pub fn discovery(msg: impl Into<String>) -> Self {
        Self::Discovery(msg.into())
    }

    /// Create a bootstrap error with the given message
    pub fn bootstrap(msg: impl Into<String>) -> Self {
        Self::Bootstrap(msg.into())
    }

    /// Create a drain error for a node
    pub fn drain(node: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Drain {
            node: node.into(),
            message: msg.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(what: impl Into<String>, timeout: Duration) -> Self {
        Self::Timeout {
            what: what.into(),
            timeout,
        }
    }

    /// Create a tunnel error for a node
    pub fn tunnel(node: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Tunnel {
            node: node.into(),
            message: msg.into(),
        }
    }

    /// Create a TLS error with the given message
    pub fn tls(msg: impl Into<String>) -> Self {
        Self::Tls(msg.into())
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// True for errors raised while establishing a connection to etcd, as
    /// opposed to errors returned by etcd itself
    pub fn is_connectivity(&self) -> bool {
        matches!(
            self,
            Error::Tunnel { .. } | Error::Tls(_) | Error::Timeout { .. } | Error::Kube(_)
        )
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
