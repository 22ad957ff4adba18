/// Error type for all bridge, allocator and namespace operations.
#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    #[error("bridge name cannot be empty")]
    BridgeNameEmpty,

    #[error("state directory path cannot be empty")]
    StateDirPathEmpty,

    /// A caller-supplied option was malformed (unparseable CIDR, bad
    /// static address, ...).
    #[error("invalid option: {0}")]
    BadOption(String),

    /// Netlink operation failed.
    #[error("netlink error: {0}")]
    Netlink(#[from] rtnetlink::Error),

    /// System I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Namespace operation failed.
    #[error("namespace error: {0}")]
    Namespace(String),

    /// Resource not found (interface, bridge, etc.).
    #[error("not found: {0}")]
    NotFound(String),

    /// The allocation database cannot be opened or a transaction failed.
    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),

    /// The allocation database does not exist yet.
    #[error("database does not exist")]
    DatabaseDoesNotExist,

    /// A record in the allocation database could not be decoded.
    #[error("corrupt allocation record: {0}")]
    CorruptRecord(String),

    /// iptables invocation failed.
    #[error("command '{cmd}' failed: {stderr}")]
    Firewall { cmd: String, stderr: String },

    /// The allocator cycled through the whole subnet without finding a
    /// free candidate.
    #[error("could not find a suitable IP in network {0}")]
    Exhausted(String),

    /// The bridge accepted an address assignment but reads back empty.
    #[error("interface {0} has no IP addresses")]
    AssignmentMissing(String),
}

pub type Result<T> = std::result::Result<T, NetworkError>;
