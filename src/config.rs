//! Command-line and environment configuration.
//!
//! [`Args`] is the raw clap surface; [`Config::from_args`] is the single
//! validation point and turns it into a [`Config`] or a fatal
//! [`ConfigError`].

use crate::cluster::{DistributedConfig, ObjectStoreSettings};
use crate::routing::{HashKey, RoutingError};
use clap::Parser;
use std::net::{Ipv4Addr, SocketAddrV4, UdpSocket};
use std::time::Duration;
use thiserror::Error;

/// Raw command-line options. Every option can also come from the environment.
#[derive(Parser, Debug, Clone)]
#[command(name = "matchdb", author, version, about, long_about = None)]
pub struct Args {
    /// IPv4 address to bind and advertise (empty: detect the outbound address)
    #[arg(long, env = "MATCHDB_HOST", default_value = "")]
    pub host: String,

    /// Port to listen on
    #[arg(short, long, env = "MATCHDB_PORT", default_value_t = crate::DEFAULT_PORT)]
    pub port: u16,

    /// Allocation limit in KB
    #[arg(long, env = "MATCHDB_ALLOC_LIMIT", default_value_t = 5_000_000)]
    pub alloc_limit: u64,

    /// Slot hash key, 32 hex characters
    #[arg(long, env = "MATCHDB_HASH_KEY", hide_env_values = true)]
    pub hash_key: String,

    /// Bound on reading a handshake or the rest of a frame, in ms
    #[arg(long, env = "MATCHDB_REQUEST_TIMEOUT", default_value_t = 5000)]
    pub request_timeout: u64,

    /// Access key for the lease and routing tables
    #[arg(long, env = "AWS_ACCESS_KEY_ID", hide_env_values = true)]
    pub aws_access_key: Option<String>,

    /// Secret key for the lease and routing tables
    #[arg(long, env = "AWS_SECRET_ACCESS_KEY", hide_env_values = true)]
    pub aws_secret_key: Option<String>,

    /// Region of the lease and routing tables
    #[arg(long, env = "MATCHDB_AWS_REGION")]
    pub aws_region: Option<String>,

    /// Table (bucket) holding the leadership lease
    #[arg(long, alias = "master-table", env = "MATCHDB_LEASE_TABLE")]
    pub lease_table: Option<String>,

    /// Table (bucket) holding the slot routing table
    #[arg(long, env = "MATCHDB_ROUTING_TABLE")]
    pub routing_table: Option<String>,

    /// S3-compatible endpoint override (MinIO, LocalStack)
    #[arg(long, env = "MATCHDB_STORE_ENDPOINT")]
    pub store_endpoint: Option<String>,

    /// Row key of this cluster in both tables
    #[arg(long, env = "MATCHDB_CLUSTER_ID", default_value = "matchdb")]
    pub cluster_id: String,

    /// Leadership lease length in ms
    #[arg(long, env = "MATCHDB_MASTER_TIMEOUT", default_value_t = 6000)]
    pub master_timeout: u64,

    /// Routing sync interval in ms
    #[arg(long, env = "MATCHDB_ROUTING_TIMEOUT", default_value_t = 3000)]
    pub routing_timeout: u64,

    /// Silence after which a peer loses its slots, in ms (default: 2 x master timeout)
    #[arg(long, env = "MATCHDB_DEAD_NODE_TIMEOUT")]
    pub dead_node_timeout: Option<u64>,

    /// Owners per slot
    #[arg(long, env = "MATCHDB_REPLICAS", default_value_t = 2)]
    pub replicas: usize,
}

/// Errors that make startup impossible.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid hash key: {0}")]
    InvalidHashKey(#[from] RoutingError),

    #[error("host must be an IPv4 address: {0:?}")]
    InvalidHost(String),

    #[error("host {0} is not dialable by peers; pass the node's own address")]
    UnspecifiedHost(Ipv4Addr),

    #[error("cannot detect the outbound IPv4 address: {0}")]
    HostDetection(#[source] std::io::Error),

    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    #[error("incomplete distributed configuration, missing: {}", .0.join(", "))]
    IncompleteDistributed(Vec<&'static str>),
}

/// How the node coordinates with others.
#[derive(Debug, Clone)]
pub enum ClusterMode {
    /// Single node, owns every slot
    Local,
    /// Leadership and routing through hosted lease and routing tables
    Distributed {
        coordination: DistributedConfig,
        store: ObjectStoreSettings,
    },
}

/// Validated node configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub host: Ipv4Addr,
    pub port: u16,
    pub alloc_limit_bytes: u64,
    pub hash_key: HashKey,
    pub request_timeout: Duration,
    pub mode: ClusterMode,
}

impl Config {
    /// Parses the process arguments and environment.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(Args::parse())
    }

    pub fn from_args(args: Args) -> Result<Self, ConfigError> {
        let hash_key = HashKey::from_hex(&args.hash_key)?;

        let host = if args.host.trim().is_empty() {
            detect_host().map_err(ConfigError::HostDetection)?
        } else {
            args.host
                .trim()
                .parse::<Ipv4Addr>()
                .map_err(|_| ConfigError::InvalidHost(args.host.clone()))?
        };
        // Peers dial the address embedded in the node id.
        if host.is_unspecified() {
            return Err(ConfigError::UnspecifiedHost(host));
        }

        if args.alloc_limit == 0 {
            return Err(ConfigError::Zero("alloc-limit"));
        }
        if args.request_timeout == 0 {
            return Err(ConfigError::Zero("request-timeout"));
        }

        let mode = cluster_mode(&args)?;

        Ok(Self {
            host,
            port: args.port,
            alloc_limit_bytes: args.alloc_limit.saturating_mul(1024),
            hash_key,
            request_timeout: Duration::from_millis(args.request_timeout),
            mode,
        })
    }

    pub fn bind_addr(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.host, self.port)
    }

    pub fn is_distributed(&self) -> bool {
        matches!(self.mode, ClusterMode::Distributed { .. })
    }
}

fn cluster_mode(args: &Args) -> Result<ClusterMode, ConfigError> {
    let options = [
        ("aws-access-key", &args.aws_access_key),
        ("aws-secret-key", &args.aws_secret_key),
        ("aws-region", &args.aws_region),
        ("lease-table", &args.lease_table),
        ("routing-table", &args.routing_table),
    ];

    let missing: Vec<&'static str> = options
        .iter()
        .filter(|(_, value)| value.as_deref().map_or(true, str::is_empty))
        .map(|(name, _)| *name)
        .collect();

    if missing.len() == options.len() {
        return Ok(ClusterMode::Local);
    }
    if !missing.is_empty() {
        return Err(ConfigError::IncompleteDistributed(missing));
    }

    if args.master_timeout == 0 {
        return Err(ConfigError::Zero("master-timeout"));
    }
    if args.routing_timeout == 0 {
        return Err(ConfigError::Zero("routing-timeout"));
    }
    if args.dead_node_timeout == Some(0) {
        return Err(ConfigError::Zero("dead-node-timeout"));
    }
    if args.replicas == 0 {
        return Err(ConfigError::Zero("replicas"));
    }

    let master_timeout = Duration::from_millis(args.master_timeout);
    let coordination = DistributedConfig {
        cluster_id: args.cluster_id.clone(),
        master_timeout,
        routing_timeout: Duration::from_millis(args.routing_timeout),
        dead_node_timeout: args
            .dead_node_timeout
            .map_or(master_timeout * 2, Duration::from_millis),
        replicas: args.replicas,
    };

    let store = ObjectStoreSettings {
        access_key: args.aws_access_key.clone().unwrap_or_default(),
        secret_key: args.aws_secret_key.clone().unwrap_or_default(),
        region: args.aws_region.clone().unwrap_or_default(),
        lease_table: args.lease_table.clone().unwrap_or_default(),
        routing_table: args.routing_table.clone().unwrap_or_default(),
        endpoint: args.store_endpoint.clone().filter(|e| !e.is_empty()),
    };

    Ok(ClusterMode::Distributed {
        coordination,
        store,
    })
}

/// Finds the local IPv4 address used for outbound traffic. Connecting a UDP
/// socket only selects a route; no packet is sent.
pub fn detect_host() -> std::io::Result<Ipv4Addr> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
    socket.connect((Ipv4Addr::new(8, 8, 8, 8), 80))?;
    match socket.local_addr()?.ip() {
        std::net::IpAddr::V4(ip) => Ok(ip),
        std::net::IpAddr::V6(ip) => Err(std::io::Error::new(
            std::io::ErrorKind::AddrNotAvailable,
            format!("outbound address is IPv6: {}", ip),
        )),
    }
}
