/// Configuration management for relevo
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::topology::HostSpec;

/// Main relevo configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host topology configuration
    pub topology: TopologyConfig,
    /// Routing and retry configuration
    pub routing: RoutingConfig,
    /// Return-to-primary policy for the failover topology
    pub failover: FailoverConfig,
    /// Auto-commit triggered rebalancing
    pub rebalance: RebalanceConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Host topology configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "mode")]
pub enum TopologyConfig {
    /// Every host serves every operation; the balance strategy spreads load
    #[serde(rename = "load_balanced")]
    LoadBalanced {
        /// Backend hosts as host:port
        hosts: Vec<String>,
    },
    /// First host is the preferred primary, the rest are standbys
    #[serde(rename = "failover")]
    Failover {
        /// Backend hosts as host:port; the first entry is the primary
        hosts: Vec<String>,
    },
    /// Writes go to primaries, reads may go to replicas
    #[serde(rename = "replication")]
    Replication {
        /// Hosts serving writes
        primaries: Vec<String>,
        /// Hosts serving read-only traffic
        replicas: Vec<String>,
        /// Allow opening read-only with no primary configured/reachable
        allow_primary_down: bool,
    },
}

impl TopologyConfig {
    /// Get the topology mode as a string for logging
    pub fn mode_name(&self) -> &'static str {
        match self {
            TopologyConfig::LoadBalanced { .. } => "load_balanced",
            TopologyConfig::Failover { .. } => "failover",
            TopologyConfig::Replication { .. } => "replication",
        }
    }

    /// All configured host strings, in configuration order
    pub fn all_hosts(&self) -> Vec<&String> {
        match self {
            TopologyConfig::LoadBalanced { hosts } | TopologyConfig::Failover { hosts } => {
                hosts.iter().collect()
            }
            TopologyConfig::Replication {
                primaries,
                replicas,
                ..
            } => primaries.iter().chain(replicas.iter()).collect(),
        }
    }
}

/// Routing and retry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingConfig {
    /// Balance strategy: best_response_time, random, sequential, affinity,
    /// or the name of a registered custom strategy
    pub strategy: String,
    /// Explicit host preference order for the affinity strategy
    pub affinity_order: Option<Vec<String>>,
    /// Name of the connection group to join; connections in one group
    /// share a host topology and react together to topology changes
    pub connection_group: Option<String>,
    /// Attempt budget for one host selection
    pub retry_count: u32,
    /// How long a failed host stays excluded from selection
    pub blacklist_ttl_ms: u64,
    /// Bound on each individual connection attempt
    pub connect_timeout_ms: u64,
    /// Allow swapping the active connection while a transaction is open
    pub failover_in_transaction: bool,
}

/// Return-to-primary policy for the failover topology
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailoverConfig {
    /// Seconds on a secondary before the primary is retried
    pub seconds_before_retry_primary: u64,
    /// Queries issued on a secondary before the primary is retried
    pub queries_before_retry_primary: u64,
}

/// Auto-commit triggered rebalancing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RebalanceConfig {
    /// Matching statements executed with auto-commit on before the router
    /// proactively re-picks a host; 0 disables the hook
    pub statement_threshold: u64,
    /// Only statements matching this regex count toward the threshold;
    /// absent means every statement counts
    pub statement_regex: Option<String>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (error, warn, info, debug, trace)
    pub level: String,
    /// Log format (json, text)
    pub format: String,
    /// Log to stdout
    pub stdout: bool,
    /// Log file path (optional)
    pub file: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            topology: TopologyConfig::LoadBalanced {
                hosts: vec!["127.0.0.1:3306".to_string()],
            },
            routing: RoutingConfig {
                strategy: "random".to_string(),
                affinity_order: None,
                connection_group: None,
                retry_count: 5,
                blacklist_ttl_ms: 5000,
                connect_timeout_ms: 5000,
                failover_in_transaction: false,
            },
            failover: FailoverConfig {
                seconds_before_retry_primary: 30,
                queries_before_retry_primary: 50,
            },
            rebalance: RebalanceConfig {
                statement_threshold: 0,
                statement_regex: None,
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                format: "text".to_string(),
                stdout: true,
                file: None,
            },
        }
    }
}

impl Config {
    /// Load configuration from TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|e| ConfigError::IoError(e.to_string()))?;

        let config: Config =
            toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content =
            toml::to_string_pretty(self).map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        fs::write(path, content).map_err(|e| ConfigError::IoError(e.to_string()))?;

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        // Validate topology
        match &self.topology {
            TopologyConfig::LoadBalanced { hosts } | TopologyConfig::Failover { hosts } => {
                if hosts.is_empty() {
                    return Err(ConfigError::ValidationError(
                        "at least one host is required".to_string(),
                    ));
                }
            }
            TopologyConfig::Replication {
                primaries,
                replicas,
                allow_primary_down,
            } => {
                if replicas.is_empty() {
                    return Err(ConfigError::ValidationError(
                        "no replica hosts specified for a replication topology".to_string(),
                    ));
                }
                if primaries.is_empty() && !allow_primary_down {
                    return Err(ConfigError::ValidationError(
                        "no primary hosts specified and allow_primary_down is off".to_string(),
                    ));
                }
            }
        }

        for host in self.topology.all_hosts() {
            host.parse::<HostSpec>().map_err(|_| {
                ConfigError::ValidationError(format!("invalid host endpoint: {}", host))
            })?;
        }

        // Validate routing
        if self.routing.strategy.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "strategy cannot be empty".to_string(),
            ));
        }

        if self.routing.strategy == "affinity" {
            match &self.routing.affinity_order {
                Some(order) if !order.is_empty() => {
                    for host in order {
                        host.parse::<HostSpec>().map_err(|_| {
                            ConfigError::ValidationError(format!(
                                "invalid affinity host: {}",
                                host
                            ))
                        })?;
                    }
                }
                _ => {
                    return Err(ConfigError::ValidationError(
                        "affinity strategy requires a non-empty affinity_order".to_string(),
                    ))
                }
            }
        }

        if self.routing.retry_count == 0 {
            return Err(ConfigError::ValidationError(
                "retry_count must be greater than 0".to_string(),
            ));
        }

        if self.routing.blacklist_ttl_ms == 0 {
            return Err(ConfigError::ValidationError(
                "blacklist_ttl_ms must be greater than 0".to_string(),
            ));
        }

        if self.routing.connect_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "connect_timeout_ms must be greater than 0".to_string(),
            ));
        }

        // Validate rebalance
        if let Some(pattern) = &self.rebalance.statement_regex {
            regex::Regex::new(pattern).map_err(|e| {
                ConfigError::ValidationError(format!("invalid statement_regex: {}", e))
            })?;
        }

        // Validate logging config
        match self.logging.level.as_str() {
            "error" | "warn" | "info" | "debug" | "trace" => {}
            _ => {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid log level: {}",
                    self.logging.level
                )))
            }
        }

        match self.logging.format.as_str() {
            "json" | "text" => {}
            _ => {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid log format: {}",
                    self.logging.format
                )))
            }
        }

        Ok(())
    }

    /// Create example configuration file
    pub fn create_example_config<P: AsRef<Path>>(path: P, mode: &str) -> Result<(), ConfigError> {
        let config = match mode {
            "load_balanced" => Config {
                topology: TopologyConfig::LoadBalanced {
                    hosts: vec![
                        "10.0.1.10:3306".to_string(),
                        "10.0.1.11:3306".to_string(),
                        "10.0.1.12:3306".to_string(),
                    ],
                },
                ..Default::default()
            },
            "failover" => Config {
                topology: TopologyConfig::Failover {
                    hosts: vec!["10.0.1.10:3306".to_string(), "10.0.1.11:3306".to_string()],
                },
                routing: RoutingConfig {
                    strategy: "sequential".to_string(),
                    ..Config::default().routing
                },
                ..Default::default()
            },
            "replication" => Config {
                topology: TopologyConfig::Replication {
                    primaries: vec!["10.0.1.10:3306".to_string()],
                    replicas: vec![
                        "10.0.1.20:3306".to_string(),
                        "10.0.1.21:3306".to_string(),
                    ],
                    allow_primary_down: false,
                },
                ..Default::default()
            },
            _ => {
                return Err(ConfigError::ValidationError(
                    "Mode must be 'load_balanced', 'failover' or 'replication'".to_string(),
                ))
            }
        };

        config.save_to_file(path)
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Serialize error: {0}")]
    SerializeError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}
