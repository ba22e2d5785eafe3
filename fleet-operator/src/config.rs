//! Runtime configuration.

use std::time::Duration;

use anyhow::{ensure, Context, Result};
use serde::{Deserialize, Deserializer};

use fleet_core::convergence::RolloutConfig;
use fleet_core::planner::{PartitionCriterion, PlannerConfig, DEFAULT_PARTITION_NAME};
use fleet_core::Role;

/// Runtime configuration data.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// The server's logging config, which uses Rust's `env_logger` directives.
    pub rust_log: String,
    /// The role of this unit.
    pub role: Role,
    /// The ID of this unit, of the form `<application>/<n>`.
    pub unit_id: String,
    /// The hostname published by this unit, defaults to the unit ID with `/` replaced by `-`.
    #[serde(default)]
    pub hostname_override: Option<String>,

    /// The directory shared by all units of the fleet, backing relations and leadership.
    #[serde(default = "Config::default_state_dir")]
    pub state_dir: String,
    /// The port used for health, status and admin HTTP traffic.
    #[serde(default = "Config::default_http_port")]
    pub http_port: u16,

    /// The duration in seconds for which a lease is considered held.
    #[serde(default = "Config::default_lease_duration_seconds")]
    pub lease_duration_seconds: u32,
    /// The duration that a lease holder will retry refreshing lease.
    #[serde(default = "Config::default_lease_renew_seconds")]
    pub lease_renew_seconds: u32,
    /// The interval at which relations are polled for changes.
    #[serde(default = "Config::default_relation_poll_millis")]
    pub relation_poll_millis: u64,

    /// The bounded wait of a rollout step on its targets' acknowledgements.
    #[serde(default = "Config::default_ack_timeout_seconds")]
    pub ack_timeout_seconds: u64,
    /// The number of times a timed out rollout step is re-issued.
    #[serde(default = "Config::default_ack_max_retries")]
    pub ack_max_retries: u32,
    /// The number of compute units reloaded per rollout batch.
    #[serde(default = "Config::default_compute_batch_size")]
    pub compute_batch_size: usize,

    /// The node attribute by which compute nodes are grouped into partitions.
    #[serde(default, deserialize_with = "Config::parse_partition_criterion")]
    pub partition_criterion: PartitionCriterion,
    /// The name of the default partition.
    #[serde(default = "Config::default_partition")]
    pub default_partition: String,
    /// Per-partition limits, of the form `partition:Key=Value,Key=Value;partition:Key=Value`.
    #[serde(default)]
    pub partition_limits: String,
    /// The planner config derived from the partition values above.
    #[serde(skip, default)]
    pub planner: PlannerConfig,

    /// The cluster name. Generated once and persisted in leader data when unset.
    #[serde(default)]
    pub cluster_name: Option<String>,
    /// Operator override text, appended verbatim to the generated document.
    #[serde(default)]
    pub config_overrides: String,
    /// The size limit of the override text.
    #[serde(default = "Config::default_overrides_max_bytes")]
    pub overrides_max_bytes: usize,

    /// The path where the configuration document is written on this unit.
    #[serde(default = "Config::default_config_path")]
    pub config_path: String,
    /// The daemon managed on this unit, defaults to the daemon of this unit's role.
    #[serde(default)]
    pub service_name: Option<String>,
    /// The command used to reload the daemon. `{service}` is substituted.
    #[serde(default = "Config::default_reload_command")]
    pub reload_command: String,
    /// The command used to restart the daemon. `{service}` is substituted.
    #[serde(default = "Config::default_restart_command")]
    pub restart_command: String,
    /// The time limit of a single daemon or node command, after which it is killed.
    #[serde(default = "Config::default_command_timeout_seconds")]
    pub command_timeout_seconds: u64,

    /// The command printing this node's capabilities.
    #[serde(default = "Config::default_node_info_command")]
    pub node_info_command: String,
    #[serde(default)]
    pub node_cpus: Option<i64>,
    #[serde(default)]
    pub node_realmemory: Option<i64>,
    #[serde(default)]
    pub node_corespersocket: Option<i64>,
    #[serde(default)]
    pub node_gres: Option<String>,
    #[serde(default)]
    pub node_weight: Option<i64>,
    #[serde(default)]
    pub node_partition: Option<String>,
    /// The command checking this node's health. Exit code 0 means healthy.
    #[serde(default)]
    pub health_check_command: Option<String>,
    #[serde(default = "Config::default_health_check_interval_seconds")]
    pub health_check_interval_seconds: u64,

    /// The accounting database connection string published by accounting units.
    #[serde(default)]
    pub db_uri: Option<String>,
    /// The `host:port` endpoint published by gateway units.
    #[serde(default)]
    pub gateway_endpoint: Option<String>,
}

impl Config {
    /// Create a new config instance.
    ///
    /// Currently this routing just parses the runtime environment and builds the application
    /// config from that.
    #[allow(clippy::new_without_default)]
    pub fn new() -> Result<Self> {
        Self::from_vars(std::env::vars())
    }

    /// Build and validate a config from the given environment variables.
    pub fn from_vars(vars: impl Iterator<Item = (String, String)>) -> Result<Self> {
        let mut config: Config = envy::from_iter(vars).context("error building config from env")?;
        ensure!(
            config.unit_id.split_once('/').map(|(app, idx)| !app.is_empty() && idx.parse::<u32>().is_ok()).unwrap_or(false),
            "invalid UNIT_ID {:?}, expected the form <application>/<n>",
            config.unit_id
        );
        ensure!(config.compute_batch_size > 0, "COMPUTE_BATCH_SIZE must be greater than 0");
        ensure!(config.relation_poll_millis > 0, "RELATION_POLL_MILLIS must be greater than 0");
        ensure!(config.command_timeout_seconds > 0, "COMMAND_TIMEOUT_SECONDS must be greater than 0");
        ensure!(config.health_check_interval_seconds > 0, "HEALTH_CHECK_INTERVAL_SECONDS must be greater than 0");
        ensure!(!config.default_partition.trim().is_empty(), "DEFAULT_PARTITION must not be empty");
        config.planner = PlannerConfig {
            default_partition: config.default_partition.trim().to_string(),
            limits: PlannerConfig::parse_limits(&config.partition_limits).context("invalid PARTITION_LIMITS")?,
        };
        Ok(config)
    }

    /// The hostname published by this unit.
    pub fn hostname(&self) -> String {
        match self.hostname_override.as_deref().map(str::trim) {
            Some(hostname) if !hostname.is_empty() => hostname.to_string(),
            _ => self.unit_id.replace('/', "-"),
        }
    }

    /// The daemon managed on this unit.
    pub fn service(&self) -> &str {
        self.service_name.as_deref().unwrap_or_else(|| self.role.service_name())
    }

    /// Rollout tuning derived from this config.
    pub fn rollout(&self) -> RolloutConfig {
        RolloutConfig {
            ack_timeout: Duration::from_secs(self.ack_timeout_seconds),
            max_retries: self.ack_max_retries,
            compute_batch_size: self.compute_batch_size,
            overrides_max_bytes: self.overrides_max_bytes,
        }
    }

    pub fn relation_poll(&self) -> Duration {
        Duration::from_millis(self.relation_poll_millis)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_seconds)
    }

    fn parse_partition_criterion<'de, D: Deserializer<'de>>(val: D) -> Result<PartitionCriterion, D::Error> {
        let raw: String = Deserialize::deserialize(val)?;
        let criterion = raw.parse().unwrap_or_default();
        if let PartitionCriterion::Unsupported(name) = &criterion {
            tracing::warn!(criterion = %name, "unsupported partition criterion, all nodes will share a single partition");
        }
        Ok(criterion)
    }

    fn default_state_dir() -> String {
        "/var/lib/fleet".into()
    }

    fn default_http_port() -> u16 {
        7080
    }

    fn default_lease_duration_seconds() -> u32 {
        15
    }

    fn default_lease_renew_seconds() -> u32 {
        10
    }

    fn default_relation_poll_millis() -> u64 {
        1000
    }

    fn default_ack_timeout_seconds() -> u64 {
        60
    }

    fn default_ack_max_retries() -> u32 {
        3
    }

    fn default_compute_batch_size() -> usize {
        10
    }

    fn default_partition() -> String {
        DEFAULT_PARTITION_NAME.into()
    }

    fn default_overrides_max_bytes() -> usize {
        64 * 1024
    }

    fn default_config_path() -> String {
        "/etc/slurm/slurm.conf".into()
    }

    fn default_reload_command() -> String {
        "systemctl reload {service}".into()
    }

    fn default_restart_command() -> String {
        "systemctl restart {service}".into()
    }

    fn default_command_timeout_seconds() -> u64 {
        120
    }

    fn default_node_info_command() -> String {
        "slurmd -C".into()
    }

    fn default_health_check_interval_seconds() -> u64 {
        600
    }
}
