use anyhow::Result;

use crate::config::Config;
use fleet_core::planner::PartitionCriterion;
use fleet_core::Role;

fn vars(pairs: &[(&str, &str)]) -> impl Iterator<Item = (String, String)> {
    pairs.iter().map(|(key, val)| (key.to_string(), val.to_string())).collect::<Vec<_>>().into_iter()
}

#[test]
fn config_deserializes_from_full_env() -> Result<()> {
    let config = Config::from_vars(vars(&[
        ("RUST_LOG", "error"),
        ("ROLE", "compute"),
        ("UNIT_ID", "compute/3"),
        ("HOSTNAME_OVERRIDE", "node-a"),
        ("STATE_DIR", "/srv/fleet"),
        ("HTTP_PORT", "9000"),
        ("LEASE_DURATION_SECONDS", "30"),
        ("LEASE_RENEW_SECONDS", "20"),
        ("RELATION_POLL_MILLIS", "250"),
        ("ACK_TIMEOUT_SECONDS", "90"),
        ("ACK_MAX_RETRIES", "5"),
        ("COMPUTE_BATCH_SIZE", "25"),
        ("PARTITION_CRITERION", "realmemory"),
        ("DEFAULT_PARTITION", "normal"),
        ("PARTITION_LIMITS", "gpu:MaxTime=1-00:00:00"),
        ("CLUSTER_NAME", "hpc-a"),
        ("CONFIG_OVERRIDES", "MaxJobCount=5000"),
        ("OVERRIDES_MAX_BYTES", "1024"),
        ("CONFIG_PATH", "/tmp/slurm.conf"),
        ("SERVICE_NAME", "slurmd-test"),
        ("RELOAD_COMMAND", "true {service}"),
        ("RESTART_COMMAND", "false {service}"),
        ("NODE_INFO_COMMAND", "cat /tmp/node-info"),
        ("NODE_CPUS", "64"),
        ("NODE_REALMEMORY", "257000"),
        ("NODE_CORESPERSOCKET", "16"),
        ("NODE_GRES", "gpu:a100:4"),
        ("NODE_WEIGHT", "10"),
        ("NODE_PARTITION", "gpu"),
        ("HEALTH_CHECK_COMMAND", "/usr/sbin/nhc"),
        ("HEALTH_CHECK_INTERVAL_SECONDS", "300"),
    ]))?;

    assert!(config.rust_log == "error", "unexpected value parsed for RUST_LOG, got {}, expected {}", config.rust_log, "error");
    assert!(config.role == Role::Compute, "unexpected value parsed for ROLE, got {}, expected {}", config.role, Role::Compute);
    assert!(config.unit_id == "compute/3", "unexpected value parsed for UNIT_ID, got {}, expected {}", config.unit_id, "compute/3");
    assert!(config.hostname() == "node-a", "unexpected hostname, got {}, expected {}", config.hostname(), "node-a");
    assert!(config.state_dir == "/srv/fleet", "unexpected value parsed for STATE_DIR, got {}, expected {}", config.state_dir, "/srv/fleet");
    assert!(config.http_port == 9000, "unexpected value parsed for HTTP_PORT, got {}, expected {}", config.http_port, 9000);
    assert!(
        config.lease_duration_seconds == 30 && config.lease_renew_seconds == 20,
        "unexpected lease values parsed, got {}/{}, expected {}/{}",
        config.lease_duration_seconds,
        config.lease_renew_seconds,
        30,
        20
    );
    assert!(
        config.relation_poll_millis == 250,
        "unexpected value parsed for RELATION_POLL_MILLIS, got {}, expected {}",
        config.relation_poll_millis,
        250
    );
    let rollout = config.rollout();
    assert!(rollout.ack_timeout.as_secs() == 90, "unexpected ack timeout, got {:?}, expected {}s", rollout.ack_timeout, 90);
    assert!(rollout.max_retries == 5, "unexpected max retries, got {}, expected {}", rollout.max_retries, 5);
    assert!(rollout.compute_batch_size == 25, "unexpected batch size, got {}, expected {}", rollout.compute_batch_size, 25);
    assert!(rollout.overrides_max_bytes == 1024, "unexpected overrides limit, got {}, expected {}", rollout.overrides_max_bytes, 1024);
    assert!(
        config.partition_criterion == PartitionCriterion::RealMemory,
        "unexpected value parsed for PARTITION_CRITERION, got {}, expected {}",
        config.partition_criterion,
        PartitionCriterion::RealMemory
    );
    assert!(
        config.planner.default_partition == "normal",
        "unexpected default partition, got {}, expected {}",
        config.planner.default_partition,
        "normal"
    );
    assert!(
        config.planner.limits.get("gpu").and_then(|limits| limits.get("MaxTime")).map(String::as_str) == Some("1-00:00:00"),
        "unexpected partition limits parsed, got {:?}",
        config.planner.limits
    );
    assert!(config.cluster_name.as_deref() == Some("hpc-a"), "unexpected value parsed for CLUSTER_NAME, got {:?}", config.cluster_name);
    assert!(config.config_overrides == "MaxJobCount=5000", "unexpected value parsed for CONFIG_OVERRIDES, got {}", config.config_overrides);
    assert!(config.service() == "slurmd-test", "unexpected service, got {}, expected {}", config.service(), "slurmd-test");
    assert!(config.node_cpus == Some(64), "unexpected value parsed for NODE_CPUS, got {:?}", config.node_cpus);
    assert!(config.node_realmemory == Some(257000), "unexpected value parsed for NODE_REALMEMORY, got {:?}", config.node_realmemory);
    assert!(config.node_gres.as_deref() == Some("gpu:a100:4"), "unexpected value parsed for NODE_GRES, got {:?}", config.node_gres);
    assert!(
        config.health_check_command.as_deref() == Some("/usr/sbin/nhc") && config.health_check_interval_seconds == 300,
        "unexpected health check config, got {:?} every {}s",
        config.health_check_command,
        config.health_check_interval_seconds
    );

    Ok(())
}

#[test]
fn config_deserializes_from_sparse_env() -> Result<()> {
    let config = Config::from_vars(vars(&[("RUST_LOG", "error"), ("ROLE", "controller"), ("UNIT_ID", "slurmctld/0")]))?;

    assert!(config.hostname() == "slurmctld-0", "unexpected hostname, got {}, expected {}", config.hostname(), "slurmctld-0");
    assert!(config.state_dir == "/var/lib/fleet", "unexpected default STATE_DIR, got {}", config.state_dir);
    assert!(config.http_port == 7080, "unexpected default HTTP_PORT, got {}", config.http_port);
    assert!(
        config.lease_duration_seconds == 15 && config.lease_renew_seconds == 10,
        "unexpected default lease values, got {}/{}",
        config.lease_duration_seconds,
        config.lease_renew_seconds
    );
    assert!(config.rollout().ack_timeout.as_secs() == 60, "unexpected default ack timeout, got {:?}", config.rollout().ack_timeout);
    assert!(config.ack_max_retries == 3, "unexpected default ACK_MAX_RETRIES, got {}", config.ack_max_retries);
    assert!(config.compute_batch_size == 10, "unexpected default COMPUTE_BATCH_SIZE, got {}", config.compute_batch_size);
    assert!(
        config.partition_criterion == PartitionCriterion::Application,
        "unexpected default PARTITION_CRITERION, got {}",
        config.partition_criterion
    );
    assert!(config.planner.default_partition == "batch", "unexpected default partition, got {}", config.planner.default_partition);
    assert!(config.planner.limits.is_empty(), "unexpected partition limits, got {:?}", config.planner.limits);
    assert!(config.cluster_name.is_none(), "unexpected CLUSTER_NAME, got {:?}", config.cluster_name);
    assert!(config.overrides_max_bytes == 65536, "unexpected default OVERRIDES_MAX_BYTES, got {}", config.overrides_max_bytes);
    assert!(config.config_path == "/etc/slurm/slurm.conf", "unexpected default CONFIG_PATH, got {}", config.config_path);
    assert!(config.service() == "slurmctld", "unexpected default service, got {}", config.service());
    assert!(config.reload_command == "systemctl reload {service}", "unexpected default RELOAD_COMMAND, got {}", config.reload_command);
    assert!(config.command_timeout().as_secs() == 120, "unexpected default COMMAND_TIMEOUT_SECONDS, got {:?}", config.command_timeout());
    assert!(config.node_info_command == "slurmd -C", "unexpected default NODE_INFO_COMMAND, got {}", config.node_info_command);
    assert!(config.health_check_command.is_none(), "unexpected HEALTH_CHECK_COMMAND, got {:?}", config.health_check_command);

    Ok(())
}

#[test]
fn unsupported_criterion_falls_back() -> Result<()> {
    let config = Config::from_vars(vars(&[
        ("RUST_LOG", "error"),
        ("ROLE", "controller"),
        ("UNIT_ID", "slurmctld/0"),
        ("PARTITION_CRITERION", "Bogomips"),
    ]))?;
    assert!(
        config.partition_criterion == PartitionCriterion::Unsupported("Bogomips".into()),
        "unexpected criterion, got {}",
        config.partition_criterion
    );
    Ok(())
}

#[test]
fn config_rejects_invalid_values() {
    let base = [("RUST_LOG", "error"), ("ROLE", "compute")];
    for unit_id in ["compute", "compute/", "/0", "compute/x"] {
        let mut pairs = base.to_vec();
        pairs.push(("UNIT_ID", unit_id));
        assert!(Config::from_vars(vars(&pairs)).is_err(), "expected UNIT_ID {:?} to be rejected", unit_id);
    }

    let mut pairs = base.to_vec();
    pairs.extend([("UNIT_ID", "compute/0"), ("PARTITION_LIMITS", "gpu")]);
    assert!(Config::from_vars(vars(&pairs)).is_err(), "expected malformed PARTITION_LIMITS to be rejected");

    let pairs = [("RUST_LOG", "error"), ("ROLE", "scheduler"), ("UNIT_ID", "compute/0")];
    assert!(Config::from_vars(vars(&pairs)).is_err(), "expected unknown ROLE to be rejected");

    let mut pairs = base.to_vec();
    pairs.extend([("UNIT_ID", "compute/0"), ("COMPUTE_BATCH_SIZE", "0")]);
    assert!(Config::from_vars(vars(&pairs)).is_err(), "expected zero COMPUTE_BATCH_SIZE to be rejected");

    let mut pairs = base.to_vec();
    pairs.extend([("UNIT_ID", "compute/0"), ("COMMAND_TIMEOUT_SECONDS", "0")]);
    assert!(Config::from_vars(vars(&pairs)).is_err(), "expected zero COMMAND_TIMEOUT_SECONDS to be rejected");
}
