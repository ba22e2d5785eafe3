use anyhow::Result;

use crate::catalog::NodeHealth;
use crate::facts::*;
use crate::health::*;
use crate::fixtures::compute_unit;

#[test]
fn down_is_cleared_by_healthy_recheck() {
    let mut gate = HealthGate::new();
    assert!(gate.mark("node-a", CheckOutcome::Down, "nhc: /scratch not mounted"));
    assert_eq!(gate.effective("node-a").health, NodeHealth::Down);
    assert_eq!(gate.effective("node-a").reason.as_deref(), Some("nhc: /scratch not mounted"));

    assert!(gate.mark("node-a", CheckOutcome::Healthy, ""));
    assert_eq!(gate.effective("node-a").health, NodeHealth::Healthy);
    assert!(!gate.mark("node-a", CheckOutcome::Healthy, ""), "repeated HEALTHY must not report a change");
}

#[test]
fn cleared_token_clears_down_case_insensitively() {
    let mut gate = HealthGate::new();
    gate.mark("node-a", CheckOutcome::Down, "bad dimm");
    assert!(gate.mark("node-a", CheckOutcome::Down, "DIMM replaced, CLEARED by ops"));
    assert_eq!(gate.effective("node-a").health, NodeHealth::Healthy);

    gate.mark("node-a", CheckOutcome::Down, "bad dimm again");
    assert!(gate.clear("node-a"));
    assert_eq!(gate.effective("node-a").health, NodeHealth::Healthy);
}

#[test]
fn drain_is_independent_of_outcome() {
    let mut gate = HealthGate::new();
    gate.mark("node-a", CheckOutcome::Healthy, "");
    assert!(gate.drain("node-a", "kernel upgrade"));
    assert!(!gate.drain("node-a", "kernel upgrade"));

    let effective = gate.effective("node-a");
    assert_eq!(effective.health, NodeHealth::Drained);
    assert_eq!(effective.reason.as_deref(), Some("kernel upgrade"));
    assert_eq!(gate.state("node-a").and_then(|state| state.outcome), Some(CheckOutcome::Healthy), "a drained node keeps its HEALTHY outcome");

    assert!(gate.undrain("node-a"));
    assert!(!gate.undrain("node-a"));
    assert_eq!(gate.effective("node-a").health, NodeHealth::Healthy);
}

#[test]
fn down_takes_precedence_over_drain() {
    let mut gate = HealthGate::new();
    gate.drain("node-a", "maintenance");
    gate.mark("node-a", CheckOutcome::Down, "no heartbeat");
    assert_eq!(gate.effective("node-a").health, NodeHealth::Down);
    gate.mark("node-a", CheckOutcome::Healthy, "");
    assert_eq!(gate.effective("node-a").health, NodeHealth::Drained);
}

#[test]
fn unknown_nodes_have_unknown_health() {
    let gate = HealthGate::new();
    let effective = gate.effective("node-z");
    assert_eq!(effective.health, NodeHealth::Unknown);
    assert!(!effective.force_included);
}

#[test]
fn reports_are_applied_once() {
    let mut facts = FactStore::new();
    compute_unit(&mut facts, "compute/0", 4, 7944, 2);
    facts.publish(Role::Compute, "compute/0", KEY_HEALTH_OUTCOME, "DOWN");
    facts.publish(Role::Compute, "compute/0", KEY_HEALTH_REASON, "nhc: load too high");

    let mut gate = HealthGate::new();
    assert!(gate.observe_reports(&facts));
    assert_eq!(gate.effective("compute-0").health, NodeHealth::Down);

    // An operator clear must survive the stale report still being published.
    gate.clear("compute-0");
    assert!(!gate.observe_reports(&facts));
    assert_eq!(gate.effective("compute-0").health, NodeHealth::Healthy);

    // A new report is applied.
    facts.publish(Role::Compute, "compute/0", KEY_HEALTH_REASON, "nhc: load too high again");
    assert!(gate.observe_reports(&facts));
    assert_eq!(gate.effective("compute-0").health, NodeHealth::Down);
}

#[test]
fn malformed_reports_are_ignored() {
    let mut facts = FactStore::new();
    compute_unit(&mut facts, "compute/0", 4, 7944, 2);
    facts.publish(Role::Compute, "compute/0", KEY_HEALTH_OUTCOME, "SICK");
    let mut gate = HealthGate::new();
    assert!(!gate.observe_reports(&facts));
    assert!(gate.state("compute-0").is_none());
}

#[test]
fn gate_survives_persistence() -> Result<()> {
    let mut gate = HealthGate::new();
    gate.mark("node-a", CheckOutcome::Down, "bad psu");
    gate.drain("node-b", "reserved");
    gate.force_include("node-c", true);
    let restored = HealthGate::from_json(&gate.to_json()?)?;
    assert_eq!(restored, gate);
    Ok(())
}
