use anyhow::Result;

use crate::facts::*;

#[test]
fn publish_overwrites_only_own_prior_value() {
    let mut store = FactStore::new();
    assert!(store.publish(Role::Compute, "compute/0", KEY_NODE_CPUS, "4"));
    assert!(store.publish(Role::Compute, "compute/1", KEY_NODE_CPUS, "8"));
    assert!(!store.publish(Role::Compute, "compute/0", KEY_NODE_CPUS, "4"), "republishing an identical value must not report a change");
    assert!(store.publish(Role::Compute, "compute/0", KEY_NODE_CPUS, "16"));

    let facts = store.read_all(Role::Compute);
    assert_eq!(facts.get(&("compute/0".into(), KEY_NODE_CPUS.into())).map(String::as_str), Some("16"));
    assert_eq!(facts.get(&("compute/1".into(), KEY_NODE_CPUS.into())).map(String::as_str), Some("8"));
}

#[test]
fn depart_removes_all_facts_of_unit() {
    let mut store = FactStore::new();
    store.publish_all(Role::Compute, "compute/0", vec![(KEY_NODE_CPUS, "4"), (KEY_NODE_REALMEMORY, "8000")]);
    store.publish(Role::Compute, "compute/1", KEY_NODE_CPUS, "8");
    store.publish(Role::Gateway, "compute/0", KEY_GATEWAY_READY, "true");

    assert!(store.depart(Role::Compute, "compute/0"));
    assert!(!store.depart(Role::Compute, "compute/0"), "departing twice must be a no-op");

    let facts = store.read_all(Role::Compute);
    assert!(facts.keys().all(|(unit, _)| unit == "compute/1"), "unexpected facts after depart: {:?}", facts);
    assert_eq!(store.get(Role::Gateway, "compute/0", KEY_GATEWAY_READY), Some("true"), "other relations must be untouched");
}

#[test]
fn remove_relation_drops_every_unit() {
    let mut store = FactStore::new();
    store.publish(Role::Accounting, "db/0", KEY_DB_URI, "mysql://db:3306");
    assert!(store.remove_relation(Role::Accounting));
    assert!(store.read_all(Role::Accounting).is_empty());
}

#[test]
fn units_with_role_filters_on_declared_role() {
    let mut store = FactStore::new();
    store.publish(Role::Compute, "controller/0", KEY_UNIT_ROLE, "controller");
    store.publish(Role::Compute, "compute/0", KEY_UNIT_ROLE, "compute");
    store.publish(Role::Compute, "compute/1", KEY_NODE_CPUS, "2");

    let units: Vec<_> = store.units_with_role(Role::Compute, Role::Compute).map(|(id, _)| id).collect();
    assert_eq!(units, vec!["compute/0"]);
}

#[test]
fn store_round_trips_through_fact_iterator() {
    let mut store = FactStore::new();
    store.publish(Role::Compute, "compute/0", KEY_NODE_CPUS, "4");
    store.publish(Role::Controller, "controller/1", KEY_CONTROLLER_HOSTNAME, "ctl-1");
    let rebuilt = FactStore::from_facts(store.facts());
    assert_eq!(rebuilt, store);
}

#[test]
fn max_applied_generation_ignores_garbage() {
    let mut store = FactStore::new();
    store.publish(Role::Compute, "compute/0", KEY_APPLIED_GENERATION, "4");
    store.publish(Role::Gateway, "rest/0", KEY_APPLIED_GENERATION, "7");
    store.publish(Role::Accounting, "db/0", KEY_APPLIED_GENERATION, "not-a-number");
    assert_eq!(store.max_applied_generation(), Some(7));
}

#[test]
fn role_parses_case_insensitively() -> Result<()> {
    assert_eq!("Compute".parse::<Role>()?, Role::Compute);
    assert_eq!(" gateway ".parse::<Role>()?, Role::Gateway);
    assert!("scheduler".parse::<Role>().is_err());
    Ok(())
}

#[test]
fn helpers_behave() {
    assert!(is_truthy(Some("True")));
    assert!(!is_truthy(Some("false")));
    assert!(!is_truthy(None));
    assert_eq!(application_of("gpu-nodes/3"), "gpu-nodes");
    assert_eq!(application_of("standalone"), "standalone");
}
