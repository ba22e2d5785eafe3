//! Test fixtures.

use crate::facts::*;

/// Publish the facts of a complete compute unit.
pub fn compute_unit(store: &mut FactStore, unit_id: &str, cpus: i64, memory: i64, cores: i64) {
    store.publish_all(
        Role::Compute,
        unit_id,
        vec![
            (KEY_UNIT_ROLE, Role::Compute.to_string()),
            (KEY_NODE_CPUS, cpus.to_string()),
            (KEY_NODE_REALMEMORY, memory.to_string()),
            (KEY_NODE_CORESPERSOCKET, cores.to_string()),
        ],
    );
}

/// Publish the facts of a controller unit on every relation it takes part in.
pub fn controller_unit(store: &mut FactStore, unit_id: &str, hostname: &str) {
    for relation in Role::ALL.iter() {
        store.publish(*relation, unit_id, KEY_UNIT_ROLE, Role::Controller.to_string());
    }
    store.publish(Role::Controller, unit_id, KEY_CONTROLLER_HOSTNAME, hostname);
}

/// Publish the facts of an accounting unit.
pub fn accounting_unit(store: &mut FactStore, unit_id: &str, uri: &str, ready: bool) {
    store.publish_all(
        Role::Accounting,
        unit_id,
        vec![
            (KEY_UNIT_ROLE, Role::Accounting.to_string()),
            (KEY_DB_URI, uri.to_string()),
            (KEY_DB_READY, ready.to_string()),
        ],
    );
}

/// Publish the facts of a gateway unit.
pub fn gateway_unit(store: &mut FactStore, unit_id: &str, endpoint: &str, ready: bool) {
    store.publish_all(
        Role::Gateway,
        unit_id,
        vec![
            (KEY_UNIT_ROLE, Role::Gateway.to_string()),
            (KEY_GATEWAY_ENDPOINT, endpoint.to_string()),
            (KEY_GATEWAY_READY, ready.to_string()),
        ],
    );
}

/// Publish an acknowledgement of the given generation on behalf of a target.
pub fn ack(store: &mut FactStore, relation: Role, unit_id: &str, generation: u64) {
    store.publish(relation, unit_id, KEY_APPLIED_GENERATION, generation.to_string());
}
