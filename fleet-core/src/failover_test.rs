use anyhow::Result;

use crate::error::AppError;
use crate::failover::*;

fn coordinator(shared: &MemoryLeadership, unit_id: &str) -> FailoverCoordinator<MemorySubstrate> {
    FailoverCoordinator::new(unit_id, shared.handle(unit_id))
}

#[test]
fn leader_claims_first_term() -> Result<()> {
    let shared = MemoryLeadership::new();
    let mut a = coordinator(&shared, "ctl/0");
    let mut b = coordinator(&shared, "ctl/1");
    shared.elect(Some("ctl/0"));

    assert!(a.refresh()?, "elected unit must become primary");
    assert!(!b.refresh()?, "follower must not become primary");
    assert_eq!(a.term(), 1);
    assert_eq!(b.term(), 1, "followers observe the current term");
    assert_eq!(
        a.token(),
        Some(LeadershipToken {
            holder_unit_id: "ctl/0".into(),
            term: 1
        })
    );

    assert!(a.refresh()?, "refreshing a primary keeps it primary");
    assert_eq!(a.term(), 1, "refreshing a primary must not bump the term");
    Ok(())
}

#[test]
fn no_leader_no_primary() -> Result<()> {
    let shared = MemoryLeadership::new();
    let mut a = coordinator(&shared, "ctl/0");
    assert!(!a.refresh()?);
    assert!(a.token().is_none());
    assert!(matches!(a.leader_set("k", "v"), Err(AppError::LeadershipLost { term: 0 })));
    Ok(())
}

#[test]
fn failover_bumps_the_term() -> Result<()> {
    let shared = MemoryLeadership::new();
    let mut a = coordinator(&shared, "ctl/0");
    let mut b = coordinator(&shared, "ctl/1");
    shared.elect(Some("ctl/0"));
    a.refresh()?;
    a.leader_set("cluster.name", "charmed-hpc-abc123")?;

    shared.elect(Some("ctl/1"));
    assert!(b.refresh()?);
    assert_eq!(b.term(), 2);
    assert!(!a.refresh()?, "deposed primary must stand down");
    assert_eq!(b.leader_get("cluster.name").as_deref(), Some("charmed-hpc-abc123"), "leader data survives failover");

    shared.elect(Some("ctl/0"));
    assert!(a.refresh()?);
    assert_eq!(a.term(), 3, "regaining leadership claims a new term");
    Ok(())
}

#[test]
fn deposed_primary_stops_on_higher_term() -> Result<()> {
    let shared = MemoryLeadership::new();
    let mut a = coordinator(&shared, "ctl/0");
    shared.elect(Some("ctl/0"));
    a.refresh()?;
    assert!(a.is_primary());

    // Another unit claimed a higher term while the substrate still reports ctl/0 as leader.
    let token = serde_json::to_string(&LeadershipToken {
        holder_unit_id: "ctl/1".into(),
        term: 7,
    })?;
    shared.force_set(KEY_LEADER_TOKEN, &token);
    assert!(!a.is_primary(), "a unit must not act as primary once a higher term names another holder");
    let res = a.leader_set("k", "v");
    assert!(matches!(res, Err(AppError::LeadershipLost { .. })), "unexpected result {:?}", res);

    // Refreshing reclaims above the highest observed term.
    assert!(a.refresh()?);
    assert_eq!(a.term(), 8);
    Ok(())
}

#[test]
fn at_most_one_primary() -> Result<()> {
    let shared = MemoryLeadership::new();
    let mut units: Vec<_> = (0..3).map(|idx| coordinator(&shared, &format!("ctl/{}", idx))).collect();
    for leader in ["ctl/2", "ctl/0", "ctl/1", "ctl/1"] {
        shared.elect(Some(leader));
        let mut primaries = 0;
        for unit in units.iter_mut() {
            if unit.refresh()? {
                primaries += 1;
            }
        }
        assert!(primaries == 1, "unexpected number of primaries, got {}, expected {}", primaries, 1);
    }
    Ok(())
}

#[test]
fn malformed_token_is_ignored() -> Result<()> {
    let shared = MemoryLeadership::new();
    let mut a = coordinator(&shared, "ctl/0");
    shared.force_set(KEY_LEADER_TOKEN, "not json");
    shared.elect(Some("ctl/0"));
    assert!(a.refresh()?);
    assert_eq!(a.term(), 1);
    Ok(())
}
