use std::thread;
use std::time::Duration;

use crate::*;

#[test]
fn healthy_acks_speed_up_the_offer_period() -> Result<()> {
    let src = peer(1);
    let mut mesh = Mesh::new();
    // No pushes: every chunk travels offer → accept → deliver → ack.
    mesh.join(
        src,
        SessionConfig {
            source_multiplicity: 0,
            ..test_config(Role::Source)
        },
    );
    mesh.join(peer(2), test_config(Role::Relay));

    let initial = mesh.node(src).session.period();
    for _ in 0..20 {
        mesh.produce(src)?;
    }

    let source = mesh.node(src);
    let c = source.measures.counters();
    assert!(c.queue_delay_samples > 0, "no delivery was acked");
    assert!(c.accepts_in_nonempty > 0);
    assert!(source.session.period() < initial);
    assert!(source.session.period() >= Duration::from_millis(5));

    // The relay never had to offer anything.
    assert_eq!(mesh.node(peer(2)).session.pending_transactions(), 0);
    Ok(())
}

#[test]
fn silent_peer_transactions_time_out() -> Result<()> {
    let src = peer(1);
    let ghost = peer(7);
    let short = |role| SessionConfig {
        transaction_lifetime: Duration::from_millis(20),
        ..test_config(role)
    };

    let mut mesh = Mesh::new();
    mesh.join(src, short(Role::Source));
    mesh.join(peer(2), short(Role::Relay));
    mesh.join(ghost, short(Role::Relay));
    mesh.silence(ghost);

    for _ in 0..5 {
        mesh.produce(src)?;
    }
    assert!(mesh.node(src).session.pending_transactions() > 0);

    thread::sleep(Duration::from_millis(40));
    let swept: usize = mesh.nodes.iter().map(|n| n.session.sweep_transactions()).sum();
    assert!(swept > 0);

    let source = mesh.node(src);
    assert_eq!(source.session.pending_transactions(), 0);
    assert!(source.measures.counters().transaction_timeouts > 0);
    let ghost_stats = source.measures.peer(&ghost).unwrap();
    assert!(ghost_stats.reception_rate < 0.9);
    // The live relay kept answering.
    let live = source.measures.peer(&peer(2)).unwrap();
    assert!(live.reception_rate > ghost_stats.reception_rate);
    Ok(())
}
