use crate::*;

use meshcast_core::BufferMap;

fn all_ids(n: u32) -> BufferMap {
    (0..n).collect()
}

#[test]
fn stream_reaches_every_relay_in_order() -> Result<()> {
    let mut mesh = Mesh::new();
    let src = peer(1);
    mesh.join(src, test_config(Role::Source));
    for n in 2..=4 {
        mesh.join(peer(n), test_config(Role::Relay));
    }

    for _ in 0..40 {
        mesh.produce(src)?;
    }
    for _ in 0..20 {
        mesh.round()?;
    }

    for n in 2..=4 {
        let node = mesh.node(peer(n));
        assert_eq!(node.session.buffer_map(), all_ids(40), "relay {} is missing chunks", node.id);

        let played = node.sink.ids();
        assert_strictly_increasing(&played);
        assert_eq!(played.last(), Some(&39));

        let c = node.measures.counters();
        assert_eq!(c.chunks_lost, 0);
        assert!(c.chunks_received >= 40);
    }
    // The source never takes chunks back.
    assert_eq!(mesh.node(src).measures.counters().chunks_received, 0);
    Ok(())
}

#[test]
fn chunks_cross_a_chain_of_relays() -> Result<()> {
    let (s, a, b, c) = (peer(1), peer(2), peer(3), peer(4));
    let mut mesh = Mesh::new();
    mesh.join(s, test_config(Role::Source));
    mesh.join_linked(a, test_config(Role::Relay), &[s]);
    mesh.join_linked(b, test_config(Role::Relay), &[a]);
    mesh.join_linked(c, test_config(Role::Relay), &[b]);

    for _ in 0..10 {
        mesh.produce(s)?;
    }
    for _ in 0..15 {
        mesh.round()?;
    }

    let tail = mesh.node(c);
    assert_eq!(tail.session.buffer_map(), all_ids(10));
    for id in 0..10 {
        let chunk = tail.session.chunk(id).unwrap();
        assert_eq!(chunk.attributes.hopcount, 3, "chunk {id}");
    }
    assert_eq!(tail.sink.ids(), (0..10).collect::<Vec<_>>());
    Ok(())
}

#[test]
fn injected_loss_keeps_chunks_away() -> Result<()> {
    let src = peer(1);
    let lossy = peer(3);
    let mut mesh = Mesh::new();
    mesh.join(src, test_config(Role::Source));
    mesh.join(peer(2), test_config(Role::Relay));
    mesh.join(
        lossy,
        SessionConfig {
            chunk_loss_interval: 5,
            ..test_config(Role::Relay)
        },
    );

    for _ in 0..20 {
        mesh.produce(src)?;
    }
    for _ in 0..10 {
        mesh.round()?;
    }

    let held = mesh.node(lossy).session.buffer_map();
    assert!(held.iter().all(|id| id % 5 != 0));
    assert_eq!(held.len(), 16);
    assert_eq!(mesh.node(peer(2)).session.buffer_map(), all_ids(20));

    // Playout stops right before the first hole after its start.
    let played = mesh.node(lossy).sink.ids();
    assert!(!played.is_empty());
    assert_strictly_increasing(&played);
    assert_eq!(played.last().map(|id| id % 5), Some(4));
    Ok(())
}
