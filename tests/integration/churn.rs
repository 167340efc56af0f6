use crate::*;

#[test]
fn relay_leaving_mid_stream_does_not_stall_the_rest() -> Result<()> {
    let src = peer(1);
    let mut mesh = Mesh::new();
    mesh.join(src, test_config(Role::Source));
    for n in 2..=5 {
        mesh.join(peer(n), test_config(Role::Relay));
    }

    for _ in 0..15 {
        mesh.produce(src)?;
    }
    mesh.leave(peer(3));
    for _ in 0..15 {
        mesh.produce(src)?;
    }
    for _ in 0..15 {
        mesh.round()?;
    }

    for n in [2, 4, 5] {
        let node = mesh.node(peer(n));
        assert_eq!(node.session.buffer_map().len(), 30, "relay {}", node.id);
        assert_strictly_increasing(&node.sink.ids());
        assert_eq!(node.sink.ids().last(), Some(&29));
        assert_eq!(node.table.len(), 3);
    }
    Ok(())
}

#[test]
fn late_joiner_starts_from_what_it_gets() -> Result<()> {
    let src = peer(1);
    let late = peer(9);
    let mut mesh = Mesh::new();
    mesh.join(src, test_config(Role::Source));
    mesh.join(peer(2), test_config(Role::Relay));

    for _ in 0..20 {
        mesh.produce(src)?;
    }
    mesh.join(late, test_config(Role::Relay));
    for _ in 0..10 {
        mesh.produce(src)?;
    }
    for _ in 0..15 {
        mesh.round()?;
    }

    let node = mesh.node(late);
    let played = node.sink.ids();
    assert!(!played.is_empty());
    assert_strictly_increasing(&played);
    assert_eq!(played.last(), Some(&29));
    // Everything after its first chunk was filled in.
    let first = played[0];
    assert_eq!(played.len() as u32, 30 - first);
    Ok(())
}

#[test]
fn chunk_buffer_stays_bounded_over_a_long_stream() -> Result<()> {
    let src = peer(1);
    let mut mesh = Mesh::new();
    mesh.join(
        src,
        SessionConfig {
            buffer_size: 16,
            ..test_config(Role::Source)
        },
    );
    mesh.join(
        peer(2),
        SessionConfig {
            buffer_size: 16,
            playout_window: 24,
            ..test_config(Role::Relay)
        },
    );

    for _ in 0..100 {
        mesh.produce(src)?;
    }
    for _ in 0..5 {
        mesh.round()?;
    }

    let relay = mesh.node(peer(2));
    let held = relay.session.buffer_map();
    assert_eq!(held.len(), 16);
    assert_eq!(held.latest(), Some(99));
    let played = relay.sink.ids();
    assert_strictly_increasing(&played);
    assert_eq!(played.last(), Some(&99));
    Ok(())
}
