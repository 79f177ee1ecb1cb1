use sideway_mcast::mcast::{
    hardware::DEFAULT_ENTRY_SIZE,
    manager::{AttachMulticastErrorKind, DetachMulticastErrorKind},
    memory_port::MemoryPort,
    Gid, MulticastGroupManager,
};

/// A table whose hash is the last byte of the GID, so tests pick bins directly.
fn setup(total: u32, bins: u32, max: usize) -> (MulticastGroupManager<MemoryPort>, MemoryPort) {
    let port = MemoryPort::new(total, DEFAULT_ENTRY_SIZE)
        .unwrap()
        .with_hash(|gid| gid.raw[15] as u32);
    let mgr = MulticastGroupManager::create(port.clone(), total, bins, max).unwrap();
    (mgr, port)
}

fn mgid(tag: u8, bin: u8) -> Gid {
    format!("ff12:401b::{tag:x}:{bin:x}").parse().unwrap()
}

#[test]
fn test_idempotent_attach() -> Result<(), Box<dyn std::error::Error>> {
    let (mgr, port) = setup(4, 2, 2);
    let gid = mgid(1, 0);

    mgr.attach(5, &gid)?;
    let writes = port.stats().writes;
    mgr.attach(5, &gid)?;

    assert_eq!(mgr.group_count(), 1);
    assert_eq!(mgr.group(&gid).unwrap().cached_valid_count, 1);
    assert_eq!(mgr.members(&gid)?, Some(vec![5]));
    assert_eq!(port.stats().writes, writes);

    Ok(())
}

#[test]
fn test_round_trip_empties_table() -> Result<(), Box<dyn std::error::Error>> {
    let (mgr, port) = setup(8, 4, 4);
    let gids: Vec<_> = (0..6).map(|i| mgid(i, i % 4)).collect();

    for (i, gid) in gids.iter().enumerate() {
        for qpn in 0..=i as u32 % 4 {
            mgr.attach(0x100 + qpn, gid)?;
        }
    }
    mgr.verify()?;
    assert_eq!(mgr.group_count(), 6);

    for (i, gid) in gids.iter().enumerate().rev() {
        for qpn in 0..=i as u32 % 4 {
            mgr.detach(0x100 + qpn, gid)?;
            mgr.verify()?;
        }
    }

    assert_eq!(mgr.group_count(), 0);
    for index in 0..4 {
        assert!(port.peek(index).unwrap().is_empty());
    }

    Ok(())
}

#[test]
fn test_capacity_bound() {
    let (mgr, _) = setup(4, 2, 3);
    let gid = mgid(1, 1);

    for qpn in 0..3 {
        mgr.attach(qpn, &gid).unwrap();
    }
    let err = mgr.attach(3, &gid).unwrap_err();
    assert!(matches!(err.source, AttachMulticastErrorKind::GroupFull { max: 3 }));
    assert_eq!(err.qpn, 3);
    assert_eq!(err.gid, gid);

    assert_eq!(mgr.group(&gid).unwrap().cached_valid_count, 3);
    assert_eq!(mgr.members(&gid).unwrap().unwrap().len(), 3);
}

#[test]
fn test_collision_chaining() {
    let (mgr, port) = setup(4, 2, 2);
    let (a, b) = (mgid(1, 1), mgid(2, 1));

    mgr.attach(1, &a).unwrap();
    mgr.attach(2, &b).unwrap();

    let head = mgr.group(&a).unwrap();
    assert_eq!(head.absolute_index, 1);
    assert_eq!(head.prev_absolute_index, None);

    let link = mgr.group(&b).unwrap();
    assert!(link.absolute_index >= 2 && link.absolute_index < 4);
    assert_eq!(link.prev_absolute_index, Some(1));
    assert_eq!(port.peek(1).unwrap().next_index, Some(link.absolute_index));
    mgr.verify().unwrap();
}

#[test]
fn test_head_promotion() {
    let (mgr, port) = setup(4, 2, 2);
    let (a, b) = (mgid(1, 0), mgid(2, 0));

    mgr.attach(1, &a).unwrap();
    mgr.attach(2, &b).unwrap();
    let old_index = mgr.group(&b).unwrap().absolute_index;

    mgr.detach(1, &a).unwrap();

    let promoted = mgr.group(&b).unwrap();
    assert_eq!(promoted.absolute_index, 0);
    assert_eq!(promoted.prev_absolute_index, None);
    assert_eq!(promoted.cached_valid_count, 1);
    assert!(mgr.group(&a).is_none());
    assert_eq!(mgr.group_count(), 1);

    let bin = port.peek(0).unwrap();
    assert_eq!(bin.gid, b);
    assert_eq!(bin.members, vec![2]);
    assert_eq!(bin.next_index, None);

    // the old overflow slot is free again and is the next one handed out
    let c = mgid(3, 0);
    mgr.attach(3, &c).unwrap();
    assert_eq!(mgr.group(&c).unwrap().absolute_index, old_index);
    mgr.verify().unwrap();
}

#[test]
fn test_allocator_exhaustion() {
    let (mgr, _) = setup(2, 2, 2);

    mgr.attach(1, &mgid(1, 1)).unwrap();
    let err = mgr.attach(2, &mgid(2, 1)).unwrap_err();

    assert!(matches!(err.source, AttachMulticastErrorKind::ResourceExhausted));
    assert_eq!(mgr.group_count(), 1);
    mgr.verify().unwrap();
}

#[test]
fn test_two_groups_share_a_bin() {
    let (mgr, port) = setup(4, 2, 2);
    let (a, b) = (mgid(0xa, 0), mgid(0xb, 0));

    mgr.attach(1, &a).unwrap();
    mgr.attach(2, &b).unwrap();
    let index = mgr.group(&b).unwrap().absolute_index;
    assert!(index == 2 || index == 3);

    mgr.detach(1, &a).unwrap();
    assert_eq!(mgr.group(&b).unwrap().absolute_index, 0);
    assert_eq!(port.peek(0).unwrap().gid, b);
    assert_eq!(mgr.group_count(), 1);
}

#[test]
fn test_detach_unknown_group_and_member() {
    let (mgr, _) = setup(4, 2, 2);
    let gid = mgid(1, 1);

    let err = mgr.detach(1, &gid).unwrap_err();
    assert!(matches!(err.source, DetachMulticastErrorKind::UnknownGroup));

    mgr.attach(1, &gid).unwrap();
    let err = mgr.detach(2, &gid).unwrap_err();
    assert!(matches!(err.source, DetachMulticastErrorKind::UnknownMember));
    assert_eq!(
        err.to_string(),
        format!("failed to detach QP 0x2 from multicast group {gid}")
    );

    assert!(mgr.is_attached(1, &gid).unwrap());
    assert!(!mgr.is_attached(2, &gid).unwrap());
    assert!(!mgr.is_attached(1, &mgid(9, 9)).unwrap());
}

#[test]
fn test_swap_remove_keeps_other_members() {
    let (mgr, port) = setup(4, 2, 4);
    let gid = mgid(1, 0);
    for qpn in [10, 11, 12, 13] {
        mgr.attach(qpn, &gid).unwrap();
    }

    mgr.detach(11, &gid).unwrap();
    assert_eq!(port.peek(0).unwrap().members, vec![10, 13, 12]);
    assert_eq!(mgr.group(&gid).unwrap().cached_valid_count, 3);
    mgr.verify().unwrap();
}

#[test]
fn test_widest_qpn_round_trip() -> Result<(), Box<dyn std::error::Error>> {
    let (mgr, port) = setup(4, 2, 2);
    let gid = mgid(1, 0);

    mgr.attach(0x00ff_ffff, &gid)?;
    let writes = port.stats().writes;
    mgr.attach(0x00ff_ffff, &gid)?;

    assert_eq!(port.stats().writes, writes);
    assert_eq!(mgr.members(&gid)?, Some(vec![0x00ff_ffff]));
    assert!(mgr.is_attached(0x00ff_ffff, &gid)?);

    mgr.detach(0x00ff_ffff, &gid)?;
    assert_eq!(mgr.group_count(), 0);
    mgr.verify()?;

    Ok(())
}

#[test]
fn test_rejects_qpn_wider_than_24_bits() -> Result<(), Box<dyn std::error::Error>> {
    let (mgr, port) = setup(4, 2, 2);
    let gid = mgid(1, 0);
    mgr.attach(1, &gid)?;
    let stats = port.stats();

    match mgr.attach(0x0100_0001, &gid) {
        Err(err) => assert!(matches!(err.source, AttachMulticastErrorKind::InvalidQpn)),
        other => panic!("Expected InvalidQpn, got: {other:?}"),
    }
    match mgr.detach(0x0100_0001, &gid) {
        Err(err) => assert!(matches!(err.source, DetachMulticastErrorKind::InvalidQpn)),
        other => panic!("Expected InvalidQpn, got: {other:?}"),
    }

    assert_eq!(port.stats(), stats);
    assert_eq!(mgr.members(&gid)?, Some(vec![1]));
    mgr.detach(1, &gid)?;
    assert_eq!(mgr.group_count(), 0);
    mgr.verify()?;

    Ok(())
}

#[test]
fn test_rejects_zero_gid() -> Result<(), Box<dyn std::error::Error>> {
    let (mgr, port) = setup(4, 2, 2);

    match mgr.attach(1, &Gid::ZERO) {
        Err(err) => assert!(matches!(err.source, AttachMulticastErrorKind::InvalidGid)),
        other => panic!("Expected InvalidGid, got: {other:?}"),
    }
    assert_eq!(port.stats().hashes, 0);
    assert_eq!(port.stats().writes, 0);
    assert!(mgr.group(&Gid::ZERO).is_none());

    // ff12:: hashes to the same bin the zero GID would have taken
    let gid: Gid = "ff12::".parse()?;
    mgr.attach(2, &gid)?;
    assert_eq!(mgr.group(&gid).unwrap().absolute_index, 0);
    assert_eq!(mgr.group_count(), 1);
    mgr.verify()?;

    match mgr.detach(1, &Gid::ZERO) {
        Err(err) => assert!(matches!(err.source, DetachMulticastErrorKind::UnknownGroup)),
        other => panic!("Expected UnknownGroup, got: {other:?}"),
    }

    Ok(())
}
