use pktpipe::{
    AuxState, Context, Counter, CounterArray, DispatchError, DispatchTableBuilder, Disposition,
    IngressMeta, Invocation, MAX_TAIL_CALL_CNT, Outcome, PacketView, Pipeline, PipelineConfig,
    PipelineConfigBuilder, packet::net_types as nt,
};
use test_utils::{BUFFER_SIZE, Snat4Offsets, init_logging, testing_view};
use tests::*;

/// Records the stages visited in the order they ran
#[derive(Copy, Clone, Default, Debug)]
struct Trail {
    hops: [u8; 8],
    len: u8,
}

impl Context for Trail {}

impl Trail {
    fn push(mut self, stage: u32) -> Self {
        self.hops[self.len as usize] = stage as u8;
        self.len += 1;
        self
    }
}

/// Runs stages 0 -> 3 -> 1 -> 5 -> 2, every stage appending its own index to
/// the packet, then writes the trail it was handed
fn hop(inv: &mut Invocation<'_, '_>, ctx: Trail) -> Outcome<Trail> {
    let stage = inv.stage();
    if inv.packet.append(&[stage as u8]).is_err() {
        return Disposition::Aborted.into();
    }

    let ctx = ctx.push(stage);
    match stage {
        0 => Outcome::transfer(3, ctx),
        3 => Outcome::transfer(1, ctx),
        1 => Outcome::transfer(5, ctx),
        5 => Outcome::transfer(2, ctx),
        _ => match inv.packet.append(&ctx.hops[..ctx.len as usize]) {
            Ok(()) => Disposition::Pass.into(),
            Err(_) => Disposition::Aborted.into(),
        },
    }
}

fn again(inv: &mut Invocation<'_, '_>, ctx: u32) -> Outcome<u32> {
    Outcome::transfer(inv.stage(), ctx + 1)
}

fn tripwire(inv: &mut Invocation<'_, '_>, _ctx: u32) -> Outcome<u32> {
    // Use a key no counter maps to so reaching here is observable
    let _ = inv.state.add(7, 1);
    Disposition::Pass.into()
}

#[test]
fn visits_stages_in_order() {
    init_logging();

    let mut builder = DispatchTableBuilder::<Trail, 6>::new();
    for index in [0, 1, 2, 3, 5] {
        builder.register(index, hop).unwrap();
    }
    let pipeline = Pipeline::new(builder.build(), PipelineConfig::default()).unwrap();
    assert_eq!(pipeline.table().registered(), 5);

    let counters = CounterArray::<16>::new();
    let mut buf = [0u8; BUFFER_SIZE];
    let mut packet = testing_view(&mut buf);

    let verdict = pipeline.run(&mut packet, IngressMeta::default(), &counters);
    assert_eq!(verdict.disposition, Disposition::Pass);
    assert_eq!(verdict.transfers, 4);
    assert!(!verdict.is_failure());

    // Once from the stages themselves, once from the context
    assert_eq!(&packet[..], &[0, 3, 1, 5, 2, 0, 3, 1, 5, 2]);

    assert_eq!(counters.counter(Counter::Pass), 1);
    for index in [0, 1, 2, 3, 5] {
        assert_eq!(counters.counter(Counter::Stage(index)), 1);
    }
    assert_eq!(counters.counter(Counter::Stage(4)), 0);
}

#[test]
fn context_is_carried_by_value() {
    init_logging();

    fn count(inv: &mut Invocation<'_, '_>, ctx: u32) -> Outcome<u32> {
        if ctx == 10 {
            return match inv.packet.write(0, ctx) {
                Ok(()) => Disposition::Tx.into(),
                Err(_) => Disposition::Aborted.into(),
            };
        }

        Outcome::transfer(inv.stage() ^ 1, ctx + 1)
    }

    let mut builder = DispatchTableBuilder::<u32, 2>::new();
    builder.register(0, count).unwrap().register(1, count).unwrap();
    let pipeline = Pipeline::new(builder.build(), PipelineConfig::default()).unwrap();

    let mut buf = [0u8; 4];
    let mut packet = PacketView::from_slice(&mut buf);

    let verdict = pipeline.run_with(&mut packet, IngressMeta::default(), &(), 3);
    assert_eq!(verdict.disposition, Disposition::Tx);
    assert_eq!(verdict.transfers, 7);
    assert_eq!(packet.read::<u32>(0).unwrap(), 10);
}

/// A stage that keeps transferring is cut off rather than looping forever
#[test]
fn chain_limit() {
    init_logging();

    let mut builder = DispatchTableBuilder::<u32, 1>::new();
    builder.register(0, again).unwrap();
    let table = builder.build();
    let pipeline = Pipeline::new(table, PipelineConfig::default()).unwrap();

    let counters = CounterArray::<16>::new();
    let mut buf = [0u8; 64];
    let mut packet = PacketView::from_slice(&mut buf);

    let verdict = pipeline.run(&mut packet, IngressMeta::default(), &counters);
    assert_eq!(verdict.disposition, Disposition::Aborted);
    assert_eq!(verdict.transfers, MAX_TAIL_CALL_CNT);
    assert_eq!(
        verdict.failure,
        Some(DispatchError::ChainLimit {
            limit: MAX_TAIL_CALL_CNT
        })
    );

    assert_eq!(
        counters.counter(Counter::Stage(0)),
        MAX_TAIL_CALL_CNT as u64 + 1
    );
    assert_eq!(counters.counter(Counter::ChainLimit), 1);
    assert_eq!(counters.counter(Counter::Aborted), 1);
    assert_eq!(counters.counter(Counter::Pass), 0);
}

#[test]
fn configured_chain_limit() {
    init_logging();

    fn until(inv: &mut Invocation<'_, '_>, ctx: u32) -> Outcome<u32> {
        Outcome::transfer_if(ctx > 0, inv.stage(), ctx.saturating_sub(1), Disposition::Drop)
    }

    let config = PipelineConfigBuilder::default()
        .max_transfers(3)
        .build()
        .unwrap();
    assert_eq!(config.max_transfers(), 3);

    let mut builder = DispatchTableBuilder::<u32, 1>::new();
    builder.register(0, until).unwrap();
    let pipeline = Pipeline::new(builder.build(), config).unwrap();

    let mut buf = [0u8; 64];
    let mut packet = PacketView::from_slice(&mut buf);

    let verdict = pipeline.run_with(&mut packet, IngressMeta::default(), &(), 3);
    assert_eq!(verdict.disposition, Disposition::Drop);
    assert_eq!(verdict.transfers, 3);

    let verdict = pipeline.run_with(&mut packet, IngressMeta::default(), &(), 4);
    assert_eq!(verdict.disposition, Disposition::Aborted);
    assert_eq!(verdict.failure, Some(DispatchError::ChainLimit { limit: 3 }));
    assert_eq!(verdict.transfers, 3);
}

/// Transfers to empty or out of range slots fail before anything is entered
#[test]
fn invalid_index_never_enters_a_stage() {
    init_logging();

    fn to(inv: &mut Invocation<'_, '_>, ctx: u32) -> Outcome<u32> {
        match inv.packet.read::<u32>(0) {
            Ok(next) => Outcome::transfer(next, ctx),
            Err(_) => Disposition::Aborted.into(),
        }
    }

    let mut builder = DispatchTableBuilder::<u32, 4>::new();
    builder.register(0, to).unwrap().register(3, tripwire).unwrap();
    let pipeline = Pipeline::new(builder.build(), PipelineConfig::default()).unwrap();
    let counters = CounterArray::<16>::new();

    for (target, expected) in [
        (4, DispatchError::InvalidIndex {
            index: 4,
            capacity: 4,
        }),
        (u32::MAX, DispatchError::InvalidIndex {
            index: u32::MAX,
            capacity: 4,
        }),
        (2, DispatchError::InvalidIndex {
            index: 2,
            capacity: 4,
        }),
    ] {
        let mut buf = [0u8; 4];
        let mut packet = PacketView::from_slice(&mut buf);
        packet.write(0, target).unwrap();

        let verdict = pipeline.run(&mut packet, IngressMeta::default(), &counters);
        assert_eq!(verdict.disposition, Disposition::Aborted);
        assert_eq!(verdict.failure, Some(expected));
        assert_eq!(verdict.transfers, 0);
    }

    assert_eq!(counters.get(7), Some(0));
    assert_eq!(counters.counter(Counter::Stage(3)), 0);
    assert_eq!(counters.counter(Counter::InvalidIndex), 3);
    assert_eq!(counters.counter(Counter::Aborted), 3);

    // The same table happily enters the registered slot
    let mut buf = [0u8; 4];
    let mut packet = PacketView::from_slice(&mut buf);
    packet.write(0, 3u32).unwrap();
    let verdict = pipeline.run(&mut packet, IngressMeta::default(), &counters);
    assert_eq!(verdict.disposition, Disposition::Pass);
    assert_eq!(counters.get(7), Some(1));
}

#[test]
fn custom_entry() {
    init_logging();

    fn redirect(inv: &mut Invocation<'_, '_>, _ctx: u32) -> Outcome<u32> {
        Disposition::Redirect {
            ifindex: inv.meta.ifindex + 1,
        }
        .into()
    }

    let mut builder = DispatchTableBuilder::<u32, 4>::new();
    builder.register(0, tripwire).unwrap().register(2, redirect).unwrap();
    let table = builder.build();

    let err = Pipeline::new(
        table,
        PipelineConfigBuilder::default().entry(1).build().unwrap(),
    )
    .unwrap_err();
    assert_eq!(err.name, "entry");

    let mut builder = DispatchTableBuilder::<u32, 4>::new();
    builder.register(0, tripwire).unwrap().register(2, redirect).unwrap();
    let pipeline = Pipeline::new(
        builder.build(),
        PipelineConfigBuilder::default().entry(2).build().unwrap(),
    )
    .unwrap();

    let counters = CounterArray::<16>::new();
    let mut buf = [0u8; 64];
    let mut packet = PacketView::from_slice(&mut buf);
    let verdict = pipeline.run(
        &mut packet,
        IngressMeta {
            ifindex: 4,
            rx_queue: 1,
        },
        &counters,
    );

    assert_eq!(verdict.disposition, Disposition::Redirect { ifindex: 5 });
    assert_eq!(counters.counter(Counter::Redirect), 1);
    assert_eq!(counters.get(7), Some(0));
}

/// Where the source NAT pipeline keeps its state between stages
#[derive(Copy, Clone, Default)]
struct Flow {
    l3: u16,
    l4: u16,
    check_offset: u16,
    proto: u8,
}

impl Context for Flow {}

const CLASSIFY: u32 = 0;
const SNAT: u32 = 1;

fn classify(inv: &mut Invocation<'_, '_>, _ctx: Flow) -> Outcome<Flow> {
    match nt::L4Layout::parse_view(inv.packet) {
        Ok(Some(layout)) => Outcome::transfer_if(
            matches!(layout.ip, nt::IpHdr::V4(_)),
            SNAT,
            Flow {
                l3: layout.l3 as u16,
                l4: layout.l4 as u16,
                check_offset: layout.check_offset() as u16,
                proto: layout.proto.0,
            },
            Disposition::Pass,
        ),
        Ok(None) => Disposition::Pass.into(),
        Err(_) => Disposition::Drop.into(),
    }
}

/// Rewrites the source using only the offsets `classify` handed over
fn snat(inv: &mut Invocation<'_, '_>, ctx: Flow) -> Outcome<Flow> {
    let at = Snat4Offsets {
        l3: ctx.l3 as usize,
        l4: ctx.l4 as usize,
        check: ctx.check_offset as usize,
        proto: nt::IpProto(ctx.proto),
    };

    match test_utils::snat4_at(inv.packet, at, NAT_SOURCE, NAT_PORT) {
        Ok(()) => Disposition::Tx.into(),
        Err(_) => Disposition::Aborted.into(),
    }
}

/// A pipeline shared by several threads, each running its own packets
/// through it and counting into the same shared state
#[test]
fn shared_between_threads() {
    init_logging();

    let mut builder = DispatchTableBuilder::<Flow, 2>::new();
    builder
        .register(CLASSIFY, classify)
        .unwrap()
        .register(SNAT, snat)
        .unwrap();
    let pipeline = Pipeline::new(builder.build(), PipelineConfig::default()).unwrap();
    let counters = CounterArray::<16>::new();

    std::thread::scope(|s| {
        for thread in 0..4u8 {
            let pipeline = &pipeline;
            let counters = &counters;

            s.spawn(move || {
                let mut buf = [0u8; BUFFER_SIZE];
                for i in 0..50u16 {
                    let mut packet = testing_view(&mut buf);
                    let source = ([10, 0, thread, i as u8], 1024 + i);
                    let destination = ([10, 1, 0, 1], 53);

                    if i % 2 == 0 {
                        test_utils::write_udp4(&mut packet, source, destination, IPV4_DATA);
                    } else {
                        test_utils::write_tcp4(&mut packet, source, destination, LARGER);
                    }

                    let verdict = pipeline.run(
                        &mut packet,
                        IngressMeta {
                            ifindex: 1,
                            rx_queue: thread as u32,
                        },
                        counters,
                    );
                    assert_eq!(verdict.disposition, Disposition::Tx);
                    assert_eq!(verdict.transfers, 1);

                    assert!(test_utils::checksums_valid(&packet));
                    let ip = test_utils::ipv4_header(&packet);
                    assert_eq!(ip.source.host().to_be_bytes(), NAT_SOURCE);
                }
            });
        }
    });

    assert_eq!(counters.counter(Counter::Tx), 200);
    assert_eq!(counters.counter(Counter::Stage(CLASSIFY)), 200);
    assert_eq!(counters.counter(Counter::Stage(SNAT)), 200);
    assert_eq!(counters.counter(Counter::Aborted), 0);
}

/// Packets that aren't IPv4 UDP/TCP are passed without entering the NAT stage
#[test]
fn passes_unhandled_packets() {
    init_logging();

    let mut builder = DispatchTableBuilder::<Flow, 2>::new();
    builder
        .register(CLASSIFY, classify)
        .unwrap()
        .register(SNAT, snat)
        .unwrap();
    let pipeline = Pipeline::new(builder.build(), PipelineConfig::default()).unwrap();
    let counters = CounterArray::<16>::new();

    let mut buf = [0u8; BUFFER_SIZE];
    let mut packet = testing_view(&mut buf);
    etherparse::PacketBuilder::ethernet2(SRC_MAC.0, DST_MAC.0)
        .ipv6([1; 16], [2; 16], 64)
        .udp(1000, 2000)
        .write(&mut packet, IPV6_DATA)
        .unwrap();
    let before = packet.to_vec();

    let verdict = pipeline.run(&mut packet, IngressMeta::default(), &counters);
    assert_eq!(verdict.disposition, Disposition::Pass);
    assert_eq!(verdict.transfers, 0);
    assert_eq!(&packet[..], before.as_slice());

    // Truncated
    packet.adjust_tail(-4).unwrap();
    let verdict = pipeline.run(&mut packet, IngressMeta::default(), &counters);
    assert_eq!(verdict.disposition, Disposition::Drop);

    assert_eq!(counters.counter(Counter::Stage(SNAT)), 0);
    assert_eq!(counters.counter(Counter::Pass), 1);
    assert_eq!(counters.counter(Counter::Drop), 1);
}
