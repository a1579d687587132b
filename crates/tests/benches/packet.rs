use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use pktpipe::{
    CounterArray, DispatchTableBuilder, Disposition, IngressMeta, Invocation, Outcome,
    PacketView, Pipeline, PipelineConfig, packet::net_types as nt,
};
use std::hint::black_box;

const SIZES: &[usize] = &[
    0, 1, 10, 32, 33, 63, 72, 80, 81, 127, 128, 256, 512, 773, 919, 1024, 1409,
];

fn generate(packet: &mut PacketView<'_>, len: usize, ipv4: bool) {
    const PAYLOAD: &[u8] = &[0xc0; 2048];

    let builder = etherparse::PacketBuilder::ethernet2([1, 1, 1, 1, 1, 1], [2, 2, 2, 2, 2, 2]);
    let builder = if ipv4 {
        builder.ipv4([192, 168, 1, 139], [192, 168, 1, 1], 64)
    } else {
        builder.ipv6([1; 16], [3; 16], 64)
    };

    builder
        .udp(8888, 54321)
        .write(packet, &PAYLOAD[..len])
        .unwrap();
}

#[inline]
fn swap_copy(packet: &mut PacketView<'_>) {
    let layout = nt::L4Layout::parse_view(packet).unwrap().unwrap();
    let eth = packet.read::<nt::EthHdr>(0).unwrap();

    packet.write(0, eth.swapped()).unwrap();

    match layout.ip.swapped() {
        nt::IpHdr::V4(v4) => packet.write(layout.l3, v4).unwrap(),
        nt::IpHdr::V6(v6) => packet.write(layout.l3, v6).unwrap(),
    }

    let udp = packet.read::<nt::UdpHdr>(layout.l4).unwrap();
    packet.write(layout.l4, udp.swapped()).unwrap();
}

/// Pushes and pops an 8 byte header in front of the packet
#[inline]
fn push_pop(packet: &mut PacketView<'_>) {
    packet.adjust_head(-8).unwrap();
    packet.write(0, 0xfeedfacecafebeefu64).unwrap();
    packet.adjust_head(8).unwrap();
}

/// Inserts and removes an IPv4 header between the Ethernet and IP headers
#[inline]
fn encap_decap(packet: &mut PacketView<'_>) {
    packet
        .adjust_room(nt::EthHdr::LEN, nt::Ipv4Hdr::LEN as i32)
        .unwrap();
    packet
        .adjust_room(nt::EthHdr::LEN, -(nt::Ipv4Hdr::LEN as i32))
        .unwrap();
}

fn reflect(inv: &mut Invocation<'_, '_>, _ctx: ()) -> Outcome<()> {
    swap_copy(inv.packet);
    Disposition::Tx.into()
}

fn classify(_inv: &mut Invocation<'_, '_>, ctx: ()) -> Outcome<()> {
    Outcome::transfer(1, ctx)
}

fn bench_packet(c: &mut Criterion) {
    let mut group = c.benchmark_group("packet");
    let mut buf = [0; 2048];

    for &i in SIZES {
        for ipv4 in [true, false] {
            let mut packet = PacketView::new(&mut buf, 256, 0).unwrap();
            generate(&mut packet, i, ipv4);

            let version = if ipv4 { "ipv4" } else { "ipv6" };
            group.bench_function(BenchmarkId::new(format!("{version} copy"), i), |b| {
                b.iter(|| swap_copy(black_box(&mut packet)));
            });
            group.bench_function(BenchmarkId::new(format!("{version} push pop"), i), |b| {
                b.iter(|| push_pop(black_box(&mut packet)));
            });
            group.bench_function(BenchmarkId::new(format!("{version} encap"), i), |b| {
                b.iter(|| encap_decap(black_box(&mut packet)));
            });
        }
    }
    group.finish();
}

fn bench_pipeline(c: &mut Criterion) {
    let mut builder = DispatchTableBuilder::<(), 4>::new();
    builder
        .register(0, classify)
        .unwrap()
        .register(1, reflect)
        .unwrap();
    let pipeline = Pipeline::new(builder.build(), PipelineConfig::default()).unwrap();
    let counters = CounterArray::<16>::new();

    let mut buf = [0; 2048];
    let mut packet = PacketView::new(&mut buf, 256, 0).unwrap();
    generate(&mut packet, 128, true);

    c.bench_function("pipeline reflect", |b| {
        b.iter(|| {
            let verdict = pipeline.run(black_box(&mut packet), IngressMeta::default(), &counters);
            debug_assert_eq!(verdict.disposition, Disposition::Tx);
        });
    });
}

criterion_group!(benches, bench_packet, bench_pipeline);
criterion_main!(benches);
