pub use etherparse;
use pktpipe::{
    PacketView,
    packet::{csum, net_types as nt},
};

static LOGGER: std::sync::Once = std::sync::Once::new();

/// The size of every test buffer
pub const BUFFER_SIZE: usize = 2 * 1024;
/// The headroom reserved in front of every test packet, the same as
/// `XDP_PACKET_HEADROOM`
pub const HEADROOM: usize = 256;

/// Installs the logger the first time it is called, so tests can see the
/// trampoline's output with `RUST_LOG=trace`
pub fn init_logging() {
    LOGGER.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}

/// Creates an empty packet view over `buf`, with [`HEADROOM`] bytes of headroom
pub fn testing_view(buf: &mut [u8]) -> PacketView<'_> {
    assert_eq!(buf.len(), BUFFER_SIZE);
    PacketView::new(buf, HEADROOM, 0).expect("headroom fits in the buffer")
}

/// Writes an Ethernet + IPv4 + UDP frame into the (empty) packet
pub fn write_udp4(
    packet: &mut PacketView<'_>,
    source: ([u8; 4], u16),
    destination: ([u8; 4], u16),
    payload: &[u8],
) {
    etherparse::PacketBuilder::ethernet2([1; 6], [2; 6])
        .ipv4(source.0, destination.0, 64)
        .udp(source.1, destination.1)
        .write(packet, payload)
        .expect("failed to write UDP packet");
}

/// Writes an Ethernet + IPv4 + TCP frame into the (empty) packet
pub fn write_tcp4(
    packet: &mut PacketView<'_>,
    source: ([u8; 4], u16),
    destination: ([u8; 4], u16),
    payload: &[u8],
) {
    etherparse::PacketBuilder::ethernet2([1; 6], [2; 6])
        .ipv4(source.0, destination.0, 64)
        .tcp(source.1, destination.1, 0x1234_5678, 4096)
        .write(packet, payload)
        .expect("failed to write TCP packet");
}

/// Rewrites the IPv4 source address and transport source port of the packet
/// in place, incrementally fixing every affected checksum
pub fn snat4(
    packet: &mut PacketView<'_>,
    source: [u8; 4],
    port: u16,
) -> Result<(), pktpipe::Error> {
    let layout = nt::L4Layout::parse_view(packet)?.expect("not a UDP or TCP packet");
    let offsets = Snat4Offsets {
        l3: layout.l3,
        l4: layout.l4,
        check: layout.check_offset(),
        proto: layout.proto,
    };

    snat4_at(packet, offsets, source, port)
}

/// Where [`snat4_at`] finds the fields it rewrites
#[derive(Copy, Clone, Debug)]
pub struct Snat4Offsets {
    /// Offset of the IPv4 header
    pub l3: usize,
    /// Offset of the transport header
    pub l4: usize,
    /// Offset of the transport checksum
    pub check: usize,
    /// The transport protocol
    pub proto: nt::IpProto,
}

/// [`snat4`] for a packet that has already been parsed
pub fn snat4_at(
    packet: &mut PacketView<'_>,
    at: Snat4Offsets,
    source: [u8; 4],
    port: u16,
) -> Result<(), pktpipe::Error> {
    let addr_offset = at.l3 + nt::Ipv4Hdr::SOURCE_OFFSET;
    let old_addr = packet.array_at_offset::<4>(addr_offset)?;
    packet.write(addr_offset, source)?;

    packet.l3_replace(at.l3 + nt::Ipv4Hdr::CHECK_OFFSET, &old_addr, &source)?;
    packet.l4_replace(at.check, &old_addr, &source, at.proto)?;

    let old_port = packet.array_at_offset::<2>(at.l4)?;
    let new_port = port.to_be_bytes();
    packet.write(at.l4, new_port)?;
    packet.l4_replace(at.check, &old_port, &new_port, at.proto)?;

    Ok(())
}

/// Checks the IPv4 header checksum and transport checksum of the packet
/// without modifying it
pub fn checksums_valid(packet: &PacketView<'_>) -> bool {
    let Ok(Some(layout)) = nt::L4Layout::parse_view(packet) else {
        return false;
    };

    let nt::IpHdr::V4(v4) = layout.ip else {
        return false;
    };

    let ihl = v4.internet_header_length() as usize;
    let header = packet.slice_at_offset(layout.l3, ihl).expect("header in bounds");
    if !csum::verify(header) {
        return false;
    }

    let transport = packet
        .slice_at_offset(layout.l4, layout.l4_length)
        .expect("transport in bounds");
    csum::fold_checksum(csum::partial(transport, layout.pseudo_header())) == 0
}

/// Reads the IPv4 header of an Ethernet frame
pub fn ipv4_header(packet: &PacketView<'_>) -> nt::Ipv4Hdr {
    packet
        .read::<nt::Ipv4Hdr>(nt::EthHdr::LEN)
        .expect("IPv4 header in bounds")
}
