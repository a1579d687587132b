//! This is a minimal set of type definitions/helpers for the network headers
//! stages most commonly read and rewrite
//!
//! Every header is a [`Pod`], and fields that can hold arbitrary values on the
//! wire (eg. [`EtherType`], [`IpProto`]) are plain integer wrappers rather
//! than enums, so reading them from untrusted packet bytes is always valid.

use super::{PacketError, PacketView, Pod, csum};
use std::{fmt, mem::size_of};

macro_rules! len {
    ($record:ty) => {
        // SAFETY: We only use this macro on types it is safe for
        unsafe impl Pod for $record {}

        impl $record {
            /// The length in bytes of this type
            pub const LEN: usize = size_of::<$record>();
        }
    };
}

macro_rules! net_int {
    ($name:ident, $int:ty, $fmt:literal) => {
        /// Wrapper around a network order integer
        #[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
        #[repr(transparent)]
        pub struct $name(pub $int);

        impl $name {
            /// Gets the type in host order
            #[inline]
            pub fn host(self) -> $int {
                <$int>::from_be(self.0)
            }
        }

        impl From<$int> for $name {
            #[inline]
            fn from(v: $int) -> Self {
                Self(v.to_be())
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.host())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, $fmt, self.host())
            }
        }
    };
}

net_int!(NetworkU16, u16, "{:04x}");
net_int!(NetworkU32, u32, "{:08x}");

/// A [MAC address](https://en.wikipedia.org/wiki/MAC_address)
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
#[repr(C)]
pub struct MacAddress(pub [u8; 6]);

impl fmt::Debug for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

/// The [payload](https://en.wikipedia.org/wiki/EtherType) for an Ethernet frame,
/// stored in network order
#[derive(PartialEq, Eq, Copy, Clone)]
#[repr(transparent)]
pub struct EtherType(pub u16);

impl EtherType {
    /// The payload is an [`Ipv4Hdr`]
    pub const IPV4: Self = Self(0x0800_u16.to_be());
    /// [Address Resolution Protocol](https://en.wikipedia.org/wiki/Address_Resolution_Protocol)
    pub const ARP: Self = Self(0x0806_u16.to_be());
    /// The payload is an [`Ipv6Hdr`]
    pub const IPV6: Self = Self(0x86DD_u16.to_be());
}

impl fmt::Debug for EtherType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::IPV4 => f.write_str("Ipv4"),
            Self::ARP => f.write_str("Arp"),
            Self::IPV6 => f.write_str("Ipv6"),
            Self(other) => write!(f, "EtherType({:#06x})", u16::from_be(other)),
        }
    }
}

/// An [Ethernet II](https://en.wikipedia.org/wiki/Ethernet_frame#Ethernet_II) header
#[derive(Copy, Clone)]
#[cfg_attr(feature = "__debug", derive(Debug))]
#[repr(C)]
pub struct EthHdr {
    /// The destination MAC address
    pub destination: MacAddress,
    /// The source MAC address
    pub source: MacAddress,
    /// The [`EtherType`] determines the rest of the payload
    pub ether_type: EtherType,
}

len!(EthHdr);

impl EthHdr {
    /// Creates a new [`Self`] with the source and destination addresses swapped
    #[inline]
    pub fn swapped(&self) -> Self {
        Self {
            destination: self.source,
            source: self.destination,
            ether_type: self.ether_type,
        }
    }
}

/// The transport layer protocol encapsulated in an IPv4 or IPv6 packet
///
/// <https://en.wikipedia.org/wiki/List_of_IP_protocol_numbers>
#[derive(PartialEq, Eq, Copy, Clone)]
#[repr(transparent)]
pub struct IpProto(pub u8);

// SAFETY: a single byte
unsafe impl Pod for IpProto {}

impl IpProto {
    /// Internet Control Message
    pub const ICMP: Self = Self(1);
    /// IPv4 encapsulation
    pub const IPV4: Self = Self(4);
    /// Transmission Control
    pub const TCP: Self = Self(6);
    /// [User Datagram](struct@UdpHdr)
    pub const UDP: Self = Self(17);
    /// IPv6 encapsulation
    pub const IPV6: Self = Self(41);
    /// Generic Routing Encapsulation
    pub const GRE: Self = Self(47);
    /// ICMP for IPv6
    pub const IPV6_ICMP: Self = Self(58);
}

impl fmt::Debug for IpProto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::ICMP => f.write_str("Icmp"),
            Self::IPV4 => f.write_str("Ipv4"),
            Self::TCP => f.write_str("Tcp"),
            Self::UDP => f.write_str("Udp"),
            Self::IPV6 => f.write_str("Ipv6"),
            Self::GRE => f.write_str("Gre"),
            Self::IPV6_ICMP => f.write_str("Ipv6Icmp"),
            Self(other) => write!(f, "IpProto({other})"),
        }
    }
}

/// The [IPv4](https://en.wikipedia.org/wiki/IPv4) header
#[derive(Copy, Clone)]
#[repr(C)]
pub struct Ipv4Hdr {
    bitfield: u16,
    /// The length of the header, options, and payload
    pub total_length: NetworkU16,
    /// Fragment identification
    pub identification: NetworkU16,
    fragment: u16,
    /// Hop limit
    #[doc(alias = "ttl")]
    pub time_to_live: u8,
    /// The protocol of the payload
    pub proto: IpProto,
    /// The header checksum, covering only the header and its options
    pub check: u16,
    /// The source address
    pub source: NetworkU32,
    /// The destination address
    pub destination: NetworkU32,
}

impl Ipv4Hdr {
    /// Byte offset of [`Self::check`] within the header
    pub const CHECK_OFFSET: usize = std::mem::offset_of!(Self, check);
    /// Byte offset of [`Self::source`] within the header
    pub const SOURCE_OFFSET: usize = std::mem::offset_of!(Self, source);
    /// Byte offset of [`Self::destination`] within the header
    pub const DESTINATION_OFFSET: usize = std::mem::offset_of!(Self, destination);

    /// Resets the header to a 20 byte IPv4 header with no options
    #[inline]
    pub fn reset(&mut self, ttl: u8, proto: IpProto) {
        *self = Self::zeroed();
        self.bitfield = 0x0045;
        self.time_to_live = ttl;
        self.proto = proto;
    }

    /// The length of the header, including options, in bytes
    #[doc(alias = "ihl")]
    #[inline]
    pub fn internet_header_length(&self) -> u8 {
        ((self.bitfield & 0x000f) * 4) as u8
    }

    /// Calculates the checksum of a header without options
    #[inline]
    pub fn calc_checksum(&mut self) {
        self.check = 0;
        self.check = csum::fold_checksum(csum::partial(self.as_bytes(), 0));
    }

    /// Creates a copy of the header with the addresses swapped
    #[inline]
    pub fn swapped(&self) -> Self {
        let mut new = *self;
        new.source = self.destination;
        new.destination = self.source;
        new
    }
}

len!(Ipv4Hdr);

#[cfg(feature = "__debug")]
impl fmt::Debug for Ipv4Hdr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use std::net::Ipv4Addr;

        f.debug_struct("Ipv4Hdr")
            .field("total_length", &self.total_length)
            .field("proto", &self.proto)
            .field("ttl", &self.time_to_live)
            .field("check", &format_args!("{:04x}", self.check))
            .field("source", &Ipv4Addr::from_bits(self.source.host()))
            .field("destination", &Ipv4Addr::from_bits(self.destination.host()))
            .finish_non_exhaustive()
    }
}

/// The [IPv6](https://en.wikipedia.org/wiki/IPv6) header
#[derive(Copy, Clone)]
#[repr(C)]
pub struct Ipv6Hdr {
    bitfield: u32,
    /// The length of the payload, including extension headers
    pub payload_length: NetworkU16,
    /// The protocol of the payload
    pub next_header: IpProto,
    /// Hop limit
    pub hop_limit: u8,
    /// The source address
    pub source: [u8; 16],
    /// The destination address
    pub destination: [u8; 16],
}

impl Ipv6Hdr {
    /// Resets the header to an IPv6 header with no flow label
    #[inline]
    pub fn reset(&mut self, hop: u8, proto: IpProto) {
        *self = Self::zeroed();

        self.bitfield = 0x00000060;
        self.next_header = proto;
        self.hop_limit = hop;
    }

    /// Creates a copy of the header with the addresses swapped
    #[inline]
    pub fn swapped(&self) -> Self {
        let mut new = *self;
        new.source = self.destination;
        new.destination = self.source;
        new
    }
}

len!(Ipv6Hdr);

#[cfg(feature = "__debug")]
impl fmt::Debug for Ipv6Hdr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use std::net::Ipv6Addr;

        f.debug_struct("Ipv6Hdr")
            .field("payload_length", &self.payload_length)
            .field("next_header", &self.next_header)
            .field("hop_limit", &self.hop_limit)
            .field("source", &Ipv6Addr::from(self.source))
            .field("destination", &Ipv6Addr::from(self.destination))
            .finish_non_exhaustive()
    }
}

/// The [UDP](https://en.wikipedia.org/wiki/User_Datagram_Protocol) header
#[derive(Copy, Clone)]
#[repr(C)]
pub struct UdpHdr {
    /// The source port
    pub source: NetworkU16,
    /// The destination port
    pub destination: NetworkU16,
    /// The length of the header and payload
    pub length: NetworkU16,
    /// The checksum, zero if not calculated
    pub check: u16,
}

len!(UdpHdr);

impl UdpHdr {
    /// Byte offset of [`Self::check`] within the header
    pub const CHECK_OFFSET: usize = std::mem::offset_of!(Self, check);

    /// Creates a copy of the header with the ports swapped
    #[inline]
    pub fn swapped(&self) -> Self {
        Self {
            source: self.destination,
            destination: self.source,
            length: self.length,
            check: self.check,
        }
    }
}

#[cfg(feature = "__debug")]
impl fmt::Debug for UdpHdr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UdpHdr")
            .field("source", &self.source)
            .field("destination", &self.destination)
            .field("length", &self.length)
            .field("check", &format_args!("{:04x}", self.check))
            .finish()
    }
}

/// The [TCP](https://en.wikipedia.org/wiki/Transmission_Control_Protocol) header,
/// without options
#[derive(Copy, Clone)]
#[repr(C)]
pub struct TcpHdr {
    /// The source port
    pub source: NetworkU16,
    /// The destination port
    pub destination: NetworkU16,
    /// Sequence number
    pub sequence: NetworkU32,
    /// Acknowledgment number
    pub acknowledgment: NetworkU32,
    bitfield: u16,
    /// Receive window
    pub window: NetworkU16,
    /// The checksum, always present
    pub check: u16,
    /// Urgent pointer
    pub urgent: NetworkU16,
}

len!(TcpHdr);

impl TcpHdr {
    /// Byte offset of [`Self::check`] within the header
    pub const CHECK_OFFSET: usize = std::mem::offset_of!(Self, check);

    /// The length of the header, including options, in bytes
    #[inline]
    pub fn data_offset(&self) -> u8 {
        ((u16::from_be(self.bitfield) >> 12) * 4) as u8
    }
}

#[cfg(feature = "__debug")]
impl fmt::Debug for TcpHdr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpHdr")
            .field("source", &self.source)
            .field("destination", &self.destination)
            .field("sequence", &self.sequence)
            .field("window", &self.window)
            .field("check", &format_args!("{:04x}", self.check))
            .finish_non_exhaustive()
    }
}

/// An [`Ipv4Hdr`] or [`Ipv6Hdr`]
#[derive(Copy, Clone)]
#[cfg_attr(feature = "__debug", derive(Debug))]
pub enum IpHdr {
    /// IPv4
    V4(Ipv4Hdr),
    /// IPv6
    V6(Ipv6Hdr),
}

impl IpHdr {
    /// The protocol of the payload
    #[inline]
    pub fn proto(&self) -> IpProto {
        match self {
            Self::V4(v4) => v4.proto,
            Self::V6(v6) => v6.next_header,
        }
    }

    /// Creates a copy of the header with the addresses swapped
    #[inline]
    pub fn swapped(&self) -> Self {
        match self {
            Self::V4(v4) => Self::V4(v4.swapped()),
            Self::V6(v6) => Self::V6(v6.swapped()),
        }
    }

    /// Decrements the TTL/hop limit, saturating at zero, and returns the new value
    #[inline]
    pub fn decrement_hop(&mut self) -> u8 {
        let hop = match self {
            Self::V4(v4) => &mut v4.time_to_live,
            Self::V6(v6) => &mut v6.hop_limit,
        };

        if *hop != 0 {
            *hop -= 1;
        }

        *hop
    }
}

/// The location of the L3 and L4 (UDP or TCP) headers of an Ethernet frame
#[derive(Copy, Clone)]
#[cfg_attr(feature = "__debug", derive(Debug))]
pub struct L4Layout {
    /// The IP header
    pub ip: IpHdr,
    /// The transport protocol, either [`IpProto::UDP`] or [`IpProto::TCP`]
    pub proto: IpProto,
    /// The offset of the IP header
    pub l3: usize,
    /// The offset of the transport header
    pub l4: usize,
    /// The length of the transport header and payload, as stated by the IP header
    pub l4_length: usize,
}

impl L4Layout {
    /// Walks the Ethernet, IP, and transport headers of the packet
    ///
    /// Returns `None` if the packet is not a UDP or TCP packet over IPv4 or
    /// IPv6 (without extension headers)
    ///
    /// # Errors
    ///
    /// The lengths stated in the headers are not contained in the packet
    pub fn parse_view(view: &PacketView<'_>) -> Result<Option<Self>, PacketError> {
        let eth = view.read::<EthHdr>(0)?;
        let l3 = EthHdr::LEN;

        let (ip, l4, l4_length) = match eth.ether_type {
            EtherType::IPV4 => {
                let ipv4 = view.read::<Ipv4Hdr>(l3)?;
                let ihl = ipv4.internet_header_length() as usize;
                let total = ipv4.total_length.host() as usize;
                if ihl < Ipv4Hdr::LEN || total < ihl {
                    return Ok(None);
                }

                view.slice_at_offset(l3, total)?;
                (IpHdr::V4(ipv4), l3 + ihl, total - ihl)
            }
            EtherType::IPV6 => {
                let ipv6 = view.read::<Ipv6Hdr>(l3)?;
                let l4 = l3 + Ipv6Hdr::LEN;
                let payload = ipv6.payload_length.host() as usize;

                view.slice_at_offset(l4, payload)?;
                (IpHdr::V6(ipv6), l4, payload)
            }
            _ => return Ok(None),
        };

        let proto = ip.proto();
        match proto {
            IpProto::UDP => {
                let udp = view.read::<UdpHdr>(l4)?;
                let udp_len = udp.length.host() as usize;
                if udp_len != l4_length {
                    return Err(PacketError::OutOfBounds {
                        offset: l4,
                        size: udp_len,
                        length: l4_length,
                    });
                }
            }
            IpProto::TCP => {
                let tcp = view.read::<TcpHdr>(l4)?;
                let data_offset = tcp.data_offset() as usize;
                if data_offset < TcpHdr::LEN || data_offset > l4_length {
                    return Ok(None);
                }
            }
            _ => return Ok(None),
        }

        Ok(Some(Self {
            ip,
            proto,
            l3,
            l4,
            l4_length,
        }))
    }

    /// The offset of the transport checksum field
    #[inline]
    pub fn check_offset(&self) -> usize {
        self.l4
            + if self.proto == IpProto::UDP {
                UdpHdr::CHECK_OFFSET
            } else {
                TcpHdr::CHECK_OFFSET
            }
    }

    /// The offset of the IP source address
    #[inline]
    pub fn source_offset(&self) -> usize {
        self.l3
            + match self.ip {
                IpHdr::V4(_) => Ipv4Hdr::SOURCE_OFFSET,
                IpHdr::V6(_) => std::mem::offset_of!(Ipv6Hdr, source),
            }
    }

    /// The offset of the IP destination address
    #[inline]
    pub fn destination_offset(&self) -> usize {
        self.l3
            + match self.ip {
                IpHdr::V4(_) => Ipv4Hdr::DESTINATION_OFFSET,
                IpHdr::V6(_) => std::mem::offset_of!(Ipv6Hdr, destination),
            }
    }

    /// The sum of the pseudo header that is folded into the transport checksum
    #[inline]
    pub fn pseudo_header(&self) -> u32 {
        match &self.ip {
            IpHdr::V4(v4) => csum::pseudo_header_v4(
                v4.source.0.to_ne_bytes(),
                v4.destination.0.to_ne_bytes(),
                self.proto,
                self.l4_length as u16,
            ),
            IpHdr::V6(v6) => csum::pseudo_header_v6(
                &v6.source,
                &v6.destination,
                self.proto,
                self.l4_length as u32,
            ),
        }
    }
}
