//! Utilities for calculating and incrementally maintaining
//! [internet checksums](https://en.wikipedia.org/wiki/Internet_checksum)
//!
//! Running sums are accumulated over native endian words, so a value returned
//! by [`finalize`] can be stored as-is in a `u16` checksum field of a
//! [`Pod`](super::Pod) header (or via `to_ne_bytes`) and end up in network
//! order in the packet.

use super::{PacketError, PacketView, net_types as nt};
use std::fmt;

/// Errors that can occur when incrementally updating a checksum
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ChecksumError {
    /// Attempted to remove more bytes from a running checksum than were ever
    /// added to it
    Underflow {
        /// The number of bytes that were to be removed
        removed: usize,
        /// The number of bytes covered by the checksum
        covered: usize,
    },
    /// The old and new values of an overwritten field differ in length
    LengthMismatch {
        /// Length of the previous value
        old: usize,
        /// Length of the replacement value
        new: usize,
    },
    /// The overwritten field is not inside the range covered by the checksum
    Uncovered {
        /// Offset of the field relative to the start of the covered range
        offset: usize,
        /// Length of the field
        size: usize,
        /// The number of bytes covered by the checksum
        covered: usize,
    },
}

impl ChecksumError {
    /// Gets a static string description of the error
    #[inline]
    pub fn discriminant(&self) -> &'static str {
        match self {
            Self::Underflow { .. } => "checksum underflow",
            Self::LengthMismatch { .. } => "length mismatch",
            Self::Uncovered { .. } => "field not covered",
        }
    }
}

impl fmt::Display for ChecksumError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Underflow { removed, covered } => write!(
                f,
                "unable to remove {removed} byte(s) from a checksum covering {covered}"
            ),
            Self::LengthMismatch { old, new } => {
                write!(f, "old value is {old} byte(s) but new value is {new}")
            }
            Self::Uncovered {
                offset,
                size,
                covered,
            } => write!(
                f,
                "field of {size} byte(s) at {offset} is outside the {covered} byte(s) covered"
            ),
        }
    }
}

impl std::error::Error for ChecksumError {}

/// Folds a running checksum calculation to a 16-bit value appropriate for use
/// in a checksum field
#[inline]
pub fn fold_checksum(mut csum: u32) -> u16 {
    csum = (csum & 0xffff) + (csum >> 16);
    csum = (csum & 0xffff) + (csum >> 16);
    !csum as u16
}

/// Folds a running checksum calculation to 16-bits without taking the
/// complement
#[inline]
pub fn to_u16(mut csum: u32) -> u16 {
    csum = csum.wrapping_add(csum.rotate_left(16));
    (csum >> 16) as u16
}

/// Add with end-around carry
#[inline]
pub fn add(a: u32, b: u32) -> u32 {
    let (sum, carry) = a.overflowing_add(b);
    sum + carry as u32
}

/// Subtract with end-around borrow
#[inline]
pub fn sub(a: u32, b: u32) -> u32 {
    add(a, !b)
}

/// Reduces the intermediate 64-bit sum to 32-bits that can be fed into
/// further calculations
#[inline]
fn reduce(sum: u64) -> u32 {
    (sum.wrapping_add(sum.rotate_right(32)) >> 32) as u32
}

#[inline]
fn add64(sum: u64, word: u64) -> u64 {
    let (sum, carry) = sum.overflowing_add(word);
    sum + carry as u64
}

/// Calculates the internet checksum for the specified block of bytes, appending
/// it to the previous checksum calculation
///
/// An odd trailing byte is padded with a zero byte. The number of iterations is
/// bounded by `buf.len() / 8`.
pub fn partial(buf: &[u8], sum: u32) -> u32 {
    let mut sum = sum as u64;

    let mut chunks = buf.chunks_exact(8);
    for chunk in &mut chunks {
        let mut word = [0u8; 8];
        word.copy_from_slice(chunk);
        sum = add64(sum, u64::from_ne_bytes(word));
    }

    let rem = chunks.remainder();
    if !rem.is_empty() {
        let mut trail = [0u8; 8];
        trail[..rem.len()].copy_from_slice(rem);
        sum = add64(sum, u64::from_ne_bytes(trail));
    }

    reduce(sum)
}

/// [`partial`] with the running sum first, matching [`update_on_overwrite`]
#[inline]
pub fn fold(sum: u32, bytes: &[u8]) -> u32 {
    partial(bytes, sum)
}

/// Converts a running sum into the value to store in a checksum field
#[inline]
pub fn finalize(sum: u32) -> u16 {
    fold_checksum(sum)
}

/// [`finalize`], but substituting all ones for a zero result
///
/// For protocols such as UDP a zero checksum field means "no checksum", and
/// all 1s is equivalent to 0 in one's complement arithmetic
#[inline]
pub fn finalize_nonzero(sum: u32) -> u16 {
    match fold_checksum(sum) {
        0 => 0xffff,
        csum => csum,
    }
}

/// Checks whether a block of bytes that includes its own stored checksum
/// is valid
#[inline]
pub fn verify(bytes: &[u8]) -> bool {
    fold_checksum(partial(bytes, 0)) == 0
}

/// Equivalent of [`bpf_csum_diff`](https://docs.ebpf.io/linux/helper-function/bpf_csum_diff/)
///
/// This method allows adding and/or removing bytes in a running checksum calculation
/// so that the entirety of the checksum doesn't need to be recalculated
#[inline]
pub fn diff(from: &[u8], to: &[u8], seed: u32) -> u32 {
    match (from.is_empty(), to.is_empty()) {
        (false, false) => sub(partial(to, seed), partial(from, 0)),
        (true, false) => partial(to, seed),
        (false, true) => sub(seed, partial(from, 0)),
        (true, true) => seed,
    }
}

/// Replaces the contribution of `old` with that of `new` in a running sum
///
/// `field_offset` is the offset of the field relative to the start of the
/// range the sum covers, fields at odd offsets contribute byte-swapped words
///
/// The result is equal to a sum computed from scratch in one's complement
/// arithmetic, which has two zeros. When every covered byte ends up zero the
/// updated sum can be `0xffff` (finalizing to `0x0000`) where a fresh sum is
/// `0` (finalizing to `0xffff`).
///
/// # Errors
///
/// `old` and `new` have different lengths
pub fn update_on_overwrite(
    sum: u32,
    field_offset: usize,
    old: &[u8],
    new: &[u8],
) -> Result<u32, ChecksumError> {
    if old.len() != new.len() {
        return Err(ChecksumError::LengthMismatch {
            old: old.len(),
            new: new.len(),
        });
    }

    let delta = at_offset(sub(partial(new, 0), partial(old, 0)), field_offset);
    Ok(add(sum, delta))
}

/// Aligns a sum computed as if starting at an even offset to `offset`
#[inline]
fn at_offset(sum: u32, offset: usize) -> u32 {
    if offset & 1 == 0 {
        sum
    } else {
        to_u16(sum).swap_bytes() as u32
    }
}

/// The sum of the [IPv4 pseudo header](https://en.wikipedia.org/wiki/User_Datagram_Protocol#IPv4_pseudo_header)
/// used by transport layer checksums, `length` being the length of the
/// transport header + payload
#[inline]
pub fn pseudo_header_v4(
    source: [u8; 4],
    destination: [u8; 4],
    proto: nt::IpProto,
    length: u16,
) -> u32 {
    let mut sum = partial(&source, 0);
    sum = partial(&destination, sum);
    sum = partial(&[0, proto.0], sum);
    partial(&length.to_be_bytes(), sum)
}

/// The sum of the [IPv6 pseudo header](https://en.wikipedia.org/wiki/User_Datagram_Protocol#IPv6_pseudo_header)
/// used by transport layer checksums, `length` being the length of the
/// transport header + payload
#[inline]
pub fn pseudo_header_v6(
    source: &[u8; 16],
    destination: &[u8; 16],
    proto: nt::IpProto,
    length: u32,
) -> u32 {
    let mut sum = partial(source, 0);
    sum = partial(destination, sum);
    sum = partial(&length.to_be_bytes(), sum);
    partial(&[0, 0, 0, proto.0], sum)
}

/// A running checksum over a known number of bytes
///
/// Keeping track of the number of bytes covered allows removals and field
/// overwrites to be rejected rather than silently corrupting the sum, and
/// lets bytes appended at an odd offset be folded in at the right alignment.
///
/// As with [`update_on_overwrite`], an incrementally maintained checksum over
/// all zero bytes may finalize to `0x0000` rather than `0xffff`. Both are the
/// same value in one's complement arithmetic, [`Checksum::is_equivalent`]
/// compares with that in mind.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Checksum {
    sum: u32,
    covered: usize,
}

impl Checksum {
    /// An empty checksum, covering no bytes
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Computes a checksum from scratch over `bytes`
    #[inline]
    pub fn compute(bytes: &[u8]) -> Self {
        Self {
            sum: partial(bytes, 0),
            covered: bytes.len(),
        }
    }

    /// Seeds a checksum from the value currently stored in a checksum field
    /// that covers `covered` bytes (including the field itself)
    #[inline]
    pub fn from_field(check: u16, covered: usize) -> Self {
        Self {
            sum: (!check) as u32,
            covered,
        }
    }

    /// The raw running sum
    #[inline]
    pub fn sum(&self) -> u32 {
        self.sum
    }

    /// The number of bytes covered by the sum
    #[inline]
    pub fn covered(&self) -> usize {
        self.covered
    }

    /// Appends `bytes` to the end of the covered range
    #[inline]
    pub fn fold(&mut self, bytes: &[u8]) {
        self.sum = add(self.sum, at_offset(partial(bytes, 0), self.covered));
        self.covered += bytes.len();
    }

    /// Adds a precomputed sum, eg. a pseudo header, that is folded in before
    /// finalizing but is not part of the covered bytes
    #[inline]
    pub fn combine(&mut self, sum: u32) {
        self.sum = add(self.sum, sum);
    }

    /// Removes `bytes` from the end of the covered range, they must be the
    /// trailing bytes previously folded into the checksum
    ///
    /// # Errors
    ///
    /// More bytes would be removed than the checksum covers
    #[inline]
    pub fn remove(&mut self, bytes: &[u8]) -> Result<(), ChecksumError> {
        if bytes.len() > self.covered {
            return Err(ChecksumError::Underflow {
                removed: bytes.len(),
                covered: self.covered,
            });
        }

        let start = self.covered - bytes.len();
        self.sum = sub(self.sum, at_offset(partial(bytes, 0), start));
        self.covered = start;
        Ok(())
    }

    /// Incrementally replaces a field at `offset` within the covered range
    ///
    /// # Errors
    ///
    /// - The lengths of `old` and `new` differ
    /// - The field is not fully inside the covered range
    #[inline]
    pub fn update_on_overwrite(
        &mut self,
        offset: usize,
        old: &[u8],
        new: &[u8],
    ) -> Result<(), ChecksumError> {
        if offset > self.covered || old.len() > self.covered - offset {
            return Err(ChecksumError::Uncovered {
                offset,
                size: old.len(),
                covered: self.covered,
            });
        }

        self.sum = update_on_overwrite(self.sum, offset, old, new)?;
        Ok(())
    }

    /// True if the covered range includes a correct stored checksum
    #[inline]
    pub fn is_valid(&self) -> bool {
        fold_checksum(self.sum) == 0
    }

    /// True if both checksums cover the same number of bytes and their sums
    /// are equal in one's complement arithmetic, treating `0x0000` and
    /// `0xffff` as the same zero
    #[inline]
    pub fn is_equivalent(&self, other: &Self) -> bool {
        let zeroed = |sum| match to_u16(sum) {
            0xffff => 0,
            folded => folded,
        };

        self.covered == other.covered && zeroed(self.sum) == zeroed(other.sum)
    }

    /// The value to store in the checksum field
    #[inline]
    pub fn finalize(&self) -> u16 {
        finalize(self.sum)
    }

    /// The value to store in the checksum field, never zero
    #[inline]
    pub fn finalize_nonzero(&self) -> u16 {
        finalize_nonzero(self.sum)
    }
}

/// Errors that can occur during transport checksum calculation
#[derive(Debug)]
pub enum L4CalcError {
    /// Not an IP packet
    NotIp(nt::EtherType),
    /// Not a UDP or TCP packet
    NotL4(nt::IpProto),
    /// Packet data was invalid/corrupt
    Packet(PacketError),
}

impl fmt::Display for L4CalcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotIp(et) => {
                write!(f, "not an IP packet, but a {et:?}")
            }
            Self::NotL4(proto) => {
                write!(f, "not a UDP or TCP packet, but a {proto:?}")
            }
            Self::Packet(pe) => {
                write!(f, "failed to parse packet: {pe}")
            }
        }
    }
}

impl std::error::Error for L4CalcError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Packet(pe) => Some(pe),
            _ => None,
        }
    }
}

impl From<PacketError> for L4CalcError {
    #[inline]
    fn from(value: PacketError) -> Self {
        Self::Packet(value)
    }
}

impl PacketView<'_> {
    /// Equivalent of [`bpf_l3_csum_replace`](https://docs.ebpf.io/linux/helper-function/bpf_l3_csum_replace/)
    ///
    /// Fixes the checksum stored at `check_offset` after a field covered by it,
    /// located at an even offset from the start of the covered range, changed
    /// from `from` to `to`. The field itself must already have been written.
    ///
    /// # Errors
    ///
    /// - The checksum field is not within the packet
    /// - `from` and `to` differ in length
    #[inline]
    pub fn l3_replace(
        &mut self,
        check_offset: usize,
        from: &[u8],
        to: &[u8],
    ) -> Result<(), crate::Error> {
        let check = u16::from_ne_bytes(self.array_at_offset(check_offset)?);
        let sum = update_on_overwrite((!check) as u32, 0, from, to)?;
        self.write(check_offset, finalize(sum))?;
        Ok(())
    }

    /// Equivalent of [`bpf_l4_csum_replace`](https://docs.ebpf.io/linux/helper-function/bpf_l4_csum_replace/)
    ///
    /// The same as [`Self::l3_replace`], but for UDP a zero checksum, meaning
    /// no checksum is present, is left untouched, and a computed checksum is
    /// never stored as zero (`BPF_F_MARK_MANGLED_0`)
    ///
    /// # Errors
    ///
    /// - The checksum field is not within the packet
    /// - `from` and `to` differ in length
    #[inline]
    pub fn l4_replace(
        &mut self,
        check_offset: usize,
        from: &[u8],
        to: &[u8],
        proto: nt::IpProto,
    ) -> Result<(), crate::Error> {
        let check = u16::from_ne_bytes(self.array_at_offset(check_offset)?);
        let mangled_zero = proto == nt::IpProto::UDP;
        if mangled_zero && check == 0 {
            // Still validate the lengths so callers get consistent errors
            update_on_overwrite(0, 0, from, to)?;
            return Ok(());
        }

        let sum = update_on_overwrite((!check) as u32, 0, from, to)?;
        let check = if mangled_zero {
            finalize_nonzero(sum)
        } else {
            finalize(sum)
        };
        self.write(check_offset, check)?;
        Ok(())
    }

    /// Overwrites bytes at `offset` while keeping `csum`, which covers the
    /// packet range beginning at `covered_start`, up to date
    ///
    /// This is the equivalent of [`bpf_skb_store_bytes`](https://docs.ebpf.io/linux/helper-function/bpf_skb_store_bytes/)
    /// with checksum recomputation. Nothing is written if any check fails.
    ///
    /// # Errors
    ///
    /// - The write is not within the packet
    /// - The write is not within the range covered by `csum`
    pub fn store_bytes(
        &mut self,
        offset: usize,
        bytes: &[u8],
        csum: &mut Checksum,
        covered_start: usize,
    ) -> Result<(), crate::Error> {
        let relative = offset
            .checked_sub(covered_start)
            .ok_or(ChecksumError::Uncovered {
                offset,
                size: bytes.len(),
                covered: csum.covered(),
            })?;

        let mut updated = *csum;
        {
            let old = self.slice_at_offset(offset, bytes.len())?;
            updated.update_on_overwrite(relative, old, bytes)?;
        }

        self.write_slice(offset, bytes)?;
        *csum = updated;
        Ok(())
    }

    /// Recalculates and stores the IPv4 header checksum for the header at
    /// `offset`, returning the new checksum
    ///
    /// # Errors
    ///
    /// The header, including options, is not within the packet
    pub fn calc_ipv4_checksum(&mut self, offset: usize) -> Result<u16, PacketError> {
        let ipv4 = self.read::<nt::Ipv4Hdr>(offset)?;
        let ihl = ipv4.internet_header_length() as usize;
        let check_offset = offset + std::mem::offset_of!(nt::Ipv4Hdr, check);

        self.write(check_offset, 0u16)?;
        let check = fold_checksum(partial(self.slice_at_offset(offset, ihl)?, 0));
        self.write(check_offset, check)?;
        Ok(check)
    }

    /// Performs a full calculation of the UDP or TCP checksum, storing it in
    /// the transport header and returning it
    ///
    /// This method is here for convenience, stages that rewrite individual
    /// fields should prefer [`Self::l4_replace`] or [`Checksum`] updates
    pub fn calc_l4_checksum(&mut self) -> Result<u16, L4CalcError> {
        let eth = self.read::<nt::EthHdr>(0)?;
        let proto = match eth.ether_type {
            nt::EtherType::IPV4 => self.read::<nt::Ipv4Hdr>(nt::EthHdr::LEN)?.proto,
            nt::EtherType::IPV6 => self.read::<nt::Ipv6Hdr>(nt::EthHdr::LEN)?.next_header,
            other => return Err(L4CalcError::NotIp(other)),
        };

        let layout = nt::L4Layout::parse_view(self)?.ok_or(L4CalcError::NotL4(proto))?;

        let pseudo = layout.pseudo_header();

        let check_offset = layout.check_offset();
        self.write(check_offset, 0u16)?;

        let sum = partial(self.slice_at_offset(layout.l4, layout.l4_length)?, pseudo);

        // If the checksum calculation results in the value zero (all 16 bits 0)
        // it should be sent as the ones' complement (all 1s) as a zero-value
        // checksum indicates no checksum has been calculated
        let check = if layout.proto == nt::IpProto::UDP {
            finalize_nonzero(sum)
        } else {
            finalize(sum)
        };

        self.write(check_offset, check)?;
        Ok(check)
    }
}
