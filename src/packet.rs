//! Bounds-checked reading and writing of [`PacketView`] contents

pub mod csum;
pub mod net_types;

use std::fmt;

/// Errors that can occur when reading/writing/resizing [`PacketView`] contents
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PacketError {
    /// The access or resize would touch bytes outside the currently valid
    /// contents of the packet
    OutOfBounds {
        /// The offset, relative to the packet head, the access starts at
        offset: usize,
        /// The number of bytes the access covers
        size: usize,
        /// The length of the valid contents at the time of the access
        length: usize,
    },
    /// The packet could not grow as there was not enough headroom or tailroom
    /// left in the underlying buffer
    ResizeDenied {
        /// The number of bytes the packet attempted to grow by
        diff: usize,
        /// The number of bytes that were actually available
        available: usize,
    },
}

impl PacketError {
    /// Gets a static string description of the error
    #[inline]
    pub fn discriminant(&self) -> &'static str {
        match self {
            Self::OutOfBounds { .. } => "out of bounds",
            Self::ResizeDenied { .. } => "resize denied",
        }
    }
}

impl std::error::Error for PacketError {}

impl fmt::Display for PacketError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfBounds {
                offset,
                size,
                length,
            } => write!(
                f,
                "access of {size} byte(s) at offset {offset} is outside the packet length {length}"
            ),
            Self::ResizeDenied { diff, available } => write!(
                f,
                "unable to grow the packet by {diff} byte(s), only {available} available"
            ),
        }
    }
}

/// Marker trait used to indicate the type is a POD and can be safely converted
/// to and from raw bytes
///
/// # Safety
///
/// See [`std::mem::zeroed`]. Every bit pattern of `size_of::<Self>()` bytes
/// must be a valid `Self`, and the type must not contain padding.
pub unsafe trait Pod: Copy + Sized {
    /// Gets the size of the type in bytes
    #[inline]
    fn size() -> usize {
        std::mem::size_of::<Self>()
    }

    /// Gets a zeroed [`Self`]
    #[inline]
    fn zeroed() -> Self {
        unsafe { std::mem::zeroed() }
    }

    /// Gets [`Self`] as a byte slice
    #[inline]
    fn as_bytes(&self) -> &[u8] {
        unsafe {
            std::slice::from_raw_parts((self as *const Self).cast(), std::mem::size_of::<Self>())
        }
    }
}

// SAFETY: plain integers and byte arrays are valid for every bit pattern
unsafe impl Pod for u8 {}
unsafe impl Pod for u16 {}
unsafe impl Pod for u32 {}
unsafe impl Pod for u64 {}
unsafe impl<const N: usize> Pod for [u8; N] {}

/// A bounded view over the packet data handed to a pipeline invocation
///
/// ```text
/// ┌──────────────────┌───────────────────────┌─────────────┐
/// │headroom          │packet                 │tailroom     │
/// └──────────────────└───────────────────────└─────────────┘
///                    ▲                       ▲
///                    │                       │
///                    head                    tail
/// ```
///
/// 1. `headroom` is the part of the buffer in front of the packet that the
///     packet can grow into, eg. to push an encapsulation header
/// 1. The packet portion is the actual contents. Every offset taken by the
///     accessors is relative to `head`, and every access is checked against
///     the _current_ `[head, tail)` range
/// 1. `tailroom` is the remainder of the buffer the packet can be extended into
///
/// The view never caches an absolute position across a resize. After any of
/// [`Self::adjust_head`], [`Self::adjust_tail`], [`Self::adjust_room`] or
/// [`Self::insert`] offsets computed before the call must be re-based by the
/// caller:
///
/// - `adjust_head(-d)` moves every existing byte from offset `o` to `o + d`
/// - `adjust_room(at, d)` leaves bytes before `at` alone and moves bytes at or
///     after `at` by `d`
/// - `adjust_tail` never moves existing bytes
pub struct PacketView<'buf> {
    /// The entire buffer, including headroom, packet contents and tailroom
    data: &'buf mut [u8],
    /// The offset in data where the packet starts
    head: usize,
    /// The offset in data where the packet ends
    tail: usize,
}

impl<'buf> PacketView<'buf> {
    /// Creates a view over `data` where the packet occupies
    /// `[headroom, headroom + len)`
    ///
    /// # Errors
    ///
    /// The packet range does not fit in `data`
    #[inline]
    pub fn new(data: &'buf mut [u8], headroom: usize, len: usize) -> Result<Self, PacketError> {
        if headroom > data.len() || len > data.len() - headroom {
            return Err(PacketError::OutOfBounds {
                offset: headroom,
                size: len,
                length: data.len(),
            });
        }

        Ok(Self {
            data,
            head: headroom,
            tail: headroom + len,
        })
    }

    /// Creates a view where the entirety of `data` is the packet, with no
    /// headroom or tailroom
    #[inline]
    pub fn from_slice(data: &'buf mut [u8]) -> Self {
        let tail = data.len();
        Self {
            data,
            head: 0,
            tail,
        }
    }

    /// The number of initialized/valid bytes in the packet
    #[inline]
    pub fn len(&self) -> usize {
        self.tail - self.head
    }

    /// True if the packet is empty
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    /// The total size of the underlying buffer
    #[inline]
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// The number of bytes the packet can grow by at the front
    #[inline]
    pub fn headroom(&self) -> usize {
        self.head
    }

    /// The number of bytes the packet can grow by at the back
    #[inline]
    pub fn tailroom(&self) -> usize {
        self.data.len() - self.tail
    }

    /// Resets the tail of this packet, causing it to become empty
    #[inline]
    pub fn clear(&mut self) {
        self.tail = self.head;
    }

    /// Validates that `[offset, offset + size)` lies within the current packet
    /// contents, returning the absolute position in the buffer it starts at
    #[inline]
    fn check(&self, offset: usize, size: usize) -> Result<usize, PacketError> {
        let length = self.len();
        if offset > length || size > length - offset {
            return Err(PacketError::OutOfBounds {
                offset,
                size,
                length,
            });
        }

        Ok(self.head + offset)
    }

    /// Adjust the head of the packet up or down by `diff` bytes
    ///
    /// This method is the equivalent of [`bpf_xdp_adjust_head`](https://docs.ebpf.io/linux/helper-function/bpf_xdp_adjust_head/),
    /// a negative `diff` grows the packet at the front (the new bytes are
    /// zeroed), a positive `diff` strips bytes from the front.
    ///
    /// # Errors
    ///
    /// - [`PacketError::ResizeDenied`] if there is not enough headroom
    /// - [`PacketError::OutOfBounds`] if more bytes than the packet holds
    ///     would be removed
    #[inline]
    pub fn adjust_head(&mut self, diff: i32) -> Result<(), PacketError> {
        let amount = diff.unsigned_abs() as usize;

        if diff < 0 {
            if amount > self.head {
                return Err(PacketError::ResizeDenied {
                    diff: amount,
                    available: self.head,
                });
            }

            self.head -= amount;
            self.data[self.head..self.head + amount].fill(0);
        } else {
            self.check(0, amount)?;
            self.head += amount;
        }

        Ok(())
    }

    /// Adjust the tail of the packet up or down by `diff` bytes
    ///
    /// This method is the equivalent of [`bpf_xdp_adjust_tail`](https://docs.ebpf.io/linux/helper-function/bpf_xdp_adjust_tail/),
    /// and allows extending (with zeroes) or truncating the data portion of a
    /// packet
    ///
    /// # Errors
    ///
    /// - [`PacketError::ResizeDenied`] if there is not enough tailroom
    /// - [`PacketError::OutOfBounds`] if more bytes than the packet holds
    ///     would be removed
    #[inline]
    pub fn adjust_tail(&mut self, diff: i32) -> Result<(), PacketError> {
        let amount = diff.unsigned_abs() as usize;

        if diff < 0 {
            let length = self.len();
            if amount > length {
                return Err(PacketError::OutOfBounds {
                    offset: 0,
                    size: amount,
                    length,
                });
            }

            self.tail -= amount;
        } else {
            let available = self.tailroom();
            if amount > available {
                return Err(PacketError::ResizeDenied {
                    diff: amount,
                    available,
                });
            }

            self.data[self.tail..self.tail + amount].fill(0);
            self.tail += amount;
        }

        Ok(())
    }

    /// Inserts (`diff > 0`) zeroed bytes or removes (`diff < 0`) bytes at
    /// `offset`, moving the remainder of the packet
    ///
    /// This method is the equivalent of [`bpf_skb_adjust_room`](https://docs.ebpf.io/linux/helper-function/bpf_skb_adjust_room/),
    /// allowing eg. an encapsulation header to be inserted between the L2 and
    /// L3 headers.
    ///
    /// # Errors
    ///
    /// - [`PacketError::OutOfBounds`] if `offset` is past the end of the
    ///     packet, or the removed range is not fully within the packet
    /// - [`PacketError::ResizeDenied`] if there is not enough tailroom
    pub fn adjust_room(&mut self, offset: usize, diff: i32) -> Result<(), PacketError> {
        let amount = diff.unsigned_abs() as usize;

        if diff < 0 {
            let start = self.check(offset, amount)?;
            self.data.copy_within(start + amount..self.tail, start);
            self.tail -= amount;
        } else {
            let start = self.check(offset, 0)?;
            let available = self.tailroom();
            if amount > available {
                return Err(PacketError::ResizeDenied {
                    diff: amount,
                    available,
                });
            }

            self.data.copy_within(start..self.tail, start + amount);
            self.data[start..start + amount].fill(0);
            self.tail += amount;
        }

        Ok(())
    }

    /// Inserts a slice at the specified offset, shifting any bytes at or above
    /// offset by `slice.len()`
    ///
    /// # Errors
    ///
    /// - The offset is not within bounds
    /// - There is not enough tailroom to hold `slice`
    #[inline]
    pub fn insert(&mut self, offset: usize, slice: &[u8]) -> Result<(), PacketError> {
        let diff = i32::try_from(slice.len()).map_err(|_err| PacketError::ResizeDenied {
            diff: slice.len(),
            available: self.tailroom(),
        })?;

        self.adjust_room(offset, diff)?;
        let start = self.head + offset;
        self.data[start..start + slice.len()].copy_from_slice(slice);
        Ok(())
    }

    /// Appends a slice to the end of the packet
    ///
    /// # Errors
    ///
    /// There is not enough tailroom to hold `slice`
    #[inline]
    pub fn append(&mut self, slice: &[u8]) -> Result<(), PacketError> {
        self.insert(self.len(), slice)
    }

    /// Copies a `T` out of the packet beginning at the specified offset
    ///
    /// # Errors
    ///
    /// The offset + size of `T` is not within bounds
    #[inline]
    pub fn read<T: Pod>(&self, offset: usize) -> Result<T, PacketError> {
        let start = self.check(offset, std::mem::size_of::<T>())?;

        // SAFETY: the range was validated above, and `T` is a POD
        Ok(unsafe { std::ptr::read_unaligned(self.data.as_ptr().add(start).cast()) })
    }

    /// Copies a `T` into the packet beginning at the specified offset
    ///
    /// # Errors
    ///
    /// The offset + size of `T` is not within bounds
    #[inline]
    pub fn write<T: Pod>(&mut self, offset: usize, item: T) -> Result<(), PacketError> {
        self.write_slice(offset, item.as_bytes())
    }

    /// Retrieves a slice of bytes beginning at the specified offset
    ///
    /// # Errors
    ///
    /// The offset + len is not within bounds
    #[inline]
    pub fn slice_at_offset(&self, offset: usize, len: usize) -> Result<&[u8], PacketError> {
        let start = self.check(offset, len)?;
        Ok(&self.data[start..start + len])
    }

    /// Retrieves a mutable slice of bytes beginning at the specified offset
    ///
    /// Callers that modify bytes covered by a checksum are responsible for
    /// updating it, see [`csum::update_on_overwrite`]
    ///
    /// # Errors
    ///
    /// The offset + len is not within bounds
    #[inline]
    pub fn slice_at_offset_mut(
        &mut self,
        offset: usize,
        len: usize,
    ) -> Result<&mut [u8], PacketError> {
        let start = self.check(offset, len)?;
        Ok(&mut self.data[start..start + len])
    }

    /// Copies a fixed size array of bytes beginning at the specified offset
    ///
    /// # Errors
    ///
    /// The offset + `N` is not within bounds
    #[inline]
    pub fn array_at_offset<const N: usize>(&self, offset: usize) -> Result<[u8; N], PacketError> {
        let start = self.check(offset, N)?;

        let mut data = [0u8; N];
        data.copy_from_slice(&self.data[start..start + N]);
        Ok(data)
    }

    /// Overwrites `slice.len()` bytes beginning at the specified offset
    ///
    /// # Errors
    ///
    /// The offset + `slice.len()` is not within bounds, in which case the
    /// packet is left untouched
    #[inline]
    pub fn write_slice(&mut self, offset: usize, slice: &[u8]) -> Result<(), PacketError> {
        let start = self.check(offset, slice.len())?;
        self.data[start..start + slice.len()].copy_from_slice(slice);
        Ok(())
    }
}

impl std::ops::Deref for PacketView<'_> {
    type Target = [u8];
    fn deref(&self) -> &Self::Target {
        &self.data[self.head..self.tail]
    }
}

impl fmt::Debug for PacketView<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PacketView")
            .field("head", &self.head)
            .field("tail", &self.tail)
            .field("capacity", &self.data.len())
            .finish_non_exhaustive()
    }
}

impl std::io::Write for PacketView<'_> {
    #[inline]
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self.append(buf) {
            Ok(()) => Ok(buf.len()),
            Err(_) => Err(std::io::Error::new(
                std::io::ErrorKind::StorageFull,
                "not enough space available in packet",
            )),
        }
    }

    #[inline]
    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
