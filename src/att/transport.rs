use std::fmt::{Debug, Display, Formatter};

use structbuf::{Pack, Packer, StructBuf};

use super::*;

/// Logical link identifier assigned by the transport.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    Eq,
    Hash,
    Ord,
    PartialEq,
    PartialOrd,
    serde::Deserialize,
    serde::Serialize,
)]
#[repr(transparent)]
#[serde(transparent)]
pub struct ConnId(pub u16);

impl Display for ConnId {
    #[inline]
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Conn({:#06X})", self.0)
    }
}

/// L2CAP channel identifier ([Vol 3] Part A, Section 2.1).
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[repr(transparent)]
pub struct Cid(pub u16);

impl Cid {
    /// Fixed LE Attribute Protocol channel.
    pub const ATT: Self = Self(0x0004);
}

impl Display for Cid {
    #[inline]
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "CID({:#06X})", self.0)
    }
}

/// Capacity-limited PDU buffer exchanged with the transport. Ownership of a
/// received buffer passes to the server, which either turns it into the
/// response or drops it.
#[derive(Clone, Debug, Default)]
#[must_use]
#[repr(transparent)]
pub struct Buffer(StructBuf);

impl Buffer {
    /// Creates an empty buffer that can hold up to `lim` bytes. The limit is
    /// never less than the default `ATT_MTU`, so that every error response
    /// fits.
    #[inline]
    pub fn new(lim: usize) -> Self {
        Self(StructBuf::new(lim.max(usize::from(DEFAULT_MTU))))
    }

    /// Creates a buffer containing `v`.
    #[inline]
    pub fn with_data(v: impl AsRef<[u8]>, lim: usize) -> Self {
        let v = v.as_ref();
        let mut b = Self::new(lim.max(v.len()));
        b.0.append().put(v);
        b
    }

    /// Returns the buffer capacity limit.
    #[inline(always)]
    #[must_use]
    pub fn lim(&self) -> usize {
        self.0.lim()
    }

    /// Returns the number of bytes in the buffer.
    #[inline(always)]
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns whether the buffer is empty.
    #[inline(always)]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Clears the buffer contents.
    #[inline(always)]
    pub(crate) fn clear(&mut self) {
        self.0.clear();
    }

    /// Returns a packer for writing to the end of the buffer.
    #[inline(always)]
    pub(crate) fn append(&mut self) -> Packer {
        self.0.append()
    }
}

impl AsRef<[u8]> for Buffer {
    #[inline(always)]
    fn as_ref(&self) -> &[u8] {
        self.0.as_ref()
    }
}

/// Transport collaborator that owns the logical links and L2CAP channels.
pub trait Transport: Send + Sync {
    /// Sends a server-initiated PDU.
    fn transmit(&self, conn: ConnId, cid: Cid, pdu: Buffer) -> Result<()>;

    /// Allocates a new outbound buffer that can hold at least `size` bytes.
    /// Returns [`None`] if the transport is out of memory.
    fn request_new_buffer(&self, size: usize) -> Option<Buffer>;

    /// Terminates the link because the peer misbehaved.
    fn disconnect(&self, conn: ConnId) {
        let _ = conn;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer() {
        let mut b = Buffer::new(0);
        assert_eq!(b.lim(), 23);
        assert!(b.is_empty());
        b.append().u8(1).u16(0x0302_u16);
        assert_eq!(b.as_ref(), &[1, 2, 3]);
        b.clear();
        assert_eq!(b.len(), 0);

        let b = Buffer::with_data([0; 40], 30);
        assert_eq!((b.len(), b.lim()), (40, 40));
        assert_eq!(format!("{}", ConnId(1)), "Conn(0x0001)");
    }
}
