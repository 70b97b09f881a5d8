use std::fmt::{Debug, Display, Formatter};
use std::hash::{Hash, Hasher};
use std::num::{NonZeroU128, NonZeroU16};

use structbuf::{Packer, Unpack};

const SHIFT: u32 = u128::BITS - u32::BITS;
const BASE: u128 = 0x00000000_0000_1000_8000_00805F9B34FB;
const MASK_16: u128 = !((u16::MAX as u128) << SHIFT);
const MASK_32: u128 = !((u32::MAX as u128) << SHIFT);

/// 16-, 32-, or 128-bit UUID ([Vol 3] Part B, Section 2.5.1). All three
/// widths share one 128-bit representation. The original width is recovered
/// from the Bluetooth Base UUID.
#[derive(Clone, Copy, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[repr(transparent)]
pub struct Uuid(NonZeroU128);

impl Uuid {
    /// UUID size in bytes.
    pub const BYTES: usize = std::mem::size_of::<Self>();

    /// Creates a UUID from a `u128`.
    #[inline]
    #[must_use]
    pub const fn new(v: u128) -> Option<Self> {
        match NonZeroU128::new(v) {
            Some(nz) => Some(Self(nz)),
            None => None,
        }
    }

    /// Creates a 32-bit SIG UUID. Values that fit in 16 bits produce the same
    /// UUID as the 16-bit form.
    #[inline]
    #[must_use]
    pub const fn new32(v: u32) -> Option<Self> {
        if v == 0 {
            return None;
        }
        Self::new((v as u128) << SHIFT | BASE)
    }

    /// Returns a [`Uuid16`] representation or [`None`] if the UUID is not an
    /// assigned 16-bit UUID.
    #[inline]
    #[must_use]
    pub fn as_uuid16(self) -> Option<Uuid16> {
        self.as_u16().and_then(Uuid16::new)
    }

    /// Converts an assigned 16-bit Bluetooth SIG UUID to `u16`. This is
    /// mutually exclusive with `as_u32` and `as_u128`.
    #[inline]
    #[must_use]
    pub fn as_u16(self) -> Option<u16> {
        #[allow(clippy::cast_possible_truncation)]
        let v = (self.0.get() >> SHIFT) as u16;
        (self.0.get() & MASK_16 == BASE && v > 0).then_some(v)
    }

    /// Converts an assigned 32-bit Bluetooth SIG UUID to `u32`. This is
    /// mutually exclusive with `as_u16` and `as_u128`.
    #[inline]
    #[must_use]
    pub fn as_u32(self) -> Option<u32> {
        #[allow(clippy::cast_possible_truncation)]
        let v = (self.0.get() >> SHIFT) as u32;
        (self.0.get() & MASK_32 == BASE && v > u32::from(u16::MAX)).then_some(v)
    }

    /// Converts an unassigned UUID to `u128`. This is mutually exclusive with
    /// `as_u16` and `as_u32`.
    #[inline]
    #[must_use]
    pub fn as_u128(self) -> Option<u128> {
        (self.0.get() & MASK_32 != BASE).then_some(self.0.get())
    }

    /// Returns whether the UUID is sent over ATT in its 16-bit form. 32-bit
    /// UUIDs are always sent as 128-bit values ([Vol 3] Part F, Section 3.2.1).
    #[inline(always)]
    #[must_use]
    pub fn is_16(self) -> bool {
        self.as_u16().is_some()
    }

    /// Returns the number of bytes occupied by the ATT encoding of the UUID.
    #[inline]
    #[must_use]
    pub fn enc_len(self) -> usize {
        if self.is_16() {
            Uuid16::BYTES
        } else {
            Self::BYTES
        }
    }

    /// Returns the UUID as a little-endian byte array.
    #[inline]
    #[must_use]
    pub const fn to_bytes(self) -> [u8; Self::BYTES] {
        self.0.get().to_le_bytes()
    }
}

impl From<Uuid16> for Uuid {
    #[inline]
    fn from(u: Uuid16) -> Self {
        u.as_uuid()
    }
}

impl TryFrom<&[u8]> for Uuid {
    type Error = ();

    /// Decodes a 16- or 128-bit little-endian UUID.
    #[inline]
    fn try_from(v: &[u8]) -> Result<Self, Self::Error> {
        match v.len() {
            Self::BYTES => Self::new(v.unpack().u128()),
            Uuid16::BYTES => Uuid16::new(v.unpack().u16()).map(Uuid16::as_uuid),
            _ => None,
        }
        .ok_or(())
    }
}

impl Debug for Uuid {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        #[allow(clippy::cast_possible_truncation)]
        if let Some(v) = self.as_u16() {
            write!(f, "{v:#06X}")
        } else if let Some(v) = self.as_u32() {
            write!(f, "{v:#010X}")
        } else {
            let v = self.0.get();
            write!(
                f,
                "{:08X}-{:04X}-{:04X}-{:04X}-{:012X}",
                (v >> 96) as u32,
                (v >> 80) as u16,
                (v >> 64) as u16,
                (v >> 48) as u16,
                (v & ((1 << 48) - 1)) as u64
            )
        }
    }
}

impl Display for Uuid {
    #[inline(always)]
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Debug::fmt(self, f)
    }
}

impl From<Uuid> for u128 {
    #[inline]
    fn from(u: Uuid) -> Self {
        u.0.get()
    }
}

/// 16-bit Bluetooth SIG UUID.
#[derive(Clone, Copy, Eq, Ord, PartialEq, PartialOrd)]
#[repr(transparent)]
pub struct Uuid16(NonZeroU16);

impl Uuid16 {
    /// UUID size in bytes.
    pub const BYTES: usize = std::mem::size_of::<Self>();

    /// Creates a 16-bit SIG UUID from a `u16`.
    #[inline]
    #[must_use]
    pub const fn new(v: u16) -> Option<Self> {
        match NonZeroU16::new(v) {
            Some(nz) => Some(Self(nz)),
            None => None,
        }
    }

    /// Returns 128-bit UUID representation.
    #[inline]
    #[must_use]
    pub const fn as_uuid(self) -> Uuid {
        // SAFETY: BASE is non-zero
        Uuid(unsafe { NonZeroU128::new_unchecked((self.0.get() as u128) << SHIFT | BASE) })
    }

    /// Returns the raw 16-bit UUID value.
    #[inline(always)]
    #[must_use]
    pub const fn raw(self) -> u16 {
        self.0.get()
    }
}

impl Debug for Uuid16 {
    #[inline]
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#06X}", self.0.get())
    }
}

#[allow(clippy::derived_hash_with_manual_eq)]
impl Hash for Uuid16 {
    #[inline]
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.as_uuid().hash(state);
    }
}

impl From<Uuid16> for u16 {
    #[inline]
    fn from(u: Uuid16) -> Self {
        u.raw()
    }
}

/// GATT attribute types that give the database its service and
/// characteristic structure ([Assigned Numbers] Section 3.6).
#[derive(
    Clone,
    Copy,
    Debug,
    Eq,
    Ord,
    PartialEq,
    PartialOrd,
    enum_iterator::Sequence,
    num_enum::IntoPrimitive,
    num_enum::TryFromPrimitive,
)]
#[non_exhaustive]
#[repr(u16)]
pub enum Declaration {
    PrimaryService = 0x2800,
    SecondaryService = 0x2801,
    Include = 0x2802,
    Characteristic = 0x2803,
}

impl Declaration {
    /// Returns the `Uuid16` representation of the variant.
    #[inline(always)]
    #[must_use]
    pub const fn uuid16(self) -> Uuid16 {
        // SAFETY: All discriminants are non-zero
        Uuid16(unsafe { NonZeroU16::new_unchecked(self as u16) })
    }

    /// Returns the `Uuid` representation of the variant.
    #[inline]
    #[must_use]
    pub const fn uuid(self) -> Uuid {
        self.uuid16().as_uuid()
    }

    /// Returns the declaration type of `u`, if any.
    #[inline]
    #[must_use]
    pub fn of(u: Uuid) -> Option<Self> {
        u.as_u16().and_then(|v| Self::try_from(v).ok())
    }

    /// Returns whether the declaration starts a service group.
    #[inline]
    #[must_use]
    pub const fn is_service(self) -> bool {
        matches!(self, Self::PrimaryService | Self::SecondaryService)
    }
}

impl From<Declaration> for Uuid {
    #[inline]
    fn from(v: Declaration) -> Self {
        v.uuid()
    }
}

impl PartialEq<Declaration> for Uuid {
    #[inline(always)]
    fn eq(&self, rhs: &Declaration) -> bool {
        *self == rhs.uuid()
    }
}

/// Packer extension functions.
pub trait UuidPacker {
    /// Writes either a 16- or a 128-bit UUID at the current index.
    fn uuid(&mut self, u: impl Into<Uuid>) -> &mut Self;
}

impl UuidPacker for Packer<'_> {
    #[inline]
    fn uuid(&mut self, u: impl Into<Uuid>) -> &mut Self {
        let u = u.into();
        match u.as_u16() {
            Some(v) => self.u16(v),
            None => self.u128(u),
        }
    }
}

#[allow(clippy::unusual_byte_groupings)]
#[cfg(test)]
mod tests {
    use enum_iterator::all;

    use super::*;

    #[test]
    fn widths() {
        let a = Uuid16::new(0x2A00).unwrap().as_uuid();
        assert_eq!(a.as_u16(), Some(0x2A00));
        assert_eq!(a.as_u32(), None);
        assert_eq!(a.as_u128(), None);
        assert_eq!(a.enc_len(), 2);

        let b = Uuid::new32(0x0001_2A00).unwrap();
        assert_eq!(b.as_u16(), None);
        assert_eq!(b.as_u32(), Some(0x0001_2A00));
        assert_eq!(b.enc_len(), 16);
        assert_eq!(Uuid::new32(0x2A00), Some(a));
        assert_eq!(Uuid::new32(0), None);

        let c = Uuid::new(0x12345678_9ABC_DEF0_1234_56789ABCDEF0).unwrap();
        assert_eq!(c.as_u16(), None);
        assert_eq!(c.enc_len(), 16);
        assert_eq!(format!("{c}"), "12345678-9ABC-DEF0-1234-56789ABCDEF0");
        assert_eq!(format!("{a}"), "0x2A00");
    }

    #[test]
    fn from_bytes() {
        assert_eq!(Uuid::try_from([0x00, 0x28].as_slice()), Ok(Declaration::PrimaryService.uuid()));
        assert_eq!(Uuid::try_from([0x00, 0x00].as_slice()), Err(()));
        assert_eq!(Uuid::try_from([1, 2, 3].as_slice()), Err(()));
        let u = Uuid::new(0x12345678_9ABC_DEF0_1234_56789ABCDEF0).unwrap();
        assert_eq!(Uuid::try_from(u.to_bytes().as_slice()), Ok(u));
    }

    #[test]
    fn declarations() {
        for d in all::<Declaration>() {
            assert_eq!(Declaration::of(d.uuid()), Some(d));
            assert_eq!(d.uuid(), d);
        }
        assert!(Declaration::SecondaryService.is_service());
        assert!(!Declaration::Characteristic.is_service());
        assert_eq!(Declaration::of(Uuid16::new(0x2A00).unwrap().as_uuid()), None);
    }
}
