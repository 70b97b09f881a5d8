use std::fmt::{Debug, Formatter};

use parking_lot::Mutex;
use smallvec::SmallVec;

use super::*;

/// Attribute value. Most values fit in the inline capacity.
pub type Value = SmallVec<[u8; 32]>;

/// I/O callback result type.
pub type IoResult<T = ()> = std::result::Result<T, ErrorCode>;

/// Attribute access capability. This is the only place where attribute values
/// are materialized. The server never stores values itself.
///
/// Errors returned by these methods are sent to the peer as-is, so
/// application-specific codes in the `0x80..=0x9F` range and the Common
/// Profile codes are allowed.
pub trait Io: Send + Sync {
    /// Returns the attribute value starting at offset `off`. The value may be
    /// longer than what fits in the response. The server truncates it.
    fn read(&self, cx: &IoCtx, off: usize) -> IoResult<Value> {
        let _ = (cx, off);
        Err(ErrorCode::ReadNotPermitted)
    }

    /// Writes `v` at offset `off`. Prepared writes are reassembled before
    /// they get here, so `off` is 0 except for local writes.
    fn write(&self, cx: &IoCtx, off: usize, v: &[u8]) -> IoResult {
        let _ = (cx, off, v);
        Err(ErrorCode::WriteNotPermitted)
    }
}

/// Attribute I/O context.
#[derive(Clone, Copy, Debug)]
pub struct IoCtx {
    pub(super) conn: Option<ConnId>,
    pub(super) op: Option<Opcode>,
    pub(super) hdl: Handle,
    pub(super) uuid: Uuid,
}

impl IoCtx {
    /// Returns the connection that issued the request or [`None`] for local
    /// access by the application.
    #[inline(always)]
    #[must_use]
    pub const fn conn(&self) -> Option<ConnId> {
        self.conn
    }

    /// Returns the opcode of the request being served.
    #[inline(always)]
    #[must_use]
    pub const fn opcode(&self) -> Option<Opcode> {
        self.op
    }

    /// Returns the attribute handle.
    #[inline(always)]
    #[must_use]
    pub const fn handle(&self) -> Handle {
        self.hdl
    }

    /// Returns the attribute type.
    #[inline(always)]
    #[must_use]
    pub const fn uuid(&self) -> Uuid {
        self.uuid
    }
}

/// Returns the part of the complete value `v` that starts at offset `off` or
/// `InvalidOffset` if the offset is past the end.
#[inline]
pub fn read_at(v: impl AsRef<[u8]>, off: usize) -> IoResult<Value> {
    (v.as_ref().get(off..))
        .map(Value::from_slice)
        .ok_or(ErrorCode::InvalidOffset)
}

/// Read-only constant value, typically a declaration.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
#[repr(transparent)]
pub struct Const(Value);

impl Const {
    /// Creates a constant value.
    #[inline]
    #[must_use]
    pub fn new(v: impl AsRef<[u8]>) -> Self {
        Self(Value::from_slice(v.as_ref()))
    }
}

impl Io for Const {
    #[inline]
    fn read(&self, _: &IoCtx, off: usize) -> IoResult<Value> {
        read_at(&self.0, off)
    }
}

/// Mutable value stored in memory, up to `max_len` bytes long.
pub struct ValueCell {
    v: Mutex<Value>,
    max_len: usize,
}

impl ValueCell {
    /// Creates a value cell that accepts values up to [`MAX_VAL_LEN`] bytes.
    #[inline]
    #[must_use]
    pub fn new(v: impl AsRef<[u8]>) -> Self {
        Self::with_max_len(v, MAX_VAL_LEN)
    }

    /// Creates a value cell that accepts values up to `max_len` bytes.
    #[inline]
    #[must_use]
    pub fn with_max_len(v: impl AsRef<[u8]>, max_len: usize) -> Self {
        Self {
            v: Mutex::new(Value::from_slice(v.as_ref())),
            max_len,
        }
    }

    /// Returns a copy of the current value.
    #[inline]
    #[must_use]
    pub fn get(&self) -> Value {
        self.v.lock().clone()
    }
}

impl Io for ValueCell {
    #[inline]
    fn read(&self, _: &IoCtx, off: usize) -> IoResult<Value> {
        read_at(&*self.v.lock(), off)
    }

    /// Replaces the value starting at `off`, truncating anything after the
    /// written bytes.
    fn write(&self, _: &IoCtx, off: usize, v: &[u8]) -> IoResult {
        let mut cur = self.v.lock();
        if off > cur.len() {
            return Err(ErrorCode::InvalidOffset);
        }
        if off + v.len() > self.max_len {
            return Err(ErrorCode::InvalidAttributeValueLength);
        }
        cur.truncate(off);
        cur.extend_from_slice(v);
        Ok(())
    }
}

impl Debug for ValueCell {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValueCell")
            .field("v", &self.v.lock().as_slice())
            .field("max_len", &self.max_len)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cx() -> IoCtx {
        IoCtx {
            conn: None,
            op: None,
            hdl: Handle::MIN,
            uuid: Declaration::Characteristic.uuid(),
        }
    }

    #[test]
    fn offsets() {
        assert_eq!(read_at(b"abc", 0).unwrap().as_slice(), b"abc");
        assert_eq!(read_at(b"abc", 3).unwrap().as_slice(), b"");
        assert_eq!(read_at(b"abc", 4), Err(ErrorCode::InvalidOffset));
        let c = Const::new(b"xyz");
        assert_eq!(c.read(&cx(), 1).unwrap().as_slice(), b"yz");
        assert_eq!(c.write(&cx(), 0, b"a"), Err(ErrorCode::WriteNotPermitted));
    }

    #[test]
    fn value_cell() {
        let v = ValueCell::with_max_len(b"hello", 8);
        v.write(&cx(), 4, b"0 w").unwrap();
        assert_eq!(v.get().as_slice(), b"hell0 w");
        assert_eq!(v.write(&cx(), 8, b"x"), Err(ErrorCode::InvalidOffset));
        assert_eq!(
            v.write(&cx(), 7, b"xy"),
            Err(ErrorCode::InvalidAttributeValueLength)
        );
        v.write(&cx(), 0, b"").unwrap();
        assert!(v.get().is_empty());
    }
}
