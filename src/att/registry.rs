use std::fmt::{Debug, Formatter};
use std::sync::Arc;

use tracing::debug;

use super::*;

/// Error type returned by attribute registry operations.
#[derive(Clone, Copy, Debug, Eq, PartialEq, thiserror::Error)]
#[non_exhaustive]
pub enum RegistryError {
    #[error("attribute handles exhausted")]
    OutOfHandles,
    #[error("attribute registry is in use by active connections")]
    Live,
    #[error("invalid handle range {0:#06X}..={1:#06X}")]
    InvalidRange(u16, u16),
}

/// Database entry ([Vol 3] Part F, Section 3.2).
#[derive(Clone)]
pub struct Attr {
    hdl: Handle,
    typ: Uuid,
    perms: Perms,
    io: Arc<dyn Io>,
    hidden: bool,
}

impl Attr {
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
        self.typ
    }

    /// Returns the attribute permissions.
    #[inline(always)]
    pub const fn perms(&self) -> Perms {
        self.perms
    }

    /// Returns the value access capability.
    #[inline(always)]
    pub(super) fn io(&self) -> &dyn Io {
        &*self.io
    }
}

impl Debug for Attr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Attr")
            .field("hdl", &self.hdl)
            .field("typ", &self.typ)
            .field("perms", &self.perms)
            .field("hidden", &self.hidden)
            .finish_non_exhaustive()
    }
}

/// Attribute database shared by all connections. Entries are stored in
/// ascending handle order. Hidden entries keep their slot and handle, but are
/// invisible to every lookup.
#[derive(Clone, Debug)]
pub struct Registry {
    attr: Vec<Attr>,
    last: Option<Handle>,
    max_hdl: u16,
    changes: u32,
}

impl Default for Registry {
    #[inline]
    fn default() -> Self {
        Self::new(u16::MAX)
    }
}

impl Registry {
    /// Creates an empty registry with a pool of `max_handles` handles.
    #[inline]
    #[must_use]
    pub const fn new(max_handles: u16) -> Self {
        Self {
            attr: Vec::new(),
            last: None,
            max_hdl: max_handles,
            changes: 0,
        }
    }

    /// Appends a new attribute with the next available handle.
    #[inline]
    pub fn register(
        &mut self,
        typ: impl Into<Uuid>,
        perms: impl Into<Perms>,
        io: impl Io + 'static,
    ) -> std::result::Result<Handle, RegistryError> {
        self.register_shared(typ, perms, Arc::new(io))
    }

    /// Appends a new attribute whose access capability may be shared with
    /// other attributes or with the application.
    pub fn register_shared(
        &mut self,
        typ: impl Into<Uuid>,
        perms: impl Into<Perms>,
        io: Arc<dyn Io>,
    ) -> std::result::Result<Handle, RegistryError> {
        let hdl = match self.last {
            None => Some(Handle::MIN),
            Some(h) => h.next(),
        };
        let Some(hdl) = hdl.filter(|&h| u16::from(h) <= self.max_hdl) else {
            return Err(RegistryError::OutOfHandles);
        };
        let (typ, perms) = (typ.into(), perms.into());
        self.attr.push(Attr {
            hdl,
            typ,
            perms,
            io,
            hidden: false,
        });
        self.last = Some(hdl);
        Ok(hdl)
    }

    /// Returns the visible attribute with handle `hdl`.
    #[must_use]
    pub fn find_by_handle(&self, hdl: Handle) -> Option<&Attr> {
        let i = self.attr.binary_search_by_key(&hdl, |at| at.hdl).ok()?;
        self.attr.get(i).filter(|at| !at.hidden)
    }

    /// Returns a restartable iterator over visible attributes with handles in
    /// the range `start_after+1..=end` and type `typ`, if specified.
    pub fn find_by_uuid(
        &self,
        start_after: Option<Handle>,
        typ: Option<Uuid>,
        end: Handle,
    ) -> FindByUuid<'_> {
        let i = self.attr.partition_point(|at| Some(at.hdl) <= start_after);
        FindByUuid {
            it: self.attr[i..].iter(),
            typ,
            end,
        }
    }

    /// Returns an iterator over all visible attributes in the handle range.
    #[inline]
    pub fn range(&self, hdls: HandleRange) -> FindByUuid<'_> {
        let i = self.attr.partition_point(|at| at.hdl < hdls.start());
        FindByUuid {
            it: self.attr[i..].iter(),
            typ: None,
            end: hdls.end(),
        }
    }

    /// Returns an iterator over all visible attributes.
    #[inline]
    pub fn iter(&self) -> FindByUuid<'_> {
        self.range(HandleRange::ALL)
    }

    /// Returns the most recently assigned handle.
    #[inline(always)]
    #[must_use]
    pub const fn last_handle(&self) -> Option<Handle> {
        self.last
    }

    /// Returns the number of structural changes made by hiding, restoring,
    /// removing, or resetting attributes. Clients that cached the database
    /// before the latest change are change-unaware.
    #[inline(always)]
    #[must_use]
    pub const fn change_count(&self) -> u32 {
        self.changes
    }

    /// Hides all attributes in the range `start..=end` from discovery and
    /// access without destroying them. Returns the number of affected
    /// attributes.
    pub fn hide_range(
        &mut self,
        start: u16,
        end: u16,
    ) -> std::result::Result<usize, RegistryError> {
        let n = self.set_hidden(start, end, true)?;
        debug!("Hid {n} attribute(s) in {start:#06X}..={end:#06X}");
        Ok(n)
    }

    /// Makes attributes in the range `start..=end` visible again. Returns
    /// the number of affected attributes.
    pub fn restore_range(
        &mut self,
        start: u16,
        end: u16,
    ) -> std::result::Result<usize, RegistryError> {
        let n = self.set_hidden(start, end, false)?;
        debug!("Restored {n} attribute(s) in {start:#06X}..={end:#06X}");
        Ok(n)
    }

    /// Destroys all attributes in the range `start..=end`, visible or hidden.
    /// Their handles are not reused until the next [`Self::reset`].
    pub fn remove_range(
        &mut self,
        start: u16,
        end: u16,
    ) -> std::result::Result<usize, RegistryError> {
        let r = self.slots(start, end)?;
        let n = r.len();
        self.attr.drain(r);
        if n > 0 {
            self.changed();
        }
        debug!("Removed {n} attribute(s) in {start:#06X}..={end:#06X}");
        Ok(n)
    }

    /// Destroys all attributes, visible and hidden, and restarts handle
    /// assignment.
    pub fn reset(&mut self) {
        self.attr.clear();
        self.last = None;
        self.changed();
    }

    #[inline]
    fn changed(&mut self) {
        self.changes = self.changes.wrapping_add(1);
    }

    fn set_hidden(
        &mut self,
        start: u16,
        end: u16,
        hidden: bool,
    ) -> std::result::Result<usize, RegistryError> {
        let r = self.slots(start, end)?;
        let n = r.len();
        for at in &mut self.attr[r] {
            at.hidden = hidden;
        }
        if n > 0 {
            self.changed();
        }
        Ok(n)
    }

    /// Returns the index range of the slots in the handle range.
    fn slots(
        &self,
        start: u16,
        end: u16,
    ) -> std::result::Result<std::ops::Range<usize>, RegistryError> {
        let Some(r) = HandleRange::from_raw(start, end) else {
            return Err(RegistryError::InvalidRange(start, end));
        };
        let i = self.attr.partition_point(|at| at.hdl < r.start());
        let j = self.attr.partition_point(|at| at.hdl <= r.end());
        Ok(i..j)
    }
}

/// Iterator over visible attributes in ascending handle order. Cloning the
/// iterator restarts the search from the current position.
#[derive(Clone, Debug)]
#[must_use]
pub struct FindByUuid<'a> {
    it: std::slice::Iter<'a, Attr>,
    typ: Option<Uuid>,
    end: Handle,
}

impl<'a> Iterator for FindByUuid<'a> {
    type Item = &'a Attr;

    fn next(&mut self) -> Option<Self::Item> {
        for at in self.it.by_ref() {
            if at.hdl > self.end {
                self.it = [].iter();
                return None;
            }
            if !at.hidden && self.typ.map_or(true, |t| t == at.typ) {
                return Some(at);
            }
        }
        None
    }
}

/// Registry access capability. The registry can only be modified while no
/// connection holds a reference to it.
#[derive(Debug)]
pub enum RegistryState<'a> {
    Mutable(&'a mut Registry),
    Live(&'a Registry),
}

impl<'a> RegistryState<'a> {
    /// Returns the mutable registry or [`RegistryError::Live`] if it is in use.
    #[inline]
    pub fn mutable(self) -> std::result::Result<&'a mut Registry, RegistryError> {
        match self {
            Self::Mutable(db) => Ok(db),
            Self::Live(_) => Err(RegistryError::Live),
        }
    }

    /// Returns the registry for reading.
    #[inline]
    #[must_use]
    pub fn get(&self) -> &Registry {
        match *self {
            Self::Mutable(ref db) => db,
            Self::Live(db) => db,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uuid(v: u16) -> Uuid {
        Uuid16::new(v).unwrap().as_uuid()
    }

    fn db(types: &[u16]) -> Registry {
        let mut db = Registry::default();
        for &t in types {
            db.register(uuid(t), Access::READ, Const::new([t as u8])).unwrap();
        }
        db
    }

    fn handles(it: FindByUuid) -> Vec<u16> {
        it.map(|at| u16::from(at.handle())).collect()
    }

    #[test]
    fn handle_monotonicity() {
        let mut db = Registry::new(4);
        let mut prev = 0;
        for _ in 0..4 {
            let h = u16::from(db.register(uuid(0x2A00), Access::READ, Const::default()).unwrap());
            assert!(h > prev);
            prev = h;
        }
        assert_eq!(
            db.register(uuid(0x2A00), Access::READ, Const::default()),
            Err(RegistryError::OutOfHandles)
        );
        db.remove_range(3, 4).unwrap();
        assert_eq!(db.last_handle(), Handle::new(4));
        assert_eq!(
            db.register(uuid(0x2A00), Access::READ, Const::default()),
            Err(RegistryError::OutOfHandles)
        );
        db.reset();
        assert_eq!(db.iter().count(), 0);
        assert_eq!(db.last_handle(), None);
        assert_eq!(
            db.register(uuid(0x2A00), Access::READ, Const::default()),
            Ok(Handle::MIN)
        );
    }

    #[test]
    fn find() {
        let db = db(&[0x2800, 0x2803, 0x2A00, 0x2803, 0x2A01, 0x2800]);
        let h = |v| Handle::new(v).unwrap();
        assert_eq!(db.find_by_handle(h(3)).map(Attr::uuid), Some(uuid(0x2A00)));
        assert!(db.find_by_handle(h(7)).is_none());

        let it = db.find_by_uuid(Some(h(1)), Some(uuid(0x2803)), h(6));
        assert_eq!(handles(it.clone()), [2, 4]);
        assert_eq!(handles(it), [2, 4]);
        assert_eq!(handles(db.find_by_uuid(None, None, h(2))), [1, 2]);
        assert!(handles(db.find_by_uuid(Some(h(6)), None, Handle::MAX)).is_empty());
        assert_eq!(handles(db.range(HandleRange::new(h(3), h(5)))), [3, 4, 5]);
    }

    #[test]
    fn hide_restore() {
        let mut db = db(&[0x2800, 0x2803, 0x2A00, 0x2800, 0x2803, 0x2A01]);
        let before: Vec<_> = db.iter().map(|at| (at.handle(), at.uuid())).collect();

        assert_eq!(db.change_count(), 0);
        assert_eq!(db.hide_range(4, 6), Ok(3));
        assert_eq!(db.change_count(), 1);
        assert_eq!(handles(db.iter()), [1, 2, 3]);
        assert!(db.find_by_handle(Handle::new(5).unwrap()).is_none());
        assert_eq!(db.last_handle(), Handle::new(6));
        let h = db.register(uuid(0x2800), Access::READ, Const::default()).unwrap();
        assert_eq!(u16::from(h), 7);

        assert_eq!(db.restore_range(4, 6), Ok(3));
        let after: Vec<_> = db.iter().map(|at| (at.handle(), at.uuid())).take(6).collect();
        assert_eq!(before, after);
        assert_eq!(handles(db.iter()), [1, 2, 3, 4, 5, 6, 7]);

        assert_eq!(db.hide_range(0, 3), Err(RegistryError::InvalidRange(0, 3)));
        assert_eq!(db.restore_range(5, 4), Err(RegistryError::InvalidRange(5, 4)));
        assert_eq!(db.hide_range(100, 200), Ok(0));
        assert_eq!(db.change_count(), 2);
        db.remove_range(7, 7).unwrap();
        assert_eq!(db.change_count(), 3);
    }

    #[test]
    fn state() {
        let mut db = Arc::new(db(&[0x2800]));
        let st = match Arc::get_mut(&mut db) {
            Some(db) => RegistryState::Mutable(db),
            None => unreachable!(),
        };
        assert_eq!(st.get().iter().count(), 1);
        assert!(st.mutable().is_ok());
        let st = RegistryState::Live(&db);
        assert_eq!(st.mutable().unwrap_err(), RegistryError::Live);
    }
}
