use std::ops::BitOr;

use super::*;

/// Access permission/request builder. As a permission, it describes the
/// allowed access directions and the security required for them. As a
/// request, it is either [`Access::READ`] or [`Access::WRITE`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[must_use]
pub struct Access {
    perm: Perm,
    key_len: u8,
}

impl Access {
    /// No access.
    pub const NONE: Self = Self::of(Perm::empty());

    /// Read access permission/request.
    pub const READ: Self = Self::of(Perm::READ);

    /// Write access permission/request.
    pub const WRITE: Self = Self::of(Perm::WRITE);

    /// Read/write access permission.
    pub const READ_WRITE: Self = Self::of(Perm::READ.union(Perm::WRITE));

    #[inline(always)]
    const fn of(perm: Perm) -> Self {
        Self { perm, key_len: 0 }
    }

    /// Requires an encrypted link for the selected access directions.
    #[inline]
    pub const fn encrypt(self) -> Self {
        self.require(Perm::READ_ENC, Perm::WRITE_ENC)
    }

    /// Requires an authenticated (MITM-protected) link for the selected
    /// access directions.
    #[inline]
    pub const fn authn(self) -> Self {
        self.require(Perm::READ_AUTHN, Perm::WRITE_AUTHN)
    }

    /// Requires explicit authorization for the selected access directions.
    #[inline]
    pub const fn authz(self) -> Self {
        self.require(Perm::READ_AUTHZ, Perm::WRITE_AUTHZ)
    }

    /// Sets the minimum encryption key length between 56 and 128 bits in 8
    /// bit increments ([Vol 3] Part H, Section 2.3.4). A key length of 0
    /// clears the requirement.
    ///
    /// # Panics
    ///
    /// Panics if the key length is invalid.
    #[inline]
    pub const fn key_len(mut self, n: u8) -> Self {
        assert!(
            56 <= n && n <= 128 && n % 8 == 0 || n == 0,
            "Invalid encryption key length"
        );
        self.key_len = n;
        self
    }

    /// Returns whether read access is selected.
    #[inline(always)]
    #[must_use]
    pub const fn is_read(self) -> bool {
        self.perm.contains(Perm::READ)
    }

    /// Returns whether write access is selected.
    #[inline(always)]
    #[must_use]
    pub const fn is_write(self) -> bool {
        self.perm.contains(Perm::WRITE)
    }

    #[inline]
    const fn require(mut self, r: Perm, w: Perm) -> Self {
        if self.is_read() {
            self.perm = self.perm.union(r);
        }
        if self.is_write() {
            self.perm = self.perm.union(w);
        }
        self
    }
}

impl BitOr for Access {
    type Output = Perms;

    #[inline]
    fn bitor(self, rhs: Self) -> Self::Output {
        Perms::allow(self, rhs)
    }
}

/// Result of a successful permission check.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[must_use]
pub enum Check {
    /// Access is allowed.
    Pass,
    /// Access is allowed only if the application authorizes it.
    Authorize,
}

/// Attribute permissions ([Vol 3] Part F, Section 3.2.5), combining the
/// access directions, their security requirements, and the minimum
/// encryption key length.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[must_use]
pub struct Perms {
    perm: Perm,
    key_len: u8,
}

impl Perms {
    /// Creates a new permission set.
    #[inline]
    pub const fn new(allow: Access) -> Self {
        Self {
            perm: allow.perm,
            key_len: allow.key_len,
        }
    }

    /// Creates a permission set from two types of access. The stricter key
    /// length applies to both.
    #[inline]
    pub const fn allow(a: Access, b: Access) -> Self {
        Self {
            perm: a.perm.union(b.perm),
            key_len: if a.key_len > b.key_len {
                a.key_len
            } else {
                b.key_len
            },
        }
    }

    /// Returns the raw permission flags.
    #[inline(always)]
    pub const fn flags(self) -> Perm {
        self.perm
    }

    /// Returns the minimum encryption key length in bits.
    #[inline(always)]
    #[must_use]
    pub const fn min_key_len(self) -> u8 {
        self.key_len
    }

    /// Checks whether access request `req` should be allowed on a link with
    /// security properties `sec`. The checks follow the order of
    /// [Vol 3] Part F, Section 3.4.4.3. Authorization is reported last
    /// because it may require user interaction.
    pub const fn check(self, sec: ConnSec, req: Access) -> std::result::Result<Check, ErrorCode> {
        use ErrorCode::*;
        let (allow, enc, authn, authz, deny) = if req.is_read() {
            let p = (Perm::READ_ENC, Perm::READ_AUTHN, Perm::READ_AUTHZ);
            (Perm::READ, p.0, p.1, p.2, ReadNotPermitted)
        } else {
            let p = (Perm::WRITE_ENC, Perm::WRITE_AUTHN, Perm::WRITE_AUTHZ);
            (Perm::WRITE, p.0, p.1, p.2, WriteNotPermitted)
        };
        if !self.perm.contains(allow) || !(req.is_read() || req.is_write()) {
            return Err(deny);
        }
        let need = self.perm.intersection(enc.union(authn).union(authz));
        if need.is_empty() {
            return Ok(Check::Pass);
        }
        if need.intersects(enc.union(authn)) && !sec.is_encrypted() {
            // A bonded peer only needs to re-encrypt, others must pair
            return Err(if sec.contains(ConnSec::BOND) {
                InsufficientEncryption
            } else {
                InsufficientAuthentication
            });
        }
        if need.contains(authn) && !sec.contains(ConnSec::AUTHN) {
            return Err(InsufficientAuthentication);
        }
        if self.key_len > sec.enc_key_len() {
            return Err(EncryptionKeySizeTooShort);
        }
        if need.contains(authz) && !sec.contains(ConnSec::AUTHZ) {
            return Ok(Check::Authorize);
        }
        Ok(Check::Pass)
    }
}

impl From<Access> for Perms {
    #[inline]
    fn from(v: Access) -> Self {
        Self::new(v)
    }
}

bitflags::bitflags! {
    /// Raw attribute permission flags.
    #[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
    #[repr(transparent)]
    pub struct Perm: u8 {
        /// Read access.
        const READ = 1 << 0;
        /// Write access.
        const WRITE = 1 << 1;
        /// Reads require an encrypted link.
        const READ_ENC = 1 << 2;
        /// Reads require an authenticated link.
        const READ_AUTHN = 1 << 3;
        /// Reads require authorization.
        const READ_AUTHZ = 1 << 4;
        /// Writes require an encrypted link.
        const WRITE_ENC = 1 << 5;
        /// Writes require an authenticated link.
        const WRITE_AUTHN = 1 << 6;
        /// Writes require authorization.
        const WRITE_AUTHZ = 1 << 7;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sec(key_len: u8, f: ConnSec) -> ConnSec {
        if key_len == 0 {
            f
        } else {
            ConnSec::key_len(key_len) | f
        }
    }

    #[test]
    fn access() {
        use ErrorCode::*;
        let none = ConnSec::empty();
        let (ro, wo, rw) = (Access::READ, Access::WRITE, Access::READ_WRITE);
        let p = Perms::from(ro);
        assert_eq!(p.check(none, Access::READ), Ok(Check::Pass));
        assert_eq!(p.check(none, Access::WRITE), Err(WriteNotPermitted));
        let p = Perms::from(wo);
        assert_eq!(p.check(none, Access::READ), Err(ReadNotPermitted));
        assert_eq!(p.check(none, Access::WRITE), Ok(Check::Pass));
        let p = Perms::from(rw);
        assert_eq!(p.check(none, Access::READ), Ok(Check::Pass));
        assert_eq!(p.check(none, Access::WRITE), Ok(Check::Pass));
        assert_eq!(p.check(none, Access::NONE), Err(WriteNotPermitted));
    }

    #[test]
    fn security() {
        use ErrorCode::*;
        let p = Perms::from(Access::READ.encrypt());
        assert_eq!(
            p.check(ConnSec::empty(), Access::READ),
            Err(InsufficientAuthentication)
        );
        assert_eq!(
            p.check(ConnSec::BOND, Access::READ),
            Err(InsufficientEncryption)
        );
        assert_eq!(p.check(sec(128, ConnSec::empty()), Access::READ), Ok(Check::Pass));

        let p = Perms::from(Access::READ.authn().key_len(128));
        assert_eq!(
            p.check(sec(128, ConnSec::BOND), Access::READ),
            Err(InsufficientAuthentication)
        );
        assert_eq!(
            p.check(sec(56, ConnSec::AUTHN), Access::READ),
            Err(EncryptionKeySizeTooShort)
        );
        assert_eq!(p.check(sec(128, ConnSec::AUTHN), Access::READ), Ok(Check::Pass));

        let p = Access::READ | Access::WRITE.authz();
        assert_eq!(p.check(ConnSec::empty(), Access::READ), Ok(Check::Pass));
        assert_eq!(
            p.check(ConnSec::empty(), Access::WRITE),
            Ok(Check::Authorize)
        );
        assert_eq!(p.check(ConnSec::AUTHZ, Access::WRITE), Ok(Check::Pass));
    }

    /// Every combination of permission flags, key lengths, and connection
    /// state maps to exactly one outcome for each access direction.
    #[test]
    fn totality() {
        use ErrorCode::*;
        let key_lens = [0, 56, 128];
        let outcomes = [
            ReadNotPermitted,
            WriteNotPermitted,
            InsufficientAuthentication,
            InsufficientEncryption,
            EncryptionKeySizeTooShort,
        ];
        for bits in 0..=u8::MAX {
            for &pk in &key_lens {
                let p = Perms {
                    perm: Perm::from_bits_retain(bits),
                    key_len: pk,
                };
                for &ck in &key_lens {
                    for f in 0..8 {
                        let s = sec(ck, ConnSec::from_bits_retain(f));
                        for req in [Access::READ, Access::WRITE] {
                            match p.check(s, req) {
                                Ok(Check::Pass | Check::Authorize) => {}
                                Err(e) => assert!(outcomes.contains(&e), "{e}"),
                            }
                        }
                    }
                }
            }
        }
    }
}
