use std::collections::HashMap;
use std::fmt::{Debug, Display, Formatter};
use std::sync::Arc;

use att_server_crypto::Csrk;
use bitflags::bitflags;
use futures_core::future::BoxFuture;
use parking_lot::Mutex;
use tracing::{debug, warn};

use super::*;

bitflags! {
    /// Connection security properties. A non-zero key length means that the
    /// link is encrypted.
    #[derive(
        Clone, Copy, Debug, Default, Eq, Hash, PartialEq, serde::Deserialize, serde::Serialize,
    )]
    #[repr(transparent)]
    pub struct ConnSec: u8 {
        /// Authentication (MITM protection) flag.
        const AUTHN = 1 << 0;
        /// Authorization flag.
        const AUTHZ = 1 << 1;
        /// Trusted relationship flag ([Vol 3] Part C, Section 9.4). Set when a
        /// long term key is on file for the peer.
        const BOND = 1 << 2;
        /// Encryption key length mask.
        const KEY_LEN = 0x1F << 3;
    }
}

impl ConnSec {
    /// Creates a key length property.
    ///
    /// # Panics
    ///
    /// Panics if `n` is not a valid key length in bits.
    #[inline(always)]
    #[must_use]
    pub const fn key_len(n: u8) -> Self {
        assert!(56 <= n && n <= 128 && n % 8 == 0);
        Self::from_bits_retain(n)
    }

    /// Returns the encryption key length in bits or 0 if the link is not
    /// encrypted.
    #[inline(always)]
    #[must_use]
    pub const fn enc_key_len(self) -> u8 {
        self.intersection(Self::KEY_LEN).bits()
    }

    /// Returns whether the link is encrypted.
    #[inline(always)]
    #[must_use]
    pub const fn is_encrypted(self) -> bool {
        self.intersects(Self::KEY_LEN)
    }
}

impl Display for ConnSec {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let k = self.enc_key_len();
        if k == 0 {
            return f.write_str("Unencrypted");
        }
        let mut t = f.debug_tuple("Encrypted");
        t.field(&format_args!("{k}-bit"));
        if self.contains(Self::AUTHN) {
            t.field(&"AUTHN");
        }
        if self.contains(Self::AUTHZ) {
            t.field(&"AUTHZ");
        }
        if self.contains(Self::BOND) {
            t.field(&"BOND");
        }
        t.finish()
    }
}

/// Peer signing key and the next expected sign counter
/// ([Vol 3] Part C, Section 10.4.2).
#[derive(Clone, Debug)]
pub struct PeerSignKey {
    pub csrk: Csrk,
    pub counter: u32,
}

/// Security manager interface consumed by the server. It owns pairing,
/// bonding, and key storage.
pub trait SecurityManager: Send + Sync {
    /// Returns the current security properties of connection `conn`.
    fn security_state(&self, conn: ConnId) -> ConnSec;

    /// Asks the application to authorize access `req` to handle `hdl`. This is
    /// the only operation that may suspend request processing.
    fn authorize(&self, conn: ConnId, hdl: Handle, req: Access) -> BoxFuture<'_, bool> {
        let _ = (conn, hdl, req);
        Box::pin(std::future::ready(false))
    }

    /// Returns the signing key of a bonded peer.
    fn signing_key(&self, conn: ConnId) -> Option<PeerSignKey> {
        let _ = conn;
        None
    }

    /// Increments the stored peer sign counter after a verified signed write.
    fn incr_sign_counter(&self, conn: ConnId) {
        let _ = conn;
    }

    /// Returns the registry change count that the bonded peer on connection
    /// `conn` was last aware of, or [`None`] if the peer does not cache the
    /// database.
    fn db_change_seen(&self, conn: ConnId) -> Option<u32> {
        let _ = conn;
        None
    }

    /// Stores the registry change count that the bonded peer is now aware of.
    fn set_db_change_seen(&self, conn: ConnId, n: u32) {
        let _ = (conn, n);
    }
}

/// Per-request attribute access check for one connection.
#[derive(Clone)]
pub(crate) struct SecurityGate {
    conn: ConnId,
    sm: Arc<dyn SecurityManager>,
}

impl SecurityGate {
    #[inline]
    #[must_use]
    pub fn new(conn: ConnId, sm: Arc<dyn SecurityManager>) -> Self {
        Self { conn, sm }
    }

    /// Checks whether `req` access to attribute `at` is allowed, asking the
    /// application if authorization is required
    /// ([Vol 3] Part F, Section 4).
    pub async fn check(&self, op: Opcode, at: &Attr, req: Access) -> RspResult<()> {
        let sec = self.sm.security_state(self.conn);
        let hdl = at.handle();
        match at.perms().check(sec, req) {
            Ok(Check::Pass) => Ok(()),
            Ok(Check::Authorize) => {
                if self.sm.authorize(self.conn, hdl, req).await {
                    debug!("{} authorized {op} to {hdl}", self.conn);
                    Ok(())
                } else {
                    warn!("{} denied {op} to {hdl} by application", self.conn);
                    op.hdl_err(ErrorCode::InsufficientAuthorization, hdl)
                }
            }
            Err(e) => {
                warn!("{} denied {op} to {hdl} due to {e} ({sec})", self.conn);
                op.hdl_err(e, hdl)
            }
        }
    }

    /// Returns the signing key for the connection.
    #[inline]
    pub fn signing_key(&self) -> Option<PeerSignKey> {
        self.sm.signing_key(self.conn)
    }

    /// Increments the peer sign counter.
    #[inline]
    pub fn incr_sign_counter(&self) {
        self.sm.incr_sign_counter(self.conn);
    }

    /// Returns the registry change count known to the peer.
    #[inline]
    pub fn db_change_seen(&self) -> Option<u32> {
        self.sm.db_change_seen(self.conn)
    }

    /// Records that the peer is aware of registry change `n`.
    #[inline]
    pub fn set_db_change_seen(&self, n: u32) {
        self.sm.set_db_change_seen(self.conn, n);
    }
}

impl Debug for SecurityGate {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecurityGate")
            .field("conn", &self.conn)
            .finish_non_exhaustive()
    }
}

type Authorizer = dyn Fn(ConnId, Handle, Access) -> bool + Send + Sync;

/// In-memory [`SecurityManager`] for applications that track link security
/// themselves.
#[derive(Default)]
pub struct MemSecurity {
    conns: Mutex<HashMap<ConnId, PeerState>>,
    authz: Option<Box<Authorizer>>,
}

#[derive(Debug, Default)]
struct PeerState {
    sec: ConnSec,
    key: Option<PeerSignKey>,
    db_seen: Option<u32>,
}

impl MemSecurity {
    /// Creates a security manager that denies all authorization prompts.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the function that answers authorization prompts.
    #[must_use]
    pub fn with_authorizer(
        mut self,
        f: impl Fn(ConnId, Handle, Access) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.authz = Some(Box::new(f));
        self
    }

    /// Sets the security properties of connection `conn`.
    pub fn set_security(&self, conn: ConnId, sec: ConnSec) {
        self.conns.lock().entry(conn).or_default().sec = sec;
    }

    /// Sets the signing key and next expected sign counter of the peer on
    /// connection `conn`.
    pub fn set_signing_key(&self, conn: ConnId, csrk: Csrk, counter: u32) {
        self.conns.lock().entry(conn).or_default().key = Some(PeerSignKey { csrk, counter });
    }

    /// Removes all state for connection `conn`.
    pub fn remove(&self, conn: ConnId) {
        self.conns.lock().remove(&conn);
    }
}

impl SecurityManager for MemSecurity {
    fn security_state(&self, conn: ConnId) -> ConnSec {
        self.conns.lock().get(&conn).map_or_else(ConnSec::empty, |p| p.sec)
    }

    fn authorize(&self, conn: ConnId, hdl: Handle, req: Access) -> BoxFuture<'_, bool> {
        let ok = self.authz.as_ref().map_or(false, |f| f(conn, hdl, req));
        Box::pin(std::future::ready(ok))
    }

    fn signing_key(&self, conn: ConnId) -> Option<PeerSignKey> {
        self.conns.lock().get(&conn).and_then(|p| p.key.clone())
    }

    fn incr_sign_counter(&self, conn: ConnId) {
        if let Some(k) = self.conns.lock().get_mut(&conn).and_then(|p| p.key.as_mut()) {
            k.counter = k.counter.wrapping_add(1);
        }
    }

    fn db_change_seen(&self, conn: ConnId) -> Option<u32> {
        self.conns.lock().get(&conn).and_then(|p| p.db_seen)
    }

    fn set_db_change_seen(&self, conn: ConnId, n: u32) {
        self.conns.lock().entry(conn).or_default().db_seen = Some(n);
    }
}

impl Debug for MemSecurity {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemSecurity")
            .field("conns", &self.conns.lock().len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conn_sec() {
        let s = ConnSec::key_len(128) | ConnSec::AUTHN | ConnSec::BOND;
        assert!(s.is_encrypted());
        assert_eq!(s.enc_key_len(), 128);
        assert_eq!(format!("{s}"), r#"Encrypted(128-bit, "AUTHN", "BOND")"#);
        assert!(!ConnSec::BOND.is_encrypted());
        assert_eq!(format!("{}", ConnSec::empty()), "Unencrypted");
    }

    #[tokio::test]
    async fn mem_security() {
        let c = ConnId(1);
        let sm = MemSecurity::new().with_authorizer(|_, hdl, req| u16::from(hdl) == 7 && req.is_write());
        assert_eq!(sm.security_state(c), ConnSec::empty());
        sm.set_security(c, ConnSec::BOND);
        assert_eq!(sm.security_state(c), ConnSec::BOND);

        let h7 = Handle::new(7).unwrap();
        assert!(sm.authorize(c, h7, Access::WRITE).await);
        assert!(!sm.authorize(c, h7, Access::READ).await);

        assert!(sm.signing_key(c).is_none());
        sm.set_signing_key(c, Csrk::new(1), 5);
        sm.incr_sign_counter(c);
        assert_eq!(sm.signing_key(c).unwrap().counter, 6);
        assert_eq!(sm.db_change_seen(c), None);
        sm.set_db_change_seen(c, 2);
        assert_eq!(sm.db_change_seen(c), Some(2));
        sm.remove(c);
        assert!(sm.signing_key(c).is_none());
        assert_eq!(sm.db_change_seen(c), None);
    }
}
