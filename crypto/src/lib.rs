//! Bluetooth LE data signing for the Attribute Protocol
//! ([Vol 3] Part H, Section 2.4.5).

#![warn(missing_debug_implementations)]
#![warn(non_ascii_idents)]
#![warn(single_use_lifetimes)]
#![warn(unused_crate_dependencies)]
#![warn(unused_extern_crates)]
#![warn(unused_import_braces)]
#![warn(unused_lifetimes)]
#![warn(unused_qualifications)]
#![warn(variant_size_differences)]
#![warn(clippy::cargo)]
#![warn(clippy::nursery)]
#![warn(clippy::pedantic)]
#![allow(clippy::enum_glob_use)]
#![allow(clippy::inline_always)]
#![allow(clippy::module_name_repetitions)]
// #![warn(clippy::restriction)]
#![warn(clippy::assertions_on_result_states)]
#![warn(clippy::clone_on_ref_ptr)]
#![warn(clippy::dbg_macro)]
#![warn(clippy::decimal_literal_representation)]
#![warn(clippy::default_union_representation)]
#![warn(clippy::deref_by_slicing)]
#![warn(clippy::empty_drop)]
#![warn(clippy::empty_structs_with_brackets)]
#![warn(clippy::exhaustive_enums)]
#![warn(clippy::exit)]
#![warn(clippy::fn_to_numeric_cast_any)]
#![warn(clippy::format_push_string)]
#![warn(clippy::get_unwrap)]
#![warn(clippy::if_then_some_else_none)]
#![warn(clippy::lossy_float_literal)]
#![warn(clippy::missing_enforced_import_renames)]
#![warn(clippy::mixed_read_write_in_expression)]
#![warn(clippy::mod_module_files)]
#![warn(clippy::mutex_atomic)]
#![warn(clippy::pattern_type_mismatch)]
#![warn(clippy::print_stdout)]
#![warn(clippy::rc_buffer)]
#![warn(clippy::rc_mutex)]
#![warn(clippy::rest_pat_in_fully_bound_structs)]
//#![warn(clippy::semicolon_outside_block)]
#![warn(clippy::str_to_string)]
#![warn(clippy::string_add)]
#![warn(clippy::string_to_string)]
#![warn(clippy::suspicious_xor_used_as_pow)]
#![warn(clippy::todo)]
#![warn(clippy::try_err)]
#![warn(clippy::undocumented_unsafe_blocks)]
#![warn(clippy::unnecessary_safety_comment)]
#![warn(clippy::unnecessary_safety_doc)]
#![warn(clippy::unnecessary_self_imports)]
#![warn(clippy::unneeded_field_pattern)]
#![warn(clippy::unseparated_literal_suffix)]

use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};

pub use self::cmac::AesCmac;
use self::cmac::{debug_secret, Key};

mod cmac;

/// Connection Signature Resolving Key ([Vol 3] Part H, Section 2.4.2.2).
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
#[must_use]
#[repr(transparent)]
pub struct Csrk(u128);

debug_secret!(Csrk);

impl Csrk {
    /// Creates a signing key from a `u128` value.
    #[inline(always)]
    pub const fn new(k: u128) -> Self {
        Self(k)
    }

    /// Creates a signing key from its little-endian wire/storage encoding.
    #[inline(always)]
    pub const fn from_le_bytes(b: [u8; 16]) -> Self {
        Self(u128::from_le_bytes(b))
    }

    /// Signs message `m` (everything preceding the signature in the PDU) with
    /// sign counter `n`. The counter is appended to the message and the
    /// result is processed in the most-significant-octet-first order that
    /// the security toolbox functions expect.
    #[inline]
    pub fn sign(&self, m: &[u8], n: u32) -> Signature {
        let mut rev = Vec::with_capacity(m.len());
        rev.extend(m.iter().rev());
        let mut h = AesCmac::new(&Key::new(self.0));
        h.update(n.to_be_bytes()).update(rev);
        #[allow(clippy::cast_possible_truncation)]
        Signature {
            counter: n,
            mac: (h.finalize() >> 64) as u64,
        }
    }

    /// Verifies signature `sig` over message `m` in constant time.
    #[inline]
    #[must_use]
    pub fn verify(&self, m: &[u8], sig: &Signature) -> bool {
        let want = self.sign(m, sig.counter);
        bool::from(want.mac.ct_eq(&sig.mac))
    }
}

/// Authentication signature appended to a signed PDU: a 32-bit sign counter
/// followed by a 64-bit MAC.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[must_use]
pub struct Signature {
    counter: u32,
    mac: u64,
}

impl Signature {
    /// Encoded signature length.
    pub const LEN: usize = 12;

    /// Returns the sign counter.
    #[inline(always)]
    #[must_use]
    pub const fn counter(&self) -> u32 {
        self.counter
    }

    /// Decodes a signature from its little-endian wire encoding.
    #[inline]
    pub fn from_le_bytes(b: &[u8; Self::LEN]) -> Self {
        let (n, m) = b.split_at(4);
        let mut n4 = [0; 4];
        let mut m8 = [0; 8];
        n4.copy_from_slice(n);
        m8.copy_from_slice(m);
        Self {
            counter: u32::from_le_bytes(n4),
            mac: u64::from_le_bytes(m8),
        }
    }

    /// Returns the little-endian wire encoding of the signature.
    #[inline]
    #[must_use]
    pub fn to_le_bytes(&self) -> [u8; Self::LEN] {
        let mut b = [0; Self::LEN];
        b[..4].copy_from_slice(&self.counter.to_le_bytes());
        b[4..].copy_from_slice(&self.mac.to_le_bytes());
        b
    }
}

#[allow(clippy::unusual_byte_groupings)]
#[cfg(test)]
mod tests {
    use super::*;

    const K: u128 = 0x2b7e1516_28aed2a6_abf71588_09cf4f3c;

    #[test]
    fn sign_matches_reversed_cmac() {
        let m = [0xD2, 0x03, 0x00, 0xAA, 0xBB];
        let s = Csrk::new(K).sign(&m, 7);

        let mut h = AesCmac::new(&Key::new(K));
        h.update([0, 0, 0, 7]).update([0xBB, 0xAA, 0x00, 0x03, 0xD2]);
        #[allow(clippy::cast_possible_truncation)]
        let want = (h.finalize() >> 64) as u64;
        assert_eq!(s.counter(), 7);
        assert_eq!(s.mac, want);
    }

    #[test]
    fn verify() {
        let k = Csrk::new(K);
        let m = [0xD2, 0x01, 0x00, 1, 2, 3];
        let s = k.sign(&m, 0);
        assert!(k.verify(&m, &s));

        let mut bad = m;
        bad[5] ^= 1;
        assert!(!k.verify(&bad, &s));

        let replay = Signature::from_le_bytes(&{
            let mut b = s.to_le_bytes();
            b[0] = 1;
            b
        });
        assert!(!k.verify(&m, &replay));
        assert!(!Csrk::new(K + 1).verify(&m, &s));
    }

    #[test]
    fn signature_encoding() {
        let s = Signature {
            counter: 0x0403_0201,
            mac: 0x0C0B_0A09_0807_0605,
        };
        let b = s.to_le_bytes();
        assert_eq!(b, [1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12]);
        assert_eq!(Signature::from_le_bytes(&b), s);
    }

    #[test]
    fn csrk_le_bytes() {
        let mut b = [0; 16];
        b[0] = 0x3c;
        b[15] = 0x2b;
        let k = Csrk::from_le_bytes(b);
        assert_eq!(k.0 >> 120, 0x2b);
        assert_eq!(k.0 & 0xFF, 0x3c);
        assert_eq!(format!("{k:?}"), "Csrk(\"<secret>\")");
    }
}
