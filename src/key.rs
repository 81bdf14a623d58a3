//! RSA-2048 keypair handling: the device-format public key blob and the
//! textbook-RSA token signature ADB's auth handshake expects.
//!
//! The device's verifier does not accept a generic PKCS#1 v1.5 signer —
//! it expects the exact fixed-prefix 256-byte block described below, so
//! `sign_token` builds that block itself and signs it with a raw modular
//! exponentiation rather than going through `rsa`'s padding schemes.

use crate::error::KeyError;
use num_bigint_dig::{BigInt, BigUint, Sign};
use num_traits::{One, Zero};
use rsa::traits::{PrivateKeyParts, PublicKeyParts};
use rsa::{RsaPrivateKey, RsaPublicKey};

/// Number of 32-bit words in an RSA-2048 modulus.
const RSANUMWORDS: usize = 64;

/// Size in bytes of the device-format `AndroidPublicKey` blob for RSA-2048:
/// `len_words(4) + n0inv(4) + n(256) + rr(256) + exponent(4)`.
pub const ANDROID_PUBKEY_ENCODED_SIZE: usize = 4 + 4 + RSANUMWORDS * 4 + RSANUMWORDS * 4 + 4;

/// The fixed ASN.1 DigestInfo prefix for SHA-1, as embedded in PKCS#1 v1.5
/// signatures: `SEQUENCE { SEQUENCE { OID sha1, NULL }, OCTET STRING(20) }`.
const SHA1_DIGESTINFO: [u8; 15] = [
    0x30, 0x21, 0x30, 0x09, 0x06, 0x05, 0x2b, 0x0e, 0x03, 0x02, 0x1a, 0x05, 0x00, 0x04, 0x14,
];

/// An RSA-2048 keypair that can sign ADB auth challenges and produce the
/// device-format public key blob.
pub struct KeySigner {
    private_key: RsaPrivateKey,
}

impl KeySigner {
    /// Generate a fresh RSA-2048 keypair.
    pub fn generate<R: rand::RngCore + rand::CryptoRng>(rng: &mut R) -> Result<Self, KeyError> {
        let private_key =
            RsaPrivateKey::new(rng, 2048).map_err(|e| KeyError::Generation(e.to_string()))?;
        Ok(KeySigner { private_key })
    }

    /// Wrap an existing RSA-2048 private key. The caller is responsible for
    /// persisting it across runs so device-side authorization survives.
    pub fn from_private_key(private_key: RsaPrivateKey) -> Result<Self, KeyError> {
        if private_key.size() != 256 {
            return Err(KeyError::UnsupportedKeySize);
        }
        Ok(KeySigner { private_key })
    }

    pub fn public_key(&self) -> RsaPublicKey {
        RsaPublicKey::from(&self.private_key)
    }

    /// Produce the fixed 524-byte device-format public key blob.
    pub fn public_key_android_blob(&self) -> [u8; ANDROID_PUBKEY_ENCODED_SIZE] {
        let n = self.private_key.n();
        let e: u32 = self
            .private_key
            .e()
            .to_u32_digits()
            .first()
            .copied()
            .unwrap_or(0);
        android_pubkey_encode(n, e)
    }

    /// Sign a 20-byte ADB auth token, producing the 256-byte big-endian
    /// signature the device expects.
    pub fn sign_token(&self, token: &[u8]) -> Result<[u8; 256], KeyError> {
        if token.len() != 20 {
            return Err(KeyError::BadTokenLength(token.len()));
        }
        let block = build_signature_block(token);
        let m = BigUint::from_bytes_be(&block);
        let d = self.private_key.d();
        let n = self.private_key.n();
        let c = m.modpow(d, n);
        let mut sig = [0u8; 256];
        let bytes = c.to_bytes_be();
        sig[256 - bytes.len()..].copy_from_slice(&bytes);
        Ok(sig)
    }
}

/// Build the 256-byte block that gets signed: `0x00 0x01 <0xFF * k> 0x00 <DigestInfo> <token>`,
/// where `k` is chosen so the whole block is exactly 256 bytes.
fn build_signature_block(token: &[u8]) -> [u8; 256] {
    let mut block = [0u8; 256];
    block[0] = 0x00;
    block[1] = 0x01;
    let ff_end = 256 - 1 - SHA1_DIGESTINFO.len() - token.len();
    for b in block.iter_mut().take(ff_end).skip(2) {
        *b = 0xFF;
    }
    block[ff_end] = 0x00;
    let digest_start = ff_end + 1;
    block[digest_start..digest_start + SHA1_DIGESTINFO.len()].copy_from_slice(&SHA1_DIGESTINFO);
    let token_start = digest_start + SHA1_DIGESTINFO.len();
    block[token_start..token_start + token.len()].copy_from_slice(token);
    debug_assert_eq!(token_start + token.len(), 256);
    block
}

fn android_pubkey_encode(n: &BigUint, e: u32) -> [u8; ANDROID_PUBKEY_ENCODED_SIZE] {
    let r32 = BigUint::one() << 32;
    let n0 = n % &r32;
    let n0inv_pos = mod_inverse(&n0, &r32).expect("RSA modulus must be odd and invertible mod 2^32");
    let n0inv = (&r32 - &n0inv_pos) % &r32;

    let rr_exponent = RSANUMWORDS * 32 * 2;
    let rr = (BigUint::one() << rr_exponent) % n;

    let mut out = [0u8; ANDROID_PUBKEY_ENCODED_SIZE];
    out[0..4].copy_from_slice(&(RSANUMWORDS as u32).to_le_bytes());
    out[4..8].copy_from_slice(&biguint_to_u32(&n0inv).to_le_bytes());
    write_words_le(&mut out[8..8 + RSANUMWORDS * 4], n);
    write_words_le(&mut out[8 + RSANUMWORDS * 4..8 + RSANUMWORDS * 8], &rr);
    out[8 + RSANUMWORDS * 8..].copy_from_slice(&e.to_le_bytes());
    out
}

/// Decode an `AndroidPublicKey` blob back into (modulus, exponent), for
/// round-trip testing.
pub fn android_pubkey_decode(blob: &[u8]) -> Option<(BigUint, u32)> {
    if blob.len() != ANDROID_PUBKEY_ENCODED_SIZE {
        return None;
    }
    let n = read_words_le(&blob[8..8 + RSANUMWORDS * 4]);
    let e = u32::from_le_bytes(blob[8 + RSANUMWORDS * 8..].try_into().ok()?);
    Some((n, e))
}

fn write_words_le(out: &mut [u8], value: &BigUint) {
    let bytes_le = value.to_bytes_le();
    out.fill(0);
    let n = bytes_le.len().min(out.len());
    out[..n].copy_from_slice(&bytes_le[..n]);
}

fn read_words_le(bytes: &[u8]) -> BigUint {
    BigUint::from_bytes_le(bytes)
}

fn biguint_to_u32(value: &BigUint) -> u32 {
    value.to_u32_digits().first().copied().unwrap_or(0)
}

/// Modular inverse of `a` mod `m` via the extended Euclidean algorithm.
/// Returns `None` if `gcd(a, m) != 1`.
fn mod_inverse(a: &BigUint, m: &BigUint) -> Option<BigUint> {
    let (g, x, _) = extended_gcd(&BigInt::from_biguint(Sign::Plus, a.clone()), &BigInt::from_biguint(Sign::Plus, m.clone()));
    if g != BigInt::one() {
        return None;
    }
    let m_i = BigInt::from_biguint(Sign::Plus, m.clone());
    let x = ((x % &m_i) + &m_i) % &m_i;
    x.to_biguint()
}

fn extended_gcd(a: &BigInt, b: &BigInt) -> (BigInt, BigInt, BigInt) {
    if b.is_zero() {
        (a.clone(), BigInt::one(), BigInt::zero())
    } else {
        let (g, x, y) = extended_gcd(b, &(a % b));
        let q = a / b;
        (g, y.clone(), x - q * y)
    }
}
