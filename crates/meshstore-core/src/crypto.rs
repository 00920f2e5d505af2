//! Crypto primitives (spec §4.1, C1)
//!
//! All crypto uses the Curve25519/XSalsa20-Poly1305/Ed25519 family: `crypto_box`
//! for peer-to-peer authenticated encryption, `xsalsa20poly1305` directly for
//! symmetric encryption with a pre-shared key, `ed25519-dalek` for detached
//! signatures, and `scrypt` for password-based key derivation. No hidden
//! randomness once a nonce is supplied (every `_with_nonce` path is deterministic).

use crate::error::{Error, Result};
use crypto_box::{PublicKey as BoxPublicKey, SalsaBox, SecretKey as BoxSecretKey};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand_core::{OsRng, RngCore};
use scrypt::Params as ScryptParams;
use xsalsa20poly1305::{
    aead::{Aead, KeyInit},
    Key as SymKeyBytes, Nonce as SymNonce, XSalsa20Poly1305,
};

pub const NONCE_LEN: usize = 24;
pub const SYM_KEY_LEN: usize = 32;
pub const BOX_PUBLIC_LEN: usize = 32;
pub const BOX_SECRET_LEN: usize = 32;
pub const SIGN_PUBLIC_LEN: usize = 32;
pub const SIGN_SECRET_LEN: usize = 64;
pub const SALT_MIN_LEN: usize = 16;

/// scrypt cost parameters fixed at instance initialization (spec §6). `log2(n)=15`,
/// `r=8`, `p=1` matches the scrypt crate's own "interactive" recommendation and is
/// the value every instance in a mesh must agree on to derive the same key.
pub fn scrypt_params() -> ScryptParams {
    ScryptParams::new(15, 8, 1, SYM_KEY_LEN).expect("fixed scrypt parameters are always valid")
}

fn ensure_len(bytes: &[u8], expected: usize, what: &'static str) -> Result<()> {
    if bytes.len() != expected {
        return Err(Error::MalformedKey(format!(
            "{what}: expected {expected} bytes, found {}",
            bytes.len()
        )));
    }
    Ok(())
}

/// Generate a fresh random 24-byte nonce.
pub fn random_nonce() -> [u8; NONCE_LEN] {
    let mut out = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut out);
    out
}

/// Generate a fresh random 32-byte symmetric key.
pub fn random_symmetric_key() -> [u8; SYM_KEY_LEN] {
    let mut out = [0u8; SYM_KEY_LEN];
    OsRng.fill_bytes(&mut out);
    out
}

/// Generate a new Curve25519 box keypair: `(public, secret)`.
pub fn new_box_keypair() -> ([u8; BOX_PUBLIC_LEN], [u8; BOX_SECRET_LEN]) {
    let secret = BoxSecretKey::generate(&mut OsRng);
    let public = secret.public_key();
    (*public.as_bytes(), *secret.as_bytes())
}

/// Generate a new Ed25519 signing keypair: `(public, secret)`. The secret is the
/// 64-byte expanded form (seed || public) so callers never need to recompute it.
pub fn new_sign_keypair() -> ([u8; SIGN_PUBLIC_LEN], [u8; SIGN_SECRET_LEN]) {
    let signing_key = SigningKey::generate(&mut OsRng);
    let public = signing_key.verifying_key().to_bytes();
    let mut secret = [0u8; SIGN_SECRET_LEN];
    secret[..32].copy_from_slice(&signing_key.to_bytes());
    secret[32..].copy_from_slice(&public);
    (public, secret)
}

/// Derive a 32-byte symmetric key from a password via scrypt. `salt` must be at
/// least [`SALT_MIN_LEN`] bytes.
pub fn derive_symmetric_from_secret(password: &[u8], salt: &[u8]) -> Result<[u8; SYM_KEY_LEN]> {
    if salt.len() < SALT_MIN_LEN {
        return Err(Error::MalformedSalt(format!(
            "salt must be at least {SALT_MIN_LEN} bytes, found {}",
            salt.len()
        )));
    }
    let mut out = [0u8; SYM_KEY_LEN];
    scrypt::scrypt(password, salt, &scrypt_params(), &mut out)
        .map_err(|e| Error::MalformedSalt(e.to_string()))?;
    Ok(out)
}

/// Authenticated symmetric encryption. Decrypting with a flipped bit anywhere in
/// `cypher` fails with [`Error::TamperedCiphertext`].
pub fn symmetric_encrypt(plain: &[u8], key: &[u8], nonce: &[u8]) -> Result<Vec<u8>> {
    ensure_len(key, SYM_KEY_LEN, "symmetric key")?;
    ensure_len(nonce, NONCE_LEN, "nonce")?;
    let cipher = XSalsa20Poly1305::new(SymKeyBytes::from_slice(key));
    cipher
        .encrypt(SymNonce::from_slice(nonce), plain)
        .map_err(|_| Error::TamperedCiphertext)
}

/// Inverse of [`symmetric_encrypt`].
pub fn symmetric_decrypt(cypher: &[u8], key: &[u8], nonce: &[u8]) -> Result<Vec<u8>> {
    ensure_len(key, SYM_KEY_LEN, "symmetric key")?;
    ensure_len(nonce, NONCE_LEN, "nonce")?;
    let cipher = XSalsa20Poly1305::new(SymKeyBytes::from_slice(key));
    cipher
        .decrypt(SymNonce::from_slice(nonce), cypher)
        .map_err(|_| Error::TamperedCiphertext)
}

/// Symmetric encryption that embeds the nonce as a prefix of the returned bytes:
/// `nonce || cypher`. If `nonce` is omitted, one is generated.
pub fn symmetric_encrypt_embed_nonce(plain: &[u8], key: &[u8], nonce: Option<[u8; NONCE_LEN]>) -> Result<Vec<u8>> {
    let nonce = nonce.unwrap_or_else(random_nonce);
    let cypher = symmetric_encrypt(plain, key, &nonce)?;
    let mut out = Vec::with_capacity(NONCE_LEN + cypher.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&cypher);
    Ok(out)
}

/// Inverse of [`symmetric_encrypt_embed_nonce`].
pub fn symmetric_decrypt_embed_nonce(nonce_and_cypher: &[u8], key: &[u8]) -> Result<Vec<u8>> {
    if nonce_and_cypher.len() < NONCE_LEN {
        return Err(Error::MalformedNonce(format!(
            "payload shorter than nonce prefix: {} bytes",
            nonce_and_cypher.len()
        )));
    }
    let (nonce, cypher) = nonce_and_cypher.split_at(NONCE_LEN);
    symmetric_decrypt(cypher, key, nonce)
}

/// Peer-to-peer authenticated encryption: derives a shared symmetric key from
/// `(my_sec, their_pub)` via curve25519 then applies [`symmetric_encrypt`].
pub fn peer_encrypt(plain: &[u8], my_sec: &[u8], their_pub: &[u8], nonce: &[u8]) -> Result<Vec<u8>> {
    ensure_len(my_sec, BOX_SECRET_LEN, "box secret key")?;
    ensure_len(their_pub, BOX_PUBLIC_LEN, "box public key")?;
    ensure_len(nonce, NONCE_LEN, "nonce")?;
    let secret = BoxSecretKey::from(<[u8; BOX_SECRET_LEN]>::try_from(my_sec).unwrap());
    let public = BoxPublicKey::from(<[u8; BOX_PUBLIC_LEN]>::try_from(their_pub).unwrap());
    let salsa_box = SalsaBox::new(&public, &secret);
    salsa_box
        .encrypt(SymNonce::from_slice(nonce), plain)
        .map_err(|_| Error::TamperedCiphertext)
}

/// Inverse of [`peer_encrypt`].
pub fn peer_decrypt(cypher: &[u8], my_sec: &[u8], their_pub: &[u8], nonce: &[u8]) -> Result<Vec<u8>> {
    ensure_len(my_sec, BOX_SECRET_LEN, "box secret key")?;
    ensure_len(their_pub, BOX_PUBLIC_LEN, "box public key")?;
    ensure_len(nonce, NONCE_LEN, "nonce")?;
    let secret = BoxSecretKey::from(<[u8; BOX_SECRET_LEN]>::try_from(my_sec).unwrap());
    let public = BoxPublicKey::from(<[u8; BOX_PUBLIC_LEN]>::try_from(their_pub).unwrap());
    let salsa_box = SalsaBox::new(&public, &secret);
    salsa_box
        .decrypt(SymNonce::from_slice(nonce), cypher)
        .map_err(|_| Error::TamperedCiphertext)
}

/// Detached Ed25519 signature over `data` using the 64-byte expanded secret key.
pub fn sign(data: &[u8], sec_sig: &[u8]) -> Result<[u8; 64]> {
    ensure_len(sec_sig, SIGN_SECRET_LEN, "sign secret key")?;
    let seed: [u8; 32] = sec_sig[..32].try_into().unwrap();
    let signing_key = SigningKey::from_bytes(&seed);
    Ok(signing_key.sign(data).to_bytes())
}

/// Verify a detached Ed25519 signature. Never errors; a malformed key or
/// signature simply fails to verify.
pub fn verify(data: &[u8], sig: &[u8; 64], pub_sig: &[u8]) -> bool {
    let Ok(public_bytes) = <[u8; SIGN_PUBLIC_LEN]>::try_from(pub_sig) else {
        return false;
    };
    let Ok(verifying_key) = VerifyingKey::from_bytes(&public_bytes) else {
        return false;
    };
    let signature = Signature::from_bytes(sig);
    verifying_key.verify(data, &signature).is_ok()
}
