//! Gateway signature primitives.
//!
//! Every gateway signs a canonical string built from its request fields:
//! empty values are dropped, names are sorted byte-wise and the pairs are
//! joined as `name=value` with `&`. Alipay signs that string with
//! RSA-PKCS1v1.5-SHA256 (`RSA2`); WeChat Pay appends `key=<secret>` and takes
//! the uppercase hex MD5.

use crate::payments::error::{PaymentError, PaymentResult};
use crate::payments::utils::secure_eq;
use base64::prelude::*;
use md5::{Digest, Md5};
use rsa::pkcs1::{DecodeRsaPrivateKey, DecodeRsaPublicKey};
use rsa::pkcs1v15::{Signature, SigningKey, VerifyingKey};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey};
use rsa::signature::{SignatureEncoding, Signer, Verifier};
use rsa::{RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;

/// Fields Alipay excludes from the string it signs.
pub const ALIPAY_UNSIGNED_FIELDS: [&str; 2] = ["sign", "sign_type"];

/// Sorted, non-empty `(name, value)` pairs, skipping any name in `exclude`.
pub fn canonical_pairs<'a, I>(params: I, exclude: &[&str]) -> Vec<(String, String)>
where
    I: IntoIterator<Item = (&'a String, &'a String)>,
{
    let mut pairs: Vec<(String, String)> = params
        .into_iter()
        .filter(|(name, value)| !value.is_empty() && !exclude.contains(&name.as_str()))
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect();
    pairs.sort_by(|a, b| a.0.as_bytes().cmp(b.0.as_bytes()));
    pairs
}

/// `a=1&b=2` form of already-canonical pairs, without a trailing separator.
pub fn canonical_string(pairs: &[(String, String)]) -> String {
    pairs
        .iter()
        .map(|(name, value)| format!("{}={}", name, value))
        .collect::<Vec<_>>()
        .join("&")
}

// ---------------------------------------------------------------------------
// WeChat Pay (MD5)
// ---------------------------------------------------------------------------

pub fn wechat_string_to_sign(pairs: &[(String, String)], merchant_key: &str) -> String {
    let canonical = canonical_string(pairs);
    if canonical.is_empty() {
        format!("key={}", merchant_key)
    } else {
        format!("{}&key={}", canonical, merchant_key)
    }
}

pub fn wechat_md5_sign<'a, I>(params: I, merchant_key: &str) -> String
where
    I: IntoIterator<Item = (&'a String, &'a String)>,
{
    let pairs = canonical_pairs(params, &["sign"]);
    let digest = Md5::digest(wechat_string_to_sign(&pairs, merchant_key).as_bytes());
    hex::encode_upper(digest)
}

/// Recomputes the MD5 signature over every declared field except `sign`.
pub fn wechat_md5_verify<'a, I>(params: I, merchant_key: &str, signature: &str) -> bool
where
    I: IntoIterator<Item = (&'a String, &'a String)>,
{
    let expected = wechat_md5_sign(params, merchant_key);
    let provided = signature.trim().to_uppercase();
    secure_eq(expected.as_bytes(), provided.as_bytes())
}

// ---------------------------------------------------------------------------
// Alipay (RSA2)
// ---------------------------------------------------------------------------

fn key_error(message: impl Into<String>) -> PaymentError {
    PaymentError::KeyConfigError {
        message: message.into(),
    }
}

fn is_pem(raw: &str) -> bool {
    raw.contains("-----BEGIN")
}

fn decode_base64_der(raw: &str, what: &str) -> PaymentResult<Vec<u8>> {
    let compact: String = raw.split_whitespace().collect();
    BASE64_STANDARD
        .decode(compact.as_bytes())
        .map_err(|_| key_error(format!("{} is neither PEM nor base64 DER", what)))
}

/// Parses a merchant private key given as PEM or bare base64, PKCS#1 or PKCS#8.
pub fn parse_private_key(raw: &str) -> PaymentResult<RsaPrivateKey> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(key_error("private key is empty"));
    }

    if is_pem(raw) {
        return RsaPrivateKey::from_pkcs1_pem(raw)
            .or_else(|_| RsaPrivateKey::from_pkcs8_pem(raw))
            .map_err(|_| key_error("private key PEM is neither PKCS#1 nor PKCS#8 RSA"));
    }

    let der = decode_base64_der(raw, "private key")?;
    RsaPrivateKey::from_pkcs1_der(&der)
        .or_else(|_| RsaPrivateKey::from_pkcs8_der(&der))
        .map_err(|_| key_error("private key DER is neither PKCS#1 nor PKCS#8 RSA"))
}

/// Parses a gateway public key given as PEM or bare base64, SPKI or PKCS#1.
pub fn parse_public_key(raw: &str) -> PaymentResult<RsaPublicKey> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(key_error("public key is empty"));
    }

    if is_pem(raw) {
        return RsaPublicKey::from_public_key_pem(raw)
            .or_else(|_| RsaPublicKey::from_pkcs1_pem(raw))
            .map_err(|_| key_error("public key PEM is not an RSA public key"));
    }

    let der = decode_base64_der(raw, "public key")?;
    RsaPublicKey::from_public_key_der(&der)
        .or_else(|_| RsaPublicKey::from_pkcs1_der(&der))
        .map_err(|_| key_error("public key DER is not an RSA public key"))
}

pub fn rsa_sha256_sign(key: &RsaPrivateKey, content: &str) -> PaymentResult<String> {
    let signing_key = SigningKey::<Sha256>::new(key.clone());
    let signature = signing_key
        .try_sign(content.as_bytes())
        .map_err(|e| key_error(format!("RSA signing failed: {}", e)))?;
    Ok(BASE64_STANDARD.encode(signature.to_bytes()))
}

pub fn rsa_sha256_verify(key: &RsaPublicKey, content: &str, signature: &str) -> bool {
    let compact: String = signature.split_whitespace().collect();
    let raw = match BASE64_STANDARD.decode(compact.as_bytes()) {
        Ok(raw) => raw,
        Err(_) => return false,
    };
    let signature = match Signature::try_from(raw.as_slice()) {
        Ok(signature) => signature,
        Err(_) => return false,
    };
    VerifyingKey::<Sha256>::new(key.clone())
        .verify(content.as_bytes(), &signature)
        .is_ok()
}

pub fn alipay_sign<'a, I>(params: I, key: &RsaPrivateKey) -> PaymentResult<String>
where
    I: IntoIterator<Item = (&'a String, &'a String)>,
{
    let pairs = canonical_pairs(params, &["sign"]);
    rsa_sha256_sign(key, &canonical_string(&pairs))
}

/// Verifies an Alipay notification; `sign` and `sign_type` are not signed.
pub fn alipay_verify<'a, I>(params: I, key: &RsaPublicKey, signature: &str) -> bool
where
    I: IntoIterator<Item = (&'a String, &'a String)>,
{
    let pairs = canonical_pairs(params, &ALIPAY_UNSIGNED_FIELDS);
    rsa_sha256_verify(key, &canonical_string(&pairs), signature)
}
