//! Encode an X.509 certificate as PEM, or as a Java KeyStore holding a
//! single trusted-certificate entry named `proxy`.
//!
//! There is no maintained JKS *writer* crate, so [`to_jks`] follows the
//! documented binary layout (magic `0xFEEDFEED`, format version 2, one
//! trusted-cert entry, SHA-1 keyed integrity digest) by hand.

use anyhow::Result;
use chrono::Utc;
use pem::Pem;
use sha1::{Digest, Sha1};

const JKS_MAGIC: u32 = 0xFEED_FEED;
const JKS_VERSION: u32 = 2;
const JKS_TRUSTED_CERT_TAG: u32 = 2;
const JKS_ALIAS: &str = "proxy";
const JKS_CERT_TYPE: &str = "X.509";
/// The fixed salt JKS mixes into its integrity digest, ahead of the
/// keystore bytes, alongside the (here, empty) store password.
const JKS_DIGEST_SALT: &str = "Mighty Aphrodite";

/// A DER-encoded X.509 certificate.
#[derive(Debug, Clone)]
pub struct Certificate {
    der: Vec<u8>,
}

impl Certificate {
    pub fn from_der(der: Vec<u8>) -> Self {
        Self { der }
    }

    pub fn der(&self) -> &[u8] {
        &self.der
    }
}

/// Encode `cert` as a single `CERTIFICATE` PEM block.
pub fn to_pem(cert: &Certificate) -> String {
    pem::encode(&Pem::new("CERTIFICATE", cert.der.to_vec()))
}

/// Encode `cert` as a Java KeyStore containing one trusted-certificate
/// entry named `proxy`, creation time now, empty store password.
pub fn to_jks(cert: &Certificate) -> Result<Vec<u8>> {
    let mut body = Vec::with_capacity(cert.der.len() + 128);

    body.extend_from_slice(&JKS_MAGIC.to_be_bytes());
    body.extend_from_slice(&JKS_VERSION.to_be_bytes());
    body.extend_from_slice(&1u32.to_be_bytes()); // entry count

    body.extend_from_slice(&JKS_TRUSTED_CERT_TAG.to_be_bytes());
    write_utf(&mut body, JKS_ALIAS);
    body.extend_from_slice(&Utc::now().timestamp_millis().to_be_bytes());
    write_utf(&mut body, JKS_CERT_TYPE);
    body.extend_from_slice(&(cert.der.len() as u32).to_be_bytes());
    body.extend_from_slice(&cert.der);

    let digest = integrity_digest(&body);

    let mut out = body;
    out.extend_from_slice(&digest);
    Ok(out)
}

/// JKS string fields are length-prefixed "modified UTF-8"; for the
/// plain-ASCII aliases/types this crate writes, that's identical to
/// ordinary UTF-8.
fn write_utf(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(&(s.len() as u16).to_be_bytes());
    buf.extend_from_slice(s.as_bytes());
}

/// `SHA1(UTF-16BE(password) || "Mighty Aphrodite" || keystore_bytes)`,
/// with an empty store password.
fn integrity_digest(data: &[u8]) -> [u8; 20] {
    let mut hasher = Sha1::new();
    hasher.update(JKS_DIGEST_SALT.as_bytes());
    hasher.update(data);
    hasher.finalize().into()
}
