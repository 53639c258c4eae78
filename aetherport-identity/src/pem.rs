//! PEM envelopes for certificates and raw keys.
//!
//! Banners are part of the on-disk contract. Decoding consumes exactly one
//! block and hands back the remaining input so bundles of concatenated CAs can
//! be walked block by block.

use base64::{engine::general_purpose::STANDARD, Engine};

use crate::{Certificate, Error, ED25519_PRIVATE_KEY_LEN, KEY_LEN};

pub const CERTIFICATE_BANNER: &str = "AETHERPORT CERTIFICATE";
pub const ED25519_PRIVATE_KEY_BANNER: &str = "ED25519 PRIVATE KEY";
pub const ED25519_PUBLIC_KEY_BANNER: &str = "ED25519 PUBLIC KEY";
pub const X25519_PRIVATE_KEY_BANNER: &str = "X25519 PRIVATE KEY";
pub const X25519_PUBLIC_KEY_BANNER: &str = "X25519 PUBLIC KEY";

const LINE_LENGTH: usize = 64;

/// Encodes one PEM block with the given banner.
pub fn encode(banner: &str, der: &[u8]) -> String {
    let body = STANDARD.encode(der);

    let mut out = String::with_capacity(body.len() + body.len() / LINE_LENGTH + banner.len() * 2 + 32);
    out.push_str("-----BEGIN ");
    out.push_str(banner);
    out.push_str("-----\n");
    for chunk in body.as_bytes().chunks(LINE_LENGTH) {
        // base64 output is always ASCII
        out.push_str(std::str::from_utf8(chunk).unwrap());
        out.push('\n');
    }
    out.push_str("-----END ");
    out.push_str(banner);
    out.push_str("-----\n");
    out
}

/// Decodes the first PEM block found in `input`, returning its banner, its
/// contents and the input remaining after the block.
pub fn decode(input: &[u8]) -> Result<(String, Vec<u8>, &[u8]), Error> {
    let text = std::str::from_utf8(input).map_err(|_| Error::Pem("input is not valid UTF-8".to_string()))?;

    let begin = text
        .find("-----BEGIN ")
        .ok_or_else(|| Error::Pem("input did not contain a valid PEM encoded block".to_string()))?;
    let after_begin = &text[(begin + "-----BEGIN ".len())..];
    let banner_end = after_begin
        .find("-----")
        .ok_or_else(|| Error::Pem("unterminated BEGIN banner".to_string()))?;
    let banner = &after_begin[..banner_end];

    let body_start = begin + "-----BEGIN ".len() + banner_end + "-----".len();
    let end_marker = format!("-----END {banner}-----");
    let end = text[body_start..]
        .find(&end_marker)
        .map(|i| body_start + i)
        .ok_or_else(|| Error::Pem(format!("missing end banner: {end_marker}")))?;

    let body: String = text[body_start..end].chars().filter(|c| !c.is_whitespace()).collect();
    let der = STANDARD
        .decode(body)
        .map_err(|error| Error::Pem(format!("invalid base64 body: {error}")))?;

    let rest_at = end + end_marker.len();
    let rest_at = match text[rest_at..].starts_with('\n') {
        true => rest_at + 1,
        false => rest_at,
    };

    Ok((banner.to_string(), der, &input[rest_at..]))
}

fn decode_expecting<'a>(input: &'a [u8], banner: &str, len: usize) -> Result<(Vec<u8>, &'a [u8]), Error> {
    let (found, der, rest) = decode(input)?;
    if found != banner {
        return Err(Error::Pem(format!("bytes did not contain a proper banner: expected {banner}, found {found}")));
    }
    if der.len() != len {
        return Err(Error::Pem(format!("block length is not the proper length ({} of {len})", der.len())));
    }
    Ok((der, rest))
}

pub fn certificate_to_pem(cert: &Certificate) -> Result<String, Error> {
    Ok(encode(CERTIFICATE_BANNER, &cert.marshal()?))
}

/// Decodes one certificate block, returning the certificate and the rest of
/// the input.
pub fn certificate_from_pem(input: &[u8]) -> Result<(Certificate, &[u8]), Error> {
    let (banner, der, rest) = decode(input)?;
    if banner != CERTIFICATE_BANNER {
        return Err(Error::Pem(format!(
            "bytes did not contain a proper aetherport certificate banner: {CERTIFICATE_BANNER}"
        )));
    }
    Ok((Certificate::unmarshal(&der)?, rest))
}

pub fn ed25519_private_key_to_pem(key: &[u8]) -> String {
    encode(ED25519_PRIVATE_KEY_BANNER, key)
}

pub fn ed25519_private_key_from_pem(input: &[u8]) -> Result<(Vec<u8>, &[u8]), Error> {
    decode_expecting(input, ED25519_PRIVATE_KEY_BANNER, ED25519_PRIVATE_KEY_LEN)
}

pub fn ed25519_public_key_to_pem(key: &[u8]) -> String {
    encode(ED25519_PUBLIC_KEY_BANNER, key)
}

pub fn ed25519_public_key_from_pem(input: &[u8]) -> Result<(Vec<u8>, &[u8]), Error> {
    decode_expecting(input, ED25519_PUBLIC_KEY_BANNER, KEY_LEN)
}

pub fn x25519_private_key_to_pem(key: &[u8]) -> String {
    encode(X25519_PRIVATE_KEY_BANNER, key)
}

pub fn x25519_private_key_from_pem(input: &[u8]) -> Result<(Vec<u8>, &[u8]), Error> {
    decode_expecting(input, X25519_PRIVATE_KEY_BANNER, KEY_LEN)
}

pub fn x25519_public_key_to_pem(key: &[u8]) -> String {
    encode(X25519_PUBLIC_KEY_BANNER, key)
}

pub fn x25519_public_key_from_pem(input: &[u8]) -> Result<(Vec<u8>, &[u8]), Error> {
    decode_expecting(input, X25519_PUBLIC_KEY_BANNER, KEY_LEN)
}
