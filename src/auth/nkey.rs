//! NKeys: ed25519 key pairs in a textual encoding that carries the key's role.
//!
//! An encoded key is the base32 (RFC 4648 alphabet, no padding) representation of
//!  `prefix || key bytes || crc16`, with the CRC-16/XMODEM checksum in little endian. Public
//!  keys have a one byte prefix naming the role ('U' for users, 'A' for accounts etc. after
//!  encoding). Seeds have a two byte prefix that packs the seed marker and the role into the
//!  first ten bits, which is why every seed starts with 'S' followed by the role letter.

use anyhow::{anyhow, bail};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use crc::{Crc, CRC_16_XMODEM};
use ring::signature::{Ed25519KeyPair, KeyPair as _};

const PREFIX_BYTE_SEED: u8 = 18 << 3;
const PREFIX_BYTE_ACCOUNT: u8 = 0;
const PREFIX_BYTE_CLUSTER: u8 = 2 << 3;
const PREFIX_BYTE_SERVER: u8 = 13 << 3;
const PREFIX_BYTE_OPERATOR: u8 = 14 << 3;
const PREFIX_BYTE_USER: u8 = 20 << 3;

const SEED_LEN: usize = 32;

const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_XMODEM);

const BASE32_ALPHABET: &[u8; 32] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";

/// A key pair decoded from a seed, able to sign server nonces
pub struct KeyPair {
    prefix: u8,
    key_pair: Ed25519KeyPair,
}
impl KeyPair {
    pub fn from_seed(seed: &str) -> anyhow::Result<KeyPair> {
        let seed = seed.trim();
        if seed.is_empty() {
            bail!("NKey seed is blank");
        }

        let raw = decode_checked(seed)?;
        if raw.len() != 2 + SEED_LEN {
            bail!("NKey seed has invalid length");
        }
        if raw[0] & 0xf8 != PREFIX_BYTE_SEED {
            bail!("not an NKey seed");
        }
        let prefix = ((raw[0] & 0x07) << 5) | ((raw[1] & 0xf8) >> 3);
        if !is_valid_role(prefix) {
            bail!("NKey seed has unknown role prefix {}", prefix);
        }

        let key_pair = Ed25519KeyPair::from_seed_unchecked(&raw[2..])
            .map_err(|e| anyhow!("invalid ed25519 seed: {}", e))?;
        Ok(KeyPair { prefix, key_pair })
    }

    /// the encoded public key, which the server uses to look up the user
    pub fn public_key(&self) -> String {
        let mut raw = Vec::with_capacity(1 + SEED_LEN + 2);
        raw.push(self.prefix);
        raw.extend_from_slice(self.key_pair.public_key().as_ref());
        encode_checked(raw)
    }

    pub fn sign(&self, payload: &[u8]) -> Vec<u8> {
        self.key_pair.sign(payload).as_ref().to_vec()
    }

    /// the signature in the encoding CONNECT expects
    pub fn sign_base64(&self, payload: &[u8]) -> String {
        URL_SAFE_NO_PAD.encode(self.sign(payload))
    }
}

/// Signs `nonce` with the key pair encoded in `seed`, returning the URL-safe base64 signature
pub fn sign_nonce(seed: &str, nonce: &str) -> anyhow::Result<String> {
    Ok(KeyPair::from_seed(seed)?.sign_base64(nonce.as_bytes()))
}

fn is_valid_role(prefix: u8) -> bool {
    matches!(prefix, PREFIX_BYTE_ACCOUNT | PREFIX_BYTE_CLUSTER | PREFIX_BYTE_SERVER | PREFIX_BYTE_OPERATOR | PREFIX_BYTE_USER)
}

/// Encodes a raw seed for the given role prefix
pub fn encode_seed(role_prefix: u8, seed: &[u8; SEED_LEN]) -> String {
    let mut raw = Vec::with_capacity(2 + SEED_LEN + 2);
    raw.push(PREFIX_BYTE_SEED | (role_prefix >> 5));
    raw.push((role_prefix & 0x1f) << 3);
    raw.extend_from_slice(seed);
    encode_checked(raw)
}

/// the role prefix for user keys, for use with [encode_seed]
pub const USER_ROLE: u8 = PREFIX_BYTE_USER;

fn encode_checked(mut raw: Vec<u8>) -> String {
    let crc = CRC16.checksum(&raw);
    raw.extend_from_slice(&crc.to_le_bytes());
    base32_encode(&raw)
}

fn decode_checked(s: &str) -> anyhow::Result<Vec<u8>> {
    let mut raw = base32_decode(s)?;
    if raw.len() < 3 {
        bail!("encoded NKey is too short");
    }
    let crc_bytes = raw.split_off(raw.len() - 2);
    let expected = u16::from_le_bytes([crc_bytes[0], crc_bytes[1]]);
    if CRC16.checksum(&raw) != expected {
        bail!("NKey checksum mismatch");
    }
    Ok(raw)
}

fn base32_encode(data: &[u8]) -> String {
    let mut result = String::with_capacity(data.len() * 8 / 5 + 1);
    let mut buffer: u32 = 0;
    let mut bits = 0;
    for &b in data {
        buffer = (buffer << 8) | b as u32;
        bits += 8;
        while bits >= 5 {
            bits -= 5;
            result.push(BASE32_ALPHABET[((buffer >> bits) & 0x1f) as usize] as char);
        }
    }
    if bits > 0 {
        result.push(BASE32_ALPHABET[((buffer << (5 - bits)) & 0x1f) as usize] as char);
    }
    result
}

fn base32_decode(s: &str) -> anyhow::Result<Vec<u8>> {
    let mut result = Vec::with_capacity(s.len() * 5 / 8);
    let mut buffer: u32 = 0;
    let mut bits = 0;
    for c in s.bytes() {
        let value = match c {
            b'A'..=b'Z' => c - b'A',
            b'2'..=b'7' => c - b'2' + 26,
            _ => bail!("invalid base32 character {:?}", c as char),
        };
        buffer = (buffer << 5) | value as u32;
        bits += 5;
        if bits >= 8 {
            bits -= 8;
            result.push((buffer >> bits) as u8);
        }
    }
    Ok(result)
}
