// Copyright (c) 2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

//! The Ethereum-facing edges of the signing protocol: the bit-exact
//! EIP-1559 signing hash every signer recomputes before accepting a request,
//! and EIP-55 address derivation for the public address cache.

use crate::{
    errors::{CallerError, Result},
    utils::CurvePoint,
};
use serde::{Deserialize, Serialize};
use sha3::{Digest, Keccak256};
use std::collections::BTreeMap;

/// A dynamic-fee (type 2) transaction awaiting signature. The access list is
/// always empty in this wallet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Eip1559Transaction {
    pub chain_id: u64,
    pub nonce: u64,
    pub max_priority_fee_per_gas: u128,
    pub max_fee_per_gas: u128,
    pub gas: u64,
    /// Recipient address; `None` for contract creation.
    pub to: Option<[u8; 20]>,
    pub value: u128,
    #[serde(with = "hex_bytes")]
    pub data: Vec<u8>,
}

impl Eip1559Transaction {
    /// The unsigned payload: `0x02 || RLP([chainId, nonce,
    /// maxPriorityFeePerGas, maxFeePerGas, gas, to, value, data,
    /// accessList])`.
    pub fn signing_payload(&self) -> Vec<u8> {
        let fields = self.unsigned_fields();
        let mut out = vec![0x02];
        rlp_list(&mut out, &fields);
        out
    }

    fn unsigned_fields(&self) -> Vec<u8> {
        let mut fields = Vec::new();
        rlp_uint(&mut fields, self.chain_id as u128);
        rlp_uint(&mut fields, self.nonce as u128);
        rlp_uint(&mut fields, self.max_priority_fee_per_gas);
        rlp_uint(&mut fields, self.max_fee_per_gas);
        rlp_uint(&mut fields, self.gas as u128);
        match &self.to {
            Some(address) => rlp_bytes(&mut fields, address),
            None => rlp_bytes(&mut fields, &[]),
        }
        rlp_uint(&mut fields, self.value);
        rlp_bytes(&mut fields, &self.data);
        // Empty access list
        fields.push(0xc0);
        fields
    }

    /// The 32-byte signing hash: `keccak256(signing_payload)`.
    pub fn tx_hash(&self) -> [u8; 32] {
        let digest = Keccak256::digest(self.signing_payload());
        let mut hash = [0u8; 32];
        hash.copy_from_slice(&digest);
        hash
    }

    /// The hash as lowercase hex without a `0x` prefix, the form carried in
    /// signing requests.
    pub fn tx_hash_hex(&self) -> String {
        hex::encode(self.tx_hash())
    }

    /// The broadcastable transaction bytes once a signature is available:
    /// the unsigned fields followed by `[yParity, r, s]`.
    pub fn signed_bytes(&self, y_parity: bool, r: &[u8; 32], s: &[u8; 32]) -> Vec<u8> {
        let mut fields = self.unsigned_fields();
        rlp_uint(&mut fields, u128::from(y_parity));
        rlp_scalar_bytes(&mut fields, r);
        rlp_scalar_bytes(&mut fields, s);

        let mut out = vec![0x02];
        rlp_list(&mut out, &fields);
        out
    }
}

/// RLP-encode an unsigned integer as its minimal big-endian byte string.
fn rlp_uint(out: &mut Vec<u8>, value: u128) {
    let bytes = value.to_be_bytes();
    let first = bytes.iter().position(|&b| b != 0).unwrap_or(bytes.len());
    rlp_bytes(out, &bytes[first..]);
}

/// RLP-encode a signature component, dropping leading zero bytes.
fn rlp_scalar_bytes(out: &mut Vec<u8>, bytes: &[u8; 32]) {
    let first = bytes.iter().position(|&b| b != 0).unwrap_or(bytes.len());
    rlp_bytes(out, &bytes[first..]);
}

/// RLP-encode a byte string.
fn rlp_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    match bytes.len() {
        1 if bytes[0] < 0x80 => out.push(bytes[0]),
        len if len <= 55 => {
            out.push(0x80 + len as u8);
            out.extend_from_slice(bytes);
        }
        len => {
            let len_bytes = minimal_be(len as u64);
            out.push(0xb7 + len_bytes.len() as u8);
            out.extend_from_slice(&len_bytes);
            out.extend_from_slice(bytes);
        }
    }
}

/// RLP-encode a list from its already-encoded payload.
fn rlp_list(out: &mut Vec<u8>, payload: &[u8]) {
    match payload.len() {
        len if len <= 55 => out.push(0xc0 + len as u8),
        len => {
            let len_bytes = minimal_be(len as u64);
            out.push(0xf7 + len_bytes.len() as u8);
            out.extend_from_slice(&len_bytes);
        }
    }
    out.extend_from_slice(payload);
}

fn minimal_be(value: u64) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let first = bytes.iter().position(|&b| b != 0).unwrap_or(bytes.len() - 1);
    bytes[first..].to_vec()
}

/// Derive the 20-byte Ethereum address for a public key: keccak256 of the
/// uncompressed point without its SEC1 prefix, last 20 bytes.
pub fn address_bytes(public_key: &CurvePoint) -> [u8; 20] {
    let uncompressed = public_key.to_uncompressed_bytes();
    let digest = Keccak256::digest(&uncompressed[1..]);
    let mut address = [0u8; 20];
    address.copy_from_slice(&digest[12..]);
    address
}

/// Apply EIP-55 mixed-case checksumming to an address.
///
/// A nibble is uppercased when the corresponding nibble of
/// `keccak256(lowercase_hex)` is at least 8. Checksumming bytes is
/// idempotent by construction.
pub fn eip55_address(address: &[u8; 20]) -> String {
    let lower = hex::encode(address);
    let digest = Keccak256::digest(lower.as_bytes());

    let mut out = String::with_capacity(42);
    out.push_str("0x");
    for (position, ch) in lower.chars().enumerate() {
        let hash_nibble = if position % 2 == 0 {
            digest[position / 2] >> 4
        } else {
            digest[position / 2] & 0x0f
        };
        if ch.is_ascii_alphabetic() && hash_nibble >= 8 {
            out.push(ch.to_ascii_uppercase());
        } else {
            out.push(ch);
        }
    }
    out
}

/// The checksummed receive address for a public key.
pub fn checksummed_address(public_key: &CurvePoint) -> String {
    eip55_address(&address_bytes(public_key))
}

/// One derived address in the public cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddressCacheEntry {
    pub path: String,
    /// 33-byte compressed public key, hex.
    pub pubkey: String,
    /// EIP-55 checksummed address.
    pub address: String,
    /// Milliseconds since the epoch at derivation time.
    pub derived_at: u64,
}

/// The unencrypted sidecar of derived receive addresses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddressCache {
    /// 33-byte compressed master public key, hex.
    pub pk_master: String,
    pub derivation_root: String,
    pub entries: BTreeMap<u32, AddressCacheEntry>,
}

impl AddressCache {
    /// An empty cache for the given master key.
    pub fn new(pk_master: &CurvePoint) -> Self {
        Self {
            pk_master: hex::encode(pk_master.to_compressed_bytes()),
            derivation_root: crate::derive::DERIVATION_ROOT.to_string(),
            entries: BTreeMap::new(),
        }
    }

    /// Derive and record the address for `index`.
    pub fn insert(
        &mut self,
        master: &CurvePoint,
        chain_code: &[u8; 32],
        index: u32,
        now_ms: u64,
    ) -> Result<&AddressCacheEntry> {
        let child = crate::derive::child_public_key(master, chain_code, index)?;
        let entry = AddressCacheEntry {
            path: crate::derive::DerivationPath::for_index(index)?.as_str().to_string(),
            pubkey: hex::encode(child.to_compressed_bytes()),
            address: checksummed_address(&child),
            derived_at: now_ms,
        };
        Ok(self.entries.entry(index).or_insert(entry))
    }
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(s.trim_start_matches("0x")).map_err(serde::de::Error::custom)
    }
}

/// Decode a 32-byte hash from its hex form, accepting an optional `0x`
/// prefix.
pub fn parse_tx_hash(hash_hex: &str) -> Result<[u8; 32]> {
    let bytes = hex::decode(hash_hex.trim_start_matches("0x"))
        .map_err(|_| CallerError::InvalidArgument(String::from("tx hash is not valid hex")))?;
    bytes.try_into().map_err(|_| {
        CallerError::InvalidArgument(String::from("tx hash must be 32 bytes")).into()
    })
}
