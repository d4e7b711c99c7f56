// Copyright (c) 2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

//! Non-hardened child key derivation.
//!
//! Child keys are additive tweaks of the master key: signing incorporates
//! the tweak into each signer's share, so the resulting signature verifies
//! under the derived child public key. Hardened derivation requires the
//! private key and is unsupported by construction.

use crate::{
    errors::{CallerError, Result},
    utils::{scalar_from_be_bytes, CurvePoint},
};
use hmac::Mac;
use k256::Scalar;

type HmacSha512 = hmac::Hmac<sha2::Sha512>;

/// The fixed account prefix under which receive addresses are derived.
pub const DERIVATION_ROOT: &str = "m/44'/60'/0'/0";

/// A parsed derivation path. Only the final, non-hardened address index
/// participates in the tweak.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DerivationPath {
    raw: String,
    index: u32,
}

impl DerivationPath {
    /// Parse a BIP44-style path, e.g. `m/44'/60'/0'/0/7`.
    ///
    /// The final component must be a non-hardened index.
    pub fn parse(path: &str) -> Result<Self> {
        let mut components = path.split('/');
        if components.next() != Some("m") {
            Err(CallerError::InvalidArgument(String::from(
                "derivation path must start with `m/`",
            )))?;
        }

        let mut last: Option<&str> = None;
        for component in components {
            let digits = component.strip_suffix('\'').unwrap_or(component);
            if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
                Err(CallerError::InvalidArgument(String::from(
                    "derivation path component is not an index",
                )))?;
            }
            last = Some(component);
        }

        let last = last.ok_or_else(|| {
            CallerError::InvalidArgument(String::from("derivation path has no index components"))
        })?;
        if last.ends_with('\'') {
            Err(CallerError::HardenedDerivationUnsupported)?;
        }
        let index: u32 = last.parse().map_err(|_| {
            CallerError::InvalidArgument(String::from("address index does not fit in 31 bits"))
        })?;
        if index >= 0x8000_0000 {
            Err(CallerError::HardenedDerivationUnsupported)?;
        }

        Ok(Self {
            raw: path.to_string(),
            index,
        })
    }

    /// Build the display path for an address index under
    /// [`DERIVATION_ROOT`].
    pub fn for_index(index: u32) -> Result<Self> {
        Self::parse(&format!("{DERIVATION_ROOT}/{index}"))
    }

    /// The final address index.
    pub fn index(&self) -> u32 {
        self.index
    }

    /// The path as given.
    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

/// Compute the additive tweak `T` for the child at `index`.
///
/// Two chained HMAC-SHA512 steps, both keyed by the parent chain code: first
/// over `(parent pubkey, 0)` for the change level, then over the resulting
/// intermediate key and the address index. The left halves of the two
/// outputs, each reduced mod `q`, sum to the tweak.
pub(crate) fn child_tweak(
    master: &CurvePoint,
    chain_code: &[u8; 32],
    index: u32,
) -> Result<Scalar> {
    let t1 = tweak_step(master, chain_code, 0)?;
    let intermediate = *master + CurvePoint::GENERATOR.multiply_by_scalar(&t1);
    let t2 = tweak_step(&intermediate, chain_code, index)?;
    Ok(t1 + t2)
}

/// The derived child public key `P + T * G`.
pub fn child_public_key(
    master: &CurvePoint,
    chain_code: &[u8; 32],
    index: u32,
) -> Result<CurvePoint> {
    let tweak = child_tweak(master, chain_code, index)?;
    Ok(*master + CurvePoint::GENERATOR.multiply_by_scalar(&tweak))
}

fn tweak_step(parent: &CurvePoint, chain_code: &[u8; 32], index: u32) -> Result<Scalar> {
    let mut mac = HmacSha512::new_from_slice(chain_code)
        .expect("this never fails: hmac can handle keys of any size");
    mac.update(&parent.to_compressed_bytes());
    mac.update(&index.to_be_bytes());
    let output = mac.finalize().into_bytes();

    let mut left = [0u8; 32];
    left.copy_from_slice(&output[..32]);
    scalar_from_be_bytes(&left)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::{random_nonzero_scalar, testing::init_testing};

    #[test]
    fn paths_parse_and_reject_hardened_indices() {
        let path = DerivationPath::parse("m/44'/60'/0'/0/42").unwrap();
        assert_eq!(path.index(), 42);
        assert_eq!(path.as_str(), "m/44'/60'/0'/0/42");

        assert!(DerivationPath::parse("m/44'/60'/0'/0/42'").is_err());
        assert!(DerivationPath::parse("m/44'/60'/0'/0/2147483648").is_err());
        assert!(DerivationPath::parse("44'/60'/0'/0/1").is_err());
        assert!(DerivationPath::parse("m/44'/x/0").is_err());
        assert!(DerivationPath::parse("m").is_err());

        assert_eq!(DerivationPath::for_index(7).unwrap().index(), 7);
    }

    #[test]
    fn tweak_is_deterministic_and_index_dependent() {
        let mut rng = init_testing();
        let secret = random_nonzero_scalar(&mut rng).unwrap();
        let master = CurvePoint::GENERATOR.multiply_by_scalar(&secret);
        let chain_code = [7u8; 32];

        let t_a = child_tweak(&master, &chain_code, 1).unwrap();
        let t_b = child_tweak(&master, &chain_code, 1).unwrap();
        let t_c = child_tweak(&master, &chain_code, 2).unwrap();
        assert_eq!(t_a, t_b);
        assert_ne!(t_a, t_c);
    }

    #[test]
    fn tweaked_private_key_matches_child_public_key() {
        let mut rng = init_testing();
        let secret = random_nonzero_scalar(&mut rng).unwrap();
        let master = CurvePoint::GENERATOR.multiply_by_scalar(&secret);
        let chain_code = [3u8; 32];

        let tweak = child_tweak(&master, &chain_code, 5).unwrap();
        let child = child_public_key(&master, &chain_code, 5).unwrap();
        assert_eq!(
            CurvePoint::GENERATOR.multiply_by_scalar(&(secret + tweak)),
            child
        );
    }
}
