// Copyright (c) 2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

//! Curve and scalar helpers shared across the protocols.

use crate::errors::{InternalError, Result};
use generic_array::GenericArray;
use k256::{
    elliptic_curve::{
        bigint::Encoding,
        group::{ff::PrimeField, Group},
        sec1::{FromEncodedPoint, ToEncodedPoint},
        Curve, Field,
    },
    AffinePoint, EncodedPoint, Scalar, Secp256k1,
};
use libpaillier::unknown_order::BigNumber;
use merlin::Transcript;
use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

pub(crate) const CRYPTOGRAPHIC_RETRY_MAX: usize = 500usize;

/// Wrapper around `k256::ProjectivePoint` so that we can define our own
/// serialization/deserialization for it.
#[derive(Eq, PartialEq, Debug, Clone, Copy)]
pub struct CurvePoint(pub(crate) k256::ProjectivePoint);

impl CurvePoint {
    pub(crate) const GENERATOR: Self = CurvePoint(k256::ProjectivePoint::GENERATOR);
    /// The identity point, used to initialize point aggregation.
    pub const IDENTITY: Self = CurvePoint(k256::ProjectivePoint::IDENTITY);

    /// Multiply the point by a scalar.
    pub(crate) fn multiply_by_scalar(&self, scalar: &Scalar) -> Self {
        Self(self.0 * scalar)
    }

    /// The 33-byte compressed SEC1 encoding.
    pub fn to_compressed_bytes(&self) -> [u8; 33] {
        let mut bytes = [0u8; 33];
        bytes.copy_from_slice(self.0.to_affine().to_encoded_point(true).as_bytes());
        bytes
    }

    /// The 65-byte uncompressed SEC1 encoding.
    pub(crate) fn to_uncompressed_bytes(&self) -> [u8; 65] {
        let mut bytes = [0u8; 65];
        bytes.copy_from_slice(self.0.to_affine().to_encoded_point(false).as_bytes());
        bytes
    }

    /// Decode a point from its compressed SEC1 encoding.
    pub fn from_compressed_bytes(bytes: &[u8]) -> Result<Self> {
        let encoded =
            EncodedPoint::from_bytes(bytes).map_err(|_| InternalError::Serialization)?;
        Option::from(AffinePoint::from_encoded_point(&encoded))
            .map(|affine: AffinePoint| Self(affine.into()))
            .ok_or(InternalError::Serialization)
    }

    /// The x-coordinate, reduced modulo the curve order. This is the `r`
    /// component of an ECDSA signature over this point.
    pub(crate) fn x_projection(&self) -> Result<Scalar> {
        let encoded = self.0.to_affine().to_encoded_point(false);
        let x_bytes = encoded.x().ok_or(InternalError::InternalInvariantFailed)?;
        bn_to_scalar(&(BigNumber::from_slice(x_bytes) % k256_order()))
    }

    /// Whether the affine y-coordinate is odd.
    pub(crate) fn y_is_odd(&self) -> bool {
        // Compressed SEC1 tag: 0x02 for even y, 0x03 for odd.
        self.0.to_affine().to_encoded_point(true).as_bytes()[0] == 0x03
    }

    /// `true` for the identity point.
    pub(crate) fn is_identity(&self) -> bool {
        bool::from(self.0.is_identity())
    }
}

impl From<k256::ProjectivePoint> for CurvePoint {
    fn from(p: k256::ProjectivePoint) -> Self {
        Self(p)
    }
}

impl std::ops::Add for CurvePoint {
    type Output = Self;

    fn add(self, rhs: Self) -> Self::Output {
        Self(self.0 + rhs.0)
    }
}

impl Serialize for CurvePoint {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let afp = AffinePoint::from(self.0);
        afp.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for CurvePoint {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let p = AffinePoint::deserialize(deserializer)?;
        Ok(Self(p.into()))
    }
}

/// Sample a scalar uniformly from `[0, q)` by rejection-sampling 32 bytes.
pub(crate) fn random_scalar<R: RngCore + CryptoRng>(rng: &mut R) -> Result<Scalar> {
    for _ in 0..CRYPTOGRAPHIC_RETRY_MAX {
        let mut bytes = [0u8; 32];
        rng.fill_bytes(&mut bytes);
        let candidate: Option<Scalar> =
            Option::from(Scalar::from_repr(GenericArray::clone_from_slice(&bytes)));
        if let Some(scalar) = candidate {
            return Ok(scalar);
        }
    }
    Err(InternalError::RetryFailed)
}

/// Sample a scalar uniformly from `[1, q)`. Secrets and nonces must never be
/// zero.
pub(crate) fn random_nonzero_scalar<R: RngCore + CryptoRng>(rng: &mut R) -> Result<Scalar> {
    for _ in 0..CRYPTOGRAPHIC_RETRY_MAX {
        let candidate = random_scalar(rng)?;
        if !bool::from(candidate.is_zero()) {
            return Ok(candidate);
        }
    }
    Err(InternalError::RetryFailed)
}

/// Derive a scalar challenge in `[0, q)` from the [`Transcript`].
///
/// To avoid sampling bias we can't reduce a 32-byte challenge modulo `q`;
/// instead we re-draw until the challenge is in range. Each draw advances the
/// transcript, so both sides stay in sync as long as they run the same loop.
pub(crate) fn challenge_scalar(transcript: &mut Transcript, label: &'static [u8]) -> Scalar {
    loop {
        let mut bytes = [0u8; 32];
        transcript.challenge_bytes(label, &mut bytes);
        let candidate: Option<Scalar> =
            Option::from(Scalar::from_repr(GenericArray::clone_from_slice(&bytes)));
        if let Some(scalar) = candidate {
            return scalar;
        }
    }
}

/// Convert a [`BigNumber`] to a scalar, reducing modulo the curve order.
pub(crate) fn bn_to_scalar(x: &BigNumber) -> Result<Scalar> {
    let order = k256_order();

    let x_modded = x % &order;
    let bytes = x_modded.to_bytes();

    let mut slice = vec![0u8; 32 - bytes.len()];
    slice.extend_from_slice(&bytes);
    let mut ret: Scalar = Option::from(Scalar::from_repr(GenericArray::clone_from_slice(&slice)))
        .ok_or(InternalError::CouldNotConvertToScalar)?;

    // Make sure to negate the scalar if the original input was negative
    if x < &BigNumber::zero() {
        ret = -ret;
    }

    Ok(ret)
}

/// Convert a scalar to a [`BigNumber`] in `[0, q)`.
pub(crate) fn scalar_to_bn(x: &Scalar) -> BigNumber {
    BigNumber::from_slice(x.to_bytes())
}

/// Invert a scalar, failing on zero.
pub(crate) fn invert_scalar(x: &Scalar) -> Result<Scalar> {
    let inverted: Option<Scalar> = Option::from(x.invert());
    inverted.ok_or(InternalError::CouldNotInvertScalar)
}

/// Interpret 32 bytes as a scalar, reducing modulo the curve order.
pub(crate) fn scalar_from_be_bytes(bytes: &[u8; 32]) -> Result<Scalar> {
    bn_to_scalar(&(BigNumber::from_slice(bytes) % k256_order()))
}

/// `true` when `s` is in the upper half of the scalar range. Such values are
/// normalized away by EIP-2.
pub(crate) fn scalar_is_high(s: &Scalar) -> bool {
    let half_order = k256_order() / BigNumber::from(2);
    scalar_to_bn(s) > half_order
}

pub(crate) fn k256_order() -> BigNumber {
    let order_bytes: [u8; 32] = Secp256k1::ORDER.to_be_bytes();
    BigNumber::from_slice(order_bytes)
}

////////////////////////////
// Test Utility Functions //
////////////////////////////

#[cfg(test)]
pub(crate) mod testing {
    use rand::{
        rngs::{OsRng, StdRng},
        Rng, SeedableRng,
    };

    /// Returns an rng to be used for testing. This will print the rng seed
    /// to stderr so that if a test fails, the failing seed can be recovered
    /// and used for debugging.
    pub(crate) fn init_testing() -> StdRng {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();

        let mut seeder = OsRng;
        let seed = seeder.gen();
        eprintln!("seed: {seed:?}");
        StdRng::from_seed(seed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::testing::init_testing;

    #[test]
    fn random_nonzero_scalar_is_never_zero() {
        let mut rng = init_testing();
        for _ in 0..100 {
            let scalar = random_nonzero_scalar(&mut rng).unwrap();
            assert!(!bool::from(scalar.is_zero()));
        }
    }

    #[test]
    fn bn_to_scalar_negates_negative_inputs() {
        let neg1 = BigNumber::zero() - BigNumber::one();

        let scalar = bn_to_scalar(&neg1).unwrap();
        assert_eq!(Scalar::ZERO, scalar.add(&Scalar::ONE));
    }

    #[test]
    fn scalar_bn_round_trip() {
        let mut rng = init_testing();
        let scalar = random_scalar(&mut rng).unwrap();
        assert_eq!(bn_to_scalar(&scalar_to_bn(&scalar)).unwrap(), scalar);
    }

    #[test]
    fn compressed_point_round_trip() {
        let mut rng = init_testing();
        let point =
            CurvePoint::GENERATOR.multiply_by_scalar(&random_nonzero_scalar(&mut rng).unwrap());
        let bytes = point.to_compressed_bytes();
        assert_eq!(bytes.len(), 33);
        let parsed = CurvePoint::from_compressed_bytes(&bytes).unwrap();
        assert_eq!(parsed, point);
    }

    #[test]
    fn challenge_scalar_is_deterministic_per_transcript() {
        let mut t1 = Transcript::new(b"challenge test");
        let mut t2 = Transcript::new(b"challenge test");
        assert_eq!(
            challenge_scalar(&mut t1, b"c"),
            challenge_scalar(&mut t2, b"c")
        );

        let mut t3 = Transcript::new(b"challenge test");
        t3.append_message(b"extra", b"data");
        assert_ne!(
            challenge_scalar(&mut t1, b"c"),
            challenge_scalar(&mut t3, b"c")
        );
    }
}
