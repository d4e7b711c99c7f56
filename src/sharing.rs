// Copyright (c) 2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

//! Shamir secret sharing with Feldman verification, plus the hash
//! commitments used to bind round-one announcements.

use crate::{
    errors::{CallerError, DkgError, InternalError, Result},
    utils::{invert_scalar, random_scalar, CurvePoint},
};
use k256::{elliptic_curve::Field, Scalar};
use merlin::Transcript;
use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// A secret polynomial of degree `threshold - 1` over the curve scalar
/// field. The intercept is the shared secret; evaluations at party indices
/// are the Shamir shares.
///
/// Lives only for the duration of a key generation ceremony and is zeroed on
/// drop.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub(crate) struct Polynomial {
    coefficients: Vec<Scalar>,
}

impl std::fmt::Debug for Polynomial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Polynomial")
            .field("coefficients", &"[redacted]")
            .finish()
    }
}

impl Polynomial {
    /// Sample a polynomial with the given intercept and `threshold` total
    /// coefficients, the rest drawn uniformly from `[0, q)`.
    pub(crate) fn sample<R: RngCore + CryptoRng>(
        intercept: Scalar,
        threshold: usize,
        rng: &mut R,
    ) -> Result<Self> {
        if threshold < 1 {
            Err(CallerError::InvalidArgument(String::from(
                "threshold must be at least 1",
            )))?;
        }
        let mut coefficients = vec![intercept];
        for _ in 1..threshold {
            coefficients.push(random_scalar(rng)?);
        }
        Ok(Self { coefficients })
    }

    /// The shared secret `f(0)`.
    pub(crate) fn intercept(&self) -> &Scalar {
        &self.coefficients[0]
    }

    /// Horner evaluation of `f` at a party index.
    pub(crate) fn evaluate(&self, index: u32) -> Scalar {
        let x = Scalar::from(index as u64);
        let mut acc = Scalar::ZERO;
        for coefficient in self.coefficients.iter().rev() {
            acc = acc * x + coefficient;
        }
        acc
    }

    /// Number of coefficients, i.e. the reconstruction threshold.
    pub(crate) fn threshold(&self) -> usize {
        self.coefficients.len()
    }

    pub(crate) fn coefficients(&self) -> &[Scalar] {
        &self.coefficients
    }
}

/// Compute the Lagrange coefficient of party `i` evaluated at zero over the
/// subset `S`: `Π_{j ∈ S, j ≠ i} (-j) * (i - j)^{-1} mod q`.
///
/// Interpolating shares with these weights recovers `f(0)`; the weights sum
/// to one, which is what lets an additive tweak ride along with each share.
pub(crate) fn lagrange_at_zero(i: u32, subset: &[u32]) -> Result<Scalar> {
    if !subset.contains(&i) {
        Err(CallerError::InvalidArgument(String::from(
            "party index must be a member of the subset",
        )))?;
    }
    let mut sorted = subset.to_vec();
    sorted.sort_unstable();
    if sorted.windows(2).any(|pair| pair[0] == pair[1]) {
        Err(CallerError::InvalidArgument(String::from(
            "subset contains a duplicate index",
        )))?;
    }

    let mut coefficient = Scalar::ONE;
    for &j in subset {
        if j == i {
            continue;
        }
        let numerator = -Scalar::from(j as u64);
        let denominator = Scalar::from(i as u64) - Scalar::from(j as u64);
        coefficient *= numerator * invert_scalar(&denominator)?;
    }
    Ok(coefficient)
}

/// Feldman commitments to a polynomial: one point `a_k * G` per coefficient.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct FeldmanCommitment {
    coefficients: Vec<CurvePoint>,
}

impl FeldmanCommitment {
    /// Commit to every coefficient of `polynomial`.
    pub(crate) fn commit(polynomial: &Polynomial) -> Self {
        let coefficients = polynomial
            .coefficients()
            .iter()
            .map(|a_k| CurvePoint::GENERATOR.multiply_by_scalar(a_k))
            .collect();
        Self { coefficients }
    }

    /// The commitment to the intercept, `a_0 * G`.
    pub(crate) fn intercept_commitment(&self) -> Result<CurvePoint> {
        self.coefficients
            .first()
            .copied()
            .ok_or(InternalError::InternalInvariantFailed)
    }

    /// The public image of the share at `index`: `Σ_k index^k * C_k`,
    /// evaluated by Horner's rule over points.
    pub(crate) fn expected_public_share(&self, index: u32) -> CurvePoint {
        let x = Scalar::from(index as u64);
        let mut acc = CurvePoint::IDENTITY;
        for commitment in self.coefficients.iter().rev() {
            acc = acc.multiply_by_scalar(&x) + *commitment;
        }
        acc
    }

    /// Check a received share against the sender's commitments:
    /// `share * G =? Σ_k index^k * C_k`.
    pub(crate) fn verify_share(&self, share: &Scalar, index: u32) -> bool {
        CurvePoint::GENERATOR.multiply_by_scalar(share) == self.expected_public_share(index)
    }

    pub(crate) fn threshold(&self) -> usize {
        self.coefficients.len()
    }

    /// The commitment points, in coefficient order.
    pub(crate) fn points(&self) -> &[CurvePoint] {
        &self.coefficients
    }
}

/// The blinding factor opened alongside a [`HashCommitment`].
pub(crate) type CommitmentBlinding = [u8; 32];

/// A hiding, binding commitment to a list of points: the hash of the points
/// together with a random blinding factor. Published in round one, opened in
/// round two.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct HashCommitment {
    hash: [u8; 32],
}

impl HashCommitment {
    /// Commit to `points` under the given blinding factor.
    pub(crate) fn commit(points: &[CurvePoint], blinding: &CommitmentBlinding) -> Self {
        let mut transcript = Transcript::new(b"FeldmanVectorCommit");
        for point in points {
            transcript.append_message(b"point", &point.to_compressed_bytes());
        }
        transcript.append_message(b"blinding", blinding);

        let mut hash = [0u8; 32];
        transcript.challenge_bytes(b"commitment", &mut hash);
        Self { hash }
    }

    /// Verify an opening against this commitment.
    pub(crate) fn verify(
        &self,
        points: &[CurvePoint],
        blinding: &CommitmentBlinding,
    ) -> Result<()> {
        if Self::commit(points, blinding) == *self {
            Ok(())
        } else {
            Err(DkgError::CommitmentMismatch)?
        }
    }

    /// Sample a fresh blinding factor.
    pub(crate) fn random_blinding<R: RngCore + CryptoRng>(rng: &mut R) -> CommitmentBlinding {
        let mut blinding = [0u8; 32];
        rng.fill_bytes(&mut blinding);
        blinding
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::{random_nonzero_scalar, testing::init_testing};
    use k256::elliptic_curve::Field;

    #[test]
    fn lagrange_interpolation_recovers_the_intercept() {
        let mut rng = init_testing();

        for threshold in 1..=4usize {
            let secret = random_scalar(&mut rng).unwrap();
            let polynomial = Polynomial::sample(secret, threshold, &mut rng).unwrap();

            // Evaluate at an arbitrary t-subset of indices 1..=6
            let subset: Vec<u32> = (1..=6).skip(6 - threshold).collect();
            let mut reconstructed = Scalar::ZERO;
            for &i in &subset {
                let weight = lagrange_at_zero(i, &subset).unwrap();
                reconstructed += weight * polynomial.evaluate(i);
            }
            assert_eq!(reconstructed, secret);
        }
    }

    #[test]
    fn lagrange_weights_sum_to_one() {
        // Interpolating the constant-one polynomial must give one; this is
        // the property that lets the derivation tweak ride on every share.
        let subset = [2u32, 3, 5];
        let sum: Scalar = subset
            .iter()
            .map(|&i| lagrange_at_zero(i, &subset).unwrap())
            .sum();
        assert_eq!(sum, Scalar::ONE);
    }

    #[test]
    fn lagrange_two_of_three_has_the_expected_weights() {
        let subset = [1u32, 2];
        assert_eq!(lagrange_at_zero(1, &subset).unwrap(), Scalar::from(2u64));
        assert_eq!(lagrange_at_zero(2, &subset).unwrap(), -Scalar::ONE);
    }

    #[test]
    fn feldman_accepts_honest_shares_and_rejects_tampered_ones() {
        let mut rng = init_testing();
        let secret = random_scalar(&mut rng).unwrap();
        let polynomial = Polynomial::sample(secret, 3, &mut rng).unwrap();
        let commitment = FeldmanCommitment::commit(&polynomial);

        for index in 1..=5u32 {
            let share = polynomial.evaluate(index);
            assert!(commitment.verify_share(&share, index));

            let tampered = share + Scalar::ONE;
            assert!(!commitment.verify_share(&tampered, index));

            // A valid share under the wrong index must also fail.
            assert!(!commitment.verify_share(&share, index + 1));
        }
    }

    #[test]
    fn hash_commitment_binds_points_and_blinding() {
        let mut rng = init_testing();
        let points: Vec<CurvePoint> = (0..3)
            .map(|_| {
                CurvePoint::GENERATOR
                    .multiply_by_scalar(&random_nonzero_scalar(&mut rng).unwrap())
            })
            .collect();
        let blinding = HashCommitment::random_blinding(&mut rng);
        let commitment = HashCommitment::commit(&points, &blinding);

        assert!(commitment.verify(&points, &blinding).is_ok());

        let mut wrong_blinding = blinding;
        wrong_blinding[17] ^= 0x01;
        assert!(commitment.verify(&points, &wrong_blinding).is_err());

        let mut wrong_points = points.clone();
        wrong_points[1] = wrong_points[1] + CurvePoint::GENERATOR;
        assert!(commitment.verify(&wrong_points, &blinding).is_err());
    }

    #[test]
    fn polynomial_evaluation_matches_direct_computation() {
        let mut rng = init_testing();
        let polynomial = Polynomial::sample(Scalar::random(&mut rng), 4, &mut rng).unwrap();

        let x = Scalar::from(7u64);
        let direct: Scalar = polynomial
            .coefficients()
            .iter()
            .enumerate()
            .map(|(k, a_k)| *a_k * x.pow_vartime([k as u64]))
            .sum();
        assert_eq!(polynomial.evaluate(7), direct);
    }
}
