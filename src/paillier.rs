// Copyright (c) 2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

//! Paillier encryption with the homomorphic multiply-and-add used by the MtA
//! conversion.
//!
//! Keypairs are generated fresh for each signing session and discarded with
//! it. Every modulus received from a peer must pass [`validate_modulus`]
//! before any ciphertext under it is produced or consumed.

use crate::{
    errors::{InternalError, PaillierError, Result},
    parameters::{MODULUS_MIN_BITS, PRIME_BITS},
    utils::{k256_order, CRYPTOGRAPHIC_RETRY_MAX},
};
use libpaillier::unknown_order::BigNumber;
use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct PaillierCiphertext(pub(crate) BigNumber);

/// The public half of a Paillier keypair: the modulus `N`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) struct PaillierEncryptionKey {
    n: BigNumber,
}

impl PaillierEncryptionKey {
    /// Wrap a modulus that has already passed [`validate_modulus`].
    pub(crate) fn from_validated_modulus(n: BigNumber) -> Self {
        Self { n }
    }

    pub(crate) fn n(&self) -> &BigNumber {
        &self.n
    }

    fn nn(&self) -> BigNumber {
        &self.n * &self.n
    }

    /// Encrypt `m` (reduced mod `N`) under this key:
    /// `c = (1 + N * m) * r^N mod N^2` with `r` drawn from `Z*_N`.
    pub(crate) fn encrypt<R: RngCore + CryptoRng>(
        &self,
        rng: &mut R,
        m: &BigNumber,
    ) -> Result<PaillierCiphertext> {
        let nn = self.nn();
        let nonce = random_bn_in_z_star(rng, &self.n)?;

        let m_reduced = m % &self.n;
        let a = (BigNumber::one() + &self.n * m_reduced) % &nn;
        let b = nonce.modpow(&self.n, &nn);
        Ok(PaillierCiphertext(a.modmul(&b, &nn)))
    }

    /// Homomorphically evaluate `plaintext * mult + beta` over the ciphertext
    /// `c`: `c^mult * Enc(beta) mod N^2`.
    ///
    /// This is the sender's half of an MtA conversion. Any ciphertext outside
    /// `[1, N^2)` is fatal for the session.
    pub(crate) fn homomorphic_mul_add<R: RngCore + CryptoRng>(
        &self,
        rng: &mut R,
        c: &PaillierCiphertext,
        mult: &BigNumber,
        beta: &BigNumber,
    ) -> Result<PaillierCiphertext> {
        let nn = self.nn();
        check_ciphertext_range(c, &nn)?;

        let scaled = c.0.modpow(mult, &nn);
        let masked = self.encrypt(rng, beta)?;
        Ok(PaillierCiphertext(scaled.modmul(&masked.0, &nn)))
    }
}

/// The secret half of a Paillier keypair.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) struct PaillierDecryptionKey {
    n: BigNumber,
    lambda: BigNumber,
    mu: BigNumber,
}

impl PaillierDecryptionKey {
    /// Generate a new [`PaillierDecryptionKey`].
    ///
    /// The factors are two distinct `PRIME_BITS`-long primes generated by
    /// rejection-sampling odd candidates with top and bottom bits set and
    /// Miller-Rabin testing; the resulting modulus is `2 * PRIME_BITS` long.
    ///
    /// This is the longest blocking computation in the system; callers that
    /// run an event loop should drive it from a blocking-work context.
    pub(crate) fn new(rng: &mut (impl CryptoRng + RngCore)) -> Result<Self> {
        let mut attempts = 0;
        let (p, q) = loop {
            attempts += 1;
            if attempts > CRYPTOGRAPHIC_RETRY_MAX {
                return Err(InternalError::RetryFailed);
            }

            let p = BigNumber::prime(PRIME_BITS);
            let q = BigNumber::prime(PRIME_BITS);

            // Two n/2-bit primes can occasionally produce an (n-1)-bit
            // modulus; such pairs are rejected and redrawn.
            if p != q
                && p.bit_length() == PRIME_BITS
                && q.bit_length() == PRIME_BITS
                && (&p * &q).bit_length() == 2 * PRIME_BITS
            {
                break (p, q);
            }
        };

        let n = &p * &q;
        let p_minus_one: BigNumber = &p - 1;
        let q_minus_one = &q - 1;
        // lambda = lcm(p - 1, q - 1)
        let lambda = (&p_minus_one * &q_minus_one) / p_minus_one.gcd(&q_minus_one);
        let mu = lambda
            .invert(&n)
            .ok_or(PaillierError::CouldNotCreateKey)?;

        Ok(Self { n, lambda, mu })
    }

    /// Retrieve the public [`PaillierEncryptionKey`] corresponding to this
    /// secret [`PaillierDecryptionKey`].
    pub(crate) fn encryption_key(&self) -> PaillierEncryptionKey {
        PaillierEncryptionKey {
            n: self.n.clone(),
        }
    }

    /// Decrypt a ciphertext: `m = L(c^lambda mod N^2) * mu mod N` with
    /// `L(x) = (x - 1) / N`.
    pub(crate) fn decrypt(&self, c: &PaillierCiphertext) -> Result<BigNumber> {
        let nn = &self.n * &self.n;
        check_ciphertext_range(c, &nn)?;

        let x = c.0.modpow(&self.lambda, &nn);
        let l = (x - BigNumber::one()) / &self.n;
        Ok(l.modmul(&self.mu, &self.n))
    }
}

/// Enforce the acceptance conditions for a peer-supplied modulus: odd, at
/// least 2^1022, coprime with the curve order, and not a perfect square.
pub(crate) fn validate_modulus(n: &BigNumber) -> Result<()> {
    if n % BigNumber::from(2) == BigNumber::zero() {
        Err(PaillierError::ModulusEven)?;
    }
    if n.bit_length() < MODULUS_MIN_BITS {
        Err(PaillierError::ModulusTooSmall)?;
    }
    if n.gcd(&k256_order()) != BigNumber::one() {
        Err(PaillierError::ModulusSharesFactorWithCurveOrder)?;
    }
    if is_perfect_square(n) {
        Err(PaillierError::ModulusPerfectSquare)?;
    }
    Ok(())
}

/// Reject ciphertexts outside `[1, N^2)`.
fn check_ciphertext_range(c: &PaillierCiphertext, nn: &BigNumber) -> Result<()> {
    if c.0 < BigNumber::one() || &c.0 >= nn {
        Err(crate::errors::SigningError::CiphertextOutOfRange)?;
    }
    Ok(())
}

/// Integer square-root test via Newton iteration.
fn is_perfect_square(n: &BigNumber) -> bool {
    if n < &BigNumber::zero() {
        return false;
    }
    if n <= &BigNumber::one() {
        return true;
    }

    // Start above sqrt(n) and descend; the iteration is monotone once it
    // crosses the root.
    let mut x = BigNumber::one() << (n.bit_length() / 2 + 1);
    loop {
        let next = (&x + n / &x) / BigNumber::from(2);
        if next >= x {
            break;
        }
        x = next;
    }
    &x * &x == *n
}

/// Generate a random `BigNumber` that is in the multiplicative group of
/// integers modulo `n`.
///
/// Note: in this application, `n` is typically the product of two primes. If
/// the drawn element is not coprime with `n` and is not `0 mod n`, then the
/// caller has accidentally stumbled upon the factorization of `n`! This is a
/// security issue when `n` is someone else's Paillier modulus, but the chance
/// of this happening is basically 0 and we drop the element anyway.
pub(crate) fn random_bn_in_z_star<R: RngCore + CryptoRng>(
    rng: &mut R,
    n: &BigNumber,
) -> Result<BigNumber> {
    std::iter::repeat_with(|| BigNumber::from_rng(n, rng))
        .take(CRYPTOGRAPHIC_RETRY_MAX)
        .find(|result| result != &BigNumber::zero() && result.gcd(n) == BigNumber::one())
        .ok_or(InternalError::RetryFailed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::testing::init_testing;

    fn test_keypair() -> (PaillierDecryptionKey, PaillierEncryptionKey) {
        let mut rng = init_testing();
        let sk = PaillierDecryptionKey::new(&mut rng).unwrap();
        let pk = sk.encryption_key();
        (sk, pk)
    }

    #[test]
    fn encrypt_decrypt_round_trip() {
        let mut rng = init_testing();
        let (sk, pk) = test_keypair();

        for _ in 0..5 {
            let m = BigNumber::from_rng(pk.n(), &mut rng);
            let c = pk.encrypt(&mut rng, &m).unwrap();
            assert_eq!(sk.decrypt(&c).unwrap(), m);
        }
    }

    #[test]
    fn homomorphic_mul_add_matches_plaintext_arithmetic() {
        let mut rng = init_testing();
        let (sk, pk) = test_keypair();

        let a = BigNumber::from_rng(&k256_order(), &mut rng);
        let b = BigNumber::from_rng(&k256_order(), &mut rng);
        let beta = BigNumber::from_rng(&k256_order(), &mut rng);

        let c = pk.encrypt(&mut rng, &a).unwrap();
        let result = pk.homomorphic_mul_add(&mut rng, &c, &b, &beta).unwrap();

        let expected = (&a * &b + &beta) % pk.n();
        assert_eq!(sk.decrypt(&result).unwrap(), expected);
    }

    #[test]
    fn generated_modulus_passes_validation() {
        let (_, pk) = test_keypair();
        assert!(validate_modulus(pk.n()).is_ok());
        assert_eq!(pk.n().bit_length(), 2 * PRIME_BITS);
    }

    #[test]
    fn malformed_moduli_are_rejected() {
        let (_, pk) = test_keypair();

        // Even
        let even = pk.n() * BigNumber::from(2);
        assert_eq!(
            validate_modulus(&even),
            Err(PaillierError::ModulusEven.into())
        );

        // Too small
        let small = BigNumber::one() << 512;
        assert!(validate_modulus(&(small + BigNumber::one())).is_err());

        // Shares a factor with the curve order
        let shared = k256_order() * ((BigNumber::one() << 800) + BigNumber::one());
        assert_eq!(
            validate_modulus(&shared),
            Err(PaillierError::ModulusSharesFactorWithCurveOrder.into())
        );

        // Perfect square
        let square = pk.n() * pk.n();
        assert_eq!(
            validate_modulus(&square),
            Err(PaillierError::ModulusPerfectSquare.into())
        );
    }

    #[test]
    fn out_of_range_ciphertexts_are_fatal() {
        let mut rng = init_testing();
        let (sk, pk) = test_keypair();

        let zero = PaillierCiphertext(BigNumber::zero());
        assert!(sk.decrypt(&zero).is_err());

        let huge = PaillierCiphertext(pk.n() * pk.n());
        assert!(pk
            .homomorphic_mul_add(&mut rng, &huge, &BigNumber::one(), &BigNumber::one())
            .is_err());
    }

    #[test]
    fn perfect_square_detection() {
        let mut rng = init_testing();
        for _ in 0..20 {
            let x = BigNumber::from_rng(&(BigNumber::one() << 256), &mut rng);
            assert!(is_perfect_square(&(&x * &x)));
            // x^2 + 1 is never a square for x > 0
            if x > BigNumber::zero() {
                assert!(!is_perfect_square(&(&x * &x + BigNumber::one())));
            }
        }
    }
}
