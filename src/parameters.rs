// Copyright (c) 2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

///////////////
// Constants //
// ========= //
///////////////

/// Bit length of each Paillier prime factor. The session modulus `N = p * q`
/// is twice this long.
pub(crate) const PRIME_BITS: usize = 512;

/// Peer Paillier moduli below this bit length are rejected before any MtA.
pub(crate) const MODULUS_MIN_BITS: usize = 1023;

/// Envelopes whose timestamp lags the receiver's clock by more than this are
/// rejected as replays.
pub(crate) const ENVELOPE_MAX_AGE_MS: u64 = 30_000;

/// Argon2id parameters for the passphrase-protected key-share store:
/// 64 MiB of memory, three passes, four lanes, 32-byte output.
pub(crate) const ARGON2_MEMORY_KIB: u32 = 64 * 1024;
pub(crate) const ARGON2_TIME_COST: u32 = 3;
pub(crate) const ARGON2_PARALLELISM: u32 = 4;

/// Minimum accepted passphrase length for the local store mode.
pub(crate) const MIN_PASSPHRASE_CHARS: usize = 32;

/// Version stamped on both on-disk documents.
pub(crate) const ON_DISK_FORMAT_VERSION: u32 = 1;
