// Copyright (c) 2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

//! The JSON wire envelope that frames every message between nodes.
//!
//! The transport layer (TLS, peer discovery) lives outside this crate; the
//! envelope is the boundary where staleness and sender identity are
//! checked before a payload reaches a protocol handler.

use crate::{
    errors::{Result, ValidationError},
    parameters::ENVELOPE_MAX_AGE_MS,
    protocol::ParticipantIdentifier,
};
use rand::{CryptoRng, Rng, RngCore};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use uuid::Uuid;

/// Every message type that crosses the wire.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EnvelopeType {
    #[serde(rename = "DKG_PROPOSE")]
    DkgPropose,
    #[serde(rename = "DKG_ACCEPT")]
    DkgAccept,
    #[serde(rename = "DKG_ROUND1")]
    DkgRound1,
    #[serde(rename = "DKG_ROUND2")]
    DkgRound2,
    #[serde(rename = "DKG_ROUND3_P2P")]
    DkgRound3P2p,
    #[serde(rename = "DKG_ROUND4")]
    DkgRound4,
    #[serde(rename = "DKG_COMPLETE")]
    DkgComplete,
    #[serde(rename = "DKG_ABORT")]
    DkgAbort,
    #[serde(rename = "SIGN_REQUEST")]
    SignRequest,
    #[serde(rename = "SIGN_ACCEPT")]
    SignAccept,
    #[serde(rename = "SIGN_REJECT")]
    SignReject,
    #[serde(rename = "SIGN_ROUND1")]
    SignRound1,
    #[serde(rename = "SIGN_ROUND2")]
    SignRound2,
    #[serde(rename = "SIGN_ROUND3")]
    SignRound3,
    #[serde(rename = "SIGN_ROUND4")]
    SignRound4,
    #[serde(rename = "SIGN_COMPLETE")]
    SignComplete,
    #[serde(rename = "SIGN_ABORT")]
    SignAbort,
}

/// The wire envelope: `{id, type, timestamp, nonce, payload}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub message_type: EnvelopeType,
    /// Sender's clock, milliseconds since the epoch.
    pub timestamp: u64,
    /// Random per-message nonce, hex.
    pub nonce: String,
    pub payload: serde_json::Value,
}

impl Envelope {
    /// Wrap a payload for the wire.
    pub fn seal<T: Serialize, R: RngCore + CryptoRng>(
        message_type: EnvelopeType,
        payload: &T,
        now_ms: u64,
        rng: &mut R,
    ) -> Result<Self> {
        let payload =
            serde_json::to_value(payload).map_err(|_| ValidationError::MalformedEnvelope)?;
        Ok(Self {
            id: Uuid::from_u128(rng.gen()),
            message_type,
            timestamp: now_ms,
            nonce: hex::encode(rng.gen::<[u8; 16]>()),
            payload,
        })
    }

    /// Parse an inbound envelope and enforce the anti-replay window:
    /// envelopes older than 30 seconds by the receiver's clock are rejected.
    pub fn open(json: &str, now_ms: u64) -> Result<Self> {
        let envelope: Envelope =
            serde_json::from_str(json).map_err(|_| ValidationError::MalformedEnvelope)?;
        if now_ms.saturating_sub(envelope.timestamp) > ENVELOPE_MAX_AGE_MS {
            Err(ValidationError::StaleTimestamp(ENVELOPE_MAX_AGE_MS))?;
        }
        Ok(envelope)
    }

    /// Deserialize the payload into its concrete type.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.payload.clone())
            .map_err(|_| ValidationError::MalformedEnvelope.into())
    }

    /// Serialize for the wire.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|_| ValidationError::MalformedEnvelope.into())
    }
}

/// Check a payload's self-declared sender against the transport-level
/// identity, when the transport provides one.
pub fn verify_sender(
    declared: ParticipantIdentifier,
    transport: Option<ParticipantIdentifier>,
) -> Result<()> {
    match transport {
        Some(transport) if transport != declared => Err(ValidationError::SenderMismatch)?,
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::testing::init_testing;

    #[test]
    fn envelope_round_trips_through_json() {
        let mut rng = init_testing();
        let payload = serde_json::json!({ "sessionId": "abc", "value": 7 });
        let envelope =
            Envelope::seal(EnvelopeType::SignRequest, &payload, 1_700_000_000_000, &mut rng)
                .unwrap();

        let json = envelope.to_json().unwrap();
        let parsed = Envelope::open(&json, 1_700_000_010_000).unwrap();
        assert_eq!(parsed, envelope);
        assert_eq!(parsed.payload_as::<serde_json::Value>().unwrap(), payload);
        assert!(json.contains("\"type\":\"SIGN_REQUEST\""));
    }

    #[test]
    fn stale_envelopes_are_rejected() {
        let mut rng = init_testing();
        let sent_at = 1_700_000_000_000u64;
        let envelope =
            Envelope::seal(EnvelopeType::SignRequest, &"payload", sent_at, &mut rng).unwrap();
        let json = envelope.to_json().unwrap();

        // 30s on the dot is still acceptable; a millisecond past is not.
        assert!(Envelope::open(&json, sent_at + 30_000).is_ok());
        assert_eq!(
            Envelope::open(&json, sent_at + 30_001).unwrap_err(),
            ValidationError::StaleTimestamp(30_000).into()
        );
    }

    #[test]
    fn sender_mismatch_is_rejected() {
        let mut rng = init_testing();
        let declared = ParticipantIdentifier::random(&mut rng);
        let other = ParticipantIdentifier::random(&mut rng);

        assert!(verify_sender(declared, None).is_ok());
        assert!(verify_sender(declared, Some(declared)).is_ok());
        assert_eq!(
            verify_sender(declared, Some(other)).unwrap_err(),
            ValidationError::SenderMismatch.into()
        );
    }
}
