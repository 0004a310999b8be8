use base64::Engine as _;
use ed25519_dalek::{Signature, VerifyingKey};
use olaf_crypto::Identity;
use serde::Deserialize as _;
use serde_json::Value;

use crate::canonical;
use crate::error::ProtocolError;
use crate::messaging::envelope::{Frame, Payload, SignedEnvelope, FRAME_TYPES, PAYLOAD_TYPES};

/// Parse one inbound text frame.
///
/// Broken JSON or a missing/ill-typed field is `MalformedEnvelope`; a
/// well-formed document with an unknown `type` is `ProtocolViolation`.
pub fn parse_frame(text: &str) -> Result<Frame, ProtocolError> {
    let value: Value = serde_json::from_str(text)?;
    let kind = discriminator(&value)?;
    if !FRAME_TYPES.contains(&kind) {
        return Err(ProtocolError::ProtocolViolation(format!(
            "unknown message type '{kind}'"
        )));
    }
    Ok(serde_json::from_value(value)?)
}

/// Verify the Ed25519 signature on an envelope against `expected`.
///
/// The signed bytes are recomputed from the envelope's own `data` and
/// `counter`, so any change to either after signing fails here.
pub fn verify_envelope(
    envelope: &SignedEnvelope,
    expected: &VerifyingKey,
) -> Result<(), ProtocolError> {
    let sig_bytes = base64::engine::general_purpose::STANDARD
        .decode(&envelope.signature)
        .map_err(|e| ProtocolError::MalformedEnvelope(format!("signature base64: {e}")))?;
    let sig_bytes: [u8; 64] = sig_bytes
        .try_into()
        .map_err(|_| ProtocolError::MalformedEnvelope("signature must be 64 bytes".into()))?;
    let signature = Signature::from_bytes(&sig_bytes);

    let signed = canonical::signing_bytes(&envelope.data, envelope.counter)?;
    match Identity::verify(expected, &signed, &signature) {
        Ok(()) => {
            tracing::trace!(counter = envelope.counter, "signature verified");
            Ok(())
        }
        Err(e) => {
            tracing::debug!(
                counter = envelope.counter,
                error = %e,
                "signature verification failed"
            );
            Err(ProtocolError::InvalidSignature(
                "signature does not match the sender's public key".into(),
            ))
        }
    }
}

/// Interpret verified `data` as a typed [`Payload`].
pub fn classify(data: &Value) -> Result<Payload, ProtocolError> {
    let kind = discriminator(data)?;
    if !PAYLOAD_TYPES.contains(&kind) {
        return Err(ProtocolError::ProtocolViolation(format!(
            "unknown payload type '{kind}'"
        )));
    }
    Ok(Payload::deserialize(data)?)
}

/// Verify `envelope` against `expected`, then interpret its payload.
pub fn decode_and_verify(
    envelope: &SignedEnvelope,
    expected: &VerifyingKey,
) -> Result<Payload, ProtocolError> {
    verify_envelope(envelope, expected)?;
    classify(&envelope.data)
}

fn discriminator(value: &Value) -> Result<&str, ProtocolError> {
    value
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| ProtocolError::MalformedEnvelope("missing 'type' field".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::envelope::{Hello, PublicChat};
    use crate::messaging::sender::{build_envelope, encode_frame, signed_frame};
    use serde_json::json;

    fn hello_for(identity: &Identity) -> Payload {
        Payload::Hello(Hello {
            public_key: identity.public_key_hex(),
        })
    }

    #[test]
    fn sign_then_verify() {
        let alice = Identity::generate();
        let envelope = build_envelope(&alice, &hello_for(&alice), 0).unwrap();

        let payload = decode_and_verify(&envelope, &alice.public_key()).unwrap();
        assert_eq!(payload, hello_for(&alice));
    }

    #[test]
    fn wrong_key_is_invalid_signature() {
        let alice = Identity::generate();
        let mallory = Identity::generate();
        let envelope = build_envelope(&alice, &hello_for(&alice), 0).unwrap();

        assert!(matches!(
            verify_envelope(&envelope, &mallory.public_key()),
            Err(ProtocolError::InvalidSignature(_))
        ));
    }

    #[test]
    fn mutating_data_breaks_signature() {
        let alice = Identity::generate();
        let payload = Payload::PublicChat(PublicChat {
            sender: alice.fingerprint(),
            message: "original".into(),
        });
        let mut envelope = build_envelope(&alice, &payload, 5).unwrap();
        envelope.data["message"] = json!("tampered");

        assert!(matches!(
            verify_envelope(&envelope, &alice.public_key()),
            Err(ProtocolError::InvalidSignature(_))
        ));
    }

    #[test]
    fn mutating_counter_breaks_signature() {
        let alice = Identity::generate();
        let mut envelope = build_envelope(&alice, &hello_for(&alice), 5).unwrap();
        envelope.counter = 6;

        assert!(verify_envelope(&envelope, &alice.public_key()).is_err());
    }

    #[test]
    fn reordered_keys_still_verify() {
        let alice = Identity::generate();
        let payload = Payload::PublicChat(PublicChat {
            sender: alice.fingerprint(),
            message: "hi".into(),
        });
        let envelope = build_envelope(&alice, &payload, 1).unwrap();

        // Re-serialize through a differently ordered, whitespace-padded document.
        let text = format!(
            r#"{{ "signature": "{}", "counter": 1, "type": "signed_data",
                 "data": {{ "message": "hi", "type": "public_chat", "sender": "{}" }} }}"#,
            envelope.signature,
            alice.fingerprint()
        );
        let Frame::SignedData(parsed) = parse_frame(&text).unwrap() else {
            panic!("expected signed_data");
        };
        assert!(verify_envelope(&parsed, &alice.public_key()).is_ok());
    }

    #[test]
    fn frame_round_trip_through_text() {
        let alice = Identity::generate();
        let frame = signed_frame(&alice, &hello_for(&alice), 0).unwrap();
        let text = encode_frame(&frame).unwrap();
        assert_eq!(parse_frame(&text).unwrap(), frame);
    }

    #[test]
    fn unknown_frame_type_is_protocol_violation() {
        assert!(matches!(
            parse_frame(r#"{"type":"teleport"}"#),
            Err(ProtocolError::ProtocolViolation(_))
        ));
    }

    #[test]
    fn broken_json_is_malformed() {
        assert!(matches!(
            parse_frame("{not json"),
            Err(ProtocolError::MalformedEnvelope(_))
        ));
        assert!(matches!(
            parse_frame(r#"{"data":{}}"#),
            Err(ProtocolError::MalformedEnvelope(_))
        ));
        assert!(matches!(
            parse_frame(r#"{"type":"signed_data","data":{}}"#),
            Err(ProtocolError::MalformedEnvelope(_))
        ));
    }

    #[test]
    fn classify_distinguishes_unknown_from_incomplete() {
        assert!(matches!(
            classify(&json!({"type": "group_chat"})),
            Err(ProtocolError::ProtocolViolation(_))
        ));
        assert!(matches!(
            classify(&json!({"type": "chat", "sender": "a"})),
            Err(ProtocolError::MalformedEnvelope(_))
        ));
    }

    #[test]
    fn bad_signature_encoding_is_malformed() {
        let alice = Identity::generate();
        let mut envelope = build_envelope(&alice, &hello_for(&alice), 0).unwrap();
        envelope.signature = "AAAA".into();

        assert!(matches!(
            verify_envelope(&envelope, &alice.public_key()),
            Err(ProtocolError::MalformedEnvelope(_))
        ));
    }
}
