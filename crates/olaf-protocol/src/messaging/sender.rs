use base64::Engine as _;
use olaf_crypto::Identity;
use serde::Serialize;

use crate::canonical;
use crate::error::ProtocolError;
use crate::messaging::envelope::{Frame, Payload, SignedEnvelope};

/// Build and sign a [`SignedEnvelope`] around `data`.
///
/// Signs `canonical(data) || decimal(counter)` with the sender's Ed25519 key.
pub fn build_envelope<T: Serialize>(
    identity: &Identity,
    data: &T,
    counter: u64,
) -> Result<SignedEnvelope, ProtocolError> {
    let data = serde_json::to_value(data)
        .map_err(|e| ProtocolError::Serialization(format!("envelope data: {e}")))?;
    let signed = canonical::signing_bytes(&data, counter)?;
    let signature = identity.sign(&signed);

    Ok(SignedEnvelope {
        data,
        counter,
        signature: base64::engine::general_purpose::STANDARD.encode(signature.to_bytes()),
    })
}

/// Sign a typed payload and wrap it as an outbound `signed_data` frame.
pub fn signed_frame(
    identity: &Identity,
    payload: &Payload,
    counter: u64,
) -> Result<Frame, ProtocolError> {
    build_envelope(identity, payload, counter).map(Frame::SignedData)
}

/// Serialize a frame for the wire.
pub fn encode_frame<T: Serialize>(frame: &T) -> Result<String, ProtocolError> {
    serde_json::to_string(frame).map_err(|e| ProtocolError::Serialization(e.to_string()))
}
