use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from encoding or decoding session descriptions.
#[derive(Debug, Error)]
pub enum SignalingError {
    /// The text is not a valid armored session description — bad base64,
    /// bad JSON, or a shape this build does not understand.
    #[error("malformed session description: {reason}")]
    MalformedPayload { reason: String },

    /// Serialization of a local description failed.
    #[error("failed to encode session description")]
    Encode(#[source] serde_json::Error),
}

/// Whether a description was produced by the initiating or responding side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DescriptionKind {
    Offer,
    Answer,
}

/// One side's negotiation payload.
///
/// An offer carries everything the answering side needs to reach the
/// offerer: a transport scheme tag, the endpoint the offerer listens on
/// and (for encrypted transports) the offerer's self-signed certificate.
/// An answer carries only its token — the offerer proves possession of
/// the answer by echoing that token in the channel-bind handshake.
///
/// Descriptions are immutable once created and must survive being shown
/// to a human and pasted back, so the wire form ([`encode`]) is a single
/// base64 line over canonical JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    pub kind: DescriptionKind,
    /// Transport scheme tag, e.g. `"quic"`, `"tcp"`, `"mem"`.
    pub transport: String,
    /// Where the offerer listens. Absent on answers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    /// DER-encoded self-signed certificate of the offerer, for transports
    /// that pin their peer identity through the out-of-band exchange.
    #[serde(default, skip_serializing_if = "Option::is_none", with = "b64_opt")]
    pub cert_der: Option<Vec<u8>>,
    /// Random 128-bit hex token. The answer's token is what the
    /// channel-bind handshake verifies.
    pub token: String,
}

impl SessionDescription {
    /// Builds an offer description for the given transport and endpoint.
    #[must_use]
    pub fn offer(transport: &str, endpoint: String, cert_der: Option<Vec<u8>>) -> Self {
        Self {
            kind: DescriptionKind::Offer,
            transport: transport.to_string(),
            endpoint: Some(endpoint),
            cert_der,
            token: generate_token(),
        }
    }

    /// Builds an answer description bound to the given transport.
    #[must_use]
    pub fn answer(transport: &str) -> Self {
        Self {
            kind: DescriptionKind::Answer,
            transport: transport.to_string(),
            endpoint: None,
            cert_der: None,
            token: generate_token(),
        }
    }
}

/// Generates a random 128-bit token as 32 lowercase hex characters.
#[must_use]
pub fn generate_token() -> String {
    let mut rng = rand::thread_rng();
    format!("{:032x}", rng.r#gen::<u128>())
}

/// Encodes a description into its armored single-line text form.
///
/// # Errors
///
/// Returns [`SignalingError::Encode`] if JSON serialization fails.
pub fn encode(description: &SessionDescription) -> Result<String, SignalingError> {
    let json = serde_json::to_vec(description).map_err(SignalingError::Encode)?;
    Ok(BASE64.encode(json))
}

/// Decodes armored text back into a description.
///
/// Surrounding whitespace is tolerated — pasted text tends to pick up a
/// trailing newline.
///
/// # Errors
///
/// Returns [`SignalingError::MalformedPayload`] if the text is not valid
/// base64, not valid JSON, or not a session description.
pub fn decode(text: &str) -> Result<SessionDescription, SignalingError> {
    let raw = BASE64
        .decode(text.trim())
        .map_err(|e| SignalingError::MalformedPayload {
            reason: format!("invalid base64: {e}"),
        })?;
    serde_json::from_slice(&raw).map_err(|e| SignalingError::MalformedPayload {
        reason: format!("invalid description JSON: {e}"),
    })
}

/// Serde adapter storing `Option<Vec<u8>>` as a base64 string, keeping
/// certificate bytes readable inside the JSON form instead of a numeric
/// array.
mod b64_opt {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD as BASE64;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(bytes) => serializer.serialize_some(&BASE64.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Vec<u8>>, D::Error> {
        let text: Option<String> = Option::deserialize(deserializer)?;
        match text {
            Some(t) => BASE64
                .decode(t)
                .map(Some)
                .map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}
