//! Client identity: the per-instance id, the signed-in username and server name.
//!
//! The id doubles as the MQTT client identifier and as the topic the client
//! listens on for its own command responses. It is generated once and never
//! changes; username and server name are filled in by sign-in and discovery.

pub mod token;

use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use base64::Engine;
use tracing::debug;
use uuid::Uuid;

/// Lenient decoder for JWT segments: padded or unpadded, either alphabet.
const SEGMENT_ENGINE: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new()
        .with_decode_padding_mode(DecodePaddingMode::Indifferent)
        .with_decode_allow_trailing_bits(true),
);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity {
    id: String,
    pub username: Option<String>,
    pub server_name: Option<String>,
}

impl ClientIdentity {
    /// Creates an identity with a freshly derived id and no session data.
    pub fn generate() -> Self {
        Self::with_id(derive_id())
    }

    pub fn with_id(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            username: None,
            server_name: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Topic the client subscribes to for its own command responses.
    pub fn response_topic(&self) -> &str {
        &self.id
    }
}

/// Produces a random RFC 4122 version 4 identifier in its 36 character dashed form.
pub fn derive_id() -> String {
    Uuid::new_v4().hyphenated().to_string()
}

/// Extracts the `sub` claim from a bearer token without verifying it.
///
/// Returns `None` for tokens with fewer than two segments, payloads that are
/// not base64, not UTF-8 or not JSON, and claims without a non-empty string
/// `sub`. Callers treat `None` as an invalid credential.
pub fn extract_subject(bearer_token: &str) -> Option<String> {
    let mut segments = bearer_token.split('.');
    let _header = segments.next()?;
    let payload = segments.next()?;

    let normalized: String = payload
        .chars()
        .map(|c| match c {
            '-' => '+',
            '_' => '/',
            other => other,
        })
        .collect();

    let bytes = match SEGMENT_ENGINE.decode(normalized.trim()) {
        Ok(bytes) => bytes,
        Err(e) => {
            debug!("Token payload is not valid base64: {}", e);
            return None;
        }
    };

    let text = match String::from_utf8(bytes) {
        Ok(text) => text,
        Err(e) => {
            debug!("Token payload is not valid UTF-8: {}", e);
            return None;
        }
    };

    let claims: serde_json::Value = match serde_json::from_str(&text) {
        Ok(claims) => claims,
        Err(e) => {
            debug!("Token payload is not valid JSON: {}", e);
            return None;
        }
    };

    claims
        .get("sub")
        .and_then(|sub| sub.as_str())
        .filter(|sub| !sub.is_empty())
        .map(str::to_owned)
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};

    fn token_with_claims(claims: &str) -> String {
        format!(
            "{}.{}.signature",
            URL_SAFE_NO_PAD.encode(r#"{"alg":"HS256","typ":"JWT"}"#),
            URL_SAFE_NO_PAD.encode(claims)
        )
    }

    #[test]
    fn derived_id_has_uuid_v4_layout() {
        let id = derive_id();
        assert_eq!(id.len(), 36);

        let chars: Vec<char> = id.chars().collect();
        for dash in [8, 13, 18, 23] {
            assert_eq!(chars[dash], '-');
        }
        assert_eq!(chars[14], '4');
        assert!(matches!(chars[19], '8' | '9' | 'a' | 'b'));
    }

    #[test]
    fn derived_ids_differ() {
        assert_ne!(derive_id(), derive_id());
    }

    #[test]
    fn extracts_subject_from_valid_token() {
        let token = token_with_claims(r#"{"sub":"jdoe","exp":1700000000}"#);
        assert_eq!(extract_subject(&token).as_deref(), Some("jdoe"));
    }

    #[test]
    fn extracts_non_ascii_subject() {
        let token = token_with_claims(r#"{"sub":"jérôme"}"#);
        assert_eq!(extract_subject(&token).as_deref(), Some("jérôme"));
    }

    #[test]
    fn accepts_padded_standard_alphabet_payload() {
        let payload = STANDARD.encode(r#"{"sub":"ab?>"}"#);
        let token = format!("header.{}", payload);
        assert_eq!(extract_subject(&token).as_deref(), Some("ab?>"));
    }

    #[test]
    fn single_segment_has_no_subject() {
        assert_eq!(extract_subject("not-a-jwt"), None);
        assert_eq!(extract_subject(""), None);
    }

    #[test]
    fn malformed_payloads_have_no_subject() {
        assert_eq!(extract_subject("a.!!!.c"), None);
        assert_eq!(extract_subject(&format!("a.{}", URL_SAFE_NO_PAD.encode([0xff, 0xfe]))), None);
        assert_eq!(extract_subject(&token_with_claims("not json")), None);
    }

    #[test]
    fn missing_or_empty_sub_has_no_subject() {
        assert_eq!(extract_subject(&token_with_claims(r#"{"name":"x"}"#)), None);
        assert_eq!(extract_subject(&token_with_claims(r#"{"sub":""}"#)), None);
        assert_eq!(extract_subject(&token_with_claims(r#"{"sub":42}"#)), None);
    }

    #[test]
    fn identity_topic_is_its_id() {
        let identity = ClientIdentity::with_id("abc");
        assert_eq!(identity.id(), "abc");
        assert_eq!(identity.response_topic(), "abc");
        assert!(identity.username.is_none());
        assert!(identity.server_name.is_none());
    }
}
