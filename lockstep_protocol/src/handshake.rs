// Handshake blobs exchanged before a connection is admitted.
//
// Sequence: on accept the relay writes the raw 8-byte handshake header
// (`HANDSHAKE_PROTOCOL_VERSION`, assigned client index), then a
// `HandshakeRequest` server order whose data is the JSON-serialized
// `HandshakeRequest` below. The client answers with a single
// `HandshakeResponse` server order. Nothing else is accepted from an
// unvalidated connection.

use serde::{Deserialize, Serialize};

/// Version of the raw handshake header layout.
pub const HANDSHAKE_PROTOCOL_VERSION: i32 = 7;

/// Version of the order payload format. Clients with a different value are
/// rejected during validation.
pub const ORDERS_PROTOCOL_VERSION: i32 = 20;

/// Relay → client: what the relay is running.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeRequest {
    #[serde(rename = "mod")]
    pub mod_id: String,
    pub version: String,
    /// Challenge a client must sign when authentication is in use.
    #[serde(default)]
    pub auth_token: Option<String>,
}

/// Client metadata carried in the handshake response.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeClient {
    pub name: String,
    #[serde(default)]
    pub preferred_color: Option<String>,
}

/// Client → relay: who is connecting and with what.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeResponse {
    #[serde(rename = "mod")]
    pub mod_id: String,
    pub version: String,
    pub orders_protocol: i32,
    pub client: HandshakeClient,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub fingerprint: Option<String>,
}

impl HandshakeRequest {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(data: &str) -> serde_json::Result<Self> {
        serde_json::from_str(data)
    }
}

impl HandshakeResponse {
    /// Build a response that answers `request` with matching mod, version
    /// and orders protocol.
    pub fn answering(request: &HandshakeRequest, name: impl Into<String>) -> Self {
        Self {
            mod_id: request.mod_id.clone(),
            version: request.version.clone(),
            orders_protocol: ORDERS_PROTOCOL_VERSION,
            client: HandshakeClient {
                name: name.into(),
                preferred_color: None,
            },
            password: None,
            fingerprint: None,
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(data: &str) -> serde_json::Result<Self> {
        serde_json::from_str(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_uses_mod_key() {
        let request = HandshakeRequest {
            mod_id: "ra".into(),
            version: "release-1".into(),
            auth_token: None,
        };
        let json = request.to_json().unwrap();
        assert!(json.contains("\"mod\":\"ra\""));
        assert_eq!(HandshakeRequest::from_json(&json).unwrap(), request);
    }

    #[test]
    fn response_optional_fields_default() {
        let json = r#"{"mod":"ra","version":"v","orders_protocol":20,"client":{"name":"Ann"}}"#;
        let response = HandshakeResponse::from_json(json).unwrap();
        assert_eq!(response.client.name, "Ann");
        assert_eq!(response.password, None);
        assert_eq!(response.fingerprint, None);
    }

    #[test]
    fn answering_copies_request_identity() {
        let request = HandshakeRequest {
            mod_id: "td".into(),
            version: "2".into(),
            auth_token: Some("abc".into()),
        };
        let response = HandshakeResponse::answering(&request, "Bo");
        assert_eq!(response.mod_id, "td");
        assert_eq!(response.version, "2");
        assert_eq!(response.orders_protocol, ORDERS_PROTOCOL_VERSION);
    }

    #[test]
    fn garbage_is_an_error() {
        assert!(HandshakeResponse::from_json("not json").is_err());
    }
}
