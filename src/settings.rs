//! Typed documents stored in an inbound's `settings`, `streamSettings` and
//! `sniffing` columns.
//!
//! Field names and nesting follow the managed proxy's JSON schema exactly; the
//! proxy rejects configs that deviate from it.

use crate::error::SettingsError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Proxy protocol spoken by an inbound
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Vmess,
    Vless,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Vmess => "vmess",
            Protocol::Vless => "vless",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "vmess" => Ok(Protocol::Vmess),
            "vless" => Ok(Protocol::Vless),
            other => Err(format!("unsupported protocol '{}'", other)),
        }
    }
}

/// A proxy credential embedded in an inbound's settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Client {
    pub id: Uuid,
    #[serde(default)]
    pub flow: String,
}

/// The `settings` document of an inbound
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundSettings {
    #[serde(default)]
    pub clients: Vec<Client>,
    #[serde(default = "default_decryption")]
    pub decryption: String,
    #[serde(default)]
    pub fallbacks: Vec<serde_json::Value>,
}

impl InboundSettings {
    /// Settings carrying a single freshly minted client
    pub fn single_client(id: Uuid, flow: &str) -> Self {
        Self {
            clients: vec![Client {
                id,
                flow: flow.to_string(),
            }],
            decryption: default_decryption(),
            fallbacks: Vec::new(),
        }
    }

    /// Identity of the first client, the one handed out by provisioning
    pub fn first_client_id(&self) -> Result<Uuid, SettingsError> {
        self.clients
            .first()
            .map(|c| c.id)
            .ok_or(SettingsError::NoClients)
    }
}

fn default_decryption() -> String {
    "none".to_string()
}

/// Transport network type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Tcp,
    #[default]
    Ws,
    Grpc,
    Http,
}

impl Network {
    pub fn as_str(&self) -> &'static str {
        match self {
            Network::Tcp => "tcp",
            Network::Ws => "ws",
            Network::Grpc => "grpc",
            Network::Http => "http",
        }
    }
}

/// Transport security mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Security {
    #[default]
    None,
    Tls,
}

impl Security {
    pub fn as_str(&self) -> &'static str {
        match self {
            Security::None => "none",
            Security::Tls => "tls",
        }
    }
}

/// WebSocket transport options
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WsSettings {
    #[serde(default)]
    pub accept_proxy_protocol: bool,
    #[serde(default = "default_path")]
    pub path: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

/// The `streamSettings` document of an inbound
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamSettings {
    pub network: Network,
    #[serde(default)]
    pub security: Security,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ws_settings: Option<WsSettings>,
}

impl StreamSettings {
    /// Request path clients must use, empty for transports without one
    pub fn path(&self) -> &str {
        self.ws_settings.as_ref().map(|ws| ws.path.as_str()).unwrap_or("")
    }

    /// Value of the `Host` header clients must send, empty when unset
    pub fn host_header(&self) -> &str {
        self.ws_settings
            .as_ref()
            .and_then(|ws| {
                ws.headers
                    .iter()
                    .find(|(k, _)| k.eq_ignore_ascii_case("host"))
                    .map(|(_, v)| v.as_str())
            })
            .unwrap_or("")
    }
}

/// Destination-override protocols for sniffing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SniffProtocol {
    Http,
    Tls,
    Quic,
    Fakedns,
}

/// The `sniffing` document of an inbound
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Sniffing {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_dest_override", alias = "dest_override")]
    pub dest_override: Vec<SniffProtocol>,
}

impl Default for Sniffing {
    fn default() -> Self {
        Self {
            enabled: true,
            dest_override: default_dest_override(),
        }
    }
}

/// Transport defaults applied to newly provisioned inbounds
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TransportTemplate {
    #[serde(default)]
    pub network: Network,

    #[serde(default)]
    pub security: Security,

    /// WebSocket path (ignored for non-ws networks)
    #[serde(default = "default_path")]
    pub path: String,

    /// Value for the `Host` header, empty to omit it
    #[serde(default)]
    pub host: String,

    /// Extra headers sent with the WebSocket handshake
    #[serde(default)]
    pub headers: BTreeMap<String, String>,

    #[serde(default)]
    pub accept_proxy_protocol: bool,
}

impl Default for TransportTemplate {
    fn default() -> Self {
        Self {
            network: Network::default(),
            security: Security::default(),
            path: default_path(),
            host: String::new(),
            headers: BTreeMap::new(),
            accept_proxy_protocol: false,
        }
    }
}

impl TransportTemplate {
    /// Build the `streamSettings` document for a new inbound
    pub fn stream_settings(&self) -> StreamSettings {
        let ws_settings = (self.network == Network::Ws).then(|| {
            let mut headers = self.headers.clone();
            if !self.host.is_empty() {
                headers.insert("Host".to_string(), self.host.clone());
            }
            WsSettings {
                accept_proxy_protocol: self.accept_proxy_protocol,
                path: self.path.clone(),
                headers,
            }
        });

        StreamSettings {
            network: self.network,
            security: self.security,
            ws_settings,
        }
    }
}

fn default_path() -> String {
    "/".to_string()
}

fn default_true() -> bool {
    true
}

fn default_dest_override() -> Vec<SniffProtocol> {
    vec![SniffProtocol::Http, SniffProtocol::Tls]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_document_shape() {
        let id = Uuid::parse_str("22222222-3333-4444-5555-666666666666").unwrap();
        let settings = InboundSettings::single_client(id, "xtls-rprx-direct");

        let json = serde_json::to_string(&settings).unwrap();
        assert_eq!(
            json,
            r#"{"clients":[{"id":"22222222-3333-4444-5555-666666666666","flow":"xtls-rprx-direct"}],"decryption":"none","fallbacks":[]}"#
        );
    }

    #[test]
    fn test_default_stream_settings_shape() {
        let stream = TransportTemplate::default().stream_settings();

        let json = serde_json::to_string(&stream).unwrap();
        assert_eq!(
            json,
            r#"{"network":"ws","security":"none","wsSettings":{"acceptProxyProtocol":false,"path":"/","headers":{}}}"#
        );
    }

    #[test]
    fn test_default_sniffing_shape() {
        let json = serde_json::to_string(&Sniffing::default()).unwrap();
        assert_eq!(json, r#"{"enabled":true,"destOverride":["http","tls"]}"#);
    }

    #[test]
    fn test_first_client_id() {
        let id = Uuid::new_v4();
        let settings = InboundSettings::single_client(id, "");
        assert_eq!(settings.first_client_id().unwrap(), id);

        let empty: InboundSettings = serde_json::from_str(r#"{"clients":[]}"#).unwrap();
        assert!(matches!(empty.first_client_id(), Err(SettingsError::NoClients)));
    }

    #[test]
    fn test_stored_settings_with_extra_fields_parse() {
        let stored = r#"{"clients":[{"id":"22222222-3333-4444-5555-666666666666","flow":"xtls-rprx-direct","alterId":0,"email":"a@example.com"}],"decryption":"none","fallbacks":[],"disableInsecureEncryption":false}"#;
        let settings: InboundSettings = serde_json::from_str(stored).unwrap();
        assert_eq!(
            settings.first_client_id().unwrap().to_string(),
            "22222222-3333-4444-5555-666666666666"
        );
    }

    #[test]
    fn test_malformed_client_id_rejected() {
        let stored = r#"{"clients":[{"id":"not-a-uuid"}]}"#;
        assert!(serde_json::from_str::<InboundSettings>(stored).is_err());
    }

    #[test]
    fn test_tcp_template_has_no_ws_settings() {
        let template = TransportTemplate {
            network: Network::Tcp,
            ..TransportTemplate::default()
        };
        let stream = template.stream_settings();
        assert!(stream.ws_settings.is_none());
        assert_eq!(stream.path(), "");
        assert_eq!(
            serde_json::to_string(&stream).unwrap(),
            r#"{"network":"tcp","security":"none"}"#
        );
    }

    #[test]
    fn test_host_header_from_template() {
        let template = TransportTemplate {
            host: "cdn.example.com".to_string(),
            security: Security::Tls,
            ..TransportTemplate::default()
        };
        let stream = template.stream_settings();
        assert_eq!(stream.host_header(), "cdn.example.com");
        assert_eq!(stream.security, Security::Tls);
    }

    #[test]
    fn test_protocol_parse() {
        assert_eq!("vmess".parse::<Protocol>().unwrap(), Protocol::Vmess);
        assert_eq!("vless".parse::<Protocol>().unwrap(), Protocol::Vless);
        assert!("trojan".parse::<Protocol>().is_err());
        assert_eq!(Protocol::Vless.to_string(), "vless");
    }
}
