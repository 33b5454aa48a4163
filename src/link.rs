//! Share links for provisioned inbounds

use crate::db::Inbound;
use crate::settings::Protocol;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::Serialize;
use uuid::Uuid;

/// v2rayN document. Field order is the serialization order.
#[derive(Serialize)]
struct VmessDoc<'a> {
    #[serde(rename = "v")]
    version: &'static str,
    #[serde(rename = "ps")]
    name: &'a str,
    #[serde(rename = "add")]
    address: &'a str,
    port: u16,
    #[serde(rename = "id")]
    user_id: &'a Uuid,
    #[serde(rename = "aid")]
    alter_id: u16,
    #[serde(rename = "net")]
    network: &'static str,
    #[serde(rename = "type")]
    header_type: &'static str,
    host: &'a str,
    path: &'a str,
    tls: &'static str,
}

/// Render the share link a client application imports.
///
/// `request_host` is the `Host` the caller reached the panel on; any port
/// suffix is dropped. The output depends only on the arguments.
pub fn encode(inbound: &Inbound, client_id: &Uuid, request_host: &str) -> String {
    let address = strip_port(request_host);
    match inbound.protocol {
        Protocol::Vmess => encode_vmess(inbound, client_id, address),
        Protocol::Vless => encode_vless(inbound, client_id, address),
    }
}

fn encode_vmess(inbound: &Inbound, client_id: &Uuid, address: &str) -> String {
    let stream = &inbound.stream_settings;
    let doc = VmessDoc {
        version: "2",
        name: &inbound.remark,
        address,
        port: inbound.port,
        user_id: client_id,
        alter_id: 0,
        network: stream.network.as_str(),
        header_type: "none",
        host: stream.host_header(),
        path: stream.path(),
        tls: stream.security.as_str(),
    };
    let json = serde_json::to_vec(&doc).unwrap_or_default();
    format!("vmess://{}", STANDARD.encode(json))
}

fn encode_vless(inbound: &Inbound, client_id: &Uuid, address: &str) -> String {
    let stream = &inbound.stream_settings;
    let flow = inbound
        .settings
        .clients
        .iter()
        .find(|c| c.id == *client_id)
        .map(|c| c.flow.as_str())
        .unwrap_or("");

    let mut query = vec![
        format!("type={}", stream.network.as_str()),
        format!("security={}", stream.security.as_str()),
    ];
    let path = stream.path();
    if !path.is_empty() {
        query.push(format!("path={}", urlencoding::encode(path)));
    }
    let host = stream.host_header();
    if !host.is_empty() {
        query.push(format!("host={}", urlencoding::encode(host)));
    }
    if !flow.is_empty() {
        query.push(format!("flow={}", urlencoding::encode(flow)));
    }

    let address = if address.contains(':') {
        format!("[{}]", address)
    } else {
        address.to_string()
    };

    format!(
        "vless://{}@{}:{}?{}#{}",
        client_id,
        address,
        inbound.port,
        query.join("&"),
        urlencoding::encode(&inbound.remark)
    )
}

/// Host portion of a `Host` header value.
///
/// Handles `host`, `host:port`, `[v6]` and `[v6]:port`. A bare IPv6 address
/// without brackets is returned unchanged.
pub fn strip_port(host: &str) -> &str {
    if let Some(rest) = host.strip_prefix('[') {
        return match rest.find(']') {
            Some(end) => &rest[..end],
            None => host,
        };
    }
    match host.rsplit_once(':') {
        Some((name, port))
            if !name.contains(':') && port.bytes().all(|b| b.is_ascii_digit()) =>
        {
            name
        }
        _ => host,
    }
}
