//! SIP configuration inputs (§6), loadable from JSON the way the rest of the
//! wire protocol is: `camelCase` on the wire, idiomatic `snake_case` in Rust.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

fn default_register_expires() -> u32 {
    3600
}

fn default_ice_gathering_timeout_ms() -> u64 {
    5000
}

fn default_connection_timeout_ms() -> u64 {
    20_000
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

fn default_stun_servers() -> Vec<String> {
    vec!["stun:stun.l.google.com:19302".to_string()]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnServerConfig {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SipConfig {
    /// `sip:user@host`
    pub uri: String,
    pub password: String,
    /// WebSocket signaling server(s); the first that connects wins.
    pub ws_servers: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default = "default_register_expires")]
    pub register_expires: u32,
    #[serde(default = "default_ice_gathering_timeout_ms")]
    pub ice_gathering_timeout_ms: u64,
    #[serde(default = "default_connection_timeout_ms")]
    pub connection_timeout_ms: u64,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_stun_servers")]
    pub stun_servers: Vec<String>,
    #[serde(default)]
    pub turn_servers: Vec<TurnServerConfig>,
    #[serde(default)]
    pub extra_headers: HashMap<String, String>,
    #[serde(default = "default_true")]
    pub auto_reconnect: bool,
    #[serde(default)]
    pub logs_enabled: bool,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Advisory: the caller intends to exercise transport/registration only
    /// and will never call `makeCall`/`answerCall` on this UA. Not read by
    /// `SipManager` itself — nothing needs a peer connection until one of
    /// those calls actually happens — kept on the wire so test configs can
    /// say so explicitly.
    #[serde(default)]
    pub transport_only: bool,
}

fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for SipConfig {
    fn default() -> Self {
        SipConfig {
            uri: String::new(),
            password: String::new(),
            ws_servers: Vec::new(),
            display_name: None,
            register_expires: default_register_expires(),
            ice_gathering_timeout_ms: default_ice_gathering_timeout_ms(),
            connection_timeout_ms: default_connection_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            stun_servers: default_stun_servers(),
            turn_servers: Vec::new(),
            extra_headers: HashMap::new(),
            auto_reconnect: true,
            logs_enabled: false,
            log_level: default_log_level(),
            transport_only: false,
        }
    }
}

impl SipConfig {
    /// `extra_headers` converted to `Key: Value` lines, in the shape the SIP
    /// manager passes through as extra headers on REGISTER/INVITE.
    pub fn extra_header_lines(&self) -> Vec<String> {
        self.extra_headers
            .iter()
            .map(|(k, v)| format!("{k}: {v}"))
            .collect()
    }

    /// Synthesized ICE server list: configured STUN servers (or the default
    /// if none given) followed by any configured TURN servers.
    pub fn ice_servers(&self) -> Vec<String> {
        let mut servers = if self.stun_servers.is_empty() {
            default_stun_servers()
        } else {
            self.stun_servers.clone()
        };
        for turn in &self.turn_servers {
            servers.extend(turn.urls.iter().cloned());
        }
        servers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_spec_literal_defaults() {
        let cfg = SipConfig::default();
        assert_eq!(cfg.register_expires, 3600);
        assert_eq!(cfg.ice_gathering_timeout_ms, 5000);
        assert_eq!(cfg.connection_timeout_ms, 20_000);
        assert_eq!(cfg.stun_servers, vec!["stun:stun.l.google.com:19302"]);
        assert!(cfg.auto_reconnect);
    }

    #[test]
    fn deserializes_camel_case_json_with_partial_fields() {
        let json = r#"{"uri":"sip:alice@example.org","password":"pw","wsServers":["wss://example.org/ws"],"registerExpires":600}"#;
        let cfg: SipConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.uri, "sip:alice@example.org");
        assert_eq!(cfg.register_expires, 600);
        assert_eq!(cfg.ice_gathering_timeout_ms, 5000); // default filled in
    }

    #[test]
    fn empty_stun_list_falls_back_to_default_ice_server() {
        let mut cfg = SipConfig::default();
        cfg.stun_servers.clear();
        assert_eq!(cfg.ice_servers(), vec!["stun:stun.l.google.com:19302"]);
    }
}
