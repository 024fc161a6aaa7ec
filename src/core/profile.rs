//! Connection profiles - Saved configs and protocol detection

use serde::{Deserialize, Serialize};

/// Protocol family detected from pasted or subscribed text
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProfileKind {
    Vmess,
    Vless,
    Trojan,
    Shadowsocks,
    Socks,
    Http,
    Hysteria2,
    Openvpn,
    Openconnect,
    Wireguard,
    Ssh,
    SingboxJson,
    Unknown,
}

impl ProfileKind {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Vmess => "vmess",
            Self::Vless => "vless",
            Self::Trojan => "trojan",
            Self::Shadowsocks => "shadowsocks",
            Self::Socks => "socks",
            Self::Http => "http",
            Self::Hysteria2 => "hysteria2",
            Self::Openvpn => "openvpn",
            Self::Openconnect => "openconnect",
            Self::Wireguard => "wireguard",
            Self::Ssh => "ssh",
            Self::SingboxJson => "singbox_json",
            Self::Unknown => "unknown",
        }
    }

    /// Detect the protocol of raw config text. First match wins.
    pub fn detect(raw: &str) -> Self {
        let t = raw.trim();
        if t.is_empty() {
            return Self::Unknown;
        }
        let low = t.to_lowercase();
        let has_scheme = |schemes: &[&str]| schemes.iter().any(|s| low.starts_with(s));

        if has_scheme(&["vmess://"]) {
            Self::Vmess
        } else if has_scheme(&["vless://"]) {
            Self::Vless
        } else if has_scheme(&["trojan://"]) {
            Self::Trojan
        } else if has_scheme(&["ss://"]) {
            Self::Shadowsocks
        } else if has_scheme(&["socks://", "socks5://"]) {
            Self::Socks
        } else if has_scheme(&["http://", "https://"]) {
            // Subscription URL or plain HTTP proxy; callers decide which
            Self::Http
        } else if has_scheme(&["hysteria2://", "hy2://"]) {
            Self::Hysteria2
        } else if low.contains("openvpn") || low.starts_with("ovpn://") || low.ends_with(".ovpn") {
            Self::Openvpn
        } else if low.contains("openconnect") || low.contains("anyconnect") {
            Self::Openconnect
        } else if low
            .lines()
            .any(|line| line.trim_start().starts_with("[interface]"))
        {
            Self::Wireguard
        } else if is_inline_ssh(&low) || low.starts_with("ssh://") {
            Self::Ssh
        } else if t.starts_with('{') && (t.contains("outbounds") || t.contains("inbounds")) {
            Self::SingboxJson
        } else {
            Self::Unknown
        }
    }

    /// Core best suited to run this kind of profile
    pub fn suggested_core(&self) -> &'static str {
        match self {
            Self::Vmess
            | Self::Vless
            | Self::Trojan
            | Self::Shadowsocks
            | Self::Socks
            | Self::Http
            | Self::Hysteria2
            | Self::Wireguard
            | Self::SingboxJson => "singbox",
            Self::Openvpn => "openvpn",
            Self::Openconnect => "openconnect",
            Self::Ssh => "ssh",
            Self::Unknown => "auto",
        }
    }
}

/// `ssh user@host ...` pasted as a command line
fn is_inline_ssh(low: &str) -> bool {
    low.strip_prefix("ssh")
        .and_then(|rest| rest.chars().next())
        .map(char::is_whitespace)
        .unwrap_or(false)
}

fn default_core() -> String {
    "auto".to_string()
}

/// A saved connection profile as stored in settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SavedConfig {
    #[serde(default)]
    pub name: String,
    /// Detected protocol label
    #[serde(rename = "type", default)]
    pub kind: String,
    /// Core identifier the profile should run on
    #[serde(default = "default_core")]
    pub core: String,
    #[serde(default)]
    pub raw: String,
}

impl SavedConfig {
    /// Build a profile from pasted text, detecting its kind and core
    pub fn from_raw(name: impl Into<String>, raw: impl Into<String>) -> Self {
        let raw = raw.into();
        let kind = ProfileKind::detect(&raw);
        Self {
            name: name.into(),
            kind: kind.label().to_string(),
            core: kind.suggested_core().to_string(),
            raw,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_uri_schemes() {
        let cases = [
            ("vmess://eyJ2IjoiMiJ9", ProfileKind::Vmess),
            ("VLESS://uuid@host:443", ProfileKind::Vless),
            ("trojan://pw@host:443", ProfileKind::Trojan),
            ("ss://YWVzOnB3@host:8388", ProfileKind::Shadowsocks),
            ("socks5://127.0.0.1:1080", ProfileKind::Socks),
            ("https://sub.example.com/list", ProfileKind::Http),
            ("hy2://pw@host:443", ProfileKind::Hysteria2),
            ("ssh://user@host", ProfileKind::Ssh),
            ("  ssh -D 1080 user@host", ProfileKind::Ssh),
        ];
        for (raw, kind) in cases {
            assert_eq!(ProfileKind::detect(raw), kind, "{raw}");
        }
    }

    #[test]
    fn detects_file_formats() {
        assert_eq!(
            ProfileKind::detect("client\ndev tun\n# openvpn profile"),
            ProfileKind::Openvpn
        );
        assert_eq!(ProfileKind::detect("vpn.example.com anyconnect"), ProfileKind::Openconnect);
        assert_eq!(
            ProfileKind::detect("[Interface]\nPrivateKey = abc\n[Peer]"),
            ProfileKind::Wireguard
        );
        assert_eq!(
            ProfileKind::detect(r#"{"outbounds":[{"type":"direct"}]}"#),
            ProfileKind::SingboxJson
        );
        assert_eq!(ProfileKind::detect("{}"), ProfileKind::Unknown);
        assert_eq!(ProfileKind::detect("   "), ProfileKind::Unknown);
        assert_eq!(ProfileKind::detect("sshd_config"), ProfileKind::Unknown);
    }

    #[test]
    fn suggests_cores() {
        assert_eq!(ProfileKind::Wireguard.suggested_core(), "singbox");
        assert_eq!(ProfileKind::Openvpn.suggested_core(), "openvpn");
        assert_eq!(ProfileKind::Unknown.suggested_core(), "auto");
    }

    #[test]
    fn saved_config_defaults_core_to_auto() {
        let cfg: SavedConfig = serde_json::from_str(r#"{"raw": "{}"}"#).unwrap();
        assert_eq!(cfg.core, "auto");

        let cfg = SavedConfig::from_raw("x", "trojan://pw@h:1");
        assert_eq!(cfg.kind, "trojan");
        assert_eq!(cfg.core, "singbox");
    }
}
