//! Config routing - Map a core identifier to the core that should run it

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Serialize;

/// Directory holding the bundled sing-box binary, relative to the working root
const SINGBOX_DIR: &str = "cores/sing-box";

/// Format of the configuration a core consumes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigKind {
    Json,
    Yaml,
    Ovpn,
    Url,
    Unknown,
}

/// Known core families
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CoreFamily {
    Singbox,
    Clash,
    OpenVpn,
    OpenConnect,
    /// Anything we do not recognize
    Unknown,
}

impl CoreFamily {
    /// Whether a runtime exists for this family
    pub fn is_implemented(&self) -> bool {
        matches!(self, Self::Singbox)
    }
}

/// Resolved description of the core for one start request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CoreSpec {
    pub name: String,
    pub family: CoreFamily,
    pub binary: Option<PathBuf>,
    pub kind: ConfigKind,
}

/// Routes core identifiers to `CoreSpec`s.
///
/// Resolution has no side effects; sing-box is looked up among fixed paths
/// under `root`, other cores come from the configured path overrides.
#[derive(Debug, Clone)]
pub struct ConfigRouter {
    root: PathBuf,
    paths: HashMap<String, PathBuf>,
}

impl ConfigRouter {
    pub fn new(root: impl Into<PathBuf>, paths: HashMap<String, PathBuf>) -> Self {
        Self {
            root: root.into(),
            paths,
        }
    }

    pub fn resolve(&self, core: &str) -> CoreSpec {
        let core = core.trim().to_lowercase();
        match core.as_str() {
            "auto" | "singbox" | "sing-box" => CoreSpec {
                name: "singbox".into(),
                family: CoreFamily::Singbox,
                binary: self.find_singbox_binary(),
                kind: ConfigKind::Json,
            },
            "clash" | "mihomo" => CoreSpec {
                name: "clash".into(),
                family: CoreFamily::Clash,
                binary: self.configured("clash"),
                kind: ConfigKind::Yaml,
            },
            "openvpn" => CoreSpec {
                name: "openvpn".into(),
                family: CoreFamily::OpenVpn,
                binary: self.configured("openvpn"),
                kind: ConfigKind::Ovpn,
            },
            "openconnect" => CoreSpec {
                name: "openconnect".into(),
                family: CoreFamily::OpenConnect,
                binary: self.configured("openconnect"),
                kind: ConfigKind::Url,
            },
            _ => CoreSpec {
                name: core,
                family: CoreFamily::Unknown,
                binary: None,
                kind: ConfigKind::Unknown,
            },
        }
    }

    /// First existing sing-box binary, native executable name first
    pub fn find_singbox_binary(&self) -> Option<PathBuf> {
        singbox_candidates()
            .into_iter()
            .map(|rel| self.root.join(rel))
            .find(|path| path.is_file())
    }

    fn configured(&self, core: &str) -> Option<PathBuf> {
        self.paths
            .get(core)
            .filter(|p| !p.as_os_str().is_empty())
            .cloned()
    }
}

fn singbox_candidates() -> Vec<PathBuf> {
    let dir = Path::new(SINGBOX_DIR);
    let native = dir.join(format!("sing-box{}", std::env::consts::EXE_SUFFIX));
    let mut candidates = vec![native];
    for name in ["sing-box", "sing-box.exe"] {
        let path = dir.join(name);
        if !candidates.contains(&path) {
            candidates.push(path);
        }
    }
    candidates
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn router(root: &Path) -> ConfigRouter {
        let mut paths = HashMap::new();
        paths.insert("openvpn".to_string(), PathBuf::from("/usr/sbin/openvpn"));
        paths.insert("openconnect".to_string(), PathBuf::new());
        ConfigRouter::new(root, paths)
    }

    #[test]
    fn singbox_aliases_resolve_to_json() {
        let dir = tempdir().unwrap();
        let router = router(dir.path());
        for alias in ["auto", "singbox", "Sing-Box", " SINGBOX "] {
            let spec = router.resolve(alias);
            assert_eq!(spec.name, "singbox");
            assert_eq!(spec.family, CoreFamily::Singbox);
            assert_eq!(spec.kind, ConfigKind::Json);
            assert_eq!(spec.binary, None);
        }
    }

    #[test]
    fn singbox_binary_is_found_under_root() {
        let dir = tempdir().unwrap();
        let bin_dir = dir.path().join(SINGBOX_DIR);
        std::fs::create_dir_all(&bin_dir).unwrap();
        let bin = bin_dir.join(format!("sing-box{}", std::env::consts::EXE_SUFFIX));
        std::fs::write(&bin, b"").unwrap();

        let spec = router(dir.path()).resolve("singbox");
        assert_eq!(spec.binary, Some(bin));
    }

    #[test]
    fn other_cores_use_configured_paths() {
        let dir = tempdir().unwrap();
        let router = router(dir.path());

        let clash = router.resolve("mihomo");
        assert_eq!(clash.name, "clash");
        assert_eq!(clash.kind, ConfigKind::Yaml);
        assert_eq!(clash.binary, None);

        let ovpn = router.resolve("openvpn");
        assert_eq!(ovpn.kind, ConfigKind::Ovpn);
        assert_eq!(ovpn.binary, Some(PathBuf::from("/usr/sbin/openvpn")));
        assert!(!ovpn.family.is_implemented());

        // Empty configured path counts as not configured
        let oc = router.resolve("openconnect");
        assert_eq!(oc.kind, ConfigKind::Url);
        assert_eq!(oc.binary, None);
    }

    #[test]
    fn unknown_identifier_has_no_binary() {
        let dir = tempdir().unwrap();
        let spec = router(dir.path()).resolve("WireGuard");
        assert_eq!(spec.name, "wireguard");
        assert_eq!(spec.family, CoreFamily::Unknown);
        assert_eq!(spec.kind, ConfigKind::Unknown);
        assert_eq!(spec.binary, None);
    }

    #[test]
    fn resolution_is_deterministic() {
        let dir = tempdir().unwrap();
        let router = router(dir.path());
        assert_eq!(router.resolve("openvpn"), router.resolve("openvpn"));
    }
}
