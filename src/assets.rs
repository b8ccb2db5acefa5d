//! Content-addressed injected assets
//!
//! Every injected file is identified by a hash of its absolute path, so its
//! URL stays stable while the file is edited but changes when it moves.

use crate::config::ProxyConfig;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Reserved URL prefix serving injected assets: `/__static/{hash}/{fileName}`
pub const STATIC_PREFIX: &str = "/__static/";

const SOURCE_MAP_SUFFIX: &str = ".map";

/// How an asset is spliced into a page
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssetKind {
    Script,
    Stylesheet,
    Html,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InjectAsset {
    pub content_hash: String,
    pub absolute_path: PathBuf,
    pub file_name: String,
}

impl InjectAsset {
    pub fn new(absolute_path: PathBuf) -> Self {
        let file_name = absolute_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        Self {
            content_hash: content_hash(&absolute_path),
            absolute_path,
            file_name,
        }
    }

    pub fn kind(&self) -> AssetKind {
        let name = self.file_name.to_ascii_lowercase();
        if name.ends_with(".js") {
            AssetKind::Script
        } else if name.ends_with(".css") {
            AssetKind::Stylesheet
        } else if name.ends_with(".html") || name.ends_with(".htm") {
            AssetKind::Html
        } else {
            AssetKind::Other
        }
    }

    /// Path under which the proxy serves this asset
    pub fn static_url(&self) -> String {
        format!("{}{}/{}", STATIC_PREFIX, self.content_hash, self.file_name)
    }
}

/// Hex SHA-256 of the path's string form
pub fn content_hash(path: &Path) -> String {
    let digest = Sha256::digest(path.to_string_lossy().as_bytes());
    format!("{:x}", digest)
}

/// Hash -> absolute path lookup, built once from the configuration
#[derive(Debug, Default)]
pub struct AssetRegistry {
    assets: HashMap<String, PathBuf>,
}

impl AssetRegistry {
    pub fn new(config: &ProxyConfig) -> Self {
        let assets = config
            .sites
            .iter()
            .flat_map(|site| site.injects.iter())
            .map(|asset| (asset.content_hash.clone(), asset.absolute_path.clone()))
            .collect();

        Self { assets }
    }

    pub fn len(&self) -> usize {
        self.assets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assets.is_empty()
    }

    /// Resolve a registered asset. A `.map` file name resolves to the
    /// sibling source map of the registered file.
    pub fn resolve(&self, hash: &str, file_name: &str) -> Option<PathBuf> {
        let path = self.assets.get(hash)?;
        if file_name.ends_with(SOURCE_MAP_SUFFIX) {
            let mut map = path.clone().into_os_string();
            map.push(SOURCE_MAP_SUFFIX);
            Some(PathBuf::from(map))
        } else {
            Some(path.clone())
        }
    }

    /// Resolve a request path under [`STATIC_PREFIX`]
    pub fn resolve_path(&self, request_path: &str) -> Option<PathBuf> {
        let rest = request_path.strip_prefix(STATIC_PREFIX)?;
        let (hash, file_name) = rest.split_once('/')?;
        if hash.is_empty() || file_name.is_empty() || file_name.contains('/') {
            return None;
        }
        self.resolve(hash, file_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigFile;
    use serde_json::json;

    fn registry() -> (ProxyConfig, AssetRegistry) {
        let file: ConfigFile = serde_json::from_value(json!({
            "sites": [
                { "urls": ["a"], "inject": ["scripts/app.js", "style.css"] },
                { "urls": ["b"], "inject": ["fragment.html"] }
            ]
        }))
        .unwrap();
        let config = ProxyConfig::from_file(file, Path::new("/srv/proxy")).unwrap();
        let registry = AssetRegistry::new(&config);
        (config, registry)
    }

    #[test]
    fn test_content_hash_is_deterministic() {
        let path = Path::new("/srv/proxy/app.js");
        assert_eq!(content_hash(path), content_hash(path));
        assert_eq!(content_hash(path).len(), 64);
        assert_ne!(content_hash(path), content_hash(Path::new("/srv/other/app.js")));
    }

    #[test]
    fn test_inject_asset_fields() {
        let asset = InjectAsset::new(PathBuf::from("/srv/proxy/scripts/app.js"));
        assert_eq!(asset.file_name, "app.js");
        assert_eq!(asset.kind(), AssetKind::Script);
        assert_eq!(
            asset.static_url(),
            format!("/__static/{}/app.js", asset.content_hash)
        );

        assert_eq!(InjectAsset::new(PathBuf::from("/x/s.css")).kind(), AssetKind::Stylesheet);
        assert_eq!(InjectAsset::new(PathBuf::from("/x/f.html")).kind(), AssetKind::Html);
        assert_eq!(InjectAsset::new(PathBuf::from("/x/f.txt")).kind(), AssetKind::Other);
    }

    #[test]
    fn test_resolve_round_trip() {
        let (config, registry) = registry();
        assert_eq!(registry.len(), 3);

        let asset = &config.sites[0].injects[0];
        assert_eq!(
            registry.resolve(&asset.content_hash, "app.js"),
            Some(PathBuf::from("/srv/proxy/scripts/app.js"))
        );
        // The file name is not checked, only the source map suffix
        assert_eq!(
            registry.resolve(&asset.content_hash, "anything.txt"),
            Some(PathBuf::from("/srv/proxy/scripts/app.js"))
        );
        assert_eq!(
            registry.resolve(&asset.content_hash, "app.js.map"),
            Some(PathBuf::from("/srv/proxy/scripts/app.js.map"))
        );
    }

    #[test]
    fn test_resolve_unknown_hash() {
        let (_, registry) = registry();
        assert_eq!(registry.resolve("deadbeef", "app.js"), None);
    }

    #[test]
    fn test_resolve_path() {
        let (config, registry) = registry();
        let asset = &config.sites[1].injects[0];

        assert_eq!(
            registry.resolve_path(&asset.static_url()),
            Some(PathBuf::from("/srv/proxy/fragment.html"))
        );
        assert_eq!(registry.resolve_path("/__static/"), None);
        assert_eq!(registry.resolve_path(&format!("/__static/{}", asset.content_hash)), None);
        assert_eq!(registry.resolve_path("/index.html"), None);
    }
}
