// Extension struct and loader
//
// Defines the BrowserExtension type that owns a validated manifest and knows
// where its resources live, and provides methods for loading its content and
// background scripts through a `ResourceLoader`.

use super::manifest::{BackgroundDescriptor, ContentScriptDeclaration, ExtensionManifest};
use super::match_pattern::MatchPattern;
use crate::logging::ExtensionLogger;
use anyhow::{anyhow, Context, Result};
use std::collections::HashMap;
use std::fmt;
use std::path::{Component, Path};
use std::rc::{Rc, Weak};
use thiserror::Error;
use url::Url;
use uuid::Uuid;

const MANIFEST_FILE: &str = "manifest.json";

/// Runtime identity of a loaded extension
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExtensionId(Uuid);

impl ExtensionId {
    /// A fresh random id
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Uuid::parse_str(raw).ok().map(Self)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ExtensionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ExtensionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Lowercase hyphenated form, which is what page JavaScript sees
        write!(f, "{}", self.0.hyphenated())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ContentScriptLoadingError {
    #[error("script file not found: {0}")]
    FileNotFound(String),
    #[error("script path escapes the extension directory: {0}")]
    InvalidPath(String),
    #[error("failed to read {path}: {message}")]
    Io { path: String, message: String },
}

/// Resolves extension-relative paths to file contents
pub trait ResourceLoader {
    fn load_text(&self, base_url: &Url, path: &str) -> Result<String, ContentScriptLoadingError>;
}

/// Reads resources from the local filesystem under a `file://` base URL
#[derive(Debug, Default, Clone, Copy)]
pub struct FsResourceLoader;

impl ResourceLoader for FsResourceLoader {
    fn load_text(&self, base_url: &Url, path: &str) -> Result<String, ContentScriptLoadingError> {
        let relative = Path::new(path);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if escapes {
            return Err(ContentScriptLoadingError::InvalidPath(path.to_string()));
        }

        let base = base_url
            .to_file_path()
            .map_err(|_| ContentScriptLoadingError::InvalidPath(path.to_string()))?;
        let full_path = base.join(relative);

        std::fs::read_to_string(&full_path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => ContentScriptLoadingError::FileNotFound(path.to_string()),
            _ => ContentScriptLoadingError::Io {
                path: path.to_string(),
                message: e.to_string(),
            },
        })
    }
}

/// Serves resources from memory, keyed by manifest path
#[derive(Debug, Default, Clone)]
pub struct MemoryResourceLoader {
    files: HashMap<String, String>,
}

impl MemoryResourceLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(mut self, path: &str, contents: &str) -> Self {
        self.files.insert(path.to_string(), contents.to_string());
        self
    }
}

impl ResourceLoader for MemoryResourceLoader {
    fn load_text(&self, _base_url: &Url, path: &str) -> Result<String, ContentScriptLoadingError> {
        self.files
            .get(path)
            .cloned()
            .ok_or_else(|| ContentScriptLoadingError::FileNotFound(path.to_string()))
    }
}

/// A content script declaration with its sources loaded
#[derive(Debug, Clone, PartialEq)]
pub struct ContentScriptResource {
    pub config: ContentScriptDeclaration,
    /// One entry per `js` path, in manifest order
    pub js_content: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BackgroundScriptResource {
    pub config: BackgroundDescriptor,
    pub js_content: String,
    pub is_service_worker: bool,
}

/// Represents a loaded extension
pub struct BrowserExtension {
    id: ExtensionId,
    manifest: ExtensionManifest,
    base_url: Url,
    logger: Weak<ExtensionLogger>,
}

impl BrowserExtension {
    /// Wrap a manifest. The id is freshly generated, never taken from the manifest.
    pub fn new(manifest: ExtensionManifest, base_url: Url, logger: &Rc<ExtensionLogger>) -> Self {
        let id = ExtensionId::new();
        logger.debug(format!(
            "Created extension {id} ({:?}) at {base_url}",
            manifest.name()
        ));
        Self {
            id,
            manifest,
            base_url,
            logger: Rc::downgrade(logger),
        }
    }

    /// Extension rooted at `base_directory/extension_location`
    pub fn from_directory(
        manifest: ExtensionManifest,
        base_directory: &Path,
        extension_location: &str,
        logger: &Rc<ExtensionLogger>,
    ) -> Result<Self> {
        let directory = base_directory.join(extension_location);
        let base_url = Url::from_directory_path(&directory)
            .map_err(|_| anyhow!("Extension directory must be absolute: {}", directory.display()))?;
        Ok(Self::new(manifest, base_url, logger))
    }

    /// Read and validate `manifest.json` from an extension directory
    pub fn load_from_directory(directory: &Path, logger: &Rc<ExtensionLogger>) -> Result<Self> {
        let base_url = Url::from_directory_path(directory)
            .map_err(|_| anyhow!("Extension directory must be absolute: {}", directory.display()))?;
        let json = FsResourceLoader
            .load_text(&base_url, MANIFEST_FILE)
            .with_context(|| format!("Failed to read manifest in {}", directory.display()))?;
        let manifest = ExtensionManifest::load(&json)
            .with_context(|| format!("Invalid manifest in {}", directory.display()))?;
        Ok(Self::new(manifest, base_url, logger))
    }

    pub fn id(&self) -> ExtensionId {
        self.id
    }

    pub fn manifest(&self) -> &ExtensionManifest {
        &self.manifest
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// The logger, if whoever owns it is still alive
    pub fn logger(&self) -> Option<Rc<ExtensionLogger>> {
        self.logger.upgrade()
    }

    /// Whether host permissions grant access to `url`
    pub fn is_url_allowed(&self, url: &str) -> bool {
        let parsed = match Url::parse(url) {
            Ok(u) => u,
            Err(_) => return false,
        };

        self.manifest
            .host_permissions()
            .unwrap_or_default()
            .iter()
            .filter_map(|raw| MatchPattern::parse(raw).ok())
            .any(|pattern| pattern.matches(&parsed))
    }

    /// Load the sources of every declared content script
    pub fn load_content_scripts(
        &self,
        loader: &dyn ResourceLoader,
    ) -> Result<Vec<ContentScriptResource>, ContentScriptLoadingError> {
        let mut resources = Vec::with_capacity(self.manifest.content_scripts().len());
        for declaration in self.manifest.content_scripts() {
            let js_content = declaration
                .js
                .iter()
                .map(|path| loader.load_text(&self.base_url, path))
                .collect::<Result<Vec<_>, _>>()?;
            resources.push(ContentScriptResource {
                config: declaration.clone(),
                js_content,
            });
        }

        if let Some(logger) = self.logger() {
            logger.debug(format!(
                "Loaded {} content script(s) for {}",
                resources.len(),
                self.id
            ));
        }
        Ok(resources)
    }

    /// Load the background script. Legacy `scripts` are joined with a blank line.
    pub fn load_background_script(
        &self,
        loader: &dyn ResourceLoader,
    ) -> Result<Option<BackgroundScriptResource>, ContentScriptLoadingError> {
        let Some(background) = self.manifest.background() else {
            return Ok(None);
        };

        if let Some(service_worker) = &background.service_worker {
            let js_content = loader.load_text(&self.base_url, service_worker)?;
            return Ok(Some(BackgroundScriptResource {
                config: background.clone(),
                js_content,
                is_service_worker: true,
            }));
        }

        match &background.scripts {
            Some(scripts) if !scripts.is_empty() => {
                let sources = scripts
                    .iter()
                    .map(|path| loader.load_text(&self.base_url, path))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Some(BackgroundScriptResource {
                    config: background.clone(),
                    js_content: sources.join("\n\n"),
                    is_service_worker: false,
                }))
            }
            _ => Ok(None),
        }
    }
}

impl fmt::Debug for BrowserExtension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrowserExtension")
            .field("id", &self.id)
            .field("name", &self.manifest.name())
            .field("base_url", &self.base_url.as_str())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extensions::manifest::RunAt;

    fn logger() -> Rc<ExtensionLogger> {
        ExtensionLogger::new("test")
    }

    fn content_manifest(js: &[&str]) -> ExtensionManifest {
        ExtensionManifest::new(3, "Test Extension", "1.0").with_content_scripts(vec![
            ContentScriptDeclaration::new(
                vec!["<all_urls>".to_string()],
                js.iter().map(|s| s.to_string()).collect(),
                RunAt::DocumentEnd,
            ),
        ])
    }

    #[test]
    fn test_extension_initialization() {
        let logger = logger();
        let ext = BrowserExtension::from_directory(
            ExtensionManifest::new(3, "Test Extension", "1.0"),
            Path::new("/test"),
            "path",
            &logger,
        )
        .unwrap();

        assert_eq!(ext.manifest().name(), Some("Test Extension"));
        assert_eq!(ext.base_url().as_str(), "file:///test/path/");
        assert!(!ext.id().to_string().is_empty());
        assert!(ext.logger().is_some());
    }

    #[test]
    fn test_ids_are_unique_and_not_derived_from_manifest() {
        let logger = logger();
        let manifest = ExtensionManifest::new(3, "Same", "1.0");
        let base = Url::parse("file:///ext/").unwrap();
        let a = BrowserExtension::new(manifest.clone(), base.clone(), &logger);
        let b = BrowserExtension::new(manifest, base, &logger);

        assert_ne!(a.id(), b.id());
        assert_eq!(ExtensionId::parse(&a.id().to_string()), Some(a.id()));
    }

    #[test]
    fn test_logger_reference_is_weak() {
        let logger = logger();
        let ext = BrowserExtension::new(
            ExtensionManifest::new(3, "A", "1"),
            Url::parse("file:///ext/").unwrap(),
            &logger,
        );
        drop(logger);
        assert!(ext.logger().is_none());
    }

    #[test]
    fn test_content_script_loading_success() {
        let dir = tempfile::tempdir().unwrap();
        let js = "console.log('Red box extension loaded');";
        std::fs::write(dir.path().join("content.js"), js).unwrap();

        let logger = logger();
        let ext = BrowserExtension::from_directory(
            content_manifest(&["content.js"]),
            dir.path().parent().unwrap(),
            dir.path().file_name().unwrap().to_str().unwrap(),
            &logger,
        )
        .unwrap();

        let resources = ext.load_content_scripts(&FsResourceLoader).unwrap();
        assert_eq!(resources.len(), 1);
        assert_eq!(resources[0].js_content, vec![js.to_string()]);
        assert_eq!(resources[0].config.matches, vec!["<all_urls>".to_string()]);
    }

    #[test]
    fn test_content_script_loading_file_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let logger = logger();
        let ext = BrowserExtension::new(
            content_manifest(&["missing.js"]),
            Url::from_directory_path(dir.path()).unwrap(),
            &logger,
        );

        assert_eq!(
            ext.load_content_scripts(&FsResourceLoader),
            Err(ContentScriptLoadingError::FileNotFound("missing.js".to_string()))
        );
    }

    #[test]
    fn test_content_script_path_cannot_escape() {
        let logger = logger();
        let ext = BrowserExtension::new(
            content_manifest(&["../secret.js"]),
            Url::parse("file:///ext/").unwrap(),
            &logger,
        );

        assert_eq!(
            ext.load_content_scripts(&FsResourceLoader),
            Err(ContentScriptLoadingError::InvalidPath("../secret.js".to_string()))
        );
    }

    #[test]
    fn test_no_content_scripts() {
        let logger = logger();
        let ext = BrowserExtension::new(
            ExtensionManifest::new(3, "A", "1"),
            Url::parse("file:///tmp/").unwrap(),
            &logger,
        );
        assert!(ext.load_content_scripts(&FsResourceLoader).unwrap().is_empty());
        assert!(ext.load_background_script(&FsResourceLoader).unwrap().is_none());
    }

    #[test]
    fn test_background_service_worker() {
        let logger = logger();
        let manifest = ExtensionManifest::new(3, "A", "1").with_background(BackgroundDescriptor {
            service_worker: Some("background.js".to_string()),
            ..Default::default()
        });
        let ext = BrowserExtension::new(manifest, Url::parse("file:///ext/").unwrap(), &logger);
        let loader = MemoryResourceLoader::new().with_file("background.js", "self.ready = true;");

        let resource = ext.load_background_script(&loader).unwrap().unwrap();
        assert!(resource.is_service_worker);
        assert_eq!(resource.js_content, "self.ready = true;");
        assert_eq!(resource.config.service_worker.as_deref(), Some("background.js"));
    }

    #[test]
    fn test_background_legacy_scripts_are_concatenated() {
        let logger = logger();
        let manifest = ExtensionManifest::new(3, "A", "1").with_background(BackgroundDescriptor {
            scripts: Some(vec!["background1.js".to_string(), "background2.js".to_string()]),
            persistent: Some(false),
            ..Default::default()
        });
        let ext = BrowserExtension::new(manifest, Url::parse("file:///ext/").unwrap(), &logger);
        let loader = MemoryResourceLoader::new()
            .with_file("background1.js", "console.log('Background script 1');")
            .with_file("background2.js", "console.log('Background script 2');");

        let resource = ext.load_background_script(&loader).unwrap().unwrap();
        assert!(!resource.is_service_worker);
        assert_eq!(
            resource.js_content,
            "console.log('Background script 1');\n\nconsole.log('Background script 2');"
        );
    }

    #[test]
    fn test_background_missing_file() {
        let logger = logger();
        let manifest = ExtensionManifest::new(3, "A", "1").with_background(BackgroundDescriptor {
            service_worker: Some("missing.js".to_string()),
            ..Default::default()
        });
        let ext = BrowserExtension::new(manifest, Url::parse("file:///ext/").unwrap(), &logger);

        assert_eq!(
            ext.load_background_script(&MemoryResourceLoader::new()),
            Err(ContentScriptLoadingError::FileNotFound("missing.js".to_string()))
        );
    }

    #[test]
    fn test_url_validation() {
        let logger = logger();
        let ext = BrowserExtension::new(
            ExtensionManifest::new(3, "A", "1").with_host_permissions(&["https://*.example.com/*"]),
            Url::parse("file:///ext/").unwrap(),
            &logger,
        );

        assert!(ext.is_url_allowed("https://example.com/api/search"));
        assert!(ext.is_url_allowed("https://www.example.com/data"));
        assert!(!ext.is_url_allowed("https://evil.com/phishing"));
        assert!(!ext.is_url_allowed("not a url"));
    }
}
