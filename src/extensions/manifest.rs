// Manifest Model & Validator
//
// Typed view of an extension's manifest.json. Decoding only checks JSON
// shape; `validate` decides whether the extension is loadable. The required
// fields are optional in the model so that a missing one surfaces as a
// `ValidationError` rather than a decode error.

use super::match_pattern::MatchPattern;
use super::permissions::{KnownPermission, Permission};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// The only manifest version this shim loads
pub const SUPPORTED_MANIFEST_VERSION: i64 = 3;

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("failed to decode manifest: {0}")]
    Parse(#[from] serde_json::Error),
    #[error(transparent)]
    Invalid(#[from] ValidationError),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("manifest_version is missing")]
    MissingManifestVersion,
    #[error("manifest_version {0} is not supported (expected 3)")]
    UnsupportedManifestVersion(i64),
    #[error("name is missing")]
    MissingName,
    #[error("version is missing")]
    MissingVersion,
    #[error("content_scripts[{index}] has no matches")]
    EmptyMatches { index: usize },
    #[error("content_scripts[{index}] has no js files")]
    EmptyJs { index: usize },
    #[error("content_scripts[{index}] has unrecognized run_at '{token}'")]
    UnrecognizedRunAt { index: usize, token: String },
    #[error("content_scripts[{index}] has invalid match pattern '{pattern}'")]
    InvalidMatchPattern { index: usize, pattern: String },
    #[error("host permission '{0}' is not a valid match pattern")]
    InvalidHostPermission(String),
}

/// When a content script runs, as declared in the manifest
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum RunAt {
    DocumentStart,
    DocumentEnd,
    #[default]
    DocumentIdle,
    /// Kept so validation can report the offending token
    Unrecognized(String),
}

impl RunAt {
    pub fn parse(token: &str) -> Self {
        match token {
            "document_start" => RunAt::DocumentStart,
            "document_end" => RunAt::DocumentEnd,
            "document_idle" => RunAt::DocumentIdle,
            other => RunAt::Unrecognized(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            RunAt::DocumentStart => "document_start",
            RunAt::DocumentEnd => "document_end",
            RunAt::DocumentIdle => "document_idle",
            RunAt::Unrecognized(token) => token,
        }
    }
}

impl From<String> for RunAt {
    fn from(token: String) -> Self {
        RunAt::parse(&token)
    }
}

impl From<RunAt> for String {
    fn from(run_at: RunAt) -> Self {
        run_at.as_str().to_string()
    }
}

impl fmt::Display for RunAt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// JavaScript world a content script asks for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ScriptWorld {
    #[default]
    Isolated,
    /// The page's own world
    Main,
}

/// One entry of `content_scripts`
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ContentScriptDeclaration {
    #[serde(default)]
    pub matches: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exclude_matches: Vec<String>,
    #[serde(default)]
    pub js: Vec<String>,
    /// Parsed for completeness; stylesheets are not injected
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub css: Vec<String>,
    #[serde(default)]
    pub run_at: RunAt,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub all_frames: Option<bool>,
    #[serde(default)]
    pub world: ScriptWorld,
}

impl ContentScriptDeclaration {
    pub fn new(matches: Vec<String>, js: Vec<String>, run_at: RunAt) -> Self {
        Self {
            matches,
            js,
            run_at,
            ..Default::default()
        }
    }

    pub fn for_main_frame_only(&self) -> bool {
        !self.all_frames.unwrap_or(false)
    }
}

/// The `background` key
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct BackgroundDescriptor {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_worker: Option<String>,
    /// Legacy multi-file form
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scripts: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub persistent: Option<bool>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub script_type: Option<String>,
}

/// Decoded manifest.json. Read-only once built.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ExtensionManifest {
    manifest_version: Option<i64>,
    name: Option<String>,
    version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    content_scripts: Option<Vec<ContentScriptDeclaration>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    background: Option<BackgroundDescriptor>,
    #[serde(skip_serializing_if = "Option::is_none")]
    permissions: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    host_permissions: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    optional_permissions: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    optional_host_permissions: Option<Vec<String>>,
}

impl ExtensionManifest {
    pub fn new(manifest_version: i64, name: &str, version: &str) -> Self {
        Self {
            manifest_version: Some(manifest_version),
            name: Some(name.to_string()),
            version: Some(version.to_string()),
            ..Default::default()
        }
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = Some(description.to_string());
        self
    }

    pub fn with_content_scripts(mut self, content_scripts: Vec<ContentScriptDeclaration>) -> Self {
        self.content_scripts = Some(content_scripts);
        self
    }

    pub fn with_background(mut self, background: BackgroundDescriptor) -> Self {
        self.background = Some(background);
        self
    }

    pub fn with_permissions(mut self, permissions: &[&str]) -> Self {
        self.permissions = Some(permissions.iter().map(|p| p.to_string()).collect());
        self
    }

    pub fn with_host_permissions(mut self, host_permissions: &[&str]) -> Self {
        self.host_permissions = Some(host_permissions.iter().map(|p| p.to_string()).collect());
        self
    }

    /// Decode manifest JSON. Does not validate.
    pub fn from_json(json: &str) -> Result<Self, ManifestError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Decode and validate in one step
    pub fn load(json: &str) -> Result<Self, ManifestError> {
        let manifest = Self::from_json(json)?;
        manifest.validate()?;
        Ok(manifest)
    }

    pub fn manifest_version(&self) -> Option<i64> {
        self.manifest_version
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn content_scripts(&self) -> &[ContentScriptDeclaration] {
        self.content_scripts.as_deref().unwrap_or_default()
    }

    pub fn background(&self) -> Option<&BackgroundDescriptor> {
        self.background.as_ref()
    }

    pub fn permissions(&self) -> Option<&[String]> {
        self.permissions.as_deref()
    }

    pub fn host_permissions(&self) -> Option<&[String]> {
        self.host_permissions.as_deref()
    }

    pub fn optional_permissions(&self) -> Option<&[String]> {
        self.optional_permissions.as_deref()
    }

    pub fn optional_host_permissions(&self) -> Option<&[String]> {
        self.optional_host_permissions.as_deref()
    }

    /// Check the manifest is loadable. Reports the first problem found.
    pub fn validate(&self) -> Result<(), ValidationError> {
        match self.manifest_version {
            None => return Err(ValidationError::MissingManifestVersion),
            Some(SUPPORTED_MANIFEST_VERSION) => {}
            Some(other) => return Err(ValidationError::UnsupportedManifestVersion(other)),
        }

        if self.name.as_deref().map_or(true, str::is_empty) {
            return Err(ValidationError::MissingName);
        }
        if self.version.as_deref().map_or(true, str::is_empty) {
            return Err(ValidationError::MissingVersion);
        }

        for (index, script) in self.content_scripts().iter().enumerate() {
            Self::validate_content_script(index, script)?;
        }

        let host_permissions = self
            .host_permissions()
            .unwrap_or_default()
            .iter()
            .chain(self.optional_host_permissions().unwrap_or_default());
        for raw in host_permissions {
            if MatchPattern::parse(raw).is_err() {
                return Err(ValidationError::InvalidHostPermission(raw.clone()));
            }
        }

        if let Some(unknown) = self.unknown_permissions() {
            if !unknown.is_empty() {
                log::warn!(
                    "Extension {:?} declares unrecognized permissions: {:?}",
                    self.name(),
                    unknown
                );
            }
        }

        log::debug!("Manifest for {:?} validated", self.name());
        Ok(())
    }

    fn validate_content_script(
        index: usize,
        script: &ContentScriptDeclaration,
    ) -> Result<(), ValidationError> {
        if script.matches.is_empty() {
            return Err(ValidationError::EmptyMatches { index });
        }
        if script.js.is_empty() {
            return Err(ValidationError::EmptyJs { index });
        }
        if let RunAt::Unrecognized(token) = &script.run_at {
            return Err(ValidationError::UnrecognizedRunAt {
                index,
                token: token.clone(),
            });
        }
        for pattern in script.matches.iter().chain(&script.exclude_matches) {
            if MatchPattern::parse(pattern).is_err() {
                return Err(ValidationError::InvalidMatchPattern {
                    index,
                    pattern: pattern.clone(),
                });
            }
        }
        Ok(())
    }

    /// `None` when the manifest has no `permissions` key at all
    pub fn parsed_permissions(&self) -> Option<Vec<Permission>> {
        self.permissions.as_deref().map(Permission::parse_all)
    }

    pub fn has_permission(&self, permission: KnownPermission) -> bool {
        self.parsed_permissions()
            .map_or(false, |parsed| parsed.contains(&Permission::Api(permission)))
    }

    /// Raw strings of every permission the table did not recognize
    pub fn unknown_permissions(&self) -> Option<Vec<String>> {
        self.parsed_permissions().map(|parsed| {
            parsed
                .into_iter()
                .filter_map(|permission| match permission {
                    Permission::Unknown(raw) => Some(raw),
                    Permission::Api(_) => None,
                })
                .collect()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RED_BOX: &str = r#"{"manifest_version":3,"name":"Red Box","version":"1.0","description":"Adds a red box to the top of every page","content_scripts":[{"matches":["<all_urls>"],"js":["content.js"],"run_at":"document_end"}]}"#;

    #[test]
    fn test_red_box_manifest_decodes_and_validates() {
        let manifest = ExtensionManifest::from_json(RED_BOX).unwrap();

        assert_eq!(manifest.manifest_version(), Some(3));
        assert_eq!(manifest.name(), Some("Red Box"));
        assert_eq!(manifest.version(), Some("1.0"));
        assert_eq!(manifest.description(), Some("Adds a red box to the top of every page"));
        assert_eq!(manifest.content_scripts().len(), 1);

        let script = &manifest.content_scripts()[0];
        assert_eq!(script.matches, vec!["<all_urls>".to_string()]);
        assert_eq!(script.js, vec!["content.js".to_string()]);
        assert_eq!(script.run_at, RunAt::DocumentEnd);
        assert!(script.for_main_frame_only());

        assert!(manifest.validate().is_ok());
        assert!(manifest.background().is_none());
        assert!(manifest.parsed_permissions().is_none());
    }

    #[test]
    fn test_run_at_defaults_to_idle() {
        let manifest = ExtensionManifest::from_json(
            r#"{"manifest_version":3,"name":"A","version":"1","content_scripts":[{"matches":["<all_urls>"],"js":["a.js"]}]}"#,
        )
        .unwrap();
        assert_eq!(manifest.content_scripts()[0].run_at, RunAt::DocumentIdle);
    }

    #[test]
    fn test_wrong_version_rejected() {
        for version in [2, 4, 0, -3] {
            let manifest = ExtensionManifest::new(version, "Old", "1.0");
            assert_eq!(
                manifest.validate(),
                Err(ValidationError::UnsupportedManifestVersion(version))
            );
        }
    }

    #[test]
    fn test_missing_required_fields() {
        let manifest = ExtensionManifest::from_json(r#"{"name":"A","version":"1"}"#).unwrap();
        assert_eq!(manifest.validate(), Err(ValidationError::MissingManifestVersion));

        let manifest = ExtensionManifest::from_json(r#"{"manifest_version":3,"version":"1"}"#).unwrap();
        assert_eq!(manifest.validate(), Err(ValidationError::MissingName));

        let manifest = ExtensionManifest::from_json(r#"{"manifest_version":3,"name":"A"}"#).unwrap();
        assert_eq!(manifest.validate(), Err(ValidationError::MissingVersion));

        let manifest = ExtensionManifest::new(3, "", "1.0");
        assert_eq!(manifest.validate(), Err(ValidationError::MissingName));
    }

    #[test]
    fn test_malformed_json_is_a_parse_failure() {
        assert!(matches!(
            ExtensionManifest::from_json("{not json"),
            Err(ManifestError::Parse(_))
        ));
        assert!(matches!(
            ExtensionManifest::from_json(r#"{"manifest_version":"3","name":"A","version":"1"}"#),
            Err(ManifestError::Parse(_))
        ));
        assert!(matches!(
            ExtensionManifest::load(r#"{"manifest_version":2,"name":"A","version":"1"}"#),
            Err(ManifestError::Invalid(ValidationError::UnsupportedManifestVersion(2)))
        ));
    }

    #[test]
    fn test_malformed_content_scripts() {
        let empty_matches = ExtensionManifest::new(3, "A", "1").with_content_scripts(vec![
            ContentScriptDeclaration::new(vec![], vec!["a.js".into()], RunAt::DocumentEnd),
        ]);
        assert_eq!(
            empty_matches.validate(),
            Err(ValidationError::EmptyMatches { index: 0 })
        );

        let empty_js = ExtensionManifest::new(3, "A", "1").with_content_scripts(vec![
            ContentScriptDeclaration::new(vec!["<all_urls>".into()], vec!["a.js".into()], RunAt::DocumentEnd),
            ContentScriptDeclaration::new(vec!["<all_urls>".into()], vec![], RunAt::DocumentEnd),
        ]);
        assert_eq!(empty_js.validate(), Err(ValidationError::EmptyJs { index: 1 }));

        let bad_run_at = ExtensionManifest::from_json(
            r#"{"manifest_version":3,"name":"A","version":"1","content_scripts":[{"matches":["<all_urls>"],"js":["a.js"],"run_at":"document_whenever"}]}"#,
        )
        .unwrap();
        assert_eq!(
            bad_run_at.validate(),
            Err(ValidationError::UnrecognizedRunAt {
                index: 0,
                token: "document_whenever".to_string()
            })
        );

        let bad_pattern = ExtensionManifest::new(3, "A", "1").with_content_scripts(vec![
            ContentScriptDeclaration::new(vec!["example.com".into()], vec!["a.js".into()], RunAt::DocumentEnd),
        ]);
        assert_eq!(
            bad_pattern.validate(),
            Err(ValidationError::InvalidMatchPattern {
                index: 0,
                pattern: "example.com".to_string()
            })
        );
    }

    #[test]
    fn test_invalid_host_permission() {
        let manifest = ExtensionManifest::new(3, "A", "1")
            .with_host_permissions(&["https://*.example.com/*", "not a pattern"]);
        assert_eq!(
            manifest.validate(),
            Err(ValidationError::InvalidHostPermission("not a pattern".to_string()))
        );
    }

    #[test]
    fn test_absent_permissions() {
        let manifest = ExtensionManifest::new(3, "A", "1");
        assert_eq!(manifest.parsed_permissions(), None);
        assert_eq!(manifest.unknown_permissions(), None);
        for permission in KnownPermission::ALL {
            assert!(!manifest.has_permission(*permission));
        }
    }

    #[test]
    fn test_empty_permissions_differ_from_absent() {
        let manifest = ExtensionManifest::from_json(
            r#"{"manifest_version":3,"name":"A","version":"1","permissions":[]}"#,
        )
        .unwrap();
        assert_eq!(manifest.parsed_permissions(), Some(vec![]));
        assert_eq!(manifest.unknown_permissions(), Some(vec![]));
        assert!(!manifest.has_permission(KnownPermission::Storage));
    }

    #[test]
    fn test_unknown_permissions_in_order() {
        let manifest = ExtensionManifest::new(3, "A", "1")
            .with_permissions(&["storage", "futureApi1", "tabs", "futureApi2"]);

        assert_eq!(
            manifest.unknown_permissions(),
            Some(vec!["futureApi1".to_string(), "futureApi2".to_string()])
        );
        assert!(manifest.has_permission(KnownPermission::Storage));
        assert!(manifest.has_permission(KnownPermission::Tabs));
        assert!(!manifest.has_permission(KnownPermission::Cookies));
        assert!(manifest.validate().is_ok());
    }

    #[test]
    fn test_accessors_agree_with_parser() {
        let raw = ["system.cpu", "windows", "Storage", "identity.email"];
        let manifest = ExtensionManifest::new(3, "A", "1").with_permissions(&raw);

        assert_eq!(manifest.parsed_permissions(), Some(Permission::parse_all(&raw)));
        assert!(manifest.has_permission(KnownPermission::SystemCpu));
        assert!(manifest.has_permission(KnownPermission::Tabs));
        assert!(!manifest.has_permission(KnownPermission::Storage));
        assert_eq!(manifest.unknown_permissions(), Some(vec!["Storage".to_string()]));
    }

    #[test]
    fn test_background_and_optional_fields() {
        let manifest = ExtensionManifest::from_json(
            r#"{
                "manifest_version": 3,
                "name": "Bg",
                "version": "2.0",
                "background": {"service_worker": "bg.js", "type": "module"},
                "optional_permissions": ["downloads.beta"],
                "optional_host_permissions": ["https://example.com/*"],
                "content_scripts": [{"matches": ["<all_urls>"], "js": ["a.js"], "all_frames": true, "world": "MAIN"}]
            }"#,
        )
        .unwrap();

        let background = manifest.background().unwrap();
        assert_eq!(background.service_worker.as_deref(), Some("bg.js"));
        assert_eq!(background.script_type.as_deref(), Some("module"));
        assert_eq!(manifest.optional_permissions(), Some(&["downloads.beta".to_string()][..]));

        let script = &manifest.content_scripts()[0];
        assert!(!script.for_main_frame_only());
        assert_eq!(script.world, ScriptWorld::Main);
        assert!(manifest.validate().is_ok());
    }
}
