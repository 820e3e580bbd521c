// Extension System Module
//
// Handles:
// - Manifest parsing, permission grammar and validation
// - A registry of extensions loaded from disk
// - Content script compilation into isolated worlds
// - The chrome.runtime bridge between page JavaScript and the host
// - Awaitable navigation and script completion
// - A QuickJS-backed render surface

// Submodules
pub mod active;
pub mod api;
pub mod bridge;
pub mod content_script;
pub mod continuation;
pub mod extension;
pub mod manifest;
pub mod match_pattern;
pub mod navigation;
pub mod permissions;
pub mod registry;
pub mod runtime;
pub mod types;
pub mod user_content;

// Re-exports
pub use active::{ActivationError, ActiveManager};
pub use bridge::{BridgeError, RuntimeApiBridge};
pub use content_script::{create_user_script, ContentScriptCompiler, DefaultUserScriptFactory, UserScriptFactory};
pub use continuation::{CompletionError, ContinuationAdapter, PendingCall};
pub use extension::{BrowserExtension, ContentScriptLoadingError, ExtensionId, FsResourceLoader, ResourceLoader};
pub use manifest::{ExtensionManifest, ManifestError, ValidationError};
pub use navigation::NavigationHandler;
pub use permissions::{KnownPermission, Permission};
pub use registry::{ExtensionRegistry, RegistryChange, RegistryError};
pub use runtime::QuickJsSurface;
pub use types::{ContentWorld, InjectableScript, InjectionTime, RenderSurface};
pub use user_content::{UserContentManager, UserScript};
