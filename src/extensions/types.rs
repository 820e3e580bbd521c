// Render Surface Types
//
// The capability interface this shim consumes from a web-rendering engine,
// plus the small value types that cross it. An engine integration implements
// `RenderSurface`; `runtime::QuickJsSurface` is the in-crate implementation.

use super::extension::ExtensionId;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::rc::{Rc, Weak};
use thiserror::Error;

/// Identifies one render surface for the lifetime of the process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SurfaceId(pub u64);

/// Opaque identity of one navigation, handed out by `render_html`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NavigationToken(pub u64);

/// Opaque identity of one awaited script call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallToken(pub u64);

impl fmt::Display for SurfaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "surface-{}", self.0)
    }
}

impl fmt::Display for NavigationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "navigation-{}", self.0)
    }
}

impl fmt::Display for CallToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "call-{}", self.0)
    }
}

/// A JavaScript execution context within a surface
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ContentWorld {
    /// The page's own global scope
    Page,
    /// An isolated world, separate globals per name
    Named(String),
}

impl ContentWorld {
    /// The dedicated isolated world for an extension's scripts
    pub fn for_extension(id: &ExtensionId) -> Self {
        ContentWorld::Named(format!("Extension-{id}"))
    }

    pub fn name(&self) -> &str {
        match self {
            ContentWorld::Page => "page",
            ContentWorld::Named(name) => name,
        }
    }

    pub fn is_page(&self) -> bool {
        matches!(self, ContentWorld::Page)
    }
}

impl fmt::Display for ContentWorld {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Engine hook a user script is attached to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InjectionTime {
    AtDocumentStart,
    AtDocumentEnd,
}

/// A script ready to hand to a surface
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InjectableScript {
    pub source: String,
    pub injection_time: InjectionTime,
    pub for_main_frame_only: bool,
    pub world: ContentWorld,
}

/// A message posted from page JavaScript via `__ext_post(name, json)`
#[derive(Debug, Clone, PartialEq)]
pub struct ScriptMessage {
    pub name: String,
    pub world: ContentWorld,
    pub body: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NavigationError {
    #[error("navigation cancelled")]
    Cancelled,
    #[error("load failed: {0}")]
    LoadFailed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScriptError {
    #[error("JavaScript exception: {0}")]
    Exception(String),
    #[error("script result is not serializable: {0}")]
    Serialization(String),
    #[error("render surface is closed")]
    SurfaceClosed,
}

/// Receives messages posted by page JavaScript
pub trait MessageHandler {
    fn did_receive(&self, message: ScriptMessage);
}

/// Engine navigation callbacks. An engine fires at most one per token.
pub trait NavigationDelegate {
    fn did_finish(&self, token: NavigationToken);
    fn did_fail(&self, token: NavigationToken, error: NavigationError);
}

/// What the shim needs from a web-rendering engine.
///
/// All methods are called on the thread that owns the surface. Engine
/// callbacks (navigation events, posted messages) are delivered from
/// `run_until_idle`, never from inside another surface call, and the surface
/// holds no internal borrows while a callback runs.
///
/// In every world the surface exposes `__ext_post(handlerName, jsonString)`
/// to page JavaScript; posted messages go to the handler registered under
/// that name for that world.
pub trait RenderSurface {
    fn surface_id(&self) -> SurfaceId;

    /// Start loading `html`. Completion is reported to the navigation delegate.
    fn render_html(&self, html: &str, base_url: Option<&url::Url>) -> NavigationToken;

    /// Evaluate `source` in `world` and return its JSON-converted result
    fn run_script(&self, source: &str, world: &ContentWorld) -> Result<serde_json::Value, ScriptError>;

    fn set_navigation_delegate(&self, delegate: Weak<dyn NavigationDelegate>);

    /// Install a script for every subsequent navigation
    fn add_user_script(&self, script: InjectableScript);

    fn remove_all_user_scripts(&self);

    fn register_message_handler(&self, name: &str, world: &ContentWorld, handler: Rc<dyn MessageHandler>);

    fn remove_message_handler(&self, name: &str, world: &ContentWorld);

    fn has_message_handler(&self, name: &str, world: &ContentWorld) -> bool;

    /// Give the engine control until it has no queued work left
    fn run_until_idle(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extension_world_is_named_after_id() {
        let id = ExtensionId::new();
        let world = ContentWorld::for_extension(&id);

        assert_eq!(world.name(), format!("Extension-{id}"));
        assert!(!world.is_page());
        assert_ne!(world, ContentWorld::for_extension(&ExtensionId::new()));
        assert_eq!(ContentWorld::Page.name(), "page");
    }
}
