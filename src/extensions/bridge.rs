// Runtime API Bridge
//
// Host half of `chrome.runtime`. The bridge installs the generated API script
// as a document-start user script and registers the `requestBrowserExtension`
// handler in its world. Requests are dispatched synchronously and answered by
// running `__EXT_invokeCallback__` in the world the request came from.

use super::api::{generate_api_javascript, invoke_callback_script, runtime_namespace, REQUEST_HANDLER_NAME};
use super::extension::{BrowserExtension, ExtensionId};
use super::types::{ContentWorld, InjectionTime, MessageHandler, RenderSurface, ScriptMessage, SurfaceId};
use super::user_content::{UserContentManager, UserScript};
use crate::logging::ExtensionLogger;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::{Rc, Weak};
use thiserror::Error;

/// Result of `chrome.runtime.getPlatformInfo`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformInfo {
    pub os: String,
    pub arch: String,
    pub nacl_arch: String,
}

impl PlatformInfo {
    /// Describe the host in Chrome's vocabulary
    pub fn current() -> Self {
        Self::from_rust_consts(std::env::consts::OS, std::env::consts::ARCH)
    }

    pub fn from_rust_consts(os: &str, arch: &str) -> Self {
        let os = match os {
            "macos" => "mac",
            "windows" => "win",
            other => other,
        };
        let (arch, nacl_arch) = match arch {
            "x86_64" => ("x86-64", "x86-64"),
            "x86" => ("x86-32", "x86-32"),
            "aarch64" => ("arm64", "arm"),
            "arm" => ("arm", "arm"),
            other => (other, other),
        };
        Self {
            os: os.to_string(),
            arch: arch.to_string(),
            nacl_arch: nacl_arch.to_string(),
        }
    }
}

/// Body of a `requestBrowserExtension` message
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiRequest {
    pub request_id: String,
    pub api: String,
    #[serde(default)]
    pub args: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("Unknown API: {0}")]
    UnknownApi(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BridgeError {
    /// Another bridge already answers `chrome.runtime` requests in this world
    #[error("{world} on {surface} already has a runtime API bridge")]
    WorldInUse { surface: SurfaceId, world: ContentWorld },
}

/// Maps API names to host behaviour for one extension
#[derive(Debug, Clone)]
pub struct ApiDispatcher {
    extension_id: ExtensionId,
    platform: PlatformInfo,
    known: Vec<&'static str>,
}

impl ApiDispatcher {
    pub fn new(extension_id: ExtensionId) -> Self {
        Self::with_platform(extension_id, PlatformInfo::current())
    }

    pub fn with_platform(extension_id: ExtensionId, platform: PlatformInfo) -> Self {
        let known = runtime_namespace(&extension_id.to_string()).function_names();
        Self {
            extension_id,
            platform,
            known,
        }
    }

    pub fn dispatch(&self, api: &str, _args: &Value) -> Result<Value, DispatchError> {
        if !self.known.contains(&api) {
            return Err(DispatchError::UnknownApi(api.to_string()));
        }
        match api {
            "getId" => Ok(Value::String(self.extension_id.to_string())),
            "getPlatformInfo" => Ok(serde_json::json!({
                "os": self.platform.os,
                "arch": self.platform.arch,
                "nacl_arch": self.platform.nacl_arch,
            })),
            other => Err(DispatchError::UnknownApi(other.to_string())),
        }
    }
}

/// Receives API requests posted from one world of one surface
pub struct ApiRequestHandler {
    dispatcher: ApiDispatcher,
    surface: Weak<dyn RenderSurface>,
    logger: Rc<ExtensionLogger>,
}

impl ApiRequestHandler {
    pub fn new(dispatcher: ApiDispatcher, surface: Weak<dyn RenderSurface>, logger: Rc<ExtensionLogger>) -> Self {
        Self {
            dispatcher,
            surface,
            logger,
        }
    }
}

impl MessageHandler for ApiRequestHandler {
    fn did_receive(&self, message: ScriptMessage) {
        let request: ApiRequest = match serde_json::from_value(message.body) {
            Ok(request) => request,
            Err(e) => {
                self.logger.warn(format!("Malformed API request in {}: {e}", message.world));
                return;
            }
        };

        let Some(surface) = self.surface.upgrade() else {
            self.logger
                .debug(format!("Surface closed before {} could be answered", request.request_id));
            return;
        };

        self.logger.debug(format!("{} requested {}", message.world, request.api));
        let script = match self.dispatcher.dispatch(&request.api, &request.args) {
            Ok(result) => invoke_callback_script(&request.request_id, &result, None),
            Err(e) => {
                self.logger.warn(format!("API request failed: {e}"));
                invoke_callback_script(&request.request_id, &Value::Null, Some(&e.to_string()))
            }
        };

        if let Err(e) = surface.run_script(&script, &message.world) {
            self.logger
                .error(format!("Failed to deliver reply for {}: {e}", request.request_id));
        }
    }
}

/// Installs `chrome.runtime` for one extension into surfaces
pub struct RuntimeApiBridge {
    extension_id: ExtensionId,
    world: ContentWorld,
    logger: Rc<ExtensionLogger>,
    injected: RefCell<HashMap<SurfaceId, Weak<dyn RenderSurface>>>,
}

impl RuntimeApiBridge {
    /// A bridge targeting the page world
    pub fn new(extension: &BrowserExtension, logger: Rc<ExtensionLogger>) -> Self {
        Self {
            extension_id: extension.id(),
            world: ContentWorld::Page,
            logger,
            injected: RefCell::new(HashMap::new()),
        }
    }

    pub fn with_world(mut self, world: ContentWorld) -> Self {
        self.world = world;
        self
    }

    pub fn world(&self) -> &ContentWorld {
        &self.world
    }

    pub fn extension_id(&self) -> ExtensionId {
        self.extension_id
    }

    pub fn script_identifier(&self) -> String {
        format!("runtime-api:{}:{}", self.extension_id, self.world)
    }

    pub fn is_injected(&self, surface_id: SurfaceId) -> bool {
        self.injected
            .borrow()
            .get(&surface_id)
            .is_some_and(|surface| surface.strong_count() > 0)
    }

    /// Forget surfaces that have been dropped. Returns how many were removed.
    pub fn prune_dropped_surfaces(&self) -> usize {
        let mut injected = self.injected.borrow_mut();
        let before = injected.len();
        injected.retain(|_, surface| surface.strong_count() > 0);
        before - injected.len()
    }

    /// Install the API script and request handler. Returns false when the
    /// surface already has them or no longer exists.
    ///
    /// A world answers requests for exactly one extension, so a world whose
    /// request handler belongs to another bridge is refused.
    pub fn inject_runtime_apis(&self, into: &UserContentManager) -> Result<bool, BridgeError> {
        self.prune_dropped_surfaces();
        let surface_id = into.surface_id();
        if self.is_injected(surface_id) {
            self.logger.debug(format!("Runtime APIs already injected into {surface_id}"));
            return Ok(false);
        }
        let Some(surface) = into.surface() else {
            return Ok(false);
        };
        if surface.has_message_handler(REQUEST_HANDLER_NAME, &self.world) {
            let error = BridgeError::WorldInUse {
                surface: surface_id,
                world: self.world.clone(),
            };
            self.logger
                .warn(format!("Not installing runtime APIs for {}: {error}", self.extension_id));
            return Err(error);
        }

        self.logger.in_context(&format!("Inject runtime APIs into {surface_id}"), || {
            let handler = ApiRequestHandler::new(
                ApiDispatcher::new(self.extension_id),
                Rc::downgrade(&surface),
                self.logger.clone(),
            );
            surface.register_message_handler(REQUEST_HANDLER_NAME, &self.world, Rc::new(handler));

            into.add(UserScript {
                code: generate_api_javascript(&self.extension_id.to_string()),
                injection_time: InjectionTime::AtDocumentStart,
                for_main_frame_only: false,
                worlds: vec![self.world.clone()],
                identifier: self.script_identifier(),
            });
            self.logger.debug(format!("Installed chrome.runtime in {}", self.world));
        });

        self.injected
            .borrow_mut()
            .insert(surface_id, Rc::downgrade(&surface));
        Ok(true)
    }

    /// Remove the API script and request handler from the surface
    pub fn tear_down(&self, from: &UserContentManager) {
        if self.injected.borrow_mut().remove(&from.surface_id()).is_none() {
            return;
        }
        from.remove(&self.script_identifier());
        if let Some(surface) = from.surface() {
            surface.remove_message_handler(REQUEST_HANDLER_NAME, &self.world);
        }
        self.logger
            .debug(format!("Removed runtime APIs from {}", from.surface_id()));
    }
}
