// Active Extension Manager
//
// Owns the set of activated extensions and the surfaces they are injected
// into. Each active extension gets its own isolated world holding its
// `chrome.runtime` bridge and its compiled content scripts.

use super::bridge::RuntimeApiBridge;
use super::content_script::{ContentScriptCompiler, UserScriptFactory};
use super::extension::{BrowserExtension, ContentScriptLoadingError, ExtensionId, ResourceLoader};
use super::types::{ContentWorld, InjectableScript, RenderSurface, SurfaceId};
use super::user_content::{UserContentManager, UserScript};
use crate::logging::ExtensionLogger;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;
use std::time::Instant;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ActivationError {
    #[error("extension {0} is already active")]
    AlreadyActive(ExtensionId),
    #[error("extension {0} is not active")]
    NotActive(ExtensionId),
    #[error(transparent)]
    ContentScripts(#[from] ContentScriptLoadingError),
}

/// Runtime state of one activated extension
pub struct ActiveExtension {
    extension: Rc<BrowserExtension>,
    world: ContentWorld,
    bridge: RuntimeApiBridge,
    content_scripts: Vec<InjectableScript>,
    activated_at: Instant,
}

impl ActiveExtension {
    pub fn extension(&self) -> &Rc<BrowserExtension> {
        &self.extension
    }

    pub fn world(&self) -> &ContentWorld {
        &self.world
    }

    pub fn activated_at(&self) -> Instant {
        self.activated_at
    }

    fn content_script_identifier(&self, index: usize) -> String {
        format!("content-script:{}:{index}", self.extension.id())
    }

    fn install(&self, manager: &UserContentManager) {
        // A refused world is logged by the bridge; content scripts still go in
        let _ = self.bridge.inject_runtime_apis(manager);
        for (index, script) in self.content_scripts.iter().enumerate() {
            manager.add(UserScript {
                code: script.source.clone(),
                injection_time: script.injection_time,
                for_main_frame_only: script.for_main_frame_only,
                worlds: vec![script.world.clone()],
                identifier: self.content_script_identifier(index),
            });
        }
    }

    fn uninstall(&self, manager: &UserContentManager) {
        self.bridge.tear_down(manager);
        for index in 0..self.content_scripts.len() {
            manager.remove(&self.content_script_identifier(index));
        }
    }
}

pub struct ActiveManager {
    compiler: ContentScriptCompiler,
    factory: Rc<dyn UserScriptFactory>,
    logger: Rc<ExtensionLogger>,
    active: RefCell<BTreeMap<ExtensionId, ActiveExtension>>,
    surfaces: RefCell<BTreeMap<SurfaceId, UserContentManager>>,
}

impl ActiveManager {
    pub fn new(
        factory: Rc<dyn UserScriptFactory>,
        loader: Rc<dyn ResourceLoader>,
        logger: Rc<ExtensionLogger>,
    ) -> Self {
        Self {
            compiler: ContentScriptCompiler::new(factory.clone(), loader, logger.clone()),
            factory,
            logger,
            active: RefCell::new(BTreeMap::new()),
            surfaces: RefCell::new(BTreeMap::new()),
        }
    }

    /// Compile the extension's content scripts and inject it into every
    /// registered surface
    pub fn activate(&self, extension: Rc<BrowserExtension>) -> Result<ExtensionId, ActivationError> {
        let id = extension.id();
        self.logger.in_context(&format!("Activate extension {id}"), || {
            if self.is_active(id) {
                return Err(ActivationError::AlreadyActive(id));
            }

            let content_scripts = self.compiler.compile(&extension)?;
            let world = ContentWorld::for_extension(&id);
            let bridge = RuntimeApiBridge::new(&extension, self.logger.clone()).with_world(world.clone());
            let active = ActiveExtension {
                extension,
                world,
                bridge,
                content_scripts,
                activated_at: Instant::now(),
            };

            self.prune_closed_surfaces();
            for manager in self.surfaces.borrow().values() {
                manager.perform_atomic_update(|| active.install(manager));
            }
            self.active.borrow_mut().insert(id, active);
            self.logger.info(format!("Activated extension {id}"));
            Ok(id)
        })
    }

    /// Remove the extension's scripts and handlers from every surface
    pub fn deactivate(&self, id: ExtensionId) -> Result<(), ActivationError> {
        let Some(active) = self.active.borrow_mut().remove(&id) else {
            return Err(ActivationError::NotActive(id));
        };

        for manager in self.surfaces.borrow().values() {
            manager.perform_atomic_update(|| active.uninstall(manager));
        }
        self.logger.info(format!("Deactivated extension {id}"));
        Ok(())
    }

    pub fn deactivate_all(&self) {
        let ids: Vec<ExtensionId> = self.active.borrow().keys().copied().collect();
        for id in ids {
            let _ = self.deactivate(id);
        }
    }

    pub fn is_active(&self, id: ExtensionId) -> bool {
        self.active.borrow().contains_key(&id)
    }

    pub fn active_extension(&self, id: ExtensionId) -> Option<Rc<BrowserExtension>> {
        self.active.borrow().get(&id).map(|a| a.extension.clone())
    }

    pub fn active_ids(&self) -> Vec<ExtensionId> {
        self.active.borrow().keys().copied().collect()
    }

    /// World an active extension's scripts run in
    pub fn world_for(&self, id: ExtensionId) -> Option<ContentWorld> {
        self.active.borrow().get(&id).map(|a| a.world.clone())
    }

    /// Start injecting active extensions into `surface`. Registering the same
    /// surface twice is a no-op.
    pub fn register_surface(&self, surface: &Rc<dyn RenderSurface>) {
        let surface_id = surface.surface_id();
        self.prune_closed_surfaces();
        if self.surfaces.borrow().contains_key(&surface_id) {
            return;
        }

        let manager = UserContentManager::new(surface, self.factory.clone(), self.logger.clone());
        let active = self.active.borrow();
        manager.perform_atomic_update(|| {
            for extension in active.values() {
                extension.install(&manager);
            }
        });
        self.logger.debug(format!(
            "Registered {surface_id} with {} active extension(s)",
            active.len()
        ));
        self.surfaces.borrow_mut().insert(surface_id, manager);
    }

    /// Stop tracking a surface. Scripts already installed stay where they are.
    pub fn unregister_surface(&self, surface_id: SurfaceId) -> bool {
        self.surfaces.borrow_mut().remove(&surface_id).is_some()
    }

    pub fn surface_count(&self) -> usize {
        self.surfaces.borrow().len()
    }

    fn prune_closed_surfaces(&self) {
        let mut surfaces = self.surfaces.borrow_mut();
        let before = surfaces.len();
        surfaces.retain(|_, manager| manager.surface().is_some());
        for active in self.active.borrow().values() {
            active.bridge.prune_dropped_surfaces();
        }
        if surfaces.len() != before {
            self.logger
                .debug(format!("Cleaned up {} dropped surface(s)", before - surfaces.len()));
        }
    }
}
