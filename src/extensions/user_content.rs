// User Content Manager
//
// Tracks user scripts by identifier for a single render surface. Each script
// may target several worlds; one injectable is installed per distinct world.
// The surface can only drop all of its scripts at once, so removing one
// identifier clears the surface and re-installs everything that remains.

use super::content_script::UserScriptFactory;
use super::types::{ContentWorld, InjectableScript, InjectionTime, RenderSurface, SurfaceId};
use crate::logging::ExtensionLogger;
use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

/// A script as callers describe it, before it is split per world
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserScript {
    pub code: String,
    pub injection_time: InjectionTime,
    pub for_main_frame_only: bool,
    pub worlds: Vec<ContentWorld>,
    pub identifier: String,
}

struct Entry {
    script: UserScript,
    installed: Vec<(ContentWorld, InjectableScript)>,
}

pub struct UserContentManager {
    surface: Weak<dyn RenderSurface>,
    surface_id: SurfaceId,
    factory: Rc<dyn UserScriptFactory>,
    logger: Rc<ExtensionLogger>,
    entries: RefCell<Vec<Entry>>,
    needs_rebuild: Cell<bool>,
    atomic_depth: Cell<u32>,
}

impl UserContentManager {
    pub fn new(
        surface: &Rc<dyn RenderSurface>,
        factory: Rc<dyn UserScriptFactory>,
        logger: Rc<ExtensionLogger>,
    ) -> Self {
        Self {
            surface: Rc::downgrade(surface),
            surface_id: surface.surface_id(),
            factory,
            logger,
            entries: RefCell::new(Vec::new()),
            needs_rebuild: Cell::new(false),
            atomic_depth: Cell::new(0),
        }
    }

    pub fn surface_id(&self) -> SurfaceId {
        self.surface_id
    }

    /// The managed surface, if it still exists
    pub fn surface(&self) -> Option<Rc<dyn RenderSurface>> {
        self.surface.upgrade()
    }

    /// Add a script, or extend an existing identifier with new worlds
    pub fn add(&self, user_script: UserScript) {
        if self.surface().is_none() {
            self.logger
                .debug(format!("Surface {} is gone, not adding {}", self.surface_id, user_script.identifier));
            return;
        }

        {
            let mut entries = self.entries.borrow_mut();
            match entries
                .iter_mut()
                .find(|e| e.script.identifier == user_script.identifier)
            {
                Some(entry) => {
                    for world in user_script.worlds {
                        if !entry.script.worlds.contains(&world) {
                            entry.script.worlds.push(world);
                        }
                    }
                }
                None => entries.push(Entry {
                    script: user_script,
                    installed: Vec::new(),
                }),
            }
        }

        self.sync();
    }

    /// Remove every installation of `identifier`
    pub fn remove(&self, identifier: &str) {
        if self.surface().is_none() {
            return;
        }

        {
            let mut entries = self.entries.borrow_mut();
            let before = entries.len();
            entries.retain(|e| e.script.identifier != identifier);
            if entries.len() == before {
                return;
            }
        }

        self.logger.debug(format!("Removed user script {identifier}"));
        self.needs_rebuild.set(true);
        self.sync();
    }

    pub fn contains(&self, identifier: &str) -> bool {
        self.entries
            .borrow()
            .iter()
            .any(|e| e.script.identifier == identifier)
    }

    /// Apply all adds and removes made inside `f` to the surface in one pass
    pub fn perform_atomic_update<R>(&self, f: impl FnOnce() -> R) -> R {
        self.atomic_depth.set(self.atomic_depth.get() + 1);
        let result = f();
        self.atomic_depth.set(self.atomic_depth.get() - 1);
        self.sync();
        result
    }

    fn sync(&self) {
        if self.atomic_depth.get() > 0 {
            return;
        }
        let Some(surface) = self.surface() else {
            return;
        };

        let mut to_install = Vec::new();
        {
            let mut entries = self.entries.borrow_mut();
            if self.needs_rebuild.replace(false) {
                surface.remove_all_user_scripts();
                for entry in entries.iter() {
                    to_install.extend(entry.installed.iter().map(|(_, script)| script.clone()));
                }
            }

            for entry in entries.iter_mut() {
                let script = &entry.script;
                for world in &script.worlds {
                    if entry.installed.iter().any(|(w, _)| w == world) {
                        continue;
                    }
                    let injectable = self.factory.create_user_script(
                        &script.code,
                        script.injection_time,
                        script.for_main_frame_only,
                        world.clone(),
                    );
                    entry.installed.push((world.clone(), injectable.clone()));
                    to_install.push(injectable);
                }
            }
        }

        for script in to_install {
            surface.add_user_script(script);
        }
    }
}
