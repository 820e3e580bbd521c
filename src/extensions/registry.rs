// Extension Registry
//
// Tracks the extensions loaded from disk, keyed by the directory each one was
// loaded from. Observers hear about every addition and removal.

use super::extension::{BrowserExtension, ContentScriptLoadingError, ExtensionId, FsResourceLoader};
use crate::logging::ExtensionLogger;
use std::cell::RefCell;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("an extension is already loaded from {}", .0.display())]
    AlreadyExists(PathBuf),
    #[error("no extension is loaded from {}", .0.display())]
    NotFound(PathBuf),
    #[error(transparent)]
    ContentScripts(#[from] ContentScriptLoadingError),
    #[error(transparent)]
    Load(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryChange {
    Added(ExtensionId),
    Removed(ExtensionId),
}

type Observer = Rc<dyn Fn(&RegistryChange)>;

pub struct ExtensionRegistry {
    logger: Rc<ExtensionLogger>,
    entries: RefCell<Vec<(PathBuf, Rc<BrowserExtension>)>>,
    observers: RefCell<Vec<Observer>>,
}

impl ExtensionRegistry {
    pub fn new(logger: Rc<ExtensionLogger>) -> Self {
        Self {
            logger,
            entries: RefCell::new(Vec::new()),
            observers: RefCell::new(Vec::new()),
        }
    }

    /// Load the extension in `path` and start tracking it.
    ///
    /// The manifest must validate and every content script it names must be
    /// readable; otherwise nothing is added.
    pub fn add(&self, path: &Path) -> Result<Rc<BrowserExtension>, RegistryError> {
        if self.contains(path) {
            return Err(RegistryError::AlreadyExists(path.to_path_buf()));
        }

        let extension = self
            .logger
            .in_context(&format!("Load extension from {}", path.display()), || {
                let extension = BrowserExtension::load_from_directory(path, &self.logger)?;
                let scripts = extension.load_content_scripts(&FsResourceLoader)?;
                self.logger
                    .debug(format!("Loaded {} content script declaration(s)", scripts.len()));
                Ok::<_, RegistryError>(Rc::new(extension))
            })?;

        self.entries
            .borrow_mut()
            .push((path.to_path_buf(), extension.clone()));
        self.logger.info(format!(
            "Added extension {} ({}) from {}",
            extension.manifest().name().unwrap_or("unnamed"),
            extension.id(),
            path.display()
        ));
        self.notify(RegistryChange::Added(extension.id()));
        Ok(extension)
    }

    /// Stop tracking the extension loaded from `path`
    pub fn remove(&self, path: &Path) -> Result<Rc<BrowserExtension>, RegistryError> {
        let extension = {
            let mut entries = self.entries.borrow_mut();
            let index = entries
                .iter()
                .position(|(p, _)| p == path)
                .ok_or_else(|| RegistryError::NotFound(path.to_path_buf()))?;
            entries.remove(index).1
        };

        self.logger
            .info(format!("Removed extension {} from {}", extension.id(), path.display()));
        self.notify(RegistryChange::Removed(extension.id()));
        Ok(extension)
    }

    /// Loaded extensions in the order they were added
    pub fn extensions(&self) -> Vec<Rc<BrowserExtension>> {
        self.entries.borrow().iter().map(|(_, e)| e.clone()).collect()
    }

    pub fn get(&self, id: ExtensionId) -> Option<Rc<BrowserExtension>> {
        self.entries
            .borrow()
            .iter()
            .find(|(_, e)| e.id() == id)
            .map(|(_, e)| e.clone())
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.entries.borrow().iter().any(|(p, _)| p == path)
    }

    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.borrow().is_empty()
    }

    pub fn observe(&self, observer: impl Fn(&RegistryChange) + 'static) {
        self.observers.borrow_mut().push(Rc::new(observer));
    }

    fn notify(&self, change: RegistryChange) {
        let observers: Vec<Observer> = self.observers.borrow().clone();
        for observer in observers {
            observer(&change);
        }
    }
}
