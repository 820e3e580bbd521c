// Logging - named logger handed to extension components
//
// A thin layer over the `log` facade. Components take an `Rc<ExtensionLogger>`
// at construction instead of reaching for a global, and nested work can push a
// context label that prefixes every line logged inside it.

use log::Level;
use std::cell::RefCell;
use std::fmt::Display;
use std::rc::Rc;

pub struct ExtensionLogger {
    name: String,
    context: RefCell<Vec<String>>,
}

impl ExtensionLogger {
    pub fn new(name: &str) -> Rc<Self> {
        Rc::new(Self {
            name: name.to_string(),
            context: RefCell::new(Vec::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run `f` with `label` prepended to everything it logs
    pub fn in_context<R>(&self, label: &str, f: impl FnOnce() -> R) -> R {
        self.context.borrow_mut().push(label.to_string());
        let result = f();
        self.context.borrow_mut().pop();
        result
    }

    pub fn log(&self, level: Level, message: impl Display) {
        if !log::log_enabled!(level) {
            return;
        }
        let context = self.context.borrow();
        if context.is_empty() {
            log::log!(level, "[{}] {}", self.name, message);
        } else {
            log::log!(level, "[{}] {}: {}", self.name, context.join(" > "), message);
        }
    }

    pub fn debug(&self, message: impl Display) {
        self.log(Level::Debug, message);
    }

    pub fn info(&self, message: impl Display) {
        self.log(Level::Info, message);
    }

    pub fn warn(&self, message: impl Display) {
        self.log(Level::Warn, message);
    }

    pub fn error(&self, message: impl Display) {
        self.log(Level::Error, message);
    }
}
