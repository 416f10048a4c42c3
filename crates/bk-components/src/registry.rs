//! Component registry: element name → renderer.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

/// Attributes collected from the source element.
pub type Attrs = HashMap<String, String>;

/// Slot name → serialised HTML captured from the element's children.
/// Children of a `<bk-slot name="x">` land under `"x"`; everything else
/// under `"default"`.
pub type Slots = HashMap<String, String>;

/// Error returned by a renderer. The expander logs it and leaves the
/// original element in place; the response never fails because of it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderError {
    message: String,
}

impl RenderError {
    pub fn new(message: impl Into<String>) -> Self {
        RenderError {
            message: message.into(),
        }
    }
}

impl fmt::Display for RenderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for RenderError {}

/// A renderer must be pure with respect to its inputs; the expander treats
/// repeated invocations with equal inputs as interchangeable.
pub type Renderer = Arc<dyn Fn(&Attrs, &Slots) -> Result<String, RenderError> + Send + Sync>;

/// Mapping from element name (conventionally `bk-<kebab>`) to renderer.
///
/// Read-mostly: registration happens at start-up, lookups on every request,
/// so a plain `RwLock` over a map is enough.
#[derive(Default)]
pub struct ComponentRegistry {
    renderers: RwLock<HashMap<String, Renderer>>,
}

impl ComponentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a renderer under an element name. Replaces any previous
    /// registration for the same name.
    pub fn register<F>(&self, name: &str, renderer: F)
    where
        F: Fn(&Attrs, &Slots) -> Result<String, RenderError> + Send + Sync + 'static,
    {
        self.renderers
            .write()
            .expect("component registry lock poisoned")
            .insert(name.to_owned(), Arc::new(renderer));
    }

    pub fn get(&self, name: &str) -> Option<Renderer> {
        self.renderers
            .read()
            .expect("component registry lock poisoned")
            .get(name)
            .cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.renderers
            .read()
            .expect("component registry lock poisoned")
            .contains_key(name)
    }

    pub fn is_empty(&self) -> bool {
        self.renderers
            .read()
            .expect("component registry lock poisoned")
            .is_empty()
    }

    /// Invoke the renderer registered under `name`.
    pub fn render(&self, name: &str, attrs: &Attrs, slots: &Slots) -> Result<String, RenderError> {
        let renderer = self
            .get(name)
            .ok_or_else(|| RenderError::new(format!("no component registered as '{name}'")))?;
        renderer(attrs, slots)
    }
}
