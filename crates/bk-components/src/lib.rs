//! Server-side `bk-*` component expansion.
//!
//! A registry maps custom element names to renderer functions; the expander
//! rewrites every registered `<bk-*>` element in an HTML document into the
//! renderer's output before the bytes leave the server. Renderer output is
//! re-parsed (never trusted to be balanced), stripped of `on*` event
//! attributes, and expanded recursively so components may emit components.

pub mod expand;
pub mod registry;

pub use registry::{Attrs, ComponentRegistry, RenderError, Renderer, Slots};
