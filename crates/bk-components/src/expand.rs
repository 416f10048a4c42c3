//! The document expander.
//!
//! Walks a parsed HTML document, replacing each registered `<bk-*>` element
//! with its renderer's output. The output is parsed as a fragment (renderers
//! are never trusted to emit balanced markup), sanitised, grafted in place of
//! the original element, and then re-scanned so nested components expand too.

use crate::registry::{Attrs, ComponentRegistry, Slots};
use ego_tree::{NodeId, NodeRef, Tree};
use scraper::node::Node;
use scraper::{ElementRef, Html};
use std::collections::HashSet;
use tracing::warn;

/// Upper bound on expansions per document. A renderer that emits itself
/// would otherwise loop forever.
const EXPANSION_BUDGET: usize = 256;

/// Tag of the slot marker element inside a component's children.
const SLOT_TAG: &str = "bk-slot";

const COMPONENT_PREFIX: &str = "bk-";

impl ComponentRegistry {
    /// Expand every registered component in `html` and return the
    /// re-serialised document.
    ///
    /// Documents containing no `<bk-` byte sequence (or an empty registry)
    /// pass through untouched. Renderer failures are logged and leave the
    /// original element in place; this function never fails.
    pub fn expand_document(&self, html: &str, dev_mode: bool) -> String {
        if self.is_empty() || !html.contains("<bk-") {
            return html.to_owned();
        }

        let mut doc = Html::parse_document(html);
        let mut skipped: HashSet<NodeId> = HashSet::new();
        let mut budget = EXPANSION_BUDGET;

        while let Some(target) = find_next_component(&doc, self, &skipped) {
            if budget == 0 {
                warn!("component expansion budget exhausted, leaving remainder unexpanded");
                break;
            }
            budget -= 1;

            let node = doc
                .tree
                .get(target)
                .expect("target id was just found in this tree");
            let element = ElementRef::wrap(node).expect("target is an element");
            let name = element.value().name().to_owned();
            let attrs: Attrs = element
                .value()
                .attrs()
                .map(|(k, v)| (k.to_owned(), v.to_owned()))
                .collect();
            let slots = collect_slots(element);

            match self.render(&name, &attrs, &slots) {
                Ok(output) => {
                    let output = if dev_mode {
                        format!("<!-- {name} -->{output}<!-- /{name} -->")
                    } else {
                        output
                    };
                    let mut fragment = Html::parse_fragment(&output);
                    strip_event_attrs(&mut fragment);
                    graft_before(&mut doc.tree, target, &fragment);
                    doc.tree
                        .get_mut(target)
                        .expect("target still present")
                        .detach();
                }
                Err(error) => {
                    warn!(component = %name, %error, "component render failed, element left as-is");
                    skipped.insert(target);
                }
            }
        }

        doc.html()
    }
}

/// First registered component element in document order, skipping elements
/// whose renderer already failed.
fn find_next_component(
    doc: &Html,
    registry: &ComponentRegistry,
    skipped: &HashSet<NodeId>,
) -> Option<NodeId> {
    doc.tree
        .root()
        .descendants()
        .find(|node| {
            if skipped.contains(&node.id()) {
                return false;
            }
            node.value().as_element().is_some_and(|el| {
                let name = el.name();
                name.starts_with(COMPONENT_PREFIX) && name != SLOT_TAG && registry.contains(name)
            })
        })
        .map(|node| node.id())
}

/// Collect the element's children into slots: `<bk-slot name="x">` children
/// land under `"x"`, everything else is serialised into `"default"`.
fn collect_slots(element: ElementRef<'_>) -> Slots {
    let mut slots = Slots::new();
    let mut default = String::new();

    for child in element.children() {
        match child.value() {
            Node::Element(el) if el.name() == SLOT_TAG => {
                let slot_name = el.attr("name").unwrap_or("default").to_owned();
                let inner = ElementRef::wrap(child)
                    .expect("slot child is an element")
                    .inner_html();
                slots
                    .entry(slot_name)
                    .and_modify(|existing| existing.push_str(&inner))
                    .or_insert(inner);
            }
            Node::Element(_) => {
                default.push_str(
                    &ElementRef::wrap(child)
                        .expect("child is an element")
                        .html(),
                );
            }
            Node::Text(text) => default.push_str(&escape_text(&text.text)),
            Node::Comment(comment) => {
                default.push_str("<!--");
                default.push_str(&comment.comment);
                default.push_str("-->");
            }
            _ => {}
        }
    }

    if !default.is_empty() {
        slots.insert("default".to_owned(), default);
    }
    slots
}

/// Remove `on*` event attributes everywhere in a parsed renderer fragment.
fn strip_event_attrs(fragment: &mut Html) {
    let ids: Vec<NodeId> = fragment.tree.root().descendants().map(|n| n.id()).collect();
    for id in ids {
        if let Some(mut node) = fragment.tree.get_mut(id) {
            if let Node::Element(el) = node.value() {
                el.attrs
                    .retain(|(name, _)| !name.local.to_ascii_lowercase().starts_with("on"));
            }
        }
    }
}

/// Copy the fragment's content into `tree` as siblings directly before
/// `target`, preserving order.
fn graft_before(tree: &mut Tree<Node>, target: NodeId, fragment: &Html) {
    let root = fragment.tree.root();
    // The fragment parser wraps parsed nodes in a synthetic <html> element.
    let content_root = root
        .children()
        .find(|c| c.value().as_element().is_some_and(|el| el.name() == "html"))
        .unwrap_or(root);
    for child in content_root.children() {
        let new_id = tree
            .get_mut(target)
            .expect("graft target exists")
            .insert_before(child.value().clone())
            .id();
        copy_children(tree, new_id, child);
    }
}

fn copy_children(tree: &mut Tree<Node>, dst: NodeId, src: NodeRef<'_, Node>) {
    for child in src.children() {
        let new_id = tree
            .get_mut(dst)
            .expect("copy destination exists")
            .append(child.value().clone())
            .id();
        copy_children(tree, new_id, child);
    }
}

fn escape_text(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            _ => escaped.push(c),
        }
    }
    escaped
}
