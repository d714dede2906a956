/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Document tree wrapper.

use std::sync::Arc;

use faultshell_core::{FaultFamily, FaultMenu, FaultVariant, MenuDescription};
use faultshell_runtime::{DomError, DomTree, NodeId};
use log::warn;

use super::{
    CleanupError, InterceptorContext, InterceptorCore, InterceptorHandle, InterceptorRegistration,
    fallback_table,
};

const CATEGORY: &str = "dom";
const MUTATE: &str = "dom.mutate";
const QUERY: &str = "dom.query";

const MUTATION_DELAY_MS: std::ops::RangeInclusive<u64> = 50..=1500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DomFault {
    DelayedMutation,
    RejectedMutation,
    DuplicateNode,
    ShuffledNodes,
    MissingNode,
}

impl FaultVariant for DomFault {
    fn name(self) -> &'static str {
        match self {
            Self::DelayedMutation => "delayed-mutation",
            Self::RejectedMutation => "rejected-mutation",
            Self::DuplicateNode => "duplicate-node",
            Self::ShuffledNodes => "shuffled-nodes",
            Self::MissingNode => "missing-node",
        }
    }

    fn family(self) -> FaultFamily {
        match self {
            Self::DelayedMutation => FaultFamily::Latency,
            Self::RejectedMutation => FaultFamily::Error,
            Self::DuplicateNode => FaultFamily::Duplication,
            Self::ShuffledNodes => FaultFamily::Reorder,
            Self::MissingNode => FaultFamily::Drop,
        }
    }

    fn safe_fallback(self) -> Self {
        match self {
            Self::RejectedMutation => Self::DelayedMutation,
            Self::MissingNode => Self::ShuffledNodes,
            other => other,
        }
    }
}

pub(crate) fn menu() -> FaultMenu<DomFault> {
    use DomFault::*;
    FaultMenu::new()
        .with(MUTATE, &[DelayedMutation, RejectedMutation, DuplicateNode])
        .with(QUERY, &[ShuffledNodes, MissingNode])
}

fn catalog() -> Vec<MenuDescription> {
    menu().describe()
}

fn fallbacks() -> Vec<(&'static str, &'static str, bool)> {
    fallback_table(&menu())
}

inventory::submit! {
    InterceptorRegistration {
        name: "dom",
        categories: &[CATEGORY],
        catalog,
        fallbacks,
    }
}

pub struct ChaosDom {
    real: Arc<dyn DomTree>,
    core: InterceptorCore<DomFault>,
}

pub fn install(ctx: &InterceptorContext, real: Arc<dyn DomTree>) -> Arc<ChaosDom> {
    Arc::new(ChaosDom {
        real,
        core: InterceptorCore::new(ctx, "dom", menu()),
    })
}

impl ChaosDom {
    /// Route one mutation through the mutation menu. `apply` performs it
    /// against the real tree.
    fn mutate(
        &self,
        what: String,
        apply: impl FnOnce(&dyn DomTree) -> Result<(), DomError> + Send + 'static,
    ) -> Result<(), DomError> {
        let Some(fault) = self.core.decide(CATEGORY, MUTATE) else {
            return apply(self.real.as_ref());
        };
        match fault {
            DomFault::RejectedMutation => {
                self.core
                    .emit(CATEGORY, fault, format!("{what} rejected"), 0);
                Err(DomError::MutationRejected(what))
            }
            _ => {
                let delay_ms = self.core.draw_ms(MUTATION_DELAY_MS);
                self.core.emit(
                    CATEGORY,
                    DomFault::DelayedMutation,
                    format!("{what} delayed by {delay_ms}ms"),
                    delay_ms,
                );
                let real = self.real.clone();
                self.core.defer(delay_ms, move || {
                    if let Err(error) = apply(real.as_ref()) {
                        warn!("dom: delayed mutation failed: {error}");
                    }
                });
                Ok(())
            }
        }
    }

    fn query(&self, what: &str, mut nodes: Vec<NodeId>) -> Vec<NodeId> {
        let Some(fault) = self.core.decide(CATEGORY, QUERY) else {
            return nodes;
        };
        match fault {
            DomFault::MissingNode if !nodes.is_empty() => {
                let index = self.core.rng().index(nodes.len());
                let missing = nodes.remove(index);
                self.core.emit(
                    CATEGORY,
                    fault,
                    format!("{what} omitted {missing} of {}", nodes.len() + 1),
                    0,
                );
                nodes
            }
            _ => {
                self.core.rng().shuffle(&mut nodes);
                self.core.emit(
                    CATEGORY,
                    DomFault::ShuffledNodes,
                    format!("{what} returned {} nodes out of order", nodes.len()),
                    0,
                );
                nodes
            }
        }
    }
}

impl DomTree for ChaosDom {
    fn root(&self) -> NodeId {
        self.real.root()
    }

    fn create_element(&self, tag: &str) -> NodeId {
        self.real.create_element(tag)
    }

    fn clone_node(&self, node: NodeId) -> Result<NodeId, DomError> {
        self.real.clone_node(node)
    }

    fn append_child(&self, parent: NodeId, child: NodeId) -> Result<(), DomError> {
        let Some(fault) = self.core.decide(CATEGORY, MUTATE) else {
            return self.real.append_child(parent, child);
        };
        match fault {
            DomFault::DuplicateNode => {
                self.real.append_child(parent, child)?;
                let copy = self.real.clone_node(child)?;
                self.core.emit(
                    CATEGORY,
                    fault,
                    format!("{child} appended to {parent} twice (copy {copy})"),
                    0,
                );
                self.real.append_child(parent, copy)
            }
            DomFault::RejectedMutation => {
                let what = format!("append of {child} to {parent}");
                self.core.emit(CATEGORY, fault, format!("{what} rejected"), 0);
                Err(DomError::MutationRejected(what))
            }
            DomFault::DelayedMutation | DomFault::ShuffledNodes | DomFault::MissingNode => {
                let delay_ms = self.core.draw_ms(MUTATION_DELAY_MS);
                self.core.emit(
                    CATEGORY,
                    DomFault::DelayedMutation,
                    format!("append of {child} to {parent} delayed by {delay_ms}ms"),
                    delay_ms,
                );
                let real = self.real.clone();
                self.core.defer(delay_ms, move || {
                    if let Err(error) = real.append_child(parent, child) {
                        warn!("dom: delayed append failed: {error}");
                    }
                });
                Ok(())
            }
        }
    }

    fn remove_child(&self, parent: NodeId, child: NodeId) -> Result<(), DomError> {
        self.mutate(format!("removal of {child} from {parent}"), move |real| {
            real.remove_child(parent, child)
        })
    }

    fn set_attribute(&self, node: NodeId, name: &str, value: &str) -> Result<(), DomError> {
        let (name, value) = (name.to_string(), value.to_string());
        self.mutate(format!("attribute {name} on {node}"), move |real| {
            real.set_attribute(node, &name, &value)
        })
    }

    fn attribute(&self, node: NodeId, name: &str) -> Option<String> {
        self.real.attribute(node, name)
    }

    fn set_text(&self, node: NodeId, text: &str) -> Result<(), DomError> {
        let text = text.to_string();
        self.mutate(format!("text of {node}"), move |real| real.set_text(node, &text))
    }

    fn text(&self, node: NodeId) -> Option<String> {
        self.real.text(node)
    }

    fn tag(&self, node: NodeId) -> Option<String> {
        self.real.tag(node)
    }

    fn children(&self, node: NodeId) -> Result<Vec<NodeId>, DomError> {
        let children = self.real.children(node)?;
        Ok(self.query(&format!("children of {node}"), children))
    }

    fn query_selector_all(&self, selector: &str) -> Vec<NodeId> {
        let found = self.real.query_selector_all(selector);
        self.query(&format!("query {selector:?}"), found)
    }
}

impl InterceptorHandle for ChaosDom {
    fn name(&self) -> &'static str {
        "dom"
    }

    fn cleanup(&self) -> Result<(), CleanupError> {
        self.core.shutdown();
        Ok(())
    }

    fn is_detached(&self) -> bool {
        self.core.is_detached()
    }

    fn active_resources(&self) -> usize {
        self.core.pending()
    }
}
