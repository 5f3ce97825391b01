//! Service and stream registrations plus the middleware group tree.
//!
//! Groups form a tree rooted at index 0. Each registration remembers the
//! group that was active when it was made; at dispatch time its middleware
//! is the concatenation of every ancestor group's list, root first.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;

use super::service::{Decode, ServiceHandler};
use crate::error::{Result, RpcError};
use crate::middleware::{BoxFuture, Middleware};
use crate::serialize::BoxMessage;
use crate::stream::Stream;

/// Type-erased stream handler: the server-side stream and the decoded open message.
pub(crate) type StreamHandler =
    Arc<dyn Fn(Arc<Stream>, BoxMessage) -> BoxFuture<'static, Result<()>> + Send + Sync>;

const ROOT: usize = 0;

struct GroupNode {
    parent: Option<usize>,
    middleware: Vec<Middleware>,
}

struct ServiceEntry {
    name: String,
    group: usize,
    handler: Arc<dyn ServiceHandler>,
}

struct StreamEntry {
    group: usize,
    decode: Decode,
    handler: StreamHandler,
}

pub(crate) struct ResolvedService {
    pub handler: Arc<dyn ServiceHandler>,
    pub middleware: Vec<Middleware>,
}

pub(crate) struct ResolvedStream {
    pub decode: Decode,
    pub handler: StreamHandler,
    pub middleware: Vec<Middleware>,
}

pub(crate) struct Registry {
    groups: Vec<GroupNode>,
    active: usize,
    services: HashMap<u64, ServiceEntry>,
    streams: HashMap<(u64, u64), StreamEntry>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            groups: vec![GroupNode {
                parent: None,
                middleware: Vec::new(),
            }],
            active: ROOT,
            services: HashMap::new(),
            streams: HashMap::new(),
        }
    }

    /// Add middleware to the active group.
    pub fn add_middleware(&mut self, middleware: Middleware) {
        self.groups[self.active].middleware.push(middleware);
    }

    /// Create a child of the active group and make it active.
    ///
    /// Returns the group to restore with [`Registry::exit_group`].
    pub fn enter_group(&mut self) -> usize {
        let previous = self.active;
        self.groups.push(GroupNode {
            parent: Some(previous),
            middleware: Vec::new(),
        });
        self.active = self.groups.len() - 1;
        previous
    }

    pub fn exit_group(&mut self, previous: usize) {
        self.active = previous;
    }

    pub fn insert_service(
        &mut self,
        service_id: u64,
        name: &str,
        handler: Arc<dyn ServiceHandler>,
    ) -> Result<()> {
        match self.services.entry(service_id) {
            Entry::Occupied(existing) => Err(RpcError::DuplicateRegistration(format!(
                "service {service_id} ({name}) already registered as {}",
                existing.get().name
            ))),
            Entry::Vacant(slot) => {
                slot.insert(ServiceEntry {
                    name: name.to_string(),
                    group: self.active,
                    handler,
                });
                Ok(())
            }
        }
    }

    pub fn insert_stream(
        &mut self,
        service_id: u64,
        method_id: u64,
        decode: Decode,
        handler: StreamHandler,
    ) -> Result<()> {
        match self.streams.entry((service_id, method_id)) {
            Entry::Occupied(_) => Err(RpcError::DuplicateRegistration(format!(
                "stream handler for service {service_id} method {method_id} already registered"
            ))),
            Entry::Vacant(slot) => {
                slot.insert(StreamEntry {
                    group: self.active,
                    decode,
                    handler,
                });
                Ok(())
            }
        }
    }

    /// Middleware inherited by `group`, root group first.
    fn middleware_stack(&self, group: usize) -> Vec<Middleware> {
        let mut lineage = Vec::new();
        let mut current = Some(group);
        while let Some(index) = current {
            lineage.push(index);
            current = self.groups[index].parent;
        }
        lineage
            .into_iter()
            .rev()
            .flat_map(|index| self.groups[index].middleware.iter().cloned())
            .collect()
    }

    pub fn resolve_service(&self, service_id: u64) -> Option<ResolvedService> {
        let entry = self.services.get(&service_id)?;
        Some(ResolvedService {
            handler: Arc::clone(&entry.handler),
            middleware: self.middleware_stack(entry.group),
        })
    }

    pub fn resolve_stream(&self, service_id: u64, method_id: u64) -> Option<ResolvedStream> {
        let entry = self.streams.get(&(service_id, method_id))?;
        Some(ResolvedStream {
            decode: entry.decode,
            handler: Arc::clone(&entry.handler),
            middleware: self.middleware_stack(entry.group),
        })
    }

    #[cfg(test)]
    pub fn service_count(&self) -> usize {
        self.services.len()
    }
}
