//! Correlation-id routing and resource ownership.

use crate::registry::ClientId;
use bytes::Bytes;
use natrelay_proto::correlation::correlation_ids;
use natrelay_proto::envelope::{created_resource, is_response, release_request};
use natrelay_proto::{CorrelationId, ProtocolFrame};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

/// Orphaned routes kept so late responses can be recognized and released.
pub const MAX_ORPHANS: usize = 4096;

#[derive(Debug, Clone, PartialEq, Eq)]
enum RouteTarget {
    Client(ClientId),
    /// A request the relay issued itself, such as a release.
    Relay,
    /// The client went away before its response arrived.
    Orphaned,
}

/// What to do with a frame the backend produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    /// Response for `client`.
    Reply {
        client: ClientId,
        id: CorrelationId,
        created: Option<String>,
    },
    /// Response to one of the relay's own requests.
    Internal(CorrelationId),
    /// Response whose client has disconnected.
    Orphan {
        id: CorrelationId,
        created: Option<String>,
    },
    /// Response nobody asked for.
    Unroutable(CorrelationId),
    /// Event, notification or backend-initiated request.
    Unsolicited,
}

#[derive(Default)]
struct Routes {
    targets: HashMap<CorrelationId, RouteTarget>,
    orphans: VecDeque<CorrelationId>,
}

#[derive(Default)]
pub struct Router {
    routes: Mutex<Routes>,
    ownership: Mutex<HashMap<String, ClientId>>,
    next_internal: AtomicU64,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `client` as the origin of every id in `frame`.
    pub fn record_request(&self, client: &str, frame: &ProtocolFrame) -> Vec<CorrelationId> {
        let ids = correlation_ids(frame);
        let mut routes = self.routes.lock();
        for id in &ids {
            let previous = routes
                .targets
                .insert(id.clone(), RouteTarget::Client(client.to_string()));
            if let Some(RouteTarget::Client(other)) = previous {
                if other != client {
                    log::warn!(
                        "id {} from client {} replaces outstanding request of client {}",
                        id,
                        client,
                        other
                    );
                }
            }
        }
        ids
    }

    /// Drops routes for requests that never reached the backend.
    pub fn forget(&self, client: &str, ids: &[CorrelationId]) {
        let mut routes = self.routes.lock();
        for id in ids {
            if routes.targets.get(id) == Some(&RouteTarget::Client(client.to_string())) {
                routes.targets.remove(id);
            }
        }
    }

    /// Marks the outstanding requests of a departed client as orphaned.
    pub fn orphan(&self, client: &str, ids: impl IntoIterator<Item = CorrelationId>) {
        let mut guard = self.routes.lock();
        let routes = &mut *guard;
        for id in ids {
            match routes.targets.get_mut(&id) {
                Some(target) if *target == RouteTarget::Client(client.to_string()) => {
                    *target = RouteTarget::Orphaned;
                    routes.orphans.push_back(id);
                }
                _ => {}
            }
        }
        while routes.orphans.len() > MAX_ORPHANS {
            if let Some(oldest) = routes.orphans.pop_front() {
                if routes.targets.get(&oldest) == Some(&RouteTarget::Orphaned) {
                    routes.targets.remove(&oldest);
                }
            }
        }
    }

    /// Classifies a backend frame and consumes its route.
    pub fn route_response(&self, frame: &ProtocolFrame) -> Dispatch {
        if let Some(value) = frame.json() {
            if !is_response(value) {
                return Dispatch::Unsolicited;
            }
        }
        // Batched responses route by their first id.
        let Some(id) = correlation_ids(frame).into_iter().next() else {
            return Dispatch::Unsolicited;
        };
        let created = frame.json().and_then(created_resource);
        let target = self.routes.lock().targets.remove(&id);
        match target {
            Some(RouteTarget::Client(client)) => Dispatch::Reply {
                client,
                id,
                created,
            },
            Some(RouteTarget::Relay) => Dispatch::Internal(id),
            Some(RouteTarget::Orphaned) => Dispatch::Orphan { id, created },
            None => Dispatch::Unroutable(id),
        }
    }

    pub fn claim(&self, resource: &str, client: &str) {
        let previous = self
            .ownership
            .lock()
            .insert(resource.to_string(), client.to_string());
        if let Some(previous) = previous.filter(|p| p != client) {
            log::warn!(
                "resource {} moved from client {} to client {}",
                resource,
                previous,
                client
            );
        }
    }

    /// Removes the ownership record if `client` holds it.
    pub fn disown(&self, resource: &str, client: &str) -> bool {
        let mut ownership = self.ownership.lock();
        if ownership.get(resource).map(String::as_str) == Some(client) {
            ownership.remove(resource);
            true
        } else {
            false
        }
    }

    pub fn owner_of(&self, resource: &str) -> Option<ClientId> {
        self.ownership.lock().get(resource).cloned()
    }

    pub fn resources_of(&self, client: &str) -> Vec<String> {
        let mut owned: Vec<String> = self
            .ownership
            .lock()
            .iter()
            .filter(|(_, owner)| owner.as_str() == client)
            .map(|(resource, _)| resource.clone())
            .collect();
        owned.sort();
        owned
    }

    /// Builds a request releasing `resource` and routes its reply to the relay.
    pub fn release_request(&self, resource: &str) -> Bytes {
        let n = self.next_internal.fetch_add(1, Ordering::Relaxed) + 1;
        let id = CorrelationId::Text(format!("natrelay-release-{n}"));
        self.ownership.lock().remove(resource);
        let payload = release_request(&id, resource);
        self.routes.lock().targets.insert(id, RouteTarget::Relay);
        Bytes::from(payload)
    }

    pub fn outstanding(&self) -> usize {
        self.routes
            .lock()
            .targets
            .values()
            .filter(|t| matches!(t, RouteTarget::Client(_)))
            .count()
    }

    /// Forgets everything; used when the backend is replaced.
    pub fn reset(&self) {
        let mut routes = self.routes.lock();
        routes.targets.clear();
        routes.orphans.clear();
        drop(routes);
        self.ownership.lock().clear();
    }
}
