//! Maps query tokens handed to the backend back to their owner.

use std::collections::HashMap;
use crate::backend::{Backend, ConnectionHandle, QueryToken};
use crate::browser::gatherer::SubQuery;
use crate::browser::BrowserId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Route {
    Browse(BrowserId),
    Query {
        browser: BrowserId,
        full_name: String,
        kind: SubQuery,
    },
}

#[derive(Debug, Default)]
pub(crate) struct Routes {
    next: u64,
    map: HashMap<QueryToken, Route>,
}

impl Routes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocate(&mut self, route: Route) -> QueryToken {
        self.next += 1;
        let token = QueryToken(self.next);
        self.map.insert(token, route);
        token
    }

    pub fn get(&self, token: QueryToken) -> Option<&Route> {
        self.map.get(&token)
    }

    pub fn remove(&mut self, token: QueryToken) -> Option<Route> {
        self.map.remove(&token)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn clear(&mut self) {
        self.map.clear();
    }
}

/// Everything a browser or gatherer needs to issue backend calls
pub(crate) struct QueryCtx<'a> {
    pub backend: &'a dyn Backend,
    pub handle: ConnectionHandle,
    pub routes: &'a mut Routes,
}

impl<'a> QueryCtx<'a> {
    pub fn new(backend: &'a dyn Backend, handle: ConnectionHandle, routes: &'a mut Routes) -> Self {
        Self {
            backend,
            handle,
            routes,
        }
    }

    /// Forgets the token and releases it on the backend side.
    pub fn cancel(&mut self, token: QueryToken) {
        self.routes.remove(token);
        self.backend.cancel(self.handle, token);
    }
}
