/*
 * Copyright (c) 2026 Mohamad Al-Zawahreh (dba Sovereign Systems).
 *
 * HTTP Routing Table.
 *
 * Maps (method, path) to the name of an exported guest handler plus the
 * bound path parameters. Independent of any transport.
 *
 * LICENSE: DUAL-LICENSED (AGPLv3 or COMMERCIAL).
 */

use parking_lot::RwLock;
use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

/// Route table shared between the guest-facing registry and the server.
/// The lock is only ever held for a registration or one resolution.
pub type SharedRoutes = Arc<RwLock<RouteTable>>;

// =============================================================================
// Methods
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MethodKey {
    Exact(String),
    Any,
}

impl MethodKey {
    /// `*` and `ANY` are the wildcard; anything else is an exact,
    /// case-insensitive method name.
    pub fn parse(method: &str) -> MethodKey {
        let upper = method.trim().to_ascii_uppercase();
        match upper.as_str() {
            "*" | "ANY" => MethodKey::Any,
            _ => MethodKey::Exact(upper),
        }
    }
}

impl fmt::Display for MethodKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            MethodKey::Exact(m) => f.write_str(m),
            MethodKey::Any => f.write_str("*"),
        }
    }
}

// =============================================================================
// Patterns
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Param(String),
}

#[derive(Debug, Clone)]
struct Route {
    handler: String,
    segments: Vec<Segment>,
    literals: usize,
}

impl Route {
    fn compile(pattern: &str, handler: &str) -> Route {
        let segments: Vec<Segment> = pattern
            .split('/')
            .map(|seg| match seg.strip_prefix(':') {
                Some(name) if !name.is_empty() => Segment::Param(name.to_string()),
                _ => Segment::Literal(seg.to_string()),
            })
            .collect();
        let literals = segments
            .iter()
            .filter(|s| matches!(s, Segment::Literal(_)))
            .count();
        Route {
            handler: handler.to_string(),
            segments,
            literals,
        }
    }

    fn has_params(&self) -> bool {
        self.literals < self.segments.len()
    }

    fn bind(&self, parts: &[&str]) -> Option<Vec<(String, String)>> {
        if parts.len() != self.segments.len() {
            return None;
        }
        let mut params = Vec::new();
        for (segment, part) in self.segments.iter().zip(parts) {
            match segment {
                Segment::Literal(lit) if lit == part => {}
                Segment::Literal(_) => return None,
                Segment::Param(_) if part.is_empty() => return None,
                Segment::Param(name) => params.push((name.clone(), part.to_string())),
            }
        }
        Some(params)
    }
}

/// Result of a successful resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteMatch {
    pub handler: String,
    pub pattern: String,
    pub params: Vec<(String, String)>,
}

// =============================================================================
// Route Table
// =============================================================================

#[derive(Debug, Default)]
pub struct RouteTable {
    by_method: HashMap<MethodKey, BTreeMap<String, Route>>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> SharedRoutes {
        Arc::new(RwLock::new(RouteTable::new()))
    }

    /// Registers a route. Re-registering a (method, pattern) pair replaces
    /// its handler.
    pub fn add(&mut self, method: &str, pattern: &str, handler: &str) {
        self.by_method
            .entry(MethodKey::parse(method))
            .or_default()
            .insert(pattern.to_string(), Route::compile(pattern, handler));
    }

    pub fn len(&self) -> usize {
        self.by_method.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Exact method table first, then the wildcard table.
    pub fn resolve(&self, method: &str, path: &str) -> Option<RouteMatch> {
        let key = MethodKey::parse(method);
        if key != MethodKey::Any {
            if let Some(found) = self.by_method.get(&key).and_then(|t| resolve_in(t, path)) {
                return Some(found);
            }
        }
        self.by_method
            .get(&MethodKey::Any)
            .and_then(|t| resolve_in(t, path))
    }

    /// `(method, pattern, handler)` for every route, sorted.
    pub fn routes(&self) -> Vec<(String, String, String)> {
        let mut out: Vec<(String, String, String)> = self
            .by_method
            .iter()
            .flat_map(|(method, table)| {
                table.iter().map(move |(pattern, route)| {
                    (method.to_string(), pattern.clone(), route.handler.clone())
                })
            })
            .collect();
        out.sort();
        out
    }
}

fn resolve_in(table: &BTreeMap<String, Route>, path: &str) -> Option<RouteMatch> {
    if let Some(route) = table.get(path) {
        return Some(RouteMatch {
            handler: route.handler.clone(),
            pattern: path.to_string(),
            params: Vec::new(),
        });
    }
    let parts: Vec<&str> = path.split('/').collect();
    table
        .iter()
        .filter(|(_, route)| route.has_params())
        .filter_map(|(pattern, route)| route.bind(&parts).map(|params| (pattern, route, params)))
        // most literals, then longer pattern, then lexicographically smaller
        .max_by_key(|(pattern, route, _)| (route.literals, pattern.len(), Reverse(*pattern)))
        .map(|(pattern, route, params)| RouteMatch {
            handler: route.handler.clone(),
            pattern: pattern.clone(),
            params,
        })
}

// =============================================================================
// Tests
// =============================================================================
