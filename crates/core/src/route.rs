//! Route declarations and the method/path table

use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::error::HookError;
use crate::hooks::{Hook, Stage};
use crate::lifecycle::{RouteHandler, Validator};

/// A route as declared, editable by `onRoute` hooks before it is stored
#[derive(Clone)]
pub struct RouteOptions {
    pub method: String,
    /// URL as passed by the caller, relative to the scope prefix
    pub url: String,
    /// Prefix of the declaring scope, root to leaf
    pub prefix: String,
    /// Path the route is served on; `prefix` + `url` unless a hook changes it
    pub path: String,
    pub handler: Arc<dyn RouteHandler>,
    pub validator: Option<Arc<dyn Validator>>,
    /// Route-level hooks, run after the scope's chain for their stage
    pub hooks: Vec<(Stage, Hook)>,
    /// Free-form per-route settings for hooks to read
    pub config: Value,
}

impl RouteOptions {
    pub fn new(method: &str, url: impl Into<String>, handler: Arc<dyn RouteHandler>) -> Self {
        let url = url.into();
        Self {
            method: method.to_ascii_uppercase(),
            path: url.clone(),
            url,
            prefix: String::new(),
            handler,
            validator: None,
            hooks: Vec::new(),
            config: Value::Null,
        }
    }

    pub fn get(url: impl Into<String>, handler: Arc<dyn RouteHandler>) -> Self {
        Self::new("GET", url, handler)
    }

    pub fn post(url: impl Into<String>, handler: Arc<dyn RouteHandler>) -> Self {
        Self::new("POST", url, handler)
    }

    pub fn with_hook(mut self, stage: Stage, hook: Hook) -> Self {
        self.hooks.push((stage, hook));
        self
    }

    pub fn with_validator(mut self, validator: Arc<dyn Validator>) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn with_config(mut self, config: Value) -> Self {
        self.config = config;
        self
    }

    /// Set `prefix` and recompute `path` from it
    pub(crate) fn mount(&mut self, prefix: &str) {
        self.prefix = prefix.to_string();
        self.path = join_path(prefix, &self.url);
    }
}

impl fmt::Debug for RouteOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RouteOptions")
            .field("method", &self.method)
            .field("url", &self.url)
            .field("prefix", &self.prefix)
            .field("path", &self.path)
            .field("hooks", &self.hooks.len())
            .field("validator", &self.validator.is_some())
            .finish()
    }
}

/// Join a scope prefix and a route url into a served path
pub fn join_path(prefix: &str, url: &str) -> String {
    let prefix = prefix.trim_end_matches('/');
    let url = url.trim_start_matches('/');
    match (prefix.is_empty(), url.is_empty()) {
        (true, _) => format!("/{}", url),
        (false, true) => prefix.to_string(),
        (false, false) => format!("{}/{}", prefix, url),
    }
}

/// Routes keyed by `(method, path)`, kept in declaration order
#[derive(Debug)]
pub struct RouteTable<T> {
    entries: Vec<T>,
    index: HashMap<(String, String), usize>,
}

impl<T> Default for RouteTable<T> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            index: HashMap::new(),
        }
    }
}

impl<T> RouteTable<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, method: &str, path: &str, entry: T) -> Result<(), HookError> {
        let key = (method.to_ascii_uppercase(), path.to_string());
        if self.index.contains_key(&key) {
            return Err(HookError::DuplicateRoute {
                method: key.0,
                path: key.1,
            });
        }
        self.index.insert(key, self.entries.len());
        self.entries.push(entry);
        Ok(())
    }

    /// Exact match on the path, ignoring the query string and a trailing slash
    pub fn find(&self, method: &str, url: &str) -> Option<&T> {
        let path = url.split(['?', '#']).next().unwrap_or(url);
        let method = method.to_ascii_uppercase();
        let trimmed = match path.trim_end_matches('/') {
            "" => "/",
            other => other,
        };
        [path, trimmed]
            .into_iter()
            .find_map(|p| self.index.get(&(method.clone(), p.to_string())))
            .map(|&i| &self.entries[i])
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Rebuild with every entry mapped through `f`, keeping keys and order
    pub fn try_map<U, E>(self, f: impl FnMut(T) -> Result<U, E>) -> Result<RouteTable<U>, E> {
        Ok(RouteTable {
            entries: self.entries.into_iter().map(f).collect::<Result<_, _>>()?,
            index: self.index,
        })
    }
}
