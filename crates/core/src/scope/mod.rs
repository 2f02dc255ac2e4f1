//! Encapsulation scopes and hook inheritance
//!
//! Scopes form an append-only tree owned by [`ScopeTree`]. A scope's
//! resolved chain for a stage is every ancestor's local list for that stage,
//! root first, followed by its own. Resolving a request stage caches the
//! chain and seals that stage on the scope and all of its ancestors: later
//! registrations there fail with `ScopeSealed` instead of silently missing
//! requests that already resolved.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use crate::error::HookError;
use crate::hooks::{Hook, HookChain, HookHandler, HookRegistry, Stage};

/// Index of a scope inside its tree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScopeId(usize);

impl ScopeId {
    pub const ROOT: ScopeId = ScopeId(0);

    pub fn index(&self) -> usize {
        self.0
    }
}

impl fmt::Display for ScopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Options for a new child scope
#[derive(Debug, Clone, Default)]
pub struct ScopeOptions {
    /// Display name (defaults to `scope#<id>`)
    pub name: Option<String>,
    /// Path prefix for routes declared in this scope, appended to the parent's
    pub prefix: String,
    /// Do not run the parent chain's `onRegister` hooks for this scope
    pub skip_on_register: bool,
}

impl ScopeOptions {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn skip_on_register(mut self) -> Self {
        self.skip_on_register = true;
        self
    }
}

type Decorator = Arc<dyn Any + Send + Sync>;

struct Scope {
    name: String,
    prefix: String,
    parent: Option<ScopeId>,
    children: Vec<ScopeId>,
    skip_on_register: bool,
    hooks: HookRegistry,
    decorators: HashMap<String, Decorator>,
    resolved: [OnceLock<HookChain>; Stage::COUNT],
    sealed: [AtomicBool; Stage::COUNT],
}

impl Scope {
    fn new(name: String, prefix: String, parent: Option<ScopeId>, skip_on_register: bool) -> Self {
        Self {
            name,
            prefix,
            parent,
            children: Vec::new(),
            skip_on_register,
            hooks: HookRegistry::new(),
            decorators: HashMap::new(),
            resolved: std::array::from_fn(|_| OnceLock::new()),
            sealed: std::array::from_fn(|_| AtomicBool::new(false)),
        }
    }
}

/// The explicitly owned scope tree.
///
/// Mutated through `&mut` during registration; after that it is shared
/// read-only (typically behind an `Arc`) by every in-flight request.
pub struct ScopeTree {
    scopes: Vec<Scope>,
    next_seq: u64,
}

impl Default for ScopeTree {
    fn default() -> Self {
        Self::new()
    }
}

impl ScopeTree {
    /// A tree holding only the root scope
    pub fn new() -> Self {
        Self {
            scopes: vec![Scope::new("root".to_string(), String::new(), None, false)],
            next_seq: 0,
        }
    }

    pub fn root(&self) -> ScopeId {
        ScopeId::ROOT
    }

    pub fn len(&self) -> usize {
        self.scopes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scopes.is_empty()
    }

    fn scope(&self, id: ScopeId) -> Result<&Scope, HookError> {
        self.scopes.get(id.0).ok_or(HookError::UnknownScope(id.0))
    }

    fn scope_mut(&mut self, id: ScopeId) -> Result<&mut Scope, HookError> {
        self.scopes.get_mut(id.0).ok_or(HookError::UnknownScope(id.0))
    }

    /// Create a child of `parent`. Running `onRegister` is the caller's job
    /// (see [`crate::hooks::ApplicationEventBus::fire_register`]).
    pub fn create_child(
        &mut self,
        parent: ScopeId,
        options: ScopeOptions,
    ) -> Result<ScopeId, HookError> {
        self.scope(parent)?;
        let id = ScopeId(self.scopes.len());
        let name = options.name.unwrap_or_else(|| format!("scope{}", id));
        self.scopes.push(Scope::new(
            name,
            options.prefix,
            Some(parent),
            options.skip_on_register,
        ));
        self.scope_mut(parent)?.children.push(id);
        Ok(id)
    }

    /// Register `hook` on `scope` for `stage`, returning `scope` for chaining
    pub fn add_hook(&mut self, scope: ScopeId, stage: Stage, hook: Hook) -> Result<ScopeId, HookError> {
        self.add_hook_handler(scope, stage, hook).map(|_| scope)
    }

    /// Register by camelCase stage name; unknown names fail with `InvalidStage`
    pub fn add_hook_named(
        &mut self,
        scope: ScopeId,
        stage: &str,
        hook: Hook,
    ) -> Result<ScopeId, HookError> {
        let stage = stage.parse::<Stage>()?;
        self.add_hook(scope, stage, hook)
    }

    /// Reserve a registration sequence number for a hook stored outside the tree
    pub(crate) fn allocate_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    pub(crate) fn add_hook_handler(
        &mut self,
        scope: ScopeId,
        stage: Stage,
        hook: Hook,
    ) -> Result<Arc<HookHandler>, HookError> {
        let seq = self.next_seq;
        let entry = self.scope_mut(scope)?;
        if entry.sealed[stage.index()].load(Ordering::Acquire) {
            return Err(HookError::ScopeSealed {
                scope: entry.name.clone(),
                stage,
            });
        }
        let handler = entry.hooks.register(stage, scope, seq, hook)?;
        self.next_seq += 1;
        Ok(handler)
    }

    /// The full root-to-leaf chain for (`scope`, `stage`).
    ///
    /// Cached on first call; seals `stage` on `scope` and its ancestors.
    pub fn resolve(&self, scope: ScopeId, stage: Stage) -> Result<HookChain, HookError> {
        let entry = self.scope(scope)?;
        let lineage = self.lineage(scope)?;
        for id in &lineage {
            self.scopes[id.0].sealed[stage.index()].store(true, Ordering::Release);
        }
        let chain = entry.resolved[stage.index()].get_or_init(|| {
            lineage
                .iter()
                .flat_map(|id| self.scopes[id.0].hooks.handlers_for(stage).iter().cloned())
                .collect()
        });
        Ok(Arc::clone(chain))
    }

    /// Root-to-leaf chain without caching or sealing
    pub fn collect(&self, scope: ScopeId, stage: Stage) -> Result<Vec<Arc<HookHandler>>, HookError> {
        Ok(self
            .lineage(scope)?
            .iter()
            .flat_map(|id| self.scopes[id.0].hooks.handlers_for(stage).iter().cloned())
            .collect())
    }

    /// Every handler for `stage` anywhere in the tree, in registration order
    pub fn all_handlers(&self, stage: Stage) -> Vec<Arc<HookHandler>> {
        let mut handlers: Vec<_> = self
            .scopes
            .iter()
            .flat_map(|s| s.hooks.handlers_for(stage).iter().cloned())
            .collect();
        handlers.sort_by_key(|h| h.seq());
        handlers
    }

    /// Ancestors of `scope`, root first, ending with `scope` itself
    pub fn lineage(&self, scope: ScopeId) -> Result<Vec<ScopeId>, HookError> {
        let mut chain = vec![scope];
        let mut current = self.scope(scope)?.parent;
        while let Some(id) = current {
            chain.push(id);
            current = self.scopes[id.0].parent;
        }
        chain.reverse();
        Ok(chain)
    }

    pub fn is_sealed(&self, scope: ScopeId, stage: Stage) -> bool {
        self.scopes
            .get(scope.0)
            .is_some_and(|s| s.sealed[stage.index()].load(Ordering::Acquire))
    }

    pub fn parent(&self, scope: ScopeId) -> Option<ScopeId> {
        self.scopes.get(scope.0).and_then(|s| s.parent)
    }

    pub fn children(&self, scope: ScopeId) -> &[ScopeId] {
        self.scopes
            .get(scope.0)
            .map(|s| s.children.as_slice())
            .unwrap_or(&[])
    }

    pub fn name(&self, scope: ScopeId) -> Option<&str> {
        self.scopes.get(scope.0).map(|s| s.name.as_str())
    }

    pub fn local_hooks(&self, scope: ScopeId) -> Result<&HookRegistry, HookError> {
        Ok(&self.scope(scope)?.hooks)
    }

    pub fn skips_on_register(&self, scope: ScopeId) -> bool {
        self.scopes.get(scope.0).is_some_and(|s| s.skip_on_register)
    }

    /// Concatenated prefixes from the root down to `scope`
    pub fn full_prefix(&self, scope: ScopeId) -> Result<String, HookError> {
        Ok(self
            .lineage(scope)?
            .iter()
            .map(|id| self.scopes[id.0].prefix.as_str())
            .collect())
    }

    /// Attach a named value to `scope`, visible to it and its descendants
    pub fn decorate<T: Any + Send + Sync>(
        &mut self,
        scope: ScopeId,
        name: &str,
        value: T,
    ) -> Result<ScopeId, HookError> {
        if self.has_decorator(scope, name) {
            return Err(HookError::DecoratorAlreadyPresent(name.to_string()));
        }
        self.scope_mut(scope)?
            .decorators
            .insert(name.to_string(), Arc::new(value));
        Ok(scope)
    }

    /// Nearest decorator named `name` visible from `scope`, if it has type `T`
    pub fn decorator<T: Any + Send + Sync>(&self, scope: ScopeId, name: &str) -> Option<Arc<T>> {
        let mut current = Some(scope);
        while let Some(id) = current {
            let entry = self.scopes.get(id.0)?;
            if let Some(value) = entry.decorators.get(name) {
                return Arc::clone(value).downcast::<T>().ok();
            }
            current = entry.parent;
        }
        None
    }

    pub fn has_decorator(&self, scope: ScopeId, name: &str) -> bool {
        let mut current = Some(scope);
        while let Some(id) = current {
            let Some(entry) = self.scopes.get(id.0) else {
                return false;
            };
            if entry.decorators.contains_key(name) {
                return true;
            }
            current = entry.parent;
        }
        false
    }

    /// Render the tree with each scope's local hook counts
    pub fn render(&self) -> String {
        let mut out = String::new();
        self.render_into(ScopeId::ROOT, "", true, true, &mut out);
        out
    }

    fn render_into(&self, id: ScopeId, indent: &str, last: bool, is_root: bool, out: &mut String) {
        let scope = &self.scopes[id.0];
        let branch = if is_root {
            ""
        } else if last {
            "└── "
        } else {
            "├── "
        };
        out.push_str(indent);
        out.push_str(branch);
        out.push_str(&scope.name);

        let mut details = Vec::new();
        if !scope.prefix.is_empty() {
            details.push(format!("prefix {}", scope.prefix));
        }
        details.extend(
            scope
                .hooks
                .counts()
                .into_iter()
                .map(|(stage, n)| format!("{}: {}", stage, n)),
        );
        if !details.is_empty() {
            out.push_str(&format!(" ({})", details.join(", ")));
        }
        out.push('\n');

        let child_indent = if is_root {
            String::new()
        } else if last {
            format!("{}    ", indent)
        } else {
            format!("{}│   ", indent)
        };
        for (i, child) in scope.children.iter().enumerate() {
            let child_last = i + 1 == scope.children.len();
            self.render_into(*child, &child_indent, child_last, false, out);
        }
    }
}

impl fmt::Debug for ScopeTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopeTree")
            .field("scopes", &self.scopes.len())
            .field("hooks", &self.next_seq)
            .finish()
    }
}

/// Shared read-only handle to one scope of a started application
#[derive(Clone)]
pub struct ScopeRef {
    tree: Arc<ScopeTree>,
    id: ScopeId,
}

impl ScopeRef {
    pub fn new(tree: Arc<ScopeTree>, id: ScopeId) -> Self {
        Self { tree, id }
    }

    pub fn id(&self) -> ScopeId {
        self.id
    }

    pub fn name(&self) -> &str {
        self.tree.name(self.id).unwrap_or("?")
    }

    pub fn decorator<T: Any + Send + Sync>(&self, name: &str) -> Option<Arc<T>> {
        self.tree.decorator(self.id, name)
    }

    pub fn tree(&self) -> &ScopeTree {
        &self.tree
    }
}

impl fmt::Debug for ScopeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopeRef")
            .field("id", &self.id)
            .field("name", &self.name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn named(name: &str) -> Hook {
        Hook::request_done(|_ctx, done| done.ok()).named(name)
    }

    fn labels(chain: &[Arc<HookHandler>]) -> Vec<String> {
        chain.iter().map(|h| h.label()).collect()
    }

    #[test]
    fn test_resolve_concatenates_root_to_leaf() {
        let mut tree = ScopeTree::new();
        let child = tree.create_child(ScopeId::ROOT, ScopeOptions::named("child")).unwrap();
        let leaf = tree.create_child(child, ScopeOptions::named("leaf")).unwrap();

        // Populate leaf-first; order of population must not matter
        tree.add_hook(leaf, Stage::OnRequest, named("D")).unwrap();
        tree.add_hook(child, Stage::OnRequest, named("C")).unwrap();
        tree.add_hook(ScopeId::ROOT, Stage::OnRequest, named("A")).unwrap();
        tree.add_hook(ScopeId::ROOT, Stage::OnRequest, named("B")).unwrap();

        let chain = tree.resolve(leaf, Stage::OnRequest).unwrap();
        assert_eq!(labels(&chain), vec!["A", "B", "C", "D"]);

        let root_chain = tree.resolve(ScopeId::ROOT, Stage::OnRequest).unwrap();
        assert_eq!(labels(&root_chain), vec!["A", "B"]);
    }

    #[test]
    fn test_stages_resolve_independently() {
        let mut tree = ScopeTree::new();
        let child = tree.create_child(ScopeId::ROOT, ScopeOptions::default()).unwrap();
        tree.add_hook(ScopeId::ROOT, Stage::PreHandler, named("P")).unwrap();
        tree.add_hook(child, Stage::OnSend, named("S")).unwrap();

        assert_eq!(labels(&tree.resolve(child, Stage::PreHandler).unwrap()), vec!["P"]);
        assert_eq!(labels(&tree.resolve(child, Stage::OnSend).unwrap()), vec!["S"]);
        assert!(tree.resolve(ScopeId::ROOT, Stage::OnSend).unwrap().is_empty());
    }

    #[test]
    fn test_siblings_do_not_share_hooks() {
        let mut tree = ScopeTree::new();
        let left = tree.create_child(ScopeId::ROOT, ScopeOptions::named("left")).unwrap();
        let right = tree.create_child(ScopeId::ROOT, ScopeOptions::named("right")).unwrap();
        tree.add_hook(left, Stage::OnRequest, named("L")).unwrap();
        tree.add_hook(right, Stage::OnRequest, named("R")).unwrap();

        assert_eq!(labels(&tree.resolve(left, Stage::OnRequest).unwrap()), vec!["L"]);
        assert_eq!(labels(&tree.resolve(right, Stage::OnRequest).unwrap()), vec!["R"]);
    }

    #[test]
    fn test_resolve_is_idempotent() {
        let mut tree = ScopeTree::new();
        tree.add_hook(ScopeId::ROOT, Stage::OnRequest, named("A")).unwrap();

        let first = tree.resolve(ScopeId::ROOT, Stage::OnRequest).unwrap();
        let second = tree.resolve(ScopeId::ROOT, Stage::OnRequest).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(labels(&first), labels(&second));
    }

    #[test]
    fn test_resolution_seals_scope_and_ancestors() {
        let mut tree = ScopeTree::new();
        let child = tree.create_child(ScopeId::ROOT, ScopeOptions::named("child")).unwrap();
        let sibling = tree.create_child(ScopeId::ROOT, ScopeOptions::named("sibling")).unwrap();

        tree.resolve(child, Stage::OnRequest).unwrap();
        assert!(tree.is_sealed(child, Stage::OnRequest));
        assert!(tree.is_sealed(ScopeId::ROOT, Stage::OnRequest));
        assert!(!tree.is_sealed(sibling, Stage::OnRequest));
        assert!(!tree.is_sealed(child, Stage::PreHandler));

        let err = tree
            .add_hook(ScopeId::ROOT, Stage::OnRequest, named("late"))
            .unwrap_err();
        assert!(matches!(
            err,
            HookError::ScopeSealed { ref scope, stage: Stage::OnRequest } if scope == "root"
        ));

        // Other stages and unrelated scopes stay open
        tree.add_hook(ScopeId::ROOT, Stage::PreHandler, named("ok")).unwrap();
        tree.add_hook(sibling, Stage::OnRequest, named("ok")).unwrap();
    }

    #[test]
    fn test_add_hook_named() {
        let mut tree = ScopeTree::new();
        let scope = tree
            .add_hook_named(ScopeId::ROOT, "preValidation", named("v"))
            .unwrap();
        assert_eq!(scope, ScopeId::ROOT);

        let err = tree
            .add_hook_named(ScopeId::ROOT, "preValidate", named("v"))
            .unwrap_err();
        assert!(matches!(err, HookError::InvalidStage(_)));
    }

    #[test]
    fn test_unknown_scope() {
        let mut tree = ScopeTree::new();
        assert!(matches!(
            tree.create_child(ScopeId(9), ScopeOptions::default()),
            Err(HookError::UnknownScope(9))
        ));
        assert!(tree.resolve(ScopeId(9), Stage::OnRequest).is_err());
    }

    #[test]
    fn test_all_handlers_in_registration_order() {
        let mut tree = ScopeTree::new();
        let child = tree.create_child(ScopeId::ROOT, ScopeOptions::default()).unwrap();
        let ready = |name: &str| Hook::app(|_scope| async { Ok(()) }).named(name);

        tree.add_hook(child, Stage::OnReady, ready("first")).unwrap();
        tree.add_hook(ScopeId::ROOT, Stage::OnReady, ready("second")).unwrap();
        tree.add_hook(child, Stage::OnReady, ready("third")).unwrap();

        assert_eq!(
            labels(&tree.all_handlers(Stage::OnReady)),
            vec!["first", "second", "third"]
        );
    }

    #[test]
    fn test_decorators_inherit_downwards_only() {
        let mut tree = ScopeTree::new();
        let child = tree.create_child(ScopeId::ROOT, ScopeOptions::default()).unwrap();
        let sibling = tree.create_child(ScopeId::ROOT, ScopeOptions::default()).unwrap();

        tree.decorate(ScopeId::ROOT, "version", "1.2.3".to_string()).unwrap();
        tree.decorate(child, "db", 42u32).unwrap();

        assert_eq!(
            tree.decorator::<String>(child, "version").as_deref().map(String::as_str),
            Some("1.2.3")
        );
        assert_eq!(tree.decorator::<u32>(child, "db").as_deref(), Some(&42));
        assert!(!tree.has_decorator(sibling, "db"));
        assert!(!tree.has_decorator(ScopeId::ROOT, "db"));

        // Wrong type is not an error, just absent
        assert!(tree.decorator::<u64>(child, "db").is_none());

        let err = tree.decorate(child, "version", "2".to_string()).unwrap_err();
        assert!(matches!(err, HookError::DecoratorAlreadyPresent(_)));
    }

    #[test]
    fn test_prefixes_and_render() {
        let mut tree = ScopeTree::new();
        let api = tree
            .create_child(ScopeId::ROOT, ScopeOptions::named("api").with_prefix("/api"))
            .unwrap();
        let v1 = tree
            .create_child(api, ScopeOptions::named("v1").with_prefix("/v1"))
            .unwrap();
        tree.create_child(ScopeId::ROOT, ScopeOptions::named("static")).unwrap();
        tree.add_hook(v1, Stage::OnRequest, named("auth")).unwrap();

        assert_eq!(tree.full_prefix(v1).unwrap(), "/api/v1");
        assert_eq!(tree.lineage(v1).unwrap(), vec![ScopeId::ROOT, api, v1]);

        let rendered = tree.render();
        assert_eq!(
            rendered,
            "root\n├── api (prefix /api)\n│   └── v1 (prefix /v1, onRequest: 1)\n└── static\n"
        );
    }
}
