use futures_util::future::BoxFuture;
use meshact_common::{ActionError, Pattern};
use parking_lot::RwLock;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;

use crate::act::Act;

/// An action handler.
///
/// Any `Fn(Act) -> impl Future<Output = Result<Value, ActionError>>` is a
/// handler.
pub trait Handler: Send + Sync + 'static {
    fn call(&self, act: Act) -> BoxFuture<'static, Result<Value, ActionError>>;
}

impl<F, Fut> Handler for F
where
    F: Fn(Act) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, ActionError>> + Send + 'static,
{
    fn call(&self, act: Act) -> BoxFuture<'static, Result<Value, ActionError>> {
        Box::pin(self(act))
    }
}

/// A handler found for a call, with the pattern it was registered under.
#[derive(Clone)]
pub struct Resolved {
    pub pattern: Pattern,
    pub handler: Arc<dyn Handler>,
}

/// Where a node looks up its local actions.
pub trait ActionRegistry: Send + Sync {
    /// Finds the handler for a call pattern.
    fn resolve(&self, pattern: &Pattern) -> Option<Resolved>;

    fn register(&self, pattern: Pattern, handler: Arc<dyn Handler>);
}

struct Entry {
    pattern: Pattern,
    handler: Arc<dyn Handler>,
    seq: u64,
}

/// In-memory registry.
///
/// An action matches a call when every key of its pattern is present in
/// the call with the same value. Among matching actions the one with the
/// most keys wins, then the most recently added.
#[derive(Default)]
pub struct MemoryRegistry {
    entries: RwLock<Vec<Entry>>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl ActionRegistry for MemoryRegistry {
    fn resolve(&self, pattern: &Pattern) -> Option<Resolved> {
        self.entries
            .read()
            .iter()
            .filter(|entry| entry.pattern.is_subset_of(pattern))
            .max_by_key(|entry| (entry.pattern.len(), entry.seq))
            .map(|entry| Resolved {
                pattern: entry.pattern.clone(),
                handler: entry.handler.clone(),
            })
    }

    fn register(&self, pattern: Pattern, handler: Arc<dyn Handler>) {
        let mut entries = self.entries.write();
        let seq = entries.len() as u64 + 1;
        entries.push(Entry { pattern, handler, seq });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Node;
    use meshact_common::{Args, Meta};
    use serde_json::json;

    fn constant(value: &'static str) -> Arc<dyn Handler> {
        Arc::new(move |_act: Act| async move { Ok::<_, ActionError>(json!(value)) })
    }

    fn resolved_pattern(registry: &MemoryRegistry, text: &str) -> Option<String> {
        registry
            .resolve(&Pattern::parse(text).unwrap())
            .map(|r| r.pattern.to_string())
    }

    #[test]
    fn test_most_specific_wins() {
        let registry = MemoryRegistry::new();
        registry.register(Pattern::parse("a:1").unwrap(), constant("one"));
        registry.register(Pattern::parse("a:1,b:2").unwrap(), constant("two"));

        assert_eq!(resolved_pattern(&registry, "a:1,b:2,c:3").as_deref(), Some("a:1,b:2"));
        assert_eq!(resolved_pattern(&registry, "a:1,b:3").as_deref(), Some("a:1"));
        assert_eq!(resolved_pattern(&registry, "b:2"), None);
    }

    #[tokio::test]
    async fn test_latest_registration_wins_ties() {
        let registry = MemoryRegistry::new();
        registry.register(Pattern::parse("a:1").unwrap(), constant("old"));
        registry.register(Pattern::parse("a:1").unwrap(), constant("new"));
        assert_eq!(registry.len(), 2);

        let node = Node::builder().build().unwrap();
        let resolved = registry.resolve(&Pattern::parse("a:1").unwrap()).unwrap();
        let act = Act::new(
            node.inner.clone(),
            Pattern::parse("a:1").unwrap(),
            Args::new(),
            Meta::new("m1/test", "tx1"),
        );
        assert_eq!(resolved.handler.call(act).await.unwrap(), json!("new"));
    }

    #[test]
    fn test_values_compare_as_text() {
        let registry = MemoryRegistry::new();
        registry.register(Pattern::parse("role:x,n:1").unwrap(), constant("x"));
        let mut call = Pattern::new();
        call.insert("role", json!("x")).unwrap();
        call.insert("n", json!("1")).unwrap();
        assert!(registry.resolve(&call).is_some());
    }
}
