//! Handler registry
//!
//! Maps task names to async handlers. Each engine instance owns one; there
//! is no global registry.
//!
//! A name is either served by one handler, or keyed: several handlers share
//! the name and each row goes to the one registered for its payload
//! `task_key`.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::RwLock;

use super::config::ClaimScope;
use crate::persistence::{ClaimFilter, Task};

/// Handler execution result
///
/// The error's display text is recorded on the task row.
pub type HandlerResult = Result<serde_json::Value, anyhow::Error>;

/// Type-erased task handler
pub type TaskHandler = Arc<dyn Fn(Task) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

enum Route {
    Single(TaskHandler),
    Keyed(HashMap<String, TaskHandler>),
}

/// Where a claimed row should go
pub enum Resolved {
    /// Run this handler
    Handler(TaskHandler),

    /// The name is keyed but nothing here serves the row's `task_key`
    UnknownKey,

    /// Nothing is registered for the name
    Missing,
}

/// Registry of task handlers keyed by task name
pub struct HandlerRegistry {
    routes: RwLock<HashMap<String, Route>>,
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn boxed<F, Fut>(handler: F) -> TaskHandler
where
    F: Fn(Task) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    Arc::new(move |task| handler(task).boxed())
}

impl HandlerRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self {
            routes: RwLock::new(HashMap::new()),
        }
    }

    /// Register a handler, replacing anything previously registered for `name`
    pub fn register<F, Fut>(&self, name: impl Into<String>, handler: F)
    where
        F: Fn(Task) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.routes
            .write()
            .insert(name.into(), Route::Single(boxed(handler)));
    }

    /// Register a handler for rows named `name` whose payload `task_key` is `key`
    ///
    /// Other keys under the same name keep their handlers. A plain handler
    /// previously registered for `name` is replaced.
    pub fn register_keyed<F, Fut>(&self, name: impl Into<String>, key: impl Into<String>, handler: F)
    where
        F: Fn(Task) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let mut routes = self.routes.write();
        let route = routes
            .entry(name.into())
            .or_insert_with(|| Route::Keyed(HashMap::new()));
        if let Route::Single(_) = route {
            *route = Route::Keyed(HashMap::new());
        }
        if let Route::Keyed(handlers) = route {
            handlers.insert(key.into(), boxed(handler));
        }
    }

    /// Look up the plain handler for `name`
    pub fn get(&self, name: &str) -> Option<TaskHandler> {
        match self.routes.read().get(name) {
            Some(Route::Single(handler)) => Some(Arc::clone(handler)),
            _ => None,
        }
    }

    /// Pick the handler for a row by name, then by `task_key` for keyed names
    pub fn resolve(&self, task: &Task) -> Resolved {
        match self.routes.read().get(&task.name) {
            None => Resolved::Missing,
            Some(Route::Single(handler)) => Resolved::Handler(Arc::clone(handler)),
            Some(Route::Keyed(handlers)) => match task.task_key().and_then(|k| handlers.get(k)) {
                Some(handler) => Resolved::Handler(Arc::clone(handler)),
                None => Resolved::UnknownKey,
            },
        }
    }

    /// Check if anything is registered for `name`
    pub fn contains(&self, name: &str) -> bool {
        self.routes.read().contains_key(name)
    }

    /// Registered task names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.routes.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Keys served under a keyed `name`, sorted
    pub fn keys(&self, name: &str) -> Vec<String> {
        let mut keys: Vec<String> = match self.routes.read().get(name) {
            Some(Route::Keyed(handlers)) => handlers.keys().cloned().collect(),
            _ => Vec::new(),
        };
        keys.sort();
        keys
    }

    /// Rows this registry can serve under `scope`
    ///
    /// Keyed names are restricted to their keys in either scope.
    pub fn claim_filter(&self, scope: ClaimScope) -> ClaimFilter {
        let routes = self.routes.read();
        let mut filter = match scope {
            ClaimScope::All => ClaimFilter::all(),
            ClaimScope::Registered => ClaimFilter::default(),
        };

        for (name, route) in routes.iter() {
            match route {
                Route::Single(_) => {
                    if !filter.any_name {
                        filter.names.push(name.clone());
                    }
                }
                Route::Keyed(handlers) => {
                    for key in handlers.keys() {
                        filter.keyed.push((name.clone(), key.clone()));
                    }
                }
            }
        }

        filter.names.sort();
        filter.keyed.sort();
        filter
    }

    /// Get the number of registered names
    pub fn len(&self) -> usize {
        self.routes.read().len()
    }

    /// Check if registry is empty
    pub fn is_empty(&self) -> bool {
        self.routes.read().is_empty()
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("names", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use uuid::Uuid;

    use crate::persistence::TaskStatus;

    fn task(name: &str) -> Task {
        keyed_task(name, json!({ "n": 2 }))
    }

    fn keyed_task(name: &str, payload: serde_json::Value) -> Task {
        let now = Utc::now();
        Task {
            id: Uuid::now_v7(),
            name: name.to_string(),
            payload,
            status: TaskStatus::Processing,
            priority: 0,
            run_at: now,
            attempts: 1,
            max_attempts: 3,
            worker_id: Some("worker-test".to_string()),
            started_at: Some(now),
            completed_at: None,
            result: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn test_register_and_invoke() {
        let registry = HandlerRegistry::new();
        assert!(registry.is_empty());

        registry.register("double", |task: Task| async move {
            let n = task.payload["n"].as_i64().unwrap_or(0);
            Ok(json!(n * 2))
        });

        assert!(registry.contains("double"));
        assert_eq!(registry.len(), 1);

        let handler = registry.get("double").unwrap();
        assert_eq!(handler(task("double")).await.unwrap(), json!(4));
        assert!(registry.get("missing").is_none());
    }

    #[tokio::test]
    async fn test_register_replaces() {
        let registry = HandlerRegistry::new();
        registry.register("job", |_task: Task| async { Ok(json!("first")) });
        registry.register("job", |_task: Task| async { Ok(json!("second")) });

        assert_eq!(registry.len(), 1);
        let handler = registry.get("job").unwrap();
        assert_eq!(handler(task("job")).await.unwrap(), json!("second"));
    }

    #[test]
    fn test_names_sorted_and_debug() {
        let registry = HandlerRegistry::new();
        registry.register("b", |_task: Task| async { Ok(json!(null)) });
        registry.register("a", |_task: Task| async { Ok(json!(null)) });

        assert_eq!(registry.names(), vec!["a".to_string(), "b".to_string()]);
        assert!(format!("{:?}", registry).contains("HandlerRegistry"));
    }

    #[tokio::test]
    async fn test_keyed_handlers_share_a_name() {
        let registry = HandlerRegistry::new();
        registry.register_keyed("shared", "a", |_task: Task| async { Ok(json!("a")) });
        registry.register_keyed("shared", "b", |_task: Task| async { Ok(json!("b")) });

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.keys("shared"), vec!["a".to_string(), "b".to_string()]);
        assert!(registry.get("shared").is_none());

        let Resolved::Handler(handler) = registry.resolve(&keyed_task("shared", json!({ "task_key": "b" })))
        else {
            panic!("key b should resolve");
        };
        assert_eq!(handler(task("shared")).await.unwrap(), json!("b"));

        assert!(matches!(
            registry.resolve(&keyed_task("shared", json!({ "task_key": "c" }))),
            Resolved::UnknownKey
        ));
        assert!(matches!(
            registry.resolve(&keyed_task("shared", json!({}))),
            Resolved::UnknownKey
        ));
        assert!(matches!(registry.resolve(&task("missing")), Resolved::Missing));
    }

    #[test]
    fn test_claim_filter_by_scope() {
        let registry = HandlerRegistry::new();
        registry.register("plain", |_task: Task| async { Ok(json!(null)) });
        registry.register_keyed("shared", "b", |_task: Task| async { Ok(json!(null)) });
        registry.register_keyed("shared", "a", |_task: Task| async { Ok(json!(null)) });

        let filter = registry.claim_filter(ClaimScope::Registered);
        assert!(!filter.any_name);
        assert_eq!(filter.names, vec!["plain".to_string()]);
        assert_eq!(
            filter.keyed,
            vec![
                ("shared".to_string(), "a".to_string()),
                ("shared".to_string(), "b".to_string())
            ]
        );

        let filter = registry.claim_filter(ClaimScope::All);
        assert!(filter.any_name);
        assert!(filter.names.is_empty());
        assert_eq!(filter.keyed.len(), 2);

        assert!(HandlerRegistry::new()
            .claim_filter(ClaimScope::Registered)
            .is_empty());
    }

    #[tokio::test]
    async fn test_plain_register_replaces_keyed_route() {
        let registry = HandlerRegistry::new();
        registry.register_keyed("job", "a", |_task: Task| async { Ok(json!("keyed")) });
        registry.register("job", |_task: Task| async { Ok(json!("plain")) });

        assert!(registry.keys("job").is_empty());
        let handler = registry.get("job").unwrap();
        assert_eq!(handler(task("job")).await.unwrap(), json!("plain"));
    }
}
