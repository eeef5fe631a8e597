//! Method registry: named handlers the dispatcher and HTTP adapter invoke.
//!
//! A handler is a capability `(args, dicts) -> Result<result, error>`; any
//! argument validation or coercion belongs inside the handler closure, built
//! at registration time. RPC names are looked up verbatim; GET/POST names map
//! dotted segments to lowercase slash paths (`admin.stats` → `/admin/stats`).

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde_json::{Map, Value};

pub type Args = Vec<Value>;
pub type Dicts = Map<String, Value>;

/// `Ok(result)` or `Err(message)`; the dispatcher maps the error message into
/// a failed response body.
pub type HandlerResult = Result<Value, String>;

type Handler = Arc<dyn Fn(Args, Dicts) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

/// One registered method.
pub struct Method {
    name: String,
    handler: Handler,
    use_worker: bool,
}

impl Method {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn use_worker(&self) -> bool {
        self.use_worker
    }

    /// Invoke the handler. The returned future owns its state, so it can be
    /// shipped to a worker.
    pub fn call(&self, args: Args, dicts: Dicts) -> BoxFuture<'static, HandlerResult> {
        (self.handler)(args, dicts)
    }
}

impl std::fmt::Debug for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Method")
            .field("name", &self.name)
            .field("use_worker", &self.use_worker)
            .finish_non_exhaustive()
    }
}

/// Immutable lookup tables built by [`RegistryBuilder`].
#[derive(Debug, Default)]
pub struct MethodRegistry {
    rpc: HashMap<String, Arc<Method>>,
    get: HashMap<String, Arc<Method>>,
    post: HashMap<String, Arc<Method>>,
}

impl MethodRegistry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    pub fn rpc_method(&self, name: &str) -> Option<&Arc<Method>> {
        self.rpc.get(name)
    }

    pub fn get_route(&self, path: &str) -> Option<&Arc<Method>> {
        self.get.get(path)
    }

    pub fn post_route(&self, path: &str) -> Option<&Arc<Method>> {
        self.post.get(path)
    }

    pub fn rpc_count(&self) -> usize {
        self.rpc.len()
    }
}

/// Construction-time registration surface.
#[derive(Default)]
pub struct RegistryBuilder {
    registry: MethodRegistry,
}

impl RegistryBuilder {
    /// Register an rpc method. The name must start with a letter.
    pub fn rpc<F, Fut>(self, name: &str, handler: F) -> Self
    where
        F: Fn(Args, Dicts) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = HandlerResult> + Send + 'static,
    {
        self.insert_rpc(name, handler, false)
    }

    /// Register an rpc method that runs on the worker pool.
    pub fn rpc_on_worker<F, Fut>(self, name: &str, handler: F) -> Self
    where
        F: Fn(Args, Dicts) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = HandlerResult> + Send + 'static,
    {
        self.insert_rpc(name, handler, true)
    }

    /// Register a GET route by dotted name or path.
    pub fn get<F, Fut>(mut self, name: &str, handler: F) -> Self
    where
        F: Fn(Args, Dicts) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = HandlerResult> + Send + 'static,
    {
        let path = route_path(name);
        self.registry
            .get
            .insert(path.clone(), Arc::new(make_method(path, handler, false)));
        self
    }

    /// Register a POST route by dotted name or path.
    pub fn post<F, Fut>(mut self, name: &str, handler: F) -> Self
    where
        F: Fn(Args, Dicts) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = HandlerResult> + Send + 'static,
    {
        let path = route_path(name);
        self.registry
            .post
            .insert(path.clone(), Arc::new(make_method(path, handler, false)));
        self
    }

    pub fn build(self) -> MethodRegistry {
        self.registry
    }

    fn insert_rpc<F, Fut>(mut self, name: &str, handler: F, use_worker: bool) -> Self
    where
        F: Fn(Args, Dicts) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = HandlerResult> + Send + 'static,
    {
        assert!(
            name.chars().next().is_some_and(char::is_alphabetic),
            "rpc name {name:?} must start with a letter"
        );
        self.registry.rpc.insert(
            name.to_owned(),
            Arc::new(make_method(name.to_owned(), handler, use_worker)),
        );
        self
    }
}

fn make_method<F, Fut>(name: String, handler: F, use_worker: bool) -> Method
where
    F: Fn(Args, Dicts) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = HandlerResult> + Send + 'static,
{
    Method {
        name,
        handler: Arc::new(move |args, dicts| Box::pin(handler(args, dicts))),
        use_worker,
    }
}

/// Dotted names become lowercase slash-separated paths with a leading slash.
fn route_path(name: &str) -> String {
    let path = name.to_lowercase().replace('.', "/");
    if path.starts_with('/') {
        path
    } else {
        format!("/{path}")
    }
}

/// Pull a named argument out of `dicts`, deserializing into the handler's
/// parameter type.
pub fn param<T: serde::de::DeserializeOwned>(dicts: &Dicts, name: &str) -> Result<T, String> {
    let value = dicts
        .get(name)
        .ok_or_else(|| format!("missing argument \"{name}\""))?;
    serde_json::from_value(value.clone())
        .map_err(|e| format!("argument \"{name}\" has the wrong type: {e}"))
}
