use crate::context::ResponseMeta;
use crate::error::{Error, Result};
use crate::resolver::Resolver;
use crate::throttling::rate::{AnonRateThrottle, DynamicRateThrottle, UserRateThrottle};
use crate::user::User;
use axum::extract::ConnectInfo;
use axum::http::request::Parts;
use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

/// Keyword configuration forwarded verbatim from a decoration site to every policy.
pub type PolicyOptions = serde_json::Map<String, serde_json::Value>;

/// Everything a policy is constructed from.
pub struct PolicyInit<'a> {
    pub user: &'a User,
    /// Response already recorded on the route context, if any.
    pub response: Option<&'a ResponseMeta>,
    pub options: &'a PolicyOptions,
    pub services: &'a Resolver,
}

/// A rate-limiting rule, built fresh for every check.
pub trait ThrottlePolicy: Send {
    /// Whether the request may proceed. Policies may record the request in their store.
    fn allow_request(&mut self, request: &Parts) -> bool;

    /// After a denial, how long the client should wait before retrying, if known.
    fn wait(&self) -> Option<Duration>;
}

/// A policy type constructible from a [`PolicyInit`].
pub trait PolicyType: ThrottlePolicy + Sized + 'static {
    const NAME: &'static str;

    fn new(init: PolicyInit<'_>) -> Result<Self>;
}

type BuildFn = Arc<dyn Fn(PolicyInit<'_>) -> Result<Box<dyn ThrottlePolicy>> + Send + Sync>;

/// Constructor handle for a policy, the unit of a throttle classes list.
#[derive(Clone)]
pub struct PolicyClass {
    name: &'static str,
    build: BuildFn,
}

impl PolicyClass {
    pub fn of<P: PolicyType>() -> Self {
        Self {
            name: P::NAME,
            build: Arc::new(build_policy::<P>),
        }
    }

    pub fn from_fn<F>(name: &'static str, build: F) -> Self
    where
        F: Fn(PolicyInit<'_>) -> Result<Box<dyn ThrottlePolicy>> + Send + Sync + 'static,
    {
        Self {
            name,
            build: Arc::new(build),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn build(&self, init: PolicyInit<'_>) -> Result<Box<dyn ThrottlePolicy>> {
        (self.build)(init)
    }
}

fn build_policy<P: PolicyType>(init: PolicyInit<'_>) -> Result<Box<dyn ThrottlePolicy>> {
    Ok(Box::new(P::new(init)?))
}

impl fmt::Debug for PolicyClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PolicyClass").field(&self.name).finish()
    }
}

/// Named policies `THROTTLE_CLASSES` can refer to.
#[derive(Debug, Clone, Default)]
pub struct PolicyCatalog {
    classes: BTreeMap<String, PolicyClass>,
}

impl PolicyCatalog {
    pub fn with_builtins() -> Self {
        let mut catalog = Self::default();
        catalog.register(AnonRateThrottle::NAME, PolicyClass::of::<AnonRateThrottle>());
        catalog.register(UserRateThrottle::NAME, PolicyClass::of::<UserRateThrottle>());
        catalog.register(
            DynamicRateThrottle::NAME,
            PolicyClass::of::<DynamicRateThrottle>(),
        );
        catalog
    }

    pub fn register(&mut self, name: &str, class: PolicyClass) {
        self.classes.insert(name.to_string(), class);
    }

    pub fn get(&self, name: &str) -> Result<PolicyClass> {
        self.classes.get(name).cloned().ok_or_else(|| {
            Error::Configuration(format!("unknown throttle class `{}`", name))
        })
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.classes.keys().map(String::as_str)
    }
}

/// Identify the client: `X-Forwarded-For` interpreted through `num_proxies`, falling back to
/// the peer address.
pub fn get_ident(request: &Parts, num_proxies: Option<u32>) -> String {
    let remote_addr = remote_addr(request);
    let xff = request
        .headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok());

    match (xff, num_proxies) {
        (Some(xff), Some(proxies)) if proxies > 0 => {
            let addrs: Vec<&str> = xff.split(',').collect();
            let from_right = (proxies as usize).min(addrs.len());
            addrs[addrs.len() - from_right].trim().to_string()
        }
        (Some(xff), None) => xff.split_whitespace().collect(),
        _ => remote_addr,
    }
}

/// Peer address of the connection. Client-supplied headers never count here.
fn remote_addr(request: &Parts) -> String {
    if let Some(ConnectInfo(addr)) = request.extensions.get::<ConnectInfo<SocketAddr>>() {
        return addr.ip().to_string();
    }
    if let Some(addr) = request.extensions.get::<SocketAddr>() {
        return addr.ip().to_string();
    }
    "unknown".to_string()
}
