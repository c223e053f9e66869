//! Controllers: types grouping routes under a common prefix.
//!
//! A controller is built per request from the route context and the resolver, then handed to
//! the endpoint as its receiver:
//!
//! ```ignore
//! struct Items { ctx: Arc<RouteContext>, store: Arc<dyn CounterStore> }
//!
//! impl Controller for Items {
//!     const PREFIX: &'static str = "/items";
//!
//!     fn routes(router: &mut ControllerRouter<Self>, app: &AppContext) -> Result<()> {
//!         router.get("/", "list_items", throttle(app, Handler::sync(Items::list))?);
//!         Ok(())
//!     }
//! }
//! ```

use crate::api::ApiInfo;
use crate::app::AppContext;
use crate::context::RouteContext;
use crate::error::{Error, Result};
use crate::resolver::Resolver;
use crate::throttling::decorator::{Handler, RequestSource, ThrottledHandler};
use axum::body::{Body, Bytes};
use axum::extract::Request;
use axum::http::header::CONTENT_LENGTH;
use axum::http::request::Parts;
use axum::http::Method;
use axum::response::{IntoResponse, Response};
use axum::routing::{on, MethodFilter, MethodRouter};
use axum::Router;
use serde::Serialize;
use http_body_util::LengthLimitError;
use std::any::{type_name, TypeId};
use std::collections::{BTreeMap, HashMap};
use std::error::Error as StdError;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::debug;

/// A value endpoints can be invoked on, built once per request.
pub trait Receiver: RequestSource + Send + Sized + 'static {
    fn receive(ctx: Arc<RouteContext>, services: &Resolver) -> Result<Self>;
}

impl Receiver for Arc<Parts> {
    fn receive(ctx: Arc<RouteContext>, _services: &Resolver) -> Result<Self> {
        Ok(Arc::clone(ctx.request()))
    }
}

pub trait Controller: Receiver + Sync {
    const PREFIX: &'static str;

    fn routes(router: &mut ControllerRouter<Self>, app: &AppContext) -> Result<()>;
}

/// A route target, guarded or not.
pub enum Endpoint<A, R> {
    Plain(Handler<A, Bytes, R>),
    Throttled(ThrottledHandler<A, Bytes, R>),
}

impl<A, R> Endpoint<A, R> {
    pub fn is_throttled(&self) -> bool {
        match self {
            Endpoint::Plain(_) => false,
            Endpoint::Throttled(handler) => handler.is_throttled(),
        }
    }
}

impl<A: RequestSource, R> Endpoint<A, R> {
    /// Run the endpoint. The body is read, up to `limit` bytes, only after the throttle
    /// policies admitted the request.
    pub async fn invoke(&self, receiver: A, body: Body, limit: usize) -> Result<R> {
        match self {
            Endpoint::Plain(handler) => {
                let body = read_body(body, limit).await?;
                Ok(handler.call(receiver, body).await)
            }
            Endpoint::Throttled(handler) => {
                handler
                    .dispatch_with(receiver, read_body(body, limit))
                    .await
            }
        }
    }
}

/// Anything a route can be registered with.
pub trait IntoEndpoint<A> {
    type Output;

    fn into_endpoint(self) -> Endpoint<A, Self::Output>;
}

impl<A, R> IntoEndpoint<A> for Endpoint<A, R> {
    type Output = R;

    fn into_endpoint(self) -> Endpoint<A, R> {
        self
    }
}

impl<A, R> IntoEndpoint<A> for Handler<A, Bytes, R> {
    type Output = R;

    fn into_endpoint(self) -> Endpoint<A, R> {
        Endpoint::Plain(self)
    }
}

impl<A, R> IntoEndpoint<A> for ThrottledHandler<A, Bytes, R> {
    type Output = R;

    fn into_endpoint(self) -> Endpoint<A, R> {
        Endpoint::Throttled(self)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RouteInfo {
    pub method: String,
    pub path: String,
    pub name: String,
    pub throttled: bool,
}

/// Collects a controller's routes before they are mounted.
pub struct ControllerRouter<C> {
    app: AppContext,
    prefix: String,
    paths: BTreeMap<String, MethodRouter>,
    routes: Vec<RouteInfo>,
    _controller: PhantomData<fn() -> C>,
}

impl<C: Receiver> ControllerRouter<C> {
    pub fn new(app: AppContext, prefix: &str) -> Self {
        Self {
            app,
            prefix: prefix.to_string(),
            paths: BTreeMap::new(),
            routes: Vec::new(),
            _controller: PhantomData,
        }
    }

    pub fn get<E>(&mut self, path: &str, name: &str, endpoint: E) -> Result<&mut Self>
    where
        E: IntoEndpoint<C>,
        E::Output: IntoResponse + Send + 'static,
    {
        self.route(Method::GET, path, name, endpoint)
    }

    pub fn post<E>(&mut self, path: &str, name: &str, endpoint: E) -> Result<&mut Self>
    where
        E: IntoEndpoint<C>,
        E::Output: IntoResponse + Send + 'static,
    {
        self.route(Method::POST, path, name, endpoint)
    }

    pub fn route<E>(
        &mut self,
        method: Method,
        path: &str,
        name: &str,
        endpoint: E,
    ) -> Result<&mut Self>
    where
        E: IntoEndpoint<C>,
        E::Output: IntoResponse + Send + 'static,
    {
        let filter = method_filter(&method)?;
        let endpoint: Arc<Endpoint<C, E::Output>> = Arc::new(endpoint.into_endpoint());
        let full_path = join_path(&self.prefix, path);

        self.routes.push(RouteInfo {
            method: method.to_string(),
            path: full_path.clone(),
            name: name.to_string(),
            throttled: endpoint.is_throttled(),
        });

        let app = self.app.clone();
        let handler = move |request: Request| {
            let app = app.clone();
            let endpoint = Arc::clone(&endpoint);
            async move { serve(app, endpoint, request).await }
        };

        let method_router = match self.paths.remove(&full_path) {
            Some(existing) => existing.on(filter, handler),
            None => on(filter, handler),
        };
        self.paths.insert(full_path, method_router);
        Ok(self)
    }

    pub fn routes(&self) -> &[RouteInfo] {
        &self.routes
    }

    pub fn build(self, controller: &'static str) -> BuiltRouter {
        let router = self
            .paths
            .into_iter()
            .fold(Router::new(), |router, (path, method_router)| {
                router.route(&path, method_router)
            });

        BuiltRouter {
            controller,
            prefix: self.prefix,
            router,
            routes: self.routes,
            api: None,
        }
    }
}

/// A controller's mounted route set.
#[derive(Debug)]
pub struct BuiltRouter {
    controller: &'static str,
    prefix: String,
    router: Router,
    routes: Vec<RouteInfo>,
    api: Option<ApiInfo>,
}

impl BuiltRouter {
    pub fn controller(&self) -> &'static str {
        self.controller
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn routes(&self) -> &[RouteInfo] {
        &self.routes
    }

    pub fn api(&self) -> Option<&ApiInfo> {
        self.api.as_ref()
    }

    pub fn set_api_instance(&mut self, api: &ApiInfo) {
        self.api = Some(api.clone());
    }

    pub(crate) fn into_router(self) -> Router {
        self.router
    }
}

/// Build the route set of `C`.
pub fn build_routers<C: Controller>(app: &AppContext) -> Result<BuiltRouter> {
    let mut router = ControllerRouter::<C>::new(app.clone(), C::PREFIX);
    C::routes(&mut router, app)?;
    Ok(router.build(short_type_name::<C>()))
}

async fn serve<C: Receiver, R: IntoResponse>(
    app: AppContext,
    endpoint: Arc<Endpoint<C, R>>,
    request: Request,
) -> Response {
    let (parts, body) = request.into_parts();
    match invoke(app, &endpoint, parts, body).await {
        Ok(value) => value.into_response(),
        Err(err) => err.into_response(),
    }
}

async fn invoke<C: Receiver, R>(
    app: AppContext,
    endpoint: &Endpoint<C, R>,
    parts: Parts,
    body: Body,
) -> Result<R> {
    let limit = app.body_limit();
    if declared_length(&parts).is_some_and(|length| length > limit as u64) {
        return Err(Error::PayloadTooLarge { limit });
    }

    let parts = Arc::new(parts);
    let resolver = Resolver::for_request(app, &parts);
    // Outside the route-context middleware the context lives only for this call.
    let ctx = match resolver.try_resolve::<RouteContext>()? {
        Some(ctx) => ctx,
        None => Arc::new(RouteContext::new(parts)),
    };

    let receiver = C::receive(ctx, &resolver)?;
    endpoint.invoke(receiver, body, limit).await
}

fn declared_length(parts: &Parts) -> Option<u64> {
    parts
        .headers
        .get(CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse().ok())
}

async fn read_body(body: Body, limit: usize) -> Result<Bytes> {
    axum::body::to_bytes(body, limit).await.map_err(|err| {
        if exceeds_limit(&err) {
            Error::PayloadTooLarge { limit }
        } else {
            Error::Invocation(format!("failed to read request body: {}", err))
        }
    })
}

fn exceeds_limit(err: &axum::Error) -> bool {
    let mut source: Option<&(dyn StdError + 'static)> = Some(err);
    while let Some(err) = source {
        if err.is::<LengthLimitError>() {
            return true;
        }
        source = err.source();
    }
    false
}

fn method_filter(method: &Method) -> Result<MethodFilter> {
    let filter = match *method {
        Method::GET => MethodFilter::GET,
        Method::POST => MethodFilter::POST,
        Method::PUT => MethodFilter::PUT,
        Method::PATCH => MethodFilter::PATCH,
        Method::DELETE => MethodFilter::DELETE,
        Method::HEAD => MethodFilter::HEAD,
        Method::OPTIONS => MethodFilter::OPTIONS,
        Method::TRACE => MethodFilter::TRACE,
        _ => {
            return Err(Error::Configuration(format!(
                "unsupported route method `{}`",
                method
            )))
        }
    };
    Ok(filter)
}

fn join_path(prefix: &str, path: &str) -> String {
    let prefix = prefix.trim_end_matches('/');
    let path = path.trim_start_matches('/');
    match (prefix.is_empty(), path.is_empty()) {
        (true, true) => "/".to_string(),
        (true, false) => format!("/{}", path),
        (false, true) => format!("/{}", prefix.trim_start_matches('/')),
        (false, false) => format!("/{}/{}", prefix.trim_start_matches('/'), path),
    }
}

pub(crate) fn short_type_name<T: ?Sized>() -> &'static str {
    let name = type_name::<T>();
    name.rsplit("::").next().unwrap_or(name)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationState {
    Unregistered,
    Registered,
}

/// Which controllers have already been mounted in this application.
#[derive(Debug, Default)]
pub struct ControllerRegistry {
    states: Mutex<HashMap<TypeId, RegistrationState>>,
}

impl ControllerRegistry {
    pub fn state(&self, controller: TypeId) -> RegistrationState {
        self.states
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&controller)
            .copied()
            .unwrap_or(RegistrationState::Unregistered)
    }

    pub fn is_registered(&self, controller: TypeId) -> bool {
        self.state(controller) == RegistrationState::Registered
    }

    pub fn mark_registered(&self, controller: TypeId) {
        debug!(?controller, "controller marked registered");
        self.states
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(controller, RegistrationState::Registered);
    }
}
