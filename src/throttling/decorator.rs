//! Throttle enforcement around handlers.
//!
//! ```ignore
//! let guarded = throttle(&app, Handler::sync(list_items))?;
//! let burst = throttle_with(vec![PolicyClass::of::<DynamicRateThrottle>()], PolicyOptions::new())
//!     .option("scope", "burst")
//!     .apply(&app, Handler::asynchronous(upload))?;
//! ```
//!
//! Both wrappers run the same check. They differ only in how the acting user is found: the
//! synchronous one reads it off the request, the asynchronous one runs the bound
//! [`UserLookup`] on the blocking pool and waits for it before anything else happens. The
//! asynchronous check stays on the blocking pool for the policies too, since a counter store
//! may do network I/O.

use crate::app::AppContext;
use crate::context::{ResponseMeta, RouteContext};
use crate::error::{Error, Result, Throttled};
use crate::resolver::Resolver;
use crate::throttling::policy::{PolicyClass, PolicyInit, PolicyOptions};
use crate::user::{User, UserLookup};
use axum::http::request::Parts;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tracing::debug;

pub type HandlerFuture<R> = Pin<Box<dyn Future<Output = R> + Send>>;

type SyncFn<A, X, R> = dyn Fn(A, X) -> R + Send + Sync;
type AsyncFn<A, X, R> = dyn Fn(A, X) -> HandlerFuture<R> + Send + Sync;

/// A route handler taking its receiver `A` and remaining arguments `X`.
pub enum Handler<A, X, R> {
    Sync(Arc<SyncFn<A, X, R>>),
    Async(Arc<AsyncFn<A, X, R>>),
}

impl<A, X, R> Handler<A, X, R> {
    pub fn sync<F>(f: F) -> Self
    where
        F: Fn(A, X) -> R + Send + Sync + 'static,
    {
        Handler::Sync(Arc::new(f))
    }

    pub fn asynchronous<F, Fut>(f: F) -> Self
    where
        F: Fn(A, X) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = R> + Send + 'static,
    {
        Handler::Async(Arc::new(move |receiver, extra| -> HandlerFuture<R> {
            Box::pin(f(receiver, extra))
        }))
    }

    pub fn is_async(&self) -> bool {
        matches!(self, Handler::Async(_))
    }

    pub async fn call(&self, receiver: A, extra: X) -> R {
        match self {
            Handler::Sync(f) => f(receiver, extra),
            Handler::Async(f) => f(receiver, extra).await,
        }
    }
}

impl<A, X, R> Clone for Handler<A, X, R> {
    fn clone(&self) -> Self {
        match self {
            Handler::Sync(f) => Handler::Sync(Arc::clone(f)),
            Handler::Async(f) => Handler::Async(Arc::clone(f)),
        }
    }
}

impl<A, X, R> fmt::Debug for Handler<A, X, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(if self.is_async() {
            "Handler::Async"
        } else {
            "Handler::Sync"
        })
    }
}

/// What a handler receiver carries the request through.
pub enum Source<'a> {
    Request(&'a Arc<Parts>),
    Controller(&'a RouteContext),
}

/// Receivers a throttled handler can be called with: the bare request or a controller
/// instance holding the route context.
pub trait RequestSource {
    fn source(&self) -> Source<'_>;

    fn request(&self) -> &Arc<Parts> {
        match self.source() {
            Source::Request(request) => request,
            Source::Controller(ctx) => ctx.request(),
        }
    }
}

impl RequestSource for Arc<Parts> {
    fn source(&self) -> Source<'_> {
        Source::Request(self)
    }
}

/// Parameterized throttle: explicit policies plus options forwarded to each of them.
#[derive(Debug, Clone, Default)]
pub struct Throttle {
    policies: Vec<PolicyClass>,
    options: PolicyOptions,
}

pub fn throttle_with(policies: Vec<PolicyClass>, options: PolicyOptions) -> Throttle {
    Throttle { policies, options }
}

/// Guard `handler` with the configured default policies.
pub fn throttle<A, X, R>(
    app: &AppContext,
    handler: Handler<A, X, R>,
) -> Result<ThrottledHandler<A, X, R>> {
    Throttle::default().apply(app, handler)
}

impl Throttle {
    pub fn policy(mut self, class: PolicyClass) -> Self {
        self.policies.push(class);
        self
    }

    pub fn option(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.options.insert(key.to_string(), value.into());
        self
    }

    /// An empty policy list picks up the defaults at this point, not per request.
    pub fn apply<A, X, R>(
        self,
        app: &AppContext,
        handler: Handler<A, X, R>,
    ) -> Result<ThrottledHandler<A, X, R>> {
        let policies = if self.policies.is_empty() {
            app.default_throttle_classes()?
        } else {
            self.policies
        };

        debug!(
            policies = ?policies.iter().map(PolicyClass::name).collect::<Vec<_>>(),
            is_async = handler.is_async(),
            "throttle guard attached"
        );

        Ok(ThrottledHandler {
            guard: Arc::new(Guard {
                app: app.clone(),
                policies,
                options: self.options,
            }),
            handler,
        })
    }
}

struct Guard {
    app: AppContext,
    policies: Vec<PolicyClass>,
    options: PolicyOptions,
}

impl Guard {
    fn check(&self, request: &Arc<Parts>, user: &User) -> Result<()> {
        let resolver = Resolver::for_request(self.app.clone(), request);
        let response = resolver
            .try_resolve::<RouteContext>()?
            .and_then(|ctx| ctx.response());

        run_throttles(
            &self.policies,
            request,
            response.as_ref(),
            user,
            &self.options,
            &resolver,
        )
    }

    /// Look the user up, then run the policies, all on the blocking pool.
    async fn check_blocking(self: Arc<Self>, request: Arc<Parts>) -> Result<()> {
        let lookup = self.app.resolver().get::<dyn UserLookup>()?;
        tokio::task::spawn_blocking(move || {
            let user = lookup.get_user(&request);
            self.check(&request, &user)
        })
        .await
        .map_err(|err| Error::Invocation(format!("throttle check did not complete: {}", err)))?
    }
}

/// A handler guarded by throttle policies.
pub struct ThrottledHandler<A, X, R> {
    guard: Arc<Guard>,
    handler: Handler<A, X, R>,
}

impl<A, X, R> ThrottledHandler<A, X, R> {
    pub fn is_async(&self) -> bool {
        self.handler.is_async()
    }

    pub fn is_throttled(&self) -> bool {
        true
    }

    pub fn policies(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.guard.policies.iter().map(PolicyClass::name)
    }
}

impl<A: RequestSource, X, R> ThrottledHandler<A, X, R> {
    /// Check the policies, then run the handler with the original arguments.
    pub async fn dispatch(&self, receiver: A, extra: X) -> Result<R> {
        self.dispatch_with(receiver, async move { Ok::<X, Error>(extra) })
            .await
    }

    /// Like [`ThrottledHandler::dispatch`], but `extra` is only awaited once the request has
    /// been admitted. Route adapters read the request body this way.
    pub async fn dispatch_with<F>(&self, receiver: A, extra: F) -> Result<R>
    where
        F: Future<Output = Result<X>>,
    {
        let request = Arc::clone(receiver.request());
        match &self.handler {
            Handler::Sync(f) => {
                let user = User::from_request(&request);
                self.guard.check(&request, &user)?;
                Ok(f(receiver, extra.await?))
            }
            Handler::Async(f) => {
                Arc::clone(&self.guard).check_blocking(request).await?;
                Ok(f(receiver, extra.await?).await)
            }
        }
    }

    /// Run a synchronous handler outside of any runtime.
    pub fn call(&self, receiver: A, extra: X) -> Result<R> {
        let Handler::Sync(f) = &self.handler else {
            return Err(Error::Invocation(
                "asynchronous handlers must be dispatched".to_string(),
            ));
        };
        let request = Arc::clone(receiver.request());
        self.guard.check(&request, &User::from_request(&request))?;
        Ok(f(receiver, extra))
    }
}

impl<A, X, R> Clone for ThrottledHandler<A, X, R> {
    fn clone(&self) -> Self {
        Self {
            guard: Arc::clone(&self.guard),
            handler: self.handler.clone(),
        }
    }
}

impl<A, X, R> fmt::Debug for ThrottledHandler<A, X, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThrottledHandler")
            .field("handler", &self.handler)
            .field("policies", &self.policies().collect::<Vec<_>>())
            .finish()
    }
}

/// Run every policy against the request; reject with the longest wait if any of them denies.
pub fn run_throttles(
    policies: &[PolicyClass],
    request: &Parts,
    response: Option<&ResponseMeta>,
    user: &User,
    options: &PolicyOptions,
    services: &Resolver,
) -> Result<()> {
    let mut denied = false;
    let mut waits = Vec::new();

    for class in policies {
        let mut policy = class.build(PolicyInit {
            user,
            response,
            options,
            services,
        })?;
        if !policy.allow_request(request) {
            denied = true;
            let wait = policy.wait();
            debug!(policy = class.name(), ?wait, "request denied by throttle policy");
            waits.extend(wait);
        }
    }

    if denied {
        return Err(Throttled::new(waits.into_iter().max()).into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ThrottleSettings;
    use crate::throttling::policy::ThrottlePolicy;
    use axum::http::Request;
    use serde_json::Value;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    struct Fixed {
        allow: bool,
        wait: Option<Duration>,
    }

    impl ThrottlePolicy for Fixed {
        fn allow_request(&mut self, _request: &Parts) -> bool {
            self.allow
        }

        fn wait(&self) -> Option<Duration> {
            self.wait
        }
    }

    fn fixed(name: &'static str, allow: bool, wait: Option<u64>) -> PolicyClass {
        PolicyClass::from_fn(name, move |_| {
            Ok(Box::new(Fixed {
                allow,
                wait: wait.map(Duration::from_secs),
            }))
        })
    }

    fn app() -> AppContext {
        AppContext::install(ThrottleSettings::default()).unwrap()
    }

    fn request() -> Arc<Parts> {
        let (parts, _) = Request::builder().uri("/items").body(()).unwrap().into_parts();
        Arc::new(parts)
    }

    fn counting_handler(calls: Arc<AtomicUsize>) -> Handler<Arc<Parts>, u32, u32> {
        Handler::sync(move |_request, value| {
            calls.fetch_add(1, Ordering::SeqCst);
            value * 2
        })
    }

    #[tokio::test]
    async fn test_longest_wait_wins() {
        let calls = Arc::new(AtomicUsize::new(0));
        let guarded = throttle_with(
            vec![fixed("p1", false, Some(5)), fixed("p2", false, Some(12))],
            PolicyOptions::new(),
        )
        .apply(&app(), counting_handler(calls.clone()))
        .unwrap();

        let err = guarded.dispatch(request(), 1).await.unwrap_err();
        match err {
            Error::Throttled(throttled) => {
                assert_eq!(throttled.wait, Some(Duration::from_secs(12)))
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_denial_without_wait_rejects_without_duration() {
        let calls = Arc::new(AtomicUsize::new(0));
        let guarded = throttle_with(
            vec![fixed("p1", false, None), fixed("p2", true, None)],
            PolicyOptions::new(),
        )
        .apply(&app(), counting_handler(calls.clone()))
        .unwrap();

        let err = guarded.dispatch(request(), 1).await.unwrap_err();
        assert!(matches!(err, Error::Throttled(Throttled { wait: None })));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_admitted_request_runs_handler_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let guarded = throttle_with(
            vec![fixed("p1", true, None), fixed("p2", true, Some(3))],
            PolicyOptions::new(),
        )
        .apply(&app(), counting_handler(calls.clone()))
        .unwrap();

        assert!(guarded.is_throttled());
        assert!(!guarded.is_async());
        assert_eq!(guarded.dispatch(request(), 21).await.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_denied_request_never_produces_arguments() {
        let produced = Arc::new(AtomicBool::new(false));
        let guarded = throttle_with(vec![fixed("p", false, Some(1))], PolicyOptions::new())
            .apply(&app(), counting_handler(Arc::new(AtomicUsize::new(0))))
            .unwrap();

        let flag = produced.clone();
        let err = guarded
            .dispatch_with(request(), async move {
                flag.store(true, Ordering::SeqCst);
                Ok::<u32, Error>(1)
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Throttled(_)));
        assert!(!produced.load(Ordering::SeqCst));

        let failing = throttle_with(vec![fixed("p", true, None)], PolicyOptions::new())
            .apply(&app(), counting_handler(Arc::new(AtomicUsize::new(0))))
            .unwrap();
        let err = failing
            .dispatch_with(request(), async { Err::<u32, Error>(Error::PayloadTooLarge { limit: 4 }) })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PayloadTooLarge { limit: 4 }));
    }

    #[test]
    fn test_sync_call_outside_runtime() {
        let calls = Arc::new(AtomicUsize::new(0));
        let guarded = throttle_with(vec![fixed("p", true, None)], PolicyOptions::new())
            .apply(&app(), counting_handler(calls.clone()))
            .unwrap();
        assert_eq!(guarded.call(request(), 4).unwrap(), 8);

        let asynchronous = throttle_with(vec![fixed("p", true, None)], PolicyOptions::new())
            .apply(
                &app(),
                Handler::asynchronous(|_request: Arc<Parts>, value: u32| async move { value }),
            )
            .unwrap();
        assert!(matches!(
            asynchronous.call(request(), 1),
            Err(Error::Invocation(_))
        ));
    }

    struct SlowLookup {
        done: Arc<AtomicBool>,
    }

    impl UserLookup for SlowLookup {
        fn get_user(&self, _request: &Parts) -> User {
            std::thread::sleep(Duration::from_millis(50));
            self.done.store(true, Ordering::SeqCst);
            User::authenticated("slow")
        }
    }

    #[tokio::test]
    async fn test_async_handler_waits_for_user_lookup() {
        let done = Arc::new(AtomicBool::new(false));
        let app = AppContext::builder(ThrottleSettings::default())
            .user_lookup(Arc::new(SlowLookup { done: done.clone() }))
            .build()
            .unwrap();

        let seen_users = Arc::new(Mutex::new(Vec::new()));
        let recorder = {
            let seen_users = seen_users.clone();
            PolicyClass::from_fn("recorder", move |init| {
                seen_users.lock().unwrap().push(init.user.clone());
                Ok(Box::new(Fixed {
                    allow: true,
                    wait: None,
                }))
            })
        };

        let observed = done.clone();
        let guarded = throttle_with(vec![recorder], PolicyOptions::new())
            .apply(
                &app,
                Handler::asynchronous(move |_request: Arc<Parts>, _: ()| {
                    let observed = observed.clone();
                    async move { observed.load(Ordering::SeqCst) }
                }),
            )
            .unwrap();

        assert!(guarded.is_async());
        assert!(guarded.dispatch(request(), ()).await.unwrap());
        assert_eq!(
            *seen_users.lock().unwrap(),
            vec![User::authenticated("slow")]
        );
    }

    #[tokio::test]
    async fn test_options_reach_every_policy() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let recorder = |name: &'static str| {
            let seen = seen.clone();
            PolicyClass::from_fn(name, move |init| {
                seen.lock()
                    .unwrap()
                    .push((name, init.options.get("scope").cloned()));
                Ok(Box::new(Fixed {
                    allow: true,
                    wait: None,
                }))
            })
        };

        let guarded = throttle_with(vec![recorder("a"), recorder("b")], PolicyOptions::new())
            .option("scope", "uploads")
            .apply(&app(), Handler::sync(|_request: Arc<Parts>, _: ()| ()))
            .unwrap();
        guarded.dispatch(request(), ()).await.unwrap();

        let scope = Some(Value::from("uploads"));
        assert_eq!(
            *seen.lock().unwrap(),
            vec![("a", scope.clone()), ("b", scope)]
        );
    }

    #[tokio::test]
    async fn test_bare_throttle_uses_configured_defaults() {
        let settings = ThrottleSettings::default()
            .with_classes(&["user"])
            .with_rate("user", Some("1/min"));
        let app = AppContext::install(settings).unwrap();
        let guarded = throttle(&app, Handler::sync(|_request: Arc<Parts>, _: ()| "ok")).unwrap();
        assert_eq!(guarded.policies().collect::<Vec<_>>(), vec!["user"]);

        let mut parts = Request::builder().body(()).unwrap().into_parts().0;
        parts.extensions.insert(User::authenticated("42"));
        let request = Arc::new(parts);

        assert_eq!(guarded.dispatch(request.clone(), ()).await.unwrap(), "ok");
        let err = guarded.dispatch(request, ()).await.unwrap_err();
        assert!(matches!(err, Error::Throttled(Throttled { wait: Some(_) })));
    }

    #[tokio::test]
    async fn test_controller_receiver_is_normalized() {
        struct Receiver {
            ctx: Arc<RouteContext>,
        }

        impl RequestSource for Receiver {
            fn source(&self) -> Source<'_> {
                Source::Controller(&self.ctx)
            }
        }

        let seen_paths = Arc::new(Mutex::new(Vec::new()));
        let policy = {
            let seen_paths = seen_paths.clone();
            PolicyClass::from_fn("paths", move |_| {
                struct Paths(Arc<Mutex<Vec<String>>>);
                impl ThrottlePolicy for Paths {
                    fn allow_request(&mut self, request: &Parts) -> bool {
                        self.0.lock().unwrap().push(request.uri.path().to_string());
                        true
                    }
                    fn wait(&self) -> Option<Duration> {
                        None
                    }
                }
                Ok(Box::new(Paths(seen_paths.clone())))
            })
        };

        let guarded = throttle_with(vec![policy], PolicyOptions::new())
            .apply(&app(), Handler::sync(|_receiver: Receiver, _: ()| ()))
            .unwrap();
        let receiver = Receiver {
            ctx: Arc::new(RouteContext::new(request())),
        };
        guarded.dispatch(receiver, ()).await.unwrap();
        assert_eq!(*seen_paths.lock().unwrap(), vec!["/items".to_string()]);
    }
}
