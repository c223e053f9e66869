//! Service resolver: resolves one or several services from the container held by an
//! [`AppContext`].
//!
//! ```ignore
//! let clock = resolver.resolve::<(ManualClock,)>()?;                 // Arc<ManualClock>
//! let (settings, catalog) = resolver.resolve::<(ThrottleSettings, PolicyCatalog)>()?;
//! ```

use crate::app::AppContext;
use crate::container::{AnyArc, Container, RequestScope, ServiceKey};
use crate::error::{Error, ResolveError, Result};
use axum::http::request::Parts;
use std::sync::Arc;

/// A set of service types resolved together.
///
/// A one-element tuple yields the instance itself, larger tuples yield a tuple of instances in
/// the same order, and `()` is rejected as an empty request. Only a one-element set may name
/// an unsized service such as `dyn Clock`.
pub trait ServiceSet {
    type Output;

    const LEN: usize;

    fn resolve_in(
        container: &Container,
        scope: Option<&RequestScope>,
    ) -> Result<Self::Output, ResolveError>;
}

impl ServiceSet for () {
    type Output = ();

    const LEN: usize = 0;

    fn resolve_in(
        _container: &Container,
        _scope: Option<&RequestScope>,
    ) -> Result<Self::Output, ResolveError> {
        Ok(())
    }
}

impl<A: ?Sized + Send + Sync + 'static> ServiceSet for (A,) {
    type Output = Arc<A>;

    const LEN: usize = 1;

    fn resolve_in(
        container: &Container,
        scope: Option<&RequestScope>,
    ) -> Result<Self::Output, ResolveError> {
        container.get_scoped::<A>(scope)
    }
}

macro_rules! impl_service_set {
    ($len:literal; $($name:ident),+) => {
        impl<$($name: Send + Sync + 'static),+> ServiceSet for ($($name,)+) {
            type Output = ($(Arc<$name>,)+);

            const LEN: usize = $len;

            fn resolve_in(
                container: &Container,
                scope: Option<&RequestScope>,
            ) -> Result<Self::Output, ResolveError> {
                Ok(($(container.get_scoped::<$name>(scope)?,)+))
            }
        }
    };
}

impl_service_set!(2; A, B);
impl_service_set!(3; A, B, C);
impl_service_set!(4; A, B, C, D);
impl_service_set!(5; A, B, C, D, E);
impl_service_set!(6; A, B, C, D, E, F);

/// Result of a dynamic resolution.
#[derive(Debug, Clone)]
pub enum Resolved {
    One(AnyArc),
    Many(Vec<AnyArc>),
}

impl Resolved {
    pub fn len(&self) -> usize {
        match self {
            Resolved::One(_) => 1,
            Resolved::Many(all) => all.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone)]
pub struct Resolver {
    app: AppContext,
    scope: Option<RequestScope>,
}

impl Resolver {
    pub fn new(app: AppContext) -> Self {
        Self { app, scope: None }
    }

    /// Resolver bound to the request scope the route-context middleware attached to `request`.
    pub fn for_request(app: AppContext, request: &Parts) -> Self {
        Self {
            app,
            scope: request.extensions.get::<RequestScope>().cloned(),
        }
    }

    pub fn with_scope(mut self, scope: RequestScope) -> Self {
        self.scope = Some(scope);
        self
    }

    pub fn app(&self) -> &AppContext {
        &self.app
    }

    pub fn scope(&self) -> Option<&RequestScope> {
        self.scope.as_ref()
    }

    pub fn resolve<S: ServiceSet + ?Sized>(&self) -> Result<S::Output> {
        if S::LEN == 0 {
            return Err(empty_request());
        }
        let container = self.app.get_container()?;
        Ok(S::resolve_in(&container, self.scope.as_ref())?)
    }

    pub fn resolve_keys(&self, keys: &[ServiceKey]) -> Result<Resolved> {
        if keys.is_empty() {
            return Err(empty_request());
        }

        let container = self.app.get_container()?;
        let mut instances = keys
            .iter()
            .map(|key| container.get_any(key, self.scope.as_ref()))
            .collect::<Result<Vec<AnyArc>, ResolveError>>()?;
        if instances.len() == 1 {
            return Ok(Resolved::One(instances.remove(0)));
        }
        Ok(Resolved::Many(instances))
    }

    pub fn get<T: ?Sized + Send + Sync + 'static>(&self) -> Result<Arc<T>> {
        self.resolve::<(T,)>()
    }

    /// Like [`Resolver::get`], but a request-scoped service missing from the current scope
    /// yields `None`.
    pub fn try_resolve<T: ?Sized + Send + Sync + 'static>(&self) -> Result<Option<Arc<T>>> {
        let container = self.app.get_container()?;
        match container.get_scoped::<T>(self.scope.as_ref()) {
            Ok(instance) => Ok(Some(instance)),
            Err(ResolveError::NotInScope(_)) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}

fn empty_request() -> Error {
    Error::Invocation("service list must not be empty".to_string())
}
