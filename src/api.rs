//! Api assembly: controller registration, injector modules and the final axum router.

use crate::app::AppContext;
use crate::container::Module;
use crate::controller::{build_routers, short_type_name, BuiltRouter, Controller, RouteInfo};
use crate::error::{Error, Result};
use crate::middleware::{authentication_middleware, logging_middleware, route_context_middleware};
use axum::{middleware, Router};
use serde::Serialize;
use std::any::TypeId;
use std::fmt;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

type BuildRouters = fn(&AppContext) -> Result<BuiltRouter>;
type NewModule = fn() -> Box<dyn Module>;

#[derive(Clone, Copy)]
enum ClassKind {
    Controller(BuildRouters),
    Module(NewModule),
    Plain,
}

/// A reference to a type, as handed to the registration calls.
#[derive(Clone, Copy)]
pub struct ClassRef {
    id: TypeId,
    name: &'static str,
    kind: ClassKind,
}

impl ClassRef {
    pub fn controller<C: Controller>() -> Self {
        Self {
            id: TypeId::of::<C>(),
            name: short_type_name::<C>(),
            kind: ClassKind::Controller(build_routers::<C>),
        }
    }

    pub fn module<M: Module + Default + 'static>() -> Self {
        Self {
            id: TypeId::of::<M>(),
            name: short_type_name::<M>(),
            kind: ClassKind::Module(new_module::<M>),
        }
    }

    /// Any other type. Registration calls reject it.
    pub fn of<T: 'static>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: short_type_name::<T>(),
            kind: ClassKind::Plain,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_controller(&self) -> bool {
        matches!(self.kind, ClassKind::Controller(_))
    }

    pub fn is_module(&self) -> bool {
        matches!(self.kind, ClassKind::Module(_))
    }
}

fn new_module<M: Module + Default + 'static>() -> Box<dyn Module> {
    Box::new(M::default())
}

impl fmt::Debug for ClassRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            ClassKind::Controller(_) => "controller",
            ClassKind::Module(_) => "module",
            ClassKind::Plain => "plain",
        };
        f.debug_struct("ClassRef")
            .field("name", &self.name)
            .field("kind", &kind)
            .finish()
    }
}

/// A module given either ready-made or as a type to instantiate.
pub enum ModuleArg {
    Instance(Box<dyn Module>),
    Class(ClassRef),
}

impl ModuleArg {
    pub fn instance<M: Module + 'static>(module: M) -> Self {
        ModuleArg::Instance(Box::new(module))
    }
}

impl From<ClassRef> for ModuleArg {
    fn from(class: ClassRef) -> Self {
        ModuleArg::Class(class)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApiInfo {
    pub title: String,
    pub version: String,
}

pub struct Api {
    app: AppContext,
    info: ApiInfo,
    routers: Vec<BuiltRouter>,
}

impl Api {
    pub fn new(app: AppContext, title: &str, version: &str) -> Self {
        Self {
            app,
            info: ApiInfo {
                title: title.to_string(),
                version: version.to_string(),
            },
            routers: Vec::new(),
        }
    }

    pub fn app(&self) -> &AppContext {
        &self.app
    }

    pub fn info(&self) -> &ApiInfo {
        &self.info
    }

    /// Mount each controller's routes unless it is already mounted.
    ///
    /// Every entry is checked before anything is mounted, so a non-controller leaves the api
    /// untouched.
    pub fn register_controllers(&mut self, controllers: &[ClassRef]) -> Result<()> {
        let builds = controllers
            .iter()
            .map(|class| match class.kind {
                ClassKind::Controller(build) => Ok((class, build)),
                _ => Err(Error::Configuration(format!(
                    "{} class is not a controller",
                    class.name
                ))),
            })
            .collect::<Result<Vec<_>>>()?;

        let registry = self.app.controllers()?;
        for (class, build) in builds {
            if registry.is_registered(class.id) {
                debug!(controller = class.name, "controller already registered, skipping");
                continue;
            }

            let mut router = build(&self.app)?;
            router.set_api_instance(&self.info);
            info!(
                controller = class.name,
                prefix = router.prefix(),
                routes = router.routes().len(),
                "controller mounted"
            );
            self.routers.push(router);
            registry.mark_registered(class.id);
        }
        Ok(())
    }

    /// Install modules into the application container, in order.
    pub fn register_injector_modules(&self, modules: Vec<ModuleArg>) -> Result<()> {
        let modules = modules
            .into_iter()
            .map(|module| match module {
                ModuleArg::Instance(module) => Ok(module),
                ModuleArg::Class(class) => match class.kind {
                    ClassKind::Module(new) => Ok(new()),
                    _ => Err(Error::Configuration(format!(
                        "{} class is not a valid Module",
                        class.name
                    ))),
                },
            })
            .collect::<Result<Vec<_>>>()?;

        let container = self.app.get_container()?;
        // One binder, so the catalog is swapped once with every module applied in order.
        let mut binder = container.binder();
        for module in &modules {
            binder.install(module.as_ref());
        }
        drop(binder);
        debug!(count = modules.len(), "injector modules installed");
        Ok(())
    }

    pub fn routers(&self) -> &[BuiltRouter] {
        &self.routers
    }

    pub fn routes(&self) -> impl Iterator<Item = &RouteInfo> {
        self.routers.iter().flat_map(|router| router.routes().iter())
    }

    /// Merge every mounted controller into one router wrapped in the request pipeline.
    pub fn into_router(self) -> Router {
        let router = self
            .routers
            .into_iter()
            .fold(Router::new(), |router, built| router.merge(built.into_router()));

        router.layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive())
                .layer(middleware::from_fn(logging_middleware))
                .layer(middleware::from_fn(authentication_middleware))
                .layer(middleware::from_fn(route_context_middleware)),
        )
    }
}

impl fmt::Debug for Api {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Api")
            .field("info", &self.info)
            .field("routers", &self.routers.len())
            .finish()
    }
}
