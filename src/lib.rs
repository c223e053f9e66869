pub mod api;
pub mod app;
pub mod clock;
pub mod config;
pub mod container;
pub mod context;
pub mod controller;
pub mod error;
pub mod handlers;
pub mod middleware;
pub mod redis;
pub mod resolver;
pub mod server;
pub mod throttling;
pub mod user;

pub use api::{Api, ClassRef, ModuleArg};
pub use app::AppContext;
pub use config::{Settings, ThrottleSettings};
pub use container::{Binder, Container, Lifetime, Module, RequestScope, ServiceKey};
pub use context::RouteContext;
pub use controller::{Controller, ControllerRouter, Receiver};
pub use error::{Error, ResolveError, Result, Throttled};
pub use resolver::{Resolved, Resolver};
pub use server::create_api;
pub use throttling::{throttle, throttle_with, Handler, PolicyClass, ThrottlePolicy};
