pub mod decorator;
pub mod policy;
pub mod rate;
pub mod store;

pub use decorator::{
    run_throttles, throttle, throttle_with, Handler, HandlerFuture, RequestSource, Source,
    Throttle, ThrottledHandler,
};
pub use policy::{
    get_ident, PolicyCatalog, PolicyClass, PolicyInit, PolicyOptions, PolicyType, ThrottlePolicy,
};
pub use rate::{AnonRateThrottle, DynamicRateThrottle, Rate, SimpleRateThrottle, UserRateThrottle};
pub use store::{CounterStore, InMemoryStore};
