use crate::app::AppContext;
use crate::config::ThrottleSettings;
use crate::context::RouteContext;
use crate::controller::{Controller, ControllerRouter, Receiver};
use crate::error::Result;
use crate::resolver::Resolver;
use crate::throttling::{
    throttle, throttle_with, DynamicRateThrottle, Handler, PolicyClass, PolicyOptions,
    RequestSource, Source,
};
use crate::user::User;
use axum::body::Bytes;
use axum::Json;
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Serialize)]
pub struct PingResponse {
    pub message: String,
    pub request_id: Uuid,
    pub user: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct BurstResponse {
    pub accepted_bytes: usize,
    pub request_id: Uuid,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub throttle_classes: Vec<String>,
}

/// Demo endpoints guarded by the default and by an explicit throttle.
pub struct PingController {
    ctx: Arc<RouteContext>,
}

impl RequestSource for PingController {
    fn source(&self) -> Source<'_> {
        Source::Controller(&self.ctx)
    }
}

impl Receiver for PingController {
    fn receive(ctx: Arc<RouteContext>, _services: &Resolver) -> Result<Self> {
        Ok(Self { ctx })
    }
}

impl PingController {
    pub fn ping(self, _body: Bytes) -> Json<PingResponse> {
        let user = User::from_request(self.ctx.request());
        Json(PingResponse {
            message: "pong".to_string(),
            request_id: self.ctx.request_id(),
            user: user.id().map(str::to_string),
        })
    }

    pub async fn burst(self, body: Bytes) -> Json<BurstResponse> {
        Json(BurstResponse {
            accepted_bytes: body.len(),
            request_id: self.ctx.request_id(),
        })
    }
}

impl Controller for PingController {
    const PREFIX: &'static str = "/ping";

    fn routes(router: &mut ControllerRouter<Self>, app: &AppContext) -> Result<()> {
        let burst = throttle_with(
            vec![PolicyClass::of::<DynamicRateThrottle>()],
            PolicyOptions::new(),
        )
        .option("scope", "burst")
        .option("rate", "5/min")
        .apply(app, Handler::asynchronous(PingController::burst))?;

        router
            .get("/", "ping", throttle(app, Handler::sync(PingController::ping))?)?
            .post("/burst", "burst", burst)?;
        Ok(())
    }
}

/// Liveness endpoint, never throttled.
pub struct HealthController {
    ctx: Arc<RouteContext>,
    settings: Arc<ThrottleSettings>,
}

impl RequestSource for HealthController {
    fn source(&self) -> Source<'_> {
        Source::Controller(&self.ctx)
    }
}

impl Receiver for HealthController {
    fn receive(ctx: Arc<RouteContext>, services: &Resolver) -> Result<Self> {
        Ok(Self {
            ctx,
            settings: services.get::<ThrottleSettings>()?,
        })
    }
}

impl HealthController {
    pub fn health(self, _body: Bytes) -> Json<HealthResponse> {
        Json(HealthResponse {
            status: "healthy".to_string(),
            throttle_classes: self.settings.throttle_classes.clone(),
        })
    }
}

impl Controller for HealthController {
    const PREFIX: &'static str = "";

    fn routes(router: &mut ControllerRouter<Self>, _app: &AppContext) -> Result<()> {
        router.get("/health", "health", Handler::sync(HealthController::health))?;
        Ok(())
    }
}
