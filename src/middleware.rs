use crate::container::RequestScope;
use crate::context::{ResponseMeta, RouteContext};
use crate::user::User;
use axum::extract::ConnectInfo;
use axum::{extract::Request, middleware::Next, response::Response};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, info};

/// Logging middleware for request/response tracking
pub async fn logging_middleware(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let client_ip = get_client_ip(&request);

    info!(
        target: "ninja_throttle::middleware",
        method = %method,
        uri = %uri,
        client_ip = %client_ip,
        "Incoming request"
    );

    let response = next.run(request).await;

    let status = response.status();
    info!(
        target: "ninja_throttle::middleware",
        method = %method,
        uri = %uri,
        status = %status,
        "Request completed"
    );

    response
}

/// Attach the acting [`User`] from the `x-user-id` header unless an outer layer already did.
pub async fn authentication_middleware(mut request: Request, next: Next) -> Response {
    if request.extensions().get::<User>().is_none() {
        let user = User::from_headers(request.headers());
        request.extensions_mut().insert(user);
    }
    next.run(request).await
}

/// Open a request scope holding this request's [`RouteContext`] and record the response on
/// it once the inner service is done.
pub async fn route_context_middleware(request: Request, next: Next) -> Response {
    let scope = RequestScope::new();
    // The context's request snapshot holds the scope, the scope holds the context.
    let _clear = ClearOnDrop(scope.clone());

    let (mut parts, body) = request.into_parts();
    parts.extensions.insert(scope.clone());
    let ctx = Arc::new(RouteContext::new(Arc::new(parts.clone())));
    scope.insert(Arc::clone(&ctx));
    debug!(request_id = %ctx.request_id(), path = %parts.uri.path(), "route context opened");

    let response = next.run(Request::from_parts(parts, body)).await;
    ctx.set_response(ResponseMeta::from(&response));
    response
}

struct ClearOnDrop(RequestScope);

impl Drop for ClearOnDrop {
    fn drop(&mut self) {
        self.0.clear();
    }
}

fn get_client_ip(request: &Request) -> String {
    // Try to get real IP from headers first
    if let Some(forwarded) = request.headers().get("x-forwarded-for") {
        if let Ok(forwarded_str) = forwarded.to_str() {
            if let Some(first_ip) = forwarded_str.split(',').next() {
                return first_ip.trim().to_string();
            }
        }
    }

    if let Some(real_ip) = request.headers().get("x-real-ip") {
        if let Ok(ip_str) = real_ip.to_str() {
            return ip_str.to_string();
        }
    }

    // Fallback to connection info
    if let Some(ConnectInfo(addr)) = request.extensions().get::<ConnectInfo<SocketAddr>>() {
        addr.ip().to_string()
    } else if let Some(addr) = request.extensions().get::<SocketAddr>() {
        addr.ip().to_string()
    } else {
        "unknown".to_string()
    }
}
