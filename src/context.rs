use axum::http::request::Parts;
use axum::http::{HeaderMap, StatusCode};
use axum::response::Response;
use std::sync::{Arc, Mutex, PoisonError};
use uuid::Uuid;

/// Status and headers of a produced response.
#[derive(Debug, Clone)]
pub struct ResponseMeta {
    pub status: StatusCode,
    pub headers: HeaderMap,
}

impl From<&Response> for ResponseMeta {
    fn from(response: &Response) -> Self {
        Self {
            status: response.status(),
            headers: response.headers().clone(),
        }
    }
}

/// Per-request carrier of the in-flight request and, once produced, its response.
///
/// Created by the request pipeline and stored in the request scope; everything else
/// retrieves it through the resolver.
#[derive(Debug)]
pub struct RouteContext {
    request_id: Uuid,
    request: Arc<Parts>,
    response: Mutex<Option<ResponseMeta>>,
}

impl RouteContext {
    pub fn new(request: Arc<Parts>) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            request,
            response: Mutex::new(None),
        }
    }

    pub fn request_id(&self) -> Uuid {
        self.request_id
    }

    pub fn request(&self) -> &Arc<Parts> {
        &self.request
    }

    pub fn response(&self) -> Option<ResponseMeta> {
        self.response
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set_response(&self, response: ResponseMeta) {
        *self.response.lock().unwrap_or_else(PoisonError::into_inner) = Some(response);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;
    use axum::response::IntoResponse;

    #[test]
    fn test_response_is_recorded() {
        let (parts, _) = Request::builder().uri("/items").body(()).unwrap().into_parts();
        let ctx = RouteContext::new(Arc::new(parts));
        assert!(ctx.response().is_none());
        assert_eq!(ctx.request().uri.path(), "/items");

        let response = (StatusCode::CREATED, "done").into_response();
        ctx.set_response(ResponseMeta::from(&response));
        assert_eq!(ctx.response().unwrap().status, StatusCode::CREATED);
    }

    #[test]
    fn test_request_ids_are_unique() {
        let (parts, _) = Request::builder().body(()).unwrap().into_parts();
        let parts = Arc::new(parts);
        let a = RouteContext::new(parts.clone());
        let b = RouteContext::new(parts);
        assert_ne!(a.request_id(), b.request_id());
    }
}
