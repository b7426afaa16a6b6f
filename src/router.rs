//! Request classification: the health endpoint, prefix dispatch to
//! upstream proxies, and the optional authentication hook.

use std::net::IpAddr;
use std::sync::Arc;

use hyper::{Request, Response, StatusCode};

use crate::error::text_body;
use crate::observe::RequestContext;
use crate::proxy::ReverseProxy;
use crate::{BoxBody, GatewayError, Result};

/// Side-effect-free predicate consulted before dispatching an API request
/// to its upstream. Returning `false` rejects the request with `401`.
pub type AuthPredicate = Arc<dyn Fn(&Request<BoxBody>) -> bool + Send + Sync>;

struct Route {
    prefix: String,
    proxy: ReverseProxy,
}

/// Routes requests: exact `/` answers the health probe, `/api/` paths are
/// matched by prefix against the configured upstreams, everything else is
/// `404`.
pub struct Router {
    routes: Vec<Route>,
    auth: Option<AuthPredicate>,
}

impl Router {
    /// Builds a router from `(prefix, proxy)` pairs. Prefixes are matched
    /// in registration order; the first match wins.
    pub fn new(routes: Vec<(String, ReverseProxy)>) -> Self {
        Self {
            routes: routes
                .into_iter()
                .map(|(prefix, proxy)| Route { prefix, proxy })
                .collect(),
            auth: None,
        }
    }

    /// Installs the authentication predicate consulted before API
    /// dispatch.
    pub fn with_auth(mut self, auth: AuthPredicate) -> Self {
        self.auth = Some(auth);
        self
    }

    /// Classifies and dispatches one request.
    pub async fn dispatch(
        &self,
        req: Request<BoxBody>,
        ctx: &RequestContext,
        client_ip: IpAddr,
    ) -> Result<Response<BoxBody>> {
        let path = req.uri().path();

        if !path.starts_with("/api/") {
            return if path == "/" {
                Ok(health_response())
            } else {
                Err(GatewayError::NotFound)
            };
        }

        let Some(route) = self.find(path) else {
            return Err(GatewayError::NotFound);
        };

        if let Some(auth) = &self.auth {
            if !auth(&req) {
                return Err(GatewayError::Unauthorized);
            }
        }

        route.proxy.forward(req, ctx, client_ip).await
    }

    fn find(&self, path: &str) -> Option<&Route> {
        self.routes
            .iter()
            .find(|route| path.starts_with(&route.prefix))
    }
}

fn health_response() -> Response<BoxBody> {
    Response::builder()
        .status(StatusCode::OK)
        .header(hyper::header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(text_body("ok"))
        .unwrap_or_else(|_| Response::new(text_body("ok")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use bytes::Bytes;
    use http_body_util::{BodyExt, Empty};
    use hyper::Method;
    use hyper::header::HeaderMap;

    use crate::BoxError;
    use crate::proxy::{RetryPolicy, UpstreamTarget, build_client};

    fn empty_body() -> BoxBody {
        Empty::<Bytes>::new()
            .map_err(|never| -> BoxError { match never {} })
            .boxed()
    }

    fn request(method: Method, path: &str) -> Request<BoxBody> {
        Request::builder()
            .method(method)
            .uri(path)
            .body(empty_body())
            .unwrap()
    }

    fn ctx() -> RequestContext {
        RequestContext::new(&HeaderMap::new(), &crate::Config::default().server)
    }

    fn test_router() -> Router {
        // Routes point at a closed local port; classification tests never
        // reach the proxy.
        let retry = RetryPolicy {
            attempts: 1,
            base_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(20),
        };
        let client = build_client();
        Router::new(vec![
            (
                "/api/auth".to_owned(),
                ReverseProxy::new(
                    UpstreamTarget::parse("http://127.0.0.1:9").unwrap(),
                    client.clone(),
                    retry,
                ),
            ),
            (
                "/api/onboarding".to_owned(),
                ReverseProxy::new(
                    UpstreamTarget::parse("http://127.0.0.1:9").unwrap(),
                    client,
                    retry,
                ),
            ),
        ])
    }

    fn ip() -> IpAddr {
        "192.168.1.100".parse().unwrap()
    }

    #[tokio::test]
    async fn health_answers_exact_root_only() {
        let router = test_router();

        let resp = router
            .dispatch(request(Method::GET, "/"), &ctx(), ip())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body, Bytes::from_static(b"ok"));
    }

    #[tokio::test]
    async fn longer_non_api_paths_are_not_found() {
        let router = test_router();

        let result = router
            .dispatch(request(Method::GET, "/healthz"), &ctx(), ip())
            .await;
        assert!(matches!(result, Err(GatewayError::NotFound)));
    }

    #[tokio::test]
    async fn unmatched_api_prefix_is_not_found() {
        let router = test_router();

        let result = router
            .dispatch(request(Method::GET, "/api/unknown/x"), &ctx(), ip())
            .await;
        assert!(matches!(result, Err(GatewayError::NotFound)));
    }

    #[test]
    fn prefix_matching_selects_the_right_route() {
        let router = test_router();

        assert_eq!(router.find("/api/auth/login").unwrap().prefix, "/api/auth");
        assert_eq!(
            router.find("/api/onboarding/profile").unwrap().prefix,
            "/api/onboarding"
        );
        assert!(router.find("/api/billing/x").is_none());
    }

    #[tokio::test]
    async fn auth_predicate_rejects_with_unauthorized() {
        let router = test_router().with_auth(Arc::new(|_req| false));

        let result = router
            .dispatch(request(Method::GET, "/api/auth/me"), &ctx(), ip())
            .await;
        assert!(matches!(result, Err(GatewayError::Unauthorized)));
    }

    #[tokio::test]
    async fn auth_predicate_is_not_consulted_for_health() {
        let router = test_router().with_auth(Arc::new(|_req| false));

        let resp = router
            .dispatch(request(Method::GET, "/"), &ctx(), ip())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }
}
