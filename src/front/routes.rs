use std::sync::Arc;

use axum::{
    Router,
    http::{HeaderValue, Request, header},
    routing::{get, post},
};
use http::HeaderName;
use tower::{Layer, ServiceBuilder};
use tower_http::{
    normalize_path::{NormalizePath, NormalizePathLayer},
    request_id::{MakeRequestId, PropagateRequestIdLayer, RequestId, SetRequestIdLayer},
    sensitive_headers::SetSensitiveRequestHeadersLayer,
    set_header::SetRequestHeaderLayer,
    timeout::TimeoutLayer,
    trace::{DefaultOnResponse, TraceLayer},
};
use tracing::{Level, info_span};
use uuid::Uuid;

use crate::front::{
    config::FrontConfig,
    handlers::{AppState, live, ready, webhook},
};
use crate::tekton::TektonClient;

pub fn build_app<T: TektonClient + 'static>(state: AppState<T>) -> NormalizePath<Router> {
    let config = state.config.clone();
    let shared_state = Arc::new(state);

    let router = Router::new()
        .route("/live", get(live))
        .route("/ready", get(ready))
        .route("/", post(webhook::<T>))
        .with_state(shared_state);

    let router = apply_middleware(router, &config);
    NormalizePathLayer::trim_trailing_slash().layer(router)
}

fn apply_middleware(router: Router, config: &FrontConfig) -> Router {
    let headers = [
        "x-hub-signature",
        "x-hub-signature-256",
        "x-gitlab-token",
        "x-gitea-signature",
    ]
    .into_iter()
    .flat_map(str::parse)
    .chain([header::AUTHORIZATION, header::COOKIE])
    .collect::<Vec<_>>();
    let middleware = ServiceBuilder::new()
        .layer(SetSensitiveRequestHeadersLayer::new(headers))
        .layer(SetRequestIdLayer::new(
            HeaderName::from_static("x-request-id"),
            PacerRequestIdMaker {},
        ))
        .layer(PropagateRequestIdLayer::new(HeaderName::from_static(
            "x-request-id",
        )))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|req: &Request<_>| {
                    let id = get_request_id_or_default(req);
                    info_span!(
                        "request",
                        method = %req.method(),
                        uri = %req.uri(),
                        version = ?req.version(),
                        request_id = id,
                    )
                })
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(SetRequestHeaderLayer::if_not_present(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        ))
        .layer(TimeoutLayer::new(config.server_timeout.into()));

    router.layer(middleware)
}

fn get_request_id_or_default<T>(req: &Request<T>) -> String {
    req.extensions()
        .get::<RequestId>()
        .and_then(|id| id.header_value().to_str().ok())
        .map_or_else(|| Uuid::new_v4().to_string(), ToOwned::to_owned)
}

#[derive(Debug, Clone)]
struct PacerRequestIdMaker;

impl MakeRequestId for PacerRequestIdMaker {
    fn make_request_id<B>(&mut self, _req: &Request<B>) -> Option<RequestId> {
        Uuid::new_v4().to_string().parse().map(RequestId::new).ok()
    }
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use http::{Method, StatusCode};
    use tower::ServiceExt as _;

    use super::*;
    use crate::concurrency::ConcurrencyManager;
    use crate::front::handlers::ProviderRegistry;
    use crate::repository::RepositoryCache;
    use crate::status::StatusReporter;
    use crate::tekton::MockTektonClient;
    use std::sync::Arc as StdArc;

    fn build_default_app() -> NormalizePath<Router> {
        let state = AppState {
            config: FrontConfig::default(),
            providers: StdArc::new(ProviderRegistry {
                github: None,
                gitlab: None,
                gitea: None,
                bitbucket: None,
            }),
            repo_cache: StdArc::new(RepositoryCache::new()),
            concurrency: StdArc::new(ConcurrencyManager::new(MockTektonClient::new())),
            status: StdArc::new(StatusReporter::new()),
            public_base_url: "https://pacer.example.com".to_owned(),
        };
        build_app(state)
    }

    async fn call_app(method: Method, path: &'static str, body: Body) -> http::Response<Body> {
        let req = Request::builder().method(method).uri(path).body(body).unwrap();
        build_default_app().oneshot(req).await.unwrap()
    }

    #[tokio::test]
    async fn routes_live() {
        let response = call_app(Method::GET, "/live", Body::empty()).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn routes_ready() {
        let response = call_app(Method::GET, "/ready", Body::empty()).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn webhook_with_no_provider_headers_is_rejected() {
        let response = call_app(Method::POST, "/", Body::from("{}")).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn normalize_path() {
        let response = call_app(Method::GET, "//live/", Body::empty()).await;
        assert_eq!(response.status(), StatusCode::OK);
    }
}
