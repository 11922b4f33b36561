//! The interceptor chain driven in-process, without a network listener.

mod common;

use std::convert::Infallible;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use callguard::context::{CallContext, Caller};
use callguard::limiter::{Admission, RateLimiter};
use callguard::pipeline::{BoxBody, Pipeline, RateLimitScope, UNKNOWN_METHOD};
use callguard::proto::account_service_server::AccountServiceServer;
use callguard::server::AccountServiceImpl;
use callguard::session::{MemoryCredentialStore, MemorySessionStore, SessionManager};
use callguard::{Result, TokenIssuer, TokenVerifier};
use common::{token_for, SECRET};
use tonic::{Code, Status};
use tower::util::BoxCloneService;
use tower::{Layer, Service, ServiceExt};

const OPEN: &str = "test.v1.Public/Ping";
const GUARDED: &str = "test.v1.Private/Ping";
const PANICS: &str = "test.v1.Private/Panic";
const SLOW: &str = "test.v1.Private/Slow";

/// Records every call that reaches it and the caller it saw.
#[derive(Clone, Default)]
struct Handler {
    calls: Arc<AtomicUsize>,
    seen: Arc<Mutex<Option<Caller>>>,
    correlation: Arc<Mutex<Option<String>>>,
}

impl Handler {
    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn service(&self) -> BoxCloneService<http::Request<()>, http::Response<BoxBody>, Infallible> {
        let handler = self.clone();
        BoxCloneService::new(tower::service_fn(move |req: http::Request<()>| {
            let handler = handler.clone();
            async move {
                handler.calls.fetch_add(1, Ordering::SeqCst);
                let ctx = req.extensions().get::<CallContext>().cloned();
                if let Some(ctx) = &ctx {
                    *handler.seen.lock().unwrap() = ctx.caller.clone();
                    *handler.correlation.lock().unwrap() = ctx.correlation_id.clone();
                }

                match req.uri().path() {
                    p if p.ends_with("/Panic") => panic!("handler exploded"),
                    p if p.ends_with("/Slow") => tokio::time::sleep(Duration::from_secs(5)).await,
                    _ => {}
                }

                Ok::<_, Infallible>(http::Response::new(tonic::body::empty_body()))
            }
        }))
    }
}

fn pipeline_with(admission: Arc<dyn Admission>) -> Pipeline {
    Pipeline::builder()
        .service_name("callguard-test")
        .environment("test")
        .allow_list([OPEN])
        .known_methods([OPEN, GUARDED, PANICS, SLOW])
        .verifier(TokenVerifier::new(SECRET.as_bytes()))
        .admission(admission, RateLimitScope::Global)
        .build()
        .unwrap()
}

fn pipeline() -> Pipeline {
    pipeline_with(Arc::new(RateLimiter::new(1_000, 1_000.0)))
}

fn request(method: &str, token: Option<&str>) -> http::Request<()> {
    let mut builder = http::Request::builder().uri(format!("/{method}"));
    if let Some(token) = token {
        builder = builder.header("authorization", token);
    }
    builder.body(()).unwrap()
}

fn status_of<B>(response: &http::Response<B>) -> Status {
    Status::from_header_map(response.headers()).unwrap_or_else(|| Status::new(Code::Ok, ""))
}

#[tokio::test]
async fn allow_listed_method_reaches_handler_without_credential() {
    let handler = Handler::default();
    let svc = pipeline().layer(handler.service());

    let response = svc.oneshot(request(OPEN, None)).await.unwrap();

    assert_eq!(status_of(&response).code(), Code::Ok);
    assert_eq!(handler.calls(), 1);
    assert_eq!(*handler.seen.lock().unwrap(), None);
}

#[tokio::test]
async fn guarded_method_without_credential_never_reaches_handler() {
    let handler = Handler::default();
    let svc = pipeline().layer(handler.service());

    let response = svc.oneshot(request(GUARDED, None)).await.unwrap();

    let status = status_of(&response);
    assert_eq!(status.code(), Code::Unauthenticated);
    assert_eq!(status.message(), "missing credential");
    assert_eq!(handler.calls(), 0);
}

#[tokio::test]
async fn invalid_credential_never_reaches_handler() {
    let handler = Handler::default();
    let pipeline = pipeline();

    for token in ["garbage", "Bearer ", "a.b.c"] {
        let response = pipeline
            .layer(handler.service())
            .oneshot(request(GUARDED, Some(token)))
            .await
            .unwrap();
        assert_eq!(status_of(&response).code(), Code::Unauthenticated);
    }

    assert_eq!(handler.calls(), 0);
}

#[tokio::test]
async fn valid_credential_surfaces_claims_unchanged() {
    let handler = Handler::default();
    let svc = pipeline().layer(handler.service());
    let token = token_for("user-7", "auditor");

    let response = svc
        .oneshot(request(GUARDED, Some(&format!("Bearer {token}"))))
        .await
        .unwrap();

    assert_eq!(status_of(&response).code(), Code::Ok);
    assert_eq!(
        *handler.seen.lock().unwrap(),
        Some(Caller {
            subject_id: "user-7".to_string(),
            role: "auditor".to_string(),
        })
    );
}

#[tokio::test]
async fn handler_panic_becomes_internal_and_server_keeps_serving() {
    let handler = Handler::default();
    let mut svc = pipeline().layer(handler.service());
    let token = token_for("user-1", "member");

    let response = svc
        .ready()
        .await
        .unwrap()
        .call(request(PANICS, Some(&token)))
        .await
        .unwrap();
    let status = status_of(&response);
    assert_eq!(status.code(), Code::Internal);
    assert_eq!(status.message(), "internal error");
    assert!(response.headers().contains_key("x-correlation-id"));

    let response = svc
        .ready()
        .await
        .unwrap()
        .call(request(GUARDED, Some(&token)))
        .await
        .unwrap();
    assert_eq!(status_of(&response).code(), Code::Ok);
    assert_eq!(handler.calls(), 2);
}

struct ExplodingAdmission;

#[async_trait::async_trait]
impl Admission for ExplodingAdmission {
    async fn try_acquire(&self, _key: &str) -> Result<()> {
        panic!("limiter bookkeeping corrupted");
    }
}

#[tokio::test]
async fn limiter_fault_is_contained_by_recovery() {
    let handler = Handler::default();
    let svc = pipeline_with(Arc::new(ExplodingAdmission)).layer(handler.service());

    let response = svc.oneshot(request(OPEN, None)).await.unwrap();

    assert_eq!(status_of(&response).code(), Code::Internal);
    assert_eq!(handler.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn rate_limit_admits_capacity_then_rejects_until_refill() {
    let handler = Handler::default();
    let mut svc = pipeline_with(Arc::new(RateLimiter::new(20, 10.0))).layer(handler.service());

    for _ in 0..20 {
        let response = svc
            .ready()
            .await
            .unwrap()
            .call(request(OPEN, None))
            .await
            .unwrap();
        assert_eq!(status_of(&response).code(), Code::Ok);
    }

    let response = svc
        .ready()
        .await
        .unwrap()
        .call(request(OPEN, None))
        .await
        .unwrap();
    assert_eq!(status_of(&response).code(), Code::ResourceExhausted);
    assert_eq!(handler.calls(), 20);

    tokio::time::advance(Duration::from_millis(100)).await;

    let response = svc
        .ready()
        .await
        .unwrap()
        .call(request(OPEN, None))
        .await
        .unwrap();
    assert_eq!(status_of(&response).code(), Code::Ok);
    assert_eq!(handler.calls(), 21);
}

#[tokio::test(start_paused = true)]
async fn slow_handler_is_abandoned_at_the_deadline() {
    let handler = Handler::default();
    let svc = pipeline().layer(handler.service());

    let mut req = request(SLOW, Some(&token_for("user-1", "member")));
    req.headers_mut()
        .insert("grpc-timeout", http::HeaderValue::from_static("50m"));

    let response = svc.oneshot(req).await.unwrap();

    assert_eq!(status_of(&response).code(), Code::DeadlineExceeded);
}

#[tokio::test]
async fn correlation_id_is_propagated_or_generated() {
    let handler = Handler::default();
    let pipeline = pipeline();

    let mut req = request(OPEN, None);
    req.headers_mut()
        .insert("x-correlation-id", http::HeaderValue::from_static("abc-123"));
    let response = pipeline.layer(handler.service()).oneshot(req).await.unwrap();
    assert_eq!(response.headers()["x-correlation-id"], "abc-123");
    assert_eq!(handler.correlation.lock().unwrap().as_deref(), Some("abc-123"));

    let response = pipeline
        .layer(handler.service())
        .oneshot(request(OPEN, None))
        .await
        .unwrap();
    let generated = response.headers()["x-correlation-id"].to_str().unwrap();
    assert!(uuid::Uuid::parse_str(generated).is_ok());
}

#[tokio::test]
async fn each_call_is_recorded_by_exactly_one_metrics_stage() {
    let handler = Handler::default();
    let pipeline = pipeline();

    pipeline
        .layer(handler.service())
        .oneshot(request(OPEN, None))
        .await
        .unwrap();
    pipeline
        .layer(handler.service())
        .oneshot(request(GUARDED, None))
        .await
        .unwrap();

    let text = pipeline.metrics().render();
    assert!(text.contains(r#"rpc_server_started_total{method="test.v1.Public/Ping"} 1"#));
    assert!(text.contains(r#"rpc_server_started_total{method="test.v1.Private/Ping"} 1"#));
}

#[tokio::test]
async fn unrouted_paths_share_one_metrics_series() {
    let handler = Handler::default();
    let pipeline = pipeline();

    for i in 0..200 {
        pipeline
            .layer(handler.service())
            .oneshot(request(&format!("junk.Svc/M{i}"), None))
            .await
            .unwrap();
    }

    let text = pipeline.metrics().render();
    let started: Vec<&str> = text
        .lines()
        .filter(|line| line.starts_with("rpc_server_started_total{"))
        .collect();
    assert_eq!(
        started,
        vec![format!(r#"rpc_server_started_total{{method="{UNKNOWN_METHOD}"}} 200"#)]
    );
    assert!(!text.contains("junk.Svc"));
    assert_eq!(handler.calls(), 0);
}

#[tokio::test]
async fn unknown_method_is_unimplemented_not_a_fault() {
    let sessions = SessionManager::new(
        Arc::new(MemorySessionStore::new()),
        Arc::new(MemoryCredentialStore::new()),
        Duration::from_secs(60),
    );
    let account = AccountServiceImpl::new(
        sessions,
        TokenIssuer::new(SECRET.as_bytes(), Duration::from_secs(60)),
        Default::default(),
    );
    let routes = tonic::service::Routes::new(AccountServiceServer::new(account));
    let svc = pipeline().layer(routes);

    let req = http::Request::builder()
        .method("POST")
        .uri("/callguard.v1.AccountService/DoesNotExist")
        .header("content-type", "application/grpc")
        .header("authorization", token_for("user-1", "member"))
        .body(tonic::body::empty_body())
        .unwrap();

    let response = svc.oneshot(req).await.unwrap();

    assert_eq!(status_of(&response).code(), Code::Unimplemented);
}
