//! End-to-end tests of the cache, ETag middleware and handler pipeline.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::task::Context;
use std::task::Poll;

use bytes::Bytes;
use http_cache_store::Body;
use http_cache_store::Buffered;
use http_cache_store::Cache;
use http_cache_store::CacheConfig;
use http_cache_store::ETag;
use http_cache_store::Handler;
use http_cache_store::HttpBody;
use http_cache_store::Pipeline;
use http_cache_store::X_CACHE;
use http_cache_store::X_CACHE_LOOKUP;
use http_cache_store::entitystore::EntityStore;
use http_cache_store::http::Method;
use http_cache_store::http::Request;
use http_cache_store::http::Response;
use http_cache_store::http::StatusCode;
use http_cache_store::http::header;
use http_cache_store::http_body::Frame;
use http_cache_store::metastore::MetaStore;
use http_cache_store::request_key;
use http_cache_store::storage::KvStore;
use http_cache_store::storage::MemoryStore;

/// The URL requested by the tests.
const URL: &str = "http://example.com/hello";

/// Describes the response the test application replies with.
#[derive(Clone)]
struct Reply {
    /// The response status.
    status: u16,
    /// The response headers.
    headers: Vec<(&'static str, &'static str)>,
    /// The response body.
    body: String,
    /// A request header whose value is appended to the body.
    echo: Option<&'static str>,
    /// Whether the application fails instead of replying.
    fail: bool,
}

impl Reply {
    /// Constructs a `200 OK` reply with the given headers and body.
    fn ok(headers: &[(&'static str, &'static str)], body: &str) -> Self {
        Self {
            status: 200,
            headers: headers.to_vec(),
            body: body.to_string(),
            echo: None,
            fail: false,
        }
    }
}

/// A test application counting the requests it handles.
struct App {
    /// The number of handled requests.
    calls: AtomicUsize,
    /// The reply to send.
    reply: Mutex<Reply>,
}

impl App {
    /// Gets the number of handled requests.
    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Changes the reply of the application.
    fn update(&self, f: impl FnOnce(&mut Reply)) {
        f(&mut self.reply.lock().unwrap());
    }
}

impl Handler<(), Buffered> for App {
    async fn call(&self, request: Request<()>) -> anyhow::Result<Response<Buffered>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let reply = self.reply.lock().unwrap().clone();
        if reply.fail {
            anyhow::bail!("application failed");
        }

        let mut body = reply.body;
        if let Some(value) = reply.echo.and_then(|name| request.headers().get(name)) {
            body = format!("{body}:{value}", value = value.to_str()?);
        }

        let mut builder = Response::builder().status(reply.status);
        for (name, value) in &reply.headers {
            builder = builder.header(*name, *value);
        }

        Ok(builder.body(Buffered::from(body))?)
    }
}

/// The pipeline type used by the tests.
type TestPipeline = Pipeline<App, Arc<MemoryStore>, Arc<MemoryStore>>;

/// Constructs a pipeline over memory storage.
fn pipeline(reply: Reply, config: CacheConfig) -> TestPipeline {
    let storage = Arc::new(MemoryStore::new());
    let cache = Cache::new_with_config(
        MetaStore::new(storage.clone()),
        EntityStore::new(storage),
        config,
    );

    Pipeline::new(
        cache,
        ETag::new(),
        App {
            calls: AtomicUsize::new(0),
            reply: Mutex::new(reply),
        },
    )
}

/// Builds a request to the test URL.
fn request(method: Method, headers: &[(&str, &str)]) -> Request<()> {
    let mut builder = Request::builder().method(method).uri(URL);
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }

    builder.body(()).unwrap()
}

/// Builds a `GET` request to the test URL.
fn get(headers: &[(&str, &str)]) -> Request<()> {
    request(Method::GET, headers)
}

/// Reads the body of a response.
async fn body<B: HttpBody>(response: Response<Body<B>>) -> Bytes {
    response.into_body().collect().await.unwrap()
}

#[tokio::test]
async fn fresh_responses_are_served_from_the_cache() {
    let pipeline = pipeline(
        Reply::ok(&[("cache-control", "max-age=60")], "Hello, world!"),
        CacheConfig::default(),
    );

    let response = pipeline.call(get(&[])).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[X_CACHE], "MISS");
    assert_eq!(response.headers()[X_CACHE_LOOKUP], "MISS");
    assert_eq!(
        response.headers()[header::ETAG],
        "\"943a702d06f34599aee1f8da8ef9f7296031d699\""
    );
    assert_eq!(body(response).await, "Hello, world!");

    let response = pipeline.call(get(&[])).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[X_CACHE], "HIT");
    assert_eq!(response.headers()[X_CACHE_LOOKUP], "HIT");
    assert!(response.headers().contains_key(header::AGE));
    assert_eq!(
        response.headers()[header::ETAG],
        "\"943a702d06f34599aee1f8da8ef9f7296031d699\""
    );
    assert_eq!(body(response).await, "Hello, world!");
    assert_eq!(pipeline.handler().calls(), 1);

    // The stored variant references a byte-identical body
    let key = request_key(&Method::GET, &URL.parse().unwrap(), &Default::default());
    let variants = pipeline.cache().metastore().lookup(&key).await;
    assert_eq!(variants.len(), 1);
    let stored = pipeline
        .cache()
        .entitystore()
        .read(&variants[0].digest)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored, "Hello, world!");
}

#[tokio::test]
async fn stale_responses_are_revalidated() {
    let pipeline = pipeline(
        Reply::ok(&[("cache-control", "max-age=0")], "Hello, world!"),
        CacheConfig::default(),
    );

    let response = pipeline.call(get(&[])).await.unwrap();
    assert_eq!(response.headers()[X_CACHE], "MISS");
    assert_eq!(body(response).await, "Hello, world!");

    // The application sees the stored validator and answers 304
    let response = pipeline.call(get(&[])).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[X_CACHE], "HIT");
    assert_eq!(body(response).await, "Hello, world!");
    assert_eq!(pipeline.handler().calls(), 2);
}

#[tokio::test]
async fn changed_responses_replace_the_stored_variant() {
    let pipeline = pipeline(
        Reply::ok(&[("cache-control", "max-age=0")], "v1"),
        CacheConfig::default(),
    );

    let response = pipeline.call(get(&[])).await.unwrap();
    assert_eq!(body(response).await, "v1");

    pipeline.handler().update(|reply| reply.body = "v2".to_string());
    let response = pipeline.call(get(&[])).await.unwrap();
    assert_eq!(response.headers()[X_CACHE], "MISS");
    assert_eq!(response.headers()[X_CACHE_LOOKUP], "HIT");
    assert_eq!(body(response).await, "v2");

    let response = pipeline.call(get(&[])).await.unwrap();
    assert_eq!(response.headers()[X_CACHE], "HIT");
    assert_eq!(body(response).await, "v2");
    assert_eq!(pipeline.handler().calls(), 3);

    let key = request_key(&Method::GET, &URL.parse().unwrap(), &Default::default());
    assert_eq!(pipeline.cache().metastore().lookup(&key).await.len(), 1);
}

#[tokio::test]
async fn failed_revalidation_serves_stale_with_warning() {
    let pipeline = pipeline(
        Reply::ok(&[("cache-control", "max-age=0")], "v1"),
        CacheConfig::default(),
    );
    let response = pipeline.call(get(&[])).await.unwrap();
    assert_eq!(body(response).await, "v1");

    pipeline.handler().update(|reply| {
        reply.status = 500;
        reply.body = "oops".to_string();
    });
    let response = pipeline.call(get(&[])).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers()[header::WARNING]
        .to_str()
        .unwrap()
        .starts_with("111 "));
    assert_eq!(body(response).await, "v1");

    pipeline.handler().update(|reply| reply.fail = true);
    let response = pipeline.call(get(&[])).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().contains_key(header::WARNING));
    assert_eq!(body(response).await, "v1");
}

#[tokio::test]
async fn conditional_requests_are_answered_from_the_cache() {
    let pipeline = pipeline(
        Reply::ok(&[("cache-control", "max-age=60")], "Hello, world!"),
        CacheConfig::default(),
    );
    let response = pipeline.call(get(&[])).await.unwrap();
    let etag = response.headers()[header::ETAG].to_str().unwrap().to_string();

    let response = pipeline
        .call(get(&[("if-none-match", etag.as_str())]))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_MODIFIED);
    assert_eq!(response.headers()[header::ETAG], etag.as_str());
    assert!(body(response).await.is_empty());
    assert_eq!(pipeline.handler().calls(), 1);
}

#[tokio::test]
async fn variants_are_selected_by_vary_headers() {
    let mut reply = Reply::ok(
        &[("cache-control", "max-age=60"), ("vary", "accept-encoding")],
        "hello",
    );
    reply.echo = Some("accept-encoding");
    let pipeline = pipeline(reply, CacheConfig::default());

    let response = pipeline
        .call(get(&[("accept-encoding", "gzip")]))
        .await
        .unwrap();
    assert_eq!(body(response).await, "hello:gzip");

    let response = pipeline
        .call(get(&[("accept-encoding", "br")]))
        .await
        .unwrap();
    assert_eq!(response.headers()[X_CACHE], "MISS");
    assert_eq!(body(response).await, "hello:br");

    let response = pipeline
        .call(get(&[("accept-encoding", "gzip")]))
        .await
        .unwrap();
    assert_eq!(response.headers()[X_CACHE], "HIT");
    assert_eq!(body(response).await, "hello:gzip");
    assert_eq!(pipeline.handler().calls(), 2);

    let key = request_key(&Method::GET, &URL.parse().unwrap(), &Default::default());
    assert_eq!(pipeline.cache().metastore().lookup(&key).await.len(), 2);
}

#[tokio::test]
async fn unsafe_methods_invalidate_cached_responses() {
    let pipeline = pipeline(
        Reply::ok(&[("cache-control", "max-age=60")], "Hello, world!"),
        CacheConfig::default(),
    );
    pipeline.call(get(&[])).await.unwrap();
    pipeline.call(get(&[])).await.unwrap();
    assert_eq!(pipeline.handler().calls(), 1);

    let response = pipeline.call(request(Method::POST, &[])).await.unwrap();
    assert_eq!(response.headers()[X_CACHE], "MISS");
    assert_eq!(pipeline.handler().calls(), 2);

    let response = pipeline.call(get(&[])).await.unwrap();
    assert_eq!(response.headers()[X_CACHE], "MISS");
    assert_eq!(pipeline.handler().calls(), 3);
}

#[tokio::test]
async fn no_store_responses_are_not_cached() {
    let pipeline = pipeline(
        Reply::ok(&[("cache-control", "no-store")], "secret"),
        CacheConfig::default(),
    );
    pipeline.call(get(&[])).await.unwrap();
    let response = pipeline.call(get(&[])).await.unwrap();
    assert_eq!(response.headers()[X_CACHE], "MISS");
    assert_eq!(body(response).await, "secret");
    assert_eq!(pipeline.handler().calls(), 2);

    let key = request_key(&Method::GET, &URL.parse().unwrap(), &Default::default());
    assert!(pipeline.cache().metastore().lookup(&key).await.is_empty());
}

#[tokio::test]
async fn default_ttl_applies_to_responses_without_freshness() {
    let pipeline = pipeline(
        Reply::ok(&[], "Hello, world!"),
        CacheConfig {
            default_ttl_secs: Some(60),
            ..Default::default()
        },
    );

    // Only the stored copy is given the default lifetime
    let response = pipeline.call(get(&[])).await.unwrap();
    assert_eq!(response.headers()[X_CACHE], "MISS");
    assert!(!response.headers().contains_key(header::CACHE_CONTROL));

    let response = pipeline.call(get(&[])).await.unwrap();
    assert_eq!(response.headers()[X_CACHE], "HIT");
    assert_eq!(response.headers()[header::CACHE_CONTROL], "max-age=60");
    assert_eq!(pipeline.handler().calls(), 1);
}

#[tokio::test]
async fn default_ttl_leaves_uncached_responses_untouched() {
    let mut reply = Reply::ok(&[], "oops");
    reply.status = 500;
    let pipeline = pipeline(
        reply,
        CacheConfig {
            default_ttl_secs: Some(60),
            ..Default::default()
        },
    );

    let response = pipeline.call(get(&[])).await.unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(response.headers()[X_CACHE], "MISS");
    assert!(!response.headers().contains_key(header::CACHE_CONTROL));

    let response = pipeline.call(request(Method::POST, &[])).await.unwrap();
    assert!(!response.headers().contains_key(header::CACHE_CONTROL));

    let key = request_key(&Method::GET, &URL.parse().unwrap(), &Default::default());
    assert!(pipeline.cache().metastore().lookup(&key).await.is_empty());
}

#[tokio::test]
async fn responses_varying_on_everything_are_not_stored() {
    let pipeline = pipeline(
        Reply::ok(
            &[("cache-control", "max-age=60"), ("vary", "accept, *")],
            "Hello, world!",
        ),
        CacheConfig::default(),
    );

    for _ in 0..5 {
        let response = pipeline.call(get(&[])).await.unwrap();
        assert_eq!(response.headers()[X_CACHE], "MISS");
        assert_eq!(body(response).await, "Hello, world!");
    }

    assert_eq!(pipeline.handler().calls(), 5);
    let key = request_key(&Method::GET, &URL.parse().unwrap(), &Default::default());
    assert!(pipeline.cache().metastore().lookup(&key).await.is_empty());
    assert!(pipeline.cache().metastore().storage().is_empty().await);
}

#[tokio::test]
async fn revalidated_responses_varying_on_everything_are_purged() {
    let pipeline = pipeline(
        Reply::ok(&[("cache-control", "max-age=0")], "v1"),
        CacheConfig::default(),
    );
    let response = pipeline.call(get(&[])).await.unwrap();
    assert_eq!(body(response).await, "v1");

    pipeline.handler().update(|reply| {
        reply.body = "v2".to_string();
        reply.headers.push(("vary", "*"));
    });
    let response = pipeline.call(get(&[])).await.unwrap();
    assert_eq!(response.headers()[X_CACHE_LOOKUP], "HIT");
    assert_eq!(response.headers()[X_CACHE], "MISS");
    assert_eq!(body(response).await, "v2");

    let key = request_key(&Method::GET, &URL.parse().unwrap(), &Default::default());
    assert!(pipeline.cache().metastore().lookup(&key).await.is_empty());
}

#[tokio::test]
async fn ignored_headers_are_not_stored() {
    let pipeline = pipeline(
        Reply::ok(
            &[("cache-control", "max-age=60"), ("set-cookie", "session=1")],
            "Hello, world!",
        ),
        CacheConfig::default(),
    );

    let response = pipeline.call(get(&[])).await.unwrap();
    assert_eq!(response.headers()[header::SET_COOKIE], "session=1");

    let response = pipeline.call(get(&[])).await.unwrap();
    assert_eq!(response.headers()[X_CACHE], "HIT");
    assert!(!response.headers().contains_key(header::SET_COOKIE));
}

/// A storage whose every operation fails.
struct FailingStore;

impl KvStore for FailingStore {
    async fn get(&self, _: &str) -> anyhow::Result<Option<Bytes>> {
        anyhow::bail!("connection refused")
    }

    async fn set(&self, _: &str, _: Bytes) -> anyhow::Result<()> {
        anyhow::bail!("connection refused")
    }

    async fn delete(&self, _: &str) -> anyhow::Result<()> {
        anyhow::bail!("connection refused")
    }
}

#[tokio::test]
async fn storage_failures_degrade_to_uncached() {
    let calls = Arc::new(AtomicUsize::new(0));
    let handler = {
        let calls = calls.clone();
        move |_: Request<()>| {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                anyhow::Ok(
                    Response::builder()
                        .header("cache-control", "max-age=60")
                        .body(Buffered::from("Hello, world!"))?,
                )
            }
        }
    };

    let pipeline = Pipeline::new(
        Cache::with_storage(Arc::new(FailingStore)),
        ETag::new(),
        handler,
    );

    for _ in 0..2 {
        let response = pipeline.call(get(&[])).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[X_CACHE], "MISS");
        assert_eq!(body(response).await, "Hello, world!");
    }

    assert_eq!(calls.load(Ordering::SeqCst), 2);

    // Purging through a failing storage is not an error either
    let response = pipeline.call(request(Method::DELETE, &[])).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

/// A body that fails on the first read.
struct FailingBody;

impl http_cache_store::http_body::Body for FailingBody {
    type Data = Bytes;
    type Error = io::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        _: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        Poll::Ready(Some(Err(io::Error::new(
            io::ErrorKind::ConnectionReset,
            "connection reset",
        ))))
    }
}

impl HttpBody for FailingBody {}

#[tokio::test]
async fn body_read_failures_propagate() {
    let pipeline = Pipeline::new(
        Cache::with_storage(Arc::new(MemoryStore::new())),
        ETag::new(),
        |_: Request<()>| async { anyhow::Ok(Response::new(FailingBody)) },
    );

    let Err(e) = pipeline.call(get(&[])).await else {
        panic!("request should fail");
    };
    assert_eq!(
        e.downcast_ref::<io::Error>().map(io::Error::kind),
        Some(io::ErrorKind::ConnectionReset)
    );
}
