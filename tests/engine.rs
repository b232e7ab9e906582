mod common;

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::io::AsyncWriteExt;

use wiremock::matchers::{body_string, header, header_exists, method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

use common::{brotli, gzip, quiet_engine};
use tpx_runtime::{CancelReason, Context, CookieJar, Engine, Error, ErrorKind, RequestConfig, RetryPolicy};

fn fast_retries(max: u32) -> RetryPolicy {
    RetryPolicy::new().max_retries(max).delay(Duration::from_millis(10))
}

#[tokio::test]
async fn retried_post_replays_identical_body() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/submit"))
        .and(body_string("key=value"))
        .respond_with(ResponseTemplate::new(502))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/submit"))
        .and(body_string("key=value"))
        .respond_with(ResponseTemplate::new(200).set_body_string("accepted"))
        .mount(&server)
        .await;

    let config = RequestConfig::get(&format!("{}/submit", server.uri()))
        .method("POST")
        .text_body("key=value")
        .retry(fast_retries(3));
    let execution = quiet_engine().execute(&Context::background(), &config).await.unwrap();

    assert_eq!(execution.status(), 200);
    assert_eq!(execution.attempts(), 2);
    assert_eq!(execution.text(), "accepted");

    let received = server.received_requests().await.unwrap();
    assert_eq!(received.len(), 2);
    assert_eq!(received[0].body, b"key=value");
    assert_eq!(received[0].body, received[1].body);
}

#[tokio::test]
async fn scripted_unavailable_then_ok_takes_three_attempts() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string("ready"))
        .mount(&server)
        .await;

    let mut config = RequestConfig::get(&server.uri()).retry(fast_retries(3));
    config.retry.retry_on_http = vec![503];
    let execution = quiet_engine().execute(&Context::background(), &config).await.unwrap();

    assert_eq!(execution.status(), 200);
    assert_eq!(execution.attempts(), 3);
    assert_eq!(server.received_requests().await.unwrap().len(), 3);
}

#[tokio::test]
async fn exhausted_retries_surface_last_status() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503).set_body_string("busy"))
        .mount(&server)
        .await;

    let config = RequestConfig::get(&server.uri()).retry(fast_retries(2));
    let execution = quiet_engine().execute(&Context::background(), &config).await.unwrap();

    assert_eq!(execution.status(), 503);
    assert_eq!(execution.attempts(), 3);
    assert_eq!(execution.text(), "busy");
}

struct Recorder(Arc<Mutex<Vec<Instant>>>);

impl Respond for Recorder {
    fn respond(&self, _request: &Request) -> ResponseTemplate {
        self.0.lock().unwrap().push(Instant::now());
        ResponseTemplate::new(503)
    }
}

#[tokio::test]
async fn exponential_backoff_doubles_between_attempts() {
    let server = MockServer::start().await;
    let times = Arc::new(Mutex::new(Vec::new()));
    Mock::given(method("GET"))
        .respond_with(Recorder(times.clone()))
        .mount(&server)
        .await;

    let policy = RetryPolicy::new()
        .max_retries(2)
        .backoff_base(Duration::from_millis(150));
    let config = RequestConfig::get(&server.uri()).retry(policy);
    let execution = quiet_engine().execute(&Context::background(), &config).await.unwrap();
    assert_eq!(execution.attempts(), 3);

    let times = times.lock().unwrap();
    assert_eq!(times.len(), 3);
    let first = times[1] - times[0];
    let second = times[2] - times[1];
    assert!(first >= Duration::from_millis(150), "first gap {:?}", first);
    assert!(second >= Duration::from_millis(300), "second gap {:?}", second);
    assert!(second > first);
}

#[tokio::test]
async fn context_deadline_beats_fallback_timeout() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
        .mount(&server)
        .await;

    let ctx = Context::background().with_timeout(Duration::from_millis(500));
    let config = RequestConfig::get(&server.uri()).timeout(Duration::from_secs(10));
    let started = Instant::now();
    let err = quiet_engine().execute(&ctx, &config).await.unwrap_err();
    let elapsed = started.elapsed();

    assert_eq!(err.cancel_reason(), Some(CancelReason::DeadlineExceeded));
    assert!(elapsed >= Duration::from_millis(450), "failed early: {:?}", elapsed);
    assert!(elapsed < Duration::from_millis(1500), "failed late: {:?}", elapsed);
}

#[tokio::test]
async fn fallback_timeout_applies_without_deadline() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
        .mount(&server)
        .await;

    let config = RequestConfig::get(&server.uri()).timeout(Duration::from_millis(300));
    let err = quiet_engine().execute(&Context::background(), &config).await.unwrap_err();
    assert!(err.is_timeout());
    assert_eq!(err.kind(), ErrorKind::Timeout);
}

#[tokio::test]
async fn fallback_timeout_spans_headers_and_body() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        common::read_head(&mut stream).await;
        tokio::time::sleep(Duration::from_millis(400)).await;
        stream
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 4\r\n\r\n")
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(400)).await;
        let _ = stream.write_all(b"late").await;
    });

    let config = RequestConfig::get(&format!("http://{}/", addr))
        .timeout(Duration::from_millis(600))
        .retry(RetryPolicy::new().max_retries(0));
    let started = Instant::now();
    let err = quiet_engine().execute(&Context::background(), &config).await.unwrap_err();
    let elapsed = started.elapsed();

    assert!(err.is_timeout(), "unexpected error: {:?}", err);
    assert!(elapsed < Duration::from_millis(750), "body read got a fresh budget: {:?}", elapsed);
}

#[tokio::test]
async fn body_of_exactly_the_limit_is_accepted() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![b'a'; 1000]))
        .mount(&server)
        .await;

    let config = RequestConfig::get(&server.uri()).max_response_size(1000);
    let execution = quiet_engine().execute(&Context::background(), &config).await.unwrap();
    assert_eq!(execution.body().len(), 1000);
}

#[tokio::test]
async fn body_one_past_the_limit_is_rejected() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![b'a'; 1001]))
        .mount(&server)
        .await;

    let config = RequestConfig::get(&server.uri()).max_response_size(1000);
    let err = quiet_engine().execute(&Context::background(), &config).await.unwrap_err();
    assert!(err.is_size_exceeded());
}

#[tokio::test]
async fn oversized_body_reads_at_most_one_byte_past_limit() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![b'x'; 10 * 1024 * 1024]))
        .mount(&server)
        .await;

    let limit = 100 * 1024;
    let config = RequestConfig::get(&server.uri()).max_response_size(limit);
    let err = quiet_engine().execute(&Context::background(), &config).await.unwrap_err();
    match err.root() {
        Error::SizeExceeded { limit: seen, read } => {
            assert_eq!(*seen, limit);
            assert_eq!(*read, limit + 1);
        }
        other => panic!("unexpected error: {:?}", other),
    }
}

#[tokio::test]
async fn gzip_response_is_decoded() {
    let plain = "gzip payload ".repeat(500);
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(header_exists("accept-encoding"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-encoding", "gzip")
                .set_body_bytes(gzip(plain.as_bytes())),
        )
        .mount(&server)
        .await;

    let config = RequestConfig::get(&server.uri()).compressed(true);
    let execution = quiet_engine().execute(&Context::background(), &config).await.unwrap();
    assert_eq!(execution.status(), 200);
    assert_eq!(execution.text(), plain);
    assert!(execution.headers().get("content-encoding").is_none());
}

#[tokio::test]
async fn brotli_response_is_decoded() {
    let plain = "brotli payload ".repeat(500);
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-encoding", "br")
                .set_body_bytes(brotli(plain.as_bytes())),
        )
        .mount(&server)
        .await;

    let config = RequestConfig::get(&server.uri()).compressed(true);
    let execution = quiet_engine().execute(&Context::background(), &config).await.unwrap();
    assert_eq!(execution.text(), plain);
}

#[tokio::test]
async fn size_limit_applies_to_decoded_bytes() {
    let plain = vec![b'z'; 50_000];
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-encoding", "gzip")
                .set_body_bytes(gzip(&plain)),
        )
        .mount(&server)
        .await;

    let config = RequestConfig::get(&server.uri())
        .compressed(true)
        .max_response_size(10_000);
    let err = quiet_engine().execute(&Context::background(), &config).await.unwrap_err();
    assert!(err.is_size_exceeded());
}

#[tokio::test]
async fn concurrent_decompressions_never_mix_bodies() {
    let server = MockServer::start().await;
    for i in 0..50 {
        let plain = format!("body number {} ", i).repeat(200);
        let (encoding, encoded) = if i % 2 == 0 {
            ("gzip", gzip(plain.as_bytes()))
        } else {
            ("br", brotli(plain.as_bytes()))
        };
        Mock::given(method("GET"))
            .and(path(format!("/item/{}", i)))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-encoding", encoding)
                    .set_body_bytes(encoded),
            )
            .mount(&server)
            .await;
    }

    let engine = quiet_engine();
    let runs = (0..50).map(|i| {
        let engine = engine.clone();
        let config = RequestConfig::get(&format!("{}/item/{}", server.uri(), i)).compressed(true);
        async move {
            let execution = engine.execute(&Context::background(), &config).await.unwrap();
            (i, execution.text())
        }
    });
    for (i, text) in futures::future::join_all(runs).await {
        assert_eq!(text, format!("body number {} ", i).repeat(200));
    }
}

#[tokio::test]
async fn redirects_followed_only_when_enabled() {
    let server = MockServer::start().await;
    Mock::given(path("/start"))
        .respond_with(ResponseTemplate::new(302).insert_header("location", "/final"))
        .mount(&server)
        .await;
    Mock::given(path("/final"))
        .respond_with(ResponseTemplate::new(200).set_body_string("landed"))
        .mount(&server)
        .await;

    let url = format!("{}/start", server.uri());
    let engine = quiet_engine();

    let direct = engine
        .execute(&Context::background(), &RequestConfig::get(&url))
        .await
        .unwrap();
    assert_eq!(direct.status(), 302);

    let followed = engine
        .execute(&Context::background(), &RequestConfig::get(&url).follow_redirects(true))
        .await
        .unwrap();
    assert_eq!(followed.status(), 200);
    assert_eq!(followed.text(), "landed");
    assert_eq!(followed.url().path(), "/final");
}

#[tokio::test]
async fn redirect_loop_hits_hop_limit() {
    let server = MockServer::start().await;
    Mock::given(path("/loop"))
        .respond_with(ResponseTemplate::new(302).insert_header("location", "/loop"))
        .mount(&server)
        .await;

    let mut config = RequestConfig::get(&format!("{}/loop", server.uri())).follow_redirects(true);
    config.max_redirects = 3;
    let err = quiet_engine().execute(&Context::background(), &config).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Redirect);
}

#[tokio::test]
async fn cookie_jar_carries_session_between_executions() {
    let server = MockServer::start().await;
    Mock::given(path("/login"))
        .respond_with(ResponseTemplate::new(200).insert_header("set-cookie", "session=abc; Path=/"))
        .mount(&server)
        .await;
    Mock::given(path("/me"))
        .and(header("cookie", "session=abc"))
        .respond_with(ResponseTemplate::new(200).set_body_string("welcome"))
        .mount(&server)
        .await;
    Mock::given(path("/me"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;

    let jar = Arc::new(CookieJar::new());
    let engine = Engine::builder()
        .diagnostic_sink(Arc::new(tpx_runtime::diagnostics::MemorySink::new()))
        .cookie_store(jar.clone())
        .build();

    engine
        .execute(&Context::background(), &RequestConfig::get(&format!("{}/login", server.uri())))
        .await
        .unwrap();
    assert_eq!(jar.len(), 1);

    let me = engine
        .execute(&Context::background(), &RequestConfig::get(&format!("{}/me", server.uri())))
        .await
        .unwrap();
    assert_eq!(me.status(), 200);
    assert_eq!(me.text(), "welcome");
}

#[tokio::test]
async fn verbose_trace_redacts_credentials() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let sink = Arc::new(tpx_runtime::diagnostics::MemorySink::new());
    let engine = Engine::builder().diagnostic_sink(sink.clone()).build();
    let mut config = RequestConfig::get(&server.uri()).header("Authorization: Bearer s3cr3t-token");
    config.verbose = true;
    engine.execute(&Context::background(), &config).await.unwrap();

    let lines = sink.lines();
    assert!(lines.iter().any(|l| l.to_ascii_lowercase().starts_with("> authorization")));
    assert!(lines.iter().all(|l| !l.contains("s3cr3t-token")));
}
