mod common;

use std::time::{Duration, Instant};

use redirect_tracer::{HttpOnlyTracer, RedirectTracer, RedirectType};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use wiremock::matchers::{method, path, path_regex};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

use common::context;

/// `/r/N` answers 302 with a relative Location to `/r/N+1`, forever.
struct Endless;

impl Respond for Endless {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let n: u32 = request
            .url
            .path()
            .rsplit('/')
            .next()
            .and_then(|segment| segment.parse().ok())
            .unwrap_or(0);
        ResponseTemplate::new(302).insert_header("Location", format!("../r/{}", n + 1).as_str())
    }
}

async fn redirect(server: &MockServer, from: &str, status: u16, to: &str) {
    Mock::given(method("GET"))
        .and(path(from))
        .respond_with(ResponseTemplate::new(status).insert_header("Location", format!("{}{}", server.uri(), to).as_str()))
        .mount(server)
        .await;
}

#[tokio::test]
async fn three_permanent_redirects_then_landing() {
    let server = MockServer::start().await;
    redirect(&server, "/click", 301, "/hop1").await;
    redirect(&server, "/hop1", 301, "/hop2").await;
    redirect(&server, "/hop2", 301, "/landing").await;
    Mock::given(method("GET"))
        .and(path("/landing"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>landing</html>"))
        .mount(&server)
        .await;

    let ctx = context(&format!("{}/click?aff=7", server.uri()), 20, Duration::from_secs(5));
    let result = HttpOnlyTracer::default().trace(&ctx).await.unwrap();

    assert_eq!(result.chain.len(), 4);
    for (index, hop) in result.chain.iter().enumerate() {
        assert_eq!(hop.sequence, index);
    }
    for hop in &result.chain[..3] {
        assert_eq!(hop.redirect_type, RedirectType::Http);
        assert_eq!(hop.http_status, 301);
    }
    let last = result.chain.last().unwrap();
    assert_eq!(last.redirect_type, RedirectType::Final);
    assert_eq!(last.http_status, 200);
    assert_eq!(result.final_url, last.url);
    assert_eq!(result.final_url, format!("{}/landing", server.uri()));
    assert!(result.success);
    assert_eq!(result.chain[0].params.get("aff").map(String::as_str), Some("7"));
    assert!(result.total_bandwidth_bytes > 0);

    let metrics = result.parallel_metrics.unwrap();
    assert_eq!(metrics.hops_launched, 4);
    assert!(!metrics.budget_exhausted);
}

#[tokio::test]
async fn self_redirect_is_a_loop() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/loop"))
        .respond_with(ResponseTemplate::new(302).insert_header("Location", "/loop"))
        .mount(&server)
        .await;

    let ctx = context(&format!("{}/loop", server.uri()), 20, Duration::from_secs(5));
    let result = HttpOnlyTracer::default().trace(&ctx).await.unwrap();

    let last = result.chain.last().unwrap();
    assert!(last.error.as_deref().unwrap().contains("loop"));
    assert_eq!(last.redirect_type, RedirectType::Error);
    assert!(!result.success);
    assert_eq!(result.chain.len(), 2);
    assert_eq!(server.received_requests().await.unwrap().len(), 1);
}

#[tokio::test]
async fn unresponsive_target_respects_budget() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(10)))
        .mount(&server)
        .await;

    let timeout = Duration::from_millis(50);
    let ctx = context(&format!("{}/slow", server.uri()), 20, timeout);
    let started = Instant::now();
    let result = HttpOnlyTracer::default().trace(&ctx).await.unwrap();
    let elapsed = started.elapsed();

    assert!(!result.chain.is_empty());
    assert!(!result.success);
    assert!(result.chain.last().unwrap().is_error());
    assert!(elapsed < timeout * 2, "trace took {elapsed:?}");
}

#[tokio::test]
async fn redirect_cap_ends_with_error_hop() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path_regex(r"^/r/\d+$"))
        .respond_with(Endless)
        .mount(&server)
        .await;

    let ctx = context(&format!("{}/r/0", server.uri()), 3, Duration::from_secs(5));
    let result = HttpOnlyTracer::default().trace(&ctx).await.unwrap();

    assert_eq!(result.chain.len(), 4);
    let last = result.chain.last().unwrap();
    assert_eq!(last.error.as_deref(), Some("max redirects reached"));
    assert!(!result.success);
    // Relative locations resolve against the hop that returned them.
    assert_eq!(result.chain[1].url, format!("{}/r/1", server.uri()));
    assert_eq!(server.received_requests().await.unwrap().len(), 4);
}

#[tokio::test]
async fn client_error_is_terminal() {
    let server = MockServer::start().await;
    redirect(&server, "/click", 302, "/gone").await;
    Mock::given(method("GET"))
        .and(path("/gone"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let ctx = context(&format!("{}/click", server.uri()), 20, Duration::from_secs(5));
    let result = HttpOnlyTracer::default().trace(&ctx).await.unwrap();

    assert_eq!(result.chain.len(), 2);
    let last = result.chain.last().unwrap();
    assert_eq!(last.http_status, 404);
    assert_eq!(last.error.as_deref(), Some("http status 404"));
    assert_eq!(result.final_url, format!("{}/gone", server.uri()));
    assert!(!result.success);
}

/// Minimal HTTP/1.1 server writing raw heads, for headers wiremock cannot emit.
async fn raw_server(routes: Vec<(&'static str, Vec<u8>)>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else { break };
            let routes = routes.clone();
            tokio::spawn(async move {
                let mut buffer = vec![0u8; 4096];
                let mut read = 0;
                while !buffer[..read].windows(4).any(|w| w == b"\r\n\r\n") {
                    match socket.read(&mut buffer[read..]).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => read += n,
                    }
                }
                let head = String::from_utf8_lossy(&buffer[..read]).to_string();
                let target = head.split_whitespace().nth(1).unwrap_or("/").to_string();
                let response = routes
                    .iter()
                    .find(|(route, _)| *route == target)
                    .map(|(_, response)| response.clone())
                    .unwrap_or_else(|| b"HTTP/1.1 404 Not Found\r\ncontent-length: 0\r\nconnection: close\r\n\r\n".to_vec());
                let _ = socket.write_all(&response).await;
                let _ = socket.shutdown().await;
            });
        }
    });
    format!("http://{address}")
}

#[tokio::test]
async fn raw_utf8_location_is_followed() {
    let base = raw_server(vec![
        (
            "/start",
            b"HTTP/1.1 302 Found\r\nlocation: /caf\xc3\xa9\r\ncontent-length: 0\r\nconnection: close\r\n\r\n".to_vec(),
        ),
        (
            "/caf%C3%A9",
            b"HTTP/1.1 200 OK\r\ncontent-length: 2\r\nconnection: close\r\n\r\nok".to_vec(),
        ),
    ])
    .await;

    let ctx = context(&format!("{base}/start"), 20, Duration::from_secs(5));
    let result = HttpOnlyTracer::default().trace(&ctx).await.unwrap();

    assert_eq!(result.chain.len(), 2);
    assert_eq!(result.chain[0].http_status, 302);
    assert_eq!(result.chain[0].redirect_type, RedirectType::Http);
    assert_eq!(result.chain[1].http_status, 200);
    assert_eq!(result.final_url, format!("{base}/caf%C3%A9"));
    assert!(result.success);
}
