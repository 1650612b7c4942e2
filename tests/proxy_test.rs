//! End-to-end tests: the proxy runs in-process on a loopback port and talks
//! to scripted origin servers.

#![allow(clippy::unwrap_used)]

use cacheproxy::{CacheEntry, ProxyConfig, ProxyServer};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

const LM1: &str = "Tue, 01 Jan 2024 00:00:00 GMT";
const LM2: &str = "Wed, 02 Jan 2024 00:00:00 GMT";
const IO_TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================================
// Infrastructure
// ============================================================================

async fn start_proxy(dir: &tempfile::TempDir) -> (ProxyServer, SocketAddr) {
    let config = ProxyConfig::default()
        .with_listen_addr("127.0.0.1:0".parse().unwrap())
        .with_report_path(dir.path().join("report.txt"));
    let server = ProxyServer::new(config);
    let addr = server.start().await.unwrap();
    (server, addr)
}

/// Origin that answers the n-th connection with the n-th scripted response
/// (repeating the last one) and records every request it receives.
struct Origin {
    addr: SocketAddr,
    requests: Arc<Mutex<Vec<String>>>,
    accepted: Arc<AtomicUsize>,
}

impl Origin {
    async fn spawn(responses: Vec<&'static str>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let accepted = Arc::new(AtomicUsize::new(0));

        let (req_log, count) = (Arc::clone(&requests), Arc::clone(&accepted));
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                let n = count.fetch_add(1, Ordering::SeqCst);
                let response = responses[n.min(responses.len() - 1)];

                let request = read_request(&mut stream).await;
                req_log.lock().unwrap().push(request);

                let _ = stream.write_all(response.as_bytes()).await;
                let _ = stream.shutdown().await;
            }
        });

        Self {
            addr,
            requests,
            accepted,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    fn request(&self, n: usize) -> String {
        self.requests.lock().unwrap()[n].clone()
    }

    fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }
}

/// Read a request head plus a `Content-Length` body.
async fn read_request(stream: &mut TcpStream) -> String {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];

    let head_end = loop {
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
        let n = stream.read(&mut chunk).await.unwrap();
        if n == 0 {
            break buf.len();
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    let head = String::from_utf8_lossy(&buf[..head_end]).to_string();
    let body_len = head
        .lines()
        .find_map(|l| l.strip_prefix("Content-Length: "))
        .and_then(|v| v.trim().parse::<usize>().ok())
        .unwrap_or(0);

    while buf.len() < head_end + body_len {
        let n = stream.read(&mut chunk).await.unwrap();
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }

    String::from_utf8_lossy(&buf).to_string()
}

/// Send raw bytes to the proxy and collect everything until it closes.
async fn send(proxy: SocketAddr, request: &str) -> String {
    let mut stream = TcpStream::connect(proxy).await.unwrap();
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut response = Vec::new();
    timeout(IO_TIMEOUT, stream.read_to_end(&mut response))
        .await
        .expect("proxy did not close the connection")
        .unwrap();
    String::from_utf8_lossy(&response).to_string()
}

async fn get(proxy: SocketAddr, method: &str, url: &str) -> String {
    send(proxy, &format!("{} {} HTTP/1.1\r\nAccept: */*\r\n\r\n", method, url)).await
}

/// Echoes every byte back until the peer closes.
async fn spawn_echo() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut r, mut w) = stream.into_split();
                let _ = tokio::io::copy(&mut r, &mut w).await;
                let _ = w.shutdown().await;
            });
        }
    });
    addr
}

fn unused_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

// ============================================================================
// Blocklist
// ============================================================================

#[tokio::test]
async fn test_blocked_host_gets_401_without_origin_contact() {
    let dir = tempfile::tempdir().unwrap();
    let (proxy, addr) = start_proxy(&dir).await;
    let origin = Origin::spawn(vec!["HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n"]).await;

    proxy.add_blocked_host("127.0.0.1");
    let url = origin.url("/page");
    let response = get(addr, "GET", &url).await;

    assert_eq!(response, "HTTP/1.1 401 Unauthorized\r\n\r\nBlocked by proxy\r\n");
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(origin.accepted(), 0);
    assert!(proxy
        .log_records()
        .contains(&format!("GET {} HTTP/1.1", url)));
    assert_eq!(proxy.stats().blocked, 1);
}

#[tokio::test]
async fn test_blocked_connect_target() {
    let dir = tempfile::tempdir().unwrap();
    let (proxy, addr) = start_proxy(&dir).await;

    proxy.add_blocked_host("blocked.test");
    let response = send(addr, "CONNECT blocked.test:443 HTTP/1.1\r\n\r\n").await;

    assert!(response.starts_with("HTTP/1.1 401 Unauthorized"));
    assert!(proxy.log_records().is_empty());
}

#[tokio::test]
async fn test_blocklist_is_exact_match() {
    let dir = tempfile::tempdir().unwrap();
    let (proxy, addr) = start_proxy(&dir).await;

    proxy.add_blocked_host("blocked.test");
    let response = get(addr, "PUT", "http://www.blocked.test/page").await;

    assert_eq!(response, "HTTP/1.1 405 Method Not Allowed\r\n\r\n");
}

#[tokio::test]
async fn test_blocklist_matches_host_as_sent() {
    let dir = tempfile::tempdir().unwrap();
    let (proxy, addr) = start_proxy(&dir).await;

    proxy.add_blocked_host("Blocked.Test");
    let connect = send(addr, "CONNECT Blocked.Test:443 HTTP/1.1\r\n\r\n").await;
    let get_response = get(addr, "GET", "http://Blocked.Test/page").await;
    let other_case = get(addr, "PUT", "http://blocked.test/page").await;

    assert!(connect.starts_with("HTTP/1.1 401 Unauthorized"));
    assert_eq!(get_response, "HTTP/1.1 401 Unauthorized\r\n\r\nBlocked by proxy\r\n");
    assert_eq!(other_case, "HTTP/1.1 405 Method Not Allowed\r\n\r\n");
    assert_eq!(proxy.stats().blocked, 2);
}

#[tokio::test]
async fn test_blocked_answered_before_request_head_ends() {
    let dir = tempfile::tempdir().unwrap();
    let (proxy, addr) = start_proxy(&dir).await;
    proxy.add_blocked_host("blocked.test");

    let mut client = TcpStream::connect(addr).await.unwrap();
    client
        .write_all(b"GET http://blocked.test/ HTTP/1.1\r\nAccept: */*\r\n")
        .await
        .unwrap();

    let expected = b"HTTP/1.1 401 Unauthorized\r\n\r\nBlocked by proxy\r\n";
    let mut response = vec![0u8; expected.len()];
    timeout(IO_TIMEOUT, client.read_exact(&mut response)).await.unwrap().unwrap();
    assert_eq!(response, expected);
}

// ============================================================================
// Forwarding and caching
// ============================================================================

#[tokio::test]
async fn test_get_populates_cache() {
    let dir = tempfile::tempdir().unwrap();
    let (proxy, addr) = start_proxy(&dir).await;
    let origin = Origin::spawn(vec![
        "HTTP/1.1 200 OK\r\nLast-Modified: Tue, 01 Jan 2024 00:00:00 GMT\r\nContent-Length: 2\r\n\r\nhi",
    ])
    .await;

    let url = origin.url("/page");
    let response = get(addr, "GET", &url).await;

    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(response.contains("Last-Modified: Tue, 01 Jan 2024 00:00:00 GMT\r\n"));
    assert!(response.ends_with("\r\n\r\nhi"));

    let entry = proxy.context().cache.get(&url).unwrap();
    assert_eq!(entry, CacheEntry::new("hi", LM1));

    let records = proxy.log_records();
    assert!(records.contains(&format!("Cached URL: {} with Last-Modified: {}", url, LM1)));

    let request = origin.request(0);
    assert!(request.starts_with("GET /page HTTP/1.1\r\n"));
    assert!(!request.contains("If-Modified-Since"));
}

#[tokio::test]
async fn test_not_modified_serves_cached_body() {
    let dir = tempfile::tempdir().unwrap();
    let (proxy, addr) = start_proxy(&dir).await;
    let origin = Origin::spawn(vec![
        "HTTP/1.1 200 OK\r\nLast-Modified: Tue, 01 Jan 2024 00:00:00 GMT\r\nContent-Length: 2\r\n\r\nhi",
        "HTTP/1.1 304 Not Modified\r\nDate: Thu, 03 Jan 2024 00:00:00 GMT\r\n\r\n",
    ])
    .await;

    let url = origin.url("/page");
    get(addr, "GET", &url).await;
    let response = get(addr, "GET", &url).await;

    assert_eq!(response, "HTTP/1.1 304 Not Modified\r\n\r\nhi");
    assert!(origin
        .request(1)
        .contains(&format!("If-Modified-Since: {}\r\n", LM1)));
    assert_eq!(proxy.stats().cache_hits, 1);
}

#[tokio::test]
async fn test_not_modified_without_cache_is_forwarded() {
    let dir = tempfile::tempdir().unwrap();
    let (_proxy, addr) = start_proxy(&dir).await;
    let origin = Origin::spawn(vec!["HTTP/1.1 304 Not Modified\r\nETag: \"v1\"\r\n\r\n"]).await;

    let response = get(addr, "GET", &origin.url("/")).await;

    assert_eq!(response, "HTTP/1.1 304 Not Modified\r\nETag: \"v1\"\r\n\r\n");
}

#[tokio::test]
async fn test_modified_resource_replaces_cache_entry() {
    let dir = tempfile::tempdir().unwrap();
    let (proxy, addr) = start_proxy(&dir).await;
    let origin = Origin::spawn(vec![
        "HTTP/1.1 200 OK\r\nLast-Modified: Tue, 01 Jan 2024 00:00:00 GMT\r\nContent-Length: 2\r\n\r\nhi",
        "HTTP/1.1 200 OK\r\nLast-Modified: Wed, 02 Jan 2024 00:00:00 GMT\r\nContent-Length: 5\r\n\r\nhello",
    ])
    .await;

    let url = origin.url("/page");
    get(addr, "GET", &url).await;
    let response = get(addr, "GET", &url).await;

    assert!(response.ends_with("hello"));
    assert_eq!(
        proxy.context().cache.get(&url).unwrap(),
        CacheEntry::new("hello", LM2)
    );
}

#[tokio::test]
async fn test_head_and_options_bypass_cache() {
    let dir = tempfile::tempdir().unwrap();
    let (proxy, addr) = start_proxy(&dir).await;
    let origin = Origin::spawn(vec![
        "HTTP/1.1 200 OK\r\nLast-Modified: Tue, 01 Jan 2024 00:00:00 GMT\r\nContent-Length: 2\r\n\r\nhi",
        "HTTP/1.1 200 OK\r\nLast-Modified: Wed, 02 Jan 2024 00:00:00 GMT\r\nContent-Length: 5\r\n\r\n",
        "HTTP/1.1 200 OK\r\nAllow: GET, HEAD\r\nLast-Modified: Wed, 02 Jan 2024 00:00:00 GMT\r\nContent-Length: 0\r\n\r\n",
    ])
    .await;

    let url = origin.url("/page");
    get(addr, "GET", &url).await;

    let head = get(addr, "HEAD", &url).await;
    assert_eq!(
        head,
        "HTTP/1.1 200 OK\r\nLast-Modified: Wed, 02 Jan 2024 00:00:00 GMT\r\nContent-Length: 5\r\n\r\n"
    );
    let options = get(addr, "OPTIONS", &url).await;
    assert!(options.contains("Allow: GET, HEAD\r\n"));

    assert!(origin.request(1).starts_with("HEAD /page HTTP/1.1\r\n"));
    assert!(!origin.request(1).contains("If-Modified-Since"));
    assert!(origin.request(2).starts_with("OPTIONS /page HTTP/1.1\r\n"));
    assert!(!origin.request(2).contains("If-Modified-Since"));
    assert_eq!(
        proxy.context().cache.get(&url).unwrap(),
        CacheEntry::new("hi", LM1)
    );
}

#[tokio::test]
async fn test_multi_valued_headers_are_preserved() {
    let dir = tempfile::tempdir().unwrap();
    let (proxy, addr) = start_proxy(&dir).await;
    let origin = Origin::spawn(vec![
        "HTTP/1.1 404 Not Found\r\nSet-Cookie: a=1\r\nSet-Cookie: b=2\r\nContent-Length: 4\r\n\r\nnope",
    ])
    .await;

    let response = get(addr, "GET", &origin.url("/missing")).await;

    assert_eq!(
        response,
        "HTTP/1.1 404 Not Found\r\nSet-Cookie: a=1\r\nSet-Cookie: b=2\r\nContent-Length: 4\r\n\r\nnope"
    );
    assert!(proxy.context().cache.is_empty());
}

#[tokio::test]
async fn test_body_until_close_without_content_length() {
    let dir = tempfile::tempdir().unwrap();
    let (proxy, addr) = start_proxy(&dir).await;
    let origin = Origin::spawn(vec![
        "HTTP/1.1 200 OK\r\nLast-Modified: Tue, 01 Jan 2024 00:00:00 GMT\r\n\r\nstreamed body",
    ])
    .await;

    let url = origin.url("/stream");
    let response = get(addr, "GET", &url).await;

    assert!(response.ends_with("\r\n\r\nstreamed body"));
    assert_eq!(
        proxy.context().cache.get(&url).unwrap(),
        CacheEntry::new("streamed body", LM1)
    );
}

#[tokio::test]
async fn test_post_forwards_body_and_skips_cache() {
    let dir = tempfile::tempdir().unwrap();
    let (proxy, addr) = start_proxy(&dir).await;
    let origin = Origin::spawn(vec![
        "HTTP/1.1 201 Created\r\nLast-Modified: Tue, 01 Jan 2024 00:00:00 GMT\r\nContent-Length: 2\r\n\r\nok",
    ])
    .await;

    let url = origin.url("/submit");
    let response = send(
        addr,
        &format!("POST {} HTTP/1.1\r\nContent-Length: 5\r\n\r\nhello", url),
    )
    .await;

    assert!(response.starts_with("HTTP/1.1 201 Created\r\n"));
    assert!(response.ends_with("ok"));

    let request = origin.request(0);
    assert!(request.starts_with("POST /submit HTTP/1.1\r\n"));
    assert!(request.contains("Content-Length: 5\r\n"));
    assert!(request.ends_with("\r\n\r\nhello"));
    assert!(proxy.context().cache.get(&url).is_none());
}

#[tokio::test]
async fn test_unreachable_origin_gets_500() {
    let dir = tempfile::tempdir().unwrap();
    let (_proxy, addr) = start_proxy(&dir).await;

    let url = format!("http://127.0.0.1:{}/", unused_port());
    let response = get(addr, "GET", &url).await;

    assert_eq!(response, "HTTP/1.1 500 Internal Server Error\r\n\r\n");
}

#[tokio::test]
async fn test_malformed_origin_response_gets_500() {
    let dir = tempfile::tempdir().unwrap();
    let (_proxy, addr) = start_proxy(&dir).await;
    let origin = Origin::spawn(vec!["this is not http\r\n\r\n"]).await;

    let response = get(addr, "GET", &origin.url("/")).await;

    assert_eq!(response, "HTTP/1.1 500 Internal Server Error\r\n\r\n");
}

#[tokio::test]
async fn test_origin_failure_mid_body_truncates_without_500() {
    let dir = tempfile::tempdir().unwrap();
    let (proxy, addr) = start_proxy(&dir).await;
    let origin = Origin::spawn(vec![
        "HTTP/1.1 200 OK\r\nLast-Modified: Tue, 01 Jan 2024 00:00:00 GMT\r\nContent-Length: 10\r\n\r\nabc",
    ])
    .await;

    let url = origin.url("/partial");
    let response = get(addr, "GET", &url).await;

    assert_eq!(
        response,
        "HTTP/1.1 200 OK\r\nLast-Modified: Tue, 01 Jan 2024 00:00:00 GMT\r\nContent-Length: 10\r\n\r\nabc"
    );
    assert!(!response.contains("500"));
    assert!(proxy.context().cache.is_empty());
    assert!(!proxy
        .log_records()
        .iter()
        .any(|r| r.starts_with("Cached URL:")));
}

#[tokio::test]
async fn test_malformed_url_fails_open_then_500() {
    let dir = tempfile::tempdir().unwrap();
    let (proxy, addr) = start_proxy(&dir).await;
    proxy.add_blocked_host("relative");

    let response = get(addr, "GET", "/relative/path").await;

    assert_eq!(response, "HTTP/1.1 500 Internal Server Error\r\n\r\n");
    assert!(proxy
        .log_records()
        .contains(&"GET /relative/path HTTP/1.1".to_string()));
}

// ============================================================================
// Request handling
// ============================================================================

#[tokio::test]
async fn test_unsupported_method_is_405_and_logged() {
    let dir = tempfile::tempdir().unwrap();
    let (proxy, addr) = start_proxy(&dir).await;

    let response = get(addr, "PUT", "http://x/").await;

    assert_eq!(response, "HTTP/1.1 405 Method Not Allowed\r\n\r\n");
    assert_eq!(proxy.log_records(), vec!["PUT http://x/ HTTP/1.1".to_string()]);
}

#[tokio::test]
async fn test_malformed_and_empty_requests_close_silently() {
    let dir = tempfile::tempdir().unwrap();
    let (proxy, addr) = start_proxy(&dir).await;

    assert_eq!(send(addr, "HELLO\r\n\r\n").await, "");
    assert_eq!(send(addr, "\r\n").await, "");

    let mut closed = TcpStream::connect(addr).await.unwrap();
    closed.shutdown().await.unwrap();
    let mut response = Vec::new();
    timeout(IO_TIMEOUT, closed.read_to_end(&mut response)).await.unwrap().unwrap();
    assert!(response.is_empty());
    assert!(proxy.log_records().is_empty());
}

#[tokio::test]
async fn test_duplicate_request_lines_reported_once() {
    let dir = tempfile::tempdir().unwrap();
    let (proxy, addr) = start_proxy(&dir).await;
    let origin = Origin::spawn(vec!["HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n"]).await;

    let url = origin.url("/");
    get(addr, "GET", &url).await;
    get(addr, "GET", &url).await;

    let path = proxy.generate_report().await.unwrap();
    let report = std::fs::read_to_string(path).unwrap();
    let line = format!("GET {} HTTP/1.1", url);

    assert_eq!(report.lines().filter(|l| *l == line).count(), 1);
    assert_eq!(report, format!("{}\n", line));
    assert_eq!(origin.accepted(), 2);
}

// ============================================================================
// CONNECT tunnels
// ============================================================================

#[tokio::test]
async fn test_connect_relays_bytes_both_ways() {
    let dir = tempfile::tempdir().unwrap();
    let (proxy, addr) = start_proxy(&dir).await;
    let echo = spawn_echo().await;

    let mut client = TcpStream::connect(addr).await.unwrap();
    client
        .write_all(format!("CONNECT {} HTTP/1.1\r\nHost: {}\r\n\r\nearly ", echo, echo).as_bytes())
        .await
        .unwrap();

    let established = b"HTTP/1.1 200 Connection Established\r\n\r\n";
    let mut head = vec![0u8; established.len()];
    timeout(IO_TIMEOUT, client.read_exact(&mut head)).await.unwrap().unwrap();
    assert_eq!(head, established);

    client.write_all(b"\x16\x03\x01 opaque").await.unwrap();
    client.shutdown().await.unwrap();

    let mut echoed = Vec::new();
    timeout(IO_TIMEOUT, client.read_to_end(&mut echoed)).await.unwrap().unwrap();
    assert_eq!(echoed, b"early \x16\x03\x01 opaque");

    assert!(proxy.log_records().is_empty());
}

#[tokio::test]
async fn test_connect_failure_gets_500() {
    let dir = tempfile::tempdir().unwrap();
    let (proxy, addr) = start_proxy(&dir).await;

    let response = send(
        addr,
        &format!("CONNECT 127.0.0.1:{} HTTP/1.1\r\n\r\n", unused_port()),
    )
    .await;

    assert_eq!(response, "HTTP/1.1 500 Internal Server Error\r\n\r\n");
    assert_eq!(proxy.stats().tunnels, 0);
}

// ============================================================================
// Lifecycle
// ============================================================================

#[tokio::test]
async fn test_stop_keeps_inflight_connections() {
    let dir = tempfile::tempdir().unwrap();
    let (proxy, addr) = start_proxy(&dir).await;
    let echo = spawn_echo().await;

    let mut client = TcpStream::connect(addr).await.unwrap();
    client
        .write_all(format!("CONNECT {} HTTP/1.1\r\n\r\n", echo).as_bytes())
        .await
        .unwrap();
    let mut head = [0u8; 39];
    timeout(IO_TIMEOUT, client.read_exact(&mut head)).await.unwrap().unwrap();

    proxy.stop();

    let mut refused = false;
    for _ in 0..50 {
        if TcpStream::connect(addr).await.is_err() {
            refused = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(refused, "listener still accepting after stop");

    client.write_all(b"still here").await.unwrap();
    let mut buf = [0u8; 10];
    timeout(IO_TIMEOUT, client.read_exact(&mut buf)).await.unwrap().unwrap();
    assert_eq!(&buf, b"still here");
}
