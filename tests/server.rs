use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::oneshot;

use rservlet::adapter::native::native;
use rservlet::adapter::rhai::RhaiAdapter;
use rservlet::adapter::scheme::SchemeAdapter;
use rservlet::{AdapterRegistry, MountTable, Server, ServerSettings, ServletError};

struct Running {
    addr: SocketAddr,
    stop: oneshot::Sender<()>,
}

async fn start(mounts: MountTable, settings: ServerSettings) -> Running {
    let server = Server::bind("127.0.0.1:0")
        .await
        .unwrap()
        .with_settings(settings);
    let addr = server.local_addr();
    let (stop, stopped) = oneshot::channel::<()>();
    tokio::spawn(async move {
        server
            .run_until(mounts, async {
                let _ = stopped.await;
            })
            .await
            .unwrap();
    });
    Running { addr, stop }
}

async fn send(addr: SocketAddr, raw: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(raw.as_bytes()).await.unwrap();
    let mut out = Vec::new();
    stream.read_to_end(&mut out).await.unwrap();
    String::from_utf8(out).unwrap()
}

fn get(path: &str) -> String {
    format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
}

fn split(response: &str) -> (&str, &str) {
    let end = response.find("\r\n\r\n").expect("response head");
    (&response[..end + 2], &response[end + 4..])
}

fn demo(name: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("demos/servlets")
        .join(name)
}

fn mounts() -> MountTable {
    let mut mounts = MountTable::new();
    mounts
        .mount_servlet(
            "/chunked",
            native(|s| {
                s.write(b"hi")?;
                Ok(())
            }),
        )
        .unwrap();
    mounts
        .mount_servlet(
            "/formatted",
            native(|s| {
                s.set_header("Content-Type", "text/plain")?;
                s.write_formatted(format_args!("The number is: {}\n", 42))?;
                Ok(())
            }),
        )
        .unwrap();
    mounts
        .mount_servlet(
            "/late-status",
            native(|s| {
                s.write(b"a")?;
                let rejected = s.set_status(404);
                assert!(matches!(rejected, Err(ServletError::OrderingViolation { .. })));
                s.write(b"b")?;
                Ok(())
            }),
        )
        .unwrap();
    mounts
        .mount_servlet(
            "/fails",
            native(|s| {
                s.set_status(0)?;
                Ok(())
            }),
        )
        .unwrap();
    mounts
        .mount_servlet(
            "/args/*",
            native(|s| {
                let arg = s.get_argument("arg").unwrap_or("-").to_owned();
                let agent = s.get_header("user-agent").unwrap_or("-").to_owned();
                s.write_formatted(format_args!("{arg} {agent}"))?;
                Ok(())
            }),
        )
        .unwrap();
    mounts
}

#[tokio::test]
async fn default_response_is_chunked() {
    let server = start(mounts(), ServerSettings::default()).await;
    let response = send(server.addr, &get("/chunked")).await;
    let (head, body) = split(&response);
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"), "{head}");
    assert!(head.contains("Transfer-Encoding: chunked\r\n"));
    assert!(head.contains("Connection: close\r\n"));
    assert_eq!(body, "2\r\nhi\r\n0\r\n\r\n");
    let _ = server.stop.send(());
}

#[tokio::test]
async fn formatted_write_is_one_chunk() {
    let server = start(mounts(), ServerSettings::default()).await;
    let response = send(server.addr, &get("/formatted")).await;
    let (head, body) = split(&response);
    assert!(head.contains("Content-Type: text/plain\r\n"));
    assert_eq!(body, "12\r\nThe number is: 42\n\r\n0\r\n\r\n");
    let _ = server.stop.send(());
}

#[tokio::test]
async fn head_request_suppresses_formatted_body() {
    let server = start(mounts(), ServerSettings::default()).await;
    let response = send(
        server.addr,
        "HEAD /formatted HTTP/1.1\r\nConnection: close\r\n\r\n",
    )
    .await;
    let (head, body) = split(&response);
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(!head.contains("Transfer-Encoding"));
    assert_eq!(body, "");
    let _ = server.stop.send(());
}

#[tokio::test]
async fn late_status_keeps_the_sent_head() {
    let server = start(mounts(), ServerSettings::default()).await;
    let response = send(server.addr, &get("/late-status")).await;
    let (head, body) = split(&response);
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
    assert_eq!(body, "1\r\na\r\n1\r\nb\r\n0\r\n\r\n");
    let _ = server.stop.send(());
}

#[tokio::test]
async fn failing_servlet_gets_internal_error() {
    let server = start(mounts(), ServerSettings::default()).await;
    let response = send(server.addr, &get("/fails")).await;
    let (head, body) = split(&response);
    assert!(head.starts_with("HTTP/1.1 500 Internal Server Error\r\n"), "{head}");
    assert!(head.contains("Content-Length: 22\r\n"));
    assert_eq!(body, "Internal Server Error\n");
    let _ = server.stop.send(());
}

#[tokio::test]
async fn arguments_and_headers_reach_the_servlet() {
    let server = start(mounts(), ServerSettings::default()).await;
    let response = send(
        server.addr,
        "GET /args/deep/path?arg=a%20b HTTP/1.1\r\nUser-Agent: tester\r\nConnection: close\r\n\r\n",
    )
    .await;
    let (_, body) = split(&response);
    assert_eq!(body, "A\r\na b tester\r\n0\r\n\r\n");
    let _ = server.stop.send(());
}

#[tokio::test]
async fn unmounted_path_is_404() {
    let server = start(mounts(), ServerSettings::default()).await;
    let response = send(server.addr, &get("/nowhere")).await;
    let (head, body) = split(&response);
    assert!(head.starts_with("HTTP/1.1 404 Not Found\r\n"));
    assert_eq!(body, "No servlet mounted at /nowhere\n");
    let _ = server.stop.send(());
}

#[tokio::test]
async fn malformed_request_is_400() {
    let server = start(mounts(), ServerSettings::default()).await;
    let response = send(server.addr, "NOT HTTP\r\n\r\n").await;
    assert!(response.starts_with("HTTP/1.1 400 Bad Request\r\n"), "{response}");
    assert!(response.contains("Connection: close\r\n"));
    let _ = server.stop.send(());
}

#[tokio::test]
async fn oversized_request_is_413() {
    let settings = ServerSettings {
        max_request_bytes: 64,
        ..ServerSettings::default()
    };
    let server = start(mounts(), settings).await;
    let response = send(
        server.addr,
        "POST /chunked HTTP/1.1\r\nContent-Length: 1000\r\n\r\n",
    )
    .await;
    assert!(response.starts_with("HTTP/1.1 413 Payload Too Large\r\n"), "{response}");
    let _ = server.stop.send(());
}

#[tokio::test]
async fn huge_content_length_is_413() {
    let server = start(mounts(), ServerSettings::default()).await;
    let response = send(
        server.addr,
        "POST /chunked HTTP/1.1\r\nContent-Length: 18446744073709551615\r\n\r\n",
    )
    .await;
    assert!(response.starts_with("HTTP/1.1 413 Payload Too Large\r\n"), "{response}");
    let _ = server.stop.send(());
}

#[tokio::test]
async fn pipelined_requests_share_a_connection() {
    let server = start(mounts(), ServerSettings::default()).await;
    let raw = format!("GET /chunked HTTP/1.1\r\n\r\n{}", get("/formatted"));
    let response = send(server.addr, &raw).await;
    assert_eq!(response.matches("HTTP/1.1 200 OK\r\n").count(), 2);
    assert!(response.contains("Connection: keep-alive\r\n"));
    assert!(response.ends_with("12\r\nThe number is: 42\n\r\n0\r\n\r\n"));
    let _ = server.stop.send(());
}

#[tokio::test]
async fn small_output_buffer_still_streams_everything() {
    let settings = ServerSettings {
        output_buffer_bytes: 4,
        ..ServerSettings::default()
    };
    let server = start(mounts(), settings).await;
    let response = send(server.addr, &get("/formatted")).await;
    let (_, body) = split(&response);
    assert_eq!(body, "12\r\nThe number is: 42\n\r\n0\r\n\r\n");
    let _ = server.stop.send(());
}

#[tokio::test]
async fn rhai_demo_servlets() {
    let mut registry = AdapterRegistry::new();
    registry.register(Arc::new(RhaiAdapter::new().with_max_operations(100_000)));

    let mut mounts = MountTable::new();
    for (point, file) in [
        ("/hello", "hello.rhai"),
        ("/test", "test.rhai"),
        ("/count", "count.rhai"),
        ("/content-length", "content_length.rhai"),
    ] {
        mounts.mount(&registry, point, &demo(file), None).unwrap();
    }
    let server = start(mounts, ServerSettings::default()).await;

    let response = send(server.addr, &get("/hello?name=rhai")).await;
    assert_eq!(split(&response).1, "C\r\nhello, rhai\n\r\n0\r\n\r\n");

    let response = send(
        server.addr,
        "GET /test?arg=x HTTP/1.1\r\nUser-Agent: curl\r\nConnection: close\r\n\r\n",
    )
    .await;
    assert_eq!(
        split(&response).1,
        "2\r\nx\n\r\n4\r\nGET\n\r\n5\r\ncurl\n\r\n12\r\nThe number is: 42\n\r\n0\r\n\r\n"
    );

    let response = send(server.addr, &get("/count")).await;
    let body = split(&response).1;
    assert!(body.starts_with("9\r\ncount: 0\n\r\n"));
    assert!(body.ends_with("5\r\ndone\n\r\n0\r\n\r\n"));

    let response = send(server.addr, &get("/content-length")).await;
    let (head, body) = split(&response);
    assert!(head.contains("Content-Length: 41\r\n"));
    assert!(!head.contains("Transfer-Encoding"));
    assert_eq!(body, "Testing setting the Content-Length header");

    let _ = server.stop.send(());
    registry.shutdown();
}

#[tokio::test]
async fn scheme_demo_servlet() {
    let mut registry = AdapterRegistry::new();
    registry.register(Arc::new(SchemeAdapter::new()));

    let mut mounts = MountTable::new();
    mounts
        .mount(&registry, "/scheme", &demo("test.scm"), None)
        .unwrap();
    let server = start(mounts, ServerSettings::default()).await;

    let response = send(
        server.addr,
        "GET /scheme?arg=x HTTP/1.1\r\nUser-Agent: curl\r\nConnection: close\r\n\r\n",
    )
    .await;
    let (head, body) = split(&response);
    assert!(head.contains("Content-Type: text/plain; charset=UTF-8\r\n"));
    assert_eq!(body, "2\r\nx\n\r\n4\r\nGET\n\r\n5\r\ncurl\n\r\n0\r\n\r\n");

    let _ = server.stop.send(());
    registry.shutdown();
}
