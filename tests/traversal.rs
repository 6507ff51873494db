mod utils;

use fixtures::{server, Error, TestServer};
use rstest::rstest;
use std::io::{Read, Write};
use std::net::TcpStream;

/// Sends a request line verbatim; HTTP clients would normalize the path.
fn raw_get(server: &TestServer, path: &str) -> Result<String, Error> {
    let mut stream = TcpStream::connect(("127.0.0.1", server.port()))?;
    write!(
        stream,
        "GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n"
    )?;
    let mut response = String::new();
    stream.read_to_string(&mut response)?;
    Ok(response)
}

#[rstest]
#[case("/../a.txt")]
#[case("/%2e%2e/a.txt")]
#[case("/sub/../../a.txt")]
#[case("/sub/%2E%2E/%2E%2E/etc/passwd")]
#[case("/..%2f..%2fetc/passwd")]
fn traversal_is_rejected(server: TestServer, #[case] path: &str) -> Result<(), Error> {
    let response = raw_get(&server, path)?;
    assert!(
        response.starts_with("HTTP/1.1 500"),
        "{path}: {}",
        response.lines().next().unwrap_or_default()
    );
    assert!(!response.contains("abcd"));
    assert!(response.ends_with("Internal Server Error"));
    Ok(())
}

#[rstest]
fn traversal_does_not_leak_existence(server: TestServer) -> Result<(), Error> {
    let existing = raw_get(&server, "/../a.txt")?;
    let missing = raw_get(&server, "/../does-not-exist")?;
    let status = |v: &str| v.lines().next().unwrap_or_default().to_string();
    assert_eq!(status(&existing), status(&missing));
    Ok(())
}

#[rstest]
fn dot_segments_inside_root(server: TestServer) -> Result<(), Error> {
    let response = raw_get(&server, "/sub/../a.txt")?;
    assert!(response.starts_with("HTTP/1.1 200"));
    assert!(response.ends_with("abcd"));
    Ok(())
}
