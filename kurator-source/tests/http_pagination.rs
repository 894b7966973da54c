use std::io::{BufRead, BufReader, Write};
use std::net::TcpListener;
use std::sync::mpsc;
use std::thread;

use kurator_core::config::SourceConfig;
use kurator_core::{EntityKind, School, SourceId};
use kurator_source::{HttpSourceClient, SourceClient, SourceError};

/// Serve one canned response per connection and report each request line
/// plus its Authorization header.
fn serve(responses: Vec<(u16, String)>) -> (String, mpsc::Receiver<(String, String)>) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().expect("addr");
    let (tx, rx) = mpsc::channel();

    thread::spawn(move || {
        for (status, body) in responses {
            let (stream, _) = match listener.accept() {
                Ok(conn) => conn,
                Err(_) => return,
            };
            let mut reader = BufReader::new(stream.try_clone().expect("clone"));
            let mut request_line = String::new();
            reader.read_line(&mut request_line).expect("request line");
            let mut auth = String::new();
            loop {
                let mut line = String::new();
                reader.read_line(&mut line).expect("header");
                if line.trim().is_empty() {
                    break;
                }
                if line.to_ascii_lowercase().starts_with("authorization:") {
                    auth = line.trim().to_string();
                }
            }
            let _ = tx.send((request_line.trim().to_string(), auth));

            let mut stream = stream;
            let reason = if status == 200 { "OK" } else { "Error" };
            let response = format!(
                "HTTP/1.1 {status} {reason}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            stream.write_all(response.as_bytes()).expect("write");
        }
    });

    (format!("http://{addr}/v0"), rx)
}

fn config(base_url: String) -> SourceConfig {
    SourceConfig {
        base_url,
        base_id: "appTest".to_string(),
        min_request_interval_ms: 0,
        timeout_secs: 5,
        ..SourceConfig::default()
    }
}

#[test]
fn follows_offset_until_last_page() {
    let (base_url, requests) = serve(vec![
        (
            200,
            r#"{"records":[{"id":"recA","fields":{"Name":"Nord"}}],"offset":"itr1"}"#.to_string(),
        ),
        (
            200,
            r#"{"records":[{"id":"recB","fields":{"Name":"Süd","Ort":"Chur"}}]}"#.to_string(),
        ),
    ]);

    let client = HttpSourceClient::new(config(base_url), "secret-key");
    let schools = client.fetch_all::<School>().expect("fetch");
    assert_eq!(schools.len(), 2);
    assert_eq!(schools[1].id, SourceId::from("recB"));
    assert_eq!(schools[1].fields.city.as_deref(), Some("Chur"));

    let (first, auth) = requests.recv().expect("first request");
    assert!(first.starts_with("GET /v0/appTest/Schulen?"), "got: {first}");
    assert!(first.contains("pageSize=100"));
    assert!(!first.contains("offset="));
    assert_eq!(auth.to_ascii_lowercase(), "authorization: bearer secret-key");

    let (second, _) = requests.recv().expect("second request");
    assert!(second.contains("offset=itr1"), "got: {second}");
}

#[test]
fn status_error_carries_code_and_body() {
    let (base_url, _requests) = serve(vec![(
        429,
        r#"{"errors":[{"error":"RATE_LIMIT_REACHED"}]}"#.to_string(),
    )]);

    let client = HttpSourceClient::new(config(base_url), "secret-key");
    let err = client.fetch_all::<School>().unwrap_err();
    match err {
        SourceError::Status { kind, status, body } => {
            assert_eq!(kind, EntityKind::School);
            assert_eq!(status, 429);
            assert!(body.contains("RATE_LIMIT_REACHED"));
        }
        other => panic!("expected status error, got {other:?}"),
    }
}

#[test]
fn invalid_record_fails_the_fetch() {
    let (base_url, _requests) = serve(vec![(
        200,
        r#"{"records":[{"id":"recX","fields":{"Ort":"Bern"}}]}"#.to_string(),
    )]);

    let client = HttpSourceClient::new(config(base_url), "secret-key");
    let err = client.fetch_all::<School>().unwrap_err();
    assert!(matches!(err, SourceError::Decode(_)), "got: {err:?}");
    assert!(err.to_string().contains("recX"));
}
