//! Multipart upload parsing: spooled files, form fields, limits.

mod common;

use common::TestServer;
use mazurka_http::router::Route;

fn upload_server(upload_dir: &std::path::Path) -> TestServer {
    let server = TestServer::new();
    let mut route = Route::new("up", "^/up$");
    route.set_handler("action");
    route.upload_dir = upload_dir.to_path_buf();
    server.add_route(route);
    server.http.define_action("/up", |conn| {
        let note = conn.rx.param("note").unwrap_or("-").to_string();
        let client = conn
            .rx
            .param("FILE_CLIENT_FILENAME_avatar")
            .unwrap_or("-")
            .to_string();
        let size = conn.rx.param("FILE_SIZE_avatar").unwrap_or("-").to_string();
        let spool = conn
            .rx
            .param("FILE_FILENAME_avatar")
            .unwrap_or("-")
            .to_string();
        let body = format!("note={note};client={client};size={size};spool={spool}");
        conn.tx.length = body.len() as i64;
        conn.write(body.into_bytes())?;
        conn.finalize_output();
        Ok(())
    });
    server
}

fn multipart_request(boundary: &str, parts: &[(&str, Option<&str>, &[u8])]) -> Vec<u8> {
    let mut body = Vec::new();
    for (name, filename, data) in parts {
        body.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
        match filename {
            Some(filename) => body.extend_from_slice(
                format!(
                    "Content-Disposition: form-data; name=\"{name}\"; filename=\"{filename}\"\r\n\
                     Content-Type: application/octet-stream\r\n\r\n"
                )
                .as_bytes(),
            ),
            None => body.extend_from_slice(
                format!("Content-Disposition: form-data; name=\"{name}\"\r\n\r\n").as_bytes(),
            ),
        }
        body.extend_from_slice(data);
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{boundary}--\r\n").as_bytes());

    let mut request = format!(
        "POST /up HTTP/1.1\r\nHost: x\r\n\
         Content-Type: multipart/form-data; boundary={boundary}\r\n\
         Content-Length: {}\r\n\r\n",
        body.len()
    )
    .into_bytes();
    request.extend_from_slice(&body);
    request
}

#[test]
fn file_part_spools_and_field_becomes_param() {
    let uploads = tempfile::tempdir().unwrap();
    let server = upload_server(uploads.path());

    let request = multipart_request(
        "XBOUND",
        &[
            ("note", None, b"hi there"),
            ("avatar", Some("me.png"), b"PNGDATA\x00\x01"),
        ],
    );
    let response = server.exchange(&request);
    assert_eq!(response.status, 200);
    let text = response.body_text();
    assert!(text.contains("note=hi there"), "unexpected body: {text}");
    assert!(text.contains("client=me.png"));
    assert!(text.contains("size=9"));

    let spool = text.split("spool=").nth(1).unwrap();
    let content = std::fs::read(spool).expect("spool file should exist");
    assert_eq!(content, b"PNGDATA\x00\x01");
}

#[test]
fn upload_split_across_packets_reassembles() {
    let uploads = tempfile::tempdir().unwrap();
    let server = upload_server(uploads.path());
    let request = multipart_request("SPLITB", &[("avatar", Some("big.bin"), &[7u8; 300])]);

    // Feed the request a few bytes at a time to exercise the
    // incremental boundary scanner.
    let (mut conn, handle) = server.open(b"");
    for chunk in request.chunks(41) {
        handle.feed(chunk);
        conn.io_event(true, false);
    }
    handle.close_input();
    conn.io_event(true, false);

    let response = common::parse_response(&handle.output());
    assert_eq!(response.status, 200);
    assert!(response.body_text().contains("size=300"));
}

#[test]
fn upload_over_limit_rejected_with_413() {
    let uploads = tempfile::tempdir().unwrap();
    let server = upload_server(uploads.path());
    let mut limits = (*server.http.limits()).clone();
    limits.upload_size = 64;
    server.http.set_limits(limits);

    let request = multipart_request("BIGB", &[("avatar", Some("big.bin"), &[1u8; 500])]);
    let response = server.exchange(&request);
    assert_eq!(response.status, 413);
}

#[test]
fn multipart_without_closing_boundary_rejected() {
    let uploads = tempfile::tempdir().unwrap();
    let server = upload_server(uploads.path());
    // A complete body (the declared length arrives) that never sends
    // the terminating boundary.
    let body = b"--TRUNC\r\nContent-Disposition: form-data; name=\"note\"\r\n\r\nx\r\n";
    let mut request = format!(
        "POST /up HTTP/1.1\r\nHost: x\r\n\
         Content-Type: multipart/form-data; boundary=TRUNC\r\n\
         Content-Length: {}\r\n\r\n",
        body.len()
    )
    .into_bytes();
    request.extend_from_slice(body);
    let response = server.exchange(&request);
    assert_eq!(response.status, 400);
}

#[test]
fn auto_delete_removes_spool_files_on_completion() {
    let uploads = tempfile::tempdir().unwrap();
    let server = TestServer::new();
    let mut route = Route::new("up", "^/up$");
    route.set_handler("action");
    route.upload_dir = uploads.path().to_path_buf();
    route.auto_delete_uploads = true;
    server.add_route(route);
    server.http.define_action("/up", |conn| {
        let spool = conn.rx.param("FILE_FILENAME_f").unwrap_or("-").to_string();
        conn.tx.length = spool.len() as i64;
        conn.write(spool.into_bytes())?;
        conn.finalize_output();
        Ok(())
    });

    let request = multipart_request("ADEL", &[("f", Some("a.bin"), b"bytes")]);
    let response = server.exchange(&request);
    let spool = response.body_text();
    assert!(!std::path::Path::new(&spool).exists(), "spool should be deleted");
}
