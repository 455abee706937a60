//! Integration tests for the `quire serve` HTTP API.
//!
//! Each test starts the server as a child process on a unique port with its
//! own data directory, makes HTTP requests, and verifies the responses.

use std::io::Read;
use std::net::TcpStream;
use std::process::{Child, Command};
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;

use serde_json::{json, Value};

/// A 2x1 RGBA PNG.
const SIGNATURE: &str = "data:image/png;base64,\
    iVBORw0KGgoAAAANSUhEUgAAAAIAAAABCAYAAAD0In+KAAAAD0lEQVR42mMQUDD4D8QNAAkEAkBgMcY7AAAAAElFTkSuQmCC";

/// Atomic port counter to avoid port conflicts between parallel tests.
/// Base port is derived from process ID so separate test binaries don't
/// collide on the same port range.
static NEXT_PORT: AtomicU16 = AtomicU16::new(0);
static PORT_INIT: std::sync::Once = std::sync::Once::new();

fn next_port() -> u16 {
    PORT_INIT.call_once(|| {
        let base = 20000 + (std::process::id() as u16 % 20000);
        NEXT_PORT.store(base, Ordering::SeqCst);
    });
    NEXT_PORT.fetch_add(1, Ordering::SeqCst)
}

/// A running `quire serve`, killed on drop.
struct Server {
    port: u16,
    child: Child,
    data: tempfile::TempDir,
}

impl Drop for Server {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// A one-page PDF with a correct cross-reference table.
fn one_page_pdf() -> Vec<u8> {
    let objects = [
        "<< /Type /Catalog /Pages 2 0 R >>",
        "<< /Type /Pages /Kids [3 0 R] /Count 1 >>",
        "<< /Type /Page /Parent 2 0 R /MediaBox [0 0 612 792] /Resources << >> /Contents 4 0 R >>",
        "<< /Length 3 >>\nstream\nq Q\nendstream",
    ];
    let mut out = b"%PDF-1.4\n".to_vec();
    let mut offsets = Vec::new();
    for (i, body) in objects.iter().enumerate() {
        offsets.push(out.len());
        out.extend_from_slice(format!("{} 0 obj\n{}\nendobj\n", i + 1, body).as_bytes());
    }
    let xref = out.len();
    let mut table = format!("xref\n0 {}\n0000000000 65535 f \n", objects.len() + 1);
    for offset in offsets {
        table.push_str(&format!("{:010} 00000 n \n", offset));
    }
    table.push_str(&format!(
        "trailer\n<< /Size {} /Root 1 0 R >>\nstartxref\n{}\n%%EOF\n",
        objects.len() + 1,
        xref
    ));
    out.extend_from_slice(table.as_bytes());
    out
}

fn start_server() -> Server {
    start_server_with_env(&[])
}

/// Start the server with a source document at `docs/contract.pdf`.
fn start_server_with_env(env: &[(&str, &str)]) -> Server {
    let port = next_port();
    let data = tempfile::tempdir().expect("tempdir");
    std::fs::create_dir_all(data.path().join("docs")).unwrap();
    std::fs::write(data.path().join("docs/contract.pdf"), one_page_pdf()).unwrap();

    let mut cmd = Command::new(env!("CARGO_BIN_EXE_quire"));
    cmd.arg("serve")
        .arg("--port")
        .arg(port.to_string())
        .arg("--data-dir")
        .arg(data.path());
    cmd.env_remove("QUIRE_API_KEY");
    cmd.env("QUIRE_RATE_LIMIT", "10000");
    for (key, value) in env {
        cmd.env(key, value);
    }
    // Redirect stdout/stderr to avoid blocking
    cmd.stdout(std::process::Stdio::null());
    cmd.stderr(std::process::Stdio::null());

    let child = cmd.spawn().expect("failed to start quire serve");
    // Wait for server to be ready by polling the port
    for _ in 0..50 {
        if TcpStream::connect(format!("127.0.0.1:{}", port)).is_ok() {
            break;
        }
        std::thread::sleep(Duration::from_millis(100));
    }
    Server { port, child, data }
}

/// Helper: make an HTTP request and return (status, headers, body).
fn http(
    port: u16,
    method: &str,
    path: &str,
    headers: &[(&str, &str)],
    body: Option<&str>,
) -> (u16, String, String) {
    let mut stream = TcpStream::connect(format!("127.0.0.1:{}", port)).expect("failed to connect");
    stream
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();

    let mut header_lines = String::new();
    for (name, value) in headers {
        header_lines.push_str(&format!("{}: {}\r\n", name, value));
    }
    let body = body.unwrap_or("");
    if !body.is_empty() {
        header_lines.push_str("Content-Type: application/json\r\n");
    }
    let request = format!(
        "{} {} HTTP/1.1\r\nHost: localhost:{}\r\n{}Content-Length: {}\r\nConnection: close\r\n\r\n{}",
        method,
        path,
        port,
        header_lines,
        body.len(),
        body
    );
    std::io::Write::write_all(&mut stream, request.as_bytes()).expect("failed to write");

    let mut response = String::new();
    let _ = stream.read_to_string(&mut response);

    parse_http_response_full(&response)
}

fn get(port: u16, path: &str) -> (u16, Value) {
    let (status, _, body) = http(port, "GET", path, &[], None);
    (status, parse_json(&body))
}

fn post(port: u16, path: &str, body: &Value) -> (u16, Value) {
    let (status, _, body) = http(port, "POST", path, &[], Some(&body.to_string()));
    (status, parse_json(&body))
}

fn parse_json(body: &str) -> Value {
    serde_json::from_str(body).unwrap_or_else(|e| panic!("invalid JSON body ({e}): {body}"))
}

/// Extract a header value from raw headers string.
fn extract_header<'a>(headers: &'a str, name: &str) -> Option<&'a str> {
    let name_lower = name.to_lowercase();
    for line in headers.lines() {
        if let Some((key, value)) = line.split_once(':') {
            if key.trim().to_lowercase() == name_lower {
                return Some(value.trim());
            }
        }
    }
    None
}

/// Parse an HTTP response into (status_code, headers_string, body).
fn parse_http_response_full(response: &str) -> (u16, String, String) {
    let parts: Vec<&str> = response.splitn(2, "\r\n\r\n").collect();
    let headers = parts.first().unwrap_or(&"").to_string();
    let body = parts.get(1).unwrap_or(&"").to_string();

    let status_line = headers.lines().next().unwrap_or("");
    let status = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse::<u16>().ok())
        .unwrap_or(0);

    // Handle chunked transfer encoding
    let body = if extract_header(&headers, "transfer-encoding") == Some("chunked") {
        decode_chunked(&body)
    } else {
        body
    };

    (status, headers, body)
}

/// Decode chunked transfer encoding.
fn decode_chunked(data: &str) -> String {
    let mut result = String::new();
    let mut remaining = data;

    while let Some(line_end) = remaining.find("\r\n") {
        let size = match usize::from_str_radix(remaining[..line_end].trim(), 16) {
            Ok(s) => s,
            Err(_) => break,
        };
        if size == 0 {
            break;
        }
        let chunk_start = line_end + 2;
        let chunk_end = chunk_start + size;
        if chunk_end > remaining.len() {
            result.push_str(&remaining[chunk_start..]);
            break;
        }
        result.push_str(&remaining[chunk_start..chunk_end]);
        remaining = remaining.get(chunk_end + 2..).unwrap_or("");
    }

    result
}

fn envelope_request(mode: &str, emails: &[&str]) -> Value {
    let signers: Vec<Value> = emails
        .iter()
        .enumerate()
        .map(|(i, email)| json!({ "email": email, "name": format!("Signer {}", i + 1) }))
        .collect();
    let fields: Vec<Value> = emails
        .iter()
        .map(|email| {
            json!({
                "id": field_id(email),
                "assignee_email": email,
                "type": "SIGNATURE",
                "page": 1,
                "position": { "x": 72.0, "y": 96.0, "width": 200.0, "height": 50.0 },
            })
        })
        .collect();
    json!({
        "owner_id": "owner-1",
        "title": "Master services agreement",
        "document_ref": "docs/contract.pdf",
        "signing_mode": mode,
        "signers": signers,
        "fields": fields,
    })
}

fn field_id(email: &str) -> String {
    format!("sig-{}", email.split('@').next().unwrap_or(email))
}

fn signature_for(email: &str) -> Value {
    json!({ "values": { field_id(email): SIGNATURE } })
}

/// Create and send an envelope; returns its id.
fn sent_envelope(port: u16, mode: &str, emails: &[&str]) -> String {
    let (status, created) = post(port, "/envelopes", &envelope_request(mode, emails));
    assert_eq!(status, 201, "create failed: {created}");
    let id = created["id"].as_str().expect("id").to_string();
    let (status, sent) = post(port, &format!("/envelopes/{id}/send"), &json!({}));
    assert_eq!(status, 200, "send failed: {sent}");
    id
}

fn link(port: u16, id: &str, email: &str) -> String {
    let (status, body) = get(port, &format!("/envelopes/{id}/signers/{email}/link"));
    assert_eq!(status, 200, "link failed: {body}");
    body["token"].as_str().expect("token").to_string()
}

// ──────────────────────────────────────────────
// Health and routing
// ──────────────────────────────────────────────

#[test]
fn health_returns_200_with_version() {
    let server = start_server();
    let (status, body) = get(server.port, "/health");
    assert_eq!(status, 200);
    assert_eq!(body["status"], "ok");
    assert!(body["version"].is_string());
}

#[test]
fn unknown_route_is_json_404() {
    let server = start_server();
    let (status, body) = get(server.port, "/nope");
    assert_eq!(status, 404);
    assert_eq!(body["code"], "NOT_FOUND");
}

// ──────────────────────────────────────────────
// Envelope lifecycle
// ──────────────────────────────────────────────

#[test]
fn parallel_envelope_completes_and_seals() {
    let server = start_server();
    let port = server.port;
    let emails = ["ann@example.com", "bob@example.com"];
    let id = sent_envelope(port, "PARALLEL", &emails);

    let (status, summary) = get(port, &format!("/envelopes/{id}/status"));
    assert_eq!(status, 200);
    assert_eq!(summary["status"], "SENT");
    assert_eq!(summary["total"], 2);

    for email in emails {
        let token = link(port, &id, email);
        let (status, session) = get(port, &format!("/sign/{token}"));
        assert_eq!(status, 200, "{session}");
        assert_eq!(session["signer_email"], email);
        assert_eq!(session["fields"].as_array().map(Vec::len), Some(1));

        let (status, body) = post(port, &format!("/sign/{token}/submit"), &signature_for(email));
        assert_eq!(status, 200, "{body}");
    }

    let (status, envelope) = get(port, &format!("/envelopes/{id}"));
    assert_eq!(status, 200);
    assert_eq!(envelope["status"], "COMPLETED");
    let sealed_ref = envelope["sealed"]["document_ref"].as_str().expect("sealed");
    let sha = envelope["sealed"]["sha256"].as_str().expect("sha256");
    assert_eq!(sealed_ref, format!("sealed/{sha}.pdf"));
    let sealed = std::fs::read(server.data.path().join(sealed_ref)).expect("sealed file");
    assert!(sealed.starts_with(b"%PDF-"));
    let text = String::from_utf8_lossy(&sealed);
    assert!(text.contains("/QuireImg0"), "signature image is placed on the page");
    assert!(text.contains("(Signature certificate)"));
    let signer = &envelope["signers"][0];
    assert_eq!(signer["client"]["ip"], "127.0.0.1");
}

#[test]
fn reused_link_is_409_already_used() {
    let server = start_server();
    let port = server.port;
    let id = sent_envelope(port, "PARALLEL", &["ann@example.com", "bob@example.com"]);
    let token = link(port, &id, "ann@example.com");
    let path = format!("/sign/{token}/submit");

    let (status, _) = post(port, &path, &signature_for("ann@example.com"));
    assert_eq!(status, 200);
    let (status, body) = post(port, &path, &signature_for("ann@example.com"));
    assert_eq!(status, 409);
    assert_eq!(body["code"], "ALREADY_USED");
}

#[test]
fn sequential_signer_waits_their_turn() {
    let server = start_server();
    let port = server.port;
    let id = sent_envelope(port, "SEQUENTIAL", &["ann@example.com", "bob@example.com"]);
    let bob = link(port, &id, "bob@example.com");

    let (status, body) = post(port, &format!("/sign/{bob}/submit"), &signature_for("bob@example.com"));
    assert_eq!(status, 409);
    assert_eq!(body["code"], "NOT_YET_ACTIVE");

    let ann = link(port, &id, "ann@example.com");
    let (status, _) = post(port, &format!("/sign/{ann}/submit"), &signature_for("ann@example.com"));
    assert_eq!(status, 200);
    let (status, body) = post(port, &format!("/sign/{bob}/submit"), &signature_for("bob@example.com"));
    assert_eq!(status, 200, "{body}");
    assert_eq!(body["completed"], true);
}

#[test]
fn missing_values_are_422_and_leave_the_link_usable() {
    let server = start_server();
    let port = server.port;
    let id = sent_envelope(port, "PARALLEL", &["ann@example.com"]);
    let token = link(port, &id, "ann@example.com");

    let (status, body) = post(port, &format!("/sign/{token}/submit"), &json!({ "values": {} }));
    assert_eq!(status, 422);
    assert_eq!(body["code"], "INCOMPLETE_VALUES");
    assert!(body["violations"].is_array());

    let (status, _) = post(port, &format!("/sign/{token}/submit"), &signature_for("ann@example.com"));
    assert_eq!(status, 200);
}

#[test]
fn decline_stops_every_other_link() {
    let server = start_server();
    let port = server.port;
    let id = sent_envelope(port, "PARALLEL", &["ann@example.com", "bob@example.com"]);
    let ann = link(port, &id, "ann@example.com");
    let bob = link(port, &id, "bob@example.com");

    let (status, body) = post(port, &format!("/sign/{bob}/decline"), &json!({ "reason": "wrong terms" }));
    assert_eq!(status, 200, "{body}");
    assert_eq!(body["status"], "DECLINED");

    let (status, body) = post(port, &format!("/sign/{ann}/submit"), &signature_for("ann@example.com"));
    assert_eq!(status, 409);
    assert_eq!(body["code"], "ENVELOPE_DECLINED");
}

#[test]
fn owner_can_cancel_without_a_body() {
    let server = start_server();
    let port = server.port;
    let id = sent_envelope(port, "PARALLEL", &["ann@example.com"]);
    let (status, _, body) = http(port, "POST", &format!("/envelopes/{id}/cancel"), &[], None);
    assert_eq!(status, 200, "{body}");
    let envelope = parse_json(&body);
    assert_eq!(envelope["status"], "DECLINED");
    assert_eq!(envelope["decline"]["by"]["kind"], "owner");
}

#[test]
fn fields_are_locked_after_send() {
    let server = start_server();
    let port = server.port;
    let id = sent_envelope(port, "PARALLEL", &["ann@example.com"]);
    let fields = envelope_request("PARALLEL", &["ann@example.com"])["fields"].clone();
    let (status, _, body) = http(
        port,
        "PUT",
        &format!("/envelopes/{id}/fields"),
        &[],
        Some(&json!({ "fields": fields }).to_string()),
    );
    assert_eq!(status, 409);
    assert_eq!(parse_json(&body)["code"], "ENVELOPE_LOCKED");
}

#[test]
fn list_filters_by_owner_and_status() {
    let server = start_server();
    let port = server.port;
    sent_envelope(port, "PARALLEL", &["ann@example.com"]);
    let mut draft = envelope_request("PARALLEL", &["bob@example.com"]);
    draft["owner_id"] = json!("owner-2");
    let (status, _) = post(port, "/envelopes", &draft);
    assert_eq!(status, 201);

    let (status, page) = get(port, "/envelopes?owner=owner-1");
    assert_eq!(status, 200);
    assert_eq!(page["total"], 1);
    let (_, page) = get(port, "/envelopes?status=draft");
    assert_eq!(page["items"][0]["owner_id"], "owner-2");
    let (status, body) = get(port, "/envelopes?status=LOST");
    assert_eq!(status, 400);
    assert_eq!(body["code"], "INVALID_REQUEST");
}

// ──────────────────────────────────────────────
// Error mapping
// ──────────────────────────────────────────────

#[test]
fn bad_requests_carry_codes() {
    let server = start_server();
    let port = server.port;

    let (status, _, body) = http(port, "POST", "/envelopes", &[], Some("{not json"));
    assert_eq!(status, 400);
    assert_eq!(parse_json(&body)["code"], "INVALID_REQUEST");

    let mut request = envelope_request("PARALLEL", &["ann@example.com"]);
    request["signers"] = json!([
        { "email": "ann@example.com", "name": "Ann" },
        { "email": " ANN@example.com", "name": "Ann again" },
    ]);
    let (status, body) = post(port, "/envelopes", &request);
    assert_eq!(status, 422);
    assert_eq!(body["code"], "INVALID_SIGNERS");

    let (status, body) = get(port, "/envelopes/does-not-exist");
    assert_eq!(status, 404);
    assert_eq!(body["code"], "NOT_FOUND");

    let (status, body) = get(port, "/sign/not-a-token");
    assert_eq!(status, 404);
    assert_eq!(body["code"], "INVALID_TOKEN");
}

// ──────────────────────────────────────────────
// Authentication and rate limiting
// ──────────────────────────────────────────────

#[test]
fn api_key_guards_owner_routes_only() {
    let server = start_server_with_env(&[("QUIRE_API_KEY", "s3cret")]);
    let port = server.port;

    let (status, body) = get(port, "/envelopes");
    assert_eq!(status, 401);
    assert_eq!(body["code"], "UNAUTHORIZED");

    let (status, _, body) = http(port, "GET", "/envelopes", &[("X-API-Key", "wrong")], None);
    assert_eq!(status, 403);
    assert_eq!(parse_json(&body)["code"], "FORBIDDEN");

    let (status, _, _) = http(
        port,
        "GET",
        "/envelopes",
        &[("Authorization", "Bearer s3cret")],
        None,
    );
    assert_eq!(status, 200);

    let (status, _) = get(port, "/health");
    assert_eq!(status, 200);
    // Signer links stay reachable without the key.
    let (status, body) = get(port, "/sign/unknown");
    assert_eq!(status, 404);
    assert_eq!(body["code"], "INVALID_TOKEN");
}

#[test]
fn rate_limit_returns_429_with_retry_after() {
    let server = start_server_with_env(&[("QUIRE_RATE_LIMIT", "3")]);
    let port = server.port;
    for _ in 0..3 {
        let (status, _) = get(port, "/health");
        assert_eq!(status, 200);
    }
    let (status, headers, body) = http(port, "GET", "/health", &[], None);
    assert_eq!(status, 429);
    assert_eq!(parse_json(&body)["code"], "RATE_LIMITED");
    assert!(extract_header(&headers, "retry-after").is_some());
}

