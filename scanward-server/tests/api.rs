use std::sync::atomic::Ordering;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode, header::CONTENT_TYPE};
use serde_json::{Value, json};

#[path = "support/mod.rs"]
mod support;

use support::{EICAR_MARKER, TestApp, json_body};

fn post(uri: &str, content_type: &str, body: impl Into<Body>) -> Request<Body> {
    Request::post(uri)
        .header(CONTENT_TYPE, content_type)
        .body(body.into())
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::get(uri).body(Body::empty()).unwrap()
}

const BOUNDARY: &str = "scanward-test-boundary";

fn multipart(parts: &[(&str, Option<&str>, &str)]) -> Request<Body> {
    let mut body = String::new();
    for (field, file_name, contents) in parts {
        body.push_str(&format!("--{BOUNDARY}\r\n"));
        match file_name {
            Some(file_name) => body.push_str(&format!(
                "Content-Disposition: form-data; name=\"{field}\"; filename=\"{file_name}\"\r\n\
                 Content-Type: application/octet-stream\r\n\r\n"
            )),
            None => body.push_str(&format!("Content-Disposition: form-data; name=\"{field}\"\r\n\r\n")),
        }
        body.push_str(contents);
        body.push_str("\r\n");
    }
    body.push_str(&format!("--{BOUNDARY}--\r\n"));
    post(
        "/scans?wait=1",
        &format!("multipart/form-data; boundary={BOUNDARY}"),
        body,
    )
}

async fn assert_error(response: axum::http::Response<Body>, status: StatusCode, code: &str) -> Value {
    assert_eq!(response.status(), status);
    let body = json_body(response).await;
    assert_eq!(body["status"], "error");
    assert_eq!(body["error"]["code"], code);
    body["error"].clone()
}

#[tokio::test]
async fn api_key_guards_every_route() -> anyhow::Result<()> {
    let app = TestApp::with_api_key("letmein").await;

    let denied = app.send(get("/status")).await;
    let error = assert_error(denied, StatusCode::FORBIDDEN, "FORBIDDEN").await;
    assert_eq!(error["message"], "Forbidden");

    let wrong = Request::get("/scans").header("x-api-key", "nope").body(Body::empty())?;
    assert_eq!(app.send(wrong).await.status(), StatusCode::FORBIDDEN);

    let allowed = Request::get("/status").header("x-api-key", "letmein").body(Body::empty())?;
    assert_eq!(app.send(allowed).await.status(), StatusCode::OK);
    Ok(())
}

#[tokio::test]
async fn unsupported_content_type_is_rejected() {
    let app = TestApp::new().await;
    let response = app.send(post("/scans", "application/xml", "<scan/>")).await;
    let error = assert_error(response, StatusCode::BAD_REQUEST, "NOT_SUPPORTED_CONTENT_TYPE").await;
    assert_eq!(error["details"], "application/xml");
}

#[tokio::test]
async fn unavailable_engine_refuses_new_scans() {
    let app = TestApp::new().await;
    app.service.responding.store(false, Ordering::SeqCst);

    let response = app
        .send(post("/scans", "application/octet-stream", "payload"))
        .await;
    let error = assert_error(response, StatusCode::SERVICE_UNAVAILABLE, "SERVICE_NOT_AVAILABLE").await;
    assert_eq!(error["details"], json!(["engine not responding"]));
    assert_eq!(app.spooled(), 0);
    assert!(app.engine.scanned.lock().is_empty());
}

#[tokio::test]
async fn synchronous_upload_returns_the_summary() {
    let app = TestApp::new().await;
    let payload = format!("X5O!P%@AP[4\\PZX54(P^)7CC)7}}${EICAR_MARKER}!$H+H*");

    let response = app
        .send(post("/scans?wait=1", "application/octet-stream", payload))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let summary = json_body(response).await;

    assert_eq!(summary["type"], "stream");
    assert_eq!(summary["status"], "completed");
    assert_eq!(summary["progress"], 100);
    assert_eq!(summary["scan_result"]["noname"]["verdict"], "infected");
    assert_eq!(
        summary["scan_result"]["noname"]["threats"][0]["name"],
        "EICAR-Test-File"
    );
    assert_eq!(summary["verdicts"], json!(["infected"]));
    assert!(summary.get("scan_params").is_none());
    assert_eq!(app.spooled(), 0, "spooled upload is removed after the scan");
}

#[tokio::test]
async fn asynchronous_upload_answers_with_location() -> anyhow::Result<()> {
    let app = TestApp::new().await;

    let response = app
        .send(post("/scans", "application/octet-stream", "harmless bytes"))
        .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let created = json_body(response).await;
    let id = created["id"].as_str().unwrap().to_string();
    assert_eq!(created["location"], format!("/scans/{id}"));

    let mut summary = Value::Null;
    for _ in 0..200 {
        let response = app.send(get(&format!("/scans/{id}"))).await;
        assert_eq!(response.status(), StatusCode::OK);
        summary = json_body(response).await;
        if summary["status"] == "completed" {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(summary["status"], "completed");
    assert_eq!(summary["scan_result"]["noname"]["verdict"], "clean");

    let listing = json_body(app.send(get("/scans")).await).await;
    assert_eq!(listing[&id], json!({"status": "completed", "progress": 100}));

    let forced = json_body(app.send(get(&format!("/scans/{id}?force"))).await).await;
    assert_eq!(forced["scan_id"], id.as_str());
    Ok(())
}

#[tokio::test]
async fn multipart_files_become_named_items() {
    let app = TestApp::new().await;

    let response = app
        .send(multipart(&[
            ("file", Some("../reports/a.txt"), "first"),
            ("file", Some("b file.txt"), EICAR_MARKER),
            ("params", None, r#"{"skipimageifexists": true}"#),
        ]))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let summary = json_body(response).await;

    assert_eq!(summary["scan_result"].as_object().unwrap().len(), 2);
    assert_eq!(summary["scan_result"]["reports_a.txt"]["verdict"], "clean");
    assert_eq!(summary["scan_result"]["b_file.txt"]["verdict"], "infected");
    assert_eq!(summary["scan_params"]["skipimageifexists"], true);
    assert_eq!(app.spooled(), 0);
}

#[tokio::test]
async fn multipart_with_bad_params_leaves_no_files_behind() {
    let app = TestApp::new().await;

    let response = app
        .send(multipart(&[
            ("file", Some("a.txt"), "first"),
            ("params", None, "{broken"),
        ]))
        .await;
    assert_error(response, StatusCode::BAD_REQUEST, "INVALID_JSON").await;

    let response = app
        .send(multipart(&[
            ("file", Some("a.txt"), "first"),
            (
                "params",
                None,
                r#"{"custom_callbacks": {"on_complete": {"uri": "hooks.local/done"}}}"#,
            ),
        ]))
        .await;
    let error = assert_error(response, StatusCode::BAD_REQUEST, "INVALID_URL_FORMAT").await;
    assert_eq!(error["details"], json!([{"on_complete uri": "hooks.local/done"}]));

    assert_eq!(app.spooled(), 0);
    assert!(app.engine.scanned.lock().is_empty());
}

#[tokio::test]
async fn image_requests_validate_urls() {
    let app = TestApp::new().await;

    let response = app
        .send(post(
            "/scans",
            "application/json",
            json!({
                "source": "registry.local/app:*",
                "params": {"destination": "https://mirror.local/app"},
            })
            .to_string(),
        ))
        .await;
    let error = assert_error(response, StatusCode::BAD_REQUEST, "INVALID_URL_FORMAT").await;
    assert_eq!(error["details"], json!([{"source": "registry.local/app:*"}]));

    let response = app.send(post("/scans", "text/plain", "ftp://registry.local/app")).await;
    assert_error(response, StatusCode::BAD_REQUEST, "INVALID_URL_FORMAT").await;

    let response = app.send(post("/scans", "application/json", "{not json")).await;
    assert_error(response, StatusCode::BAD_REQUEST, "INVALID_JSON").await;
}

#[tokio::test]
async fn empty_requests_have_nothing_to_process() {
    let app = TestApp::new().await;

    for request in [
        post("/scans", "application/octet-stream", Body::empty()),
        post("/scans", "application/json", r#"{"params": {}}"#),
        post("/scans", "text/plain", "   "),
    ] {
        let response = app.send(request).await;
        assert_error(response, StatusCode::BAD_REQUEST, "NOTHING_TO_PROCESS").await;
    }
    assert_eq!(app.spooled(), 0);
    assert!(json_body(app.send(get("/scans")).await).await.as_object().unwrap().is_empty());
}

#[tokio::test]
async fn unreachable_registry_is_reported_on_the_job() {
    let app = TestApp::new().await;

    let response = app
        .send(post(
            "/scans?wait=1",
            "text/plain",
            "https://registry.local:5000/team/app:*",
        ))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let summary = json_body(response).await;
    assert_eq!(summary["type"], "image");
    assert_eq!(summary["status"], "completed");
    assert_eq!(summary["scan_errors"][0]["message"], "Invalid source");
    assert_eq!(summary["scan_errors"][0]["code"], 404);
}

#[tokio::test]
async fn unknown_jobs_are_not_found() {
    let app = TestApp::new().await;

    for uri in [
        "/scans/not-a-uuid".to_string(),
        format!("/scans/{}", uuid::Uuid::new_v4()),
    ] {
        let response = app.send(get(&uri)).await;
        let error = assert_error(response, StatusCode::NOT_FOUND, "OBJECT_NOT_FOUND").await;
        assert_eq!(error["message"], "Object not found");
    }
}

#[tokio::test]
async fn status_reports_availability() {
    let app = TestApp::new().await;

    let response = app.send(get("/status")).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["status"], "service available");
    assert_eq!(body["product info"]["version"], "12.0.0.6672");
    assert!(body.get("status_reason").is_none());

    app.service.responding.store(false, Ordering::SeqCst);
    let response = app.send(get("/status")).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["status"], "service not available");
    assert_eq!(body["status_reason"], json!(["engine not responding"]));
}
