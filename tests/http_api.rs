use axum::body::{to_bytes, Body};
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use rxchain::config::NodeConfig;
use rxchain::consensus::Difficulty;
use rxchain::http::{router, AppState};
use rxchain::signature::sign_claim;
use rxchain::types::{Prescription, TransactionClaim};
use serde_json::{json, Value};
use tower::ServiceExt;

const KEY: &str = "hospital-network-2025";

fn config() -> NodeConfig {
    let mut config = NodeConfig::default();
    config.consensus.difficulty = Difficulty::HexZeros(1);
    config
}

fn app_with(config: &NodeConfig) -> Router {
    router(AppState::new(config.build_runtime().unwrap(), config))
}

fn app() -> Router {
    app_with(&config())
}

fn signed_body(patient: &str) -> Value {
    let claim = TransactionClaim {
        writer: "doctor_alex".into(),
        counterparty: Some("pharmacy_01".into()),
        subject: patient.into(),
        payload: Prescription {
            drug_name: "Amoxicillin".into(),
            dosage: "500mg".into(),
            quantity: "21".into(),
        },
    };
    json!({
        "network_key": KEY,
        "prescriber_public_key": claim.writer,
        "pharmacy_public_key": claim.counterparty,
        "patient_id": claim.subject,
        "drug_name": claim.payload.drug_name,
        "dosage": claim.payload.dosage,
        "quantity": claim.payload.quantity,
        "signature": sign_claim(&claim, "alex-secret123"),
    })
}

async fn send(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let mut request = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(value) => {
            request = request.header("content-type", "application/json");
            Body::from(value.to_string())
        }
        None => Body::empty(),
    };
    let response = app
        .clone()
        .oneshot(request.body(body).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

async fn send_form(app: &Router, fields: &Value) -> (StatusCode, Value) {
    let encoded = fields
        .as_object()
        .unwrap()
        .iter()
        .filter_map(|(name, value)| value.as_str().map(|v| format!("{name}={v}")))
        .collect::<Vec<_>>()
        .join("&");
    let request = Request::builder()
        .method(Method::POST)
        .uri("/new_transaction")
        .header("content-type", "application/x-www-form-urlencoded")
        .body(Body::from(encoded))
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, serde_json::from_slice(&bytes).unwrap())
}

#[tokio::test]
async fn test_submit_mine_and_audit() {
    let app = app();

    let (status, body) = send(&app, Method::POST, "/new_transaction", Some(signed_body("patient_042"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["message"], "Prescription successfully added to pool");
    let id = body["id"].as_str().unwrap().to_string();
    assert_eq!(id.len(), 64);

    let (status, body) = send(&app, Method::GET, "/transactions/get", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["length"], 1);

    let (status, body) = send(&app, Method::GET, &format!("/transaction/{id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "pending");
    assert!(body.get("block_index").is_none());

    let (status, block) = send(&app, Method::GET, &format!("/mine?network_key={KEY}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(block["index"], 2);
    assert_eq!(block["transactions"][0]["id"], id.as_str());
    assert_eq!(block["transactions"][0]["payload"]["drug_name"], "Amoxicillin");

    let (_, chain) = send(&app, Method::GET, "/chain", None).await;
    assert_eq!(chain["length"], 2);
    assert_eq!(chain["chain"][0]["previous_hash"], "0".repeat(64));

    let (_, body) = send(&app, Method::GET, &format!("/transaction/{id}"), None).await;
    assert_eq!(body["status"], "sealed");
    assert_eq!(body["block_index"], 2);

    let (status, report) = send(&app, Method::GET, "/validate", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["valid"], true);
    assert_eq!(report["message"], "Blockchain is secure.");

    let (_, health) = send(&app, Method::GET, "/health", None).await;
    assert_eq!(health["status"], "ok");
    assert_eq!(health["height"], 2);
    assert_eq!(health["pending"], 0);
}

#[tokio::test]
async fn test_mine_accepts_post() {
    let app = app();
    let (status, block) = send(&app, Method::POST, &format!("/mine?network_key={KEY}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(block["index"], 2);
    assert_eq!(block["transactions"].as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn test_wrong_network_key_is_unauthorized() {
    let app = app();

    let mut body = signed_body("patient_042");
    body["network_key"] = json!("hospital-network-2024");
    let (status, error) = send(&app, Method::POST, "/new_transaction", Some(body)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(error["error"], "unauthorized");

    let (status, _) = send(&app, Method::GET, "/mine", None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (_, health) = send(&app, Method::GET, "/health", None).await;
    assert_eq!(health["height"], 1);
    assert_eq!(health["pending"], 0);
}

#[tokio::test]
async fn test_admission_failures_have_distinct_kinds() {
    let app = app();

    let mut unknown = signed_body("patient_042");
    unknown["prescriber_public_key"] = json!("doctor_mallory");
    let (status, error) = send(&app, Method::POST, "/new_transaction", Some(unknown)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(error["error"], "unknown_writer");

    let mut unapproved = signed_body("patient_042");
    unapproved["pharmacy_public_key"] = json!("pharmacy_unknown");
    let (status, error) = send(&app, Method::POST, "/new_transaction", Some(unapproved)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(error["error"], "unapproved_counterparty");

    let mut tampered = signed_body("patient_042");
    tampered["quantity"] = json!("210");
    let (status, error) = send(&app, Method::POST, "/new_transaction", Some(tampered)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(error["error"], "signature_mismatch");

    let (_, pending) = send(&app, Method::GET, "/transactions/get", None).await;
    assert_eq!(pending["length"], 0);
}

#[tokio::test]
async fn test_malformed_requests_are_bad_requests() {
    let app = app();

    let mut missing = signed_body("patient_042");
    missing.as_object_mut().unwrap().remove("signature");
    let (status, error) = send(&app, Method::POST, "/new_transaction", Some(missing)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(error["error"], "bad_request");

    let (status, error) = send(&app, Method::GET, "/transaction/not-hex", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(error["error"], "bad_request");

    let (status, error) = send(&app, Method::GET, &format!("/transaction/{}", "ab".repeat(32)), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(error["error"], "not_found");
}

#[tokio::test]
async fn test_full_mempool_is_service_unavailable() {
    let mut config = config();
    config.mempool.capacity = 1;
    let app = app_with(&config);

    let (status, _) = send(&app, Method::POST, "/new_transaction", Some(signed_body("patient_1"))).await;
    assert_eq!(status, StatusCode::OK);
    let (status, error) = send(&app, Method::POST, "/new_transaction", Some(signed_body("patient_2"))).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(error["error"], "mempool_full");
}

#[tokio::test]
async fn test_seal_timeout_is_service_unavailable() {
    let mut config = config();
    config.consensus.difficulty = Difficulty::Bits(200);
    config.consensus.seal_timeout_ms = Some(20);
    let app = app_with(&config);

    let (status, error) = send(&app, Method::GET, &format!("/mine?network_key={KEY}"), None).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(error["error"], "seal_timeout");

    let (_, health) = send(&app, Method::GET, "/health", None).await;
    assert_eq!(health["height"], 1);
}

#[tokio::test]
async fn test_protected_reads_require_the_key() {
    let mut config = config();
    config.network.protect_reads = true;
    let app = app_with(&config);

    for uri in ["/chain", "/transactions/get", "/validate"] {
        let (status, _) = send(&app, Method::GET, uri, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED, "{uri}");
        let (status, _) = send(&app, Method::GET, &format!("{uri}?network_key={KEY}"), None).await;
        assert_eq!(status, StatusCode::OK, "{uri}");
    }

    let (status, _) = send(&app, Method::GET, "/health", None).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_network_key_is_checked_before_body_shape() {
    let app = app();

    let (status, error) = send(
        &app,
        Method::POST,
        "/new_transaction",
        Some(json!({ "network_key": "wrong" })),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(error["error"], "unauthorized");

    let (status, _) = send(&app, Method::POST, "/new_transaction", Some(json!([1, 2, 3]))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, error) = send(&app, Method::POST, "/new_transaction", Some(json!({ "network_key": KEY }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(error["error"], "bad_request");
}

#[tokio::test]
async fn test_form_encoded_submission_is_accepted() {
    let app = app();

    let (status, body) = send_form(&app, &signed_body("patient_042")).await;
    assert_eq!(status, StatusCode::OK);
    let id = body["id"].as_str().unwrap().to_string();

    let mut tampered = signed_body("patient_042");
    tampered["dosage"] = json!("5000mg");
    let (status, error) = send_form(&app, &tampered).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(error["error"], "signature_mismatch");

    let mut wrong_key = signed_body("patient_042");
    wrong_key["network_key"] = json!("hospital-network-2024");
    let (status, _) = send_form(&app, &wrong_key).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (_, pending) = send(&app, Method::GET, "/transactions/get", None).await;
    assert_eq!(pending["length"], 1);
    assert_eq!(pending["transactions"][0]["id"], id.as_str());
}
