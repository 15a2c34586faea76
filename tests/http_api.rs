//! HTTP Boundary Suite
//!
//! Drives the axum router in-process and checks the status code contract.

use anyhow::Result;
use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;

use custody_chain::server::router;
use custody_chain::{Collector, CollectorConfig};

async fn app(dir: &std::path::Path) -> Result<Router> {
    let collector = Collector::open(CollectorConfig::in_dir(dir)).await?;
    Ok(router(Arc::new(collector)))
}

async fn call(app: &Router, request: Request<Body>) -> Result<(StatusCode, Value)> {
    let response = app.clone().oneshot(request).await?;
    let status = response.status();
    let bytes = to_bytes(response.into_body(), 1 << 20).await?;
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()))
    };
    Ok((status, body))
}

fn post_incident(body: Value) -> Request<Body> {
    Request::post("/incidents")
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .expect("valid request")
}

fn get(uri: &str) -> Request<Body> {
    Request::get(uri).body(Body::empty()).expect("valid request")
}

#[tokio::test]
async fn test_capture_list_show_verify() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let app = app(dir.path()).await?;

    let (status, receipt) = call(
        &app,
        post_incident(json!({
            "incident_type": "SOX_COMPLIANCE_ALERT",
            "application": "finance-trading",
            "severity": "HIGH",
            "metadata": {"amount": "$1,247,892.00"}
        })),
    )
    .await?;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(receipt["sequence_id"], 1);
    let incident_id = receipt["incident_id"].as_str().expect("incident id").to_string();

    let (status, _) = call(
        &app,
        post_incident(json!({
            "incident_type": "AUDIT_EVENT",
            "application": "pharma-manufacturing",
            "severity": "INFO"
        })),
    )
    .await?;
    assert_eq!(status, StatusCode::CREATED);

    let (status, list) = call(&app, get("/incidents")).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(list[0]["sequence_id"], 2);
    assert_eq!(list[1]["sequence_id"], 1);

    let (_, filtered) = call(&app, get("/incidents?min_severity=HIGH")).await?;
    assert_eq!(filtered.as_array().map(|a| a.len()), Some(1));

    let (status, detail) = call(&app, get(&format!("/incidents/{}", incident_id))).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(detail["evidence_consistent"], true);
    assert_eq!(detail["evidence_blob"]["metadata"]["amount"], "$1,247,892.00");

    let (status, verification) = call(&app, get("/chain/verify")).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(verification, json!({"verified": true, "entries": 2, "first_failure": null}));

    let (_, head) = call(&app, get("/chain/head")).await?;
    assert_eq!(head["sequence_id"], 2);
    Ok(())
}

#[tokio::test]
async fn test_caller_errors_are_4xx() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let app = app(dir.path()).await?;

    let (status, body) = call(
        &app,
        post_incident(json!({"incident_type": "X", "application": "app", "severity": "LOW"})),
    )
    .await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "canonicalization_error");
    assert_eq!(body["retryable"], false);

    let (status, _) = call(
        &app,
        post_incident(json!({"incident_type": "X", "application": "app", "severity": "INFO", "metadata": [1, 2]})),
    )
    .await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = call(&app, get("/incidents/does-not-exist")).await?;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "not_found");

    // Nothing was committed by the rejected requests.
    let (_, head) = call(&app, get("/chain/head")).await?;
    assert_eq!(head["sequence_id"], 0);
    let (_, orphans) = call(&app, get("/evidence/orphans")).await?;
    assert_eq!(orphans, json!({"orphans": []}));
    Ok(())
}

#[tokio::test]
async fn test_list_floor_is_case_insensitive() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let app = app(dir.path()).await?;
    for severity in ["INFO", "HIGH", "CRITICAL"] {
        let (status, _) = call(
            &app,
            post_incident(json!({"incident_type": "AUDIT_EVENT", "application": "app", "severity": severity})),
        )
        .await?;
        assert_eq!(status, StatusCode::CREATED);
    }

    let (status, filtered) = call(&app, get("/incidents?min_severity=high")).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(filtered.as_array().map(|a| a.len()), Some(2));

    let (status, limited) = call(&app, get("/incidents?min_severity=Info&limit=0")).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(limited, json!([]));

    let (status, body) = call(&app, get("/incidents?min_severity=LOW")).await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "canonicalization_error");
    assert_eq!(body["retryable"], false);
    Ok(())
}

#[tokio::test]
async fn test_broken_chain_still_answers_200() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let app = app(dir.path()).await?;
    for severity in ["CRITICAL", "HIGH", "HIGH"] {
        let (status, _) = call(
            &app,
            post_incident(json!({"incident_type": "GMP_DEVIATION", "application": "pharma-manufacturing", "severity": severity})),
        )
        .await?;
        assert_eq!(status, StatusCode::CREATED);
    }

    let conn = rusqlite::Connection::open(dir.path().join("custody_ledger.db"))?;
    conn.execute_batch(
        "DROP TRIGGER chain_entries_no_update; \
         UPDATE chain_entries SET severity = 'LOW' WHERE sequence_id = 2;",
    )?;

    let (status, verification) = call(&app, get("/chain/verify")).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(verification["verified"], false);
    assert_eq!(verification["entries"], 3);
    assert_eq!(verification["first_failure"], 2);
    Ok(())
}

#[tokio::test]
async fn test_health() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let app = app(dir.path()).await?;
    let (status, body) = call(&app, get("/health")).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, Value::String("OK".to_string()));
    Ok(())
}
