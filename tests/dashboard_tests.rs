use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use bytes::Bytes;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;
use uuid::Uuid;

use dispatch_lite::config::{DriverConfig, LoadBalancerConfig};
use dispatch_lite::dashboard::router;
use dispatch_lite::driver::{Driver, DriverHandle};
use dispatch_lite::scheduler::Job;

/// Helper to create a router over a driver that has no nodes attached
async fn create_test_app() -> (Router, DriverHandle) {
    let config = DriverConfig::new("127.0.0.1:0".parse().unwrap())
        .with_load_balancer(LoadBalancerConfig::new("fixed").with_parameter("size", "3"));
    let driver = Driver::bind(config).await.unwrap();
    let handle = driver.handle();
    (router(handle.clone()), handle)
}

async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, json)
}

fn queue_job(handle: &DriverHandle, name: &str) -> Uuid {
    let job = Job::new(name, vec![Bytes::from("a"), Bytes::from("b")]);
    let uuid = job.uuid();
    handle.submit_detached(job).unwrap();
    uuid
}

#[tokio::test]
async fn test_stats_endpoint() {
    let (app, handle) = create_test_app().await;
    queue_job(&handle, "counted");

    let (status, json) = send(&app, "GET", "/api/stats", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["driver_uuid"], handle.driver_uuid());
    assert_eq!(json["queue_depth"], 1);
    assert_eq!(json["jobs_queued"], 1);
    assert_eq!(json["nodes_connected"], 0);
}

#[tokio::test]
async fn test_queue_and_jobs_endpoints() {
    let (app, handle) = create_test_app().await;
    let uuid = queue_job(&handle, "listed");

    let (status, json) = send(&app, "GET", "/api/queue", None).await;
    assert_eq!(status, StatusCode::OK);
    let jobs = json.as_array().unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0]["uuid"], uuid.to_string());
    assert_eq!(jobs[0]["name"], "listed");
    assert_eq!(jobs[0]["remaining_tasks"], 2);

    let (status, json) = send(&app, "GET", "/api/jobs", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json.as_array().unwrap().len(), 1);
    assert_eq!(json[0]["task_count"], 2);

    let (status, json) = send(&app, "GET", "/api/nodes", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json, json!([]));
}

#[tokio::test]
async fn test_load_balancer_get_and_set() {
    let (app, handle) = create_test_app().await;

    let (status, json) = send(&app, "GET", "/api/load-balancer", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["algorithm"], "fixed");
    assert_eq!(json["parameters"]["size"], "3");

    let body = json!({"algorithm": "adaptive", "parameters": {"initial_size": 4}});
    let (status, json) = send(&app, "PUT", "/api/load-balancer", Some(body)).await;
    assert_eq!(status, StatusCode::OK);
    assert!(json["generation"].as_u64().unwrap() > 0);

    let config = handle.load_balancer().unwrap();
    assert_eq!(config.algorithm, "adaptive");
    assert_eq!(config.parameters["initial_size"], "4");
}

#[tokio::test]
async fn test_load_balancer_rejects_bad_config() {
    let (app, handle) = create_test_app().await;

    let body = json!({"algorithm": "round-robin"});
    let (status, json) = send(&app, "PUT", "/api/load-balancer", Some(body)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["success"], false);

    let body = json!({"algorithm": "fixed", "parameters": {"size": "zero"}});
    let (status, _) = send(&app, "PUT", "/api/load-balancer", Some(body)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // the previous algorithm stays active
    let config = handle.load_balancer().unwrap();
    assert_eq!(config.algorithm, "fixed");
    assert_eq!(config.parameters["size"], "3");
}

#[tokio::test]
async fn test_job_actions() {
    let (app, handle) = create_test_app().await;
    let uuid = queue_job(&handle, "managed");

    let (status, json) = send(&app, "POST", &format!("/api/jobs/{uuid}/suspend"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["success"], true);
    assert!(handle.queue_snapshot().unwrap()[0].suspended);

    let (status, _) = send(&app, "POST", &format!("/api/jobs/{uuid}/resume"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(!handle.queue_snapshot().unwrap()[0].suspended);

    let (status, _) = send(&app, "POST", &format!("/api/jobs/{uuid}/cancel"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(handle.queue_depth().unwrap(), 0);
}

#[tokio::test]
async fn test_job_actions_on_unknown_job() {
    let (app, _handle) = create_test_app().await;

    let uri = format!("/api/jobs/{}/cancel", Uuid::new_v4());
    let (status, json) = send(&app, "POST", &uri, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json["success"], false);

    let (status, _) = send(&app, "POST", "/api/jobs/not-a-uuid/suspend", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}
