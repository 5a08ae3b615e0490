use bytes::Bytes;
use uuid::Uuid;

use dispatch_lite::worker::{ShellExecutor, TaskContext, TaskError, TaskExecutor};

/// Create a test executor that runs commands on the host shell
fn test_executor() -> ShellExecutor {
    ShellExecutor::host()
}

fn context(data_provider: &'static str) -> TaskContext {
    TaskContext {
        job_uuid: Uuid::new_v4(),
        job_name: "executor-test".to_string(),
        data_provider: Bytes::from(data_provider),
    }
}

#[tokio::test]
async fn test_execute_simple_command() {
    let executor = test_executor();
    let result = executor
        .execute(&context(""), Bytes::from("echo hello"))
        .await
        .unwrap();
    assert_eq!(result, Bytes::from("hello\n"));
}

#[tokio::test]
async fn test_execute_empty_output() {
    let executor = test_executor();
    let result = executor
        .execute(&context(""), Bytes::from("true"))
        .await
        .unwrap();
    assert!(result.is_empty());
}

#[tokio::test]
async fn test_execute_large_output() {
    let executor = test_executor();
    let result = executor
        .execute(&context(""), Bytes::from("seq 1 1000"))
        .await
        .unwrap();
    let output = String::from_utf8(result.to_vec()).unwrap();
    let lines: Vec<&str> = output.lines().collect();
    assert_eq!(lines.len(), 1000);
    assert_eq!(lines[0], "1");
    assert_eq!(lines[999], "1000");
}

#[tokio::test]
async fn test_execute_failing_command() {
    let executor = test_executor();
    let err = executor
        .execute(&context(""), Bytes::from("echo oops >&2; exit 3"))
        .await
        .unwrap_err();
    match err {
        TaskError::NonZeroExit { code, stderr } => {
            assert_eq!(code, Some(3));
            assert_eq!(stderr, "oops");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_data_provider_piped_to_stdin() {
    let executor = test_executor();
    let result = executor
        .execute(&context("shared input"), Bytes::from("tr a-z A-Z"))
        .await
        .unwrap();
    assert_eq!(result, Bytes::from("SHARED INPUT"));
}

#[tokio::test]
async fn test_command_ignoring_stdin() {
    let executor = test_executor();
    let result = executor
        .execute(&context("unused"), Bytes::from("echo done"))
        .await
        .unwrap();
    assert_eq!(result, Bytes::from("done\n"));
}

#[tokio::test]
async fn test_invalid_utf8_command() {
    let executor = test_executor();
    let err = executor
        .execute(&context(""), Bytes::from_static(&[0xff, 0xfe]))
        .await
        .unwrap_err();
    assert!(matches!(err, TaskError::InvalidCommand));
}
