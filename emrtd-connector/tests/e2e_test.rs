//! End-to-end validation over a real WebSocket against the scripted server.

mod common;

use std::time::Duration;

use common::{can, FakeChipReader, SIGNATURE};
use emrtd_connector::{Connector, ConnectorConfig, ConnectorError, RetryPolicy};
use emrtd_core::{CloseCode, CloseReason, MessageKind};
use emrtd_test_server::{default_outcome, Behavior, ServerScript, SessionRecord, TestServer};

fn local_config(url: String) -> ConnectorConfig {
    ConnectorConfig::new(url, "validation-1", "client-1")
        .with_insecure_dev()
        .with_retry(RetryPolicy::none())
        .with_close_timing(Duration::from_millis(200), Duration::from_millis(50))
}

async fn spawn(behavior: Behavior) -> TestServer {
    TestServer::spawn(ServerScript::with_behavior(behavior))
        .await
        .unwrap()
}

/// Records are pushed once the server side of the connection ends.
async fn first_record(server: &TestServer) -> SessionRecord {
    for _ in 0..100 {
        if let Some(record) = server.records().into_iter().next() {
            return record;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("server recorded no session");
}

#[test_log::test(tokio::test)]
async fn test_validation_over_websocket() {
    let server = spawn(Behavior::Normal).await;
    let connector = Connector::websocket(
        local_config(server.url()),
        FakeChipReader::complete_document(),
    );

    let outcome = connector.validate(&can()).await.unwrap();

    assert_eq!(outcome, Some(default_outcome()));
    assert_eq!(connector.last_error(), None);

    let record = first_record(&server).await;
    let start = record.start.unwrap();
    assert_eq!(start.validation_id, "validation-1");
    assert_eq!(start.client_id, "client-1");
    assert_eq!(record.files, vec!["dg14", "sod", "dg1", "dg2"]);
    assert_eq!(record.apdu_responses, vec![vec![0x90, 0x00]]);
    assert_eq!(record.result_requested, Some(true));
    assert_eq!(record.signature, Some(SIGNATURE.to_vec()));
    assert_eq!(record.received.first(), Some(&MessageKind::Start));
    assert_eq!(
        connector.reader().log().challenge,
        ServerScript::default().challenge
    );
}

#[test_log::test(tokio::test)]
async fn test_access_control_failure_over_websocket() {
    let server = spawn(Behavior::RejectAccess).await;
    let connector = Connector::websocket(
        local_config(server.url()),
        FakeChipReader::complete_document(),
    );

    let err = connector.validate(&can()).await.unwrap_err();

    assert_eq!(
        err,
        ConnectorError::Server {
            code: CloseCode::AccessDenied,
            reason: CloseReason::AccessControlFailed,
        }
    );
    assert!(connector.reader().log().invalidated.is_some());
}

#[test_log::test(tokio::test)]
async fn test_invalid_client_over_websocket() {
    let server = spawn(Behavior::InvalidClient).await;
    let connector = Connector::websocket(
        local_config(server.url()),
        FakeChipReader::complete_document(),
    );

    let err = connector.validate(&can()).await.unwrap_err();

    assert_eq!(
        err,
        ConnectorError::Server {
            code: CloseCode::InvalidClient,
            reason: CloseReason::InvalidClientId,
        }
    );
    assert_eq!(err.recovery_suggestion(), None);
    assert!(connector.reader().log().calls.is_empty());
}

#[test_log::test(tokio::test)]
async fn test_dropped_connection_during_chip_read() {
    let server = spawn(Behavior::DropAfterAccept).await;
    let connector = Connector::websocket(local_config(server.url()), FakeChipReader::hanging());

    let err = tokio::time::timeout(Duration::from_secs(5), connector.validate(&can()))
        .await
        .unwrap()
        .unwrap_err();

    assert_eq!(err, ConnectorError::ConnectionTimeout);
    assert!(err.is_retryable());
}

#[test_log::test(tokio::test)]
async fn test_refused_connection() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    drop(listener);

    let connector = Connector::websocket(local_config(url), FakeChipReader::complete_document());
    let err = connector.validate(&can()).await.unwrap_err();

    assert!(matches!(err, ConnectorError::ConnectionFailed(_)));
    assert!(err.is_retryable());
    assert!(connector.reader().log().calls.is_empty());
}

#[test_log::test(tokio::test)]
async fn test_plain_ws_needs_insecure_dev() {
    let server = spawn(Behavior::Normal).await;
    let config = ConnectorConfig::new(server.url(), "validation-1", "client-1");
    let connector = Connector::websocket(config, FakeChipReader::complete_document());

    let err = connector.connect().await.unwrap_err();

    assert!(matches!(err, ConnectorError::ConnectionFailed(_)));
    assert!(server.records().is_empty());
}
