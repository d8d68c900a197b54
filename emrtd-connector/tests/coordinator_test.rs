//! Coordinator behaviour against a scripted in-memory server.

mod common;

use std::time::Duration;

use common::*;
use emrtd_connector::{
    ChipSessionEnd, Connector, ConnectorError, ErrorCategory, ReadOptions, ValidationStep,
    APDU_NACK,
};
use emrtd_core::{
    AccessKeyKind, CloseCode, CloseReason, FileId, MessageKind, ProtocolState,
};

type TestConnector = Connector<MemoryChannel, FakeChipReader>;

fn connector(channel: MemoryChannel, reader: FakeChipReader) -> TestConnector {
    Connector::new(config(), channel, reader)
}

#[test_log::test(tokio::test)]
async fn test_full_validation_with_chip_authentication() {
    let connector = connector(MemoryChannel::happy(), FakeChipReader::complete_document());

    let received = connector.validate(&can()).await.unwrap();

    assert_eq!(received, Some(outcome()));
    assert_eq!(connector.state(), ProtocolState::Closed);
    assert_eq!(connector.last_error(), None);

    let channel = connector.channel();
    assert_eq!(
        channel.sent_kinds().first().copied(),
        Some(MessageKind::Start)
    );
    assert_eq!(channel.sent_files(), vec!["dg14", "sod", "dg1", "dg2"]);
    let handover = channel.position(MessageKind::CaHandover).unwrap();
    let finish = channel.position(MessageKind::Finish).unwrap();
    assert_eq!(channel.sent_kinds()[handover - 1], MessageKind::File);
    assert!(handover < finish);

    let log = connector.reader().log();
    assert_eq!(log.calls, vec!["start", "complete"]);
    assert_eq!(log.challenge, CHALLENGE.to_vec());
    assert_eq!(log.finished, Some(ChipSessionEnd::Success));
    assert_eq!(log.invalidated, None);
}

#[test_log::test(tokio::test)]
async fn test_history_follows_handshake() {
    let connector = connector(MemoryChannel::happy(), FakeChipReader::complete_document());
    connector.validate(&can()).await.unwrap();

    let states: Vec<ProtocolState> = connector.history().iter().map(|t| t.to).collect();
    assert_eq!(
        states,
        vec![
            ProtocolState::Connected,
            ProtocolState::Started,
            ProtocolState::Accepted,
            ProtocolState::ReadingChip,
            ProtocolState::HandoverSent,
            ProtocolState::HandbackReceived,
            ProtocolState::Finishing,
            ProtocolState::Completed,
            ProtocolState::Closed,
        ]
    );
}

#[test_log::test(tokio::test)]
async fn test_without_security_key_skips_handover() {
    let connector = connector(
        MemoryChannel::happy(),
        FakeChipReader::without_security_key(),
    );

    let outcome = connector.validate(&can()).await.unwrap();

    assert!(outcome.is_some());
    let channel = connector.channel();
    assert_eq!(channel.position(MessageKind::CaHandover), None);
    assert_eq!(channel.sent_files(), vec!["sod", "dg1", "dg2"]);
    assert_eq!(
        connector.reader().log().calls,
        vec!["start", "complete_without_ca"]
    );
    assert_eq!(
        connector.reader().log().finished,
        Some(ChipSessionEnd::Success)
    );
}

#[test_log::test(tokio::test)]
async fn test_normal_close_after_result_is_benign() {
    let connector = connector(MemoryChannel::happy(), FakeChipReader::complete_document());

    connector.validate(&can()).await.unwrap();

    assert!(connector.outcome().is_some());
    assert_eq!(connector.last_error(), None);
    assert_eq!(*connector.status().borrow(), ValidationStep::Completed);
}

#[test_log::test(tokio::test)]
async fn test_access_control_failure_is_a_server_error() {
    let channel = MemoryChannel::new(|sent| match sent.kind() {
        MessageKind::CaHandover => vec![
            close(4403, Some("ACCESS_CONTROL_FAILED")),
            close_frame(4403),
        ],
        _ => happy_reply(sent),
    });
    let connector = connector(channel, FakeChipReader::complete_document());

    let err = connector.validate(&can()).await.unwrap_err();

    assert_eq!(
        err,
        ConnectorError::Server {
            code: CloseCode::AccessDenied,
            reason: CloseReason::AccessControlFailed,
        }
    );
    assert_eq!(err.category(), ErrorCategory::Server);
    assert!(!err.is_retryable());
    assert_eq!(connector.last_error(), Some(err));

    let log = connector.reader().log();
    assert!(log.invalidated.is_some());
    assert_eq!(log.finished, None);
    assert_eq!(connector.channel().position(MessageKind::Finish), None);
}

#[test_log::test(tokio::test)]
async fn test_disconnect_while_reading_chip_is_a_timeout() {
    let channel = MemoryChannel::new(|sent| match sent.kind() {
        MessageKind::Start => vec![accept(), emrtd_connector::ChannelEvent::Disconnected(None)],
        _ => Vec::new(),
    });
    let connector = connector(channel, FakeChipReader::hanging());

    let err = connector.validate(&can()).await.unwrap_err();

    assert_eq!(err, ConnectorError::ConnectionTimeout);
    assert!(connector.reader().log().invalidated.is_some());
}

#[test_log::test(tokio::test)]
async fn test_disconnect_before_accept_is_connection_closed() {
    let channel = MemoryChannel::new(|sent| match sent.kind() {
        MessageKind::Start => vec![emrtd_connector::ChannelEvent::Disconnected(Some(
            "reset by peer".into(),
        ))],
        _ => Vec::new(),
    });
    let connector = connector(channel, FakeChipReader::complete_document());

    let err = connector.validate(&can()).await.unwrap_err();

    assert_eq!(err, ConnectorError::ConnectionClosed);
    assert_eq!(*connector.status().borrow(), ValidationStep::Failed);
    assert!(connector.reader().log().calls.is_empty());
}

#[test_log::test(tokio::test)]
async fn test_start_before_connect_is_rejected() {
    let connector = connector(MemoryChannel::happy(), FakeChipReader::complete_document());

    let err = connector
        .start_validation(&can(), &ReadOptions::default())
        .await
        .unwrap_err();

    assert_eq!(err, ConnectorError::NotConnected);
    assert!(connector.channel().sent().is_empty());
    assert!(connector.reader().log().calls.is_empty());
}

#[test_log::test(tokio::test)]
async fn test_file_pushed_by_server_is_not_sent_back() {
    let channel = MemoryChannel::new(|sent| match sent.kind() {
        MessageKind::CaHandover => vec![file(FileId::DG2, &[0x75, 0x02]), handback()],
        _ => happy_reply(sent),
    });
    let connector = connector(channel, FakeChipReader::complete_document());

    connector.validate(&can()).await.unwrap();

    assert_eq!(connector.channel().sent_files(), vec!["dg14", "sod", "dg1"]);
}

#[test_log::test(tokio::test)]
async fn test_incomplete_read_never_signals_success() {
    let connector = connector(
        MemoryChannel::happy(),
        FakeChipReader::missing(FileId::DG2),
    );

    let err = connector.validate(&can()).await.unwrap_err();

    match &err {
        ConnectorError::IncompleteRead { missing, .. } => assert_eq!(missing, &vec![FileId::DG2]),
        other => panic!("expected IncompleteRead, got {other:?}"),
    }
    assert_eq!(err.category(), ErrorCategory::Chip);
    assert!(matches!(
        connector.reader().log().finished,
        Some(ChipSessionEnd::Failure(_))
    ));
    assert_eq!(connector.channel().position(MessageKind::Finish), None);
}

#[test_log::test(tokio::test)]
async fn test_requested_file_must_be_read() {
    let connector = connector(MemoryChannel::happy(), FakeChipReader::complete_document());
    let options = ReadOptions::default().with_files([FileId::DG15]);

    let err = connector
        .validate_with_options(&can(), &options)
        .await
        .unwrap_err();

    match err {
        ConnectorError::IncompleteRead { missing, .. } => assert_eq!(missing, vec![FileId::DG15]),
        other => panic!("expected IncompleteRead, got {other:?}"),
    }
}

fn relaying_server() -> MemoryChannel {
    MemoryChannel::new(|sent| match sent.kind() {
        MessageKind::CaHandover => vec![apdu(&[0x0C, 0xB0, 0x00, 0x00, 0x00])],
        MessageKind::Apdu => vec![handback()],
        _ => happy_reply(sent),
    })
}

#[test_log::test(tokio::test)]
async fn test_server_apdu_is_relayed_to_chip() {
    let connector = connector(relaying_server(), FakeChipReader::complete_document());

    connector.validate(&can()).await.unwrap();

    assert_eq!(
        connector.reader().log().relayed,
        vec![vec![0x0C, 0xB0, 0x00, 0x00, 0x00]]
    );
    assert_eq!(connector.channel().sent_apdus(), vec![vec![0x90, 0x00]]);
}

#[test_log::test(tokio::test)]
async fn test_failed_relay_answers_with_nack() {
    let connector = connector(relaying_server(), FakeChipReader::failing_relay());

    connector.validate(&can()).await.unwrap();

    assert_eq!(connector.channel().sent_apdus(), vec![APDU_NACK.to_vec()]);
}

#[test_log::test(tokio::test)]
async fn test_fire_and_forget_completes_on_normal_close() {
    let channel = MemoryChannel::new(|sent| match sent.kind() {
        MessageKind::Finish => vec![close(1000, None), close_frame(1000)],
        _ => happy_reply(sent),
    });
    let connector = Connector::new(
        config().fire_and_forget(),
        channel,
        FakeChipReader::complete_document(),
    );

    let outcome = connector.validate(&can()).await.unwrap();

    assert_eq!(outcome, None);
    assert_eq!(connector.last_error(), None);
    assert!(connector
        .history()
        .iter()
        .any(|t| t.to == ProtocolState::Completed));
}

#[test_log::test(tokio::test)]
async fn test_cancel_invalidates_chip_session() {
    let connector = connector(MemoryChannel::happy(), FakeChipReader::hanging());
    let handle = connector.cancel_handle();
    let can = can();

    let (result, _) = tokio::join!(connector.validate(&can), async {
        connector.reader().started.notified().await;
        handle.cancel();
    });

    assert_eq!(result.unwrap_err(), ConnectorError::Cancelled);
    assert!(handle.is_cancelled());
    assert_eq!(
        connector.reader().log().invalidated.as_deref(),
        Some("cancelled")
    );
    assert_eq!(*connector.status().borrow(), ValidationStep::Cancelled);
    assert_eq!(connector.channel().position(MessageKind::CaHandover), None);
}

#[test_log::test(tokio::test)]
async fn test_unexpected_result_fails_session() {
    let channel = MemoryChannel::new(|sent| match sent.kind() {
        MessageKind::Start => vec![accept(), result()],
        _ => Vec::new(),
    });
    let connector = connector(channel, FakeChipReader::hanging());

    let err = connector.validate(&can()).await.unwrap_err();

    assert_eq!(
        err,
        ConnectorError::UnexpectedMessage {
            kind: MessageKind::Result,
            state: ProtocolState::ReadingChip,
        }
    );
    assert_eq!(connector.outcome(), None);
}

#[test_log::test(tokio::test)]
async fn test_monitoring_requires_diagnostics() {
    let quiet = connector(MemoryChannel::happy(), FakeChipReader::complete_document());
    quiet.validate(&can()).await.unwrap();
    assert_eq!(quiet.channel().position(MessageKind::Monitoring), None);

    let chatty = Connector::new(
        config().with_diagnostics(),
        MemoryChannel::happy(),
        FakeChipReader::complete_document(),
    );
    let mut monitoring = chatty.monitoring();
    chatty.validate(&can()).await.unwrap();

    assert!(chatty.channel().position(MessageKind::Monitoring).is_some());
    assert_eq!(monitoring.try_recv().unwrap(), "chip read complete, 4 files");
}

#[test_log::test(tokio::test)]
async fn test_status_context_tracks_access_key() {
    let connector = connector(MemoryChannel::happy(), FakeChipReader::complete_document());
    assert_eq!(connector.status_context().access_key, None);

    connector.validate(&can()).await.unwrap();

    assert_eq!(
        connector.status_context().access_key,
        Some(AccessKeyKind::Can)
    );
}

#[test_log::test(tokio::test)]
async fn test_disconnect_releases_outstanding_wait() {
    // Server never answers START.
    let channel = MemoryChannel::new(|_| Vec::new());
    let connector = connector(channel, FakeChipReader::complete_document());
    connector.connect().await.unwrap();

    let options = ReadOptions::default();
    let key = can();
    let run = async {
        tokio::join!(connector.start_validation(&key, &options), async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            connector.disconnect().await;
        })
    };
    let (result, _) = tokio::time::timeout(Duration::from_secs(2), run)
        .await
        .expect("wait outlived disconnect");

    assert_eq!(result.unwrap_err(), ConnectorError::Cancelled);
    assert_eq!(connector.state(), ProtocolState::Closed);
}

#[test_log::test(tokio::test)]
async fn test_connect_twice_is_rejected() {
    let connector = connector(MemoryChannel::happy(), FakeChipReader::complete_document());
    connector.connect().await.unwrap();

    let err = connector.connect().await.unwrap_err();

    assert_eq!(err.category(), ErrorCategory::State);
}

#[test_log::test(tokio::test)]
async fn test_undecodable_reply_fails_waiter_at_once() {
    let channel = MemoryChannel::new(|sent| match sent.kind() {
        MessageKind::Finish => vec![malformed("missing field `passport`")],
        _ => happy_reply(sent),
    });
    let connector = connector(channel, FakeChipReader::complete_document());

    let err = tokio::time::timeout(Duration::from_secs(5), connector.validate(&can()))
        .await
        .expect("waiter left hanging")
        .unwrap_err();

    assert!(matches!(err, ConnectorError::Decode(_)));
    assert_eq!(err.category(), ErrorCategory::Transport);
    assert!(!err.is_retryable());
    assert_eq!(connector.outcome(), None);
}

#[test_log::test(tokio::test)]
async fn test_undecodable_frame_without_waiter_is_dropped() {
    let channel = MemoryChannel::new(|sent| match sent.kind() {
        MessageKind::Start => vec![accept(), malformed("not json")],
        _ => happy_reply(sent),
    });
    let connector = connector(channel, FakeChipReader::complete_document());

    let received = connector.validate(&can()).await.unwrap();

    assert_eq!(received, Some(outcome()));
    assert_eq!(connector.last_error(), None);
}

#[test_log::test(tokio::test)]
async fn test_frames_after_result_keep_outcome() {
    let channel = MemoryChannel::new(|sent| match sent.kind() {
        MessageKind::Finish => vec![
            result(),
            file(FileId::DG1, &[0x61, 0x01]),
            apdu(&[0x00, 0xA4]),
            malformed("trailing garbage"),
            close(1000, None),
            close_frame(1000),
        ],
        _ => happy_reply(sent),
    });
    let connector = connector(channel, FakeChipReader::complete_document());

    let received = connector.validate(&can()).await.unwrap();

    assert_eq!(received, Some(outcome()));
    assert_eq!(connector.last_error(), None);
    assert_eq!(*connector.status().borrow(), ValidationStep::Completed);
    assert!(connector.reader().log().relayed.is_empty());
    assert!(connector.channel().sent_apdus().is_empty());
}
