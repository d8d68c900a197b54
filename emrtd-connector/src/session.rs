//! Validation session coordinator.
//!
//! The main public interface for validating a document against the server.
//!
//! # Session Invariants
//!
//! - `Connector` does not implement `Clone`; one instance drives one session
//! - Session state (state machine, pending waits, file tracker) is only
//!   touched under one lock, never held across an `.await`
//! - Inbound frames are handled one at a time, in arrival order, by a
//!   dispatcher task fed from the channel's listener
//! - A send is checked against the state machine and its follow-up wait is
//!   registered before the frame leaves, so a fast reply cannot be missed
//! - The first session failure is latched; every outstanding wait resolves
//!   with that same error and no second failure is reported
//! - The chip reader is only signalled success after the completeness check
//!   passes
//! - `Drop` fails outstanding waits and invalidates an active chip session

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use emrtd_core::message::{CaHandback, CaHandover, Close, Finish, Monitoring};
use emrtd_core::state::Transition;
use emrtd_core::{
    validate_required_files, AccessKey, AccessKeyKind, BinaryFrame, CheckResult, CloseCode,
    CloseReason, FileId, FileSet, FileTracker, MessageKind, ProtocolMessage, ProtocolState,
    StateMachine, ValidationOutcome, WireMessage,
};
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::channel::{ChannelEvent, MessageChannel};
use crate::chip::{ChipError, ChipReadRequest, ChipReader, ChipSessionEnd, HandoverParameters, ReadOptions};
use crate::config::ConnectorConfig;
use crate::error::ConnectorError;
use crate::pending::{PendingReceiver, PendingRegistry};
use crate::status::{status_text, StatusContext, ValidationStep};
use crate::websocket::WebSocketChannel;

/// Status word sent back when a relayed APDU could not be executed.
pub const APDU_NACK: [u8; 2] = [0x6F, 0x00];

/// Capacity of the monitoring broadcast.
const MONITORING_CAPACITY: usize = 32;

/// Close code used for local teardown.
const NORMAL_CLOSE: u16 = 1000;

/// Session state guarded by one lock.
struct Inner<R> {
    machine: StateMachine,
    pending: PendingRegistry,
    files: FileTracker,
    /// Reader with a live hardware session. Cleared only by
    /// `close_chip_session` and `abort_chip_session`.
    active_reader: Option<Arc<R>>,
    error: Option<ConnectorError>,
    outcome: Option<ValidationOutcome>,
    access_key: Option<AccessKeyKind>,
}

/// State shared with the dispatcher task.
struct Shared<R> {
    inner: Mutex<Inner<R>>,
    status: watch::Sender<ValidationStep>,
    monitoring: broadcast::Sender<String>,
    failure: watch::Sender<Option<ConnectorError>>,
    close_seen: watch::Sender<bool>,
    receive_result: bool,
    disconnect_settle: Duration,
}

impl<R: ChipReader> Shared<R> {
    fn set_step(&self, step: ValidationStep) {
        self.status.send_replace(step);
    }

    /// Latch `error` as the session failure.
    ///
    /// Returns `false` if a failure was already latched or the session is
    /// already closed.
    fn report_error(&self, error: ConnectorError) -> bool {
        let mut inner = self.inner.lock();
        if inner.error.is_some() || inner.machine.state() == ProtocolState::Closed {
            return false;
        }
        inner.error = Some(error.clone());
        inner.machine.fail();
        inner.pending.fail_all(error.clone());
        drop(inner);

        error!(error = %error, category = error.category().label(), "session failed");
        self.failure.send_replace(Some(error));
        self.set_step(ValidationStep::Failed);
        true
    }

    /// Invalidate the active chip session, if any.
    fn abort_chip_session(&self, message: &str) {
        let reader = self.inner.lock().active_reader.take();
        if let Some(reader) = reader {
            debug!(reason = message, "invalidating chip session");
            reader.invalidate(message);
        }
    }

    /// End the active chip session with `end`.
    fn close_chip_session(&self, end: ChipSessionEnd) {
        let reader = self.inner.lock().active_reader.take();
        if let Some(reader) = reader {
            reader.finish(end);
        }
    }

    fn is_finished(&self) -> bool {
        self.inner.lock().machine.state().is_terminal()
    }

    fn mark_close_seen(&self) {
        self.close_seen.send_replace(true);
    }

    /// Classify a CLOSE, from either a message or a transport close frame.
    fn handle_close(&self, code: Option<u16>, reason: Option<String>) {
        self.mark_close_seen();
        let normal = code.map_or(true, |code| code == NORMAL_CLOSE);
        let reason = reason.filter(|r| !r.is_empty()).map(|r| CloseReason::parse(&r));

        let mut inner = self.inner.lock();
        let state = inner.machine.state();
        if state.is_terminal() {
            // Confirmation after completion, or noise after failure.
            debug!(%state, ?code, "close after session end");
            return;
        }

        if !self.receive_result && state == ProtocolState::Finishing && normal {
            if let Err(e) = inner.machine.transition(ProtocolState::Completed) {
                warn!(error = %e, "fire-and-forget completion rejected");
            }
            let close = Close {
                reason: reason.as_ref().map(|r| r.as_str().to_string()),
                code,
            };
            inner
                .pending
                .resolve(WireMessage::Text(ProtocolMessage::Close(close)));
            drop(inner);
            info!("server closed normally after FINISH");
            return;
        }
        drop(inner);

        let error = match (code, reason) {
            (code, Some(reason)) if reason.is_recognized() => ConnectorError::Server {
                code: code.map_or_else(|| reason.expected_code(), CloseCode::from),
                reason,
            },
            (Some(code), reason) if code != NORMAL_CLOSE => ConnectorError::Server {
                code: CloseCode::from(code),
                reason: reason.unwrap_or_else(|| CloseReason::Unknown(String::new())),
            },
            _ => ConnectorError::ConnectionClosed,
        };
        self.report_error(error);
    }

    /// Classify a transport disconnect after the settle delay.
    fn handle_disconnect(&self, detail: Option<String>) {
        self.mark_close_seen();
        let state = self.inner.lock().machine.state();
        if state.is_terminal() || state == ProtocolState::Initial {
            debug!(%state, "channel closed");
            return;
        }
        warn!(%state, detail = detail.as_deref().unwrap_or(""), "channel lost");
        let error = if state == ProtocolState::ReadingChip {
            ConnectorError::ConnectionTimeout
        } else {
            ConnectorError::ConnectionClosed
        };
        self.report_error(error);
    }

    /// Apply a control message to the session.
    fn handle_message(&self, message: ProtocolMessage) {
        let kind = message.kind();
        if let ProtocolMessage::Close(close) = message {
            self.handle_close(close.code, close.reason);
            return;
        }

        let mut inner = self.inner.lock();
        if let Err(e) = inner.machine.validate_receive(kind) {
            drop(inner);
            self.report_error(e.into());
            return;
        }

        let applied = match &message {
            ProtocolMessage::Accept(_) => inner.machine.advance(ProtocolState::Accepted).map(|_| ()),
            ProtocolMessage::CaHandback(_) => {
                inner.machine.transition(ProtocolState::HandbackReceived)
            }
            ProtocolMessage::Result(result) => {
                inner.outcome = Some(result.passport.clone());
                inner.machine.transition(ProtocolState::Completed)
            }
            _ => Ok(()),
        };
        if let Err(e) = applied {
            drop(inner);
            self.report_error(e.into());
            return;
        }
        debug!(%kind, state = %inner.machine.state(), "message applied");
        if !inner.pending.resolve(WireMessage::Text(message)) {
            debug!(%kind, "no waiter");
        }
    }
}

/// Cancels an in-flight validation from anywhere.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    cancel: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    /// Abort the validation.
    ///
    /// The chip session is invalidated, the outstanding wait resolves with
    /// [`ConnectorError::Cancelled`] and the channel is closed.
    pub fn cancel(&self) {
        self.cancel.send_replace(true);
    }

    /// Whether `cancel` was called.
    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }
}

/// Coordinates one validation session.
///
/// This type does not implement `Clone` to prevent state duplication.
pub struct Connector<C: MessageChannel + 'static, R: ChipReader> {
    config: ConnectorConfig,
    channel: Arc<C>,
    reader: Arc<R>,
    shared: Arc<Shared<R>>,
    cancel: Arc<watch::Sender<bool>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl<R: ChipReader> Connector<WebSocketChannel, R> {
    /// Create a connector talking WebSocket to `config.server_url`.
    pub fn websocket(config: ConnectorConfig, reader: R) -> Self {
        let channel = WebSocketChannel::from_config(&config);
        Self::new(config, channel, reader)
    }
}

impl<C: MessageChannel + 'static, R: ChipReader> Connector<C, R> {
    /// Create a connector over `channel`.
    pub fn new(config: ConnectorConfig, channel: C, reader: R) -> Self {
        let (status, _) = watch::channel(ValidationStep::Idle);
        let (monitoring, _) = broadcast::channel(MONITORING_CAPACITY);
        let (failure, _) = watch::channel(None);
        let (close_seen, _) = watch::channel(false);
        let (cancel, _) = watch::channel(false);
        let shared = Shared {
            inner: Mutex::new(Inner {
                machine: StateMachine::new(),
                pending: PendingRegistry::new(),
                files: FileTracker::new(),
                active_reader: None,
                error: None,
                outcome: None,
                access_key: None,
            }),
            status,
            monitoring,
            failure,
            close_seen,
            receive_result: config.receive_result,
            disconnect_settle: config.disconnect_settle,
        };
        Self {
            config,
            channel: Arc::new(channel),
            reader: Arc::new(reader),
            shared: Arc::new(shared),
            cancel: Arc::new(cancel),
            dispatcher: Mutex::new(None),
        }
    }

    /// Current protocol state.
    pub fn state(&self) -> ProtocolState {
        self.shared.inner.lock().machine.state()
    }

    /// Transition history, oldest first.
    pub fn history(&self) -> Vec<Transition> {
        self.shared.inner.lock().machine.history().to_vec()
    }

    /// Outcome received so far.
    pub fn outcome(&self) -> Option<ValidationOutcome> {
        self.shared.inner.lock().outcome.clone()
    }

    /// The latched session failure, if any.
    pub fn last_error(&self) -> Option<ConnectorError> {
        self.shared.inner.lock().error.clone()
    }

    /// Progress observer.
    pub fn status(&self) -> watch::Receiver<ValidationStep> {
        self.shared.status.subscribe()
    }

    /// Display text for the current step.
    pub fn status_text(&self) -> String {
        let step = *self.shared.status.borrow();
        status_text(step, &self.status_context())
    }

    /// Context for [`status_text`].
    pub fn status_context(&self) -> StatusContext {
        StatusContext {
            access_key: self.shared.inner.lock().access_key,
        }
    }

    /// Observer for MONITORING messages sent by this session.
    pub fn monitoring(&self) -> broadcast::Receiver<String> {
        self.shared.monitoring.subscribe()
    }

    /// Handle that cancels this session.
    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            cancel: Arc::clone(&self.cancel),
        }
    }

    /// The channel.
    pub fn channel(&self) -> &C {
        &self.channel
    }

    /// The chip reader.
    pub fn reader(&self) -> &R {
        &self.reader
    }

    /// Open the channel.
    ///
    /// Retries transient connect failures per the configured policy.
    pub async fn connect(&self) -> Result<(), ConnectorError> {
        self.config.validate()?;
        let state = self.state();
        if state != ProtocolState::Initial {
            return Err(ConnectorError::InvalidState {
                current: state,
                requested: ProtocolState::Connected,
            });
        }

        self.shared.set_step(ValidationStep::Connecting);
        let attempt = self.config.retry.execute(
            || self.channel.connect(),
            ConnectorError::is_connect_retryable,
            |attempt, e| warn!(attempt, error = %e, "connect failed, retrying"),
        );
        let events = match tokio::time::timeout(ProtocolState::Connecting.timeout(), attempt).await
        {
            Ok(Ok(events)) => events,
            Ok(Err(e)) => {
                self.shared.report_error(e.clone());
                return Err(e);
            }
            Err(_) => {
                self.shared.report_error(ConnectorError::ConnectionTimeout);
                return Err(ConnectorError::ConnectionTimeout);
            }
        };

        self.shared
            .inner
            .lock()
            .machine
            .transition(ProtocolState::Connected)?;
        let handle = tokio::spawn(dispatch(
            Arc::clone(&self.shared),
            Arc::clone(&self.channel),
            events,
        ));
        if let Some(previous) = self.dispatcher.lock().replace(handle) {
            previous.abort();
        }
        self.shared.set_step(ValidationStep::Connected);
        info!(url = %self.config.server_url, "connected");
        Ok(())
    }

    /// Connect, validate and disconnect in one call.
    ///
    /// Returns `None` in fire-and-forget mode.
    pub async fn validate(
        &self,
        access_key: &AccessKey,
    ) -> Result<Option<ValidationOutcome>, ConnectorError> {
        self.validate_with_options(access_key, &ReadOptions::default())
            .await
    }

    /// [`validate`](Self::validate) with explicit read options.
    pub async fn validate_with_options(
        &self,
        access_key: &AccessKey,
        options: &ReadOptions,
    ) -> Result<Option<ValidationOutcome>, ConnectorError> {
        if let Err(e) = self.connect().await {
            self.disconnect().await;
            return Err(e);
        }
        let result = self.start_validation(access_key, options).await;
        if result.is_ok() {
            self.wait_for_close(self.config.close_grace).await;
        }
        self.disconnect().await;
        result
    }

    /// Run the handshake on an already connected session.
    ///
    /// Does not close the channel; call [`disconnect`](Self::disconnect).
    pub async fn start_validation(
        &self,
        access_key: &AccessKey,
        options: &ReadOptions,
    ) -> Result<Option<ValidationOutcome>, ConnectorError> {
        let mut cancel = self.cancel.subscribe();
        let mut failure = self.shared.failure.subscribe();
        self.shared.inner.lock().access_key = Some(access_key.kind());

        let result = tokio::select! {
            biased;
            _ = cancelled(&mut cancel) => Err(ConnectorError::Cancelled),
            e = session_failure(&mut failure) => Err(e),
            r = self.run(access_key, options) => r,
        };

        match &result {
            Ok(_) => self.shared.set_step(ValidationStep::Completed),
            Err(ConnectorError::Cancelled) => {
                info!("validation cancelled");
                self.shared.abort_chip_session("cancelled");
                self.shared.report_error(ConnectorError::Cancelled);
                self.shared.set_step(ValidationStep::Cancelled);
                self.disconnect().await;
            }
            Err(e) => {
                self.shared.abort_chip_session(&e.to_string());
                self.shared.report_error(e.clone());
            }
        }
        result
    }

    /// Close the session and the channel. Idempotent.
    pub async fn disconnect(&self) {
        self.close_session();
        self.channel.disconnect(NORMAL_CLOSE, "").await;
    }

    /// Send a MONITORING line. Does nothing unless diagnostics are enabled.
    pub async fn send_monitoring(&self, message: impl Into<String>) -> Result<(), ConnectorError> {
        if !self.config.enable_diagnostics {
            return Ok(());
        }
        let message = message.into();
        self.shared
            .inner
            .lock()
            .machine
            .validate_send(MessageKind::Monitoring)?;
        self.channel
            .send(
                ProtocolMessage::Monitoring(Monitoring {
                    message: message.clone(),
                })
                .into(),
            )
            .await?;
        let _ = self.shared.monitoring.send(message);
        Ok(())
    }

    /// Monitoring from the coordinator itself is best effort.
    async fn monitor(&self, message: String) {
        if let Err(e) = self.send_monitoring(message).await {
            debug!(error = %e, "monitoring not sent");
        }
    }

    async fn run(
        &self,
        access_key: &AccessKey,
        options: &ReadOptions,
    ) -> Result<Option<ValidationOutcome>, ConnectorError> {
        let challenge = self.send_start_and_wait_for_accept().await?;

        self.shared.set_step(ValidationStep::ReadingChip);
        self.shared.inner.lock().active_reader = Some(Arc::clone(&self.reader));
        let request = ChipReadRequest {
            access_key,
            challenge: &challenge,
            pace_polling: options.pace_polling,
        };
        let handover = self
            .chip_phase(ProtocolState::ReadingChip.timeout(), self.reader.start(request))
            .await?;
        let has_security_key = handover.has_security_key();
        let state = handover.state;
        let mut files = handover.files;

        let read = if has_security_key {
            for (id, data) in files.iter() {
                self.send_binary_file(id, data).await?;
            }
            let handback = self.send_handover_and_wait(&handover.parameters).await?;
            self.shared.set_step(ValidationStep::CompletingRead);
            self.chip_phase(
                ProtocolState::HandbackReceived.timeout(),
                self.reader
                    .complete(state, handback, &options.requested_files),
            )
            .await?
        } else {
            info!("no security key file, skipping chip authentication");
            self.monitor("chip authentication skipped".into()).await;
            self.shared.set_step(ValidationStep::CompletingRead);
            self.chip_phase(
                ProtocolState::ReadingChip.timeout(),
                self.reader
                    .complete_without_ca(state, &options.requested_files),
            )
            .await?
        };

        for (id, data) in read.files {
            files.insert(id, data);
        }
        if let Err(e) = validate_required_files(&files, &options.requested_files) {
            warn!(error = %e, "chip read incomplete");
            self.shared
                .close_chip_session(ChipSessionEnd::Failure(e.to_string()));
            return Err(e.into());
        }
        self.shared.close_chip_session(ChipSessionEnd::Success);
        self.monitor(format!("chip read complete, {} files", files.len()))
            .await;

        let outcome = self
            .send_finish(&files, read.active_authentication_signature)
            .await?;

        if let Some(outcome) = &outcome {
            if self.config.require_valid_outcome && !outcome.is_valid() {
                let detail = if outcome.errors().is_empty() {
                    "document did not validate".to_string()
                } else {
                    outcome.errors().join("; ")
                };
                return Err(ConnectorError::ValidationFailed(detail));
            }
        }
        Ok(outcome)
    }

    /// Send START and wait for ACCEPT. Returns the AA challenge.
    async fn send_start_and_wait_for_accept(&self) -> Result<Vec<u8>, ConnectorError> {
        if self.state() == ProtocolState::Initial {
            return Err(ConnectorError::NotConnected);
        }
        let start = self
            .config
            .identity
            .start_message(&self.config.platform, self.config.enable_diagnostics);
        let rx = self
            .send_registered(start, ProtocolState::Started, MessageKind::Accept)
            .await?;
        self.shared.set_step(ValidationStep::Starting);

        match self.await_pending(rx, ProtocolState::Started).await? {
            WireMessage::Text(ProtocolMessage::Accept(accept)) => {
                debug!(
                    challenge = %hex::encode(&accept.active_authentication_challenge),
                    "accepted"
                );
                Ok(accept.active_authentication_challenge)
            }
            other => Err(unexpected_reply(&other)),
        }
    }

    /// Send CA_HANDOVER and wait for CA_HANDBACK.
    async fn send_handover_and_wait(
        &self,
        parameters: &HandoverParameters,
    ) -> Result<CaHandback, ConnectorError> {
        let handover = ProtocolMessage::CaHandover(CaHandover {
            max_transceive_length_for_secure_messaging: parameters
                .max_transceive_length_for_secure_messaging,
            max_block_size: parameters.max_block_size,
            secure_messaging_info: parameters.secure_messaging_info.clone(),
        });
        let rx = self
            .send_registered(handover, ProtocolState::HandoverSent, MessageKind::CaHandback)
            .await
            .map_err(|e| match e {
                ConnectorError::Send(detail) => ConnectorError::HandoverFailed(detail),
                other => other,
            })?;
        self.shared.set_step(ValidationStep::AuthenticatingChip);

        let handback = match self.await_pending(rx, ProtocolState::HandoverSent).await? {
            WireMessage::Text(ProtocolMessage::CaHandback(handback)) => handback,
            other => return Err(unexpected_reply(&other)),
        };
        if handback.check_result == CheckResult::Failed {
            if let Some(message) = &handback.error_message {
                return Err(ConnectorError::HandbackFailed(message.clone()));
            }
        }
        debug!(check_result = ?handback.check_result, "handback received");
        Ok(handback)
    }

    /// Send the remaining files and FINISH, then wait for the outcome.
    async fn send_finish(
        &self,
        files: &FileSet,
        signature: Option<Vec<u8>>,
    ) -> Result<Option<ValidationOutcome>, ConnectorError> {
        self.shared.set_step(ValidationStep::SendingFiles);
        for (id, data) in files.iter() {
            self.send_binary_file(id, data).await?;
        }

        let finish = ProtocolMessage::Finish(Finish {
            send_result: self.config.receive_result,
            active_authentication_signature: signature,
        });

        if !self.config.receive_result {
            let rx = self
                .send_registered(finish, ProtocolState::Finishing, MessageKind::Close)
                .await?;
            self.await_pending(rx, ProtocolState::Finishing).await?;
            return Ok(None);
        }

        let rx = self
            .send_registered(finish, ProtocolState::Finishing, MessageKind::Result)
            .await?;
        self.shared.set_step(ValidationStep::WaitingForResult);
        match self.await_pending(rx, ProtocolState::Finishing).await? {
            WireMessage::Text(ProtocolMessage::Result(result)) => {
                info!(valid = result.passport.is_valid(), "result received");
                Ok(Some(result.passport))
            }
            other => Err(unexpected_reply(&other)),
        }
    }

    /// Send one chip file unless it already crossed the wire.
    pub async fn send_binary_file(&self, id: FileId, data: &[u8]) -> Result<(), ConnectorError> {
        {
            let inner = self.shared.inner.lock();
            if inner.files.is_transferred(id) {
                debug!(file = %id, "already transferred");
                return Ok(());
            }
            inner.machine.validate_send(MessageKind::File)?;
        }
        let frame = BinaryFrame::file(id.name(), data.to_vec())?;
        self.channel.send(frame.into()).await?;
        self.shared.inner.lock().files.mark_sent(id);
        Ok(())
    }

    /// Check, transition, register the wait, then send.
    async fn send_registered(
        &self,
        message: ProtocolMessage,
        next: ProtocolState,
        expect: MessageKind,
    ) -> Result<PendingReceiver, ConnectorError> {
        let rx = {
            let mut inner = self.shared.inner.lock();
            inner.machine.validate_send(message.kind())?;
            inner.machine.transition(next)?;
            inner.pending.register(expect)?
        };
        self.channel.send(message.into()).await?;
        Ok(rx)
    }

    /// Wait for a reply within the budget of `state`.
    async fn await_pending(
        &self,
        rx: PendingReceiver,
        state: ProtocolState,
    ) -> Result<WireMessage, ConnectorError> {
        match tokio::time::timeout(state.timeout(), rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(self.last_error().unwrap_or(ConnectorError::Cancelled)),
            Err(_) => Err(ConnectorError::ConnectionTimeout),
        }
    }

    /// Run one chip reader phase under the state budget and the host ceiling.
    async fn chip_phase<T>(
        &self,
        budget: Duration,
        phase: impl Future<Output = Result<T, ChipError>>,
    ) -> Result<T, ConnectorError> {
        let limit = budget.min(self.config.chip_session_ceiling);
        match tokio::time::timeout(limit, phase).await {
            Ok(result) => result.map_err(ConnectorError::from),
            Err(_) => Err(ConnectorError::ChipTimeout),
        }
    }

    /// Give the server a moment to send its CLOSE.
    async fn wait_for_close(&self, grace: Duration) {
        let mut seen = self.shared.close_seen.subscribe();
        if tokio::time::timeout(grace, seen.wait_for(|seen| *seen))
            .await
            .is_err()
        {
            debug!("no close from server within grace period");
        }
    }

    /// Move to `Closed` and release every waiter.
    fn close_session(&self) {
        let mut inner = self.shared.inner.lock();
        let state = inner.machine.state();
        if state.can_transition_to(ProtocolState::Closed) {
            if let Err(e) = inner.machine.transition(ProtocolState::Closed) {
                warn!(error = %e, "close transition rejected");
            }
        }
        inner.pending.fail_all(ConnectorError::Cancelled);
    }
}

impl<C: MessageChannel + 'static, R: ChipReader> Drop for Connector<C, R> {
    fn drop(&mut self) {
        let reader = {
            let mut inner = self.shared.inner.lock();
            inner.pending.fail_all(ConnectorError::Cancelled);
            inner.active_reader.take()
        };
        if let Some(reader) = reader {
            reader.invalidate("session dropped");
        }
        if let Some(handle) = self.dispatcher.get_mut().take() {
            handle.abort();
        }
    }
}

fn unexpected_reply(message: &WireMessage) -> ConnectorError {
    ConnectorError::InvalidResponse(format!("unexpected reply {}", message.kind()))
}

async fn cancelled(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|cancelled| *cancelled).await.is_err() {
        std::future::pending::<()>().await;
    }
}

async fn session_failure(rx: &mut watch::Receiver<Option<ConnectorError>>) -> ConnectorError {
    loop {
        let latched = rx.borrow_and_update().clone();
        if let Some(error) = latched {
            return error;
        }
        if rx.changed().await.is_err() {
            return std::future::pending().await;
        }
    }
}

/// Serially apply inbound events to the session.
async fn dispatch<C, R>(
    shared: Arc<Shared<R>>,
    channel: Arc<C>,
    mut events: mpsc::Receiver<ChannelEvent>,
) where
    C: MessageChannel + 'static,
    R: ChipReader,
{
    while let Some(event) = events.recv().await {
        if let ChannelEvent::Disconnected(detail) = event {
            // A trailing close frame may still be queued behind the signal.
            tokio::time::sleep(shared.disconnect_settle).await;
            while let Ok(event) = events.try_recv() {
                handle_event(&shared, channel.as_ref(), event).await;
            }
            shared.handle_disconnect(detail);
            return;
        }
        handle_event(&shared, channel.as_ref(), event).await;
    }
    shared.handle_disconnect(None);
}

async fn handle_event<C, R>(shared: &Shared<R>, channel: &C, event: ChannelEvent)
where
    C: MessageChannel,
    R: ChipReader,
{
    match event {
        ChannelEvent::Closed { code, reason } => shared.handle_close(code, reason),
        ChannelEvent::Disconnected(detail) => shared.handle_disconnect(detail),
        ChannelEvent::Message(WireMessage::Text(ProtocolMessage::Close(close))) => {
            shared.handle_close(close.code, close.reason)
        }
        // The outcome is already settled; late frames must not unsettle it.
        _ if shared.is_finished() => debug!("ignoring frame after session end"),
        ChannelEvent::Message(WireMessage::Text(message)) => shared.handle_message(message),
        ChannelEvent::Message(WireMessage::Binary(BinaryFrame::File { name, data })) => {
            let mut inner = shared.inner.lock();
            if let Err(e) = inner.machine.validate_receive(MessageKind::File) {
                drop(inner);
                shared.report_error(e.into());
                return;
            }
            match name.parse::<FileId>() {
                Ok(id) => {
                    debug!(file = %id, len = data.len(), "file received");
                    inner.files.mark_received(id);
                }
                Err(e) => warn!(error = %e, "ignoring unknown file"),
            }
        }
        ChannelEvent::Message(WireMessage::Binary(BinaryFrame::Apdu(command))) => {
            relay_apdu(shared, channel, command).await;
        }
        ChannelEvent::Malformed(e) => {
            let waiting = !shared.inner.lock().pending.is_empty();
            if waiting {
                shared.report_error(ConnectorError::Decode(e));
            } else {
                warn!(error = %e, "dropping malformed frame");
            }
        }
    }
}

/// Forward a server-pushed APDU to the chip and send back its response.
async fn relay_apdu<C, R>(shared: &Shared<R>, channel: &C, command: Vec<u8>)
where
    C: MessageChannel,
    R: ChipReader,
{
    let reader = {
        let mut inner = shared.inner.lock();
        if let Err(e) = inner.machine.validate_receive(MessageKind::Apdu) {
            drop(inner);
            shared.report_error(e.into());
            return;
        }
        if inner.pending.is_pending(MessageKind::Apdu) {
            inner
                .pending
                .resolve(WireMessage::Binary(BinaryFrame::Apdu(command)));
            return;
        }
        inner.active_reader.clone()
    };

    debug!(command = %hex::encode(&command), "relaying APDU");
    let response = match reader {
        Some(reader) => match reader.relay_apdu(&command).await {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, "APDU relay failed, sending NACK");
                APDU_NACK.to_vec()
            }
        },
        None => {
            warn!("no active chip session, sending NACK");
            APDU_NACK.to_vec()
        }
    };

    if let Err(e) = channel
        .send(WireMessage::Binary(BinaryFrame::apdu(response)))
        .await
    {
        shared.report_error(e);
    }
}
