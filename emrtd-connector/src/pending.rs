//! Pending-response registry.
//!
//! Every outstanding wait for a server message is registered here, keyed by
//! the expected message kind. At most one wait per kind exists at a time.
//! Resolution is idempotent: the first resolve or fail wins and later ones
//! are ignored. Once the registry is failed, new registrations are refused.

use std::collections::HashMap;

use emrtd_core::{MessageKind, WireMessage};
use tokio::sync::oneshot;

use crate::error::ConnectorError;

/// Value delivered to a waiter.
pub type PendingResult = Result<WireMessage, ConnectorError>;

/// Receiving half handed to the waiter.
pub type PendingReceiver = oneshot::Receiver<PendingResult>;

/// Outstanding waits keyed by expected kind.
#[derive(Debug, Default)]
pub struct PendingRegistry {
    waiters: HashMap<MessageKind, oneshot::Sender<PendingResult>>,
    failed: Option<ConnectorError>,
}

impl PendingRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a wait for `kind`.
    ///
    /// Fails with the latched error if the registry was failed, or with
    /// `InvalidResponse` if a wait for `kind` is already outstanding.
    pub fn register(&mut self, kind: MessageKind) -> Result<PendingReceiver, ConnectorError> {
        if let Some(error) = &self.failed {
            return Err(error.clone());
        }
        // A sender whose receiver was dropped no longer counts.
        if let Some(existing) = self.waiters.get(&kind) {
            if !existing.is_closed() {
                return Err(ConnectorError::InvalidResponse(format!(
                    "already waiting for {kind}"
                )));
            }
        }
        let (tx, rx) = oneshot::channel();
        self.waiters.insert(kind, tx);
        Ok(rx)
    }

    /// Whether a wait for `kind` is outstanding.
    pub fn is_pending(&self, kind: MessageKind) -> bool {
        self.waiters.get(&kind).is_some_and(|tx| !tx.is_closed())
    }

    /// Deliver `message` to the waiter for its kind.
    ///
    /// Returns `false` if nobody was waiting.
    pub fn resolve(&mut self, message: WireMessage) -> bool {
        match self.waiters.remove(&message.kind()) {
            Some(tx) => tx.send(Ok(message)).is_ok(),
            None => false,
        }
    }

    /// Fail the waiter for `kind`.
    pub fn fail(&mut self, kind: MessageKind, error: ConnectorError) -> bool {
        match self.waiters.remove(&kind) {
            Some(tx) => tx.send(Err(error)).is_ok(),
            None => false,
        }
    }

    /// Fail every waiter and refuse further registrations.
    ///
    /// Only the first call latches its error.
    pub fn fail_all(&mut self, error: ConnectorError) {
        if self.failed.is_none() {
            self.failed = Some(error.clone());
        }
        for (_, tx) in self.waiters.drain() {
            let _ = tx.send(Err(error.clone()));
        }
    }

    /// Number of outstanding waits.
    pub fn len(&self) -> usize {
        self.waiters.values().filter(|tx| !tx.is_closed()).count()
    }

    /// Whether nothing is outstanding.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use emrtd_core::message::{Accept, Close};
    use emrtd_core::{BinaryFrame, ProtocolMessage};

    fn accept() -> WireMessage {
        WireMessage::Text(ProtocolMessage::Accept(Accept {
            active_authentication_challenge: vec![1, 2, 3],
        }))
    }

    #[tokio::test]
    async fn test_resolve_delivers_once() {
        let mut registry = PendingRegistry::new();
        let rx = registry.register(MessageKind::Accept).unwrap();
        assert!(registry.resolve(accept()));
        assert!(!registry.resolve(accept()));
        assert_eq!(rx.await.unwrap(), Ok(accept()));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_binary_kinds_resolve() {
        let mut registry = PendingRegistry::new();
        let rx = registry.register(MessageKind::Apdu).unwrap();
        let reply = WireMessage::Binary(BinaryFrame::apdu(vec![0x90, 0x00]));
        assert!(registry.resolve(reply.clone()));
        assert_eq!(rx.await.unwrap(), Ok(reply));
    }

    #[test]
    fn test_one_wait_per_kind() {
        let mut registry = PendingRegistry::new();
        let _rx = registry.register(MessageKind::Result).unwrap();
        assert!(registry.register(MessageKind::Result).is_err());
        assert!(registry.register(MessageKind::CaHandback).is_ok());
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_dropped_waiter_can_be_replaced() {
        let mut registry = PendingRegistry::new();
        drop(registry.register(MessageKind::Accept).unwrap());
        assert!(!registry.is_pending(MessageKind::Accept));
        assert!(registry.register(MessageKind::Accept).is_ok());
    }

    #[tokio::test]
    async fn test_fail_all_resolves_every_waiter() {
        let mut registry = PendingRegistry::new();
        let a = registry.register(MessageKind::Accept).unwrap();
        let b = registry.register(MessageKind::Close).unwrap();
        registry.fail_all(ConnectorError::ConnectionTimeout);
        registry.fail_all(ConnectorError::Cancelled);

        assert_eq!(a.await.unwrap(), Err(ConnectorError::ConnectionTimeout));
        assert_eq!(b.await.unwrap(), Err(ConnectorError::ConnectionTimeout));
        assert_eq!(
            registry.register(MessageKind::Result).unwrap_err(),
            ConnectorError::ConnectionTimeout
        );
    }

    #[tokio::test]
    async fn test_fail_single_kind() {
        let mut registry = PendingRegistry::new();
        let rx = registry.register(MessageKind::Close).unwrap();
        assert!(registry.fail(MessageKind::Close, ConnectorError::Cancelled));
        assert_eq!(rx.await.unwrap(), Err(ConnectorError::Cancelled));
        assert!(!registry.resolve(WireMessage::Text(ProtocolMessage::Close(Close::default()))));
    }
}
