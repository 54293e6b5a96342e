//! Message bus seam.
//!
//! Conversations only ever send through [`MessageSender`]. Production
//! deployments wrap their broker client in it; [`LocalBus`] is an
//! in-process publish/subscribe implementation built on tokio mpsc
//! channels, used by the simulation harness and tests.

use crate::error::TransportError;
use crate::message::Message;
use crate::types::Destination;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tracing::trace;

/// Fire-and-forget outbound message delivery.
#[async_trait]
pub trait MessageSender: Send + Sync {
    /// Send `message` to `destination`.
    async fn send(&self, message: Message, destination: &Destination) -> Result<(), TransportError>;
}

/// Statistics for a [`LocalBus`].
#[derive(Debug, Clone, Default)]
pub struct LocalBusStats {
    /// Messages accepted for delivery.
    pub messages_sent: u64,
    /// Individual deliveries to subscribers.
    pub deliveries: u64,
    /// Sends that failed.
    pub send_errors: u64,
}

/// In-process publish/subscribe bus. Every subscriber of a destination
/// receives its own copy of each message sent there, in send order.
#[derive(Debug, Default)]
pub struct LocalBus {
    subscribers: DashMap<Destination, Vec<mpsc::UnboundedSender<Message>>>,
    messages_sent: AtomicU64,
    deliveries: AtomicU64,
    send_errors: AtomicU64,
}

impl LocalBus {
    /// Create an empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to a destination.
    pub fn subscribe(&self, destination: Destination) -> mpsc::UnboundedReceiver<Message> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.entry(destination).or_default().push(tx);
        rx
    }

    /// Drop every subscription on a destination. Returns how many there were.
    pub fn close(&self, destination: &Destination) -> usize {
        self.subscribers
            .remove(destination)
            .map(|(_, subs)| subs.len())
            .unwrap_or(0)
    }

    /// Number of live subscriptions on a destination.
    pub fn subscriber_count(&self, destination: &Destination) -> usize {
        self.subscribers
            .get(destination)
            .map(|subs| subs.iter().filter(|s| !s.is_closed()).count())
            .unwrap_or(0)
    }

    /// Snapshot of the counters.
    pub fn stats(&self) -> LocalBusStats {
        LocalBusStats {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            deliveries: self.deliveries.load(Ordering::Relaxed),
            send_errors: self.send_errors.load(Ordering::Relaxed),
        }
    }

    fn fail(&self, err: TransportError) -> Result<(), TransportError> {
        self.send_errors.fetch_add(1, Ordering::Relaxed);
        Err(err)
    }
}

#[async_trait]
impl MessageSender for LocalBus {
    async fn send(&self, message: Message, destination: &Destination) -> Result<(), TransportError> {
        let delivered = {
            let mut subs = match self.subscribers.get_mut(destination) {
                Some(subs) => subs,
                None => {
                    return self.fail(TransportError::NoRoute {
                        destination: destination.clone(),
                    })
                }
            };
            subs.retain(|s| !s.is_closed());
            if subs.is_empty() {
                drop(subs);
                return self.fail(TransportError::ChannelClosed {
                    destination: destination.clone(),
                });
            }
            subs.iter()
                .filter(|s| s.send(message.clone()).is_ok())
                .count()
        };
        if delivered == 0 {
            return self.fail(TransportError::ChannelClosed {
                destination: destination.clone(),
            });
        }
        trace!(destination = %destination, kind = message.kind(), delivered, "message sent");
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.deliveries.fetch_add(delivered as u64, Ordering::Relaxed);
        Ok(())
    }
}
