//! Timer callbacks delivered through the chain handler.

use std::time::Duration;

use tokio::sync::mpsc::UnboundedSender;
use tracing::debug;

use crate::message::InternalMessage;

/// Lets a gear ask to be called back with `timeout` after a delay.
pub trait Timeouts: Send + Sync {
    fn register_timeout(&self, delay: Duration);
}

/// Delivers timeouts as [`InternalMessage::Timeout`] on the handler's
/// internal queue. Must be used from within a tokio runtime.
#[derive(Debug, Clone)]
pub struct HandlerTimeouts {
    internal: UnboundedSender<InternalMessage>,
}

impl HandlerTimeouts {
    pub fn new(internal: UnboundedSender<InternalMessage>) -> Self {
        Self { internal }
    }
}

impl Timeouts for HandlerTimeouts {
    fn register_timeout(&self, delay: Duration) {
        let internal = self.internal.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if internal.send(InternalMessage::Timeout).is_err() {
                debug!("dropping timeout, chain handler stopped");
            }
        });
    }
}
