use std::sync::Mutex;

use image::DynamicImage;
use tokio::sync::mpsc;
use tracing::debug;

/// One message back to the requester.
#[derive(Debug, Clone)]
pub enum Reply {
    Image(DynamicImage),
    Text(String),
}

impl Reply {
    pub fn text(message: impl Into<String>) -> Self {
        Self::Text(message.into())
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Image(_) => "image",
            Self::Text(_) => "text",
        }
    }
}

/// Where replies go as soon as they are produced. Delivery order is the
/// order of `send` calls.
pub trait ReplySink: Send + Sync {
    fn send(&self, reply: Reply);
}

/// Forwards replies over a channel to whatever transport owns the chat.
#[derive(Debug, Clone)]
pub struct ChannelReplySink {
    tx: mpsc::UnboundedSender<Reply>,
}

impl ChannelReplySink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Reply>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl ReplySink for ChannelReplySink {
    fn send(&self, reply: Reply) {
        let kind = reply.kind();
        if self.tx.send(reply).is_err() {
            debug!(kind, "reply receiver dropped; discarding reply");
        }
    }
}

/// Collects replies in memory, for transports that answer in one response.
#[derive(Debug, Default)]
pub struct BufferedReplySink {
    replies: Mutex<Vec<Reply>>,
}

impl BufferedReplySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take(&self) -> Vec<Reply> {
        match self.replies.lock() {
            Ok(mut replies) => std::mem::take(&mut *replies),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        }
    }
}

impl ReplySink for BufferedReplySink {
    fn send(&self, reply: Reply) {
        match self.replies.lock() {
            Ok(mut replies) => replies.push(reply),
            Err(poisoned) => poisoned.into_inner().push(reply),
        }
    }
}
