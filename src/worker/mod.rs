pub mod gate;

use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestState {
    Received,
    Queued,
    Running,
    Streaming,
    Done,
    Rejected,
    Failed,
}

impl RequestState {
    pub fn can_transition_to(self, next: Self) -> bool {
        use RequestState::{Done, Failed, Queued, Received, Rejected, Running, Streaming};

        matches!(
            (self, next),
            (Received, Queued)
                | (Received, Rejected)
                // help replies never enter the gate
                | (Received, Done)
                | (Queued, Running)
                | (Queued, Rejected)
                | (Running, Streaming)
                | (Running, Done)
                | (Running, Failed)
                | (Streaming, Streaming)
                | (Streaming, Done)
                | (Streaming, Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Rejected | Self::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Streaming => "streaming",
            Self::Done => "done",
            Self::Rejected => "rejected",
            Self::Failed => "failed",
        }
    }
}

/// Per-request state tracker. Lives only as long as the request it describes.
#[derive(Debug, Clone)]
pub struct RequestLifecycle {
    request_id: Uuid,
    history: Vec<RequestState>,
}

impl RequestLifecycle {
    pub fn new() -> Self {
        Self {
            request_id: Uuid::new_v4(),
            history: vec![RequestState::Received],
        }
    }

    pub fn request_id(&self) -> Uuid {
        self.request_id
    }

    pub fn state(&self) -> RequestState {
        self.history
            .last()
            .copied()
            .unwrap_or(RequestState::Received)
    }

    pub fn history(&self) -> &[RequestState] {
        self.history.as_slice()
    }

    /// Move to `next`, returning false (and keeping the current state) when the
    /// transition is not allowed.
    pub fn advance(&mut self, next: RequestState) -> bool {
        let current = self.state();
        if !current.can_transition_to(next) {
            warn!(
                request_id = %self.request_id,
                from = current.as_str(),
                to = next.as_str(),
                "ignoring invalid request state transition"
            );
            return false;
        }
        debug!(
            request_id = %self.request_id,
            from = current.as_str(),
            to = next.as_str(),
            "request state transition"
        );
        if !(current == RequestState::Streaming && next == RequestState::Streaming) {
            self.history.push(next);
        }
        true
    }
}

impl Default for RequestLifecycle {
    fn default() -> Self {
        Self::new()
    }
}
