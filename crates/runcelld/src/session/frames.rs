//! Frame sequencing and delivery to the session's subscriber.

use std::collections::VecDeque;

use runcell_core::{FrameBody, OutputFrame, SessionId};
use tokio::sync::mpsc;
use tracing::trace;

/// Ordered frames from one session.
///
/// Ends after the session's final state change, or when replaced by a newer
/// subscription.
#[derive(Debug)]
pub struct FrameStream {
    receiver: mpsc::UnboundedReceiver<OutputFrame>,
}

impl FrameStream {
    /// Returns the next frame, or `None` once the stream has ended.
    pub async fn recv(&mut self) -> Option<OutputFrame> {
        self.receiver.recv().await
    }

    /// Returns a frame if one is ready.
    pub fn try_recv(&mut self) -> Option<OutputFrame> {
        self.receiver.try_recv().ok()
    }
}

/// Assigns sequence numbers and routes frames to at most one subscriber.
///
/// Frames that cannot be delivered (nobody subscribed, or the subscriber
/// went away) are kept in a bounded backlog, oldest dropped first, and
/// replayed to the next subscriber.
#[derive(Debug)]
pub(super) struct FrameSink {
    session_id: SessionId,
    next_seq: u64,
    subscriber: Option<mpsc::UnboundedSender<OutputFrame>>,
    backlog: VecDeque<OutputFrame>,
    backlog_limit: usize,
}

impl FrameSink {
    pub fn new(session_id: SessionId, backlog_limit: usize) -> Self {
        Self {
            session_id,
            next_seq: 0,
            subscriber: None,
            backlog: VecDeque::new(),
            backlog_limit,
        }
    }

    /// Number of frames emitted so far.
    pub fn emitted(&self) -> u64 {
        self.next_seq
    }

    pub fn emit(&mut self, body: FrameBody) {
        let frame = OutputFrame {
            session_id: self.session_id.clone(),
            seq: self.next_seq,
            body,
        };
        self.next_seq += 1;

        let undelivered = match &self.subscriber {
            Some(tx) => match tx.send(frame) {
                Ok(()) => return,
                Err(mpsc::error::SendError(frame)) => frame,
            },
            None => frame,
        };
        self.subscriber = None;
        self.buffer(undelivered);
    }

    fn buffer(&mut self, frame: OutputFrame) {
        if self.backlog_limit == 0 {
            return;
        }
        while self.backlog.len() >= self.backlog_limit {
            if let Some(dropped) = self.backlog.pop_front() {
                trace!(session_id = %self.session_id, seq = dropped.seq, "Backlog full, dropping frame");
            }
        }
        self.backlog.push_back(frame);
    }

    /// Starts a new stream, ending any previous one, and replays the backlog.
    pub fn subscribe(&mut self) -> FrameStream {
        let (tx, rx) = mpsc::unbounded_channel();
        for frame in self.backlog.drain(..) {
            // The receiver is alive in this scope.
            let _ = tx.send(frame);
        }
        self.subscriber = Some(tx);
        FrameStream { receiver: rx }
    }

    /// Ends the current stream after everything already sent.
    pub fn close(&mut self) {
        self.subscriber = None;
        self.backlog.clear();
    }
}
