use crate::protocol::{ChatEvent, ChatEventKind, ServerMessage};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Outbound half of one panel connection. Delivery is best effort: a closed panel drops
/// messages and nothing is retried.
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<ServerMessage>,
}

impl EventSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ServerMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn send(&self, message: impl Into<ServerMessage>) -> bool {
        self.tx.send(message.into()).is_ok()
    }
}

/// Emits the events of a single request in order.
///
/// Once the request's token is cancelled, [`RequestEvents::emit`] drops everything; only
/// [`RequestEvents::terminal`] still goes out.
pub struct RequestEvents<'a> {
    request_id: &'a str,
    sink: &'a EventSink,
    cancel: &'a CancellationToken,
}

impl<'a> RequestEvents<'a> {
    pub fn new(request_id: &'a str, sink: &'a EventSink, cancel: &'a CancellationToken) -> Self {
        Self {
            request_id,
            sink,
            cancel,
        }
    }

    pub fn request_id(&self) -> &'a str {
        self.request_id
    }

    pub fn cancel(&self) -> &'a CancellationToken {
        self.cancel
    }

    pub fn emit(&self, kind: ChatEventKind) {
        if self.cancel.is_cancelled() {
            debug!(request_id = self.request_id, ?kind, "Suppressing event after abort");
            return;
        }
        self.deliver(kind);
    }

    pub fn terminal(&self, kind: ChatEventKind) {
        self.deliver(kind);
    }

    fn deliver(&self, kind: ChatEventKind) {
        if !self.sink.send(ChatEvent::new(self.request_id, kind)) {
            debug!(request_id = self.request_id, "Panel disconnected; dropping event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn emit_is_suppressed_after_cancel_but_terminal_is_not() {
        let (sink, mut rx) = EventSink::channel();
        let cancel = CancellationToken::new();
        let events = RequestEvents::new("tab", &sink, &cancel);

        events.emit(ChatEventKind::Cloning { in_progress: true });
        cancel.cancel();
        events.emit(ChatEventKind::Cloning { in_progress: false });
        events.terminal(ChatEventKind::Aborted);

        let mut received = Vec::new();
        while let Ok(message) = rx.try_recv() {
            received.push(message);
        }
        assert_eq!(
            received,
            vec![
                ServerMessage::from(ChatEvent::new(
                    "tab",
                    ChatEventKind::Cloning { in_progress: true }
                )),
                ServerMessage::from(ChatEvent::new("tab", ChatEventKind::Aborted)),
            ]
        );
    }

    #[test]
    fn send_reports_closed_panel_without_panicking() {
        let (sink, rx) = EventSink::channel();
        drop(rx);
        assert!(!sink.send(ChatEvent::new("tab", ChatEventKind::Aborted)));
    }
}
