use tokio::sync::mpsc;

use crate::event::Failure;
use crate::model::{ImageMap, PartialDocument};

/// Receives the increments of one session, in arrival order, on the
/// session's task. All methods default to no-ops.
///
/// After `on_complete` or `on_error`, or after the session is cancelled,
/// nothing else is called.
pub trait SessionObserver: Send + 'static {
    fn on_init(&mut self, _document_id: Option<&str>) {}

    /// A full document snapshot, together with the images known so far.
    fn on_document(&mut self, _document: &PartialDocument, _images: &ImageMap) {}

    /// The image map changed. `document` is `None` when an image arrives
    /// before the first snapshot.
    fn on_images(&mut self, _document: Option<&PartialDocument>, _images: &ImageMap) {}

    fn on_status(&mut self, _message: &str) {}

    fn on_complete(&mut self, _message: &str) {}

    fn on_error(&mut self, _failure: &Failure) {}
}

/// One observer callback as a value.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionUpdate {
    Init { document_id: Option<String> },
    Document { document: PartialDocument, images: ImageMap },
    Images { document: Option<PartialDocument>, images: ImageMap },
    Status(String),
    Complete(String),
    Error(Failure),
}

impl SessionUpdate {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete(_) | Self::Error(_))
    }
}

/// Publishes every callback as a `SessionUpdate` on an unbounded channel.
/// A dropped receiver is ignored; the session keeps running.
#[derive(Debug, Clone)]
pub struct ChannelObserver {
    tx: mpsc::UnboundedSender<SessionUpdate>,
}

impl ChannelObserver {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SessionUpdate>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn send(&self, update: SessionUpdate) {
        if self.tx.send(update).is_err() {
            tracing::trace!("session update receiver dropped");
        }
    }
}

impl SessionObserver for ChannelObserver {
    fn on_init(&mut self, document_id: Option<&str>) {
        self.send(SessionUpdate::Init {
            document_id: document_id.map(str::to_string),
        });
    }

    fn on_document(&mut self, document: &PartialDocument, images: &ImageMap) {
        self.send(SessionUpdate::Document {
            document: document.clone(),
            images: images.clone(),
        });
    }

    fn on_images(&mut self, document: Option<&PartialDocument>, images: &ImageMap) {
        self.send(SessionUpdate::Images {
            document: document.cloned(),
            images: images.clone(),
        });
    }

    fn on_status(&mut self, message: &str) {
        self.send(SessionUpdate::Status(message.to_string()));
    }

    fn on_complete(&mut self, message: &str) {
        self.send(SessionUpdate::Complete(message.to_string()));
    }

    fn on_error(&mut self, failure: &Failure) {
        self.send(SessionUpdate::Error(failure.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_observer_forwards_in_order() {
        let (mut obs, mut rx) = ChannelObserver::new();
        obs.on_status("Generating lesson structure...");
        obs.on_images(None, &ImageMap::new().with_image("slide_0", "data:x"));
        obs.on_complete("done");

        assert_eq!(rx.try_recv().unwrap(), SessionUpdate::Status("Generating lesson structure...".into()));
        match rx.try_recv().unwrap() {
            SessionUpdate::Images { document: None, images } => assert_eq!(images.get("slide_0"), Some("data:x")),
            other => panic!("unexpected {other:?}"),
        }
        let last = rx.try_recv().unwrap();
        assert!(last.is_terminal());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn dropped_receiver_does_not_panic() {
        let (mut obs, rx) = ChannelObserver::new();
        drop(rx);
        obs.on_status("still fine");
    }
}
