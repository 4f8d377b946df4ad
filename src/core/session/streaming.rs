use std::collections::HashMap;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::SessionEvent;
use crate::core::chat_stream::ChunkStream;

#[derive(Debug)]
struct StreamHandle {
    conversation_id: String,
    cancel_token: CancellationToken,
}

/// Tracks the stream feeding the visible conversation plus streams left
/// running after the user switched away.
#[derive(Debug, Default)]
pub(super) struct StreamRegistry {
    current: Option<(u64, StreamHandle)>,
    detached: HashMap<u64, StreamHandle>,
    last_id: u64,
}

impl StreamRegistry {
    /// Cancel the current stream, and any background stream still writing
    /// to `conversation_id`, then allocate a new id.
    pub fn start_new_stream(&mut self, conversation_id: &str) -> (CancellationToken, u64) {
        self.cancel_current_stream();
        self.detached.retain(|id, handle| {
            if handle.conversation_id != conversation_id {
                return true;
            }
            debug!(stream_id = *id, %conversation_id, "cancelling background stream");
            handle.cancel_token.cancel();
            false
        });
        self.last_id += 1;
        let token = CancellationToken::new();
        self.current = Some((
            self.last_id,
            StreamHandle {
                conversation_id: conversation_id.to_string(),
                cancel_token: token.clone(),
            },
        ));
        (token, self.last_id)
    }

    pub fn cancel_current_stream(&mut self) -> bool {
        match self.current.take() {
            Some((id, handle)) => {
                debug!(stream_id = id, conversation_id = %handle.conversation_id, "cancelling stream");
                handle.cancel_token.cancel();
                true
            }
            None => false,
        }
    }

    /// Keep the current stream running in the background.
    pub fn detach_current(&mut self) {
        if let Some((id, handle)) = self.current.take() {
            debug!(stream_id = id, conversation_id = %handle.conversation_id, "detaching stream");
            self.detached.insert(id, handle);
        }
    }

    pub fn is_current_stream(&self, stream_id: u64) -> bool {
        self.current.as_ref().is_some_and(|(id, _)| *id == stream_id)
    }

    /// Forget the current stream once it has delivered its terminal event.
    pub fn finish_current(&mut self, stream_id: u64) {
        if self.is_current_stream(stream_id) {
            self.current = None;
        }
    }

    /// Forget a detached stream, returning the conversation it belonged to.
    pub fn finish_detached(&mut self, stream_id: u64) -> Option<String> {
        self.detached
            .remove(&stream_id)
            .map(|handle| handle.conversation_id)
    }

    pub fn cancel_all(&mut self) {
        self.cancel_current_stream();
        for (_, handle) in self.detached.drain() {
            handle.cancel_token.cancel();
        }
    }
}

/// Number each chunk from `stream` and post it to the controller until a
/// terminal chunk arrives or the stream is cancelled.
pub(super) fn forward_chunks(
    stream_id: u64,
    mut stream: ChunkStream,
    cancel_token: CancellationToken,
    events: mpsc::UnboundedSender<SessionEvent>,
) {
    tokio::spawn(async move {
        let mut seq = 0;
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel_token.cancelled() => break,
                next = stream.next() => next,
            };
            let Some(chunk) = next else {
                break;
            };
            seq += 1;
            let terminal = chunk.is_terminal();
            if events
                .send(SessionEvent::Stream {
                    stream_id,
                    seq,
                    chunk,
                })
                .is_err()
                || terminal
            {
                break;
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_stream_cancels_the_previous_one() {
        let mut registry = StreamRegistry::default();
        let (first, first_id) = registry.start_new_stream("c-1");
        let (second, second_id) = registry.start_new_stream("c-1");

        assert!(first.is_cancelled());
        assert!(!second.is_cancelled());
        assert!(!registry.is_current_stream(first_id));
        assert!(registry.is_current_stream(second_id));
    }

    #[test]
    fn detached_streams_keep_running_until_finished() {
        let mut registry = StreamRegistry::default();
        let (token, id) = registry.start_new_stream("c-1");
        registry.detach_current();

        assert!(!token.is_cancelled());
        assert!(!registry.is_current_stream(id));
        assert_eq!(registry.finish_detached(id).as_deref(), Some("c-1"));
        assert_eq!(registry.finish_detached(id), None);
    }

    #[test]
    fn new_stream_cancels_background_streams_of_the_same_conversation() {
        let mut registry = StreamRegistry::default();
        let (same, same_id) = registry.start_new_stream("c-1");
        registry.detach_current();
        let (other, other_id) = registry.start_new_stream("c-2");
        registry.detach_current();

        let (fresh, _) = registry.start_new_stream("c-1");
        assert!(same.is_cancelled());
        assert!(!other.is_cancelled());
        assert!(!fresh.is_cancelled());
        assert_eq!(registry.finish_detached(same_id), None);
        assert_eq!(registry.finish_detached(other_id).as_deref(), Some("c-2"));
    }

    #[test]
    fn cancel_all_reaches_detached_streams() {
        let mut registry = StreamRegistry::default();
        let (detached, _) = registry.start_new_stream("c-1");
        registry.detach_current();
        let (current, _) = registry.start_new_stream("c-2");

        registry.cancel_all();
        assert!(detached.is_cancelled());
        assert!(current.is_cancelled());
    }
}
