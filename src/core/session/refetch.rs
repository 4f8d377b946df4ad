use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::SessionEvent;

/// A delayed history reload that can be called off.
///
/// Dropping the handle cancels the timer, so replacing the controller's
/// pending refetch never leaves an orphaned one behind.
#[derive(Debug)]
pub struct ScheduledRefetch {
    id: u64,
    conversation_id: String,
    cancel_token: CancellationToken,
}

impl ScheduledRefetch {
    pub fn schedule(
        id: u64,
        conversation_id: impl Into<String>,
        delay: Duration,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Self {
        let conversation_id = conversation_id.into();
        let cancel_token = CancellationToken::new();
        let token = cancel_token.clone();
        let target = conversation_id.clone();

        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    let _ = events.send(SessionEvent::RefetchDue {
                        conversation_id: target,
                        refetch_id: id,
                    });
                }
            }
        });

        Self {
            id,
            conversation_id,
            cancel_token,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }
}

impl Drop for ScheduledRefetch {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fires_after_delay() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let refetch = ScheduledRefetch::schedule(7, "c-1", Duration::from_millis(5), tx);

        match rx.recv().await {
            Some(SessionEvent::RefetchDue {
                conversation_id,
                refetch_id,
            }) => {
                assert_eq!(conversation_id, "c-1");
                assert_eq!(refetch_id, refetch.id());
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn dropping_the_handle_cancels_the_timer() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let refetch = ScheduledRefetch::schedule(1, "c-1", Duration::from_millis(20), tx);
        drop(refetch);

        let waited = tokio::time::timeout(Duration::from_millis(80), rx.recv()).await;
        assert!(matches!(waited, Ok(None)));
    }
}
