//! Merges confirmed history with optimistic messages into the list the
//! front end renders.

use std::collections::HashSet;

use super::message::Message;

#[derive(Debug, Clone, PartialEq)]
pub struct Reconciliation {
    pub messages: Vec<Message>,
    /// Every optimistic message now has a confirmed counterpart and the
    /// overlay can be dropped.
    pub overlay_subsumed: bool,
}

/// Sort by timestamp, user before assistant on ties, otherwise stable.
pub fn sort_messages(messages: &mut [Message]) {
    messages.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.role.cmp(&b.role)));
}

pub fn reconcile(server: &[Message], overlay: &[Message], is_streaming: bool) -> Reconciliation {
    reconcile_since(server, &HashSet::new(), overlay, is_streaming)
}

/// Like [`reconcile`], but server messages whose ids are in `baseline_ids`
/// were already confirmed before the send started and never retire overlay
/// entries.
pub fn reconcile_since(
    server: &[Message],
    baseline_ids: &HashSet<String>,
    overlay: &[Message],
    is_streaming: bool,
) -> Reconciliation {
    let mut seen = HashSet::with_capacity(server.len());
    let mut messages: Vec<Message> = server
        .iter()
        .filter(|message| seen.insert(message.id.as_str()))
        .cloned()
        .collect();

    if overlay.is_empty() {
        sort_messages(&mut messages);
        return Reconciliation {
            messages,
            overlay_subsumed: false,
        };
    }

    if is_streaming {
        messages.extend(overlay.iter().cloned());
        sort_messages(&mut messages);
        return Reconciliation {
            messages,
            overlay_subsumed: false,
        };
    }

    // Each confirmed message may retire at most one optimistic entry.
    let mut claimed: HashSet<&str> = HashSet::new();
    let mut pending = Vec::new();
    for optimistic in overlay {
        let matched = messages.iter().find(|confirmed| {
            !baseline_ids.contains(&confirmed.id)
                && !claimed.contains(confirmed.id.as_str())
                && confirmed.same_content(optimistic)
        });
        match matched {
            Some(confirmed) => {
                claimed.insert(confirmed.id.as_str());
            }
            None => pending.push(optimistic.clone()),
        }
    }

    let overlay_subsumed = pending.is_empty();
    messages.extend(pending);
    sort_messages(&mut messages);
    Reconciliation {
        messages,
        overlay_subsumed,
    }
}
