use std::error::Error;

use crate::api::{ConversationFilter, ConversationListResponse, ConversationStatus};
use crate::cli::context::CliContext;
use crate::core::message::Message;

pub async fn list_conversations(
    status: Option<ConversationStatus>,
    search: Option<String>,
) -> Result<(), Box<dyn Error>> {
    let context = CliContext::load()?;
    let session = context.session().await?;
    let filter = ConversationFilter {
        status,
        search: search.filter(|s| !s.trim().is_empty()),
        ..ConversationFilter::default()
    };
    let list = session.list_conversations(&filter).await?;
    print!("{}", format_conversation_list(&list));
    Ok(())
}

pub fn format_conversation_list(list: &ConversationListResponse) -> String {
    if list.conversations.is_empty() {
        return "No conversations found.\n".to_string();
    }

    let id_width = list
        .conversations
        .iter()
        .map(|c| c.conversation_id.len())
        .max()
        .unwrap_or(0)
        .max("ID".len());

    let mut out = format!(
        "{:<id_width$}  {:<8}  {:>5}  {:<16}  TITLE\n",
        "ID", "STATUS", "TURNS", "LAST ACTIVITY"
    );
    for conversation in &list.conversations {
        out.push_str(&format!(
            "{:<id_width$}  {:<8}  {:>5}  {:<16}  {}\n",
            conversation.conversation_id,
            conversation.status.as_str(),
            conversation.total_turns,
            conversation.last_activity.format("%Y-%m-%d %H:%M"),
            conversation.title,
        ));
    }
    if list.has_more {
        out.push_str(&format!(
            "Showing {} of {} conversations.\n",
            list.conversations.len(),
            list.total_count
        ));
    }
    out
}

/// One block per message: a header line, then the content.
pub fn format_transcript(messages: &[Message]) -> String {
    let mut out = String::new();
    for message in messages {
        let who = if message.is_user() { "You" } else { "Assistant" };
        out.push_str(&format!(
            "[{}] {} ({})\n{}\n\n",
            message.timestamp.format("%Y-%m-%d %H:%M"),
            who,
            message.id,
            message.content.trim_end()
        ));
    }
    out
}
