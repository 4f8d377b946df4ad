//! Line-oriented interactive chat.

use std::error::Error;
use std::io::{self, Write};

use tokio::io::{AsyncBufReadExt, BufReader};

use crate::api::CreateConversationRequest;
use crate::cli::context::CliContext;
use crate::cli::conversation_list::format_transcript;
use crate::core::session::{SessionChange, SessionController, SessionError};

const HELP: &str = "\
Type a message and press Enter to send it.
  /stop                 Stop the reply that is streaming
  /switch <id>          Open another conversation
  /refresh              Reload the conversation from the server
  /history              Print the conversation again
  /edit <msg-id> <text> Replace one of your messages
  /regen <msg-id>       Ask for a new reply
  /search <text>        Show messages containing text
  /help                 Show this help
  /quit                 Leave";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplCommand {
    Empty,
    Send(String),
    Stop,
    Switch(String),
    Refresh,
    History,
    Edit { message_id: String, text: String },
    Regenerate(String),
    Search(String),
    Help,
    Quit,
    /// A slash command that is unknown or missing its arguments.
    Invalid(String),
}

pub fn parse_command(line: &str) -> ReplCommand {
    let line = line.trim();
    if line.is_empty() {
        return ReplCommand::Empty;
    }
    let Some(command) = line.strip_prefix('/') else {
        return ReplCommand::Send(line.to_string());
    };

    let (name, rest) = match command.split_once(char::is_whitespace) {
        Some((name, rest)) => (name, rest.trim()),
        None => (command, ""),
    };
    let invalid = || ReplCommand::Invalid(line.to_string());

    match name {
        "stop" => ReplCommand::Stop,
        "refresh" => ReplCommand::Refresh,
        "history" => ReplCommand::History,
        "help" => ReplCommand::Help,
        "quit" | "exit" => ReplCommand::Quit,
        "switch" if !rest.is_empty() => ReplCommand::Switch(rest.to_string()),
        "regen" if !rest.is_empty() => ReplCommand::Regenerate(rest.to_string()),
        "search" if !rest.is_empty() => ReplCommand::Search(rest.to_string()),
        "edit" => match rest.split_once(char::is_whitespace) {
            Some((message_id, text)) if !text.trim().is_empty() => ReplCommand::Edit {
                message_id: message_id.to_string(),
                text: text.trim().to_string(),
            },
            _ => invalid(),
        },
        _ => invalid(),
    }
}

pub async fn run_chat(conversation_id: Option<String>) -> Result<(), Box<dyn Error>> {
    let context = CliContext::load()?;
    let mut session = context.session().await?;

    match conversation_id {
        Some(id) => session.select_conversation(&id),
        None => {
            let created = session
                .create_conversation(CreateConversationRequest {
                    title: "New conversation".to_string(),
                    ..CreateConversationRequest::default()
                })
                .await?;
            println!("Started conversation {}", created.conversation_id);
        }
    }
    println!("{HELP}\n");

    let result = repl(&mut session).await;
    session.shutdown();
    result
}

async fn repl(session: &mut SessionController) -> Result<(), Box<dyn Error>> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut transcript_shown = false;

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    break;
                };
                match parse_command(&line) {
                    ReplCommand::Empty => {}
                    ReplCommand::Send(text) => {
                        if session.send_message(&text) {
                            print!("Assistant: ");
                            io::stdout().flush()?;
                        }
                    }
                    ReplCommand::Stop => {
                        if session.stop_stream() {
                            println!("\n(stopped)");
                        }
                    }
                    ReplCommand::Switch(id) => {
                        session.select_conversation(&id);
                        transcript_shown = false;
                    }
                    ReplCommand::Refresh => {
                        session.refresh();
                        transcript_shown = false;
                    }
                    ReplCommand::History => {
                        print!("{}", format_transcript(&session.view().messages));
                    }
                    ReplCommand::Edit { message_id, text } => {
                        report(session.edit_message(&message_id, &text).await)?;
                        transcript_shown = false;
                    }
                    ReplCommand::Regenerate(message_id) => {
                        report(session.regenerate_message(&message_id).await)?;
                        transcript_shown = false;
                    }
                    ReplCommand::Search(query) => {
                        let hits = session.search_messages(&query);
                        if hits.is_empty() {
                            println!("No messages match {query:?}.");
                        } else {
                            print!("{}", format_transcript(&hits));
                        }
                    }
                    ReplCommand::Help => println!("{HELP}"),
                    ReplCommand::Quit => break,
                    ReplCommand::Invalid(input) => {
                        eprintln!("Unrecognized command: {input} (try /help)");
                    }
                }
            }
            Some(event) = session.next_event() => {
                match session.handle_event(event) {
                    SessionChange::Chunk(text) => {
                        print!("{text}");
                        io::stdout().flush()?;
                    }
                    SessionChange::StreamDone => println!(),
                    SessionChange::StreamFailed(err) | SessionChange::HistoryFailed(err) => {
                        report(Err(err))?;
                    }
                    SessionChange::HistoryUpdated | SessionChange::Settled if !transcript_shown => {
                        let view = session.view();
                        if !view.is_streaming {
                            print!("{}", format_transcript(&view.messages));
                            transcript_shown = true;
                        }
                    }
                    _ => {}
                }
            }
        }
    }
    Ok(())
}

// Print recoverable errors and keep going; a lost session ends the chat.
fn report(result: Result<(), SessionError>) -> Result<(), Box<dyn Error>> {
    match result {
        Ok(()) => Ok(()),
        Err(err) if err.requires_login() => Err(err.into()),
        Err(err) => {
            eprintln!("\n❌ {err}");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_lines_are_sent() {
        assert_eq!(
            parse_command("  What is the Q1 budget? "),
            ReplCommand::Send("What is the Q1 budget?".to_string())
        );
        assert_eq!(parse_command("   "), ReplCommand::Empty);
    }

    #[test]
    fn slash_commands_take_arguments() {
        assert_eq!(parse_command("/stop"), ReplCommand::Stop);
        assert_eq!(
            parse_command("/switch c-42"),
            ReplCommand::Switch("c-42".to_string())
        );
        assert_eq!(
            parse_command("/edit t-1-user  Make it shorter "),
            ReplCommand::Edit {
                message_id: "t-1-user".to_string(),
                text: "Make it shorter".to_string()
            }
        );
        assert_eq!(
            parse_command("/regen t-1-assistant"),
            ReplCommand::Regenerate("t-1-assistant".to_string())
        );
        assert_eq!(
            parse_command("/search budget"),
            ReplCommand::Search("budget".to_string())
        );
    }

    #[test]
    fn incomplete_or_unknown_commands_are_invalid() {
        assert!(matches!(parse_command("/switch"), ReplCommand::Invalid(_)));
        assert!(matches!(parse_command("/edit t-1-user"), ReplCommand::Invalid(_)));
        assert!(matches!(parse_command("/theme dark"), ReplCommand::Invalid(_)));
    }
}
