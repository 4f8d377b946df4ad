//! Command-line interface parsing and handling
//!
//! Every subcommand except `set` and `unset` talks to the backends through a
//! [`context::CliContext`].

pub mod chat;
pub mod context;
pub mod conversation_list;

use std::error::Error;
use std::io::{self, BufRead, Write};

use clap::{Parser, Subcommand};

use crate::api::{ConversationStatus, CreateConversationRequest};
use crate::cli::chat::run_chat;
use crate::cli::context::CliContext;
use crate::cli::conversation_list::{format_transcript, list_conversations};
use crate::core::config::keys::CONFIG_KEYS;
use crate::core::config::Config;
use crate::utils::logging;

const VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (",
    env!("VERGEN_GIT_DESCRIBE"),
    ", built ",
    env!("VERGEN_BUILD_DATE"),
    ")"
);

#[derive(Parser)]
#[command(name = "syntra")]
#[command(version = VERSION)]
#[command(about = "Terminal client for the Syntra enterprise chat backend")]
#[command(
    long_about = "Syntra talks to the Syntra chat and authentication services. Replies stream in \
as they are generated and the conversation is reloaded from the server once each reply is stored.\n\n\
Environment Variables:\n\
  SYNTRA_CHAT_API_URL   Chat service base URL (overrides config)\n\
  SYNTRA_AUTH_API_URL   Authentication service base URL (overrides config)\n\
  SYNTRA_CHAT_API_KEY   API key sent with chat requests (overrides config)\n\
  SYNTRA_LOG            Log filter, e.g. syntra=debug\n\n\
Run `syntra chat` for an interactive session; type /help inside it for commands."
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Log debug output to stderr
    #[arg(short = 'v', long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Sign in and store the session token in the system keyring
    Login {
        /// Account email address
        email: String,
    },
    /// Sign out and forget the stored session token
    Logout,
    /// Show the signed-in user
    Whoami,
    /// List conversations
    Conversations {
        /// Only show conversations with this status (active, archived, deleted)
        #[arg(long)]
        status: Option<ConversationStatus>,
        /// Only show conversations whose title matches
        #[arg(long)]
        search: Option<String>,
    },
    /// Create a conversation
    New {
        /// Conversation title
        title: String,
        /// Knowledge collections to search (repeatable)
        #[arg(long = "collection")]
        collections: Vec<String>,
        /// Assistant personality
        #[arg(long)]
        personality: Option<String>,
        /// Assistant role
        #[arg(long)]
        role: Option<String>,
    },
    /// Print a conversation's messages
    History {
        /// Conversation id
        id: String,
    },
    /// Rename a conversation
    Rename {
        /// Conversation id
        id: String,
        /// New title
        #[arg(trailing_var_arg = true, required = true)]
        title: Vec<String>,
    },
    /// Archive a conversation
    Archive {
        /// Conversation id
        id: String,
    },
    /// Delete a conversation
    Delete {
        /// Conversation id
        id: String,
    },
    /// Start an interactive chat (default); opens a new conversation without an id
    Chat {
        /// Conversation id to continue
        id: Option<String>,
    },
    /// Set configuration values, or print them when no value is given
    Set {
        /// Configuration key to set
        key: Option<String>,
        /// Value to set for the key
        value: Option<String>,
    },
    /// Unset configuration values
    Unset {
        /// Configuration key to unset
        key: String,
    },
}

pub fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();
    logging::init(args.verbose);

    tokio::runtime::Runtime::new()?.block_on(async_main(args))
}

async fn async_main(args: Args) -> Result<(), Box<dyn Error>> {
    match args.command.unwrap_or(Commands::Chat { id: None }) {
        Commands::Login { email } => login(&email).await,
        Commands::Logout => {
            let context = CliContext::load()?;
            let remote = context.auth.logout().await;
            context.tokens.clear_user()?;
            match remote {
                Ok(()) => println!("✅ Signed out"),
                Err(err) => eprintln!("⚠️  Signed out locally; the server call failed: {err}"),
            }
            Ok(())
        }
        Commands::Whoami => {
            let context = CliContext::load()?;
            let user = context.current_user().await?;
            if user.full_name.is_empty() {
                println!("{} ({})", user.email, user.id);
            } else {
                println!("{} <{}> ({})", user.full_name, user.email, user.id);
            }
            Ok(())
        }
        Commands::Conversations { status, search } => list_conversations(status, search).await,
        Commands::New {
            title,
            collections,
            personality,
            role,
        } => {
            let context = CliContext::load()?;
            let mut session = context.session().await?;
            let created = session
                .create_conversation(CreateConversationRequest {
                    title,
                    collection_names: collections,
                    personality_type: personality,
                    role_type: role,
                    ..CreateConversationRequest::default()
                })
                .await?;
            session.shutdown();
            println!("✅ Created conversation {} ({})", created.conversation_id, created.title);
            Ok(())
        }
        Commands::History { id } => {
            let context = CliContext::load()?;
            let session = context.session().await?;
            let messages = session.cache().get_history(&id).await?;
            if messages.is_empty() {
                println!("No messages yet.");
            } else {
                print!("{}", format_transcript(&messages));
            }
            Ok(())
        }
        Commands::Rename { id, title } => {
            let context = CliContext::load()?;
            let mut session = context.session().await?;
            let title = title.join(" ");
            session.rename_conversation(&id, &title).await?;
            println!("✅ Renamed {id} to: {}", title.trim());
            Ok(())
        }
        Commands::Archive { id } => {
            let context = CliContext::load()?;
            let mut session = context.session().await?;
            session
                .set_conversation_status(&id, ConversationStatus::Archived)
                .await?;
            println!("✅ Archived {id}");
            Ok(())
        }
        Commands::Delete { id } => {
            let context = CliContext::load()?;
            let mut session = context.session().await?;
            session.delete_conversation(&id).await?;
            println!("✅ Deleted {id}");
            Ok(())
        }
        Commands::Chat { id } => run_chat(id).await,
        Commands::Set { key, value } => {
            let mut config = Config::load()?;
            match (key, value) {
                (Some(key), Some(value)) => {
                    config.set_value(&key, &value)?;
                    config.save()?;
                    println!("✅ Set {key}");
                }
                (Some(key), None) => {
                    eprintln!("⚠️  Missing value for {key}. Known keys: {}", CONFIG_KEYS.join(", "));
                    config.print_all();
                }
                (None, _) => config.print_all(),
            }
            Ok(())
        }
        Commands::Unset { key } => {
            let mut config = Config::load()?;
            config.unset_value(&key)?;
            config.save()?;
            println!("✅ Unset {key}");
            Ok(())
        }
    }
}

async fn login(email: &str) -> Result<(), Box<dyn Error>> {
    let context = CliContext::load()?;

    print!("Password for {email}: ");
    io::stdout().flush()?;
    let mut password = String::new();
    io::stdin().lock().read_line(&mut password)?;
    let password = password.trim_end_matches(['\r', '\n']);
    if password.is_empty() {
        return Err("No password entered".into());
    }

    let session = context.auth.login(email, password).await?;
    context.tokens.store_user(&session.user)?;
    println!(
        "✅ Signed in as {} (session valid until {})",
        session.user.email,
        session.expires_at.format("%Y-%m-%d %H:%M UTC")
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_is_the_default_command() {
        let args = Args::try_parse_from(["syntra"]).unwrap();
        assert!(args.command.is_none());
        assert!(!args.verbose);
    }

    #[test]
    fn verbose_is_accepted_after_subcommands() {
        let args = Args::try_parse_from(["syntra", "conversations", "--status", "archived", "-v"])
            .unwrap();
        assert!(args.verbose);
        match args.command {
            Some(Commands::Conversations { status, search }) => {
                assert_eq!(status, Some(ConversationStatus::Archived));
                assert!(search.is_none());
            }
            _ => panic!("expected conversations command"),
        }
    }

    #[test]
    fn rename_collects_multi_word_titles() {
        let args = Args::try_parse_from(["syntra", "rename", "c-1", "Q1", "budget", "review"])
            .unwrap();
        match args.command {
            Some(Commands::Rename { id, title }) => {
                assert_eq!(id, "c-1");
                assert_eq!(title.join(" "), "Q1 budget review");
            }
            _ => panic!("expected rename command"),
        }
    }

    #[test]
    fn new_accepts_repeated_collections() {
        let args = Args::try_parse_from([
            "syntra",
            "new",
            "Planning",
            "--collection",
            "finance",
            "--collection",
            "hr",
        ])
        .unwrap();
        match args.command {
            Some(Commands::New { collections, .. }) => {
                assert_eq!(collections, vec!["finance".to_string(), "hr".to_string()]);
            }
            _ => panic!("expected new command"),
        }
    }

    #[test]
    fn invalid_status_is_rejected() {
        assert!(Args::try_parse_from(["syntra", "conversations", "--status", "pinned"]).is_err());
    }
}
