use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

#[derive(Parser)]
#[command(name = "solace")]
#[command(about = "Offline-first wellness journal from the command line")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Path to the JSON config file
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Path to the local database file
    #[arg(long, global = true, value_name = "PATH")]
    pub db_path: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Sign in, inspect, or sign out of the hosted account
    Auth {
        #[command(subcommand)]
        command: AuthCommands,
    },
    /// Write a new journal entry
    #[command(alias = "new")]
    Add {
        /// Entry text
        content: Vec<String>,
        #[command(flatten)]
        ratings: Ratings,
        #[command(flatten)]
        lists: EntryLists,
    },
    /// Replace the text and ratings of an entry
    Edit {
        /// Entry ID or unique ID prefix
        id: String,
        /// New entry text (defaults to the current text)
        content: Vec<String>,
        #[command(flatten)]
        ratings: RatingOverrides,
    },
    /// Delete an entry
    Delete {
        /// Entry ID or unique ID prefix
        id: String,
    },
    /// List recent entries
    List {
        /// Skip the cache and ask the server
        #[arg(long)]
        refresh: bool,
        /// Number of entries to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Send queued writes now, ignoring backoff
    Sync,
    /// Inspect and manage queued and failed writes
    Queue {
        #[command(subcommand)]
        command: QueueCommands,
    },
    /// Generate shell completion scripts
    Completions {
        /// Target shell
        #[arg(value_enum)]
        shell: CompletionShell,
        /// Optional output path (stdout when omitted)
        #[arg(short, long, value_name = "PATH")]
        output: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
pub enum AuthCommands {
    /// Sign in with email and password
    Login {
        #[arg(long)]
        email: String,
        #[arg(long)]
        password: String,
    },
    /// Show who is signed in
    Status,
    /// Sign out and forget the stored session
    Logout,
}

#[derive(Subcommand)]
pub enum QueueCommands {
    /// Show pending and failed writes
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Move failed writes back into the queue and send them
    Retry,
    /// Drop a failed write
    Discard {
        /// Sequence number shown by `queue list`
        seq: u64,
    },
}

#[derive(Args, Clone, Copy, Debug, PartialEq, Eq)]
pub struct Ratings {
    /// Mood, 1-10
    #[arg(long)]
    pub mood: u8,
    /// Energy, 1-10
    #[arg(long)]
    pub energy: u8,
    /// Stress, 1-10
    #[arg(long)]
    pub stress: u8,
}

#[derive(Args, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RatingOverrides {
    #[arg(long)]
    pub mood: Option<u8>,
    #[arg(long)]
    pub energy: Option<u8>,
    #[arg(long)]
    pub stress: Option<u8>,
}

#[derive(Args, Clone, Debug, Default, PartialEq, Eq)]
pub struct EntryLists {
    /// Tag, repeatable
    #[arg(long = "tag", value_name = "TAG")]
    pub tags: Vec<String>,
    /// Challenge faced today, repeatable
    #[arg(long = "challenge", value_name = "TEXT")]
    pub challenges: Vec<String>,
    /// Something you are grateful for, repeatable
    #[arg(long = "gratitude", value_name = "TEXT")]
    pub gratitude: Vec<String>,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum CompletionShell {
    Bash,
    Zsh,
    Fish,
}
