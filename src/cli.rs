use std::path::PathBuf;

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;

use crate::{config::Overrides, session_store::DEFAULT_SESSION};

#[derive(Debug, Parser)]
#[command(
    name = "coursedex",
    version,
    about = "Chunk, index and chat with a course module's study material"
)]
pub struct Cli {
    /// Override the XDG data directory
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Embedding provider: openai, local or hash
    #[arg(long, global = true)]
    pub provider: Option<String>,

    /// Embedding model ID or local model path
    #[arg(long, global = true)]
    pub model: Option<String>,

    /// Increase log verbosity (can be repeated: -v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Only log warnings and errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    /// Settings given on the command line, keyed like stored settings.
    pub fn overrides(&self) -> Overrides {
        let mut overrides = Overrides::new();
        if let Some(provider) = &self.provider {
            overrides.insert("embedding_provider", provider.clone());
        }
        if let Some(model) = &self.model {
            overrides.insert("embedding_model", model.clone());
        }
        match &self.command {
            Command::Preprocess(args) => args.chunking.apply(&mut overrides),
            Command::Build(args) => args.chunking.apply(&mut overrides),
            Command::Index(args) => args.chunking.apply(&mut overrides),
            Command::Ask(args) => args.chat.apply(&mut overrides),
            Command::Chat(args) => args.chat.apply(&mut overrides),
            _ => {}
        }
        overrides
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Chunk an OCR text dump and save the chunk checkpoint
    Preprocess(PreprocessArgs),
    /// Embed the checkpointed chunks and write the index
    Index(IndexArgs),
    /// Preprocess and index in one run
    Build(PreprocessArgs),
    /// Find the chunks closest to a query
    Search(SearchArgs),
    /// Ask the tutor a single question
    Ask(AskArgs),
    /// Chat with the tutor interactively
    Chat(ChatArgs),
    /// List checkpointed chunks
    Chunks(ChunksArgs),
    /// Manage saved chat sessions
    Session {
        #[command(subcommand)]
        action: SessionAction,
    },
    /// Show checkpoint and index status
    Status(StatusArgs),
    /// Show or change stored settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Start MCP server for AI agent integration
    Mcp,
    /// Generate shell completions
    #[command(hide = true)]
    Completions(CompletionsArgs),
}

// -- Chunking --

#[derive(Debug, Clone, Default, clap::Args)]
pub struct ChunkingArgs {
    /// Words per chunk
    #[arg(long)]
    pub window: Option<usize>,

    /// Words shared by adjacent chunks
    #[arg(long)]
    pub overlap: Option<usize>,
}

impl ChunkingArgs {
    fn apply(&self, overrides: &mut Overrides) {
        if let Some(window) = self.window {
            overrides.insert("chunk_window", window.to_string());
        }
        if let Some(overlap) = self.overlap {
            overrides.insert("chunk_overlap", overlap.to_string());
        }
    }
}

#[derive(Debug, Parser)]
pub struct PreprocessArgs {
    /// OCR text file of the course material
    pub source: PathBuf,

    #[command(flatten)]
    pub chunking: ChunkingArgs,

    /// Number of chunks to preview after chunking
    #[arg(long, default_value = "3")]
    pub preview: usize,
}

#[derive(Debug, Parser)]
pub struct IndexArgs {
    /// Rebuild the checkpoint from this OCR text file if it is missing or
    /// unreadable
    #[arg(long)]
    pub source: Option<PathBuf>,

    #[command(flatten)]
    pub chunking: ChunkingArgs,
}

// -- Search --

#[derive(Debug, Parser)]
pub struct SearchArgs {
    /// The search query
    pub query: String,

    /// Number of results to return
    #[arg(short = 'n', long, default_value = "5")]
    pub count: usize,

    /// Plain nearest-neighbour order instead of MMR
    #[arg(long)]
    pub similarity: bool,

    /// Output results as JSON
    #[arg(long)]
    pub json: bool,
}

// -- Ask / Chat --

#[derive(Debug, Clone, Default, clap::Args)]
pub struct ChatOptions {
    /// Chat completion model
    #[arg(long)]
    pub chat_model: Option<String>,

    /// Chunks of context per question
    #[arg(short = 'k', long)]
    pub k: Option<usize>,
}

impl ChatOptions {
    fn apply(&self, overrides: &mut Overrides) {
        if let Some(model) = &self.chat_model {
            overrides.insert("chat_model", model.clone());
        }
        if let Some(k) = self.k {
            overrides.insert("retrieval_k", k.to_string());
        }
    }
}

#[derive(Debug, Parser)]
pub struct AskArgs {
    /// The question
    pub question: String,

    /// Session whose history to use and extend
    #[arg(short, long, default_value = DEFAULT_SESSION)]
    pub session: String,

    #[command(flatten)]
    pub chat: ChatOptions,

    /// Output the answer and its sources as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Parser)]
pub struct ChatArgs {
    /// Session whose history to use and extend
    #[arg(short, long, default_value = DEFAULT_SESSION)]
    pub session: String,

    #[command(flatten)]
    pub chat: ChatOptions,
}

// -- Chunks --

#[derive(Debug, Parser)]
pub struct ChunksArgs {
    /// Glob applied to section labels (e.g. "Chapter 7*")
    #[arg(short, long)]
    pub section: Option<String>,

    /// Maximum number of chunks to list
    #[arg(short = 'n', long)]
    pub count: Option<usize>,

    /// Output as JSON array
    #[arg(long)]
    pub json: bool,
}

// -- Sessions --

#[derive(Debug, Subcommand)]
pub enum SessionAction {
    /// List saved sessions
    List,
    /// Print a session's history
    Show {
        #[arg(default_value = DEFAULT_SESSION)]
        id: String,
    },
    /// Forget a session's history
    Clear {
        #[arg(default_value = DEFAULT_SESSION)]
        id: String,
    },
}

// -- Status --

#[derive(Debug, Parser)]
pub struct StatusArgs {
    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

// -- Config --

#[derive(Debug, Subcommand)]
pub enum ConfigAction {
    /// Show every setting with its resolved value
    Show {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Persist a setting in config.redb
    Set { key: String, value: String },
    /// Remove a stored setting (revert to default)
    Clear { key: String },
}

// -- Completions --

#[derive(Debug, Parser)]
pub struct CompletionsArgs {
    /// Shell to generate completions for
    #[arg(value_enum)]
    pub shell: Shell,
}

impl CompletionsArgs {
    /// Generate shell completions and print to stdout.
    pub fn generate(&self) {
        let mut cmd = Cli::command();
        clap_complete::generate(
            self.shell,
            &mut cmd,
            "coursedex",
            &mut std::io::stdout(),
        );
    }
}
