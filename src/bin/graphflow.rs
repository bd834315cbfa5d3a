//! Command-line front end for the traversal compiler and write sessions.
#![forbid(unsafe_code)]

use std::fs;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};
use graphflow::{
    compiler::{schema::InMemorySchema, TraversalCompiler, TreeNode},
    config::FrontendConfig,
    logging,
    session::{self, SessionAllocator, WriteSession},
    Error, Result,
};
use serde::Serialize;

#[derive(Parser, Debug)]
#[command(
    name = "graphflow",
    version,
    about = "Compile graph traversals into dataflow plans",
    disable_help_subcommand = true
)]
struct Cli {
    #[arg(long, global = true, env = "GRAPHFLOW_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    #[arg(
        long,
        global = true,
        value_enum,
        default_value_t = OutputFormat::Text,
        help = "Output format for structured responses"
    )]
    format: OutputFormat,

    #[arg(long, global = true, help = "Log filter, overrides the config file")]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Compile a traversal tree given as JSON.
    Compile(CompileCmd),
    /// Encode, decode or issue write-session tokens.
    #[command(subcommand)]
    Session(SessionCmd),
    /// Inspect or create the config file.
    #[command(subcommand)]
    Config(ConfigCmd),
}

#[derive(Args, Debug)]
struct CompileCmd {
    #[arg(value_name = "TREE", help = "Traversal tree JSON file")]
    tree: PathBuf,

    #[arg(long, value_name = "FILE", help = "Schema JSON file")]
    schema: Option<PathBuf>,

    #[arg(long, help = "Disable the early-stop pass")]
    no_early_stop: bool,
}

#[derive(Subcommand, Debug)]
enum SessionCmd {
    /// Render a token from its parts.
    Encode {
        #[arg(long)]
        node: u32,
        #[arg(long)]
        seq: u64,
        #[arg(long)]
        timestamp: u64,
    },
    /// Print the client sequence number of a token.
    Decode {
        #[arg(value_name = "TOKEN")]
        token: String,
    },
    /// Issue a fresh token for the configured node.
    Issue {
        #[arg(long, default_value_t = 0, help = "First sequence number")]
        seq: u64,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigCmd {
    /// Print the effective configuration.
    Show,
    /// Write the effective configuration to the config path.
    Init,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

fn main() {
    if let Err(err) = run() {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    let mut config = FrontendConfig::load(cli.config.clone())?;
    let level = cli
        .log_level
        .clone()
        .unwrap_or_else(|| config.logging.level.clone());
    logging::init_logging(&level)?;

    match cli.command {
        Command::Compile(cmd) => {
            let tree: TreeNode = serde_json::from_str(&fs::read_to_string(&cmd.tree)?)?;
            let schema: InMemorySchema = match &cmd.schema {
                Some(path) => serde_json::from_str(&fs::read_to_string(path)?)?,
                None => InMemorySchema::new(),
            };
            if cmd.no_early_stop {
                config.compiler.enable_early_stop = false;
            }
            let compiler = TraversalCompiler::new(&schema, config.compiler.clone());
            let plan = compiler.compile(&tree)?;
            emit(cli.format, &plan, || print!("{}", plan.explain()))?;
        }
        Command::Session(SessionCmd::Encode {
            node,
            seq,
            timestamp,
        }) => {
            let token = session::encode(node, seq, timestamp);
            println!("{token}");
        }
        Command::Session(SessionCmd::Decode { token }) => {
            let seq = session::decode_client_seq(&token)?;
            match token.parse::<WriteSession>() {
                Ok(parsed) => emit(cli.format, &parsed, || println!("{seq}"))?,
                Err(_) => emit(cli.format, &seq, || println!("{seq}"))?,
            }
        }
        Command::Session(SessionCmd::Issue { seq }) => {
            let allocator = SessionAllocator::starting_at(config.node_id, seq);
            let issued = allocator.next_session();
            emit(cli.format, &issued, || println!("{issued}"))?;
        }
        Command::Config(ConfigCmd::Show) => {
            let rendered = toml::to_string_pretty(&config)
                .map_err(|err| Error::Serialization(err.to_string()))?;
            print!("{rendered}");
        }
        Command::Config(ConfigCmd::Init) => {
            config.save()?;
            if let Some(path) = config.path() {
                println!("wrote {}", path.display());
            }
        }
    }
    Ok(())
}

fn emit<T, F>(format: OutputFormat, value: &T, printer: F) -> Result<()>
where
    T: Serialize,
    F: Fn(),
{
    match format {
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{json}");
        }
        OutputFormat::Text => printer(),
    }
    Ok(())
}
