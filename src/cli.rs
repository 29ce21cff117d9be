//! CLI argument parsing using clap v4

use clap::{Parser, Subcommand};

use crate::protocol::EntityRef;

/// Collaboration coordinator - presence, editing intent and change fan-out
///
/// `serve` runs the coordination endpoint; `connect` runs a client session
/// against it and logs presence and entity changes as they arrive.
#[derive(Parser, Debug)]
#[command(name = "collab-coordinator")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Increase logging verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the coordination server until Ctrl+C
    Serve {
        /// Path to configuration file
        #[arg(short, long, env = "COLLAB_CONFIG")]
        config: Option<String>,

        /// Listen address (overrides [server] bind_addr)
        #[arg(short, long)]
        bind: Option<String>,
    },

    /// Connect to a coordination endpoint and follow presence and changes
    Connect {
        /// Path to configuration file
        #[arg(short, long, env = "COLLAB_CONFIG")]
        config: Option<String>,

        /// Endpoint URL (overrides [coordinator] url)
        #[arg(long)]
        url: Option<String>,

        /// User id (overrides [identity] user_id)
        #[arg(long)]
        user_id: Option<String>,

        /// Display name (overrides [identity] display_name)
        #[arg(long)]
        name: Option<String>,

        /// Context to join (overrides [coordinator] initial_context)
        #[arg(long)]
        context: Option<String>,

        /// Declare editing intent once connected, as TYPE/ID
        #[arg(long, value_name = "TYPE/ID", value_parser = parse_entity)]
        edit: Option<EntityRef>,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        subcommand: ConfigSubcommand,
    },

    /// Display version and build information
    Version,
}

#[derive(Subcommand, Debug, Clone)]
pub enum ConfigSubcommand {
    /// Display the effective configuration
    Show {
        /// Path to configuration file
        #[arg(short, long)]
        config: Option<String>,
    },

    /// Write a commented default configuration file
    Init {
        /// Where to create the file
        #[arg(short, long)]
        path: Option<String>,

        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },

    /// Check a configuration file
    Validate {
        /// Path to configuration file to validate
        #[arg(short, long)]
        config: Option<String>,
    },
}

/// Parse `TYPE/ID`
fn parse_entity(value: &str) -> Result<EntityRef, String> {
    match value.split_once('/') {
        Some((entity_type, entity_id)) if !entity_type.is_empty() && !entity_id.is_empty() => {
            Ok(EntityRef::new(entity_type, entity_id))
        }
        _ => Err(format!("expected TYPE/ID, got '{value}'")),
    }
}
