use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

#[derive(Parser, Debug)]
#[command(name = "vmforge", about = "Declarative VM provisioning on libvirt")]
pub struct Cli {
    /// Path to host config file (default: ~/.config/vmforge/config.yaml)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long)]
    pub verbose: bool,

    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub output: OutputFormat,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Provision a VM from a machine spec
    Create {
        /// Path to the machine spec YAML
        #[arg(long)]
        spec: PathBuf,
    },

    /// Stop, undefine, and reclaim the storage of a VM
    Destroy {
        /// VM name
        name: String,
    },

    /// Show the current state of a VM
    Status {
        /// VM name
        name: String,
    },

    /// Manage storage pools
    Pool {
        #[command(subcommand)]
        action: PoolCommand,
    },

    /// Manage volumes
    Volume {
        #[command(subcommand)]
        action: VolumeCommand,
    },

    /// Manage base images
    Image {
        #[command(subcommand)]
        action: ImageCommand,
    },
}

#[derive(Subcommand, Debug)]
pub enum PoolCommand {
    /// List pools (the reserved pools by default)
    List {
        /// Additional pool names to include
        names: Vec<String>,
    },

    /// Create a directory-backed pool
    Create {
        name: String,
        /// Backing directory path
        path: String,
    },

    /// Delete a pool
    Delete {
        name: String,
        /// Delete the pool's volumes first
        #[arg(long)]
        force: bool,
    },
}

#[derive(Subcommand, Debug)]
pub enum VolumeCommand {
    /// List the volumes in a pool
    List { pool: String },

    /// Create a blank volume
    Create {
        pool: String,
        name: String,
        /// Capacity in GiB
        #[arg(long)]
        size_gb: u64,
        /// Volume format
        #[arg(long, value_enum, default_value_t = FormatArg::Qcow2)]
        format: FormatArg,
    },

    /// Delete a volume
    Delete { pool: String, name: String },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
pub enum FormatArg {
    Qcow2,
    Raw,
}

#[derive(Subcommand, Debug)]
pub enum ImageCommand {
    /// Import a local image file into the images pool
    Import {
        /// Path to the image file
        file: PathBuf,
        /// Volume name (defaults to the file name)
        #[arg(long)]
        name: Option<String>,
    },

    /// Download an image over HTTP and import it
    Fetch {
        url: String,
        /// Volume name (defaults to the URL's file name)
        #[arg(long)]
        name: Option<String>,
    },

    /// List the images pool
    List,
}
