use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "sotto")]
#[command(about = "🔒 Forward-secret ephemeral room chat", long_about = None)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Generate an ephemeral identity and print its pre-key bundle
    Keygen,

    /// Join a room and chat from the terminal
    Join {
        /// Room identifier (peers must use the same one)
        #[arg(short, long)]
        room: String,

        /// Peer's pre-key bundle, base64 (64 bytes: dh ‖ sig)
        #[arg(short, long)]
        peer: String,

        /// Our identity secret from `keygen`, base64
        #[arg(short, long)]
        identity: String,

        /// Address to listen on for inbound peers
        #[arg(short, long, default_value = "127.0.0.1:0")]
        listen: String,

        /// Peer addresses to dial directly
        #[arg(short = 'd', long)]
        dial: Vec<String>,

        /// Overlay tunnel addresses used after a transport flip
        #[arg(short, long)]
        overlay: Vec<String>,
    },
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
