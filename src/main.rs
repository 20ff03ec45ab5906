use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

use sotto::cli::{Cli, Commands};
use sotto::crypto::{LocalIdentity, PreKeyBundle};
use sotto::files::{FileTransfer, TransferEvent};
use sotto::protocol::MessageContent;
use sotto::session::{ConnectionStatus, Core, CoreEvent};
use sotto::swarm::TcpSwarm;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse_args();
    match cli.command {
        Commands::Keygen => keygen(),
        Commands::Join {
            room,
            peer,
            identity,
            listen,
            dial,
            overlay,
        } => join_room(room, peer, identity, listen, dial, overlay).await,
    }
}

fn keygen() -> Result<()> {
    let identity = LocalIdentity::generate();
    let bundle = identity.bundle();

    println!("🔐 New ephemeral identity");
    println!();
    println!("📋 Pre-key bundle (share this with your peer):");
    println!("{}", BASE64.encode(bundle.to_bytes()));
    println!();
    println!("🔑 Identity secret (pass as --identity, keep private):");
    println!("{}", BASE64.encode(identity.to_secret_bytes()));
    Ok(())
}

async fn join_room(
    room: String,
    peer: String,
    identity: String,
    listen: String,
    dial: Vec<String>,
    overlay: Vec<String>,
) -> Result<()> {
    let identity_bytes = BASE64.decode(identity).context("bad identity base64")?;
    let identity = LocalIdentity::from_secret_bytes(&identity_bytes)
        .context("identity secret must be 64 bytes")?;
    let peer_bytes = BASE64.decode(peer).context("bad peer bundle base64")?;
    let peer_bundle = PreKeyBundle::from_bytes(&peer_bytes).context("bad peer bundle")?;

    println!("🔒 sotto");
    println!("🏠 Room: {room}");
    println!("📋 Our bundle: {}", BASE64.encode(identity.bundle().to_bytes()));

    let swarm = TcpSwarm::new(Some(listen), dial, overlay);
    let (core, mut events) = Core::initialize(&room, identity, peer_bundle, swarm)
        .await
        .context("failed to join the room")?;
    let (files, mut file_events) = FileTransfer::new(core.clone());

    println!("💬 Type to chat, /share <path> to send a file, /quit to leave.");
    println!();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                let line = line.trim().to_string();
                if line.is_empty() {
                    continue;
                }
                if line == "/quit" {
                    break;
                }
                if let Some(path) = line.strip_prefix("/share ") {
                    match files.upload(std::path::Path::new(path.trim())).await {
                        Ok(meta) => println!(
                            "📤 Offering {} ({} bytes, {} chunks)",
                            meta.filename, meta.size, meta.total_chunks
                        ),
                        Err(e) => eprintln!("❌ {e}"),
                    }
                    continue;
                }
                if let Err(e) = core.send(line).await {
                    eprintln!("❌ {e}");
                }
            }
            Some(event) = events.recv() => match event {
                CoreEvent::Message { peer, message } => match message.content {
                    MessageContent::Text(text) => println!("[{peer}] {text}"),
                    MessageContent::File(chunk) => println!(
                        "📥 [{peer}] file chunk {}/{} of {}",
                        chunk.index + 1,
                        chunk.total,
                        chunk.filename.as_deref().unwrap_or(&chunk.file_id),
                    ),
                },
                CoreEvent::ConnectionStatus(status) => match status {
                    ConnectionStatus::Connecting => println!("🔌 Connecting..."),
                    ConnectionStatus::Connected => println!("✅ Peer verified, channel up"),
                    ConnectionStatus::Disconnected => println!("🔌 Disconnected"),
                },
                CoreEvent::BackendError(msg) => eprintln!("⚠️  {msg}"),
                CoreEvent::PeerDelivery { message_id, success } => {
                    if !success {
                        eprintln!("⚠️  Delivery failed for {message_id}");
                    }
                }
            },
            Some(event) = file_events.recv() => match event {
                TransferEvent::Progress { file_id, chunks_done, total_chunks } => {
                    println!("📤 {file_id}: {chunks_done}/{total_chunks} chunks");
                }
                TransferEvent::Completed { file_id } => println!("✅ Upload {file_id} complete"),
                TransferEvent::Failed { file_id, reason } => {
                    eprintln!("❌ Upload {file_id} failed: {reason}");
                }
                TransferEvent::Cancelled { file_id } => println!("🚫 Upload {file_id} cancelled"),
            },
        }
    }

    core.cleanup().await.ok();
    println!("👋 Left the room; keys wiped.");
    Ok(())
}
