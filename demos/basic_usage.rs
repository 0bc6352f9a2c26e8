// demos/basic_usage.rs
// Run with: cargo run --example basic_usage

use futures::StreamExt;
use rusty_fcp::{
    AuthChainResolver, CancellationToken, ClientConfig, ConnectionManager, Destination,
    HostTrustVerifier, LocalTranslator, OpensshDialer, TerminalPrompt, TransferEvent,
    TransferOrchestrator, TransferOutcome, WriteMode,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 1. Build a connection manager from the user's config
    let config = ClientConfig::load(None)?;
    let prompt = Arc::new(TerminalPrompt);
    let store = Arc::new(config.credential_store());
    let resolver = AuthChainResolver::new(store.clone(), prompt.clone());
    let dialer = OpensshDialer::new(&config.control_dir, config.known_hosts_path());
    let manager = ConnectionManager::new(Arc::new(dialer), resolver, HostTrustVerifier::new(prompt));

    // 2. Connect (host key prompt and auth chain run here)
    let cancel_token = CancellationToken::new();
    let destination = Destination::parse("your_username@example.com", store.as_ref())?;
    let connection = manager
        .dial(&destination, &config.connect_options(None), &cancel_token)
        .await?;
    println!("✅ Connected to {}", destination);

    // 3. Open an SFTP-backed translator
    let remote = connection
        .open_sftp(config.transfer_config(WriteMode::Truncate))
        .await?;

    // 4. List files in a remote directory
    println!("\n📂 Listing files in /remote/directory...");
    let dir = remote.resolve(&PathBuf::from("/remote/directory")).await?;
    let mut entries = remote.list(&dir).await?;
    while let Some(entry) = entries.next().await {
        let entry = entry?;
        println!("  - {:?} ({} bytes)", entry.path, entry.size);
    }
    drop(entries);

    // 5. Download a file while printing progress
    println!("\n⬇️  Downloading file...");
    let local = LocalTranslator::new(config.transfer_config(WriteMode::Truncate));
    let (tx, mut rx) = mpsc::unbounded_channel();
    let printer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            if let TransferEvent::Progress(p) = event {
                println!("⏳ {}: {:.2}%", p.src_file, p.percentage());
            }
        }
    });

    let orchestrator = TransferOrchestrator::new(remote.as_ref(), &local, WriteMode::Truncate, tx);
    let sources = orchestrator
        .resolve_sources(&[PathBuf::from("/remote/path/document.pdf")])
        .await?;
    let outcome = orchestrator
        .copy(sources, &PathBuf::from("/local/path/document.pdf"), &cancel_token)
        .await?;
    drop(orchestrator);
    printer.await?;

    match outcome {
        TransferOutcome::Completed(summary) => {
            println!("✅ Download completed: {} bytes transferred", summary.bytes_written);
        }
        TransferOutcome::Cancelled(summary) => {
            println!("❌ Download cancelled after {} bytes", summary.bytes_written);
        }
    }

    // 6. Clean up
    remote.close().await?;
    connection.close().await?;
    println!("\n✅ Connection closed");

    Ok(())
}
