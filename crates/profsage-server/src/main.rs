//! ProfSage — professor recommendation chat server.

use std::sync::Arc;

use profsage_chat::pipeline::TOP_K;
use profsage_core::ProfSageConfig;
use profsage_server::{build_router, AppState};
use tracing::info;
use tracing_subscriber::EnvFilter;

fn print_help() {
    println!("ProfSage — professor recommendation chat server");
    println!();
    println!("Usage: profsage [command]");
    println!();
    println!("Commands:");
    println!("  (none)          Start the server");
    println!("  check-config    Print the resolved configuration (keys masked)");
    println!("  help            Show this help message");
    println!();
    println!("Required environment: OPENAI_API_KEY, PINECONE_API_KEY");
    println!("Optional: PROFSAGE_CONFIG (JSON file), PORT, PINECONE_INDEX_HOST, ...");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();

    if args.len() > 1 {
        match args[1].as_str() {
            "check-config" | "--check-config" => {
                let config = ProfSageConfig::from_env()?;
                println!("{}", serde_json::to_string_pretty(&config.redacted())?);
                let missing = config.missing_credentials();
                if !missing.is_empty() {
                    eprintln!("Missing: {}", missing.join(", "));
                    std::process::exit(1);
                }
                return Ok(());
            }
            "--help" | "-h" | "help" => {
                print_help();
                return Ok(());
            }
            _ => {
                eprintln!("Unknown command: {}. Use 'profsage help' for usage.", args[1]);
                std::process::exit(1);
            }
        }
    }

    let config = ProfSageConfig::from_env()?;
    let port = config.port;
    info!(
        "Index {}/{} (top {}), models {} + {}",
        config.index_name, config.namespace, TOP_K, config.embedding_model, config.chat_model
    );

    let state = Arc::new(AppState::new(config)?);
    let app = build_router(state);

    let addr = format!("0.0.0.0:{}", port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("ProfSage server listening on {}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}
