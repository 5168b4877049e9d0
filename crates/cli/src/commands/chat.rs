//! `chatline chat` — Interactive or single-message chat mode.

use crate::runtime::Runtime;
use crate::shutdown::install_signal_handler;
use chatline_chat::ChatService;
use chatline_config::AppConfig;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;

pub async fn run(
    config: AppConfig,
    session: Option<i64>,
    user: i64,
    message: Option<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let model = match chatline_providers::build_model(&config.model) {
        Ok(model) => model,
        Err(e) => {
            eprintln!();
            eprintln!("  ERROR: {e}");
            eprintln!();
            eprintln!("  Set one of these environment variables:");
            eprintln!("    CHATLINE_API_KEY=sk-...   (generic)");
            eprintln!("    OPENAI_API_KEY=sk-...     (for OpenAI direct)");
            eprintln!();
            eprintln!("  Or add it to your config file:");
            eprintln!("    {}", AppConfig::config_dir().join("config.toml").display());
            eprintln!();
            return Err(e.into());
        }
    };

    let runtime = Runtime::build(config).await?;
    let service = runtime.chat_service(model.clone());
    let session_id = match session {
        Some(id) => {
            if service.get_session(id).await?.is_none() {
                runtime.shutdown().await;
                return Err(format!("Session {id} not found").into());
            }
            id
        }
        None => service.create_session(user).await?.id,
    };

    // With an in-process queue nobody else will persist our messages.
    let consumer_cancel = CancellationToken::new();
    let consumer = if runtime.in_process_queue() {
        let consumer = Arc::new(runtime.consumer().await?);
        Some(consumer.spawn(consumer_cancel.clone()))
    } else {
        None
    };

    let shutdown = install_signal_handler();
    let result = match message {
        Some(msg) => ask(&service, session_id, &msg, &shutdown).await,
        None => interactive(&service, session_id, model.name(), &shutdown).await,
    };

    if let Some(handle) = consumer {
        runtime.producer.close().await;
        runtime.drain_in_process(Duration::from_secs(5)).await;
        consumer_cancel.cancel();
        let _ = handle.await;
    }
    runtime.shutdown().await;
    result
}

async fn ask(
    service: &ChatService,
    session_id: i64,
    message: &str,
    shutdown: &CancellationToken,
) -> Result<(), Box<dyn std::error::Error>> {
    let cancel = shutdown.child_token();
    service
        .send_message(
            session_id,
            message,
            |delta| {
                print!("{delta}");
                let _ = std::io::stdout().flush();
            },
            &cancel,
        )
        .await?;
    println!();
    Ok(())
}

async fn interactive(
    service: &ChatService,
    session_id: i64,
    model_name: &str,
    shutdown: &CancellationToken,
) -> Result<(), Box<dyn std::error::Error>> {
    println!();
    println!("  Chatline — session {session_id}");
    println!("  Model:  {model_name}");
    println!();
    println!("  Type your message and press Enter.");
    println!("  Type 'exit' or Ctrl+C to quit.");
    println!();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("  You > ");
        std::io::stdout().flush()?;

        let line = tokio::select! {
            _ = shutdown.cancelled() => break,
            line = lines.next_line() => line?,
        };
        let Some(line) = line else { break };
        let input = line.trim();
        if input.is_empty() {
            continue;
        }
        if input == "exit" || input == "quit" {
            break;
        }

        print!("  Assistant > ");
        std::io::stdout().flush()?;
        match ask(service, session_id, input, shutdown).await {
            Ok(()) => println!(),
            Err(e) => {
                println!();
                eprintln!("  [Error] {e}");
                println!();
            }
        }
    }

    println!();
    println!("  Goodbye!");
    println!();
    Ok(())
}
