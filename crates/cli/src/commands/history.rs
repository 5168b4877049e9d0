//! `chatline history` — Print a session's messages.

use crate::runtime::Runtime;
use chatline_config::AppConfig;

pub async fn run(config: AppConfig, session_id: i64, limit: Option<usize>) -> Result<(), Box<dyn std::error::Error>> {
    let runtime = Runtime::build(config).await?;

    let messages = match limit {
        Some(n) => runtime.repository.find_recent(session_id, n).await?,
        None => runtime.repository.find_by_session(session_id).await?,
    };

    if messages.is_empty() {
        println!("No messages in session {session_id}.");
    }
    for message in &messages {
        println!(
            "[{}] {:>9}: {}",
            message.created_at.format("%H:%M:%S"),
            message.role,
            message.content
        );
    }

    runtime.repository.wait_for_warmups().await;
    runtime.shutdown().await;
    Ok(())
}
