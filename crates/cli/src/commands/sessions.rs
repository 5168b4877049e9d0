//! `chatline sessions` — List or delete a user's sessions.

use crate::runtime::Runtime;
use chatline_config::AppConfig;
use chatline_core::store::SessionStore;

pub async fn run(config: AppConfig, user: i64, delete: Option<i64>) -> Result<(), Box<dyn std::error::Error>> {
    let runtime = Runtime::build(config).await?;

    if let Some(session_id) = delete {
        let removed = runtime.repository.delete_by_session(session_id).await?;
        if runtime.store.delete(session_id).await? {
            println!("Deleted session {session_id} ({removed} messages)");
        } else {
            println!("Session {session_id} not found");
        }
        runtime.shutdown().await;
        return Ok(());
    }

    let sessions = runtime.store.find_by_user(user).await?;
    if sessions.is_empty() {
        println!("No sessions for user {user}.");
    } else {
        println!("{:>6}  {:<20}  TITLE", "ID", "UPDATED");
        for session in &sessions {
            println!(
                "{:>6}  {:<20}  {}",
                session.id,
                session.updated_at.format("%Y-%m-%d %H:%M:%S"),
                session.title
            );
        }
    }

    runtime.shutdown().await;
    Ok(())
}
