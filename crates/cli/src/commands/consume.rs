//! `chatline consume` — Persist queued messages until interrupted.

use crate::runtime::Runtime;
use crate::shutdown::install_signal_handler;
use chatline_config::AppConfig;
use tracing::info;

pub async fn run(config: AppConfig) -> Result<(), Box<dyn std::error::Error>> {
    let runtime = Runtime::build(config).await?;
    if runtime.in_process_queue() {
        return Err(
            "queue.backend = \"memory\" lives inside `chatline chat`; set queue.backend = \"sqlite\" to consume from a separate process"
                .into(),
        );
    }

    let consumer = runtime.consumer().await?;
    let shutdown = install_signal_handler();

    println!("Chatline consumer — persisting {} (Ctrl+C to stop)", runtime.config.queue.topic);
    info!(
        group = %runtime.config.queue.consumer.group_id,
        member = runtime.config.queue.consumer.member_index,
        members = runtime.config.queue.consumer.members,
        "Consumer starting"
    );

    consumer.run(shutdown).await;

    let stats = consumer.stats();
    println!("Consumer stopped: {stats}");
    runtime.shutdown().await;
    Ok(())
}
