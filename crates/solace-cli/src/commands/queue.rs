use crate::cli::QueueCommands;
use crate::commands::common::{dead_letter_to_item, format_queue_lines, pending_to_item, App};
use crate::commands::sync::format_drain_report;
use crate::error::CliError;

pub async fn run_queue(app: &App, command: QueueCommands) -> Result<(), CliError> {
    match command {
        QueueCommands::List { json } => {
            let mut items = app
                .engine
                .pending_writes()
                .await?
                .iter()
                .map(pending_to_item)
                .collect::<Vec<_>>();
            items.extend(app.engine.dead_letters().await?.iter().map(dead_letter_to_item));

            if json {
                println!("{}", serde_json::to_string_pretty(&items)?);
            } else if items.is_empty() {
                println!("Nothing queued.");
            } else {
                for line in format_queue_lines(&items) {
                    println!("{line}");
                }
            }
            Ok(())
        }
        QueueCommands::Retry => {
            let moved = app.engine.requeue_failed().await?;
            println!("Requeued {moved} failed write(s)");
            let report = app.engine.retry_sync().await?;
            for line in format_drain_report(&report) {
                println!("{line}");
            }
            Ok(())
        }
        QueueCommands::Discard { seq } => {
            app.engine.discard_failed(seq).await?;
            println!("Discarded failed write #{seq}");
            Ok(())
        }
    }
}
