use solace_core::SessionPhase;

use crate::cli::AuthCommands;
use crate::commands::common::{format_timestamp, App};
use crate::error::CliError;

pub async fn run_auth(app: &App, command: AuthCommands) -> Result<(), CliError> {
    match command {
        AuthCommands::Login { email, password } => {
            let snapshot = app
                .session
                .sign_in(&email, &password)
                .await
                .map_err(|error| CliError::Auth(error.to_string()))?;
            let email_label = snapshot
                .user
                .as_ref()
                .and_then(|user| user.email.as_deref())
                .unwrap_or("(no email)");
            println!("Signed in as {email_label}");

            let report = app.engine.drain().await?;
            if !report.succeeded.is_empty() {
                println!("Synced {} queued write(s)", report.succeeded.len());
            }
            Ok(())
        }
        AuthCommands::Status => {
            let snapshot = app.session.snapshot();
            match (&snapshot.phase, &snapshot.user) {
                (SessionPhase::Authenticated | SessionPhase::Refreshing, Some(user)) => {
                    let email_label = user.email.as_deref().unwrap_or("(no email)");
                    let expires = snapshot
                        .expires_at
                        .map_or_else(|| "unknown".to_string(), |at| format_timestamp(at * 1000));
                    println!("Signed in as {email_label} (expires {expires})");
                }
                _ => println!("Not signed in."),
            }

            let pending = app.engine.pending_writes().await?.len();
            let failed = app.engine.dead_letters().await?.len();
            println!(
                "Sync: {} ({pending} pending, {failed} failed)",
                app.engine.sync_state()
            );
            Ok(())
        }
        AuthCommands::Logout => {
            app.session.sign_out().await;
            println!("Signed out");
            Ok(())
        }
    }
}
