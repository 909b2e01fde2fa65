use crate::commands::common::{resolve_entry, App};
use crate::error::CliError;

pub async fn run_delete(app: &App, id: &str) -> Result<(), CliError> {
    let entries = app.engine.get_entries(false).await?.entries;
    let entry = resolve_entry(id, &entries)?;

    app.engine.delete_entry(&entry.id).await?;
    println!("{}", entry.id);
    Ok(())
}
