//! Record command handlers shared by the diary, food and ideas commands

use anyhow::{bail, Context, Result};
use serde::Serialize;

use daybook_core::{Domain, SyncClient};

use crate::editor::confirm;
use crate::output::{short_id, Describe, Output};

/// Create a record
pub fn add<D: Domain>(client: &SyncClient<D>, fields: D::Fields, output: &Output) -> Result<()>
where
    D::Fields: Describe + Serialize,
{
    let id = client
        .create(fields)
        .with_context(|| format!("Failed to add {} entry", D::NAME))?;

    let entry = client
        .get(&id)?
        .with_context(|| format!("Entry {} vanished after creation", id))?;
    output.success(&format!("Added {} entry: {}", D::NAME, short_id(&id)));
    output.print_entry(&entry);
    Ok(())
}

/// List every record, newest first
pub fn list<D: Domain>(client: &SyncClient<D>, output: &Output) -> Result<()>
where
    D::Fields: Describe + Serialize,
{
    let mut entries: Vec<_> = client.scan()?.collect();
    entries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    output.print_entries(&entries, "entries");
    Ok(())
}

/// Show one record
pub fn show<D: Domain>(client: &SyncClient<D>, id: &str, output: &Output) -> Result<()>
where
    D::Fields: Describe + Serialize,
{
    let id = resolve_id(client, id)?;
    let entry = client
        .get(&id)?
        .with_context(|| format!("Entry not found: {}", id))?;
    output.print_entry(&entry);
    Ok(())
}

/// Apply a partial update
pub fn edit<D: Domain>(
    client: &SyncClient<D>,
    id: &str,
    patch: D::Patch,
    output: &Output,
) -> Result<()>
where
    D::Fields: Describe + Serialize,
{
    let id = resolve_id(client, id)?;
    client
        .update(&id, patch)
        .with_context(|| format!("Failed to update {} entry", D::NAME))?;

    output.success("Entry updated");
    if let Some(entry) = client.get(&id)? {
        output.print_entry(&entry);
    }
    Ok(())
}

/// Delete a record, asking first in interactive mode
pub fn remove<D: Domain>(client: &SyncClient<D>, id: &str, output: &Output) -> Result<()>
where
    D::Fields: Describe,
{
    let id = resolve_id(client, id)?;

    if output.should_prompt() {
        if let Some(entry) = client.get(&id)? {
            println!(
                "Delete {} entry: {} - {}",
                D::NAME,
                short_id(&id),
                entry.fields.headline()
            );
        }
        if !confirm("Are you sure?")? {
            println!("Cancelled.");
            return Ok(());
        }
    }

    client
        .delete(&id)
        .with_context(|| format!("Failed to delete {} entry", D::NAME))?;
    output.success(&format!("Deleted {} entry: {}", D::NAME, id));
    Ok(())
}

/// Expand a full id or unique prefix to a record id
pub fn resolve_id<D: Domain>(client: &SyncClient<D>, id: &str) -> Result<String> {
    if client.get(id)?.is_some() {
        return Ok(id.to_string());
    }

    let matches: Vec<_> = client.scan()?.filter(|e| e.id.starts_with(id)).collect();
    match matches.len() {
        0 => bail!("No {} entry found matching: {}", D::NAME, id),
        1 => Ok(matches[0].id.clone()),
        _ => {
            eprintln!("Multiple entries match '{}':", id);
            for entry in &matches {
                eprintln!("  {}", entry.id);
            }
            bail!("Ambiguous ID. Please provide more characters.");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use daybook_core::sync::MockTransport;
    use daybook_core::{Config, Credential, Food, FoodEntry, Mutation, Session, TokenProvider};
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;

    fn session(dir: &TempDir) -> Session {
        let config = Config {
            data_dir: dir.path().to_path_buf(),
            ..Config::default()
        };
        Session::open_with(
            config,
            Arc::new(MockTransport::new()),
            TokenProvider::in_memory(Some(Credential::new("tok")), Duration::ZERO),
        )
        .unwrap()
    }

    fn create(client: &SyncClient<Food>, id: &str, name: &str) {
        client
            .mutate(Mutation::Create {
                id: id.to_string(),
                fields: FoodEntry {
                    name: name.to_string(),
                    price: None,
                },
            })
            .unwrap();
    }

    #[test]
    fn test_resolve_id_by_prefix() {
        let dir = TempDir::new().unwrap();
        let session = session(&dir);
        create(session.food(), "abc123", "Tea");
        create(session.food(), "abd456", "Coffee");

        assert_eq!(resolve_id(session.food(), "abc").unwrap(), "abc123");
        assert_eq!(resolve_id(session.food(), "abd456").unwrap(), "abd456");
        assert!(resolve_id(session.food(), "ab").is_err());
        assert!(resolve_id(session.food(), "zzz").is_err());
    }

    #[test]
    fn test_quiet_remove_skips_prompt() {
        let dir = TempDir::new().unwrap();
        let session = session(&dir);
        create(session.food(), "abc123", "Tea");

        let output = Output::new(crate::output::OutputFormat::Quiet);
        remove(session.food(), "abc", &output).unwrap();
        assert_eq!(session.food().scan().unwrap().count(), 0);
    }
}
