//! Interactive editing support
//!
//! Opens $EDITOR for diary bodies and asks before destructive commands.

use anyhow::{bail, Context, Result};
use std::env;
use std::fs;
use std::io::{self, Write};
use std::path::PathBuf;
use std::process::Command;

/// Let the user write text in their editor, starting from `initial`
///
/// Lines starting with [`HINT_MARKER`] are dropped so the template can carry
/// hints; other `#` lines such as markdown headings are kept. Returns the text with surrounding whitespace trimmed.
pub fn compose(initial: &str, hint: &str) -> Result<String> {
    let editor = find_editor()?;
    let path = scratch_path();

    let template = format!("{}\n\n{} {}\n", initial, HINT_MARKER, hint);
    fs::write(&path, template)
        .with_context(|| format!("Failed to create temp file: {:?}", path))?;

    let status = Command::new(&editor)
        .arg(&path)
        .status()
        .with_context(|| format!("Failed to run editor: {}", editor));

    let content = match status {
        Ok(status) if status.success() => fs::read_to_string(&path)
            .with_context(|| format!("Failed to read edited file: {:?}", path)),
        Ok(_) => Err(anyhow::anyhow!(
            "Editor '{}' exited with non-zero status. Check that your editor is configured correctly.",
            editor
        )),
        Err(e) => Err(e),
    };
    let _ = fs::remove_file(&path);

    Ok(strip_comments(&content?))
}

/// Prefix of template lines removed after editing
pub const HINT_MARKER: &str = "# daybook:";

fn scratch_path() -> PathBuf {
    env::temp_dir().join(format!("daybook_entry_{}.md", std::process::id()))
}

fn strip_comments(text: &str) -> String {
    text.lines()
        .filter(|line| !line.starts_with(HINT_MARKER))
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

/// Find the user's preferred editor
fn find_editor() -> Result<String> {
    for var in ["EDITOR", "VISUAL"] {
        if let Ok(editor) = env::var(var) {
            if !editor.is_empty() {
                return Ok(editor);
            }
        }
    }

    for editor in ["nano", "vim", "vi"] {
        if command_exists(editor) {
            return Ok(editor.to_string());
        }
    }

    bail!(
        "No editor found. Set $EDITOR environment variable.\n\
         Example: export EDITOR=nano"
    )
}

/// Check if a command exists in PATH
fn command_exists(cmd: &str) -> bool {
    Command::new("which")
        .arg(cmd)
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

/// Prompt for confirmation
///
/// Returns true if user confirms, false otherwise.
/// In non-interactive mode (no TTY), returns false.
pub fn confirm(prompt: &str) -> Result<bool> {
    if !atty::is(atty::Stream::Stdin) {
        return Ok(false);
    }

    print!("{} [y/N] ", prompt);
    io::stdout().flush()?;

    let mut input = String::new();
    io::stdin().read_line(&mut input)?;

    let input = input.trim().to_lowercase();
    Ok(input == "y" || input == "yes")
}
