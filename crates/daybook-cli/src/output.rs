//! Output formatting for CLI
//!
//! Provides consistent output formatting across all commands:
//! - Human-readable default output
//! - JSON output (--json flag)
//! - Quiet mode for scripting (--quiet flag)

use serde::Serialize;

use daybook_core::{DiaryEntry, Entity, FoodEntry, Idea};

/// Output format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable output (default)
    Human,
    /// JSON output
    Json,
    /// Quiet mode - minimal output
    Quiet,
}

impl OutputFormat {
    /// Create format from CLI flags
    pub fn from_flags(json: bool, quiet: bool) -> Self {
        if quiet {
            OutputFormat::Quiet
        } else if json {
            OutputFormat::Json
        } else {
            OutputFormat::Human
        }
    }
}

/// How a record type is shown to humans
pub trait Describe {
    /// One-line summary for lists
    fn headline(&self) -> String;

    /// Labelled fields for the detail view
    fn details(&self) -> Vec<(&'static str, String)>;
}

impl Describe for DiaryEntry {
    fn headline(&self) -> String {
        if self.title.is_empty() {
            truncate_line(&self.body, 50)
        } else {
            self.title.clone()
        }
    }

    fn details(&self) -> Vec<(&'static str, String)> {
        vec![("Title", self.title.clone()), ("Body", self.body.clone())]
    }
}

impl Describe for FoodEntry {
    fn headline(&self) -> String {
        match self.price {
            Some(price) => format!("{} ({:.2})", self.name, price),
            None => self.name.clone(),
        }
    }

    fn details(&self) -> Vec<(&'static str, String)> {
        let mut details = vec![("Name", self.name.clone())];
        if let Some(price) = self.price {
            details.push(("Price", format!("{:.2}", price)));
        }
        details
    }
}

impl Describe for Idea {
    fn headline(&self) -> String {
        self.title.clone()
    }

    fn details(&self) -> Vec<(&'static str, String)> {
        let mut details = vec![("Title", self.title.clone())];
        if let Some(ref description) = self.description {
            details.push(("Description", description.clone()));
        }
        details
    }
}

/// Output helper for consistent formatting
pub struct Output {
    /// The output format
    pub format: OutputFormat,
}

impl Output {
    pub fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Check if output is in quiet mode
    pub fn is_quiet(&self) -> bool {
        matches!(self.format, OutputFormat::Quiet)
    }

    pub fn is_json(&self) -> bool {
        matches!(self.format, OutputFormat::Json)
    }

    /// Print a single record
    pub fn print_entry<F: Describe + Serialize>(&self, entry: &Entity<F>) {
        match self.format {
            OutputFormat::Human => {
                println!("ID:      {}", entry.id);
                for (label, value) in entry.fields.details() {
                    println!("{:<8} {}", format!("{}:", label), value);
                }
                println!("Created: {}", entry.created_at.format("%Y-%m-%d %H:%M"));
                println!("Updated: {}", entry.updated_at.format("%Y-%m-%d %H:%M"));
            }
            OutputFormat::Json => self.json(entry),
            OutputFormat::Quiet => {
                println!("{}", entry.id);
            }
        }
    }

    /// Print a list of records
    pub fn print_entries<F: Describe + Serialize>(&self, entries: &[Entity<F>], noun: &str) {
        match self.format {
            OutputFormat::Human => {
                if entries.is_empty() {
                    println!("No {} found.", noun);
                    return;
                }
                for entry in entries {
                    println!(
                        "{} | {} | {}",
                        short_id(&entry.id),
                        entry.created_at.format("%Y-%m-%d"),
                        truncate(&entry.fields.headline(), 60)
                    );
                }
                println!("\n{} {}", entries.len(), noun);
            }
            OutputFormat::Json => self.json(entries),
            OutputFormat::Quiet => {
                for entry in entries {
                    println!("{}", entry.id);
                }
            }
        }
    }

    /// Print any serializable value as pretty JSON
    pub fn json<T: Serialize + ?Sized>(&self, value: &T) {
        match serde_json::to_string_pretty(value) {
            Ok(text) => println!("{}", text),
            Err(e) => eprintln!("Failed to encode output: {}", e),
        }
    }

    /// Print a success message
    pub fn success(&self, message: &str) {
        match self.format {
            OutputFormat::Human => println!("✓ {}", message),
            OutputFormat::Json => {
                println!(
                    "{}",
                    serde_json::json!({"status": "success", "message": message})
                );
            }
            OutputFormat::Quiet => {}
        }
    }

    /// Print a warning to stderr unless quiet
    pub fn warn(&self, message: &str) {
        if !self.is_quiet() {
            eprintln!("⚠ {}", message);
        }
    }

    /// Check if we should prompt for confirmation
    pub fn should_prompt(&self) -> bool {
        self.format == OutputFormat::Human
    }

    /// Print an informational message
    pub fn message(&self, msg: &str) {
        match self.format {
            OutputFormat::Human => println!("{}", msg),
            OutputFormat::Json => {
                println!("{}", serde_json::json!({"message": msg}));
            }
            OutputFormat::Quiet => {}
        }
    }
}

/// First eight characters of an id
pub fn short_id(id: &str) -> &str {
    match id.char_indices().nth(8) {
        Some((end, _)) => &id[..end],
        None => id,
    }
}

/// Truncate a string to max length, adding "..." if truncated
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}

/// Truncate to first line and max length
fn truncate_line(s: &str, max_len: usize) -> String {
    let first_line = s.lines().next().unwrap_or("");
    truncate(first_line, max_len)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_from_flags() {
        assert_eq!(OutputFormat::from_flags(false, false), OutputFormat::Human);
        assert_eq!(OutputFormat::from_flags(true, false), OutputFormat::Json);
        assert_eq!(OutputFormat::from_flags(false, true), OutputFormat::Quiet);
        // Quiet takes precedence
        assert_eq!(OutputFormat::from_flags(true, true), OutputFormat::Quiet);
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("this is a long string", 10), "this is...");
        assert_eq!(truncate("crème brûlée au café", 8), "crème...");
    }

    #[test]
    fn test_short_id() {
        assert_eq!(short_id("0123456789abcdef"), "01234567");
        assert_eq!(short_id("abc"), "abc");
    }

    #[test]
    fn test_headlines() {
        let diary = DiaryEntry {
            title: String::new(),
            body: "first line\nsecond".to_string(),
        };
        assert_eq!(diary.headline(), "first line");

        let food = FoodEntry {
            name: "Tea".to_string(),
            price: Some(2.5),
        };
        assert_eq!(food.headline(), "Tea (2.50)");

        let idea = Idea {
            title: "Garden".to_string(),
            description: None,
        };
        assert_eq!(idea.details().len(), 1);
    }
}
