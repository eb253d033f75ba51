//! Output formatting for cc-manager

use anyhow::Result;
use clap::ValueEnum;
use colored::*;
use comfy_table::{presets::UTF8_FULL, Attribute, Cell, Color, ContentArrangement, Table};
use serde::Serialize;

/// Output format options
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable table format
    #[default]
    Table,
    /// JSON format
    Json,
    /// YAML format
    Yaml,
    /// Compact text format
    Text,
}

/// Trait for types that can be formatted for output
pub trait Formattable {
    fn table_headers() -> Vec<String>;
    fn table_row(&self) -> Vec<String>;

    /// Single-line summary for text output
    fn text_line(&self) -> String;
}

/// Output formatter
pub struct OutputFormatter {
    format: OutputFormat,
}

impl OutputFormatter {
    /// Create a new output formatter
    pub fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Format a list of items
    pub fn render_list<T>(&self, items: &[T]) -> Result<String>
    where
        T: Serialize + Formattable,
    {
        let rendered = match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(items)?,
            OutputFormat::Yaml => serde_yaml::to_string(items)?,
            OutputFormat::Table if items.is_empty() => "No CC capable GPUs found".dimmed().to_string(),
            OutputFormat::Table => {
                let mut table = Table::new();
                table
                    .load_preset(UTF8_FULL)
                    .set_content_arrangement(ContentArrangement::Dynamic);

                let header_cells: Vec<Cell> = T::table_headers()
                    .iter()
                    .map(|h| Cell::new(h).add_attribute(Attribute::Bold).fg(Color::Cyan))
                    .collect();
                table.set_header(header_cells);

                for item in items {
                    table.add_row(item.table_row());
                }
                table.to_string()
            }
            OutputFormat::Text => items
                .iter()
                .map(Formattable::text_line)
                .collect::<Vec<_>>()
                .join("\n"),
        };
        Ok(rendered)
    }

    /// Format and print a list of items
    pub fn print_list<T>(&self, items: &[T]) -> Result<()>
    where
        T: Serialize + Formattable,
    {
        println!("{}", self.render_list(items)?);
        Ok(())
    }

    /// Print a success message; structured formats carry it in the data
    pub fn print_success(&self, message: &str) {
        if matches!(self.format, OutputFormat::Table | OutputFormat::Text) {
            println!("{} {}", "✓".green().bold(), message.green());
        }
    }

    /// Print an error message
    pub fn print_error(&self, message: &str) {
        match self.format {
            OutputFormat::Json => {
                let result = serde_json::json!({
                    "status": "error",
                    "message": message
                });
                eprintln!("{}", result);
            }
            OutputFormat::Yaml => {
                eprintln!("status: error");
                eprintln!("message: {}", message);
            }
            OutputFormat::Table | OutputFormat::Text => {
                eprintln!("{} {}", "✗".red().bold(), message.red());
            }
        }
    }
}

/// Color a CC mode value for table output
pub fn colorize_mode(mode: &str) -> String {
    match mode {
        "on" => mode.green().to_string(),
        "devtools" => mode.yellow().to_string(),
        "off" => mode.normal().to_string(),
        _ => mode.red().to_string(),
    }
}
