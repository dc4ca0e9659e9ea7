use std::io::IsTerminal;

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use serde::Serialize;

#[derive(Clone, Debug, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
}

impl OutputFormat {
    pub fn default_for_stdout() -> Self {
        if std::io::stdout().is_terminal() {
            Self::Pretty
        } else {
            Self::Json
        }
    }
}

/// Freshly created root credentials, as shown to the operator once.
#[derive(Serialize)]
pub struct CreatedDatabase<'a> {
    pub database: &'a str,
    pub access_key: &'a str,
    pub private_key: &'a str,
    pub key_cipher: &'a str,
}

pub fn render_created(created: &CreatedDatabase<'_>, format: OutputFormat) -> String {
    match format {
        OutputFormat::Json => {
            serde_json::to_string(created).unwrap_or_else(|_| "{}".to_string())
        }
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["DATABASE", "ACCESS KEY", "PRIVATE KEY"])
                .add_row(vec![created.database, created.access_key, created.private_key]);
            table.to_string()
        }
        OutputFormat::Pretty => {
            let rule = "-".repeat(54);
            format!(
                "{rule}\nDatabase `{}` successfully created.\n\
                 Use the following credentials to connect to it.\n\
                 access key: {}\nprivate key: {}\n{rule}",
                created.database, created.access_key, created.private_key
            )
        }
    }
}
