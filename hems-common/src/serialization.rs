use serde::Serialize;

use crate::error::{Error, Result};
use crate::measurement::Measurement;

/// Text format used to render a record for an output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// JSON object on a single line (default).
    #[default]
    Json,

    /// YAML mapping.
    Yaml,

    /// One CSV row, header emitted separately.
    Csv,
}

impl OutputFormat {
    /// Get the MIME type for this format.
    pub fn mime_type(&self) -> &'static str {
        match self {
            OutputFormat::Json => "application/json",
            OutputFormat::Yaml => "application/yaml",
            OutputFormat::Csv => "text/csv",
        }
    }

    /// File extension, including the leading dot.
    pub fn extension(&self) -> &'static str {
        match self {
            OutputFormat::Json => ".json",
            OutputFormat::Yaml => ".yaml",
            OutputFormat::Csv => ".csv",
        }
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            OutputFormat::Json => "json",
            OutputFormat::Yaml => "yaml",
            OutputFormat::Csv => "csv",
        };
        f.write_str(name)
    }
}

/// Encode a value as text in the given format, without a trailing newline.
pub fn encode<T: Serialize>(value: &T, format: OutputFormat) -> Result<String> {
    match format {
        OutputFormat::Json => serde_json::to_string(value).map_err(Error::from),
        OutputFormat::Yaml => {
            let text = serde_yaml::to_string(value)?;
            Ok(text.trim_end().to_string())
        }
        OutputFormat::Csv => {
            let mut writer = csv::WriterBuilder::new()
                .has_headers(false)
                .from_writer(Vec::new());
            writer.serialize(value)?;
            let bytes = writer.into_inner()?;
            let text = String::from_utf8_lossy(&bytes);
            Ok(text.trim_end().to_string())
        }
    }
}

/// CSV header line matching the measurement record layout.
pub fn csv_header() -> String {
    Measurement::FIELDS.join(",")
}
