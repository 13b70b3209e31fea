//! Coordinate file reading.
//!
//! Inputs are plain comma-separated text with an optional header. Quoting is
//! limited to stripping surrounding double quotes from a field.

use pyrolysis_core::IngestRow;
use pyrolysis_core::model::{RowError, RowLayout, SchemaKind};

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedInput {
    pub schema_kind: SchemaKind,
    pub rows: Vec<IngestRow>,
}

fn split_fields(line: &str) -> Vec<&str> {
    line.split(',')
        .map(|field| field.trim().trim_matches('"'))
        .collect()
}

/// Detects the layout from the first non-blank line and normalizes every
/// data row. Blank lines are skipped; bad rows are kept as errors so the
/// ingestion report can name their line numbers.
pub fn parse_input(
    contents: &str,
    hint: Option<SchemaKind>,
    default_zoom: u8,
) -> Result<ParsedInput, RowError> {
    let mut lines = contents
        .lines()
        .enumerate()
        .map(|(idx, line)| (idx + 1, line))
        .filter(|(_, line)| !line.trim().is_empty())
        .peekable();

    let Some(&(first_line, first)) = lines.peek() else {
        return Ok(ParsedInput {
            schema_kind: hint.unwrap_or(SchemaKind::MapboxZxy),
            rows: Vec::new(),
        });
    };
    let detected = RowLayout::detect(&split_fields(first), hint)?;
    if detected.header_consumed {
        lines.next();
    }
    let layout = detected.layout;

    let rows = lines
        .filter_map(|(line, raw)| {
            match layout.normalize(&split_fields(raw), default_zoom) {
                Ok(Some(coords)) => Some(IngestRow {
                    line,
                    parsed: Ok(coords),
                }),
                Ok(None) => None,
                Err(err) => Some(IngestRow {
                    line,
                    parsed: Err(err),
                }),
            }
        })
        .collect();

    tracing::debug!(
        schema = %layout.schema(),
        header = detected.header_consumed,
        first_line,
        "detected input layout"
    );
    Ok(ParsedInput {
        schema_kind: layout.schema(),
        rows,
    })
}
