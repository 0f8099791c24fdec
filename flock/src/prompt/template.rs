//! Pure prompt construction: the meta prompt, per-function sections, placeholder substitution and tuple tables.

use serde_json::{Map, Value};
use std::fmt::Write as _;

use super::TupleFormat;
use crate::functions::FunctionKind;

/// Name of the column carrying each row's identifier in the tuple table.
pub const ROW_ID_COLUMN: &str = "flock_row_id";

const META_PROMPT: &str = "You are Flock, a semantic analysis engine running inside a database. Analyse each tuple \
in the data below and answer the user prompt.\n\nUser Prompt:\n\n- {{USER_PROMPT}}\n\nTuples Table:\n\n{{TUPLES}}\n\n\
Instructions:\n\n{{INSTRUCTIONS}}\n\nExpected Response Format:\n\n{{RESPONSE_FORMAT}}";

const SCALAR_INSTRUCTIONS: &str = "- Answer the user prompt for every tuple independently, as if each tuple were \
the only input.\n- Keep each answer concise and directly relevant to its tuple, without extra formatting.\n- Answer \
the tuples in the order they appear in the table.";

const AGGREGATE_INSTRUCTIONS: &str = "- Evaluate the relevant attributes of every tuple against the user prompt.\n\
- Combine the per-tuple evaluations as the prompt asks, considering all tuples together.\n- Refer to tuples only by \
their flock_row_id value.";

/// Sections of the meta prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Section {
    UserPrompt,
    Tuples,
    Instructions,
    ResponseFormat,
}

impl Section {
    pub fn marker(&self) -> &'static str {
        match self {
            Section::UserPrompt => "{{USER_PROMPT}}",
            Section::Tuples => "{{TUPLES}}",
            Section::Instructions => "{{INSTRUCTIONS}}",
            Section::ResponseFormat => "{{RESPONSE_FORMAT}}",
        }
    }
}

pub fn replace_section(template: &str, section: Section, content: &str) -> String {
    template.replace(section.marker(), content)
}

fn instructions(function: FunctionKind) -> &'static str {
    if function.is_aggregate() {
        AGGREGATE_INSTRUCTIONS
    } else {
        SCALAR_INSTRUCTIONS
    }
}

fn response_format(function: FunctionKind, tuples: usize) -> String {
    match function {
        FunctionKind::Complete => format!(
            "Return a JSON object {{\"items\": [...]}} with exactly {tuples} answers, one per tuple, in table order. \
             Do not skip any tuple."
        ),
        FunctionKind::Filter => format!(
            "Return a JSON object {{\"items\": [...]}} with exactly {tuples} boolean values, true when the tuple \
             satisfies the user prompt and false otherwise, in table order."
        ),
        FunctionKind::Reduce => "Return a JSON object {\"items\": [...]} with exactly one item: a single coherent \
             answer that synthesises the relevant information from all tuples."
            .to_string(),
        FunctionKind::First | FunctionKind::Last => {
            let relevance = if function == FunctionKind::First { "most" } else { "least" };
            format!(
                "Identify the {relevance} relevant tuple for the user prompt. Return a JSON object {{\"items\": [...]}} \
                 with exactly one item: the flock_row_id of that tuple."
            )
        }
        FunctionKind::Rerank => format!(
            "Rank the tuples from most to least relevant to the user prompt. Return a JSON object {{\"items\": [...]}} \
             with exactly {tuples} items: every flock_row_id from the table, each once, in ranked order."
        ),
    }
}

/// Substitute `{name}` placeholders.
///
/// `lookup` returns the replacement for a known name; unknown placeholders and unbalanced braces are kept as-is.
pub fn substitute_placeholders<F>(template: &str, lookup: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        match after.find(['{', '}']) {
            Some(close) if after.as_bytes()[close] == b'}' => {
                let name = &after[..close];
                match lookup(name.trim()) {
                    Some(value) => out.push_str(&value),
                    None => {
                        out.push('{');
                        out.push_str(name);
                        out.push('}');
                    }
                }
                rest = &after[close + 1..];
            }
            _ => {
                out.push('{');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

/// One column of the tuple table, values in row order.
#[derive(Debug, Clone, PartialEq)]
pub struct TableColumn {
    pub name: Option<String>,
    pub values: Vec<Value>,
}

impl TableColumn {
    pub fn new(name: Option<String>, values: Vec<Value>) -> Self {
        Self { name, values }
    }
}

fn header_names(columns: &[TableColumn], markdown: bool) -> Vec<String> {
    let mut unnamed = 0;
    columns
        .iter()
        .map(|column| match &column.name {
            Some(name) if markdown && name != ROW_ID_COLUMN => format!("COLUMN_{name}"),
            Some(name) => name.clone(),
            None => {
                unnamed += 1;
                format!("COLUMN {unnamed}")
            }
        })
        .collect()
}

/// Preamble announcing how many tuples follow.
pub fn tuple_count_line(tuples: usize) -> String {
    format!("- The Number of Tuples to Generate Responses for: {tuples}\n\n")
}

pub(crate) fn cell_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "NULL".to_string(),
        other => other.to_string(),
    }
}

fn xml_escape(text: &str) -> String {
    text.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

fn markdown_escape(text: &str) -> String {
    text.replace('|', "\\|").replace('\n', " ")
}

/// Render the tuple table in `format`. All columns must have the same number of values.
pub fn render_tuples(columns: &[TableColumn], format: TupleFormat) -> String {
    let rows = columns.first().map(|c| c.values.len()).unwrap_or(0);
    let mut out = tuple_count_line(rows);

    match format {
        TupleFormat::Xml => {
            out.push_str("<header>");
            for name in header_names(columns, false) {
                let _ = write!(out, "<column>{}</column>", xml_escape(&name));
            }
            out.push_str("</header>\n");
            for row in 0..rows {
                out.push_str("<row>");
                for column in columns {
                    let _ = write!(out, "<column>{}</column>", xml_escape(&cell_text(&column.values[row])));
                }
                out.push_str("</row>\n");
            }
        }
        TupleFormat::Markdown => {
            let names = header_names(columns, true);
            let _ = writeln!(out, " | {} | ", names.join(" | "));
            let _ = writeln!(out, " | {} | ", vec!["--------"; names.len()].join(" | "));
            for row in 0..rows {
                let cells: Vec<String> = columns
                    .iter()
                    .map(|c| markdown_escape(&cell_text(&c.values[row])))
                    .collect();
                let _ = writeln!(out, " | {} | ", cells.join(" | "));
            }
        }
        TupleFormat::Json => {
            let mut object = Map::new();
            for (name, column) in header_names(columns, false).into_iter().zip(columns) {
                object.insert(name, Value::Array(column.values.clone()));
            }
            out.push_str(&serde_json::to_string_pretty(&Value::Object(object)).unwrap_or_default());
            out.push('\n');
        }
    }
    out
}

/// Assemble the full prompt for one chunk.
pub fn build_prompt(function: FunctionKind, user_prompt: &str, tuples: &str, tuple_rows: usize) -> String {
    let prompt = replace_section(META_PROMPT, Section::Instructions, instructions(function));
    let prompt = replace_section(&prompt, Section::ResponseFormat, &response_format(function, tuple_rows));
    let prompt = replace_section(&prompt, Section::Tuples, tuples);
    replace_section(&prompt, Section::UserPrompt, user_prompt)
}

/// Context appended to every `llm_reduce` chunk after the first.
pub fn previous_summary_block(summary: &str) -> String {
    let block = serde_json::json!({ "Previous Batch Summary": summary });
    format!("\n\n{}", serde_json::to_string_pretty(&block).unwrap_or_default())
}
