//! Prompt specs and rendering.
//!
//! A call site carries one [`PromptSpec`] for its whole lifetime: a user template with `{placeholder}` tokens and
//! an ordered list of context columns. Binding resolves each column's transcription model and yields a
//! [`BoundPrompt`]; [`PromptRenderer`] turns a bound prompt plus one chunk of rows into the text and images sent
//! to the provider.

pub mod media;
pub mod renderer;
pub mod template;

use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr, sync::Arc};

use crate::error::{Error, Result};
use crate::model::ModelDescriptor;

pub use media::{FetchedMedia, HttpMediaFetcher, MediaFetcher};
pub use renderer::{PromptRenderer, RenderedPrompt, TaggedRow};

/// How the rows of a chunk are laid out in the prompt.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TupleFormat {
    #[default]
    Xml,
    Markdown,
    Json,
}

impl FromStr for TupleFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "xml" | "default" => Ok(TupleFormat::Xml),
            "markdown" => Ok(TupleFormat::Markdown),
            "json" => Ok(TupleFormat::Json),
            other => Err(Error::invalid(format!(
                "Unknown tuple_format '{other}', expected one of: xml, markdown, json"
            ))),
        }
    }
}

impl fmt::Display for TupleFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TupleFormat::Xml => write!(f, "xml"),
            TupleFormat::Markdown => write!(f, "markdown"),
            TupleFormat::Json => write!(f, "json"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    #[default]
    Text,
    Image,
    Audio,
}

/// A context column as written by the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ContextColumn {
    /// Input column the value is read from
    pub data: String,
    /// Bind name for `{placeholder}` substitution and the tuple table header
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, rename = "type")]
    pub column_type: ColumnType,
    /// Name of the model used to transcribe audio columns
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transcription_model: Option<String>,
}

impl ContextColumn {
    pub fn text(data: impl Into<String>) -> Self {
        Self {
            data: data.into(),
            name: None,
            column_type: ColumnType::Text,
            transcription_model: None,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_type(mut self, column_type: ColumnType) -> Self {
        self.column_type = column_type;
        self
    }

    pub fn transcribed_by(mut self, model: impl Into<String>) -> Self {
        self.transcription_model = Some(model.into());
        self
    }

    /// Name used for placeholders and headers.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.data)
    }
}

/// The `prompt_spec` argument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PromptSpec {
    pub prompt: String,
    #[serde(default)]
    pub context_columns: Vec<ContextColumn>,
}

impl PromptSpec {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            context_columns: Vec::new(),
        }
    }

    pub fn with_column(mut self, column: ContextColumn) -> Self {
        self.context_columns.push(column);
        self
    }
}

/// A context column after binding.
#[derive(Debug, Clone)]
pub struct BoundColumn {
    pub spec: ContextColumn,
    /// Set for audio columns
    pub transcription_model: Option<Arc<ModelDescriptor>>,
}

impl BoundColumn {
    pub fn column_type(&self) -> ColumnType {
        self.spec.column_type
    }
}

/// A prompt spec whose references have been resolved.
#[derive(Debug, Clone)]
pub struct BoundPrompt {
    pub template: String,
    pub columns: Vec<BoundColumn>,
}

impl BoundPrompt {
    /// Columns that go into the tuple table (everything but images).
    pub fn tabular_columns(&self) -> impl Iterator<Item = &BoundColumn> {
        self.columns.iter().filter(|c| c.column_type() != ColumnType::Image)
    }

    pub fn image_columns(&self) -> impl Iterator<Item = &BoundColumn> {
        self.columns.iter().filter(|c| c.column_type() == ColumnType::Image)
    }

    pub fn has_context(&self) -> bool {
        !self.columns.is_empty()
    }
}
