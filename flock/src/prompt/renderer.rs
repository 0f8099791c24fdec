use serde_json::Value;
use std::sync::Arc;

use super::template::{self, ROW_ID_COLUMN, TableColumn};
use super::{BoundColumn, BoundPrompt, ColumnType, MediaFetcher, TupleFormat, media};
use crate::error::{Error, Result};
use crate::functions::FunctionKind;
use crate::model::ModelParameters;
use crate::provider::{ImageInput, ProviderRegistry, TranscriptionRequest};
use crate::types::Row;

/// A row together with the identifier the model sees for it.
#[derive(Debug, Clone, Copy)]
pub struct TaggedRow<'a> {
    pub id: usize,
    pub row: &'a Row,
}

/// Text and media for one provider call.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedPrompt {
    pub text: String,
    pub images: Vec<ImageInput>,
}

#[derive(Debug, Clone, Copy)]
pub struct RenderOptions {
    pub tuple_format: TupleFormat,
    /// Whether the target provider accepts image URLs
    pub provider_fetches_urls: bool,
}

#[derive(Debug, Clone)]
pub struct PromptRenderer {
    providers: ProviderRegistry,
    fetcher: Arc<dyn MediaFetcher>,
}

impl PromptRenderer {
    pub fn new(providers: ProviderRegistry, fetcher: Arc<dyn MediaFetcher>) -> Self {
        Self { providers, fetcher }
    }

    /// Render the prompt for one chunk.
    ///
    /// Audio columns are transcribed first; any transcription failure fails the render. `previous_summary` is
    /// appended for `llm_reduce` chunks after the first.
    #[tracing::instrument(skip_all, fields(function = %function, rows = rows.len()))]
    pub async fn render(
        &self,
        function: FunctionKind,
        prompt: &BoundPrompt,
        rows: &[TaggedRow<'_>],
        options: RenderOptions,
        previous_summary: Option<&str>,
    ) -> Result<RenderedPrompt> {
        let mut table = vec![TableColumn::new(
            Some(ROW_ID_COLUMN.to_string()),
            rows.iter().map(|r| Value::from(r.id)).collect(),
        )];
        for column in prompt.tabular_columns() {
            let values = self.column_values(column, rows).await?;
            table.push(TableColumn::new(Some(column.spec.display_name().to_string()), values));
        }

        let user_prompt = template::substitute_placeholders(&prompt.template, |name| {
            let index = prompt.tabular_columns().position(|c| c.spec.display_name() == name);
            match index {
                // +1 skips the row id column
                Some(index) if rows.len() == 1 => Some(cell_text(&table[index + 1].values[0])),
                Some(_) => Some(name.to_string()),
                None => prompt
                    .image_columns()
                    .any(|c| c.spec.display_name() == name)
                    .then(|| name.to_string()),
            }
        });
        if user_prompt.trim().is_empty() {
            return Err(Error::EmptyPrompt {
                function: function.to_string(),
            });
        }

        let tuples = template::render_tuples(&table, options.tuple_format);
        let mut text = template::build_prompt(function, &user_prompt, &tuples, rows.len());
        if let Some(summary) = previous_summary {
            text.push_str(&template::previous_summary_block(summary));
        }

        let mut images = Vec::new();
        for column in prompt.image_columns() {
            for tagged in rows {
                let reference = column_value(column, tagged.row)?;
                let reference = match reference {
                    Value::String(s) => s.clone(),
                    Value::Null => continue,
                    other => other.to_string(),
                };
                images.push(media::prepare_image(&reference, options.provider_fetches_urls, self.fetcher.as_ref()).await);
            }
        }

        Ok(RenderedPrompt { text, images })
    }

    async fn column_values(&self, column: &BoundColumn, rows: &[TaggedRow<'_>]) -> Result<Vec<Value>> {
        let mut values = Vec::with_capacity(rows.len());
        for tagged in rows {
            let value = column_value(column, tagged.row)?;
            if column.column_type() == ColumnType::Audio {
                values.push(Value::String(self.transcribe(column, value).await?));
            } else {
                values.push(value.clone());
            }
        }
        Ok(values)
    }

    async fn transcribe(&self, column: &BoundColumn, value: &Value) -> Result<String> {
        let model = column
            .transcription_model
            .as_ref()
            .ok_or_else(|| Error::MissingTranscriptionModel {
                column: column.spec.display_name().to_string(),
            })?;
        let audio = match value {
            Value::String(s) => s.clone(),
            other => {
                return Err(Error::invalid(format!(
                    "Audio column '{}' must hold a URL or path, got {other}",
                    column.spec.display_name()
                )));
            }
        };

        let provider = self.providers.get(model.provider)?;
        let request = TranscriptionRequest {
            model_id: model.model_id.clone(),
            audio,
            parameters: ModelParameters::from_value(&model.default_parameters)?,
        };
        provider.transcribe(&request).await.inspect_err(|e| {
            tracing::error!(
                column = %column.spec.display_name(),
                model = %model.name,
                error = %e,
                "Audio transcription failed"
            );
        })
    }
}

fn column_value<'r>(column: &BoundColumn, row: &'r Row) -> Result<&'r Value> {
    row.get(&column.spec.data)
        .ok_or_else(|| Error::invalid(format!("Input row has no column '{}'", column.spec.data)))
}

fn cell_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
