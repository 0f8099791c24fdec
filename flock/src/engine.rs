//! The engine facade: model declarations, function binding and execution, and the metrics functions.
//!
//! [`Flock`] owns one [`MetricsRegistry`] and hands it to every call it executes, so all call sites of an engine
//! share a single metrics lifecycle. Scalar functions and `llm_embedding` run one task per `vector_size` fragment
//! of their input; aggregates run one task per group. Each task captures its own metrics scope when it starts.

use serde_json::Value;
use std::{future::Future, sync::Arc};
use tokio::task::JoinSet;

use crate::batch::BatchSize;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::executor::CallExecutor;
use crate::functions::{
    Binder, BoundCall, FunctionKind, embedding, embedding::EmbeddingCall, fusion, fusion::FusionMethod, join_in_order,
    reduce, rerank, scalar, select,
};
use crate::metrics::{MetricsRegistry, MetricsScope};
use crate::model::{ModelCatalog, ModelDescriptor, ProviderKind};
use crate::prompt::{HttpMediaFetcher, MediaFetcher, PromptRenderer, TupleFormat};
use crate::provider::{HttpSettings, ProviderRegistry};
use crate::secrets::ConfigSecretStore;
use crate::types::{Group, GroupResult, Row, RowRef};

/// Engine-wide defaults and execution knobs.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineSettings {
    pub default_batch_size: BatchSize,
    pub default_tuple_format: TupleFormat,
    /// Rows per scalar execution fragment
    pub vector_size: BatchSize,
    /// Re-plan remaining rows with smaller batches after an output-token overflow
    pub adaptive_batching: bool,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            default_batch_size: BatchSize::ONE,
            default_tuple_format: TupleFormat::Xml,
            vector_size: BatchSize::DEFAULT_VECTOR_SIZE,
            adaptive_batching: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Flock {
    catalog: ModelCatalog,
    providers: ProviderRegistry,
    metrics: Arc<MetricsRegistry>,
    executor: CallExecutor,
    settings: EngineSettings,
}

impl Flock {
    pub fn new(providers: ProviderRegistry, fetcher: Arc<dyn MediaFetcher>, settings: EngineSettings) -> Self {
        let metrics = Arc::new(MetricsRegistry::new());
        let renderer = PromptRenderer::new(providers.clone(), fetcher);
        Self {
            catalog: ModelCatalog::new(),
            executor: CallExecutor::new(providers.clone(), renderer, metrics.clone()),
            providers,
            metrics,
            settings,
        }
    }

    /// Build an engine talking to the providers described in `config`, with its models declared.
    pub fn from_config(config: &Config) -> Result<Self> {
        let http = HttpSettings {
            timeout: config.request_timeout,
        };
        let fetcher = Arc::new(HttpMediaFetcher::new(config.request_timeout)?);
        let providers = ProviderRegistry::with_secrets(Arc::new(ConfigSecretStore::from_config(config)), http);
        let engine = Self::new(providers, fetcher, config.engine_settings()?);
        for model in &config.models {
            engine.catalog.create_model(model.clone())?;
        }
        tracing::info!(models = engine.catalog.len(), "Engine initialised");
        Ok(engine)
    }

    pub fn catalog(&self) -> &ModelCatalog {
        &self.catalog
    }

    pub fn providers(&self) -> &ProviderRegistry {
        &self.providers
    }

    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.metrics
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// `CREATE MODEL(name, model_id, provider)`.
    pub fn create_model(
        &self,
        name: impl Into<String>,
        model_id: impl Into<String>,
        provider: ProviderKind,
    ) -> Result<Arc<ModelDescriptor>> {
        self.catalog.create_model(ModelDescriptor::new(name, model_id, provider))
    }

    pub fn create_model_with_defaults(
        &self,
        name: impl Into<String>,
        model_id: impl Into<String>,
        provider: ProviderKind,
        default_parameters: Value,
    ) -> Result<Arc<ModelDescriptor>> {
        self.catalog
            .create_model(ModelDescriptor::new(name, model_id, provider).with_default_parameters(default_parameters))
    }

    /// Bind positional arguments to `function`. Every call to `bind` is a new call site.
    pub fn bind(&self, function: FunctionKind, args: &[Value]) -> Result<BoundCall> {
        self.binder().bind(function, args)
    }

    /// Bind the arguments of `llm_embedding`. Every call is a new call site.
    pub fn bind_embedding(&self, args: &[Value]) -> Result<EmbeddingCall> {
        self.binder().bind_embedding(args)
    }

    #[tracing::instrument(skip_all, fields(rows = rows.len()))]
    pub async fn llm_complete(&self, call: &BoundCall, rows: &[Row]) -> Result<Vec<String>> {
        expect_function(call, &[FunctionKind::Complete])?;
        let items = scalar::run(&self.executor, call, rows, &self.settings).await?;
        Ok(items.into_iter().map(scalar::item_text).collect())
    }

    #[tracing::instrument(skip_all, fields(rows = rows.len()))]
    pub async fn llm_filter(&self, call: &BoundCall, rows: &[Row]) -> Result<Vec<bool>> {
        expect_function(call, &[FunctionKind::Filter])?;
        let items = scalar::run(&self.executor, call, rows, &self.settings).await?;
        items.iter().map(scalar::item_bool).collect()
    }

    #[tracing::instrument(skip_all, fields(groups = groups.len()))]
    pub async fn llm_reduce(&self, call: &BoundCall, groups: &[Group]) -> Result<Vec<GroupResult<String>>> {
        expect_function(call, &[FunctionKind::Reduce])?;
        let adaptive = self.settings.adaptive_batching;
        self.run_groups(call, groups, move |executor, call, scope, group| async move {
            reduce::reduce_group(&executor, &call, &scope, &group, adaptive).await
        })
        .await
    }

    #[tracing::instrument(skip_all, fields(groups = groups.len()))]
    pub async fn llm_first(&self, call: &BoundCall, groups: &[Group]) -> Result<Vec<GroupResult<RowRef>>> {
        expect_function(call, &[FunctionKind::First])?;
        self.select(call, groups).await
    }

    #[tracing::instrument(skip_all, fields(groups = groups.len()))]
    pub async fn llm_last(&self, call: &BoundCall, groups: &[Group]) -> Result<Vec<GroupResult<RowRef>>> {
        expect_function(call, &[FunctionKind::Last])?;
        self.select(call, groups).await
    }

    #[tracing::instrument(skip_all, fields(groups = groups.len()))]
    pub async fn llm_rerank(&self, call: &BoundCall, groups: &[Group]) -> Result<Vec<GroupResult<Vec<RowRef>>>> {
        expect_function(call, &[FunctionKind::Rerank])?;
        let adaptive = self.settings.adaptive_batching;
        self.run_groups(call, groups, move |executor, call, scope, group| async move {
            rerank::rerank_group(&executor, &call, &scope, &group, adaptive).await.map(Some)
        })
        .await
    }

    #[tracing::instrument(skip_all, fields(rows = rows.len()))]
    pub async fn llm_embedding(&self, call: &EmbeddingCall, rows: &[Row]) -> Result<Vec<Vec<f64>>> {
        embedding::run(&self.executor, call, rows, &self.settings).await
    }

    /// Fuse per-system score columns into one score per row. Never calls a provider.
    pub fn fuse(&self, method: FusionMethod, systems: &[Vec<Option<f64>>]) -> Result<Vec<f64>> {
        fusion::fuse(method, systems)
    }

    /// Flat metrics view.
    pub fn flock_get_metrics(&self) -> Value {
        self.metrics.snapshot()
    }

    /// Metrics nested by thread and execution state.
    pub fn flock_get_debug_metrics(&self) -> Value {
        self.metrics.debug_snapshot()
    }

    pub fn flock_reset_metrics(&self) -> String {
        self.metrics.reset().to_string()
    }

    fn binder(&self) -> Binder<'_> {
        Binder {
            catalog: &self.catalog,
            providers: &self.providers,
            metrics: &self.metrics,
            settings: &self.settings,
        }
    }

    async fn select(&self, call: &BoundCall, groups: &[Group]) -> Result<Vec<GroupResult<RowRef>>> {
        let adaptive = self.settings.adaptive_batching;
        self.run_groups(call, groups, move |executor, call, scope, group| async move {
            select::select_row(&executor, &call, &scope, &group, adaptive).await
        })
        .await
    }

    /// Run `strategy` on every non-empty group, one task per group, and collect results in group order.
    ///
    /// The first failing group fails the whole call and cancels the groups still running.
    async fn run_groups<T, F, Fut>(&self, call: &BoundCall, groups: &[Group], strategy: F) -> Result<Vec<GroupResult<T>>>
    where
        T: Send + 'static,
        F: Fn(CallExecutor, Arc<BoundCall>, MetricsScope, Group) -> Fut + Clone + Send + 'static,
        Fut: Future<Output = Result<Option<T>>> + Send + 'static,
    {
        let call = Arc::new(call.clone());
        let mut tasks = JoinSet::new();
        for (position, group) in groups.iter().filter(|group| !group.is_empty()).enumerate() {
            let executor = self.executor.clone();
            let call = call.clone();
            let group = group.clone();
            let strategy = strategy.clone();
            tasks.spawn(async move {
                let scope = MetricsScope::current(executor.metrics().state_id());
                let key = group.key.clone();
                let outcome = strategy(executor, call, scope, group).await;
                (position, outcome.map(|value| value.map(|value| GroupResult { key, value })))
            });
        }

        let results = join_in_order(tasks).await?;
        Ok(results.into_iter().flatten().collect())
    }
}

fn expect_function(call: &BoundCall, allowed: &[FunctionKind]) -> Result<()> {
    if allowed.contains(&call.function) {
        Ok(())
    } else {
        Err(Error::invalid(format!(
            "call was bound for {}, not {}",
            call.function,
            allowed.iter().map(FunctionKind::as_str).collect::<Vec<_>>().join(" or ")
        )))
    }
}
