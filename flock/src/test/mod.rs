//! Engine-level scenarios: binding, execution and metrics through the public [`Flock`] surface, with a scripted
//! provider standing in for the model.

use rstest::rstest;
use serde_json::{Value, json};
use std::{sync::Arc, time::Duration};
use tokio_test::assert_ok;

use crate::engine::{EngineSettings, Flock};
use crate::error::{Error, ErrorKind};
use crate::functions::{FunctionKind, fusion::FusionMethod};
use crate::functions::testing::{lowest_id_first, offered_ids};
use crate::metrics::RESET_CONFIRMATION;
use crate::model::ProviderKind;
use crate::prompt::HttpMediaFetcher;
use crate::provider::{MockProvider, ProviderRegistry, mock::envelope};
use crate::types::{Group, Row};

fn engine(mocks: &[&MockProvider]) -> Flock {
    let providers = ProviderRegistry::empty();
    for mock in mocks {
        providers.register(Arc::new((*mock).clone()));
    }
    let fetcher = Arc::new(HttpMediaFetcher::new(Duration::from_secs(1)).unwrap());
    let engine = Flock::new(providers, fetcher, EngineSettings::default());
    engine.create_model("gpt", "gpt-4o-mini", ProviderKind::OpenAI).unwrap();
    engine.create_model("llama", "llama3.2", ProviderKind::Ollama).unwrap();
    engine
}

/// Summaries for `Summarise` prompts, booleans for `Should we keep` prompts, row ids for everything else.
fn answering_mock(kind: ProviderKind) -> MockProvider {
    MockProvider::new(kind).with_responder(|request| {
        if request.prompt.contains("Summarise") {
            Ok(envelope(vec![json!("ok"); request.expected_items]))
        } else if request.prompt.contains("Should we keep") {
            Ok(envelope(vec![json!(true); request.expected_items]))
        } else {
            lowest_id_first(request)
        }
    })
}

fn args(model: &str, batch_size: usize, prompt: &str) -> Vec<Value> {
    vec![
        json!({"model_name": model, "batch_size": batch_size, "tuple_format": "json"}),
        json!({"prompt": prompt, "context_columns": [{"data": "item"}]}),
    ]
}

fn rows(count: usize) -> Vec<Row> {
    (0..count)
        .map(|i| json!({"item": format!("row-{i}")}).as_object().unwrap().clone())
        .collect()
}

fn groups(sizes: &[usize]) -> Vec<Group> {
    sizes
        .iter()
        .enumerate()
        .map(|(i, &size)| Group::new(format!("group-{i}"), rows(size)))
        .collect()
}

#[tokio::test]
async fn test_empty_inputs_yield_no_rows() {
    let mock = answering_mock(ProviderKind::OpenAI);
    let engine = engine(&[&mock]);
    let empty_groups = groups(&[0, 0]);

    let call = engine.bind(FunctionKind::Complete, &args("gpt", 4, "Rewrite {item}")).unwrap();
    assert!(engine.llm_complete(&call, &[]).await.unwrap().is_empty());

    let call = engine.bind(FunctionKind::Filter, &args("gpt", 4, "Should we keep {item}?")).unwrap();
    assert!(engine.llm_filter(&call, &[]).await.unwrap().is_empty());

    let call = engine.bind(FunctionKind::Reduce, &args("gpt", 4, "Summarise")).unwrap();
    assert!(engine.llm_reduce(&call, &empty_groups).await.unwrap().is_empty());
    assert!(engine.llm_reduce(&call, &[]).await.unwrap().is_empty());

    let call = engine.bind(FunctionKind::First, &args("gpt", 4, "Best")).unwrap();
    assert!(engine.llm_first(&call, &empty_groups).await.unwrap().is_empty());

    let call = engine.bind(FunctionKind::Last, &args("gpt", 4, "Worst")).unwrap();
    assert!(engine.llm_last(&call, &empty_groups).await.unwrap().is_empty());

    let call = engine.bind(FunctionKind::Rerank, &args("gpt", 4, "Rank")).unwrap();
    assert!(engine.llm_rerank(&call, &empty_groups).await.unwrap().is_empty());

    assert_eq!(mock.call_count(), 0);
    assert_eq!(engine.flock_get_metrics(), json!({}));
}

#[rstest]
#[case(7, 1, 7)]
#[case(7, 2, 4)]
#[case(7, 3, 3)]
#[case(7, 7, 1)]
#[case(7, 10, 1)]
#[case(8, 4, 2)]
#[tokio::test]
async fn test_reduce_chunk_count(#[case] size: usize, #[case] batch_size: usize, #[case] chunks: usize) {
    let mock = answering_mock(ProviderKind::OpenAI);
    let engine = engine(&[&mock]);
    let call = engine
        .bind(FunctionKind::Reduce, &args("gpt", batch_size, "Summarise the rows"))
        .unwrap();

    let results = engine.llm_reduce(&call, &groups(&[size])).await.unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].key, "group-0");
    assert_eq!(results[0].value, "ok");
    assert_eq!(mock.call_count(), chunks);
    assert_eq!(engine.flock_get_metrics()["llm_reduce_1"]["api_calls"], chunks as u64);
}

#[tokio::test]
async fn test_first_with_single_chunk_of_three() {
    let mock = MockProvider::new(ProviderKind::OpenAI);
    mock.add_items(vec![json!(1)]);
    let engine = engine(&[&mock]);
    let call = engine.bind(FunctionKind::First, &args("gpt", 3, "Most urgent ticket")).unwrap();

    let results = engine.llm_first(&call, &groups(&[3])).await.unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].value.index, 1);
    assert_eq!(results[0].value.row["item"], "row-1");
    assert_eq!(mock.call_count(), 1);
    assert_eq!(offered_ids(&mock.get_calls()[0].prompt), vec![0, 1, 2]);
}

#[rstest]
#[case(1)]
#[case(2)]
#[case(3)]
#[case(5)]
#[case(16)]
#[tokio::test]
async fn test_selected_rows_come_from_their_group(#[case] batch_size: usize) {
    let mock = answering_mock(ProviderKind::OpenAI);
    let engine = engine(&[&mock]);
    let input = groups(&[1, 4, 9]);

    let first = engine.bind(FunctionKind::First, &args("gpt", batch_size, "Best")).unwrap();
    let last = engine.bind(FunctionKind::Last, &args("gpt", batch_size, "Worst")).unwrap();
    let results = [
        engine.llm_first(&first, &input).await.unwrap(),
        engine.llm_last(&last, &input).await.unwrap(),
    ];

    for selected in results {
        assert_eq!(selected.len(), 3);
        for (result, group) in selected.iter().zip(&input) {
            assert_eq!(result.key, group.key);
            assert_eq!(group.rows[result.value.index], result.value.row);
        }
    }
}

#[rstest]
#[case(1)]
#[case(2)]
#[case(3)]
#[case(4)]
#[case(6)]
#[case(50)]
#[tokio::test]
async fn test_rerank_is_a_permutation(#[case] batch_size: usize) {
    let mock = answering_mock(ProviderKind::OpenAI);
    let engine = engine(&[&mock]);
    let call = engine.bind(FunctionKind::Rerank, &args("gpt", batch_size, "Rank by urgency")).unwrap();

    let results = engine.llm_rerank(&call, &groups(&[11, 2])).await.unwrap();
    assert_eq!(results.len(), 2);
    for (result, size) in results.iter().zip([11, 2]) {
        let mut indices: Vec<usize> = result.value.iter().map(|r| r.index).collect();
        assert_eq!(indices.len(), size);
        indices.sort_unstable();
        assert_eq!(indices, (0..size).collect::<Vec<_>>());
    }
}

#[tokio::test]
async fn test_scalar_results_keep_row_order() {
    let mock = MockProvider::new(ProviderKind::OpenAI).with_responder(|request| {
        let ids = offered_ids(&request.prompt);
        Ok(envelope(ids.into_iter().map(|id| json!(id % 2 == 0)).collect()))
    });
    let providers = ProviderRegistry::empty();
    providers.register(Arc::new(mock.clone()));
    let settings = EngineSettings {
        vector_size: crate::batch::BatchSize::new(4).unwrap(),
        ..Default::default()
    };
    let fetcher = Arc::new(HttpMediaFetcher::new(Duration::from_secs(1)).unwrap());
    let engine = Flock::new(providers, fetcher, settings);
    engine.create_model("gpt", "gpt-4o-mini", ProviderKind::OpenAI).unwrap();

    let call = engine.bind(FunctionKind::Filter, &args("gpt", 3, "Should we keep {item}?")).unwrap();
    let kept = engine.llm_filter(&call, &rows(10)).await.unwrap();
    assert_eq!(kept, (0..10).map(|i| i % 2 == 0).collect::<Vec<_>>());

    // Fragments of 4, 4 and 2 rows, each in chunks of at most 3
    assert_eq!(mock.call_count(), 5);
    let debug = engine.flock_get_debug_metrics();
    let states: usize = debug["threads"]
        .as_object()
        .unwrap()
        .values()
        .map(|states| states.as_object().unwrap().len())
        .sum();
    assert_eq!(states, 3);
}

#[tokio::test]
async fn test_sequential_metrics_numbering() {
    let mock = answering_mock(ProviderKind::OpenAI);
    let engine = engine(&[&mock]);
    let input = rows(3);

    let calls: Vec<_> = (0..3)
        .map(|_| engine.bind(FunctionKind::Complete, &args("gpt", 2, "Rewrite {item}")).unwrap())
        .collect();
    for call in &calls {
        assert_ok!(engine.llm_complete(call, &input).await);
    }
    // Ollama has no provider registered, so this call site never records
    let filter = engine.bind(FunctionKind::Filter, &args("llama", 3, "Should we keep {item}?")).unwrap();
    let err = engine.llm_filter(&filter, &input).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::MissingSecret);

    let metrics = engine.flock_get_metrics();
    let keys: Vec<&String> = metrics.as_object().unwrap().keys().collect();
    assert_eq!(keys, vec!["llm_complete_1", "llm_complete_2", "llm_complete_3"]);
    for key in keys {
        let entry = &metrics[key.as_str()];
        assert_eq!(entry["api_calls"], 2);
        assert_eq!(entry["model_name"], "gpt");
        assert_eq!(entry["provider"], "openai");
        assert!(entry["input_tokens"].as_u64().unwrap() > 0);
    }
}

#[tokio::test]
async fn test_reset_clears_everything() {
    let mock = answering_mock(ProviderKind::OpenAI);
    let engine = engine(&[&mock]);
    let call = engine.bind(FunctionKind::Reduce, &args("gpt", 2, "Summarise")).unwrap();
    engine.llm_reduce(&call, &groups(&[5, 3, 4])).await.unwrap();
    assert_eq!(engine.flock_get_metrics()["llm_reduce_1"]["api_calls"], 3 + 2 + 2);

    let confirmation = engine.flock_reset_metrics();
    assert_eq!(confirmation, RESET_CONFIRMATION);
    assert!(confirmation.contains("reset"));
    assert_eq!(engine.flock_get_metrics(), json!({}));
    let debug = engine.flock_get_debug_metrics();
    assert_eq!(debug["thread_count"], 0);
    assert_eq!(debug["threads"], json!({}));

    // Numbering starts over after a reset, even for a call site that was numbered before
    let next = engine.bind(FunctionKind::Filter, &args("gpt", 2, "Should we keep {item}?")).unwrap();
    engine.llm_filter(&next, &rows(2)).await.unwrap();
    engine.llm_reduce(&call, &groups(&[2])).await.unwrap();
    let metrics = engine.flock_get_metrics();
    assert_eq!(metrics["llm_filter_1"]["api_calls"], 1);
    assert_eq!(metrics["llm_reduce_1"]["api_calls"], 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_groups_lose_no_updates() {
    let mock = answering_mock(ProviderKind::OpenAI);
    let engine = engine(&[&mock]);
    let call = engine.bind(FunctionKind::Reduce, &args("gpt", 1, "Summarise")).unwrap();
    let sizes = vec![3; 40];

    let results = engine.llm_reduce(&call, &groups(&sizes)).await.unwrap();
    assert_eq!(results.len(), 40);
    assert_eq!(engine.flock_get_metrics()["llm_reduce_1"]["api_calls"], 120);

    let debug = engine.flock_get_debug_metrics();
    let threads = debug["threads"].as_object().unwrap();
    assert_eq!(debug["thread_count"], threads.len());
    assert!(!threads.is_empty());

    let mut leaf_calls = 0;
    for states in threads.values() {
        for functions in states.as_object().unwrap().values() {
            let leaf = &functions["llm_reduce"];
            assert_eq!(leaf["registration_order"], 1);
            assert_eq!(leaf["sequential_id"], 1);
            leaf_calls += leaf["api_calls"].as_u64().unwrap();
        }
    }
    assert_eq!(leaf_calls, 120);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_failing_group_cancels_running_groups() {
    let mock = MockProvider::new(ProviderKind::OpenAI)
        .with_latency(Duration::from_millis(20))
        .with_responder(|request| {
            if request.prompt.contains("boom") {
                Err(Error::provider("OpenAI", "internal server error"))
            } else {
                Ok(envelope(vec![json!("ok")]))
            }
        });
    let engine = engine(&[&mock]);
    let call = engine.bind(FunctionKind::Reduce, &args("gpt", 1, "Summarise")).unwrap();

    // One group fails on its first call while 19 others each need ten sequential calls
    let mut input = vec![Group::new("broken", vec![json!({"item": "boom"}).as_object().unwrap().clone()])];
    input.extend(groups(&[10; 19]));

    let err = engine.llm_reduce(&call, &input).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ProviderFailure);
    assert!(err.to_string().contains("group broken"));

    // Cancelled groups make no further calls, even after they would have had time to
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(mock.call_count() < 2 * input.len(), "{} calls", mock.call_count());
}

#[tokio::test]
async fn test_structured_output_round_trip() {
    let mock = MockProvider::new(ProviderKind::OpenAI);
    mock.add_items(vec![json!({"capital": "Ottawa"})]);
    mock.add_items(vec![json!({"capital": "Ottawa 2"})]);
    let engine = engine(&[&mock]);

    let parameters = json!({
        "temperature": 0,
        "response_format": {
            "type": "json_schema",
            "json_schema": {
                "name": "capital",
                "strict": true,
                "schema": {
                    "type": "object",
                    "properties": {"capital": {"type": "string", "pattern": "^[A-Za-z]+$"}},
                    "required": ["capital"],
                    "additionalProperties": false
                }
            }
        }
    });
    let call = engine
        .bind(
            FunctionKind::Complete,
            &[
                json!({"model_name": "gpt", "model_parameters": parameters.to_string()}),
                json!({"prompt": "What is the capital of {country}?", "context_columns": [{"data": "country"}]}),
            ],
        )
        .unwrap();
    let canada: Vec<Row> = vec![json!({"country": "Canada"}).as_object().unwrap().clone()];

    let answers = engine.llm_complete(&call, &canada).await.unwrap();
    assert_eq!(answers, vec![r#"{"capital":"Ottawa"}"#.to_string()]);
    let request = &mock.get_calls()[0];
    assert!(request.schema.is_some());
    assert!(request.prompt.contains("What is the capital of Canada?"));

    let err = engine.llm_complete(&call, &canada).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::SchemaValidationFailure);
}

#[rstest]
#[case("gpt")]
#[case("llama")]
fn test_audio_without_transcription_model(#[case] model: &str) {
    let openai = MockProvider::new(ProviderKind::OpenAI);
    let ollama = MockProvider::new(ProviderKind::Ollama);
    let engine = engine(&[&openai, &ollama]);

    let err = engine
        .bind(
            FunctionKind::Complete,
            &[
                json!({"model_name": model}),
                json!({"prompt": "Summarise the call", "context_columns": [{"data": "recording", "type": "audio"}]}),
            ],
        )
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::MissingTranscriptionModel);
}

#[test]
fn test_audio_on_ollama_is_unsupported() {
    let openai = MockProvider::new(ProviderKind::OpenAI);
    let ollama = MockProvider::new(ProviderKind::Ollama);
    let engine = engine(&[&openai, &ollama]);

    let err = engine
        .bind(
            FunctionKind::Reduce,
            &[
                json!({"model_name": "llama"}),
                json!({
                    "prompt": "Summarise the calls",
                    "context_columns": [{"data": "recording", "type": "audio", "transcription_model": "llama"}]
                }),
            ],
        )
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UnsupportedCapability);
    assert!(err.to_string().contains("Ollama"));
}

#[tokio::test]
async fn test_failure_names_group_and_chunk() {
    let mock = MockProvider::new(ProviderKind::OpenAI);
    mock.add_items(vec![json!("first half")]);
    mock.add_items(vec![json!("first half"), json!("extra")]);
    let engine = engine(&[&mock]);
    let call = engine.bind(FunctionKind::Reduce, &args("gpt", 2, "Summarise")).unwrap();

    let err = engine
        .llm_reduce(&call, &[Group::new("region=EU", rows(4))])
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::MalformedBatchResponse);
    let message = err.to_string();
    assert!(message.contains("region=EU"));
    assert!(message.contains("chunk 1"));
}

#[tokio::test]
async fn test_call_must_match_function() {
    let mock = answering_mock(ProviderKind::OpenAI);
    let engine = engine(&[&mock]);
    let call = engine.bind(FunctionKind::Filter, &args("gpt", 2, "Should we keep {item}?")).unwrap();

    let err = engine.llm_complete(&call, &rows(2)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    assert_eq!(mock.call_count(), 0);
}

#[test]
fn test_unknown_model() {
    let mock = answering_mock(ProviderKind::OpenAI);
    let engine = engine(&[&mock]);
    let err = engine
        .bind(FunctionKind::Filter, &args("missing", 2, "Should we keep {item}?"))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UnknownModel);
}

#[tokio::test]
async fn test_embeddings_share_the_metrics_registry() {
    let mock = answering_mock(ProviderKind::OpenAI);
    let engine = engine(&[&mock]);
    let input = rows(5);

    let complete = engine.bind(FunctionKind::Complete, &args("gpt", 5, "Rewrite {item}")).unwrap();
    assert_ok!(engine.llm_complete(&complete, &input).await);
    let embed = engine
        .bind_embedding(&[
            json!({"model_name": "gpt", "batch_size": 2}),
            json!({"context_columns": [{"data": "item"}]}),
        ])
        .unwrap();
    let vectors = engine.llm_embedding(&embed, &input).await.unwrap();
    assert_eq!(vectors.len(), 5);

    let metrics = engine.flock_get_metrics();
    assert_eq!(metrics["llm_complete_1"]["api_calls"], 1);
    assert_eq!(metrics["llm_embedding_1"]["api_calls"], 3);
    assert_eq!(metrics["llm_embedding_1"]["output_tokens"], 0);

    assert_eq!(engine.flock_reset_metrics(), RESET_CONFIRMATION);
    assert_eq!(engine.flock_get_metrics(), json!({}));
}

#[test]
fn test_fusion_needs_no_provider() {
    let engine = engine(&[]);
    let fused = engine
        .fuse(FusionMethod::CombMnz, &[vec![Some(0.5), Some(0.0)], vec![Some(0.25), None]])
        .unwrap();
    assert_eq!(fused, vec![1.5, 0.0]);
    assert_eq!(engine.flock_get_metrics(), json!({}));
}
