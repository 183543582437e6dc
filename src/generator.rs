//! Generation orchestrator: owns the loaded model, the active chat's
//! in-memory transcript, and the single in-flight generation slot. Also
//! runs benchmark passes over the loaded model.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures::StreamExt;
use serde::Serialize;

use crate::context;
use crate::db::{BenchmarkResult, Database, Message, Model, Role};
use crate::engine::{ChatTurn, InferenceEngine, MemoryMonitor, VectorStore};
use crate::error::Result;

const RAG_TOP_K: usize = 5;

const BENCHMARK_ITERATIONS: u32 = 3;
const MEMORY_POLL_SECS: u64 = 3;
const BENCHMARK_SYSTEM_PROMPT: &str = "You are a helpful assistant.";
const BENCHMARK_USER_PROMPT: &str =
    "Write a short story about a lighthouse keeper who discovers a message in a bottle.";

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Metrics {
    pub tokens_per_second: f64,
    pub time_to_first_token_ms: f64,
}

/// One entry of the active chat's transcript. `client_id` identifies the
/// entry in memory from the moment it is created optimistically;
/// `id` is the storage row id, filled in once the entry persists.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatEntry {
    pub client_id: u64,
    pub id: Option<i64>,
    pub role: Role,
    pub content: String,
    pub model: Option<String>,
    pub metrics: Option<Metrics>,
    pub created_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Loading,
    Ready,
    Generating,
}

struct GeneratorInner {
    phase: Phase,
    model: Option<Model>,
    active_chat_id: Option<i64>,
    entries: Vec<ChatEntry>,
    next_client_id: u64,
}

pub struct Generator<E> {
    db: Arc<Database>,
    engine: E,
    memory: Arc<dyn MemoryMonitor>,
    inner: Mutex<GeneratorInner>,
}

/// Holds the generation slot. Dropping it releases the slot on every exit
/// path, including early returns and errors.
struct GenerationTicket<'a, E> {
    generator: &'a Generator<E>,
}

impl<E> Drop for GenerationTicket<'_, E> {
    fn drop(&mut self) {
        let mut inner = self.generator.inner.lock().unwrap();
        if inner.phase == Phase::Generating {
            inner.phase = Phase::Ready;
        }
    }
}

struct AbortOnDrop(tokio::task::JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

struct IterationStats {
    total_ms: f64,
    ttft_ms: f64,
    tokens: f64,
    tps: f64,
}

/// Incremental means over the benchmark iterations.
#[derive(Default)]
struct BenchmarkAverages {
    total_ms: f64,
    ttft_ms: f64,
    tokens: f64,
    tps: f64,
}

impl BenchmarkAverages {
    /// Fold one iteration in. `n` is the 1-based iteration index; it
    /// advances for failed iterations too, so a failure under-weights the
    /// samples that follow.
    fn record(&mut self, stats: &IterationStats, n: f64) {
        self.total_ms = running_mean(self.total_ms, stats.total_ms, n);
        self.ttft_ms = running_mean(self.ttft_ms, stats.ttft_ms, n);
        self.tokens = running_mean(self.tokens, stats.tokens, n);
        self.tps = running_mean(self.tps, stats.tps, n);
    }
}

impl<E: InferenceEngine> Generator<E> {
    pub fn new(db: Arc<Database>, engine: E, memory: Arc<dyn MemoryMonitor>) -> Self {
        Self {
            db,
            engine,
            memory,
            inner: Mutex::new(GeneratorInner {
                phase: Phase::Idle,
                model: None,
                active_chat_id: None,
                entries: Vec::new(),
                next_client_id: 0,
            }),
        }
    }

    pub fn phase(&self) -> Phase {
        self.inner.lock().unwrap().phase
    }

    pub fn active_model(&self) -> Option<Model> {
        self.inner.lock().unwrap().model.clone()
    }

    pub fn entries(&self) -> Vec<ChatEntry> {
        self.inner.lock().unwrap().entries.clone()
    }

    /// Load a model into the engine, tearing down whatever was there: an
    /// in-flight generation is interrupted and the previous model unloaded
    /// first. Failure leaves the orchestrator idle with no model.
    pub async fn load_model(&self, model: &Model) -> Result<()> {
        let previous = {
            let mut inner = self.inner.lock().unwrap();
            if inner.phase == Phase::Generating {
                // The interrupted call's ticket only releases the slot
                // while the phase is still Generating, so moving to
                // Loading here keeps it from clobbering this load.
                self.engine.interrupt();
            }
            inner.phase = Phase::Loading;
            inner.model.take()
        };

        if previous.is_some() {
            if let Err(e) = self.engine.unload().await {
                log::warn!("unloading previous model failed: {e}");
            }
        }

        match self.engine.load(model).await {
            Ok(()) => {
                let mut inner = self.inner.lock().unwrap();
                inner.model = Some(model.clone());
                inner.phase = Phase::Ready;
                log::info!("model {} ready", model.name);
                Ok(())
            }
            Err(e) => {
                log::error!("loading model {} failed: {e}", model.name);
                self.inner.lock().unwrap().phase = Phase::Idle;
                Err(e)
            }
        }
    }

    /// Switch the active chat, replacing the in-memory transcript with the
    /// chat's persisted messages. `None` clears the transcript.
    pub fn set_active_chat(&self, chat_id: Option<i64>) -> Result<()> {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.active_chat_id = chat_id;
            inner.entries.clear();
        }
        self.refresh_active_messages()
    }

    pub fn active_chat_id(&self) -> Option<i64> {
        self.inner.lock().unwrap().active_chat_id
    }

    /// Reload the active chat's transcript from storage. Used after
    /// out-of-band changes such as a source deletion inserting notices.
    pub fn refresh_active_messages(&self) -> Result<()> {
        let chat_id = self.inner.lock().unwrap().active_chat_id;
        let Some(chat_id) = chat_id else {
            return Ok(());
        };
        let messages = self.db.get_messages(chat_id)?;

        let mut inner = self.inner.lock().unwrap();
        let mut entries = Vec::with_capacity(messages.len());
        for message in messages {
            let client_id = inner.next_client_id;
            inner.next_client_id += 1;
            entries.push(entry_from_message(client_id, message));
        }
        inner.entries = entries;
        Ok(())
    }

    /// Ask the engine to stop the current generation. Fire-and-forget; the
    /// token stream ends on its own once the engine complies.
    pub fn interrupt(&self) {
        self.engine.interrupt();
    }

    /// Answer a user message in the active chat. Guard failures (no model
    /// ready, no active chat, generation already running) are silent
    /// no-ops; generation failures are logged and any partial output stays
    /// visible in the transcript.
    pub async fn send_chat_message(&self, store: &impl VectorStore, text: &str) {
        let Some(_ticket) = self.try_start(true) else {
            log::warn!("chat message dropped: generator not ready");
            return;
        };
        if let Err(e) = self.generate_reply(store, text).await {
            log::error!("generation failed: {e}");
        }
    }

    async fn generate_reply(&self, store: &impl VectorStore, text: &str) -> Result<()> {
        let (chat_id, model) = {
            let inner = self.inner.lock().unwrap();
            match (inner.active_chat_id, inner.model.clone()) {
                (Some(chat_id), Some(model)) => (chat_id, model),
                _ => return Ok(()),
            }
        };

        let user_row = self
            .db
            .persist_message(chat_id, Role::User, text, None, None, None)?;
        self.push_entry(Role::User, text.to_string(), None, Some(user_row), None);

        let settings = self.db.effective_chat_settings(chat_id)?;
        let source_ids = self.db.source_ids_for_chat(chat_id)?;
        let snippets = if source_ids.is_empty() {
            Vec::new()
        } else {
            match store.search(text, &source_ids, RAG_TOP_K).await {
                Ok(snippets) => snippets,
                Err(e) => {
                    log::warn!("context retrieval failed, generating without it: {e}");
                    Vec::new()
                }
            }
        };

        // Assemble before the placeholder exists so it is not part of the
        // history handed to the engine.
        let turns = {
            let inner = self.inner.lock().unwrap();
            context::assemble_generation_input(&inner.entries, &snippets, &settings, &model)
        };

        let placeholder = self.push_entry(
            Role::Assistant,
            String::new(),
            Some(model.name.clone()),
            None,
            None,
        );

        let started = Instant::now();
        let mut first_token: Option<Instant> = None;
        let mut token_count: u32 = 0;

        let mut stream = self.engine.generate(turns).await?;
        while let Some(delta) = stream.next().await {
            let delta = delta?;
            if delta.is_empty() {
                continue;
            }
            if first_token.is_none() {
                first_token = Some(Instant::now());
            }
            token_count += 1;
            self.append_to_entry(placeholder, &delta);
        }

        let metrics = compute_metrics(started, first_token, Instant::now(), token_count);
        let content = self.entry_content(placeholder).unwrap_or_default();
        let row_id = self.db.persist_message(
            chat_id,
            Role::Assistant,
            &content,
            Some(&model.name),
            Some(metrics.tokens_per_second),
            Some(metrics.time_to_first_token_ms),
        )?;
        self.finalize_entry(placeholder, row_id, metrics);
        Ok(())
    }

    /// Benchmark the loaded model: three generation passes over a canned
    /// prompt, averaged, with resident memory polled while they run. If no
    /// model is ready or a generation is in flight, returns a zeroed result
    /// without touching storage.
    pub async fn run_benchmark(&self) -> Result<BenchmarkResult> {
        let Some(_ticket) = self.try_start(false) else {
            return Ok(BenchmarkResult::default());
        };
        self.benchmark_passes().await
    }

    async fn benchmark_passes(&self) -> Result<BenchmarkResult> {
        let Some(model) = self.inner.lock().unwrap().model.clone() else {
            return Ok(BenchmarkResult::default());
        };
        let turns = vec![
            ChatTurn::new(Role::System, BENCHMARK_SYSTEM_PROMPT),
            ChatTurn::new(Role::User, BENCHMARK_USER_PROMPT),
        ];

        let mut averages = BenchmarkAverages::default();
        let mut peak_gb: f64 = 0.0;

        for i in 1..=BENCHMARK_ITERATIONS {
            let peak = Arc::new(Mutex::new(self.memory.resident_memory_gb()));
            let _poller = {
                let memory = Arc::clone(&self.memory);
                let peak = Arc::clone(&peak);
                AbortOnDrop(tokio::spawn(async move {
                    let mut ticker =
                        tokio::time::interval(Duration::from_secs(MEMORY_POLL_SECS));
                    ticker.tick().await;
                    loop {
                        ticker.tick().await;
                        let sample = memory.resident_memory_gb();
                        let mut peak = peak.lock().unwrap();
                        if sample > *peak {
                            *peak = sample;
                        }
                    }
                }))
            };

            let outcome = self.benchmark_iteration(turns.clone()).await;
            peak_gb = peak_gb.max(*peak.lock().unwrap());

            match outcome {
                Ok(stats) => averages.record(&stats, i as f64),
                Err(e) => log::error!("benchmark iteration {i} failed: {e}"),
            }
        }

        let mut result = BenchmarkResult {
            id: 0,
            model_id: Some(model.id),
            model_name: model.name.clone(),
            total_time_ms: averages.total_ms,
            time_to_first_token_ms: averages.ttft_ms,
            tokens_generated: averages.tokens,
            tokens_per_second: averages.tps,
            peak_memory_gb: peak_gb,
            created_at: chrono::Utc::now().timestamp_millis(),
        };
        result.id = self.db.insert_benchmark(&result)?;
        Ok(result)
    }

    async fn benchmark_iteration(&self, turns: Vec<ChatTurn>) -> Result<IterationStats> {
        let started = Instant::now();
        let mut first_token: Option<Instant> = None;
        let mut token_count: u32 = 0;

        let mut stream = self.engine.generate(turns).await?;
        while let Some(delta) = stream.next().await {
            let delta = delta?;
            if delta.is_empty() {
                continue;
            }
            if first_token.is_none() {
                first_token = Some(Instant::now());
            }
            token_count += 1;
        }

        let finished = Instant::now();
        let metrics = compute_metrics(started, first_token, finished, token_count);
        Ok(IterationStats {
            total_ms: finished.duration_since(started).as_secs_f64() * 1000.0,
            ttft_ms: metrics.time_to_first_token_ms,
            tokens: token_count as f64,
            tps: metrics.tokens_per_second,
        })
    }

    /// Claim the generation slot. Synchronous check-and-set under one lock;
    /// callers hold the returned ticket for the duration of the work.
    fn try_start(&self, needs_chat: bool) -> Option<GenerationTicket<'_, E>> {
        let mut inner = self.inner.lock().unwrap();
        if inner.phase != Phase::Ready || inner.model.is_none() {
            return None;
        }
        if needs_chat && inner.active_chat_id.is_none() {
            return None;
        }
        inner.phase = Phase::Generating;
        Some(GenerationTicket { generator: self })
    }

    fn push_entry(
        &self,
        role: Role,
        content: String,
        model: Option<String>,
        id: Option<i64>,
        metrics: Option<Metrics>,
    ) -> u64 {
        let mut inner = self.inner.lock().unwrap();
        let client_id = inner.next_client_id;
        inner.next_client_id += 1;
        inner.entries.push(ChatEntry {
            client_id,
            id,
            role,
            content,
            model,
            metrics,
            created_at: chrono::Utc::now().timestamp_millis(),
        });
        client_id
    }

    fn append_to_entry(&self, client_id: u64, delta: &str) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(entry) = inner.entries.iter_mut().find(|e| e.client_id == client_id) {
            entry.content.push_str(delta);
        }
    }

    fn entry_content(&self, client_id: u64) -> Option<String> {
        let inner = self.inner.lock().unwrap();
        inner
            .entries
            .iter()
            .find(|e| e.client_id == client_id)
            .map(|e| e.content.clone())
    }

    /// Reconcile an optimistic entry with its persisted row.
    fn finalize_entry(&self, client_id: u64, row_id: i64, metrics: Metrics) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(entry) = inner.entries.iter_mut().find(|e| e.client_id == client_id) {
            entry.id = Some(row_id);
            entry.metrics = Some(metrics);
        }
    }
}

fn entry_from_message(client_id: u64, message: Message) -> ChatEntry {
    let metrics = if message.role == Role::Assistant {
        Some(Metrics {
            tokens_per_second: message.tokens_per_second,
            time_to_first_token_ms: message.time_to_first_token,
        })
    } else {
        None
    };
    ChatEntry {
        client_id,
        id: Some(message.id),
        role: message.role,
        content: message.content,
        model: message.model,
        metrics,
        created_at: message.created_at,
    }
}

/// Time to first token is the wait before the first non-empty delta (the
/// whole call when nothing arrived); decode throughput is tokens over the
/// remaining time, floored at one millisecond.
fn compute_metrics(
    started: Instant,
    first_token: Option<Instant>,
    finished: Instant,
    tokens: u32,
) -> Metrics {
    let total_ms = finished.duration_since(started).as_secs_f64() * 1000.0;
    let ttft_ms = first_token
        .map(|t| t.duration_since(started).as_secs_f64() * 1000.0)
        .unwrap_or(total_ms);
    let decode_ms = (total_ms - ttft_ms).max(1.0);
    Metrics {
        tokens_per_second: tokens as f64 / (decode_ms / 1000.0),
        time_to_first_token_ms: ttft_ms,
    }
}

fn running_mean(avg: f64, sample: f64, n: f64) -> f64 {
    avg + (sample - avg) / n
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::ModelOrigin;
    use crate::engine::TokenStream;
    use futures::FutureExt;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::sync::Notify;

    struct FakeEngine {
        deltas: Vec<String>,
        gate: Option<Arc<Notify>>,
        loaded: Mutex<Vec<String>>,
        unload_count: AtomicUsize,
        interrupted: AtomicBool,
    }

    impl FakeEngine {
        fn replying(deltas: &[&str]) -> Self {
            Self {
                deltas: deltas.iter().map(|d| d.to_string()).collect(),
                gate: None,
                loaded: Mutex::new(Vec::new()),
                unload_count: AtomicUsize::new(0),
                interrupted: AtomicBool::new(false),
            }
        }

        fn gated(deltas: &[&str], gate: Arc<Notify>) -> Self {
            let mut engine = Self::replying(deltas);
            engine.gate = Some(gate);
            engine
        }
    }

    impl InferenceEngine for FakeEngine {
        async fn load(&self, model: &Model) -> Result<()> {
            self.loaded.lock().unwrap().push(model.name.clone());
            Ok(())
        }

        async fn generate(&self, _turns: Vec<ChatTurn>) -> Result<TokenStream> {
            let deltas = self.deltas.clone();
            match &self.gate {
                Some(gate) => {
                    let gate = Arc::clone(gate);
                    Ok(async move { gate.notified().await }
                        .into_stream()
                        .flat_map(move |_| {
                            futures::stream::iter(deltas.clone().into_iter().map(Ok))
                        })
                        .boxed())
                }
                None => Ok(futures::stream::iter(deltas.into_iter().map(Ok)).boxed()),
            }
        }

        fn interrupt(&self) {
            self.interrupted.store(true, Ordering::SeqCst);
        }

        async fn unload(&self) -> Result<()> {
            self.unload_count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeStore {
        snippets: Vec<String>,
    }

    impl VectorStore for FakeStore {
        async fn add(&self, _text: &str, _document_id: i64) -> Result<()> {
            Ok(())
        }

        async fn delete_document(&self, _document_id: i64) -> Result<()> {
            Ok(())
        }

        async fn search(
            &self,
            _query: &str,
            _document_ids: &[i64],
            _top_k: usize,
        ) -> Result<Vec<String>> {
            Ok(self.snippets.clone())
        }
    }

    struct FakeMemory(f64);

    impl MemoryMonitor for FakeMemory {
        fn resident_memory_gb(&self) -> f64 {
            self.0
        }
    }

    fn test_model(name: &str) -> Model {
        Model {
            id: 1,
            name: name.into(),
            origin: ModelOrigin::BuiltIn,
            is_downloaded: true,
            weights_uri: String::new(),
            tokenizer_uri: String::new(),
            tokenizer_config_uri: String::new(),
            param_count: None,
            size_bytes: None,
            featured: false,
            thinking: false,
        }
    }

    async fn ready_generator(engine: FakeEngine) -> (Arc<Generator<FakeEngine>>, i64) {
        let _ = env_logger::builder().is_test(true).try_init();
        let db = Arc::new(Database::in_memory().unwrap());
        let chat = db.create_chat(None, "test").unwrap();
        let generator = Generator::new(db, engine, Arc::new(FakeMemory(3.2)));
        generator.load_model(&test_model("fake")).await.unwrap();
        generator.set_active_chat(Some(chat.id)).unwrap();
        (Arc::new(generator), chat.id)
    }

    #[tokio::test]
    async fn reply_is_streamed_persisted_and_reconciled() {
        let (generator, chat_id) =
            ready_generator(FakeEngine::replying(&["Hel", "lo", " there"])).await;
        let store = FakeStore::default();

        generator.send_chat_message(&store, "hi").await;

        let entries = generator.entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].content, "Hello there");
        assert!(entries[1].id.is_some(), "assistant entry got its row id");
        assert!(entries[1].metrics.is_some());

        let messages = generator.db.get_messages(chat_id).unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, Role::User);
        assert_eq!(messages[1].content, "Hello there");
        assert!(messages[1].tokens_per_second > 0.0);
        assert_eq!(generator.phase(), Phase::Ready);
    }

    #[tokio::test]
    async fn concurrent_send_is_dropped_while_generating() {
        let gate = Arc::new(Notify::new());
        let (generator, chat_id) =
            ready_generator(FakeEngine::gated(&["reply"], Arc::clone(&gate))).await;
        let store = Arc::new(FakeStore::default());

        let g = Arc::clone(&generator);
        let s = Arc::clone(&store);
        let in_flight = tokio::spawn(async move { g.send_chat_message(&*s, "first").await });

        while generator.phase() != Phase::Generating {
            tokio::task::yield_now().await;
        }

        // Second request while the slot is taken: silently dropped.
        generator.send_chat_message(&*store, "second").await;

        gate.notify_one();
        in_flight.await.unwrap();

        let messages = generator.db.get_messages(chat_id).unwrap();
        let user_messages: Vec<_> = messages.iter().filter(|m| m.role == Role::User).collect();
        assert_eq!(user_messages.len(), 1);
        assert_eq!(user_messages[0].content, "first");
        assert_eq!(generator.phase(), Phase::Ready);
    }

    #[tokio::test]
    async fn send_without_active_chat_is_a_no_op() {
        let (generator, chat_id) = ready_generator(FakeEngine::replying(&["reply"])).await;
        generator.set_active_chat(None).unwrap();

        generator.send_chat_message(&FakeStore::default(), "hi").await;

        assert!(generator.db.get_messages(chat_id).unwrap().is_empty());
        assert_eq!(generator.phase(), Phase::Ready);
    }

    #[test]
    fn metrics_split_wait_and_decode_time() {
        let started = Instant::now();
        let first = started + Duration::from_millis(100);
        let finished = started + Duration::from_millis(1100);

        let metrics = compute_metrics(started, Some(first), finished, 50);
        assert!((metrics.time_to_first_token_ms - 100.0).abs() < 1e-6);
        assert!((metrics.tokens_per_second - 50.0).abs() < 1e-6);
    }

    #[test]
    fn metrics_with_no_tokens_charge_everything_to_the_wait() {
        let started = Instant::now();
        let finished = started + Duration::from_millis(500);

        let metrics = compute_metrics(started, None, finished, 0);
        assert!((metrics.time_to_first_token_ms - 500.0).abs() < 1e-6);
        assert_eq!(metrics.tokens_per_second, 0.0);
    }

    #[test]
    fn running_mean_divisor_counts_failed_iterations() {
        // Iteration 2 fails: its index still lands in the divisor, so the
        // third sample is under-weighted.
        let mut avg = 0.0;
        avg = running_mean(avg, 10.0, 1.0);
        // iteration 2 failed, nothing added
        avg = running_mean(avg, 20.0, 3.0);
        assert!((avg - 13.333333).abs() < 1e-5);
    }

    #[tokio::test]
    async fn benchmark_persists_an_averaged_row_with_peak_memory() {
        let (generator, _) = ready_generator(FakeEngine::replying(&["a", "b", "c"])).await;

        let result = generator.run_benchmark().await.unwrap();

        assert!(result.id > 0);
        assert_eq!(result.model_name, "fake");
        assert!((result.tokens_generated - 3.0).abs() < 1e-9);
        assert!((result.peak_memory_gb - 3.2).abs() < 1e-9);

        let stored = generator.db.list_benchmarks().unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].id, result.id);
        assert_eq!(generator.phase(), Phase::Ready);
    }

    #[tokio::test]
    async fn benchmark_without_a_model_is_a_zeroed_no_op() {
        let db = Arc::new(Database::in_memory().unwrap());
        let generator = Generator::new(
            Arc::clone(&db),
            FakeEngine::replying(&["x"]),
            Arc::new(FakeMemory(1.0)),
        );

        let result = generator.run_benchmark().await.unwrap();

        assert_eq!(result.id, 0);
        assert_eq!(result.tokens_generated, 0.0);
        assert!(db.list_benchmarks().unwrap().is_empty());
    }

    #[tokio::test]
    async fn loading_a_model_interrupts_an_inflight_generation() {
        let gate = Arc::new(Notify::new());
        let (generator, _) =
            ready_generator(FakeEngine::gated(&["partial"], Arc::clone(&gate))).await;
        let store = Arc::new(FakeStore::default());

        let g = Arc::clone(&generator);
        let s = Arc::clone(&store);
        let in_flight = tokio::spawn(async move { g.send_chat_message(&*s, "question").await });
        while generator.phase() != Phase::Generating {
            tokio::task::yield_now().await;
        }

        generator.load_model(&test_model("second")).await.unwrap();

        assert!(generator.engine.interrupted.load(Ordering::SeqCst));
        assert_eq!(generator.active_model().unwrap().name, "second");
        assert_eq!(generator.phase(), Phase::Ready);

        // The interrupted call winds down without disturbing the new model.
        gate.notify_one();
        in_flight.await.unwrap();
        assert_eq!(generator.phase(), Phase::Ready);
        assert_eq!(generator.active_model().unwrap().name, "second");
    }

    #[test]
    fn benchmark_average_is_the_arithmetic_mean_of_iteration_stats() {
        let samples = [
            IterationStats {
                total_ms: 1000.0,
                ttft_ms: 100.0,
                tokens: 30.0,
                tps: 33.0,
            },
            IterationStats {
                total_ms: 2000.0,
                ttft_ms: 200.0,
                tokens: 60.0,
                tps: 30.0,
            },
            IterationStats {
                total_ms: 3000.0,
                ttft_ms: 300.0,
                tokens: 90.0,
                tps: 31.0,
            },
        ];

        let mut averages = BenchmarkAverages::default();
        for (i, stats) in samples.iter().enumerate() {
            averages.record(stats, (i + 1) as f64);
        }

        assert!((averages.total_ms - 2000.0).abs() < 1e-9);
        assert!((averages.ttft_ms - 200.0).abs() < 1e-9);
        assert!((averages.tokens - 60.0).abs() < 1e-9);
        assert!((averages.tps - 94.0 / 3.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn loading_a_second_model_unloads_the_first() {
        let (generator, _) = ready_generator(FakeEngine::replying(&[])).await;

        generator.load_model(&test_model("second")).await.unwrap();

        assert_eq!(generator.engine.unload_count.load(Ordering::SeqCst), 1);
        let loaded = generator.engine.loaded.lock().unwrap().clone();
        assert_eq!(loaded, vec!["fake", "second"]);
        assert_eq!(generator.active_model().unwrap().name, "second");
    }

    #[tokio::test]
    async fn refresh_rebuilds_entries_from_storage() {
        let (generator, chat_id) = ready_generator(FakeEngine::replying(&[])).await;
        generator
            .db
            .persist_message(chat_id, Role::User, "q", None, None, None)
            .unwrap();
        generator
            .db
            .persist_message(chat_id, Role::Assistant, "a", Some("fake"), Some(9.0), Some(40.0))
            .unwrap();

        generator.refresh_active_messages().unwrap();

        let entries = generator.entries();
        assert_eq!(entries.len(), 2);
        assert!(entries[0].metrics.is_none());
        let metrics = entries[1].metrics.unwrap();
        assert_eq!(metrics.tokens_per_second, 9.0);
        assert_eq!(metrics.time_to_first_token_ms, 40.0);
    }

    #[tokio::test]
    async fn interrupt_reaches_the_engine() {
        let (generator, _) = ready_generator(FakeEngine::replying(&[])).await;
        generator.interrupt();
        assert!(generator.engine.interrupted.load(Ordering::SeqCst));
    }
}
