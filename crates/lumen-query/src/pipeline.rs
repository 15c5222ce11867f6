//! Retrieval-augmented query pipeline.
//!
//! A query is embedded and searched once, the ranked hits are cut into
//! batches, and each batch is analyzed by the language model in order. Both
//! processors return pull-based streams: no LLM call happens until the
//! consumer asks for the next item, and dropping the stream stops the
//! pipeline.

use std::collections::VecDeque;
use std::sync::Arc;

use futures::stream::{self, BoxStream};
use futures::StreamExt;
use lumen_core::{
    AnalysisResult, LumenError, MetadataFilter, QueryConfig, SearchResult, StreamFragment,
};
use lumen_index::EmbeddingManager;
use tracing::{debug, error, info};

use crate::llm::{FragmentStream, LanguageModel};
use crate::prompt::{render_prompts, RenderedPrompt};

/// Where a query currently is. Logged at `debug` on every transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryPhase {
    /// Nothing has run yet.
    Init,
    /// Embedding the query text and searching the store.
    Searching,
    /// A batch has been rendered into this many prompts.
    BatchReady(usize),
    /// Waiting for a whole completion.
    LlmCall,
    /// Reading a streamed completion.
    LlmStreaming,
    /// Handing an item to the consumer.
    Yield,
    /// Every batch has been analyzed.
    Done,
    /// The query failed and the stream has ended.
    Error,
}

fn enter(phase: QueryPhase) {
    debug!(?phase, "query phase");
}

/// Keep the hits above `min_score`, at most `max_results` of them, and cut
/// them into batches of `batch_size`.
fn batch_results(mut results: Vec<SearchResult>, config: &QueryConfig) -> Vec<Vec<SearchResult>> {
    if let Some(min) = config.min_score {
        results.retain(|r| r.score >= min);
    }
    results.truncate(config.max_results);
    results
        .chunks(config.batch_size.max(1))
        .map(<[SearchResult]>::to_vec)
        .collect()
}

/// Run the search and render every prompt the query needs.
async fn prepare(
    manager: &EmbeddingManager,
    config: &QueryConfig,
    query: &str,
    filter: Option<&MetadataFilter>,
) -> Result<VecDeque<RenderedPrompt>, LumenError> {
    enter(QueryPhase::Searching);
    let limit = config.max_results.saturating_mul(2);
    let results = manager.similarity_search(query, limit, filter).await?;

    let mut prompts = VecDeque::new();
    for (index, batch) in batch_results(results, config).iter().enumerate() {
        let rendered = render_prompts(
            index,
            batch,
            query,
            config.prompt_type,
            config.prompt_provider,
        );
        enter(QueryPhase::BatchReady(rendered.len()));
        prompts.extend(rendered);
    }
    info!(prompts = prompts.len(), "query prepared");
    Ok(prompts)
}

/// Shared per-query state for both processors.
struct Run {
    manager: EmbeddingManager,
    llm: Arc<dyn LanguageModel>,
    config: QueryConfig,
    query: String,
    filter: Option<MetadataFilter>,
    prompts: Option<VecDeque<RenderedPrompt>>,
    finished: bool,
}

impl Run {
    fn new(
        manager: &EmbeddingManager,
        llm: &Arc<dyn LanguageModel>,
        config: &QueryConfig,
        query: &str,
        filter: Option<MetadataFilter>,
    ) -> Self {
        enter(QueryPhase::Init);
        Self {
            manager: manager.clone(),
            llm: Arc::clone(llm),
            config: config.clone(),
            query: query.to_string(),
            filter,
            prompts: None,
            finished: false,
        }
    }

    /// The next prompt to send, searching first if that has not happened.
    async fn next_prompt(&mut self) -> Option<Result<RenderedPrompt, LumenError>> {
        if self.finished {
            return None;
        }
        if self.prompts.is_none() {
            match prepare(&self.manager, &self.config, &self.query, self.filter.as_ref()).await {
                Ok(prompts) => self.prompts = Some(prompts),
                Err(e) => return Some(Err(self.fail(e))),
            }
        }
        match self.prompts.as_mut().and_then(VecDeque::pop_front) {
            Some(prompt) => Some(Ok(prompt)),
            None => {
                self.finished = true;
                enter(QueryPhase::Done);
                None
            }
        }
    }

    fn fail(&mut self, e: LumenError) -> LumenError {
        self.finished = true;
        enter(QueryPhase::Error);
        error!(query = %self.query, error = %e, "query aborted");
        e
    }
}

/// Answers a query with one [`AnalysisResult`] per rendered prompt.
#[derive(Clone)]
pub struct QueryProcessor {
    manager: EmbeddingManager,
    llm: Arc<dyn LanguageModel>,
    config: QueryConfig,
}

impl std::fmt::Debug for QueryProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryProcessor")
            .field("model", &self.llm.model())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl QueryProcessor {
    /// Build a processor over `manager` and `llm`.
    pub fn new(manager: EmbeddingManager, llm: Arc<dyn LanguageModel>, config: QueryConfig) -> Self {
        Self { manager, llm, config }
    }

    /// Analyze `query` batch by batch.
    ///
    /// The stream ends after the last batch, or right after the first error.
    /// An empty search result gives an empty stream.
    pub fn process(
        &self,
        query: &str,
        filter: Option<MetadataFilter>,
    ) -> BoxStream<'static, Result<AnalysisResult, LumenError>> {
        let run = Run::new(&self.manager, &self.llm, &self.config, query, filter);
        stream::unfold(run, |mut run| async move {
            let prompt = match run.next_prompt().await? {
                Ok(prompt) => prompt,
                Err(e) => return Some((Err(e), run)),
            };
            enter(QueryPhase::LlmCall);
            match run.llm.complete(&prompt.text).await {
                Ok(content) => {
                    enter(QueryPhase::Yield);
                    let result = AnalysisResult {
                        batch_index: prompt.batch_index,
                        content,
                        source_files: prompt.source_files,
                    };
                    Some((Ok(result), run))
                }
                Err(e) => {
                    let e = run.fail(e);
                    Some((Err(e), run))
                }
            }
        })
        .boxed()
    }
}

/// Answers a query with completion fragments as the model produces them.
#[derive(Clone)]
pub struct StreamQueryProcessor {
    manager: EmbeddingManager,
    llm: Arc<dyn LanguageModel>,
    config: QueryConfig,
}

impl std::fmt::Debug for StreamQueryProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamQueryProcessor")
            .field("model", &self.llm.model())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

struct StreamRun {
    run: Run,
    current: Option<(usize, FragmentStream)>,
}

impl StreamQueryProcessor {
    /// Build a processor over `manager` and `llm`.
    pub fn new(manager: EmbeddingManager, llm: Arc<dyn LanguageModel>, config: QueryConfig) -> Self {
        Self { manager, llm, config }
    }

    /// Stream the analysis of `query`, one prompt after another.
    ///
    /// Fragments keep their batch index so a consumer can tell batches
    /// apart. The stream ends right after the first error.
    pub fn stream(
        &self,
        query: &str,
        filter: Option<MetadataFilter>,
    ) -> BoxStream<'static, Result<StreamFragment, LumenError>> {
        let state = StreamRun {
            run: Run::new(&self.manager, &self.llm, &self.config, query, filter),
            current: None,
        };
        stream::unfold(state, |mut state| async move {
            loop {
                if let Some((batch_index, fragments)) = state.current.as_mut() {
                    let batch_index = *batch_index;
                    match fragments.next().await {
                        Some(Ok(text)) => {
                            enter(QueryPhase::Yield);
                            return Some((Ok(StreamFragment { batch_index, text }), state));
                        }
                        Some(Err(e)) => {
                            state.current = None;
                            let e = state.run.fail(e);
                            return Some((Err(e), state));
                        }
                        None => state.current = None,
                    }
                }

                let prompt = match state.run.next_prompt().await? {
                    Ok(prompt) => prompt,
                    Err(e) => return Some((Err(e), state)),
                };
                enter(QueryPhase::LlmStreaming);
                match state.run.llm.stream(&prompt.text).await {
                    Ok(fragments) => state.current = Some((prompt.batch_index, fragments)),
                    Err(e) => {
                        let e = state.run.fail(e);
                        return Some((Err(e), state));
                    }
                }
            }
        })
        .boxed()
    }
}
