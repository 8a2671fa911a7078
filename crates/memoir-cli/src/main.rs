//! # Memoir CLI
//!
//! Ingest transcripts into a conversation database and ask it questions.

mod vtt;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use tracing::info;

use memoir_core::{
    Conversation, ConversationSettings, KnowledgeExtractor, MessageCollection, StorageProvider,
};
use memoir_embed::{
    CachingEmbeddingModel, EmbeddingCache, EmbeddingClientConfig, EmbeddingModel,
    MockEmbeddingModel, OllamaEmbeddingClient,
};
use memoir_llm::{
    AnswerGenerator, AnswerType, LLMClient, LLMClientFactory, LLMConfig, LlmKnowledgeExtractor,
    SearchQueryTranslator,
};
use memoir_query::{
    compile_search_query, run_search_query, ConversationSearchResult,
    LanguageQueryCompileOptions, SearchOptions,
};
use memoir_store::{build_conversation_index, SqliteStorageProvider};

#[derive(Parser)]
#[command(name = "memoir", about = "Conversational memory: ingest transcripts, ask questions")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Clone)]
struct ModelArgs {
    /// LLM provider: ollama, openai or mock
    #[arg(long, default_value = "ollama")]
    llm_provider: String,

    /// LLM endpoint
    #[arg(long, default_value = "http://localhost:11434")]
    llm_endpoint: String,

    /// LLM model name
    #[arg(long, default_value = "llama3.2")]
    llm_model: String,

    /// Embedding model name
    #[arg(long, default_value = "nomic-embed-text")]
    embedding_model: String,

    /// Embedding vector dimension
    #[arg(long, default_value_t = 768)]
    embedding_dimension: usize,

    /// Run without any model endpoints: deterministic hash embeddings,
    /// no knowledge extraction, term-based queries
    #[arg(long)]
    offline: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Ingest WebVTT transcripts into a new conversation database
    Ingest {
        /// VTT files to ingest, in order
        files: Vec<PathBuf>,

        /// Database file to create; refuses to overwrite
        #[arg(short = 'd', long)]
        database: PathBuf,

        /// Name tag for the conversation
        #[arg(long)]
        name_tag: Option<String>,

        /// Wall-clock start of the recording (RFC 3339); cue offsets are
        /// added to it to produce message timestamps
        #[arg(long)]
        start_date: Option<String>,

        /// Skip LLM knowledge extraction, indexing metadata only
        #[arg(long)]
        no_extract: bool,

        #[command(flatten)]
        models: ModelArgs,
    },
    /// Ask a question against an ingested database
    Query {
        /// Database file to query
        #[arg(short = 'd', long)]
        database: PathBuf,

        /// The question to ask
        #[arg(short = 'q', long)]
        question: Option<String>,

        /// File with one question per line
        #[arg(long)]
        batch: Option<PathBuf>,

        /// Maximum knowledge matches per kind
        #[arg(long, default_value_t = 50)]
        max_knowledge_matches: usize,

        /// Maximum message matches
        #[arg(long, default_value_t = 25)]
        max_message_matches: usize,

        #[command(flatten)]
        models: ModelArgs,
    },
}

impl ModelArgs {
    fn embedding_model(&self) -> Result<Arc<dyn EmbeddingModel>> {
        let base: Arc<dyn EmbeddingModel> = if self.offline {
            Arc::new(MockEmbeddingModel::new(self.embedding_dimension))
        } else {
            Arc::new(OllamaEmbeddingClient::new(EmbeddingClientConfig {
                endpoint: self.llm_endpoint.clone(),
                model: self.embedding_model.clone(),
                dimension: self.embedding_dimension,
                ..Default::default()
            })?)
        };
        Ok(Arc::new(CachingEmbeddingModel::new(
            base,
            Arc::new(EmbeddingCache::new()),
        )))
    }

    fn llm_client(&self) -> Result<Arc<dyn LLMClient>> {
        LLMClientFactory::create_client(&LLMConfig {
            provider: self.llm_provider.clone(),
            endpoint: self.llm_endpoint.clone(),
            model: self.llm_model.clone(),
            ..Default::default()
        })
    }

    fn settings(&self) -> ConversationSettings {
        let mut settings = ConversationSettings::default();
        settings.message_text_index.embedding_dimension = self.embedding_dimension;
        if self.offline {
            // Hash embeddings score lower than real models; relax the
            // floors so matches survive.
            settings.message_text_index.min_score = 0.0;
            settings.related_term_index.min_score = 0.3;
        }
        settings
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let work = run(cli);
    tokio::select! {
        result = work => match result {
            Ok(code) => code,
            Err(e) => {
                eprintln!("error: {e:#}");
                ExitCode::from(2)
            }
        },
        _ = tokio::signal::ctrl_c() => {
            eprintln!("interrupted");
            ExitCode::from(1)
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    match cli.command {
        Commands::Ingest {
            files,
            database,
            name_tag,
            start_date,
            no_extract,
            models,
        } => {
            ingest(files, database, name_tag, start_date, no_extract, models).await?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Query {
            database,
            question,
            batch,
            max_knowledge_matches,
            max_message_matches,
            models,
        } => {
            let questions = gather_questions(question, batch)?;
            let options = SearchOptions {
                max_knowledge_matches: Some(max_knowledge_matches),
                max_message_matches: Some(max_message_matches),
                ..Default::default()
            };
            query(database, questions, options, models).await?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn gather_questions(question: Option<String>, batch: Option<PathBuf>) -> Result<Vec<String>> {
    let mut questions = Vec::new();
    if let Some(question) = question {
        questions.push(question);
    }
    if let Some(path) = batch {
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        questions.extend(
            content
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty() && !line.starts_with('#'))
                .map(String::from),
        );
    }
    if questions.is_empty() {
        bail!("provide --question or --batch");
    }
    Ok(questions)
}

async fn ingest(
    files: Vec<PathBuf>,
    database: PathBuf,
    name_tag: Option<String>,
    start_date: Option<String>,
    no_extract: bool,
    models: ModelArgs,
) -> Result<()> {
    if files.is_empty() {
        bail!("no input files given");
    }
    if database.exists() {
        bail!("database {} already exists", database.display());
    }
    let start_date: Option<DateTime<Utc>> = start_date
        .map(|s| {
            DateTime::parse_from_rfc3339(&s)
                .map(|t| t.with_timezone(&Utc))
                .map_err(|e| anyhow!("invalid --start-date: {e}"))
        })
        .transpose()?;

    let name_tag = name_tag.unwrap_or_else(|| {
        files[0]
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "conversation".into())
    });

    let model = models.embedding_model()?;
    let mut settings = models.settings();
    if no_extract || models.offline {
        settings.semantic_ref_index.auto_extract_knowledge = false;
    }

    let provider = Arc::new(
        SqliteStorageProvider::open(&database, &name_tag, model, &settings).await?,
    );
    let conversation = Conversation::new(name_tag.clone(), Vec::new(), provider.clone());

    let messages = provider.get_message_collection().await?;
    for file in &files {
        let parsed = vtt::parse_vtt_file(file, start_date)?;
        info!(file = %file.display(), messages = parsed.len(), "parsed transcript");
        messages.extend(parsed).await?;
    }

    let extractor: Option<Arc<dyn KnowledgeExtractor>> =
        if settings.semantic_ref_index.auto_extract_knowledge {
            Some(Arc::new(LlmKnowledgeExtractor::new(models.llm_client()?)))
        } else {
            None
        };

    let started = Instant::now();
    let counts = build_conversation_index(&conversation, &settings, extractor.as_ref()).await?;
    provider.touch_updated_at().await?;
    provider.close().await?;

    println!(
        "Ingested {} messages, {} semantic refs, {} terms into {} ({:.1}s)",
        counts.messages,
        counts.semantic_refs,
        counts.terms,
        database.display(),
        started.elapsed().as_secs_f64()
    );
    Ok(())
}

async fn query(
    database: PathBuf,
    questions: Vec<String>,
    options: SearchOptions,
    models: ModelArgs,
) -> Result<()> {
    if !database.exists() {
        bail!("database {} does not exist", database.display());
    }
    let model = models.embedding_model()?;
    let settings = models.settings();
    let provider = Arc::new(
        SqliteStorageProvider::open(&database, "", model, &settings).await?,
    );
    let metadata = provider.metadata().await?;
    let conversation = Conversation::new(metadata.name_tag, metadata.tags, provider.clone());

    let llm_client = (!models.offline).then(|| models.llm_client()).transpose()?;
    let translator = llm_client.clone().map(SearchQueryTranslator::new);
    let generator = llm_client.map(AnswerGenerator::new);

    for question in &questions {
        println!("# {question}");
        let results =
            answer_question(&conversation, question, &options, &translator, &generator).await?;
        print_results(&conversation, &results).await?;
        println!();
    }
    provider.close().await?;
    Ok(())
}

async fn answer_question(
    conversation: &Conversation,
    question: &str,
    options: &SearchOptions,
    translator: &Option<SearchQueryTranslator>,
    generator: &Option<AnswerGenerator>,
) -> Result<Vec<ConversationSearchResult>> {
    // Stage 1: user text -> structured query.
    let stage1 = Instant::now();
    let query_exprs = match translator {
        Some(translator) => {
            let structured = translator.translate(question, None).await?;
            compile_search_query(&structured, &LanguageQueryCompileOptions::default(), None)
        }
        // Offline: every word of the question becomes a search term.
        None => vec![memoir_query::SearchQueryExpr {
            select_expressions: vec![memoir_query::SearchSelectExpr {
                search_term_group: memoir_query::searchlib::create_or_term_group(
                    memoir_query::searchlib::create_search_terms(
                        &question
                            .split_whitespace()
                            .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()))
                            .filter(|w| !w.is_empty())
                            .collect::<Vec<_>>(),
                    )
                    .into_iter()
                    .map(memoir_query::SearchTermGroupEntry::Term)
                    .collect(),
                ),
                when: None,
            }],
            raw_query: Some(question.to_string()),
        }],
    };
    let stage1_elapsed = stage1.elapsed();

    // Stages 2-3: compile and execute.
    let stage3 = Instant::now();
    let mut results = Vec::new();
    for query_expr in query_exprs {
        results.extend(run_search_query(conversation, query_expr, options).await?);
    }
    let stage3_elapsed = stage3.elapsed();

    // Stage 4: answer generation.
    let stage4 = Instant::now();
    if let Some(generator) = generator {
        let answer = generator
            .generate_answer(conversation, question, &results)
            .await?;
        match answer.answer_type {
            AnswerType::Answered => {
                println!("{}", answer.answer.unwrap_or_default());
            }
            AnswerType::NoAnswer => {
                println!(
                    "No answer: {}",
                    answer.why_no_answer.unwrap_or_else(|| "unknown".into())
                );
            }
        }
    }
    let stage4_elapsed = stage4.elapsed();

    println!(
        "[timing] translate {:.2}s | search {:.2}s | answer {:.2}s",
        stage1_elapsed.as_secs_f64(),
        stage3_elapsed.as_secs_f64(),
        stage4_elapsed.as_secs_f64()
    );
    Ok(results)
}

async fn print_results(
    conversation: &Conversation,
    results: &[ConversationSearchResult],
) -> Result<()> {
    let messages = conversation.provider().get_message_collection().await?;
    for result in results {
        for (kind, matches) in &result.knowledge_matches {
            println!(
                "  {kind}: {} matches (terms: {})",
                matches.semantic_ref_matches.len(),
                matches
                    .term_matches
                    .iter()
                    .cloned()
                    .collect::<Vec<_>>()
                    .join(", ")
            );
        }
        for scored in result.message_matches.iter().take(5) {
            let message = messages.get(scored.message_ordinal).await?;
            let speaker = message.metadata.source().unwrap_or("unknown");
            println!(
                "  [{:>5.2}] #{} {}: {}",
                scored.score,
                scored.message_ordinal,
                speaker,
                message.text_chunks.join(" ")
            );
        }
    }
    Ok(())
}
