use std::{
    io::{BufRead, Write},
    process::ExitCode,
    sync::Arc,
};

use clap::Parser;
use coursedex::{
    chat::Tutor,
    chunk_store::ChunkStore,
    chunking::Chunk,
    cli::{self, Cli, Command, ConfigAction, SessionAction},
    config::{Config, EnvVars, SETTINGS},
    config_db::ConfigDb,
    data_dir::{DATA_DIR_ENV_VAR, DataDir},
    error::{self, Error},
    indexer::{build_embedder, build_language_model, embed_options},
    mcp,
    pipeline::Pipeline,
    retrieval::Retriever,
    search,
    session_store::SessionStore,
    text_util::truncate_chars,
    vector_index::VectorIndex,
};
use tracing_subscriber::EnvFilter;

const LOG_ENV_VAR: &str = "COURSEDEX_LOG";
const PREVIEW_CHARS: usize = 100;

fn init_tracing(verbose: u8, quiet: bool) {
    let filter = if let Ok(env) = std::env::var(LOG_ENV_VAR) {
        EnvFilter::new(env)
    } else if quiet {
        EnvFilter::new("warn")
    } else {
        match verbose {
            0 => EnvFilter::new("info"),
            1 => EnvFilter::new("debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .without_time()
        .init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> error::Result<()> {
    if let Command::Completions(args) = &cli.command {
        args.generate();
        return Ok(());
    }

    let env = EnvVars::from_process();
    let data_dir = DataDir::resolve(
        cli.data_dir.as_deref(),
        env.get(DATA_DIR_ENV_VAR),
    )?;
    let config_db = ConfigDb::open(&data_dir.config_db())?;
    let overrides = cli.overrides();

    // Settings can be repaired even when the stored ones fail to resolve.
    if let Command::Config { action } = &cli.command {
        return match action {
            ConfigAction::Show { json } => {
                let config = Config::resolve(&config_db, &env, &overrides)?;
                cmd_config_show(&config_db, &config, *json)
            }
            ConfigAction::Set { key, value } => {
                Config::validate_setting(&config_db, key, value)?;
                config_db.set_setting(key, value)?;
                println!("{key} = {value}");
                Ok(())
            }
            ConfigAction::Clear { key } => {
                if !config_db.remove_setting(key)? {
                    return Err(Error::NotFound {
                        kind: "setting",
                        name: key.clone(),
                    });
                }
                println!("Cleared {key}");
                Ok(())
            }
        };
    }

    let config = Config::resolve(&config_db, &env, &overrides)?;
    tracing::debug!(
        ?config,
        data_dir = %data_dir.root().display(),
        "resolved configuration"
    );
    let pipeline = Pipeline::new(&data_dir, config.chunking);

    match cli.command {
        Command::Preprocess(args) => {
            let report = pipeline.preprocess(&args.source)?;
            eprintln!(
                "Saved {} chunks from {} section(s) to {}",
                report.chunks.len(),
                report.sections,
                report.checkpoint.display()
            );
            print_chunk_preview(report.chunks.iter().take(args.preview));
        }
        Command::Index(args) => {
            let embedder = build_embedder(&config)?;
            let options = embed_options(&config.embedding, !cli.quiet);
            let report = pipeline.index(
                args.source.as_deref(),
                embedder.as_ref(),
                &options,
            )?;
            if report.reprocessed {
                eprintln!("Rebuilt the chunk checkpoint from the source.");
            }
            eprintln!(
                "Indexed {} chunks ({} dimensions, {}) into {}",
                report.entries,
                report.dimension,
                report.model,
                report.index_dir.display()
            );
        }
        Command::Build(args) => {
            let embedder = build_embedder(&config)?;
            let options = embed_options(&config.embedding, !cli.quiet);
            let (pre, idx) =
                pipeline.build(&args.source, embedder.as_ref(), &options)?;
            eprintln!(
                "Saved {} chunks from {} section(s); \
                 indexed {} ({} dimensions, {})",
                pre.chunks.len(),
                pre.sections,
                idx.entries,
                idx.dimension,
                idx.model
            );
            print_chunk_preview(pre.chunks.iter().take(args.preview));
        }
        Command::Search(args) => {
            let retriever = open_retriever(&data_dir, &config)?;
            let results = if args.similarity {
                retriever.similarity(&args.query, args.count)?
            } else {
                retriever.mmr(
                    &args.query,
                    args.count,
                    config.retrieval.fetch_k.max(args.count),
                    config.retrieval.lambda,
                )?
            };

            if args.json {
                println!("{}", search::format_json(&results, &args.query)?);
            } else {
                print!("{}", search::format_human(&results, &args.query));
            }
        }
        Command::Ask(args) => {
            let retriever = open_retriever(&data_dir, &config)?;
            let model = build_language_model(&config)?;
            let sessions =
                SessionStore::new(&config_db, config.chat.history_turns);
            let mut history = sessions.load(&args.session)?;

            let tutor = Tutor::new(
                &retriever,
                model.as_ref(),
                &config.chat,
                &config.retrieval,
            );
            let answer = tutor.ask(&mut history, &args.question)?;
            sessions.save(&args.session, &history)?;

            if args.json {
                println!("{}", serde_json::to_string(&answer)?);
            } else {
                print!("{}", search::format_answer(&answer));
            }
        }
        Command::Chat(args) => {
            let retriever = open_retriever(&data_dir, &config)?;
            let model = build_language_model(&config)?;
            let sessions =
                SessionStore::new(&config_db, config.chat.history_turns);
            let tutor = Tutor::new(
                &retriever,
                model.as_ref(),
                &config.chat,
                &config.retrieval,
            );
            cmd_chat(&tutor, &sessions, &args.session)?;
        }
        Command::Chunks(args) => {
            cmd_chunks(&pipeline.chunk_store(), &args)?;
        }
        Command::Session { action } => {
            let sessions =
                SessionStore::new(&config_db, config.chat.history_turns);
            cmd_session(&sessions, &action)?;
        }
        Command::Status(args) => {
            cmd_status(&data_dir, &pipeline.chunk_store(), args.json)?;
        }
        Command::Mcp => {
            let retriever = open_retriever(&data_dir, &config)?;
            let model =
                build_language_model(&config).map_err(|e| e.to_string());
            mcp::run_mcp(config, config_db, retriever, model)?;
        }
        // Handled before the configuration is resolved.
        Command::Config { .. } | Command::Completions(_) => {}
    }

    Ok(())
}

/// Load the persisted index and pair it with the configured embedder.
fn open_retriever(
    data_dir: &DataDir,
    config: &Config,
) -> error::Result<Retriever> {
    let index = VectorIndex::load(&data_dir.index_dir())?;
    tracing::info!(
        entries = index.len(),
        dimension = index.dimension(),
        model = index.model(),
        "loaded index"
    );
    let embedder = build_embedder(config)?;
    Retriever::new(
        Arc::new(index),
        Arc::from(embedder),
        config.embedding.retry,
    )
}

fn print_chunk_preview<'a>(chunks: impl Iterator<Item = &'a Chunk>) {
    for (i, chunk) in chunks.enumerate() {
        println!(
            "{i:>4} [{}] {}",
            chunk.section,
            truncate_chars(&chunk.text, PREVIEW_CHARS)
        );
    }
}

fn cmd_chat(
    tutor: &Tutor<'_>,
    sessions: &SessionStore<'_>,
    session: &str,
) -> error::Result<()> {
    let mut history = sessions.load(session)?;
    eprintln!(
        "Chatting in session '{session}' ({} earlier exchange(s)). \
         Type /clear to forget the history, /exit to quit.",
        history.len()
    );

    let stdin = std::io::stdin();
    let mut lines = stdin.lock().lines();
    loop {
        print!("> ");
        std::io::stdout().flush()?;

        let Some(line) = lines.next() else {
            println!();
            break;
        };
        let line = line?;
        match line.trim() {
            "" => continue,
            "/exit" | "/quit" => break,
            "/clear" => {
                history.clear();
                sessions.clear(session)?;
                println!("History cleared.");
            }
            question => match tutor.ask(&mut history, question) {
                Ok(answer) => {
                    print!("{}", search::format_answer(&answer));
                    sessions.save(session, &history)?;
                }
                // A failed question should not end the conversation.
                Err(e @ (Error::Upstream { .. } | Error::EmptyInput(_))) => {
                    eprintln!("error: {e}");
                }
                Err(e) => return Err(e),
            },
        }
    }
    Ok(())
}

fn cmd_chunks(store: &ChunkStore, args: &cli::ChunksArgs) -> error::Result<()> {
    let chunks = store.load()?.ok_or_else(|| Error::NotFound {
        kind: "chunk checkpoint",
        name: format!(
            "{} (run `coursedex preprocess` first)",
            store.path().display()
        ),
    })?;

    let matcher = args
        .section
        .as_deref()
        .map(|pattern| {
            globset::Glob::new(pattern)
                .map(|g| g.compile_matcher())
                .map_err(|e| {
                    Error::Config(format!(
                        "invalid section pattern '{pattern}': {e}"
                    ))
                })
        })
        .transpose()?;

    let selected: Vec<(usize, &Chunk)> = chunks
        .iter()
        .enumerate()
        .filter(|(_, c)| {
            matcher.as_ref().is_none_or(|m| m.is_match(&c.section))
        })
        .take(args.count.unwrap_or(usize::MAX))
        .collect();

    if args.json {
        let items: Vec<serde_json::Value> = selected
            .iter()
            .map(|(i, c)| {
                serde_json::json!({
                    "position": i,
                    "section": c.section,
                    "text": c.text,
                })
            })
            .collect();
        println!("{}", serde_json::to_string(&items)?);
    } else if selected.is_empty() {
        println!("No chunks match.");
    } else {
        for (i, chunk) in &selected {
            println!(
                "{i:>4} [{}] {}",
                chunk.section,
                truncate_chars(&chunk.text, PREVIEW_CHARS)
            );
        }
        println!("\n{} of {} chunk(s)", selected.len(), chunks.len());
    }
    Ok(())
}

fn cmd_session(
    sessions: &SessionStore<'_>,
    action: &SessionAction,
) -> error::Result<()> {
    match action {
        SessionAction::List => {
            let ids = sessions.list()?;
            if ids.is_empty() {
                println!("No saved sessions.");
            }
            for id in ids {
                println!("{id}");
            }
        }
        SessionAction::Show { id } => {
            let history = sessions.load(id)?;
            if history.is_empty() {
                println!("Session '{id}' has no history.");
            }
            for turn in history.turns() {
                println!("Q: {}\nA: {}\n", turn.question, turn.answer);
            }
        }
        SessionAction::Clear { id } => {
            if !sessions.clear(id)? {
                return Err(Error::NotFound {
                    kind: "session",
                    name: id.clone(),
                });
            }
            println!("Cleared session '{id}'");
        }
    }
    Ok(())
}

fn cmd_status(
    data_dir: &DataDir,
    store: &ChunkStore,
    json: bool,
) -> error::Result<()> {
    let checkpoint = match store.load() {
        Ok(Some(chunks)) => Ok(Some(chunks.len())),
        Ok(None) => Ok(None),
        Err(e) => Err(e.to_string()),
    };
    let index = match VectorIndex::load(&data_dir.index_dir()) {
        Ok(index) => Ok(Some(index)),
        Err(Error::IndexMissing(_)) => Ok(None),
        Err(e) => Err(e.to_string()),
    };
    let sample: Vec<(u64, &Chunk)> = match &index {
        Ok(Some(index)) => index.chunks().take(3).collect(),
        _ => Vec::new(),
    };

    if json {
        let index_json = match &index {
            Ok(Some(index)) => serde_json::json!({
                "entries": index.len(),
                "dimension": index.dimension(),
                "model": index.model(),
            }),
            Ok(None) => serde_json::Value::Null,
            Err(e) => serde_json::json!({ "error": e }),
        };
        let checkpoint_json = match &checkpoint {
            Ok(count) => serde_json::json!(count),
            Err(e) => serde_json::json!({ "error": e }),
        };
        let value = serde_json::json!({
            "data_dir": data_dir.root(),
            "chunks": checkpoint_json,
            "index": index_json,
            "sample": sample
                .iter()
                .map(|(id, c)| {
                    serde_json::json!({
                        "id": id,
                        "section": c.section,
                        "text": c.text,
                    })
                })
                .collect::<Vec<_>>(),
        });
        println!("{}", serde_json::to_string(&value)?);
        return Ok(());
    }

    println!("Data directory: {}", data_dir.root().display());
    match &checkpoint {
        Ok(Some(count)) => println!("Chunks: {count}"),
        Ok(None) => println!("Chunks: none (run `coursedex preprocess`)"),
        Err(e) => println!("Chunks: unreadable ({e})"),
    }
    match &index {
        Ok(Some(index)) => {
            println!("Index: {} entries", index.len());
            println!("  dimension: {}", index.dimension());
            println!("  model: {}", index.model());
        }
        Ok(None) => println!("Index: none (run `coursedex build`)"),
        Err(e) => println!("Index: unreadable ({e})"),
    }
    for (id, chunk) in sample {
        println!(
            "  #{id} [{}] {}",
            chunk.section,
            truncate_chars(&chunk.text, PREVIEW_CHARS)
        );
    }
    Ok(())
}

fn cmd_config_show(
    config_db: &ConfigDb,
    config: &Config,
    json: bool,
) -> error::Result<()> {
    let stored: std::collections::HashMap<String, String> =
        config_db.list_settings()?.into_iter().collect();

    if json {
        let mut map = serde_json::Map::new();
        for (key, _) in SETTINGS {
            let value = config
                .setting_value(key)
                .map_or(serde_json::Value::Null, Into::into);
            map.insert(key.to_string(), value);
        }
        map.insert("api_key_set".into(), config.api.api_key.is_some().into());
        println!("{}", serde_json::Value::Object(map));
        return Ok(());
    }

    for (key, description) in SETTINGS {
        let value =
            config.setting_value(key).unwrap_or_else(|| "-".to_string());
        let marker = if stored.contains_key(*key) { " (stored)" } else { "" };
        println!("{key} = {value}{marker}\n    {description}");
    }
    println!(
        "api key: {}",
        if config.api.api_key.is_some() { "set" } else { "not set" }
    );
    Ok(())
}
