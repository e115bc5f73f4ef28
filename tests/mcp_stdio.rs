use std::path::{Path, PathBuf};

use coursedex::{
    DataDir, Pipeline,
    chunking::ChunkingConfig,
    embedding::{EmbedOptions, HashEmbedder},
};
use rmcp::{
    ServiceExt,
    model::CallToolRequestParams,
    transport::{ConfigureCommandExt, TokioChildProcess},
};
use serde_json::json;

fn setup_fixture(root: &Path) -> Result<PathBuf, Box<dyn std::error::Error>> {
    let source = root.join("module.txt");
    std::fs::write(
        &source,
        "Chapter 7 Recommender systems rank items for users.\n\
         Chapter 8 Computer vision detects edges in images.\n",
    )?;

    let data_dir = root.join("data");
    let dir = DataDir::resolve(Some(&data_dir), None)?;
    Pipeline::new(&dir, ChunkingConfig::default()).build(
        &source,
        &HashEmbedder::new(64),
        &EmbedOptions::default(),
    )?;

    Ok(data_dir)
}

#[tokio::test]
async fn mcp_stdio_search_roundtrip() -> Result<(), Box<dyn std::error::Error>>
{
    let tempdir = tempfile::tempdir()?;
    let data_dir = setup_fixture(tempdir.path())?;

    let bin = coursedex_bin()?;
    let transport = TokioChildProcess::new(
        tokio::process::Command::new(bin).configure(|cmd| {
            cmd.arg("mcp")
                .env("COURSEDEX_DATA_DIR", &data_dir)
                .env("COURSEDEX_EMBEDDING_PROVIDER", "hash")
                .env("COURSEDEX_EMBEDDING_DIMENSIONS", "64")
                .env("COURSEDEX_LOG", "warn")
                .env_remove("COURSEDEX_API_KEY")
                .env_remove("OPENAI_API_KEY");
        }),
    )?;

    let client = ().serve(transport).await?;

    let args = json!({
        "query": "computer vision detects edges in images",
        "limit": 1,
        "similarity": true
    });
    let result = client
        .peer()
        .call_tool(CallToolRequestParams {
            meta: None,
            name: "coursedex_search".into(),
            arguments: Some(args.as_object().unwrap().clone()),
            task: None,
        })
        .await?;

    let structured = result.structured_content.expect("structured content");
    let results = structured
        .get("results")
        .and_then(|v| v.as_array())
        .expect("results array");

    assert_eq!(results.len(), 1);
    assert_eq!(
        results[0].get("section").and_then(|v| v.as_str()),
        Some("Chapter 8")
    );

    // Without an API key the ask tool reports an error instead of answering.
    let ask_args = json!({ "question": "What is computer vision?" });
    let ask_result = client
        .peer()
        .call_tool(CallToolRequestParams {
            meta: None,
            name: "coursedex_ask".into(),
            arguments: Some(ask_args.as_object().unwrap().clone()),
            task: None,
        })
        .await;
    assert!(ask_result.is_err());

    client.cancel().await?;
    Ok(())
}

fn coursedex_bin() -> Result<PathBuf, Box<dyn std::error::Error>> {
    if let Ok(bin) = std::env::var("CARGO_BIN_EXE_coursedex") {
        return Ok(PathBuf::from(bin));
    }

    let mut path = std::env::current_exe()?;
    path.pop();
    if path.ends_with("deps") {
        path.pop();
    }
    path.push("coursedex");

    if cfg!(windows) {
        path.set_extension("exe");
    }

    Ok(path)
}
