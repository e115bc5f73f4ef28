use std::sync::Arc;

use coursedex::{
    DataDir, Pipeline, Retriever, VectorIndex,
    chunking::{Chunk, ChunkingConfig},
    embedding::{EmbedOptions, Embedder, HashEmbedder, RetryPolicy},
    index_db::{INDEX_FILE, IndexDb},
};

const MODULE_TEXT: &str = "\
Module 2 overview page\n\n\
Chapter 7\n  Learning   Recommender Systems\tuse ratings\n\n\
Chapter 8\nPrinciples of Computer Vision detect edges\n";

fn setup(text: &str) -> (tempfile::TempDir, DataDir, std::path::PathBuf) {
    let tmp = tempfile::tempdir().unwrap();
    let data_dir =
        DataDir::resolve(Some(&tmp.path().join("data")), None).unwrap();
    let source = tmp.path().join("module.txt");
    std::fs::write(&source, text).unwrap();
    (tmp, data_dir, source)
}

#[test]
fn chapters_are_chunked_without_cross_tagging() {
    let (_tmp, data_dir, source) = setup(MODULE_TEXT);
    let config = ChunkingConfig {
        window: 5,
        overlap: 1,
    };

    let report = Pipeline::new(&data_dir, config).preprocess(&source).unwrap();

    assert_eq!(
        report.chunks,
        vec![
            Chunk::new("Chapter 7", "Chapter 7 Learning Recommender Systems"),
            Chunk::new("Chapter 7", "Systems use ratings"),
            Chunk::new("Chapter 8", "Chapter 8 Principles of Computer"),
            Chunk::new("Chapter 8", "Computer Vision detect edges"),
        ]
    );
    for chunk in &report.chunks {
        assert!(chunk.text.split(' ').count() <= 5);
        assert!(!chunk.text.contains("  "));
    }
}

#[test]
fn every_chunk_is_indexed_and_finds_itself() {
    let text: String = (0..12)
        .map(|c| {
            let words: Vec<String> =
                (0..50).map(|w| format!("c{c}w{w}")).collect();
            format!("Chapter {c} {}", words.join(" "))
        })
        .collect::<Vec<_>>()
        .join("\n");
    let (_tmp, data_dir, source) = setup(&text);

    let embedder = HashEmbedder::new(256);
    let (pre, idx) = Pipeline::new(&data_dir, ChunkingConfig::default())
        .build(&source, &embedder, &EmbedOptions::default())
        .unwrap();
    assert_eq!(pre.chunks.len(), 12);
    assert_eq!(idx.entries, 12);

    let db = IndexDb::open(&data_dir.index_dir().join(INDEX_FILE)).unwrap();
    let manifest = db.manifest().unwrap();
    assert_eq!(manifest.count, 12);
    assert_eq!(manifest.dimension, 256);
    assert_eq!(manifest.model, "hash-256");
    drop(db);

    let index = VectorIndex::load(&data_dir.index_dir()).unwrap();
    for (id, chunk) in pre.chunks.iter().enumerate() {
        assert_eq!(index.get(id as u64), Some(chunk));
        let query = embedder.embed(&chunk.text).unwrap();
        let hits = index.search(&query, 1).unwrap();
        assert_eq!(hits[0].id, id as u64);
    }
}

#[test]
fn retriever_over_persisted_index() {
    let (_tmp, data_dir, source) = setup(MODULE_TEXT);
    let embedder = HashEmbedder::new(128);
    Pipeline::new(
        &data_dir,
        ChunkingConfig {
            window: 5,
            overlap: 1,
        },
    )
    .build(&source, &embedder, &EmbedOptions::default())
    .unwrap();

    let index = Arc::new(VectorIndex::load(&data_dir.index_dir()).unwrap());
    let retriever =
        Retriever::new(index, Arc::new(embedder), RetryPolicy::none()).unwrap();

    let results = retriever
        .similarity("Computer Vision detect edges", 1)
        .unwrap();
    assert_eq!(results[0].id, 3);
    assert_eq!(results[0].chunk.section, "Chapter 8");

    let diverse = retriever.mmr("Recommender Systems", 3, 4, 0.5).unwrap();
    assert_eq!(diverse.len(), 3);
}

#[test]
fn rebuilding_replaces_the_index() {
    let (_tmp, data_dir, source) = setup(MODULE_TEXT);
    let pipeline = Pipeline::new(
        &data_dir,
        ChunkingConfig {
            window: 5,
            overlap: 1,
        },
    );
    pipeline
        .build(&source, &HashEmbedder::new(32), &EmbedOptions::default())
        .unwrap();

    std::fs::write(&source, "Chapter 9 Responsible AI").unwrap();
    pipeline
        .build(&source, &HashEmbedder::new(16), &EmbedOptions::default())
        .unwrap();

    let index = VectorIndex::load(&data_dir.index_dir()).unwrap();
    assert_eq!(index.len(), 1);
    assert_eq!(index.dimension(), 16);
    assert_eq!(index.get(0).unwrap().section, "Chapter 9");
}
