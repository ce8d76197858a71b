#![expect(
    clippy::tests_outside_test_module,
    reason = "integration tests are only compiled in test mode"
)]

// Properties of the persisted path index, exercised through the public API
// with the offline hashed embedder.

use std::fs;
use std::path::Path;

use pathpilot::config::CorpusConfig;
use pathpilot::corpus::CorpusBuilder;
use pathpilot::embeddings::HashedEmbedder;
use pathpilot::index::{IndexStore, PathIndex, RetrievalHit, UpdateReport};
use tempfile::TempDir;

const DIMENSION: usize = 512;

const QUERIES: [&str; 5] = [
    "open the quarterly report",
    "holiday photos from the beach",
    "rust project manifest",
    "music playlist",
    "tax return 2023",
];

fn open_index(state: &Path, batch_size: usize) -> PathIndex {
    PathIndex::new(
        Box::new(HashedEmbedder::new(DIMENSION)),
        IndexStore::new(state.join("index")),
        batch_size,
    )
}

fn write_tree(root: &Path, files: &[&str]) {
    for file in files {
        let path = root.join(file);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("should create parent directories");
        }
        fs::write(&path, "").expect("should write fixture file");
    }
}

fn scan(root: &Path) -> Vec<String> {
    CorpusBuilder::from_config(&CorpusConfig {
        roots: vec![root.to_path_buf()],
        ..CorpusConfig::default()
    })
    .expect("corpus config should be valid")
    .scan()
    .expect("scan should succeed")
}

fn results(index: &mut PathIndex, k: usize) -> Vec<Vec<RetrievalHit>> {
    QUERIES
        .iter()
        .map(|query| index.search(query, k).expect("search should succeed"))
        .collect()
}

const INITIAL_FILES: [&str; 8] = [
    "Documents/reports/q1-report.docx",
    "Documents/reports/q2-report.docx",
    "Documents/taxes/2023-return.pdf",
    "Pictures/beach/holiday-001.jpg",
    "Pictures/beach/holiday-002.jpg",
    "Music/playlists/road-trip.m3u",
    "Projects/pathpilot/Cargo.toml",
    "Projects/pathpilot/src/main.rs",
];

const LATER_FILES: [&str; 3] = [
    "Documents/reports/q3-report.docx",
    "Pictures/beach/holiday-003.jpg",
    "Projects/website/package.json",
];

#[test]
fn scanned_tree_round_trips_through_storage() {
    let tree = TempDir::new().expect("should create TempDir successfully");
    let state = TempDir::new().expect("should create TempDir successfully");
    write_tree(tree.path(), &INITIAL_FILES);
    let corpus = scan(tree.path());

    let mut built = open_index(state.path(), 4);
    let report = built.build(&corpus).expect("build should succeed");
    assert_eq!(report.indexed, corpus.len());
    let expected = results(&mut built, 5);

    let mut loaded = open_index(state.path(), 4);
    assert!(loaded.load(), "committed generation should load");
    assert_eq!(loaded.paths(), built.paths());
    assert_eq!(results(&mut loaded, 5), expected);
}

#[test]
fn update_matches_build_of_union() {
    let tree = TempDir::new().expect("should create TempDir successfully");
    write_tree(tree.path(), &INITIAL_FILES);
    let before = scan(tree.path());
    write_tree(tree.path(), &LATER_FILES);
    let after = scan(tree.path());

    let incremental_state = TempDir::new().expect("should create TempDir successfully");
    let mut incremental = open_index(incremental_state.path(), 3);
    incremental.build(&before).expect("build should succeed");
    let report = incremental.update(&after).expect("update should succeed");
    assert_eq!(report.added, after.len() - before.len());

    let mut union = before.clone();
    union.extend(after.iter().filter(|path| !before.contains(path)).cloned());
    let full_state = TempDir::new().expect("should create TempDir successfully");
    let mut full = open_index(full_state.path(), 3);
    full.build(&union).expect("build should succeed");

    assert_eq!(incremental.len(), full.len());
    for (left, right) in results(&mut incremental, 4)
        .iter()
        .zip(results(&mut full, 4).iter())
    {
        let left_paths: Vec<&str> = left.iter().map(|hit| hit.path.as_str()).collect();
        let right_paths: Vec<&str> = right.iter().map(|hit| hit.path.as_str()).collect();
        assert_eq!(left_paths, right_paths);
    }

    let mut reloaded = open_index(incremental_state.path(), 3);
    assert!(reloaded.load(), "updated generation should load");
    assert_eq!(reloaded.len(), full.len());
    assert_eq!(reloaded.paths(), incremental.paths());
}

#[test]
fn results_are_bounded_and_sorted() {
    let tree = TempDir::new().expect("should create TempDir successfully");
    let state = TempDir::new().expect("should create TempDir successfully");
    write_tree(tree.path(), &INITIAL_FILES);
    let corpus = scan(tree.path());

    let mut index = open_index(state.path(), 100);
    index.build(&corpus).expect("build should succeed");

    for k in [1, 3, corpus.len(), corpus.len() + 10] {
        for hits in results(&mut index, k) {
            assert_eq!(hits.len(), k.min(corpus.len()));
            assert!(hits.windows(2).all(|w| w[0].distance <= w[1].distance));
        }
    }
}

#[test]
fn repeated_updates_do_not_grow_the_index() {
    let tree = TempDir::new().expect("should create TempDir successfully");
    let state = TempDir::new().expect("should create TempDir successfully");
    write_tree(tree.path(), &INITIAL_FILES);
    let corpus = scan(tree.path());

    let mut index = open_index(state.path(), 5);
    index.build(&corpus).expect("build should succeed");
    let generation = index.manifest().map(|m| m.generation);

    for _ in 0..3 {
        let report = index.update(&corpus).expect("update should succeed");
        assert_eq!(
            report,
            UpdateReport {
                added: 0,
                duplicates: corpus.len()
            }
        );
    }

    assert_eq!(index.len(), corpus.len());
    assert_eq!(index.manifest().map(|m| m.generation), generation);
}

#[test]
fn report_is_found_for_open_the_report() {
    let state = TempDir::new().expect("should create TempDir successfully");
    let mut index = open_index(state.path(), 10);
    index
        .build(&[
            "/home/u/Documents".to_string(),
            "/home/u/Documents/report.docx".to_string(),
            "/home/u/Downloads".to_string(),
        ])
        .expect("build should succeed");

    let hits = index.search("open the report", 3).expect("search should succeed");
    assert_eq!(hits.len(), 3);
    assert_eq!(hits[0].path, "/home/u/Documents/report.docx");
}

#[test]
fn interrupted_append_is_discarded() {
    let state = TempDir::new().expect("should create TempDir successfully");
    let mut index = open_index(state.path(), 10);
    index
        .build(&["/a/one".to_string(), "/a/two".to_string()])
        .expect("build should succeed");
    let manifest = index.manifest().cloned().expect("manifest after build");

    // Simulate a crash after bytes were written but before the manifest moved.
    let mut writer = index
        .store()
        .append_to(&manifest)
        .expect("writer should open");
    writer
        .append(&["/a/ghost".to_string()], &[vec![1.0; DIMENSION]])
        .expect("append should succeed");
    drop(writer);

    let mut reloaded = open_index(state.path(), 10);
    assert!(reloaded.load());
    assert_eq!(reloaded.paths(), ["/a/one", "/a/two"]);

    let report = reloaded
        .update(&["/a/three".to_string()])
        .expect("update should succeed");
    assert_eq!(report.added, 1);

    let mut again = open_index(state.path(), 10);
    assert!(again.load());
    assert_eq!(again.paths(), ["/a/one", "/a/two", "/a/three"]);
}
