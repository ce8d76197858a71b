use super::*;

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

#[test]
fn deterministic_and_normalized() {
    let embedder = HashedEmbedder::new(1024);
    let first = embedder.embed_one("/home/u/Documents/report.docx");
    let second = embedder.embed_one("/home/u/Documents/report.docx");

    assert_eq!(first, second);
    assert_eq!(first.len(), 1024);
    let norm: f32 = first.iter().map(|v| v * v).sum::<f32>().sqrt();
    assert!((norm - 1.0).abs() < 1e-5);
}

#[test]
fn case_and_separators_are_ignored() {
    let embedder = HashedEmbedder::new(1024);
    let a = embedder.embed_one("Annual_Report");
    let b = embedder.embed_one("annual report");
    assert!((cosine(&a, &b) - 1.0).abs() < 1e-5);
}

#[test]
fn shared_words_are_closer() {
    let embedder = HashedEmbedder::new(1024);
    let query = embedder.embed_one("open the report");
    let report = embedder.embed_one("/home/u/Documents/report.docx");
    let downloads = embedder.embed_one("/home/u/Downloads");

    assert!(cosine(&query, &report) > cosine(&query, &downloads));
}

#[test]
fn empty_text_is_zero_vector() {
    let embedder = HashedEmbedder::new(64);
    let vector = embedder.embed_one("///");
    assert!(vector.iter().all(|v| *v == 0.0));
}

#[test]
fn embed_preserves_order() {
    let embedder = HashedEmbedder::new(256);
    let texts = vec!["alpha".to_string(), "beta".to_string()];
    let vectors = embedder.embed(&texts).expect("hashing never fails");

    assert_eq!(vectors.len(), 2);
    assert_eq!(vectors[0], embedder.embed_one("alpha"));
    assert_eq!(vectors[1], embedder.embed_one("beta"));
    assert_eq!(embedder.model_id(), "hashed-v1");
}
