use super::*;

#[test]
fn identical_vectors_are_fully_similar() {
    let v = [0.3, 0.4, 0.5];
    assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
}

#[test]
fn similarity_ignores_magnitude() {
    let a = [1.0, 2.0, 3.0];
    let b = [2.0, 4.0, 6.0];
    assert!((cosine_similarity(&a, &b) - 1.0).abs() < 1e-6);
}

#[test]
fn orthogonal_and_opposite() {
    assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
    assert!((cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]) + 1.0).abs() < 1e-6);
}

#[test]
fn degenerate_inputs_compare_as_zero() {
    assert!(cosine_similarity(&[1.0, 2.0], &[1.0]).abs() < f32::EPSILON);
    assert!(cosine_similarity(&[], &[]).abs() < f32::EPSILON);
    assert!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]).abs() < f32::EPSILON);
}

struct LenEmbedder;

#[async_trait]
impl Embedder for LenEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        Ok(vec![text.len() as f32, 1.0])
    }
}

#[tokio::test]
async fn default_batch_preserves_order() {
    let out = LenEmbedder
        .embed_batch(&["a".to_string(), "abc".to_string()])
        .await
        .unwrap();
    assert_eq!(out, vec![vec![1.0, 1.0], vec![3.0, 1.0]]);
}

#[test]
fn disabled_dedup_builds_no_embedder() {
    let dedup = DedupConfig::default();
    assert!(!dedup.enabled);
    assert!(embedder_from_config(&dedup).is_none());
}

#[cfg(not(feature = "embeddings"))]
#[test]
fn enabled_dedup_without_feature_builds_no_embedder() {
    let dedup = DedupConfig {
        enabled: true,
        ..DedupConfig::default()
    };
    assert!(embedder_from_config(&dedup).is_none());
}
