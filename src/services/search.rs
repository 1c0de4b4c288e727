//! Hybrid retrieval: Reciprocal Rank Fusion over vector and keyword results.

use crate::DbConn;
use crate::error::Result;
use crate::models::message::MailMessage;
use crate::queries::messages;
use std::collections::HashMap;
use tracing::debug;

/// RRF constant; damps the contribution gap between neighboring ranks.
pub const RRF_K: f64 = 60.0;

/// Fuses two ranked id lists with weighted Reciprocal Rank Fusion:
/// `fused(d) = w_vec / (K + rank_vec(d)) + w_kw / (K + rank_kw(d))`,
/// ranks 1-based, missing terms contributing zero. Returns ids with fused
/// scores, best first.
pub fn rrf_fuse(
    vector_ranked: &[String],
    keyword_ranked: &[String],
    vector_weight: f64,
    keyword_weight: f64,
) -> Vec<(String, f64)> {
    let mut fused: HashMap<String, f64> = HashMap::new();

    for (rank, id) in vector_ranked.iter().enumerate() {
        let score = vector_weight / (RRF_K + (rank + 1) as f64);
        *fused.entry(id.clone()).or_insert(0.0) += score;
    }
    for (rank, id) in keyword_ranked.iter().enumerate() {
        let score = keyword_weight / (RRF_K + (rank + 1) as f64);
        *fused.entry(id.clone()).or_insert(0.0) += score;
    }

    let mut result: Vec<(String, f64)> = fused.into_iter().collect();
    // Stable order for equal scores so results are deterministic
    result.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal).then(a.0.cmp(&b.0)));
    result
}

/// Hybrid search: pull `retrieval_k` candidates from vector similarity and
/// weighted full-text search, fuse with RRF, return the top `limit` messages
/// with their fused scores.
pub async fn hybrid_search(
    conn: &mut DbConn,
    query_embedding: &[f32],
    query_text: &str,
    limit: i64,
    retrieval_k: i64,
    vector_weight: f64,
    keyword_weight: f64,
) -> Result<Vec<(MailMessage, f64)>> {
    let vector_results =
        messages::similarity_search(conn, query_embedding, retrieval_k, 0.0).await?;
    let keyword_results = messages::keyword_search(conn, query_text, retrieval_k, 0.0).await?;

    debug!(
        vector = vector_results.len(),
        keyword = keyword_results.len(),
        "hybrid search candidates"
    );

    let vector_ids: Vec<String> = vector_results.iter().map(|(m, _)| m.id.clone()).collect();
    let keyword_ids: Vec<String> = keyword_results.iter().map(|(m, _)| m.id.clone()).collect();

    let mut by_id: HashMap<String, MailMessage> = HashMap::new();
    for (message, _) in vector_results.into_iter().chain(keyword_results) {
        by_id.entry(message.id.clone()).or_insert(message);
    }

    let fused = rrf_fuse(&vector_ids, &keyword_ids, vector_weight, keyword_weight);

    Ok(fused
        .into_iter()
        .take(limit.max(0) as usize)
        .filter_map(|(id, score)| by_id.remove(&id).map(|m| (m, score)))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_rrf_agrees_with_formula_equal_weights() {
        // Vector ranks [A, B, C]; keyword ranks [B, D, A]; w = 0.5 each.
        let fused = rrf_fuse(&ids(&["A", "B", "C"]), &ids(&["B", "D", "A"]), 0.5, 0.5);

        let scores: HashMap<&str, f64> =
            fused.iter().map(|(id, s)| (id.as_str(), *s)).collect();

        let close = |a: f64, b: f64| (a - b).abs() < 1e-12;
        assert!(close(scores["A"], 0.5 / 61.0 + 0.5 / 63.0));
        assert!(close(scores["B"], 0.5 / 62.0 + 0.5 / 61.0));
        assert!(close(scores["C"], 0.5 / 63.0));
        assert!(close(scores["D"], 0.5 / 62.0));

        let order: Vec<&str> = fused.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(order, vec!["B", "A", "D", "C"]);
    }

    #[test]
    fn test_rrf_missing_terms_contribute_zero() {
        let fused = rrf_fuse(&ids(&["A"]), &[], 0.6, 0.4);
        assert_eq!(fused.len(), 1);
        assert!((fused[0].1 - 0.6 / 61.0).abs() < 1e-12);
    }

    #[test]
    fn test_rrf_weights_bias_the_winner() {
        // Same item at rank 1 in one list only; heavier arm wins.
        let fused = rrf_fuse(&ids(&["A"]), &ids(&["B"]), 0.6, 0.4);
        assert_eq!(fused[0].0, "A");
    }

    #[test]
    fn test_rrf_empty_inputs() {
        assert!(rrf_fuse(&[], &[], 0.5, 0.5).is_empty());
    }
}
