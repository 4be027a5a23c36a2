use crate::database::{ChunkHit, ChunkStore};
use crate::services::embedding::Embedder;
use crate::services::rerank::Reranker;
use crate::utils::error::ServiceError;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

const MAX_QUERY_CHARS: usize = 10_000;
const CANDIDATE_MULTIPLIER: usize = 4;
const MAX_ADDITIONAL_URLS: usize = 10;
const CONTENT_SEPARATOR: &str = "\n\n---\n\n";
const UNTITLED: &str = "untitled";

/// One coalesced document excerpt: all retrieved chunks sharing a
/// `(url, title)` pair, joined in `chunk_index` order.
#[derive(Debug, Clone, Serialize)]
pub struct MergedGroup {
    pub id: i64,
    pub url: String,
    pub title: Option<String>,
    pub content: String,
    pub chunk_index: i32,
    pub total_chunks: i32,
    /// Distinct source chunk indices, ascending. Omitted for single chunks.
    pub merged_chunk_indices: Option<Vec<i32>>,
}

/// A merged group plus its 0-based position in the final ordering.
#[derive(Debug, Clone, Serialize)]
pub struct RankedResult {
    pub position: usize,
    pub group: MergedGroup,
}

/// A merged URL that did not make the final cut.
#[derive(Debug, Clone, Serialize)]
pub struct AdditionalUrl {
    pub url: String,
    pub title: Option<String>,
    pub character_count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchOutcome {
    pub results: Vec<RankedResult>,
    pub additional_urls: Vec<AdditionalUrl>,
}

/// Hybrid retrieval pipeline: concurrent semantic + keyword candidate
/// retrieval, semantic-priority merge, title coalescing, external rerank.
///
/// Either branch and the reranker may fail without failing the search; the
/// pipeline degrades to whatever evidence it still has.
pub struct SearchEngine {
    embedder: Arc<dyn Embedder>,
    chunks: Arc<dyn ChunkStore>,
    reranker: Arc<dyn Reranker>,
}

impl SearchEngine {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        chunks: Arc<dyn ChunkStore>,
        reranker: Arc<dyn Reranker>,
    ) -> Self {
        Self {
            embedder,
            chunks,
            reranker,
        }
    }

    pub async fn search(
        &self,
        query: &str,
        result_count: usize,
    ) -> Result<SearchOutcome, ServiceError> {
        let query = query.trim();
        if query.is_empty() {
            return Err(ServiceError::InvalidParams(
                "Query must not be empty".to_string(),
            ));
        }
        if query.chars().count() > MAX_QUERY_CHARS {
            return Err(ServiceError::InvalidParams(format!(
                "Query exceeds {} characters",
                MAX_QUERY_CHARS
            )));
        }

        // Callers clamp to [1, 10]; guard the internal bounds anyway.
        let result_count = result_count.clamp(1, 20);
        let pool_size = (result_count * CANDIDATE_MULTIPLIER) as i64;

        let semantic_branch = async {
            match self.embedder.embed(query).await {
                Ok(vector) => match self.chunks.semantic_search(vector, pool_size).await {
                    Ok(hits) => hits,
                    Err(e) => {
                        warn!("Semantic search failed, degrading to keyword only: {}", e);
                        Vec::new()
                    }
                },
                Err(e) => {
                    warn!("Query embedding failed, degrading to keyword only: {}", e);
                    Vec::new()
                }
            }
        };

        let keyword_branch = async {
            match self.chunks.keyword_search(query, pool_size).await {
                Ok(hits) => hits,
                Err(e) => {
                    warn!("Keyword search failed, degrading to semantic only: {}", e);
                    Vec::new()
                }
            }
        };

        let (semantic_hits, keyword_hits) = tokio::join!(semantic_branch, keyword_branch);

        debug!(
            semantic = semantic_hits.len(),
            keyword = keyword_hits.len(),
            "Candidate retrieval complete"
        );

        let merged = merge_candidates(semantic_hits, keyword_hits);
        let groups = coalesce_by_title(merged);

        if groups.is_empty() {
            return Ok(SearchOutcome {
                results: Vec::new(),
                additional_urls: Vec::new(),
            });
        }

        let documents: Vec<String> = groups.iter().map(|g| g.content.clone()).collect();
        let top_k = result_count.min(groups.len());

        let chosen: Vec<MergedGroup> =
            match self.reranker.rerank(query, &documents, top_k).await {
                Ok(entries) => entries
                    .into_iter()
                    .filter_map(|e| groups.get(e.index).cloned())
                    .collect(),
                Err(e) => {
                    warn!("Rerank failed, falling back to merge order: {}", e);
                    groups.iter().take(top_k).cloned().collect()
                }
            };

        let results: Vec<RankedResult> = chosen
            .into_iter()
            .take(result_count)
            .enumerate()
            .map(|(position, group)| RankedResult { position, group })
            .collect();

        let additional_urls = collect_additional_urls(&groups, &results);

        Ok(SearchOutcome {
            results,
            additional_urls,
        })
    }
}

/// Append semantic candidates first, then keyword candidates, skipping any
/// chunk id already emitted. Order within each branch is preserved.
fn merge_candidates(semantic: Vec<ChunkHit>, keyword: Vec<ChunkHit>) -> Vec<ChunkHit> {
    let mut seen: HashSet<i64> = HashSet::new();
    let mut merged = Vec::with_capacity(semantic.len() + keyword.len());

    for hit in semantic.into_iter().chain(keyword) {
        if seen.insert(hit.id) {
            merged.push(hit);
        }
    }

    merged
}

fn title_key(hit: &ChunkHit) -> String {
    match hit.title.as_deref().map(str::trim) {
        Some(t) if !t.is_empty() => t.to_string(),
        _ => UNTITLED.to_string(),
    }
}

/// Group merged candidates by `(url, title)`, preserving first-encounter
/// order, and collapse each group into one excerpt.
fn coalesce_by_title(merged: Vec<ChunkHit>) -> Vec<MergedGroup> {
    let mut order: Vec<(String, String)> = Vec::new();
    let mut buckets: HashMap<(String, String), Vec<ChunkHit>> = HashMap::new();

    for hit in merged {
        let key = (hit.url.clone(), title_key(&hit));
        if !buckets.contains_key(&key) {
            order.push(key.clone());
        }
        buckets.entry(key).or_default().push(hit);
    }

    order
        .into_iter()
        .filter_map(|key| buckets.remove(&key))
        .map(collapse_group)
        .collect()
}

fn collapse_group(members: Vec<ChunkHit>) -> MergedGroup {
    // The first member is the primary: it arrived earliest in the merge, so
    // it carries the semantic-before-keyword priority.
    let primary_id = members[0].id;
    let primary_url = members[0].url.clone();
    let primary_title = members[0].title.clone();
    let primary_total = members[0].total_chunks;

    let mut sorted = members;
    sorted.sort_by_key(|m| m.chunk_index);

    let content = sorted
        .iter()
        .map(|m| m.content.as_str())
        .collect::<Vec<_>>()
        .join(CONTENT_SEPARATOR);

    let mut indices: Vec<i32> = sorted.iter().map(|m| m.chunk_index).collect();
    indices.dedup();

    let (chunk_index, total_chunks) = derive_position(&indices, primary_total, sorted.len());

    let merged_chunk_indices = if indices.len() > 1 {
        Some(indices)
    } else {
        None
    };

    MergedGroup {
        id: primary_id,
        url: primary_url,
        title: primary_title,
        content,
        chunk_index,
        total_chunks,
        merged_chunk_indices,
    }
}

/// Derived `(chunk_index, total_chunks)` for a coalesced group:
/// single chunk keeps its own position; a complete document collapses to
/// `(0, 1)`; otherwise the group starts at its lowest index.
fn derive_position(indices: &[i32], primary_total: i32, member_count: usize) -> (i32, i32) {
    if member_count == 1 {
        return (indices[0], primary_total);
    }

    let complete = primary_total > 0
        && indices.len() == primary_total as usize
        && indices
            .iter()
            .enumerate()
            .all(|(i, &idx)| idx == i as i32);

    if complete {
        (0, 1)
    } else {
        (*indices.first().unwrap_or(&0), primary_total)
    }
}

/// URLs from the merged set that are absent from the final results, capped
/// and deduplicated.
fn collect_additional_urls(
    groups: &[MergedGroup],
    results: &[RankedResult],
) -> Vec<AdditionalUrl> {
    let final_urls: HashSet<&str> = results.iter().map(|r| r.group.url.as_str()).collect();
    let mut seen: HashSet<&str> = HashSet::new();
    let mut additional = Vec::new();

    for group in groups {
        if additional.len() >= MAX_ADDITIONAL_URLS {
            break;
        }
        if final_urls.contains(group.url.as_str()) || !seen.insert(group.url.as_str()) {
            continue;
        }
        additional.push(AdditionalUrl {
            url: group.url.clone(),
            title: group.title.clone(),
            character_count: group.content.chars().count(),
        });
    }

    additional
}
