//! TF-IDF Vector Store
//!
//! Sparse lexical vector space over one synthetic document per table.
//! Unigrams plus adjacent bigrams, smooth IDF, L2-normalised weights.

use lazy_static::lazy_static;
use regex::Regex;
use std::collections::{HashMap, HashSet};

/// term index -> weight
pub type SparseVector = HashMap<usize, f64>;

lazy_static! {
    static ref CAMEL_BOUNDARY: Regex = Regex::new(r"([a-z0-9])([A-Z])").unwrap();
    static ref NON_ALNUM: Regex = Regex::new(r"[^a-z0-9]+").unwrap();
    static ref STOP_WORDS: HashSet<&'static str> = [
        "a", "about", "all", "am", "an", "and", "any", "are", "as", "at", "be", "been", "by", "can",
        "could", "did", "do", "does", "each", "for", "from", "get", "give", "had", "has", "have",
        "how", "i", "in", "into", "is", "it", "its", "list", "me", "my", "of", "on", "or", "our",
        "please", "show", "should", "so", "some", "than", "that", "the", "their", "them", "then",
        "there", "these", "they", "this", "those", "to", "us", "was", "we", "were", "what", "when",
        "where", "which", "who", "whom", "why", "will", "with", "would", "you", "your",
    ]
    .into_iter()
    .collect();
}

/// Document in the store; `id` is the caller's key (table declaration index)
#[derive(Debug, Clone)]
struct Document {
    id: usize,
    vector: SparseVector,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SearchResult {
    pub id: usize,
    pub score: f64,
}

#[derive(Debug, Clone)]
pub struct TfIdfVectorStore {
    vocabulary: HashMap<String, usize>,
    idf: Vec<f64>,
    documents: Vec<Document>,
}

impl TfIdfVectorStore {
    /// Fit the vocabulary and IDF weights on `(id, text)` documents.
    pub fn build(corpus: Vec<(usize, String)>) -> Self {
        let tokenized: Vec<Vec<String>> = corpus.iter().map(|(_, text)| tokenize(text)).collect();

        let mut vocabulary: HashMap<String, usize> = HashMap::new();
        let mut document_frequency: Vec<usize> = Vec::new();
        for terms in &tokenized {
            let unique: HashSet<&String> = terms.iter().collect();
            // insertion follows first appearance so term ids are deterministic
            for term in terms {
                if !vocabulary.contains_key(term) {
                    vocabulary.insert(term.clone(), vocabulary.len());
                    document_frequency.push(0);
                }
            }
            for term in unique {
                document_frequency[vocabulary[term]] += 1;
            }
        }

        let n = corpus.len() as f64;
        let idf = document_frequency
            .iter()
            .map(|&df| ((1.0 + n) / (1.0 + df as f64)).ln() + 1.0)
            .collect();

        let mut store = Self {
            vocabulary,
            idf,
            documents: Vec::with_capacity(corpus.len()),
        };
        for ((id, _), terms) in corpus.into_iter().zip(tokenized) {
            let vector = store.weigh(&terms);
            store.documents.push(Document { id, vector });
        }
        store
    }

    /// Project arbitrary text into the fitted space; unknown terms are ignored.
    pub fn vectorize(&self, text: &str) -> SparseVector {
        self.weigh(&tokenize(text))
    }

    /// Score every document against `query`, best first. Ties keep insertion order.
    pub fn search(&self, query: &str) -> Vec<SearchResult> {
        let query_vector = self.vectorize(query);
        let mut results: Vec<SearchResult> = self
            .documents
            .iter()
            .map(|doc| SearchResult {
                id: doc.id,
                score: cosine_similarity(&query_vector, &doc.vector),
            })
            .collect();
        results.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        results
    }

    pub fn vocabulary_len(&self) -> usize {
        self.vocabulary.len()
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    fn weigh(&self, terms: &[String]) -> SparseVector {
        let mut vector: SparseVector = HashMap::new();
        for term in terms {
            if let Some(&idx) = self.vocabulary.get(term) {
                *vector.entry(idx).or_insert(0.0) += 1.0;
            }
        }
        for (idx, weight) in vector.iter_mut() {
            *weight *= self.idf[*idx];
        }
        let norm = vector.values().map(|w| w * w).sum::<f64>().sqrt();
        if norm > 0.0 {
            for weight in vector.values_mut() {
                *weight /= norm;
            }
        }
        vector
    }
}

/// Lower-cased unigrams (stop words dropped, lightly singularised) plus
/// adjacent bigrams.
pub fn tokenize(text: &str) -> Vec<String> {
    let split = CAMEL_BOUNDARY.replace_all(text, "$1 $2").to_lowercase();
    let words: Vec<String> = NON_ALNUM
        .split(&split)
        .filter(|w| !w.is_empty() && !STOP_WORDS.contains(w))
        .map(singularize)
        .collect();

    let mut terms = words.clone();
    terms.extend(words.windows(2).map(|pair| format!("{} {}", pair[0], pair[1])));
    terms
}

fn singularize(word: &str) -> String {
    if word.len() > 4 && word.ends_with("ies") {
        format!("{}y", &word[..word.len() - 3])
    } else if word.len() > 3 && word.ends_with('s') && !word.ends_with("ss") {
        word[..word.len() - 1].to_string()
    } else {
        word.to_string()
    }
}

pub fn cosine_similarity(a: &SparseVector, b: &SparseVector) -> f64 {
    let (small, large) = if a.len() <= b.len() { (a, b) } else { (b, a) };
    let dot: f64 = small
        .iter()
        .filter_map(|(idx, w)| large.get(idx).map(|v| w * v))
        .sum();
    let norm_a = a.values().map(|w| w * w).sum::<f64>().sqrt();
    let norm_b = b.values().map(|w| w * w).sum::<f64>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}
