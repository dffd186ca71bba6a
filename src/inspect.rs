//! Snippet inspection for a single sink document.
//!
//! Backs `wo-sync snippets <index> <id>`: loads the stored document,
//! re-derives its snippets (optionally restricted to one district or
//! neighborhood) and prints them with the aggregated toponyms.

use anyhow::{anyhow, Result};
use serde::Serialize;
use serde_json::json;

use wo_core::models::{CodeSet, Document};
use wo_core::snippets::{add_doc_snippets, aggregate_toponyms};
use wo_core::store::IndexService;

#[derive(Debug, Clone, Serialize)]
pub struct SnippetReport {
    pub id: String,
    pub index: String,
    pub districts: CodeSet,
    pub neighborhoods: CodeSet,
    pub toponyms: Vec<String>,
    /// `(field, snippets)` for every text record with at least one snippet.
    pub fields: Vec<(String, Vec<String>)>,
}

pub async fn inspect_snippets(
    index: &dyn IndexService,
    index_name: &str,
    id: &str,
    code: Option<&str>,
    context: usize,
) -> Result<SnippetReport> {
    let source = index
        .get(index_name, id)
        .await?
        .ok_or_else(|| anyhow!("document not found: {}", id))?;
    let mut doc = Document::from_hit(&json!({"_id": id, "_index": index_name, "_source": source}))?;

    add_doc_snippets(&mut doc.body, code, context);
    let toponyms = aggregate_toponyms(&doc.body, code);

    let body = &doc.body;
    let mut fields = Vec::new();
    if !body.record.snippets.is_empty() {
        fields.push(("body".to_string(), body.record.snippets.clone()));
    }
    if let Some(motion) = body.motion.as_ref().filter(|m| !m.snippets.is_empty()) {
        fields.push(("motion".to_string(), motion.snippets.clone()));
    }
    for (i, source) in body.sources.iter().enumerate() {
        if !source.snippets.is_empty() {
            fields.push((format!("sources[{}]", i), source.snippets.clone()));
        }
    }

    Ok(SnippetReport {
        id: doc.id.clone(),
        index: doc.index.clone(),
        districts: body.districts.clone().unwrap_or_default(),
        neighborhoods: body.neighborhoods.clone().unwrap_or_default(),
        toponyms,
        fields,
    })
}

pub fn print_snippets(report: &SnippetReport) {
    println!("--- Document ---");
    println!("id:            {}", report.id);
    println!("index:         {}", report.index);
    println!("districts:     {}", join(&report.districts));
    println!("neighborhoods: {}", join(&report.neighborhoods));
    println!("toponyms:      {}", report.toponyms.join(", "));
    println!();

    for (field, snippets) in &report.fields {
        println!("--- {} ({}) ---", field, snippets.len());
        for snippet in snippets {
            println!("{}", snippet);
        }
        println!();
    }
}

fn join(codes: &CodeSet) -> String {
    codes.iter().cloned().collect::<Vec<_>>().join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use wo_core::snippets::{HIGHLIGHT_CLOSE, HIGHLIGHT_OPEN};
    use wo_core::store::memory::MemoryIndex;

    fn stored() -> MemoryIndex {
        let index = MemoryIndex::new();
        index.insert(
            "wo_gm0363",
            "events",
            "d1",
            json!({
                "description": "De raad bespreekt de Dam. Daarna volgt het Vondelpark.",
                "districts": ["E03", "E05"],
                "annotations": [
                    {"toponym": "Dam", "districts": ["E03"], "postings": [[21, 24]]},
                    {"toponym": "Vondelpark", "districts": ["E05"], "postings": [[43, 53]]}
                ]
            }),
        );
        index
    }

    #[tokio::test]
    async fn restricts_to_code() {
        let index = stored();
        let report = inspect_snippets(&index, "wo_gm0363", "d1", Some("E03"), 70)
            .await
            .unwrap();
        assert_eq!(report.toponyms, vec!["Dam".to_string()]);
        assert_eq!(report.fields.len(), 1);
        let snippet = &report.fields[0].1[0];
        assert!(snippet.contains(&format!("{}Dam{}", HIGHLIGHT_OPEN, HIGHLIGHT_CLOSE)));
        assert!(!snippet.contains("Vondelpark"));
    }

    #[tokio::test]
    async fn missing_document_is_an_error() {
        let index = stored();
        let err = inspect_snippets(&index, "wo_gm0363", "nope", None, 70)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not found"));
    }
}
