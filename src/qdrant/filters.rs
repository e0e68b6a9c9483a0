//! Filter helpers for Qdrant point selection.

use serde_json::{Value, json};

use crate::pipeline::DocumentId;

/// Filter matching every point of one document.
pub fn document_filter(document_id: DocumentId) -> Value {
    json!({
        "must": [
            {
                "key": "document_id",
                "match": { "value": document_id.to_string() }
            }
        ]
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn document_filter_matches_on_keyword() {
        let id = DocumentId::new();
        let filter = document_filter(id);
        assert_eq!(filter["must"][0]["key"], "document_id");
        assert_eq!(filter["must"][0]["match"]["value"], id.to_string());
    }
}
