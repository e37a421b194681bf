//! Record shapes for the literature sources: PubMed, PMC full text, and
//! medRxiv preprints.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One citation from PubMed E-utilities.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PubMedArticle {
    pub pmid: String,
    pub title: String,
    /// Abstract text. Named to avoid the reserved word.
    #[serde(
        rename = "abstract",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub abstract_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub journal: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub authors: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pub_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doi: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mesh_terms: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}

/// A PMC open-access full-text article, flattened to titled sections.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PmcFullText {
    pub pmcid: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pmid: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sections: Vec<ArticleSection>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArticleSection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub text: String,
}

/// One preprint row from the medRxiv/bioRxiv details API. `server`
/// discriminates the hosting archive and is required by the guard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MedRxivPreprint {
    pub doi: String,
    pub title: String,
    pub server: String,
    #[serde(
        rename = "abstract",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub abstract_text: Option<String>,
    /// Authors as the API provides them: one semicolon-separated string.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authors: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
}

pub fn is_pubmed(value: &Value) -> bool {
    let Some(map) = value.as_object() else {
        return false;
    };
    map.get("pmid").map_or(false, Value::is_string) && map.get("title").map_or(false, Value::is_string)
}

pub fn is_pmc(value: &Value) -> bool {
    let Some(map) = value.as_object() else {
        return false;
    };
    map.get("pmcid").map_or(false, Value::is_string)
}

pub fn is_medrxiv(value: &Value) -> bool {
    let Some(map) = value.as_object() else {
        return false;
    };
    map.get("doi").map_or(false, Value::is_string) && map.get("server").map_or(false, Value::is_string)
}

pub fn is_literature_family(value: &Value) -> bool {
    is_pubmed(value) || is_pmc(value) || is_medrxiv(value)
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn pubmed_and_pmc_guards_discriminate() {
        let article = json!({"pmid": "12345", "title": "T"});
        let fulltext = json!({"pmcid": "PMC123", "title": "T"});

        assert!(is_pubmed(&article));
        assert!(!is_pubmed(&fulltext));
        assert!(is_pmc(&fulltext));
        assert!(!is_pmc(&article));
    }

    #[test]
    fn abstract_key_maps_to_abstract_text() {
        let article: PubMedArticle = serde_json::from_value(json!({
            "pmid": "12345",
            "title": "T",
            "abstract": "Background.",
        }))
        .unwrap();
        assert_eq!(article.abstract_text.as_deref(), Some("Background."));
    }
}
