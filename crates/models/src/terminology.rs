//! Record shapes for the terminology sources: MeSH, UMLS, LOINC, ICD-11,
//! and SNOMED CT.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeshDescriptor {
    /// Descriptor UI, e.g. `D012345`.
    pub descriptor_ui: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tree_numbers: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope_note: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub terms: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UmlsConcept {
    /// Concept unique identifier, e.g. `C0004238`.
    pub cui: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub semantic_types: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub synonyms: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoincCode {
    pub loinc_num: String,
    pub component: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub property: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_aspect: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub long_common_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Icd11Entity {
    pub entity_id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub definition: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnomedConcept {
    /// SCTID, Verhoeff-checked.
    pub concept_id: String,
    /// Fully specified name.
    pub fsn: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_term: Option<String>,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module_id: Option<String>,
}

fn default_true() -> bool {
    true
}

pub fn is_mesh(value: &Value) -> bool {
    let Some(map) = value.as_object() else {
        return false;
    };
    map.get("descriptor_ui").map_or(false, Value::is_string)
        && map.get("name").map_or(false, Value::is_string)
}

pub fn is_umls(value: &Value) -> bool {
    let Some(map) = value.as_object() else {
        return false;
    };
    map.get("cui").map_or(false, Value::is_string) && map.get("name").map_or(false, Value::is_string)
}

pub fn is_loinc(value: &Value) -> bool {
    let Some(map) = value.as_object() else {
        return false;
    };
    map.get("loinc_num").map_or(false, Value::is_string)
        && map.get("component").map_or(false, Value::is_string)
}

pub fn is_icd11(value: &Value) -> bool {
    let Some(map) = value.as_object() else {
        return false;
    };
    map.get("entity_id").map_or(false, Value::is_string)
        && map.get("title").map_or(false, Value::is_string)
}

pub fn is_snomed(value: &Value) -> bool {
    let Some(map) = value.as_object() else {
        return false;
    };
    map.get("concept_id").map_or(false, Value::is_string)
        && map.get("fsn").map_or(false, Value::is_string)
}

pub fn is_terminology_family(value: &Value) -> bool {
    is_mesh(value) || is_umls(value) || is_loinc(value) || is_icd11(value) || is_snomed(value)
}
