//! Record shapes for guideline and knowledge-base sources: NICE guidance,
//! CDC Socrata datasets, the WHO Global Health Observatory, and
//! OpenPrescribing spending rows.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NiceGuideline {
    /// Guidance reference, e.g. `NG28`.
    pub guidance_id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guidance_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// One row of a CDC Socrata dataset. Socrata datasets are schemaless per
/// dataset, so the shape pins the row identity and keeps the columns as a
/// declared map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CdcSocrataRow {
    pub row_id: String,
    pub dataset_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub columns: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WhoGhoIndicator {
    pub indicator_code: String,
    /// Spatial dimension, typically an ISO country code.
    pub spatial_dim: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_dim: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub numeric_value: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenPrescribingRow {
    pub org_id: String,
    pub bnf_code: String,
    pub bnf_name: String,
    pub date: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quantity: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual_cost: Option<f64>,
}

pub fn is_nice(value: &Value) -> bool {
    let Some(map) = value.as_object() else {
        return false;
    };
    map.get("guidance_id").map_or(false, Value::is_string)
        && map.get("title").map_or(false, Value::is_string)
}

pub fn is_cdc(value: &Value) -> bool {
    let Some(map) = value.as_object() else {
        return false;
    };
    map.get("row_id").map_or(false, Value::is_string)
        && map.get("dataset_id").map_or(false, Value::is_string)
}

pub fn is_who_gho(value: &Value) -> bool {
    let Some(map) = value.as_object() else {
        return false;
    };
    map.get("indicator_code").map_or(false, Value::is_string)
        && map.get("spatial_dim").map_or(false, Value::is_string)
}

pub fn is_openprescribing(value: &Value) -> bool {
    let Some(map) = value.as_object() else {
        return false;
    };
    map.get("org_id").map_or(false, Value::is_string)
        && map.get("bnf_code").map_or(false, Value::is_string)
}

pub fn is_guideline_family(value: &Value) -> bool {
    is_nice(value) || is_cdc(value) || is_who_gho(value) || is_openprescribing(value)
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn socrata_columns_stay_typed_as_a_map() {
        let row: CdcSocrataRow = serde_json::from_value(json!({
            "row_id": "row-abcd.1234",
            "dataset_id": "9mfq-cb36",
            "columns": {"state": "GA", "tot_cases": "12345"},
        }))
        .unwrap();
        assert_eq!(row.columns["state"], json!("GA"));
    }

    #[test]
    fn guards_require_both_discriminants() {
        assert!(!is_cdc(&json!({"row_id": "row-1"})));
        assert!(!is_who_gho(&json!({"indicator_code": "WHOSIS_000001"})));
        assert!(is_openprescribing(
            &json!({"org_id": "14L", "bnf_code": "0212000AA", "bnf_name": "x", "date": "2024-01-01"})
        ));
    }
}
