//! Record shapes for the clinical sources: ClinicalTrials.gov, openFDA drug
//! labels, DailyMed SPL, RxNorm, and AccessGUDID. Each shape declares its
//! required keys as plain fields; optional keys are Option. Unknown keys in
//! upstream responses are dropped at deserialization.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// One study record from the ClinicalTrials.gov v2 API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClinicalTrialRecord {
    pub nct_id: String,
    pub brief_title: String,
    pub overall_status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub study_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub interventions: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lead_sponsor: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enrollment: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub brief_summary: Option<String>,
}

/// One drug-label result from the openFDA `/drug/label` endpoint. openFDA
/// wraps narrative sections as single-element string arrays; the shape keeps
/// them as lists rather than flattening.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenFdaRecord {
    pub id: String,
    pub set_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub effective_time: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub indications_and_usage: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub active_ingredient: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub openfda: Option<OpenFdaMeta>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenFdaMeta {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub brand_name: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub generic_name: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub manufacturer_name: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub product_ndc: Vec<String>,
}

/// A DailyMed structured product label, keyed by SPL set id and version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyMedSpl {
    pub set_id: String,
    pub spl_version: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_date: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sections: Vec<SplSection>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SplSection {
    /// LOINC code of the section, when the label declares one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loinc_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub text: String,
}

/// One RxNorm concept (RXCUI) with its term type and synonyms.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RxNormConcept {
    pub rxcui: String,
    pub name: String,
    pub tty: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub synonyms: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}

/// One device record from AccessGUDID, keyed by the primary device
/// identifier (a GTIN-14).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GudidDevice {
    pub primary_di: String,
    pub brand_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub company_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_model: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub identifiers: BTreeMap<String, Value>,
}

// Type guards. Pure structural checks on the discriminating required fields;
// they never fail and never allocate.

pub fn is_clinical_trial(value: &Value) -> bool {
    let Some(map) = value.as_object() else {
        return false;
    };
    map.get("nct_id").map_or(false, Value::is_string)
        && map.get("brief_title").map_or(false, Value::is_string)
}

pub fn is_openfda(value: &Value) -> bool {
    let Some(map) = value.as_object() else {
        return false;
    };
    map.get("id").map_or(false, Value::is_string) && map.get("set_id").map_or(false, Value::is_string)
}

pub fn is_dailymed(value: &Value) -> bool {
    let Some(map) = value.as_object() else {
        return false;
    };
    map.get("set_id").map_or(false, Value::is_string)
        && map.get("spl_version").map_or(false, Value::is_string)
        && map.get("title").map_or(false, Value::is_string)
}

pub fn is_rxnorm(value: &Value) -> bool {
    let Some(map) = value.as_object() else {
        return false;
    };
    map.get("rxcui").map_or(false, Value::is_string) && map.get("tty").map_or(false, Value::is_string)
}

pub fn is_gudid(value: &Value) -> bool {
    let Some(map) = value.as_object() else {
        return false;
    };
    map.get("primary_di").map_or(false, Value::is_string)
        && map.get("brand_name").map_or(false, Value::is_string)
}

/// Does this mapping belong to any clinical-family shape?
pub fn is_clinical_family(value: &Value) -> bool {
    is_clinical_trial(value)
        || is_openfda(value)
        || is_dailymed(value)
        || is_rxnorm(value)
        || is_gudid(value)
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn guard_accepts_minimal_study() {
        let study = json!({
            "nct_id": "NCT01234567",
            "brief_title": "A Study",
            "overall_status": "COMPLETED",
        });
        assert!(is_clinical_trial(&study));
        assert!(is_clinical_family(&study));

        let record: ClinicalTrialRecord = serde_json::from_value(study).unwrap();
        assert_eq!(record.nct_id, "NCT01234567");
        assert!(record.conditions.is_empty());
    }

    #[test]
    fn guard_rejects_wrong_shapes() {
        assert!(!is_clinical_trial(&json!("NCT01234567")));
        assert!(!is_clinical_trial(&json!({"nct_id": 123, "brief_title": "x"})));
        assert!(!is_clinical_trial(&json!({"pmid": "12345"})));
        assert!(!is_gudid(&json!({"primary_di": "10614141000415"})));
    }

    #[test]
    fn unknown_upstream_keys_are_dropped() {
        let record: RxNormConcept = serde_json::from_value(json!({
            "rxcui": "161",
            "name": "acetaminophen",
            "tty": "IN",
            "someNewApiField": {"nested": true},
        }))
        .unwrap();
        let back = serde_json::to_value(&record).unwrap();
        assert!(back.get("someNewApiField").is_none());
    }
}
