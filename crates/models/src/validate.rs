//! Semantic validation: value-level invariants applied after a payload has
//! been structurally narrowed. Identifier grammars follow the upstream
//! registries; checksummed identifiers (SNOMED SCTID, GTIN-14) are verified
//! arithmetically rather than by pattern alone.

use crate::DocumentMetadata;
use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref NCT_RE: Regex = Regex::new(r"^NCT\d{8}$").unwrap();
    static ref PMID_RE: Regex = Regex::new(r"^\d{1,8}$").unwrap();
    static ref LOINC_RE: Regex = Regex::new(r"^\d{1,7}-\d$").unwrap();
    static ref SCTID_RE: Regex = Regex::new(r"^\d{6,18}$").unwrap();
    static ref GTIN14_RE: Regex = Regex::new(r"^\d{14}$").unwrap();
    static ref LANGUAGE_RE: Regex = Regex::new(r"^[a-z]{2}$").unwrap();
    static ref DOI_RE: Regex = Regex::new(r"^10\.\d{4,9}/\S+$").unwrap();
    static ref MESH_UI_RE: Regex = Regex::new(r"^[CD]\d{6,9}$").unwrap();
    static ref CUI_RE: Regex = Regex::new(r"^C\d{7}$").unwrap();
    static ref CONTENT_HASH_RE: Regex = Regex::new(r"^[0-9a-f]{64}$").unwrap();
}

#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum ValidationError {
    #[error("invalid {field} '{value}': {reason}")]
    InvalidIdentifier {
        field: &'static str,
        value: String,
        reason: String,
    },

    #[error("document metadata field {field} is missing or malformed")]
    InvalidMetadata { field: &'static str },

    #[error("payload family mismatch: expected {expected}, got {actual}")]
    PayloadMismatch {
        expected: &'static str,
        actual: &'static str,
    },
}

fn invalid(field: &'static str, value: &str, reason: impl Into<String>) -> ValidationError {
    ValidationError::InvalidIdentifier {
        field,
        value: value.to_string(),
        reason: reason.into(),
    }
}

pub fn nct_id(value: &str) -> Result<(), ValidationError> {
    if NCT_RE.is_match(value) {
        Ok(())
    } else {
        Err(invalid("nct_id", value, "must match NCT followed by 8 digits"))
    }
}

pub fn pmid(value: &str) -> Result<(), ValidationError> {
    if PMID_RE.is_match(value) {
        Ok(())
    } else {
        Err(invalid("pmid", value, "must be 1-8 digits"))
    }
}

pub fn loinc_code(value: &str) -> Result<(), ValidationError> {
    if LOINC_RE.is_match(value) {
        Ok(())
    } else {
        Err(invalid("loinc_num", value, "must match digits-hyphen-checkdigit"))
    }
}

pub fn language(value: &str) -> Result<(), ValidationError> {
    if LANGUAGE_RE.is_match(value) {
        Ok(())
    } else {
        Err(invalid("language", value, "must be a two-letter lowercase code"))
    }
}

pub fn doi(value: &str) -> Result<(), ValidationError> {
    if DOI_RE.is_match(value) {
        Ok(())
    } else {
        Err(invalid("doi", value, "must match 10.NNNN/suffix"))
    }
}

pub fn mesh_ui(value: &str) -> Result<(), ValidationError> {
    if MESH_UI_RE.is_match(value) {
        Ok(())
    } else {
        Err(invalid("descriptor_ui", value, "must match C/D followed by digits"))
    }
}

pub fn umls_cui(value: &str) -> Result<(), ValidationError> {
    if CUI_RE.is_match(value) {
        Ok(())
    } else {
        Err(invalid("cui", value, "must match C followed by 7 digits"))
    }
}

/// SNOMED CT identifier: 6-18 digits whose Verhoeff check digit verifies.
pub fn sctid(value: &str) -> Result<(), ValidationError> {
    if !SCTID_RE.is_match(value) {
        return Err(invalid("concept_id", value, "must be 6-18 digits"));
    }
    if !verhoeff_valid(value) {
        return Err(invalid("concept_id", value, "Verhoeff check digit mismatch"));
    }
    Ok(())
}

/// GTIN-14 device identifier: 14 digits whose GS1 mod-10 check digit verifies.
pub fn gtin14(value: &str) -> Result<(), ValidationError> {
    if !GTIN14_RE.is_match(value) {
        return Err(invalid("primary_di", value, "must be 14 digits"));
    }
    let digits: Vec<u32> = value.chars().map(|c| c.to_digit(10).unwrap()).collect();
    let sum: u32 = digits[..13]
        .iter()
        .enumerate()
        .map(|(i, d)| if i % 2 == 0 { d * 3 } else { *d })
        .sum();
    let check = (10 - sum % 10) % 10;
    if check != digits[13] {
        return Err(invalid("primary_di", value, "GS1 check digit mismatch"));
    }
    Ok(())
}

/// Required Document metadata: a version stamp and a well-formed SHA-256 hash.
/// `ingested_at` is structurally guaranteed by the type.
pub fn metadata(metadata: &DocumentMetadata) -> Result<(), ValidationError> {
    if metadata.source_version.is_empty() {
        return Err(ValidationError::InvalidMetadata {
            field: "source_version",
        });
    }
    if !CONTENT_HASH_RE.is_match(&metadata.content_hash) {
        return Err(ValidationError::InvalidMetadata {
            field: "content_hash",
        });
    }
    Ok(())
}

// Verhoeff dihedral-group tables.
const D: [[u8; 10]; 10] = [
    [0, 1, 2, 3, 4, 5, 6, 7, 8, 9],
    [1, 2, 3, 4, 0, 6, 7, 8, 9, 5],
    [2, 3, 4, 0, 1, 7, 8, 9, 5, 6],
    [3, 4, 0, 1, 2, 8, 9, 5, 6, 7],
    [4, 0, 1, 2, 3, 9, 5, 6, 7, 8],
    [5, 9, 8, 7, 6, 0, 4, 3, 2, 1],
    [6, 5, 9, 8, 7, 1, 0, 4, 3, 2],
    [7, 6, 5, 9, 8, 2, 1, 0, 4, 3],
    [8, 7, 6, 5, 9, 3, 2, 1, 0, 4],
    [9, 8, 7, 6, 5, 4, 3, 2, 1, 0],
];
const P: [[u8; 10]; 8] = [
    [0, 1, 2, 3, 4, 5, 6, 7, 8, 9],
    [1, 5, 7, 6, 2, 8, 3, 0, 9, 4],
    [5, 8, 0, 3, 7, 9, 6, 1, 4, 2],
    [8, 9, 1, 6, 0, 4, 3, 5, 2, 7],
    [9, 4, 5, 3, 1, 2, 6, 8, 7, 0],
    [4, 2, 8, 6, 5, 7, 3, 9, 0, 1],
    [2, 7, 9, 3, 8, 0, 6, 4, 1, 5],
    [7, 0, 4, 6, 9, 1, 3, 2, 5, 8],
];

fn verhoeff_valid(digits: &str) -> bool {
    let mut c = 0u8;
    for (i, ch) in digits.bytes().rev().enumerate() {
        let digit = (ch - b'0') as usize;
        c = D[c as usize][P[i % 8][digit] as usize];
    }
    c == 0
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn nct_grammar() {
        assert!(nct_id("NCT01234567").is_ok());
        assert!(nct_id("NCTXYZ").is_err());
        assert!(nct_id("NCT1234567").is_err());
        assert!(nct_id("nct01234567").is_err());
    }

    #[test]
    fn pmid_is_numeric() {
        assert!(pmid("12345").is_ok());
        assert!(pmid("1").is_ok());
        assert!(pmid("123456789").is_err());
        assert!(pmid("12a45").is_err());
    }

    #[test]
    fn loinc_grammar() {
        assert!(loinc_code("2160-0").is_ok());
        assert!(loinc_code("2160").is_err());
        assert!(loinc_code("2160-00").is_err());
    }

    #[test]
    fn sctid_verhoeff() {
        // Clinical finding and Diabetes mellitus, both published SCTIDs.
        assert!(sctid("404684003").is_ok());
        assert!(sctid("73211009").is_ok());
        // Same digits, corrupted check digit.
        assert!(sctid("404684004").is_err());
        assert!(sctid("12345").is_err());
    }

    #[test]
    fn gtin14_check_digit() {
        assert!(gtin14("10614141000415").is_ok());
        assert!(gtin14("10614141000416").is_err());
        assert!(gtin14("1061414100041").is_err());
    }

    #[test]
    fn language_and_doi() {
        assert!(language("en").is_ok());
        assert!(language("EN").is_err());
        assert!(language("eng").is_err());
        assert!(doi("10.1101/2024.01.02.24300789").is_ok());
        assert!(doi("doi:10.1101/x").is_err());
    }

    #[test]
    fn metadata_requires_version_and_hash() {
        let good = DocumentMetadata {
            ingested_at: chrono::Utc::now(),
            source_version: "2024-04-30".into(),
            content_hash: crate::Document::content_hash(b"x"),
            extra: Default::default(),
        };
        assert!(metadata(&good).is_ok());

        let mut bad = good.clone();
        bad.source_version.clear();
        assert!(matches!(
            metadata(&bad),
            Err(ValidationError::InvalidMetadata {
                field: "source_version"
            })
        ));

        let mut bad = good;
        bad.content_hash = "not-a-hash".into();
        assert!(matches!(
            metadata(&bad),
            Err(ValidationError::InvalidMetadata {
                field: "content_hash"
            })
        ));
    }
}
