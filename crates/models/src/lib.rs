pub mod clinical;
pub mod guidelines;
pub mod literature;
pub mod terminology;
pub mod validate;

pub use clinical::{ClinicalTrialRecord, DailyMedSpl, GudidDevice, OpenFdaRecord, RxNormConcept};
pub use guidelines::{CdcSocrataRow, NiceGuideline, OpenPrescribingRow, WhoGhoIndicator};
pub use literature::{MedRxivPreprint, PmcFullText, PubMedArticle};
pub use terminology::{Icd11Entity, LoincCode, MeshDescriptor, SnomedConcept, UmlsConcept};
pub use validate::ValidationError;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// A normalized record produced by an adapter: the unit handed to the ledger
/// and to downstream subscribers. `raw` always carries the typed source
/// payload; there is no way to construct a Document without one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// Stable identifier, unique per source. Deterministic for well-known
    /// sources: `nct:NCT01234567`, `pmid:12345`.
    pub doc_id: String,
    /// Source name, matching the adapter registry key.
    pub source: String,
    /// Canonical URI of the source record.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
    /// Canonical text, when the source has one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    pub metadata: DocumentMetadata,
    /// The typed source payload.
    pub raw: AdapterPayload,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    /// When ingestion produced this Document.
    pub ingested_at: DateTime<Utc>,
    /// Upstream version stamp: ETag, last-update date, or release tag.
    pub source_version: String,
    /// SHA-256 of the raw response bytes, hex-encoded.
    pub content_hash: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl Document {
    pub fn new(
        doc_id: impl Into<String>,
        source: impl Into<String>,
        raw: impl Into<AdapterPayload>,
        metadata: DocumentMetadata,
    ) -> Self {
        Self {
            doc_id: doc_id.into(),
            source: source.into(),
            uri: None,
            content: None,
            metadata,
            raw: raw.into(),
        }
    }

    pub fn with_uri(mut self, uri: impl Into<String>) -> Self {
        self.uri = Some(uri.into());
        self
    }

    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = Some(content.into());
        self
    }

    /// SHA-256 of raw response bytes, hex-encoded, as recorded in
    /// `metadata.content_hash`.
    pub fn content_hash(raw_bytes: &[u8]) -> String {
        hex::encode(Sha256::digest(raw_bytes))
    }
}

macro_rules! payload_variants {
    ($( $Variant:ident => ($Record:ty, $family:literal, $as_fn:ident), )*) => {
        /// Closed union of the per-source record shapes. Serialized with a
        /// `family` discriminator so a Document's raw payload round-trips
        /// without guessing.
        #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
        #[serde(tag = "family")]
        pub enum AdapterPayload {
            $( #[serde(rename = $family)] $Variant($Record), )*
        }

        impl AdapterPayload {
            pub fn family(&self) -> &'static str {
                match self { $( Self::$Variant(_) => $family, )* }
            }

            $(
                pub fn $as_fn(&self) -> Option<&$Record> {
                    match self { Self::$Variant(record) => Some(record), _ => None }
                }
            )*
        }

        $(
            impl From<$Record> for AdapterPayload {
                fn from(record: $Record) -> Self { Self::$Variant(record) }
            }

            // Narrowing out of the union is fallible: a mismatched family is
            // a ValidationError, never a panic.
            impl TryFrom<AdapterPayload> for $Record {
                type Error = ValidationError;

                fn try_from(payload: AdapterPayload) -> Result<Self, Self::Error> {
                    match payload {
                        AdapterPayload::$Variant(record) => Ok(record),
                        other => Err(ValidationError::PayloadMismatch {
                            expected: $family,
                            actual: other.family(),
                        }),
                    }
                }
            }
        )*
    };
}

payload_variants! {
    ClinicalTrial => (ClinicalTrialRecord, "clinical_trial", as_clinical_trial),
    OpenFda => (OpenFdaRecord, "openfda_label", as_openfda),
    DailyMed => (DailyMedSpl, "dailymed_spl", as_dailymed),
    RxNorm => (RxNormConcept, "rxnorm_concept", as_rxnorm),
    Gudid => (GudidDevice, "gudid_device", as_gudid),
    PubMed => (PubMedArticle, "pubmed_article", as_pubmed),
    Pmc => (PmcFullText, "pmc_fulltext", as_pmc),
    MedRxiv => (MedRxivPreprint, "medrxiv_preprint", as_medrxiv),
    Mesh => (MeshDescriptor, "mesh_descriptor", as_mesh),
    Umls => (UmlsConcept, "umls_concept", as_umls),
    Loinc => (LoincCode, "loinc_code", as_loinc),
    Icd11 => (Icd11Entity, "icd11_entity", as_icd11),
    Snomed => (SnomedConcept, "snomed_concept", as_snomed),
    Nice => (NiceGuideline, "nice_guideline", as_nice),
    Cdc => (CdcSocrataRow, "cdc_socrata_row", as_cdc),
    WhoGho => (WhoGhoIndicator, "who_gho_indicator", as_who_gho),
    OpenPrescribing => (OpenPrescribingRow, "openprescribing_row", as_openprescribing),
}

#[cfg(test)]
mod test {
    use super::*;

    fn metadata() -> DocumentMetadata {
        DocumentMetadata {
            ingested_at: "2024-05-01T12:00:00Z".parse().unwrap(),
            source_version: "2024-04-30".into(),
            content_hash: Document::content_hash(b"{}"),
            extra: BTreeMap::new(),
        }
    }

    #[test]
    fn payload_round_trips_with_family_tag() {
        let payload = AdapterPayload::from(PubMedArticle {
            pmid: "12345".into(),
            title: "A trial of something".into(),
            abstract_text: None,
            journal: None,
            authors: vec![],
            pub_date: None,
            doi: None,
            mesh_terms: vec![],
            language: Some("en".into()),
        });

        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value["family"], "pubmed_article");
        assert_eq!(value["pmid"], "12345");

        let back: AdapterPayload = serde_json::from_value(value).unwrap();
        assert_eq!(back, payload);
        assert!(back.as_pubmed().is_some());
        assert!(back.as_snomed().is_none());
    }

    #[test]
    fn document_serialization_is_stable() {
        let doc = Document::new(
            "pmid:12345",
            "pubmed",
            PubMedArticle {
                pmid: "12345".into(),
                title: "A trial of something".into(),
                abstract_text: Some("Background.".into()),
                journal: Some("Lancet".into()),
                authors: vec!["Doe J".into()],
                pub_date: Some("2024-04-01".into()),
                doi: None,
                mesh_terms: vec!["Humans".into()],
                language: Some("en".into()),
            },
            metadata(),
        )
        .with_uri("https://pubmed.ncbi.nlm.nih.gov/12345/")
        .with_content("A trial of something\n\nBackground.");

        let value = serde_json::to_value(&doc).unwrap();
        assert_eq!(value["doc_id"], "pmid:12345");
        assert_eq!(value["source"], "pubmed");
        assert_eq!(value["raw"]["family"], "pubmed_article");
        assert_eq!(value["raw"]["abstract"], "Background.");
        assert_eq!(value["metadata"]["ingested_at"], "2024-05-01T12:00:00Z");
        // Empty optionals stay off the wire.
        assert!(value["raw"].get("doi").is_none());
        assert!(value["metadata"].get("extra").is_none());

        let back: Document = serde_json::from_value(value).unwrap();
        assert_eq!(back, doc);
    }

    #[test]
    fn content_hash_is_sha256_hex() {
        let hash = Document::content_hash(b"");
        assert_eq!(
            hash,
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
