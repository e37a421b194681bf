//! Clinical sources: ClinicalTrials.gov, openFDA drug labels, DailyMed SPL
//! listings, RxNorm concepts, and AccessGUDID devices.

use super::{fetched, metadata, parse_url, schema_error, str_param, u32_param, u64_param};
use crate::adapter::{Adapter, Dependencies, FetchStream, Fetched};
use crate::{pages, IngestError, Parameters};
use models::{validate, ClinicalTrialRecord, DailyMedSpl, Document, GudidDevice, OpenFdaRecord, RxNormConcept, ValidationError};
use serde::Deserialize;
use serde_json::Value;

fn mismatch(expected: &'static str, document: &Document) -> ValidationError {
    ValidationError::PayloadMismatch {
        expected,
        actual: document.raw.family(),
    }
}

// === ClinicalTrials.gov ===

pub struct ClinicalTrialsAdapter {
    client: fetch::Client,
}

// Boundary: ClinicalTrials.gov API v2 `/studies` responses, JSON schema as
// published 2024-01. Only the modules this adapter maps are declared; the
// rest of the study payload is ignored.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CtgovStudy {
    protocol_section: CtgovProtocolSection,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CtgovProtocolSection {
    identification_module: CtgovIdentification,
    status_module: CtgovStatus,
    #[serde(default)]
    design_module: Option<CtgovDesign>,
    #[serde(default)]
    conditions_module: Option<CtgovConditions>,
    #[serde(default)]
    arms_interventions_module: Option<CtgovArms>,
    #[serde(default)]
    sponsor_collaborators_module: Option<CtgovSponsor>,
    #[serde(default)]
    description_module: Option<CtgovDescription>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CtgovIdentification {
    nct_id: String,
    brief_title: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CtgovStatus {
    overall_status: String,
    #[serde(default)]
    start_date_struct: Option<CtgovDate>,
    #[serde(default)]
    completion_date_struct: Option<CtgovDate>,
    #[serde(default)]
    last_update_post_date_struct: Option<CtgovDate>,
}

#[derive(Deserialize)]
struct CtgovDate {
    date: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CtgovDesign {
    #[serde(default)]
    study_type: Option<String>,
    #[serde(default)]
    phases: Vec<String>,
    #[serde(default)]
    enrollment_info: Option<CtgovEnrollment>,
}

#[derive(Deserialize)]
struct CtgovEnrollment {
    #[serde(default)]
    count: Option<u64>,
}

#[derive(Deserialize)]
struct CtgovConditions {
    #[serde(default)]
    conditions: Vec<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CtgovArms {
    #[serde(default)]
    interventions: Vec<CtgovIntervention>,
}

#[derive(Deserialize)]
struct CtgovIntervention {
    name: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CtgovSponsor {
    #[serde(default)]
    lead_sponsor: Option<CtgovLeadSponsor>,
}

#[derive(Deserialize)]
struct CtgovLeadSponsor {
    #[serde(default)]
    name: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CtgovDescription {
    #[serde(default)]
    brief_summary: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CtgovStudiesPage {
    #[serde(default)]
    studies: Vec<Value>,
    #[serde(default)]
    next_page_token: Option<String>,
}

impl ClinicalTrialsAdapter {
    pub const NAME: &'static str = "clinicaltrials";
    const BASE: &'static str = "https://clinicaltrials.gov/api/v2";

    pub fn new(deps: &Dependencies) -> Self {
        Self {
            client: deps.client.clone(),
        }
    }

    fn coerce_study(url: &str, raw: &Value) -> Result<ClinicalTrialRecord, IngestError> {
        let study: CtgovStudy = serde_json::from_value(raw.clone())
            .map_err(|err| schema_error(url, format!("study does not match v2 schema: {err}")))?;
        let section = study.protocol_section;

        Ok(ClinicalTrialRecord {
            nct_id: section.identification_module.nct_id,
            brief_title: section.identification_module.brief_title,
            overall_status: section.status_module.overall_status,
            study_type: section.design_module.as_ref().and_then(|d| d.study_type.clone()),
            phase: section
                .design_module
                .as_ref()
                .and_then(|d| d.phases.first().cloned()),
            conditions: section
                .conditions_module
                .map(|c| c.conditions)
                .unwrap_or_default(),
            interventions: section
                .arms_interventions_module
                .map(|a| a.interventions.into_iter().map(|i| i.name).collect())
                .unwrap_or_default(),
            lead_sponsor: section
                .sponsor_collaborators_module
                .and_then(|s| s.lead_sponsor)
                .and_then(|l| l.name),
            enrollment: section
                .design_module
                .as_ref()
                .and_then(|d| d.enrollment_info.as_ref())
                .and_then(|e| e.count),
            start_date: section
                .status_module
                .start_date_struct
                .map(|d| d.date),
            completion_date: section
                .status_module
                .completion_date_struct
                .map(|d| d.date),
            last_update_date: section
                .status_module
                .last_update_post_date_struct
                .map(|d| d.date),
            brief_summary: section.description_module.and_then(|d| d.brief_summary),
        })
    }

    fn record_to_fetched(url: &str, raw: &Value) -> Result<Fetched<ClinicalTrialRecord>, IngestError> {
        let record = Self::coerce_study(url, raw)?;
        let version = record.last_update_date.clone();
        let uri = format!("https://clinicaltrials.gov/study/{}", record.nct_id);
        Ok(fetched(record, raw, version, Some(uri)))
    }
}

impl Adapter for ClinicalTrialsAdapter {
    type Payload = ClinicalTrialRecord;

    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn document_id(&self, params: &Parameters) -> Option<String> {
        str_param(params, "nct_id").map(|id| format!("nct:{id}"))
    }

    fn fetch(&self, params: Parameters) -> FetchStream<ClinicalTrialRecord> {
        let client = self.client.clone();

        if let Some(nct_id) = str_param(&params, "nct_id") {
            return Box::pin(futures::stream::once(async move {
                let url = parse_url(format!("{}/studies/{nct_id}", Self::BASE))?;
                let response = client.get_json(url, &[], &[]).await?;
                Self::record_to_fetched(&response.url, &response.data)
            }));
        }

        let condition = str_param(&params, "condition");
        let page_size = u32_param(&params, "page_size").unwrap_or(100);
        let limit = u64_param(&params, "limit");

        // (next page token, started, records so far)
        Box::pin(pages(
            (None::<String>, false, 0u64),
            move |(token, started, count)| {
                let client = client.clone();
                let condition = condition.clone();
                async move {
                    if started && token.is_none() {
                        return Ok(None);
                    }
                    if limit.map_or(false, |limit| count >= limit) {
                        return Ok(None);
                    }

                    let mut query = vec![("pageSize", page_size.to_string())];
                    if let Some(condition) = &condition {
                        query.push(("query.cond", condition.clone()));
                    }
                    if let Some(token) = &token {
                        query.push(("pageToken", token.clone()));
                    }

                    let url = parse_url(format!("{}/studies", Self::BASE))?;
                    let response = client.get_json(url, &query, &[]).await?;
                    let page: CtgovStudiesPage = serde_json::from_value(response.data.clone())
                        .map_err(|err| {
                            schema_error(&response.url, format!("expected studies page: {err}"))
                        })?;

                    let mut batch = Vec::new();
                    for raw in &page.studies {
                        batch.push(Self::record_to_fetched(&response.url, raw)?);
                        if limit.map_or(false, |limit| count + batch.len() as u64 >= limit) {
                            return Ok(Some((batch, (None, true, u64::MAX))));
                        }
                    }
                    let next_count = count + batch.len() as u64;
                    Ok(Some((batch, (page.next_page_token, true, next_count))))
                }
            },
        ))
    }

    fn parse(&self, fetched: Fetched<ClinicalTrialRecord>) -> Result<Document, IngestError> {
        let Fetched {
            payload,
            content_hash,
            source_version,
            uri,
        } = fetched;

        let doc_id = format!("nct:{}", payload.nct_id);
        let uri = uri.unwrap_or_else(|| {
            format!("https://clinicaltrials.gov/study/{}", payload.nct_id)
        });
        let content = match &payload.brief_summary {
            Some(summary) => format!("{}\n\n{summary}", payload.brief_title),
            None => payload.brief_title.clone(),
        };

        Ok(
            Document::new(doc_id, Self::NAME, payload, metadata(source_version, content_hash))
                .with_uri(uri)
                .with_content(content),
        )
    }

    fn validate(&self, document: &Document) -> Result<(), ValidationError> {
        let record = document
            .raw
            .as_clinical_trial()
            .ok_or_else(|| mismatch("clinical_trial", document))?;
        validate::nct_id(&record.nct_id)?;
        validate::metadata(&document.metadata)?;
        Ok(())
    }
}

// === openFDA drug labels ===

pub struct OpenFdaAdapter {
    client: fetch::Client,
    api_key: Option<String>,
}

// Boundary: api.fda.gov `/drug/label.json`, openFDA result envelope as of
// API version 2024-03. Narrative sections arrive as string arrays.
#[derive(Deserialize)]
struct OpenFdaEnvelope {
    #[serde(default)]
    results: Vec<Value>,
}

impl OpenFdaAdapter {
    pub const NAME: &'static str = "openfda";
    const BASE: &'static str = "https://api.fda.gov/drug/label.json";

    pub fn new(deps: &Dependencies) -> Self {
        Self {
            client: deps.client.clone(),
            api_key: deps.secret("OPENFDA_API_KEY").map(str::to_string),
        }
    }

    fn record_to_fetched(url: &str, raw: &Value) -> Result<Fetched<OpenFdaRecord>, IngestError> {
        let record: OpenFdaRecord = serde_json::from_value(raw.clone())
            .map_err(|err| schema_error(url, format!("label does not match openFDA shape: {err}")))?;
        let version = record.effective_time.clone();
        Ok(fetched(record, raw, version, None))
    }
}

impl Adapter for OpenFdaAdapter {
    type Payload = OpenFdaRecord;

    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn document_id(&self, params: &Parameters) -> Option<String> {
        str_param(params, "set_id").map(|id| format!("fda-label:{id}"))
    }

    fn fetch(&self, params: Parameters) -> FetchStream<OpenFdaRecord> {
        let client = self.client.clone();
        let api_key = self.api_key.clone();
        let set_id = str_param(&params, "set_id");
        let search = str_param(&params, "search");
        let page_size = u32_param(&params, "page_size").unwrap_or(100).min(1000);
        let limit = u64_param(&params, "limit");

        // (skip offset, done)
        Box::pin(pages((0u64, false), move |(skip, done)| {
            let client = client.clone();
            let api_key = api_key.clone();
            let set_id = set_id.clone();
            let search = search.clone();
            async move {
                if done || limit.map_or(false, |limit| skip >= limit) {
                    return Ok(None);
                }

                let mut query = Vec::new();
                if let Some(set_id) = &set_id {
                    query.push(("search", format!("set_id:\"{set_id}\"")));
                } else if let Some(search) = &search {
                    query.push(("search", search.clone()));
                }
                query.push(("limit", page_size.to_string()));
                query.push(("skip", skip.to_string()));
                if let Some(key) = &api_key {
                    query.push(("api_key", key.clone()));
                }

                let url = parse_url(Self::BASE.to_string())?;
                let response = client.get_json(url, &query, &[]).await?;
                let envelope: OpenFdaEnvelope = serde_json::from_value(response.data.clone())
                    .map_err(|err| {
                        schema_error(&response.url, format!("expected result envelope: {err}"))
                    })?;

                let mut batch = Vec::new();
                for raw in &envelope.results {
                    batch.push(Self::record_to_fetched(&response.url, raw)?);
                }
                let exhausted =
                    set_id.is_some() || (envelope.results.len() as u64) < page_size as u64;
                Ok(Some((batch, (skip + page_size as u64, exhausted))))
            }
        }))
    }

    fn parse(&self, fetched: Fetched<OpenFdaRecord>) -> Result<Document, IngestError> {
        let Fetched {
            payload,
            content_hash,
            source_version,
            uri: _,
        } = fetched;

        let doc_id = format!("fda-label:{}", payload.set_id);
        let content = payload
            .indications_and_usage
            .iter()
            .chain(payload.warnings.iter())
            .cloned()
            .collect::<Vec<_>>()
            .join("\n\n");

        let mut document = Document::new(
            doc_id,
            Self::NAME,
            payload,
            metadata(source_version, content_hash),
        );
        if !content.is_empty() {
            document = document.with_content(content);
        }
        Ok(document)
    }

    fn validate(&self, document: &Document) -> Result<(), ValidationError> {
        let record = document
            .raw
            .as_openfda()
            .ok_or_else(|| mismatch("openfda_label", document))?;
        if record.set_id.is_empty() {
            return Err(ValidationError::InvalidIdentifier {
                field: "set_id",
                value: record.set_id.clone(),
                reason: "must be non-empty".into(),
            });
        }
        validate::metadata(&document.metadata)?;
        Ok(())
    }
}

// === DailyMed SPL ===

pub struct DailyMedAdapter {
    client: fetch::Client,
}

// Boundary: DailyMed web services v2 `/spls.json` listing, as of 2024-02.
#[derive(Deserialize)]
struct DailyMedPage {
    #[serde(default)]
    data: Vec<Value>,
    #[serde(default)]
    metadata: Option<DailyMedPageMeta>,
}

#[derive(Deserialize)]
struct DailyMedPageMeta {
    #[serde(default)]
    total_pages: Option<u64>,
}

#[derive(Deserialize)]
struct DailyMedRow {
    setid: String,
    spl_version: Value,
    title: String,
    #[serde(default)]
    published_date: Option<String>,
}

impl DailyMedAdapter {
    pub const NAME: &'static str = "dailymed";
    const BASE: &'static str = "https://dailymed.nlm.nih.gov/dailymed/services/v2";

    pub fn new(deps: &Dependencies) -> Self {
        Self {
            client: deps.client.clone(),
        }
    }

    fn record_to_fetched(url: &str, raw: &Value) -> Result<Fetched<DailyMedSpl>, IngestError> {
        let row: DailyMedRow = serde_json::from_value(raw.clone())
            .map_err(|err| schema_error(url, format!("SPL row does not match v2 shape: {err}")))?;
        // spl_version is numeric in listings and string in single fetches.
        let spl_version = match &row.spl_version {
            Value::String(s) => s.clone(),
            Value::Number(n) => n.to_string(),
            other => {
                return Err(schema_error(
                    url,
                    format!("spl_version must be string or number, got {other}"),
                ))
            }
        };
        let record = DailyMedSpl {
            set_id: row.setid,
            spl_version: spl_version.clone(),
            title: row.title,
            published_date: row.published_date,
            sections: Vec::new(),
        };
        let uri = format!(
            "https://dailymed.nlm.nih.gov/dailymed/drugInfo.cfm?setid={}",
            record.set_id
        );
        Ok(fetched(record, raw, Some(spl_version), Some(uri)))
    }
}

impl Adapter for DailyMedAdapter {
    type Payload = DailyMedSpl;

    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn document_id(&self, params: &Parameters) -> Option<String> {
        str_param(params, "set_id").map(|id| format!("spl:{id}"))
    }

    fn fetch(&self, params: Parameters) -> FetchStream<DailyMedSpl> {
        let client = self.client.clone();

        if let Some(set_id) = str_param(&params, "set_id") {
            return Box::pin(futures::stream::once(async move {
                let url = parse_url(format!("{}/spls/{set_id}.json", Self::BASE))?;
                let response = client.get_json(url, &[], &[]).await?;
                let page: DailyMedPage = serde_json::from_value(response.data.clone())
                    .map_err(|err| {
                        schema_error(&response.url, format!("expected SPL envelope: {err}"))
                    })?;
                let raw = page.data.first().ok_or_else(|| {
                    schema_error(&response.url, "SPL envelope contains no data rows")
                })?;
                Self::record_to_fetched(&response.url, raw)
            }));
        }

        let page_size = u32_param(&params, "page_size").unwrap_or(100);
        let limit = u64_param(&params, "limit");

        // (1-based page number, total pages once known, records so far)
        Box::pin(pages(
            (1u64, None::<u64>, 0u64),
            move |(page_no, total_pages, count)| {
                let client = client.clone();
                async move {
                    if total_pages.map_or(false, |total| page_no > total)
                        || limit.map_or(false, |limit| count >= limit)
                    {
                        return Ok(None);
                    }

                    let url = parse_url(format!("{}/spls.json", Self::BASE))?;
                    let query = vec![
                        ("page", page_no.to_string()),
                        ("pagesize", page_size.to_string()),
                    ];
                    let response = client.get_json(url, &query, &[]).await?;
                    let page: DailyMedPage = serde_json::from_value(response.data.clone())
                        .map_err(|err| {
                            schema_error(&response.url, format!("expected SPL listing: {err}"))
                        })?;

                    let mut batch = Vec::new();
                    for raw in &page.data {
                        batch.push(Self::record_to_fetched(&response.url, raw)?);
                    }
                    if batch.is_empty() {
                        return Ok(None);
                    }
                    let total = page.metadata.and_then(|m| m.total_pages).or(total_pages);
                    let next_count = count + batch.len() as u64;
                    Ok(Some((batch, (page_no + 1, total, next_count))))
                }
            },
        ))
    }

    fn parse(&self, fetched: Fetched<DailyMedSpl>) -> Result<Document, IngestError> {
        let Fetched {
            payload,
            content_hash,
            source_version,
            uri,
        } = fetched;

        let doc_id = format!("spl:{}", payload.set_id);
        let content = payload.title.clone();
        let mut document = Document::new(
            doc_id,
            Self::NAME,
            payload,
            metadata(source_version, content_hash),
        )
        .with_content(content);
        if let Some(uri) = uri {
            document = document.with_uri(uri);
        }
        Ok(document)
    }

    fn validate(&self, document: &Document) -> Result<(), ValidationError> {
        let record = document
            .raw
            .as_dailymed()
            .ok_or_else(|| mismatch("dailymed_spl", document))?;
        if record.set_id.len() != 36 {
            return Err(ValidationError::InvalidIdentifier {
                field: "set_id",
                value: record.set_id.clone(),
                reason: "must be a 36-character SPL set id".into(),
            });
        }
        for section in &record.sections {
            if let Some(code) = &section.loinc_code {
                validate::loinc_code(code)?;
            }
        }
        validate::metadata(&document.metadata)?;
        Ok(())
    }
}

// === RxNorm ===

pub struct RxNormAdapter {
    client: fetch::Client,
}

// Boundary: RxNav REST API `/rxcui/{id}/properties.json` and
// `/allconcepts.json`, response shapes as of 2024-02.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RxNormProperties {
    properties: Option<Value>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RxNormAllConcepts {
    min_concept_group: Option<RxNormMinConceptGroup>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RxNormMinConceptGroup {
    #[serde(default)]
    min_concept: Vec<Value>,
}

#[derive(Deserialize)]
struct RxNormConceptRow {
    rxcui: String,
    name: String,
    tty: String,
    #[serde(default)]
    language: Option<String>,
}

impl RxNormAdapter {
    pub const NAME: &'static str = "rxnorm";
    const BASE: &'static str = "https://rxnav.nlm.nih.gov/REST";

    pub fn new(deps: &Dependencies) -> Self {
        Self {
            client: deps.client.clone(),
        }
    }

    fn record_to_fetched(url: &str, raw: &Value) -> Result<Fetched<RxNormConcept>, IngestError> {
        let row: RxNormConceptRow = serde_json::from_value(raw.clone())
            .map_err(|err| schema_error(url, format!("concept does not match RxNav shape: {err}")))?;
        let record = RxNormConcept {
            rxcui: row.rxcui,
            name: row.name,
            tty: row.tty,
            synonyms: Vec::new(),
            language: row.language,
        };
        let uri = format!("https://rxnav.nlm.nih.gov/REST/rxcui/{}", record.rxcui);
        Ok(fetched(record, raw, None, Some(uri)))
    }
}

impl Adapter for RxNormAdapter {
    type Payload = RxNormConcept;

    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn document_id(&self, params: &Parameters) -> Option<String> {
        str_param(params, "rxcui").map(|id| format!("rxnorm:{id}"))
    }

    fn fetch(&self, params: Parameters) -> FetchStream<RxNormConcept> {
        let client = self.client.clone();

        if let Some(rxcui) = str_param(&params, "rxcui") {
            return Box::pin(futures::stream::once(async move {
                let url = parse_url(format!("{}/rxcui/{rxcui}/properties.json", Self::BASE))?;
                let response = client.get_json(url, &[], &[]).await?;
                let envelope: RxNormProperties = serde_json::from_value(response.data.clone())
                    .map_err(|err| {
                        schema_error(&response.url, format!("expected properties envelope: {err}"))
                    })?;
                let raw = envelope.properties.ok_or_else(|| {
                    schema_error(&response.url, format!("rxcui {rxcui} has no properties"))
                })?;
                Self::record_to_fetched(&response.url, &raw)
            }));
        }

        let tty = str_param(&params, "tty").unwrap_or_else(|| "IN".to_string());
        let limit = u64_param(&params, "limit");

        // The allconcepts listing is one unpaginated response per term type.
        Box::pin(pages(false, move |done| {
            let client = client.clone();
            let tty = tty.clone();
            async move {
                if done {
                    return Ok(None);
                }
                let url = parse_url(format!("{}/allconcepts.json", Self::BASE))?;
                let query = vec![("tty", tty.clone())];
                let response = client.get_json(url, &query, &[]).await?;
                let envelope: RxNormAllConcepts = serde_json::from_value(response.data.clone())
                    .map_err(|err| {
                        schema_error(&response.url, format!("expected allconcepts envelope: {err}"))
                    })?;

                let mut batch = Vec::new();
                for raw in envelope
                    .min_concept_group
                    .map(|g| g.min_concept)
                    .unwrap_or_default()
                {
                    batch.push(Self::record_to_fetched(&response.url, &raw)?);
                    if limit.map_or(false, |limit| batch.len() as u64 >= limit) {
                        break;
                    }
                }
                Ok(Some((batch, true)))
            }
        }))
    }

    fn parse(&self, fetched: Fetched<RxNormConcept>) -> Result<Document, IngestError> {
        let Fetched {
            payload,
            content_hash,
            source_version,
            uri,
        } = fetched;

        let doc_id = format!("rxnorm:{}", payload.rxcui);
        let content = payload.name.clone();
        let mut document = Document::new(
            doc_id,
            Self::NAME,
            payload,
            metadata(source_version, content_hash),
        )
        .with_content(content);
        if let Some(uri) = uri {
            document = document.with_uri(uri);
        }
        Ok(document)
    }

    fn validate(&self, document: &Document) -> Result<(), ValidationError> {
        let record = document
            .raw
            .as_rxnorm()
            .ok_or_else(|| mismatch("rxnorm_concept", document))?;
        if record.rxcui.is_empty() || !record.rxcui.bytes().all(|b| b.is_ascii_digit()) {
            return Err(ValidationError::InvalidIdentifier {
                field: "rxcui",
                value: record.rxcui.clone(),
                reason: "must be numeric".into(),
            });
        }
        if let Some(language) = &record.language {
            // RxNav reports uppercase 3-letter codes; normalize expectation
            // to the lowercase 2-letter form when present.
            if language.len() == 2 {
                validate::language(&language.to_lowercase())?;
            }
        }
        validate::metadata(&document.metadata)?;
        Ok(())
    }
}

// === AccessGUDID ===

pub struct GudidAdapter {
    client: fetch::Client,
}

// Boundary: AccessGUDID API v3 `/devices/lookup.json`, shape as of 2024-01.
#[derive(Deserialize)]
struct GudidEnvelope {
    gudid: Option<GudidInner>,
}

#[derive(Deserialize)]
struct GudidInner {
    device: Option<Value>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GudidDeviceRow {
    #[serde(default)]
    identifiers: Option<GudidIdentifiers>,
    brand_name: String,
    #[serde(default)]
    company_name: Option<String>,
    #[serde(default)]
    device_description: Option<String>,
    #[serde(default)]
    version_model_number: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GudidIdentifiers {
    #[serde(default)]
    identifier: Vec<GudidIdentifier>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GudidIdentifier {
    device_id: String,
    #[serde(default)]
    device_id_type: Option<String>,
}

impl GudidAdapter {
    pub const NAME: &'static str = "gudid";
    const BASE: &'static str = "https://accessgudid.nlm.nih.gov/api/v3";

    pub fn new(deps: &Dependencies) -> Self {
        Self {
            client: deps.client.clone(),
        }
    }

    fn record_to_fetched(url: &str, raw: &Value) -> Result<Fetched<GudidDevice>, IngestError> {
        let row: GudidDeviceRow = serde_json::from_value(raw.clone())
            .map_err(|err| schema_error(url, format!("device does not match v3 shape: {err}")))?;

        let identifiers = row.identifiers.map(|i| i.identifier).unwrap_or_default();
        let primary_di = identifiers
            .iter()
            .find(|id| id.device_id_type.as_deref() == Some("Primary"))
            .or_else(|| identifiers.first())
            .map(|id| id.device_id.clone())
            .ok_or_else(|| schema_error(url, "device carries no identifiers"))?;

        let record = GudidDevice {
            primary_di,
            brand_name: row.brand_name,
            company_name: row.company_name,
            device_description: row.device_description,
            version_model: row.version_model_number,
            identifiers: identifiers
                .into_iter()
                .map(|id| {
                    (
                        id.device_id,
                        Value::String(id.device_id_type.unwrap_or_default()),
                    )
                })
                .collect(),
        };
        Ok(fetched(record, raw, None, None))
    }
}

impl Adapter for GudidAdapter {
    type Payload = GudidDevice;

    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn document_id(&self, params: &Parameters) -> Option<String> {
        str_param(params, "di").map(|di| format!("gudid:{di}"))
    }

    fn fetch(&self, params: Parameters) -> FetchStream<GudidDevice> {
        let client = self.client.clone();
        let di = str_param(&params, "di");

        Box::pin(futures::stream::once(async move {
            let di = di.ok_or_else(|| {
                schema_error(Self::BASE, "the gudid adapter requires a 'di' parameter")
            })?;
            let url = parse_url(format!("{}/devices/lookup.json", Self::BASE))?;
            let query = vec![("di", di.clone())];
            let response = client.get_json(url, &query, &[]).await?;
            let envelope: GudidEnvelope = serde_json::from_value(response.data.clone())
                .map_err(|err| {
                    schema_error(&response.url, format!("expected gudid envelope: {err}"))
                })?;
            let raw = envelope
                .gudid
                .and_then(|g| g.device)
                .ok_or_else(|| schema_error(&response.url, format!("no device for di {di}")))?;
            Self::record_to_fetched(&response.url, &raw)
        }))
    }

    fn parse(&self, fetched: Fetched<GudidDevice>) -> Result<Document, IngestError> {
        let Fetched {
            payload,
            content_hash,
            source_version,
            uri: _,
        } = fetched;

        let doc_id = format!("gudid:{}", payload.primary_di);
        let uri = format!(
            "https://accessgudid.nlm.nih.gov/devices/{}",
            payload.primary_di
        );
        let content = match &payload.device_description {
            Some(description) => format!("{}\n\n{description}", payload.brand_name),
            None => payload.brand_name.clone(),
        };

        Ok(Document::new(
            doc_id,
            Self::NAME,
            payload,
            metadata(source_version, content_hash),
        )
        .with_uri(uri)
        .with_content(content))
    }

    fn validate(&self, document: &Document) -> Result<(), ValidationError> {
        let record = document
            .raw
            .as_gudid()
            .ok_or_else(|| mismatch("gudid_device", document))?;
        validate::gtin14(&record.primary_di)?;
        validate::metadata(&document.metadata)?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::adapter::DynAdapter;
    use serde_json::json;

    fn deps() -> Dependencies {
        Dependencies::new(fetch::Client::builder().build().unwrap())
    }

    fn study_fixture() -> Value {
        json!({
            "protocolSection": {
                "identificationModule": {
                    "nctId": "NCT01234567",
                    "briefTitle": "A Study of Something"
                },
                "statusModule": {
                    "overallStatus": "COMPLETED",
                    "lastUpdatePostDateStruct": {"date": "2024-03-01"}
                },
                "designModule": {
                    "studyType": "INTERVENTIONAL",
                    "phases": ["PHASE3"],
                    "enrollmentInfo": {"count": 250}
                },
                "conditionsModule": {"conditions": ["Type 2 Diabetes"]},
                "descriptionModule": {"briefSummary": "A brief summary."}
            }
        })
    }

    #[test]
    fn ctgov_coercion_and_parse_are_deterministic() {
        let adapter = ClinicalTrialsAdapter::new(&deps());
        let raw = study_fixture();

        let fetched_a = ClinicalTrialsAdapter::record_to_fetched("https://x/", &raw).unwrap();
        let fetched_b = ClinicalTrialsAdapter::record_to_fetched("https://x/", &raw).unwrap();
        assert_eq!(fetched_a.content_hash, fetched_b.content_hash);

        let doc_a = Adapter::parse(&adapter, fetched_a).unwrap();
        let doc_b = Adapter::parse(&adapter, fetched_b).unwrap();
        assert_eq!(doc_a.doc_id, "nct:NCT01234567");
        assert_eq!(doc_a.doc_id, doc_b.doc_id);
        assert_eq!(doc_a.metadata.content_hash, doc_b.metadata.content_hash);
        assert_eq!(doc_a.metadata.source_version, "2024-03-01");
        assert!(doc_a.content.as_deref().unwrap().contains("brief summary"));

        Adapter::validate(&adapter, &doc_a).unwrap();
    }

    #[test]
    fn ctgov_schema_mismatch_is_a_schema_error() {
        let err =
            ClinicalTrialsAdapter::record_to_fetched("https://x/", &json!({"studies": []}))
                .unwrap_err();
        assert_eq!(crate::error_type(&err), "SchemaError");
    }

    #[test]
    fn ctgov_rejects_malformed_nct_id() {
        let adapter = ClinicalTrialsAdapter::new(&deps());
        let mut raw = study_fixture();
        raw["protocolSection"]["identificationModule"]["nctId"] = json!("NCTXYZ");

        let fetched = ClinicalTrialsAdapter::record_to_fetched("https://x/", &raw).unwrap();
        let document = Adapter::parse(&adapter, fetched).unwrap();
        let err = Adapter::validate(&adapter, &document).unwrap_err();
        assert!(err.to_string().contains("NCT"), "{err}");
    }

    #[test]
    fn validate_rejects_wrong_family_via_guard_not_panic() {
        let adapter = ClinicalTrialsAdapter::new(&deps());
        let document = Document::new(
            "pmid:1",
            "pubmed",
            models::PubMedArticle {
                pmid: "1".into(),
                title: "T".into(),
                abstract_text: None,
                journal: None,
                authors: vec![],
                pub_date: None,
                doi: None,
                mesh_terms: vec![],
                language: None,
            },
            super::super::metadata(None, models::Document::content_hash(b"{}")),
        );

        let err = Adapter::validate(&adapter, &document).unwrap_err();
        assert!(matches!(err, ValidationError::PayloadMismatch { .. }));
    }

    #[test]
    fn erased_parse_narrows_the_union_fallibly() {
        let adapter = ClinicalTrialsAdapter::new(&deps());
        let erased: &dyn DynAdapter = &adapter;

        let wrong = Fetched {
            payload: models::AdapterPayload::from(models::RxNormConcept {
                rxcui: "161".into(),
                name: "acetaminophen".into(),
                tty: "IN".into(),
                synonyms: vec![],
                language: None,
            }),
            content_hash: models::Document::content_hash(b"{}"),
            source_version: None,
            uri: None,
        };
        let err = erased.parse(wrong).unwrap_err();
        assert_eq!(crate::error_type(&err), "ValidationError");
    }

    #[test]
    fn gudid_checks_the_device_identifier_checksum() {
        let adapter = GudidAdapter::new(&deps());
        let raw = json!({
            "identifiers": {
                "identifier": [
                    {"deviceId": "10614141000415", "deviceIdType": "Primary"}
                ]
            },
            "brandName": "Infusion Pump",
            "companyName": "Acme Medical"
        });

        let fetched = GudidAdapter::record_to_fetched("https://x/", &raw).unwrap();
        let document = Adapter::parse(&adapter, fetched).unwrap();
        assert_eq!(document.doc_id, "gudid:10614141000415");
        Adapter::validate(&adapter, &document).unwrap();

        let mut bad = raw.clone();
        bad["identifiers"]["identifier"][0]["deviceId"] = json!("10614141000416");
        let fetched = GudidAdapter::record_to_fetched("https://x/", &bad).unwrap();
        let document = Adapter::parse(&adapter, fetched).unwrap();
        assert!(Adapter::validate(&adapter, &document).is_err());
    }

    #[test]
    fn dailymed_accepts_numeric_and_string_versions() {
        for version in [json!(4), json!("4")] {
            let raw = json!({
                "setid": "aaaaaaaa-bbbb-cccc-dddd-eeeeeeeeeeee",
                "spl_version": version,
                "title": "SOME DRUG LABEL",
                "published_date": "2024-01-15"
            });
            let fetched = DailyMedAdapter::record_to_fetched("https://x/", &raw).unwrap();
            assert_eq!(fetched.source_version.as_deref(), Some("4"));
        }
    }
}
