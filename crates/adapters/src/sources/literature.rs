//! Literature sources: PubMed and PMC through NCBI E-utilities, and the
//! medRxiv details API.

use super::{fetched, metadata, parse_url, schema_error, str_param, u32_param, u64_param};
use crate::adapter::{Adapter, Dependencies, FetchStream, Fetched, SweepWindow};
use crate::{pages, IngestError, Parameters};
use models::{validate, Document, MedRxivPreprint, PmcFullText, PubMedArticle, ValidationError};
use serde::Deserialize;
use serde_json::Value;

const EUTILS_BASE: &str = "https://eutils.ncbi.nlm.nih.gov/entrez/eutils";

fn mismatch(expected: &'static str, document: &Document) -> ValidationError {
    ValidationError::PayloadMismatch {
        expected,
        actual: document.raw.family(),
    }
}

/// E-utilities reports ISO 639-2 codes; Documents carry ISO 639-1.
fn two_letter_language(lang: &str) -> Option<String> {
    let code = match lang {
        "eng" => "en",
        "fre" => "fr",
        "ger" => "de",
        "spa" => "es",
        "ita" => "it",
        "por" => "pt",
        "chi" => "zh",
        "jpn" => "ja",
        _ => return None,
    };
    Some(code.to_string())
}

// Boundary: E-utilities `esummary.fcgi?retmode=json` envelope, 2024-01
// behavior: `result` maps each uid to its summary and lists them in `uids`.
#[derive(Deserialize)]
struct ESummaryEnvelope {
    result: Option<ESummaryResult>,
}

#[derive(Deserialize)]
struct ESummaryResult {
    #[serde(default)]
    uids: Vec<String>,
    #[serde(flatten)]
    records: serde_json::Map<String, Value>,
}

// Boundary: E-utilities `esearch.fcgi?retmode=json`, 2024-01 behavior.
#[derive(Deserialize)]
struct ESearchEnvelope {
    esearchresult: Option<ESearchResult>,
}

#[derive(Deserialize)]
struct ESearchResult {
    #[serde(default)]
    idlist: Vec<String>,
    #[serde(default)]
    count: Option<String>,
}

async fn esummary(
    client: &fetch::Client,
    api_key: Option<&str>,
    db: &'static str,
    ids: &[String],
) -> Result<(String, Vec<Value>), IngestError> {
    let url = parse_url(format!("{EUTILS_BASE}/esummary.fcgi"))?;
    let mut query = vec![
        ("db", db.to_string()),
        ("id", ids.join(",")),
        ("retmode", "json".to_string()),
    ];
    if let Some(key) = api_key {
        query.push(("api_key", key.to_string()));
    }

    let response = client.get_json(url, &query, &[]).await?;
    let envelope: ESummaryEnvelope = serde_json::from_value(response.data.clone())
        .map_err(|err| schema_error(&response.url, format!("expected esummary envelope: {err}")))?;
    let result = envelope
        .result
        .ok_or_else(|| schema_error(&response.url, "esummary envelope has no result"))?;

    let mut records = Vec::new();
    for uid in &result.uids {
        let raw = result.records.get(uid).ok_or_else(|| {
            schema_error(&response.url, format!("esummary result is missing uid {uid}"))
        })?;
        records.push(raw.clone());
    }
    Ok((response.url, records))
}

// === PubMed ===

pub struct PubMedAdapter {
    client: fetch::Client,
    api_key: Option<String>,
}

#[derive(Deserialize)]
struct PubMedSummary {
    uid: String,
    title: String,
    #[serde(default)]
    fulljournalname: Option<String>,
    #[serde(default)]
    authors: Vec<PubMedAuthor>,
    #[serde(default)]
    pubdate: Option<String>,
    #[serde(default)]
    articleids: Vec<PubMedArticleId>,
    #[serde(default)]
    lang: Vec<String>,
}

#[derive(Deserialize)]
struct PubMedAuthor {
    name: String,
}

#[derive(Deserialize)]
struct PubMedArticleId {
    idtype: String,
    value: String,
}

impl PubMedAdapter {
    pub const NAME: &'static str = "pubmed";

    pub fn new(deps: &Dependencies) -> Self {
        Self {
            client: deps.client.clone(),
            api_key: deps.secret("NCBI_API_KEY").map(str::to_string),
        }
    }

    fn record_to_fetched(url: &str, raw: &Value) -> Result<Fetched<PubMedArticle>, IngestError> {
        let summary: PubMedSummary = serde_json::from_value(raw.clone())
            .map_err(|err| schema_error(url, format!("summary does not match esummary shape: {err}")))?;

        let record = PubMedArticle {
            pmid: summary.uid,
            title: summary.title,
            abstract_text: None,
            journal: summary.fulljournalname,
            authors: summary.authors.into_iter().map(|a| a.name).collect(),
            pub_date: summary.pubdate,
            doi: summary
                .articleids
                .into_iter()
                .find(|id| id.idtype == "doi")
                .map(|id| id.value),
            mesh_terms: Vec::new(),
            language: summary.lang.first().and_then(|l| two_letter_language(l)),
        };
        let version = record.pub_date.clone();
        let uri = format!("https://pubmed.ncbi.nlm.nih.gov/{}/", record.pmid);
        Ok(fetched(record, raw, version, Some(uri)))
    }
}

impl Adapter for PubMedAdapter {
    type Payload = PubMedArticle;

    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn document_id(&self, params: &Parameters) -> Option<String> {
        str_param(params, "pmid").map(|id| format!("pmid:{id}"))
    }

    /// Windowed sweeps split into one parameter object per day, so a long
    /// backfill resumes at day granularity.
    fn auto_parameters(&self, window: &SweepWindow) -> Result<Vec<Parameters>, IngestError> {
        let (Some(start), Some(end)) = (window.start_date, window.end_date) else {
            return Ok(vec![crate::adapter::window_params(window)]);
        };

        let mut days = Vec::new();
        let mut day = start;
        while day <= end {
            let mut params = Parameters::new();
            params.insert("start_date".into(), day.to_string().into());
            params.insert("end_date".into(), day.to_string().into());
            if let Some(page_size) = window.page_size {
                params.insert("page_size".into(), page_size.into());
            }
            days.push(params);
            day = match day.succ_opt() {
                Some(next) => next,
                None => break,
            };
        }
        Ok(days)
    }

    fn fetch(&self, params: Parameters) -> FetchStream<PubMedArticle> {
        let client = self.client.clone();
        let api_key = self.api_key.clone();

        if let Some(pmid) = str_param(&params, "pmid") {
            return Box::pin(futures::stream::once(async move {
                let (url, mut records) =
                    esummary(&client, api_key.as_deref(), "pubmed", &[pmid.clone()]).await?;
                let raw = records
                    .pop()
                    .ok_or_else(|| schema_error(&url, format!("no summary for pmid {pmid}")))?;
                Self::record_to_fetched(&url, &raw)
            }));
        }

        let term = str_param(&params, "term").unwrap_or_else(|| "all[sb]".to_string());
        let start_date = str_param(&params, "start_date");
        let end_date = str_param(&params, "end_date");
        let page_size = u32_param(&params, "page_size").unwrap_or(100).min(10_000);
        let limit = u64_param(&params, "limit");

        // (retstart, total once known)
        Box::pin(pages(
            (0u64, None::<u64>),
            move |(retstart, total)| {
                let client = client.clone();
                let api_key = api_key.clone();
                let term = term.clone();
                let start_date = start_date.clone();
                let end_date = end_date.clone();
                async move {
                    if total.map_or(false, |total| retstart >= total)
                        || limit.map_or(false, |limit| retstart >= limit)
                    {
                        return Ok(None);
                    }

                    let url = parse_url(format!("{EUTILS_BASE}/esearch.fcgi"))?;
                    let mut query = vec![
                        ("db", "pubmed".to_string()),
                        ("term", term.clone()),
                        ("retmode", "json".to_string()),
                        ("retstart", retstart.to_string()),
                        ("retmax", page_size.to_string()),
                    ];
                    if let Some(start) = &start_date {
                        query.push(("mindate", start.replace('-', "/")));
                        query.push(("datetype", "pdat".to_string()));
                    }
                    if let Some(end) = &end_date {
                        query.push(("maxdate", end.replace('-', "/")));
                    }
                    if let Some(key) = &api_key {
                        query.push(("api_key", key.clone()));
                    }

                    let response = client.get_json(url, &query, &[]).await?;
                    let envelope: ESearchEnvelope = serde_json::from_value(response.data.clone())
                        .map_err(|err| {
                            schema_error(&response.url, format!("expected esearch envelope: {err}"))
                        })?;
                    let result = envelope.esearchresult.ok_or_else(|| {
                        schema_error(&response.url, "esearch envelope has no result")
                    })?;

                    if result.idlist.is_empty() {
                        return Ok(None);
                    }

                    let (summary_url, raws) =
                        esummary(&client, api_key.as_deref(), "pubmed", &result.idlist).await?;
                    let mut batch = Vec::new();
                    for raw in &raws {
                        batch.push(Self::record_to_fetched(&summary_url, raw)?);
                    }

                    let total = result
                        .count
                        .as_deref()
                        .and_then(|c| c.parse::<u64>().ok())
                        .or(total);
                    Ok(Some((batch, (retstart + page_size as u64, total))))
                }
            },
        ))
    }

    fn parse(&self, fetched: Fetched<PubMedArticle>) -> Result<Document, IngestError> {
        let Fetched {
            payload,
            content_hash,
            source_version,
            uri,
        } = fetched;

        let doc_id = format!("pmid:{}", payload.pmid);
        let content = match &payload.abstract_text {
            Some(abstract_text) => format!("{}\n\n{abstract_text}", payload.title),
            None => payload.title.clone(),
        };
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
            .as_pubmed()
            .ok_or_else(|| mismatch("pubmed_article", document))?;
        validate::pmid(&record.pmid)?;
        if let Some(doi) = &record.doi {
            validate::doi(doi)?;
        }
        if let Some(language) = &record.language {
            validate::language(language)?;
        }
        validate::metadata(&document.metadata)?;
        Ok(())
    }
}

// === PMC ===

pub struct PmcAdapter {
    client: fetch::Client,
    api_key: Option<String>,
}

#[derive(Deserialize)]
struct PmcSummary {
    uid: String,
    title: String,
    #[serde(default)]
    articleids: Vec<PubMedArticleId>,
}

impl PmcAdapter {
    pub const NAME: &'static str = "pmc";

    pub fn new(deps: &Dependencies) -> Self {
        Self {
            client: deps.client.clone(),
            api_key: deps.secret("NCBI_API_KEY").map(str::to_string),
        }
    }

    fn record_to_fetched(url: &str, raw: &Value) -> Result<Fetched<PmcFullText>, IngestError> {
        let summary: PmcSummary = serde_json::from_value(raw.clone())
            .map_err(|err| schema_error(url, format!("summary does not match esummary shape: {err}")))?;

        let record = PmcFullText {
            pmcid: format!("PMC{}", summary.uid),
            title: summary.title,
            pmid: summary
                .articleids
                .into_iter()
                .find(|id| id.idtype == "pmid")
                .map(|id| id.value),
            sections: Vec::new(),
        };
        let uri = format!("https://www.ncbi.nlm.nih.gov/pmc/articles/{}/", record.pmcid);
        Ok(fetched(record, raw, None, Some(uri)))
    }
}

impl Adapter for PmcAdapter {
    type Payload = PmcFullText;

    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn document_id(&self, params: &Parameters) -> Option<String> {
        str_param(params, "pmcid").map(|id| format!("pmc:PMC{}", id.trim_start_matches("PMC")))
    }

    fn fetch(&self, params: Parameters) -> FetchStream<PmcFullText> {
        let client = self.client.clone();
        let api_key = self.api_key.clone();
        let pmcid = str_param(&params, "pmcid");

        Box::pin(futures::stream::once(async move {
            let pmcid = pmcid.ok_or_else(|| {
                schema_error(EUTILS_BASE, "the pmc adapter requires a 'pmcid' parameter")
            })?;
            let uid = pmcid.trim_start_matches("PMC").to_string();
            let (url, mut records) =
                esummary(&client, api_key.as_deref(), "pmc", &[uid.clone()]).await?;
            let raw = records
                .pop()
                .ok_or_else(|| schema_error(&url, format!("no summary for pmcid PMC{uid}")))?;
            Self::record_to_fetched(&url, &raw)
        }))
    }

    fn parse(&self, fetched: Fetched<PmcFullText>) -> Result<Document, IngestError> {
        let Fetched {
            payload,
            content_hash,
            source_version,
            uri,
        } = fetched;

        let doc_id = format!("pmc:{}", payload.pmcid);
        let content = payload
            .sections
            .iter()
            .map(|s| s.text.as_str())
            .collect::<Vec<_>>()
            .join("\n\n");
        let content = if content.is_empty() {
            payload.title.clone()
        } else {
            format!("{}\n\n{content}", payload.title)
        };

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
            .as_pmc()
            .ok_or_else(|| mismatch("pmc_fulltext", document))?;
        let digits = record.pmcid.strip_prefix("PMC").unwrap_or_default();
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(ValidationError::InvalidIdentifier {
                field: "pmcid",
                value: record.pmcid.clone(),
                reason: "must be PMC followed by digits".into(),
            });
        }
        if let Some(pmid) = &record.pmid {
            validate::pmid(pmid)?;
        }
        validate::metadata(&document.metadata)?;
        Ok(())
    }
}

// === medRxiv ===

pub struct MedRxivAdapter {
    client: fetch::Client,
}

// Boundary: api.medrxiv.org `/details/medrxiv/...` responses, as of 2024-02:
// a `collection` of preprint rows plus a `messages` element carrying the
// sweep cursor.
#[derive(Deserialize)]
struct MedRxivEnvelope {
    #[serde(default)]
    collection: Vec<Value>,
    #[serde(default)]
    messages: Vec<MedRxivMessage>,
}

#[derive(Deserialize)]
struct MedRxivMessage {
    #[serde(default)]
    count: Option<u64>,
    #[serde(default)]
    total: Option<u64>,
}

impl MedRxivAdapter {
    pub const NAME: &'static str = "medrxiv";
    const BASE: &'static str = "https://api.medrxiv.org/details/medrxiv";

    pub fn new(deps: &Dependencies) -> Self {
        Self {
            client: deps.client.clone(),
        }
    }

    fn record_to_fetched(url: &str, raw: &Value) -> Result<Fetched<MedRxivPreprint>, IngestError> {
        let record: MedRxivPreprint = serde_json::from_value(raw.clone())
            .map_err(|err| schema_error(url, format!("row does not match details shape: {err}")))?;
        let version = record.version.clone();
        let uri = format!("https://www.medrxiv.org/content/{}", record.doi);
        Ok(fetched(record, raw, version, Some(uri)))
    }
}

impl Adapter for MedRxivAdapter {
    type Payload = MedRxivPreprint;

    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn document_id(&self, params: &Parameters) -> Option<String> {
        str_param(params, "doi").map(|doi| format!("medrxiv:{doi}"))
    }

    fn fetch(&self, params: Parameters) -> FetchStream<MedRxivPreprint> {
        let client = self.client.clone();

        if let Some(doi) = str_param(&params, "doi") {
            return Box::pin(futures::stream::once(async move {
                let url = parse_url(format!("{}/{doi}", Self::BASE))?;
                let response = client.get_json(url, &[], &[]).await?;
                let envelope: MedRxivEnvelope = serde_json::from_value(response.data.clone())
                    .map_err(|err| {
                        schema_error(&response.url, format!("expected details envelope: {err}"))
                    })?;
                let raw = envelope.collection.first().ok_or_else(|| {
                    schema_error(&response.url, format!("no preprint for doi {doi}"))
                })?;
                Self::record_to_fetched(&response.url, raw)
            }));
        }

        let start = str_param(&params, "start_date").unwrap_or_else(|| "2020-01-01".to_string());
        let end = str_param(&params, "end_date")
            .unwrap_or_else(|| chrono::Utc::now().date_naive().to_string());
        let limit = u64_param(&params, "limit");

        // (cursor, fetched so far, done)
        Box::pin(pages(
            (0u64, 0u64, false),
            move |(cursor, count, done)| {
                let client = client.clone();
                let start = start.clone();
                let end = end.clone();
                async move {
                    if done || limit.map_or(false, |limit| count >= limit) {
                        return Ok(None);
                    }

                    let url = parse_url(format!("{}/{start}/{end}/{cursor}", Self::BASE))?;
                    let response = client.get_json(url, &[], &[]).await?;
                    let envelope: MedRxivEnvelope = serde_json::from_value(response.data.clone())
                        .map_err(|err| {
                            schema_error(&response.url, format!("expected details envelope: {err}"))
                        })?;

                    let mut batch = Vec::new();
                    for raw in &envelope.collection {
                        batch.push(Self::record_to_fetched(&response.url, raw)?);
                    }

                    let message = envelope.messages.first();
                    let page_count = message
                        .and_then(|m| m.count)
                        .unwrap_or(batch.len() as u64);
                    let total = message.and_then(|m| m.total);
                    let next_cursor = cursor + page_count;
                    let exhausted = page_count == 0 || total.map_or(false, |t| next_cursor >= t);

                    Ok(Some((batch, (next_cursor, count + page_count, exhausted))))
                }
            },
        ))
    }

    fn parse(&self, fetched: Fetched<MedRxivPreprint>) -> Result<Document, IngestError> {
        let Fetched {
            payload,
            content_hash,
            source_version,
            uri,
        } = fetched;

        let doc_id = format!("medrxiv:{}", payload.doi);
        let content = match &payload.abstract_text {
            Some(abstract_text) => format!("{}\n\n{abstract_text}", payload.title),
            None => payload.title.clone(),
        };
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
            .as_medrxiv()
            .ok_or_else(|| mismatch("medrxiv_preprint", document))?;
        validate::doi(&record.doi)?;
        if record.server != "medrxiv" && record.server != "biorxiv" {
            return Err(ValidationError::InvalidIdentifier {
                field: "server",
                value: record.server.clone(),
                reason: "must be medrxiv or biorxiv".into(),
            });
        }
        validate::metadata(&document.metadata)?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    fn deps() -> Dependencies {
        Dependencies::new(fetch::Client::builder().build().unwrap())
    }

    #[test]
    fn pubmed_summary_maps_ids_and_language() {
        let raw = json!({
            "uid": "12345",
            "title": "A trial of something",
            "fulljournalname": "The Lancet",
            "authors": [{"name": "Doe J"}, {"name": "Roe R"}],
            "pubdate": "2024 Mar 1",
            "articleids": [
                {"idtype": "pubmed", "value": "12345"},
                {"idtype": "doi", "value": "10.1016/S0140-6736(24)00001-1"}
            ],
            "lang": ["eng"]
        });

        let fetched = PubMedAdapter::record_to_fetched("https://x/", &raw).unwrap();
        assert_eq!(fetched.payload.pmid, "12345");
        assert_eq!(fetched.payload.language.as_deref(), Some("en"));
        assert_eq!(
            fetched.payload.doi.as_deref(),
            Some("10.1016/S0140-6736(24)00001-1")
        );

        let adapter = PubMedAdapter::new(&deps());
        let document = adapter.parse(fetched).unwrap();
        assert_eq!(document.doc_id, "pmid:12345");
        adapter.validate(&document).unwrap();
    }

    #[test]
    fn pubmed_auto_splits_the_window_into_days() {
        let adapter = PubMedAdapter::new(&deps());
        let window = SweepWindow {
            start_date: Some("2024-03-01".parse().unwrap()),
            end_date: Some("2024-03-03".parse().unwrap()),
            page_size: Some(200),
        };

        let days = adapter.auto_parameters(&window).unwrap();
        assert_eq!(days.len(), 3);
        assert_eq!(days[0]["start_date"], json!("2024-03-01"));
        assert_eq!(days[2]["end_date"], json!("2024-03-03"));
        assert_eq!(days[1]["page_size"], json!(200));
    }

    #[test]
    fn pmc_doc_ids_normalize_the_prefix() {
        let adapter = PmcAdapter::new(&deps());
        let mut params = Parameters::new();
        params.insert("pmcid".into(), json!("PMC7096066"));
        assert_eq!(adapter.document_id(&params).as_deref(), Some("pmc:PMC7096066"));

        params.insert("pmcid".into(), json!("7096066"));
        assert_eq!(adapter.document_id(&params).as_deref(), Some("pmc:PMC7096066"));
    }

    #[test]
    fn medrxiv_rejects_foreign_servers_and_bad_dois() {
        let adapter = MedRxivAdapter::new(&deps());
        let raw = json!({
            "doi": "10.1101/2024.01.02.24300789",
            "title": "A preprint",
            "server": "medrxiv",
            "version": "2",
            "date": "2024-01-02"
        });
        let fetched = MedRxivAdapter::record_to_fetched("https://x/", &raw).unwrap();
        let document = adapter.parse(fetched).unwrap();
        adapter.validate(&document).unwrap();

        let mut foreign = raw.clone();
        foreign["server"] = json!("arxiv");
        let fetched = MedRxivAdapter::record_to_fetched("https://x/", &foreign).unwrap();
        let document = adapter.parse(fetched).unwrap();
        assert!(adapter.validate(&document).is_err());
    }
}
