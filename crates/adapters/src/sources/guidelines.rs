//! Guideline and knowledge-base sources: NICE guidance, CDC Socrata
//! datasets, the WHO Global Health Observatory, and OpenPrescribing.

use super::{fetched, metadata, parse_url, schema_error, str_param, u32_param, u64_param};
use crate::adapter::{Adapter, Dependencies, FetchStream, Fetched};
use crate::{pages, IngestError, Parameters};
use models::{validate, CdcSocrataRow, Document, NiceGuideline, OpenPrescribingRow, ValidationError, WhoGhoIndicator};
use serde::Deserialize;
use serde_json::Value;

fn mismatch(expected: &'static str, document: &Document) -> ValidationError {
    ValidationError::PayloadMismatch {
        expected,
        actual: document.raw.family(),
    }
}

// === NICE guidance ===

pub struct NiceAdapter {
    client: fetch::Client,
    api_key: Option<String>,
}

// Boundary: NICE syndication API (JSON representation), as of 2024-02. The
// subscription key travels in the `api-key` header.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct NicePage {
    #[serde(default)]
    results: Vec<Value>,
    #[serde(default)]
    total: Option<u64>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct NiceRow {
    id: String,
    title: String,
    #[serde(default)]
    guidance_type: Option<String>,
    #[serde(default)]
    published: Option<String>,
    #[serde(default)]
    last_updated: Option<String>,
    #[serde(default)]
    summary: Option<String>,
    #[serde(default)]
    url: Option<String>,
}

impl NiceAdapter {
    pub const NAME: &'static str = "nice";
    const BASE: &'static str = "https://api.nice.org.uk/syndication/guidance";

    pub fn new(deps: &Dependencies) -> Self {
        Self {
            client: deps.client.clone(),
            api_key: deps.secret("NICE_API_KEY").map(str::to_string),
        }
    }

    fn headers(&self) -> Vec<(&'static str, String)> {
        match &self.api_key {
            Some(key) => vec![("api-key", key.clone())],
            None => Vec::new(),
        }
    }

    fn record_to_fetched(url: &str, raw: &Value) -> Result<Fetched<NiceGuideline>, IngestError> {
        let row: NiceRow = serde_json::from_value(raw.clone())
            .map_err(|err| schema_error(url, format!("row does not match syndication shape: {err}")))?;
        let record = NiceGuideline {
            guidance_id: row.id,
            title: row.title,
            guidance_type: row.guidance_type,
            published: row.published,
            last_updated: row.last_updated,
            summary: row.summary,
            url: row.url,
        };
        let version = record.last_updated.clone().or_else(|| record.published.clone());
        let uri = record.url.clone();
        Ok(fetched(record, raw, version, uri))
    }
}

impl Adapter for NiceAdapter {
    type Payload = NiceGuideline;

    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn document_id(&self, params: &Parameters) -> Option<String> {
        str_param(params, "guidance_id").map(|id| format!("nice:{id}"))
    }

    fn fetch(&self, params: Parameters) -> FetchStream<NiceGuideline> {
        let client = self.client.clone();
        let headers = self.headers();

        if let Some(guidance_id) = str_param(&params, "guidance_id") {
            return Box::pin(futures::stream::once(async move {
                let url = parse_url(format!("{}/{guidance_id}", Self::BASE))?;
                let response = client.get_json(url, &[], &headers).await?;
                Self::record_to_fetched(&response.url, &response.data)
            }));
        }

        let page_size = u32_param(&params, "page_size").unwrap_or(50);
        let limit = u64_param(&params, "limit");

        // (offset, total once known)
        Box::pin(pages((0u64, None::<u64>), move |(offset, total)| {
            let client = client.clone();
            let headers = headers.clone();
            async move {
                if total.map_or(false, |total| offset >= total)
                    || limit.map_or(false, |limit| offset >= limit)
                {
                    return Ok(None);
                }

                let url = parse_url(Self::BASE.to_string())?;
                let query = vec![
                    ("offset", offset.to_string()),
                    ("limit", page_size.to_string()),
                ];
                let response = client.get_json(url, &query, &headers).await?;
                let page: NicePage = serde_json::from_value(response.data.clone())
                    .map_err(|err| {
                        schema_error(&response.url, format!("expected guidance page: {err}"))
                    })?;

                if page.results.is_empty() {
                    return Ok(None);
                }
                let mut batch = Vec::new();
                for raw in &page.results {
                    batch.push(Self::record_to_fetched(&response.url, raw)?);
                }
                Ok(Some((batch, (offset + page_size as u64, page.total.or(total)))))
            }
        }))
    }

    fn parse(&self, fetched: Fetched<NiceGuideline>) -> Result<Document, IngestError> {
        let Fetched {
            payload,
            content_hash,
            source_version,
            uri,
        } = fetched;

        let doc_id = format!("nice:{}", payload.guidance_id);
        let content = match &payload.summary {
            Some(summary) => format!("{}\n\n{summary}", payload.title),
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
            .as_nice()
            .ok_or_else(|| mismatch("nice_guideline", document))?;
        let valid = record.guidance_id.len() >= 3
            && record
                .guidance_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric());
        if !valid {
            return Err(ValidationError::InvalidIdentifier {
                field: "guidance_id",
                value: record.guidance_id.clone(),
                reason: "must be an alphanumeric guidance reference (e.g. NG28)".into(),
            });
        }
        validate::metadata(&document.metadata)?;
        Ok(())
    }
}

// === CDC Socrata ===

pub struct CdcAdapter {
    client: fetch::Client,
    app_token: Option<String>,
}

impl CdcAdapter {
    pub const NAME: &'static str = "cdc";
    const BASE: &'static str = "https://data.cdc.gov/resource";

    pub fn new(deps: &Dependencies) -> Self {
        Self {
            client: deps.client.clone(),
            app_token: deps.secret("SOCRATA_APP_TOKEN").map(str::to_string),
        }
    }

    // Boundary: Socrata SODA 2.1 JSON. A resource page is a bare array of
    // row objects; `:id` is present because the query selects it.
    fn record_to_fetched(
        url: &str,
        dataset_id: &str,
        raw: &Value,
    ) -> Result<Fetched<CdcSocrataRow>, IngestError> {
        let map = raw
            .as_object()
            .ok_or_else(|| schema_error(url, "expected each row to be an object"))?;
        let row_id = map
            .get(":id")
            .and_then(Value::as_str)
            .ok_or_else(|| schema_error(url, "row is missing the :id system field"))?;
        let updated_at = map
            .get(":updated_at")
            .and_then(Value::as_str)
            .map(str::to_string);

        let record = CdcSocrataRow {
            row_id: row_id.to_string(),
            dataset_id: dataset_id.to_string(),
            updated_at: updated_at.clone(),
            columns: map
                .iter()
                .filter(|(key, _)| !key.starts_with(':'))
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect(),
        };
        Ok(fetched(record, raw, updated_at, None))
    }
}

impl Adapter for CdcAdapter {
    type Payload = CdcSocrataRow;

    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn document_id(&self, params: &Parameters) -> Option<String> {
        match (str_param(params, "dataset_id"), str_param(params, "row_id")) {
            (Some(dataset), Some(row)) => Some(format!("cdc:{dataset}:{row}")),
            _ => None,
        }
    }

    fn fetch(&self, params: Parameters) -> FetchStream<CdcSocrataRow> {
        let client = self.client.clone();
        let app_token = self.app_token.clone();
        let dataset_id = str_param(&params, "dataset_id");
        let row_id = str_param(&params, "row_id");
        let where_clause = str_param(&params, "where");
        let page_size = u32_param(&params, "page_size").unwrap_or(1000);
        let limit = u64_param(&params, "limit");

        // (offset, done)
        Box::pin(pages((0u64, false), move |(offset, done)| {
            let client = client.clone();
            let app_token = app_token.clone();
            let dataset_id = dataset_id.clone();
            let row_id = row_id.clone();
            let where_clause = where_clause.clone();
            async move {
                if done || limit.map_or(false, |limit| offset >= limit) {
                    return Ok(None);
                }
                let dataset_id = dataset_id.ok_or_else(|| {
                    schema_error(Self::BASE, "the cdc adapter requires a 'dataset_id' parameter")
                })?;

                let url = parse_url(format!("{}/{dataset_id}.json", Self::BASE))?;
                let mut query = vec![
                    ("$select", ":id,:updated_at,*".to_string()),
                    ("$order", ":id".to_string()),
                    ("$limit", page_size.to_string()),
                    ("$offset", offset.to_string()),
                ];
                if let Some(row_id) = &row_id {
                    query.push(("$where", format!(":id='{row_id}'")));
                } else if let Some(clause) = &where_clause {
                    query.push(("$where", clause.clone()));
                }
                let headers: Vec<(&'static str, String)> = match &app_token {
                    Some(token) => vec![("x-app-token", token.clone())],
                    None => Vec::new(),
                };

                let response = client.get_json(url, &query, &headers).await?;
                let rows: Vec<Value> = serde_json::from_value(response.data.clone())
                    .map_err(|err| {
                        schema_error(&response.url, format!("expected row array: {err}"))
                    })?;

                let mut batch = Vec::new();
                for raw in &rows {
                    batch.push(Self::record_to_fetched(&response.url, &dataset_id, raw)?);
                }
                let exhausted = row_id.is_some() || (rows.len() as u64) < page_size as u64;
                Ok(Some((batch, (offset + page_size as u64, exhausted))))
            }
        }))
    }

    fn parse(&self, fetched: Fetched<CdcSocrataRow>) -> Result<Document, IngestError> {
        let Fetched {
            payload,
            content_hash,
            source_version,
            uri: _,
        } = fetched;

        let doc_id = format!("cdc:{}:{}", payload.dataset_id, payload.row_id);
        let uri = format!(
            "https://data.cdc.gov/resource/{}.json?$where=:id='{}'",
            payload.dataset_id, payload.row_id
        );
        Ok(Document::new(
            doc_id,
            Self::NAME,
            payload,
            metadata(source_version, content_hash),
        )
        .with_uri(uri))
    }

    fn validate(&self, document: &Document) -> Result<(), ValidationError> {
        let record = document
            .raw
            .as_cdc()
            .ok_or_else(|| mismatch("cdc_socrata_row", document))?;
        if record.row_id.is_empty() {
            return Err(ValidationError::InvalidIdentifier {
                field: "row_id",
                value: record.row_id.clone(),
                reason: "must be non-empty".into(),
            });
        }
        validate::metadata(&document.metadata)?;
        Ok(())
    }
}

// === WHO GHO ===

pub struct WhoGhoAdapter {
    client: fetch::Client,
}

// Boundary: ghoapi.azureedge.net OData v4, as of 2024-01. Rows live under
// `value`; continuation is `@odata.nextLink`.
#[derive(Deserialize)]
struct GhoEnvelope {
    #[serde(default)]
    value: Vec<Value>,
    #[serde(rename = "@odata.nextLink", default)]
    next_link: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct GhoRow {
    indicator_code: String,
    spatial_dim: String,
    #[serde(default)]
    time_dim: Option<Value>,
    #[serde(default)]
    numeric_value: Option<f64>,
    #[serde(default)]
    value: Option<String>,
}

impl WhoGhoAdapter {
    pub const NAME: &'static str = "who-gho";
    const BASE: &'static str = "https://ghoapi.azureedge.net/api";

    pub fn new(deps: &Dependencies) -> Self {
        Self {
            client: deps.client.clone(),
        }
    }

    fn record_to_fetched(url: &str, raw: &Value) -> Result<Fetched<WhoGhoIndicator>, IngestError> {
        let row: GhoRow = serde_json::from_value(raw.clone())
            .map_err(|err| schema_error(url, format!("row does not match GHO shape: {err}")))?;
        let record = WhoGhoIndicator {
            indicator_code: row.indicator_code,
            spatial_dim: row.spatial_dim,
            time_dim: row.time_dim.map(|t| match t {
                Value::String(s) => s,
                other => other.to_string(),
            }),
            numeric_value: row.numeric_value,
            value: row.value,
        };
        Ok(fetched(record, raw, None, None))
    }
}

impl Adapter for WhoGhoAdapter {
    type Payload = WhoGhoIndicator;

    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn document_id(&self, params: &Parameters) -> Option<String> {
        let indicator = str_param(params, "indicator")?;
        let country = str_param(params, "country")?;
        let year = str_param(params, "year")?;
        Some(format!("who-gho:{indicator}:{country}:{year}"))
    }

    fn fetch(&self, params: Parameters) -> FetchStream<WhoGhoIndicator> {
        let client = self.client.clone();
        let indicator = str_param(&params, "indicator");
        let country = str_param(&params, "country");
        let year = str_param(&params, "year");
        let limit = u64_param(&params, "limit");

        // (next url override, fetched so far, done)
        Box::pin(pages(
            (None::<String>, 0u64, false),
            move |(next, count, done)| {
                let client = client.clone();
                let indicator = indicator.clone();
                let country = country.clone();
                let year = year.clone();
                async move {
                    if done || limit.map_or(false, |limit| count >= limit) {
                        return Ok(None);
                    }

                    let response = match next {
                        Some(next) => {
                            let url = parse_url(next)?;
                            client.get_json(url, &[], &[]).await?
                        }
                        None => {
                            let indicator = indicator.ok_or_else(|| {
                                schema_error(
                                    Self::BASE,
                                    "the who-gho adapter requires an 'indicator' parameter",
                                )
                            })?;
                            let url = parse_url(format!("{}/{indicator}", Self::BASE))?;
                            let mut filters = Vec::new();
                            if let Some(country) = &country {
                                filters.push(format!("SpatialDim eq '{country}'"));
                            }
                            if let Some(year) = &year {
                                filters.push(format!("TimeDim eq {year}"));
                            }
                            let query: Vec<(&str, String)> = if filters.is_empty() {
                                Vec::new()
                            } else {
                                vec![("$filter", filters.join(" and "))]
                            };
                            client.get_json(url, &query, &[]).await?
                        }
                    };

                    let envelope: GhoEnvelope = serde_json::from_value(response.data.clone())
                        .map_err(|err| {
                            schema_error(&response.url, format!("expected OData envelope: {err}"))
                        })?;

                    let mut batch = Vec::new();
                    for raw in &envelope.value {
                        batch.push(Self::record_to_fetched(&response.url, raw)?);
                    }
                    let next_count = count + batch.len() as u64;
                    match envelope.next_link {
                        Some(link) => Ok(Some((batch, (Some(link), next_count, false)))),
                        None => Ok(Some((batch, (None, next_count, true)))),
                    }
                }
            },
        ))
    }

    fn parse(&self, fetched: Fetched<WhoGhoIndicator>) -> Result<Document, IngestError> {
        let Fetched {
            payload,
            content_hash,
            source_version,
            uri: _,
        } = fetched;

        let time = payload.time_dim.clone().unwrap_or_else(|| "all".to_string());
        let doc_id = format!(
            "who-gho:{}:{}:{time}",
            payload.indicator_code, payload.spatial_dim
        );
        let uri = format!("{}/{}", Self::BASE, payload.indicator_code);
        let mut document = Document::new(
            doc_id,
            Self::NAME,
            payload,
            metadata(source_version, content_hash),
        )
        .with_uri(uri);
        if let Some(value) = document
            .raw
            .as_who_gho()
            .and_then(|record| record.value.clone())
        {
            document = document.with_content(value);
        }
        Ok(document)
    }

    fn validate(&self, document: &Document) -> Result<(), ValidationError> {
        let record = document
            .raw
            .as_who_gho()
            .ok_or_else(|| mismatch("who_gho_indicator", document))?;
        if record.indicator_code.is_empty() {
            return Err(ValidationError::InvalidIdentifier {
                field: "indicator_code",
                value: record.indicator_code.clone(),
                reason: "must be non-empty".into(),
            });
        }
        if record.spatial_dim.is_empty() {
            return Err(ValidationError::InvalidIdentifier {
                field: "spatial_dim",
                value: record.spatial_dim.clone(),
                reason: "must be non-empty".into(),
            });
        }
        validate::metadata(&document.metadata)?;
        Ok(())
    }
}

// === OpenPrescribing ===

pub struct OpenPrescribingAdapter {
    client: fetch::Client,
}

// Boundary: openprescribing.net API 1.0 `spending_by_org`, as of 2024-01:
// a bare array of monthly spending rows per organisation.
#[derive(Deserialize)]
struct OpenPrescribingWire {
    row_id: String,
    row_name: String,
    date: String,
    #[serde(default)]
    items: Option<u64>,
    #[serde(default)]
    quantity: Option<f64>,
    #[serde(default)]
    actual_cost: Option<f64>,
}

impl OpenPrescribingAdapter {
    pub const NAME: &'static str = "openprescribing";
    const BASE: &'static str = "https://openprescribing.net/api/1.0";

    pub fn new(deps: &Dependencies) -> Self {
        Self {
            client: deps.client.clone(),
        }
    }

    fn record_to_fetched(
        url: &str,
        bnf_code: &str,
        bnf_name: &str,
        raw: &Value,
    ) -> Result<Fetched<OpenPrescribingRow>, IngestError> {
        let wire: OpenPrescribingWire = serde_json::from_value(raw.clone())
            .map_err(|err| schema_error(url, format!("row does not match spending shape: {err}")))?;
        let record = OpenPrescribingRow {
            org_id: wire.row_id,
            bnf_code: bnf_code.to_string(),
            bnf_name: if bnf_name.is_empty() {
                wire.row_name
            } else {
                bnf_name.to_string()
            },
            date: wire.date,
            items: wire.items,
            quantity: wire.quantity,
            actual_cost: wire.actual_cost,
        };
        Ok(fetched(record, raw, None, None))
    }
}

impl Adapter for OpenPrescribingAdapter {
    type Payload = OpenPrescribingRow;

    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn document_id(&self, params: &Parameters) -> Option<String> {
        let org = str_param(params, "org_id")?;
        let bnf = str_param(params, "bnf_code")?;
        let date = str_param(params, "date")?;
        Some(format!("openrx:{org}:{bnf}:{date}"))
    }

    fn fetch(&self, params: Parameters) -> FetchStream<OpenPrescribingRow> {
        let client = self.client.clone();
        let bnf_code = str_param(&params, "bnf_code");
        let bnf_name = str_param(&params, "bnf_name").unwrap_or_default();
        let org_type = str_param(&params, "org_type").unwrap_or_else(|| "icb".to_string());
        let limit = u64_param(&params, "limit");

        // The spending endpoint returns the full series in one response.
        Box::pin(pages(false, move |done| {
            let client = client.clone();
            let bnf_code = bnf_code.clone();
            let bnf_name = bnf_name.clone();
            let org_type = org_type.clone();
            async move {
                if done {
                    return Ok(None);
                }
                let bnf_code = bnf_code.ok_or_else(|| {
                    schema_error(
                        Self::BASE,
                        "the openprescribing adapter requires a 'bnf_code' parameter",
                    )
                })?;

                let url = parse_url(format!("{}/spending_by_org/", Self::BASE))?;
                let query = vec![
                    ("org_type", org_type.clone()),
                    ("code", bnf_code.clone()),
                    ("format", "json".to_string()),
                ];
                let response = client.get_json(url, &query, &[]).await?;
                let rows: Vec<Value> = serde_json::from_value(response.data.clone())
                    .map_err(|err| {
                        schema_error(&response.url, format!("expected row array: {err}"))
                    })?;

                let mut batch = Vec::new();
                for raw in &rows {
                    batch.push(Self::record_to_fetched(
                        &response.url,
                        &bnf_code,
                        &bnf_name,
                        raw,
                    )?);
                    if limit.map_or(false, |limit| batch.len() as u64 >= limit) {
                        break;
                    }
                }
                Ok(Some((batch, true)))
            }
        }))
    }

    fn parse(&self, fetched: Fetched<OpenPrescribingRow>) -> Result<Document, IngestError> {
        let Fetched {
            payload,
            content_hash,
            source_version,
            uri: _,
        } = fetched;

        let doc_id = format!(
            "openrx:{}:{}:{}",
            payload.org_id, payload.bnf_code, payload.date
        );
        let uri = format!(
            "{}/spending_by_org/?org={}&code={}",
            Self::BASE,
            payload.org_id,
            payload.bnf_code
        );
        Ok(Document::new(
            doc_id,
            Self::NAME,
            payload,
            metadata(source_version, content_hash),
        )
        .with_uri(uri))
    }

    fn validate(&self, document: &Document) -> Result<(), ValidationError> {
        let record = document
            .raw
            .as_openprescribing()
            .ok_or_else(|| mismatch("openprescribing_row", document))?;
        if record.bnf_code.len() < 4 {
            return Err(ValidationError::InvalidIdentifier {
                field: "bnf_code",
                value: record.bnf_code.clone(),
                reason: "must be a BNF code of at least 4 characters".into(),
            });
        }
        if chrono::NaiveDate::parse_from_str(&record.date, "%Y-%m-%d").is_err() {
            return Err(ValidationError::InvalidIdentifier {
                field: "date",
                value: record.date.clone(),
                reason: "must be an ISO-8601 date".into(),
            });
        }
        validate::metadata(&document.metadata)?;
        Ok(())
    }
}
