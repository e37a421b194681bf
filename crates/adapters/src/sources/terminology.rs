//! Terminology sources: MeSH (NLM identifier services), UMLS (UTS REST),
//! LOINC (NLM clinical table search), ICD-11 (WHO API), and SNOMED CT
//! (Snowstorm browser API).

use super::{fetched, metadata, parse_url, schema_error, str_param, u32_param, u64_param};
use crate::adapter::{Adapter, Dependencies, FetchStream, Fetched};
use crate::{pages, IngestError, Parameters};
use models::{validate, Document, Icd11Entity, LoincCode, MeshDescriptor, SnomedConcept, UmlsConcept, ValidationError};
use serde::Deserialize;
use serde_json::{json, Value};

fn mismatch(expected: &'static str, document: &Document) -> ValidationError {
    ValidationError::PayloadMismatch {
        expected,
        actual: document.raw.family(),
    }
}

// === MeSH ===

pub struct MeshAdapter {
    client: fetch::Client,
}

// Boundary: id.nlm.nih.gov `/mesh/lookup` services, as of 2024-01.
// `/lookup/descriptor` rows pair a resource URI with its label;
// `/lookup/label` answers a bare JSON array of label strings.
#[derive(Deserialize)]
struct MeshLookupRow {
    resource: String,
    label: String,
}

impl MeshAdapter {
    pub const NAME: &'static str = "mesh";
    const BASE: &'static str = "https://id.nlm.nih.gov/mesh";

    pub fn new(deps: &Dependencies) -> Self {
        Self {
            client: deps.client.clone(),
        }
    }

    fn descriptor_ui(resource: &str) -> String {
        resource.rsplit('/').next().unwrap_or(resource).to_string()
    }

    fn row_to_fetched(url: &str, raw: &Value) -> Result<Fetched<MeshDescriptor>, IngestError> {
        let row: MeshLookupRow = serde_json::from_value(raw.clone())
            .map_err(|err| schema_error(url, format!("row does not match lookup shape: {err}")))?;
        let record = MeshDescriptor {
            descriptor_ui: Self::descriptor_ui(&row.resource),
            name: row.label,
            tree_numbers: Vec::new(),
            scope_note: None,
            terms: Vec::new(),
        };
        let uri = row.resource.clone();
        Ok(fetched(record, raw, None, Some(uri)))
    }
}

impl Adapter for MeshAdapter {
    type Payload = MeshDescriptor;

    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn document_id(&self, params: &Parameters) -> Option<String> {
        str_param(params, "descriptor_ui").map(|ui| format!("mesh:{ui}"))
    }

    fn fetch(&self, params: Parameters) -> FetchStream<MeshDescriptor> {
        let client = self.client.clone();

        if let Some(ui) = str_param(&params, "descriptor_ui") {
            return Box::pin(futures::stream::once(async move {
                let url = parse_url(format!("{}/lookup/label", Self::BASE))?;
                let query = vec![("resource", ui.clone())];
                let response = client.get_json(url, &query, &[]).await?;
                let labels: Vec<String> = serde_json::from_value(response.data.clone())
                    .map_err(|err| {
                        schema_error(&response.url, format!("expected label array: {err}"))
                    })?;
                let label = labels.into_iter().next().ok_or_else(|| {
                    schema_error(&response.url, format!("no label for descriptor {ui}"))
                })?;

                let raw = json!({"resource": format!("{}/{}", Self::BASE, ui), "label": label});
                Self::row_to_fetched(&response.url, &raw)
            }));
        }

        let term = str_param(&params, "term").unwrap_or_default();
        let limit = u64_param(&params, "limit");

        Box::pin(pages(false, move |done| {
            let client = client.clone();
            let term = term.clone();
            async move {
                if done || term.is_empty() {
                    return Ok(None);
                }
                let url = parse_url(format!("{}/lookup/descriptor", Self::BASE))?;
                let query = vec![
                    ("label", term.clone()),
                    ("match", "contains".to_string()),
                    ("limit", limit.unwrap_or(100).to_string()),
                ];
                let response = client.get_json(url, &query, &[]).await?;
                let rows: Vec<Value> = serde_json::from_value(response.data.clone())
                    .map_err(|err| {
                        schema_error(&response.url, format!("expected descriptor array: {err}"))
                    })?;

                let mut batch = Vec::new();
                for raw in &rows {
                    batch.push(Self::row_to_fetched(&response.url, raw)?);
                }
                Ok(Some((batch, true)))
            }
        }))
    }

    fn parse(&self, fetched: Fetched<MeshDescriptor>) -> Result<Document, IngestError> {
        let Fetched {
            payload,
            content_hash,
            source_version,
            uri,
        } = fetched;

        let doc_id = format!("mesh:{}", payload.descriptor_ui);
        let content = match &payload.scope_note {
            Some(note) => format!("{}\n\n{note}", payload.name),
            None => payload.name.clone(),
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
            .as_mesh()
            .ok_or_else(|| mismatch("mesh_descriptor", document))?;
        validate::mesh_ui(&record.descriptor_ui)?;
        validate::metadata(&document.metadata)?;
        Ok(())
    }
}

// === UMLS ===

pub struct UmlsAdapter {
    client: fetch::Client,
    api_key: Option<String>,
}

// Boundary: UTS REST `/content/current/CUI/{cui}`, as of 2024-01. The
// API key travels as the `apiKey` query parameter.
#[derive(Deserialize)]
struct UtsEnvelope {
    result: Option<Value>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UtsConcept {
    ui: String,
    name: String,
    #[serde(default)]
    semantic_types: Vec<UtsSemanticType>,
}

#[derive(Deserialize)]
struct UtsSemanticType {
    name: String,
}

impl UmlsAdapter {
    pub const NAME: &'static str = "umls";
    const BASE: &'static str = "https://uts-ws.nlm.nih.gov/rest";

    pub fn new(deps: &Dependencies) -> Self {
        Self {
            client: deps.client.clone(),
            api_key: deps.secret("UMLS_API_KEY").map(str::to_string),
        }
    }

    fn record_to_fetched(url: &str, raw: &Value) -> Result<Fetched<UmlsConcept>, IngestError> {
        let concept: UtsConcept = serde_json::from_value(raw.clone())
            .map_err(|err| schema_error(url, format!("concept does not match UTS shape: {err}")))?;
        let record = UmlsConcept {
            cui: concept.ui,
            name: concept.name,
            semantic_types: concept.semantic_types.into_iter().map(|t| t.name).collect(),
            synonyms: Vec::new(),
        };
        let uri = format!("https://uts.nlm.nih.gov/uts/umls/concept/{}", record.cui);
        Ok(fetched(record, raw, None, Some(uri)))
    }
}

impl Adapter for UmlsAdapter {
    type Payload = UmlsConcept;

    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn document_id(&self, params: &Parameters) -> Option<String> {
        str_param(params, "cui").map(|cui| format!("umls:{cui}"))
    }

    fn fetch(&self, params: Parameters) -> FetchStream<UmlsConcept> {
        let client = self.client.clone();
        let api_key = self.api_key.clone();
        let cui = str_param(&params, "cui");

        Box::pin(futures::stream::once(async move {
            let cui = cui.ok_or_else(|| {
                schema_error(Self::BASE, "the umls adapter requires a 'cui' parameter")
            })?;
            let url = parse_url(format!("{}/content/current/CUI/{cui}", Self::BASE))?;
            let mut query = Vec::new();
            if let Some(key) = &api_key {
                query.push(("apiKey", key.clone()));
            }

            let response = client.get_json(url, &query, &[]).await?;
            let envelope: UtsEnvelope = serde_json::from_value(response.data.clone())
                .map_err(|err| {
                    schema_error(&response.url, format!("expected UTS envelope: {err}"))
                })?;
            let raw = envelope
                .result
                .ok_or_else(|| schema_error(&response.url, format!("no concept for cui {cui}")))?;
            Self::record_to_fetched(&response.url, &raw)
        }))
    }

    fn parse(&self, fetched: Fetched<UmlsConcept>) -> Result<Document, IngestError> {
        let Fetched {
            payload,
            content_hash,
            source_version,
            uri,
        } = fetched;

        let doc_id = format!("umls:{}", payload.cui);
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
            .as_umls()
            .ok_or_else(|| mismatch("umls_concept", document))?;
        validate::umls_cui(&record.cui)?;
        validate::metadata(&document.metadata)?;
        Ok(())
    }
}

// === LOINC ===

pub struct LoincAdapter {
    client: fetch::Client,
}

impl LoincAdapter {
    pub const NAME: &'static str = "loinc";
    const BASE: &'static str = "https://clinicaltables.nlm.nih.gov/api/loinc_items/v3/search";
    const FIELDS: &'static str = "LOINC_NUM,COMPONENT,LONG_COMMON_NAME,SYSTEM,PROPERTY";

    pub fn new(deps: &Dependencies) -> Self {
        Self {
            client: deps.client.clone(),
        }
    }

    // Boundary: NLM clinical table search v3, as of 2024-01. The response
    // is positional: [total, [codes], null, [[field values...]]].
    fn coerce_page(url: &str, data: &Value) -> Result<Vec<(Value, LoincCode)>, IngestError> {
        let elements = data
            .as_array()
            .ok_or_else(|| schema_error(url, "expected positional array response"))?;
        let rows = elements
            .get(3)
            .and_then(Value::as_array)
            .ok_or_else(|| schema_error(url, "expected field rows at position 3"))?;

        let mut records = Vec::new();
        for row in rows {
            let fields = row
                .as_array()
                .ok_or_else(|| schema_error(url, "expected each row to be an array"))?;
            let field = |i: usize| -> Option<String> {
                fields
                    .get(i)
                    .and_then(Value::as_str)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
            };

            let loinc_num = field(0)
                .ok_or_else(|| schema_error(url, "row is missing LOINC_NUM at position 0"))?;
            let component = field(1)
                .ok_or_else(|| schema_error(url, "row is missing COMPONENT at position 1"))?;
            let record = LoincCode {
                loinc_num,
                component,
                property: field(4),
                time_aspect: None,
                system: field(3),
                scale_type: None,
                long_common_name: field(2),
                status: None,
            };
            records.push((row.clone(), record));
        }
        Ok(records)
    }
}

impl Adapter for LoincAdapter {
    type Payload = LoincCode;

    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn document_id(&self, params: &Parameters) -> Option<String> {
        str_param(params, "loinc_num").map(|code| format!("loinc:{code}"))
    }

    fn fetch(&self, params: Parameters) -> FetchStream<LoincCode> {
        let client = self.client.clone();
        let terms = str_param(&params, "loinc_num")
            .or_else(|| str_param(&params, "term"))
            .unwrap_or_default();
        let page_size = u32_param(&params, "page_size").unwrap_or(100).min(500);
        let limit = u64_param(&params, "limit");

        // (offset, done)
        Box::pin(pages((0u64, false), move |(offset, done)| {
            let client = client.clone();
            let terms = terms.clone();
            async move {
                if done || terms.is_empty() || limit.map_or(false, |limit| offset >= limit) {
                    return Ok(None);
                }

                let url = parse_url(Self::BASE.to_string())?;
                let query = vec![
                    ("terms", terms.clone()),
                    ("df", Self::FIELDS.to_string()),
                    ("maxList", page_size.to_string()),
                    ("offset", offset.to_string()),
                ];
                let response = client.get_json(url, &query, &[]).await?;
                let rows = Self::coerce_page(&response.url, &response.data)?;

                let mut batch = Vec::new();
                for (raw, record) in rows {
                    let uri = format!("https://loinc.org/{}", record.loinc_num);
                    batch.push(fetched(record, &raw, None, Some(uri)));
                }
                let exhausted = (batch.len() as u64) < page_size as u64;
                Ok(Some((batch, (offset + page_size as u64, exhausted))))
            }
        }))
    }

    fn parse(&self, fetched: Fetched<LoincCode>) -> Result<Document, IngestError> {
        let Fetched {
            payload,
            content_hash,
            source_version,
            uri,
        } = fetched;

        let doc_id = format!("loinc:{}", payload.loinc_num);
        let content = payload
            .long_common_name
            .clone()
            .unwrap_or_else(|| payload.component.clone());
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
            .as_loinc()
            .ok_or_else(|| mismatch("loinc_code", document))?;
        validate::loinc_code(&record.loinc_num)?;
        validate::metadata(&document.metadata)?;
        Ok(())
    }
}

// === ICD-11 ===

pub struct Icd11Adapter {
    client: fetch::Client,
    token: Option<String>,
}

// Boundary: id.who.int ICD API v2 entity endpoint, 2024-01 release. Titles
// and definitions are language-mapped values under `@value`.
#[derive(Deserialize)]
struct Icd11Wire {
    #[serde(rename = "@id")]
    id: String,
    title: Icd11Text,
    #[serde(default)]
    definition: Option<Icd11Text>,
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    parent: Vec<String>,
    #[serde(default)]
    child: Vec<String>,
    #[serde(rename = "releaseId", default)]
    release_id: Option<String>,
}

#[derive(Deserialize)]
struct Icd11Text {
    #[serde(rename = "@value")]
    value: String,
}

impl Icd11Adapter {
    pub const NAME: &'static str = "icd11";
    const BASE: &'static str = "https://id.who.int/icd/entity";
    const ROOT: &'static str = "448895267";

    pub fn new(deps: &Dependencies) -> Self {
        Self {
            client: deps.client.clone(),
            token: deps.secret("ICD11_TOKEN").map(str::to_string),
        }
    }

    fn headers(&self) -> Vec<(&'static str, String)> {
        let mut headers = vec![
            ("accept-language", "en".to_string()),
            ("api-version", "v2".to_string()),
        ];
        if let Some(token) = &self.token {
            headers.push(("authorization", format!("Bearer {token}")));
        }
        headers
    }

    fn entity_tail(uri: &str) -> String {
        uri.rsplit('/').next().unwrap_or(uri).to_string()
    }

    fn record_to_fetched(url: &str, raw: &Value) -> Result<(Fetched<Icd11Entity>, Vec<String>), IngestError> {
        let wire: Icd11Wire = serde_json::from_value(raw.clone())
            .map_err(|err| schema_error(url, format!("entity does not match v2 shape: {err}")))?;

        let children = wire.child.iter().map(|c| Self::entity_tail(c)).collect();
        let record = Icd11Entity {
            entity_id: Self::entity_tail(&wire.id),
            title: wire.title.value,
            code: wire.code,
            definition: wire.definition.map(|d| d.value),
            parent: wire.parent.first().map(|p| Self::entity_tail(p)),
            release_id: wire.release_id,
        };
        let version = record.release_id.clone();
        let uri = wire.id.clone();
        Ok((fetched(record, raw, version, Some(uri)), children))
    }
}

impl Adapter for Icd11Adapter {
    type Payload = Icd11Entity;

    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn document_id(&self, params: &Parameters) -> Option<String> {
        str_param(params, "entity_id").map(|id| format!("icd11:{id}"))
    }

    fn fetch(&self, params: Parameters) -> FetchStream<Icd11Entity> {
        let client = self.client.clone();
        let headers = self.headers();
        let entity_id = str_param(&params, "entity_id");
        let limit = u64_param(&params, "limit");

        if let Some(entity_id) = entity_id {
            return Box::pin(futures::stream::once(async move {
                let url = parse_url(format!("{}/{entity_id}", Self::BASE))?;
                let response = client.get_json(url, &[], &headers).await?;
                Self::record_to_fetched(&response.url, &response.data).map(|(fetched, _)| fetched)
            }));
        }

        // Depth-first walk from the classification root, one entity per turn.
        let initial = (vec![Self::ROOT.to_string()], 0u64);
        Box::pin(pages(initial, move |(mut frontier, count)| {
            let client = client.clone();
            let headers = headers.clone();
            async move {
                if limit.map_or(false, |limit| count >= limit) {
                    return Ok(None);
                }
                let Some(entity_id) = frontier.pop() else {
                    return Ok(None);
                };

                let url = parse_url(format!("{}/{entity_id}", Self::BASE))?;
                let response = client.get_json(url, &[], &headers).await?;
                let (fetched, children) =
                    Self::record_to_fetched(&response.url, &response.data)?;
                frontier.extend(children);

                Ok(Some((vec![fetched], (frontier, count + 1))))
            }
        }))
    }

    fn parse(&self, fetched: Fetched<Icd11Entity>) -> Result<Document, IngestError> {
        let Fetched {
            payload,
            content_hash,
            source_version,
            uri,
        } = fetched;

        let doc_id = format!("icd11:{}", payload.entity_id);
        let content = match &payload.definition {
            Some(definition) => format!("{}\n\n{definition}", payload.title),
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
            .as_icd11()
            .ok_or_else(|| mismatch("icd11_entity", document))?;
        if record.entity_id.is_empty() || !record.entity_id.bytes().all(|b| b.is_ascii_digit()) {
            return Err(ValidationError::InvalidIdentifier {
                field: "entity_id",
                value: record.entity_id.clone(),
                reason: "must be a numeric entity id".into(),
            });
        }
        validate::metadata(&document.metadata)?;
        Ok(())
    }
}

// === SNOMED CT ===

pub struct SnomedAdapter {
    client: fetch::Client,
}

// Boundary: Snowstorm browser API `MAIN/concepts`, as of 2024-01.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SnowstormConcept {
    concept_id: String,
    #[serde(default)]
    active: Option<bool>,
    #[serde(default)]
    module_id: Option<String>,
    fsn: SnowstormTerm,
    #[serde(default)]
    pt: Option<SnowstormTerm>,
}

#[derive(Deserialize)]
struct SnowstormTerm {
    term: String,
}

#[derive(Deserialize)]
struct SnowstormPage {
    #[serde(default)]
    items: Vec<Value>,
    #[serde(default)]
    total: Option<u64>,
}

impl SnomedAdapter {
    pub const NAME: &'static str = "snomed";
    const BASE: &'static str = "https://browser.ihtsdotools.org/snowstorm/snomed-ct/browser/MAIN";

    pub fn new(deps: &Dependencies) -> Self {
        Self {
            client: deps.client.clone(),
        }
    }

    fn record_to_fetched(url: &str, raw: &Value) -> Result<Fetched<SnomedConcept>, IngestError> {
        let wire: SnowstormConcept = serde_json::from_value(raw.clone())
            .map_err(|err| schema_error(url, format!("concept does not match browser shape: {err}")))?;
        let record = SnomedConcept {
            concept_id: wire.concept_id,
            fsn: wire.fsn.term,
            preferred_term: wire.pt.map(|t| t.term),
            active: wire.active.unwrap_or(true),
            module_id: wire.module_id,
        };
        let uri = format!(
            "http://snomed.info/id/{}",
            record.concept_id
        );
        Ok(fetched(record, raw, None, Some(uri)))
    }
}

impl Adapter for SnomedAdapter {
    type Payload = SnomedConcept;

    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn document_id(&self, params: &Parameters) -> Option<String> {
        str_param(params, "concept_id").map(|id| format!("snomed:{id}"))
    }

    fn fetch(&self, params: Parameters) -> FetchStream<SnomedConcept> {
        let client = self.client.clone();

        if let Some(concept_id) = str_param(&params, "concept_id") {
            return Box::pin(futures::stream::once(async move {
                let url = parse_url(format!("{}/concepts/{concept_id}", Self::BASE))?;
                let response = client.get_json(url, &[], &[]).await?;
                Self::record_to_fetched(&response.url, &response.data)
            }));
        }

        let term = str_param(&params, "term").unwrap_or_default();
        let page_size = u32_param(&params, "page_size").unwrap_or(100).min(200);
        let limit = u64_param(&params, "limit");

        // (offset, total once known)
        Box::pin(pages((0u64, None::<u64>), move |(offset, total)| {
            let client = client.clone();
            let term = term.clone();
            async move {
                if term.is_empty()
                    || total.map_or(false, |total| offset >= total)
                    || limit.map_or(false, |limit| offset >= limit)
                {
                    return Ok(None);
                }

                let url = parse_url(format!("{}/concepts", Self::BASE))?;
                let query = vec![
                    ("term", term.clone()),
                    ("activeFilter", "true".to_string()),
                    ("offset", offset.to_string()),
                    ("limit", page_size.to_string()),
                ];
                let response = client.get_json(url, &query, &[]).await?;
                let page: SnowstormPage = serde_json::from_value(response.data.clone())
                    .map_err(|err| {
                        schema_error(&response.url, format!("expected concept page: {err}"))
                    })?;

                if page.items.is_empty() {
                    return Ok(None);
                }
                let mut batch = Vec::new();
                for raw in &page.items {
                    batch.push(Self::record_to_fetched(&response.url, raw)?);
                }
                Ok(Some((batch, (offset + page_size as u64, page.total.or(total)))))
            }
        }))
    }

    fn parse(&self, fetched: Fetched<SnomedConcept>) -> Result<Document, IngestError> {
        let Fetched {
            payload,
            content_hash,
            source_version,
            uri,
        } = fetched;

        let doc_id = format!("snomed:{}", payload.concept_id);
        let content = payload
            .preferred_term
            .clone()
            .unwrap_or_else(|| payload.fsn.clone());
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
            .as_snomed()
            .ok_or_else(|| mismatch("snomed_concept", document))?;
        validate::sctid(&record.concept_id)?;
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
    fn loinc_positional_rows_coerce_or_schema_error() {
        let data = json!([
            2,
            ["2160-0", "2345-7"],
            null,
            [
                ["2160-0", "Creatinine", "Creatinine [Mass/volume] in Serum or Plasma", "Ser/Plas", "MCnc"],
                ["2345-7", "Glucose", "Glucose [Mass/volume] in Serum or Plasma", "Ser/Plas", "MCnc"]
            ]
        ]);

        let rows = LoincAdapter::coerce_page("https://x/", &data).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].1.loinc_num, "2160-0");
        assert_eq!(rows[1].1.component, "Glucose");

        let err = LoincAdapter::coerce_page("https://x/", &json!({"rows": []})).unwrap_err();
        assert_eq!(crate::error_type(&err), "SchemaError");
    }

    #[test]
    fn snomed_validate_runs_the_verhoeff_check() {
        let adapter = SnomedAdapter::new(&deps());
        let raw = json!({
            "conceptId": "404684003",
            "active": true,
            "fsn": {"term": "Clinical finding (finding)"},
            "pt": {"term": "Clinical finding"}
        });

        let fetched = SnomedAdapter::record_to_fetched("https://x/", &raw).unwrap();
        let document = adapter.parse(fetched).unwrap();
        assert_eq!(document.doc_id, "snomed:404684003");
        adapter.validate(&document).unwrap();

        let mut bad = raw.clone();
        bad["conceptId"] = json!("404684004");
        let fetched = SnomedAdapter::record_to_fetched("https://x/", &bad).unwrap();
        let document = adapter.parse(fetched).unwrap();
        assert!(adapter.validate(&document).is_err());
    }

    #[test]
    fn icd11_entities_resolve_ids_from_uris() {
        let raw = json!({
            "@id": "http://id.who.int/icd/entity/1435254666",
            "title": {"@value": "Certain infectious or parasitic diseases"},
            "definition": {"@value": "Diseases generally recognized as communicable."},
            "parent": ["http://id.who.int/icd/entity/448895267"],
            "child": [
                "http://id.who.int/icd/entity/588616678",
                "http://id.who.int/icd/entity/1904876434"
            ],
            "releaseId": "2024-01"
        });

        let (fetched, children) = Icd11Adapter::record_to_fetched("https://x/", &raw).unwrap();
        assert_eq!(fetched.payload.entity_id, "1435254666");
        assert_eq!(fetched.payload.parent.as_deref(), Some("448895267"));
        assert_eq!(children, vec!["588616678", "1904876434"]);
        assert_eq!(fetched.source_version.as_deref(), Some("2024-01"));
    }

    #[test]
    fn mesh_descriptor_ui_comes_from_the_resource_uri() {
        let raw = json!({
            "resource": "http://id.nlm.nih.gov/mesh/D012345",
            "label": "Some Descriptor"
        });
        let fetched = MeshAdapter::row_to_fetched("https://x/", &raw).unwrap();
        assert_eq!(fetched.payload.descriptor_ui, "D012345");

        let adapter = MeshAdapter::new(&deps());
        let document = adapter.parse(fetched).unwrap();
        adapter.validate(&document).unwrap();
    }
}
