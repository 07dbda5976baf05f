// Firestore REST adapter
//
// Collections (names configurable):
// - buses / metroBuses : vehicle positions, document id = vehicle id
// - bus_stops          : stop reference data, document id = stop_id
// - bus_etas           : next-arrival summary per stop, document id = stop_id
//
// REST reference: https://firebase.google.com/docs/firestore/reference/rest

use crate::transit_models::{
    BusStop, Result, StopEta, VehicleCategory, VehiclePosition, YourRouteError,
};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map, Value, json};
use std::collections::HashMap;
use std::time::Duration;

/// Read access to the external transit store.
#[async_trait]
pub trait TransitStore: Send + Sync {
    async fn fetch_all_vehicles(&self, category: VehicleCategory) -> Result<Vec<VehiclePosition>>;

    /// Vehicles whose `lastPing` is at or after `since`.
    async fn fetch_updated_vehicles(
        &self,
        category: VehicleCategory,
        since: DateTime<Utc>,
    ) -> Result<Vec<VehiclePosition>>;

    async fn fetch_bus_stops(&self) -> Result<Vec<BusStop>>;

    /// Keyed by stop id.
    async fn fetch_stop_etas(&self) -> Result<HashMap<String, StopEta>>;
}

/// How `lastPing` is stored in the vehicle documents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum PingEncoding {
    /// Integer epoch milliseconds (`Date.now()`).
    Millis,
    /// Native Firestore timestamp.
    Timestamp,
}

#[derive(Debug, Clone)]
pub struct FirestoreConfig {
    pub base_url: String,
    pub project_id: String,
    pub api_key: Option<String>,
    pub bearer_token: Option<String>,
    pub bus_collection: String,
    pub metro_collection: String,
    pub stops_collection: String,
    pub etas_collection: String,
    pub ping_encoding: PingEncoding,
}

impl FirestoreConfig {
    pub fn collection_for(&self, category: VehicleCategory) -> &str {
        match category {
            VehicleCategory::Bus => &self.bus_collection,
            VehicleCategory::Metro => &self.metro_collection,
        }
    }

    fn database_path(&self) -> String {
        format!("projects/{}/databases/(default)", self.project_id)
    }
}

pub struct FirestoreStore {
    client: reqwest::Client,
    config: FirestoreConfig,
}

impl FirestoreStore {
    const REQUEST_TIMEOUT_SECS: u64 = 15;
    const PAGE_SIZE: u32 = 300;
    /// Firestore rejects commits with more writes than this.
    pub const BATCH_LIMIT: usize = 500;

    pub fn new(config: FirestoreConfig) -> Result<Self> {
        if config.project_id.trim().is_empty() {
            return Err(YourRouteError::ConfigError(
                "FIRESTORE_PROJECT_ID is not set".to_string(),
            ));
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(Self::REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|e| YourRouteError::NetworkError(format!("Failed to create HTTP client: {}", e)))?;

        Ok(FirestoreStore { client, config })
    }

    pub fn config(&self) -> &FirestoreConfig {
        &self.config
    }

    fn documents_url(&self) -> String {
        format!(
            "{}/{}/documents",
            self.config.base_url.trim_end_matches('/'),
            self.config.database_path()
        )
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let request = match &self.config.api_key {
            Some(key) => request.query(&[("key", key)]),
            None => request,
        };
        match &self.config.bearer_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send_json(&self, request: reqwest::RequestBuilder, what: &str) -> Result<Value> {
        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(|e| YourRouteError::NetworkError(format!("Failed to {}: {}", what, e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(YourRouteError::StoreError(format!(
                "Firestore returned {} while trying to {}: {}",
                status, what, body
            )));
        }

        response
            .json::<Value>()
            .await
            .map_err(|e| YourRouteError::ParseError(format!("Invalid JSON from Firestore: {}", e)))
    }

    /// Every document in a collection, following `nextPageToken`.
    async fn list_documents(&self, collection: &str) -> Result<Vec<Value>> {
        let url = format!("{}/{}", self.documents_url(), collection);
        let mut documents = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut request = self
                .client
                .get(&url)
                .query(&[("pageSize", Self::PAGE_SIZE.to_string())]);
            if let Some(token) = &page_token {
                request = request.query(&[("pageToken", token)]);
            }

            let page = self
                .send_json(request, &format!("list '{}'", collection))
                .await?;

            if let Some(docs) = page["documents"].as_array() {
                documents.extend(docs.iter().map(decode_document));
            }

            match page["nextPageToken"].as_str() {
                Some(token) if !token.is_empty() => page_token = Some(token.to_string()),
                _ => break,
            }
        }

        Ok(documents)
    }

    fn ping_filter_value(&self, since: DateTime<Utc>) -> Value {
        match self.config.ping_encoding {
            PingEncoding::Millis => json!({ "integerValue": since.timestamp_millis().to_string() }),
            PingEncoding::Timestamp => {
                json!({ "timestampValue": since.to_rfc3339_opts(SecondsFormat::Millis, true) })
            }
        }
    }

    async fn run_query(&self, structured_query: Value) -> Result<Vec<Value>> {
        let url = format!("{}:runQuery", self.documents_url());
        let body = json!({ "structuredQuery": structured_query });

        let rows = self
            .send_json(self.client.post(&url).json(&body), "run query")
            .await?;

        let rows = rows
            .as_array()
            .ok_or_else(|| YourRouteError::ParseError("runQuery did not return an array".to_string()))?;

        // Rows without a document only carry a readTime.
        Ok(rows
            .iter()
            .filter(|row| row.get("document").is_some())
            .map(|row| decode_document(&row["document"]))
            .collect())
    }

    /// Writes raw stop objects to the stops collection in batches, keyed by
    /// their `stop_id`. Returns how many stops were written.
    pub async fn upload_stops(&self, stops: &[Value]) -> Result<usize> {
        let url = format!("{}:commit", self.documents_url());
        let collection_path = format!(
            "{}/documents/{}",
            self.config.database_path(),
            self.config.stops_collection
        );

        let mut uploaded = 0;
        for chunk in stops.chunks(Self::BATCH_LIMIT) {
            let writes = chunk
                .iter()
                .map(|stop| {
                    let stop_id = match &stop["stop_id"] {
                        Value::String(s) if !s.is_empty() => s.clone(),
                        Value::Number(n) => n.to_string(),
                        _ => {
                            return Err(YourRouteError::ParseError(format!(
                                "Stop without a stop_id: {}",
                                stop
                            )));
                        }
                    };
                    let fields = match encode_value(stop) {
                        Value::Object(mut wrapped) => wrapped
                            .remove("mapValue")
                            .and_then(|m| m.get("fields").cloned())
                            .unwrap_or_else(|| json!({})),
                        _ => json!({}),
                    };
                    Ok(json!({
                        "update": {
                            "name": format!("{}/{}", collection_path, stop_id),
                            "fields": fields,
                        }
                    }))
                })
                .collect::<Result<Vec<_>>>()?;

            self.send_json(
                self.client.post(&url).json(&json!({ "writes": writes })),
                "commit stop batch",
            )
            .await?;

            uploaded += chunk.len();
            log::info!("📤 Uploaded {} of {} stops", uploaded, stops.len());
        }

        log::info!("✓ All bus stops uploaded!");
        Ok(uploaded)
    }
}

#[async_trait]
impl TransitStore for FirestoreStore {
    async fn fetch_all_vehicles(&self, category: VehicleCategory) -> Result<Vec<VehiclePosition>> {
        let documents = self
            .list_documents(self.config.collection_for(category))
            .await?;
        Ok(decode_vehicles(documents, category))
    }

    async fn fetch_updated_vehicles(
        &self,
        category: VehicleCategory,
        since: DateTime<Utc>,
    ) -> Result<Vec<VehiclePosition>> {
        let query = json!({
            "from": [{ "collectionId": self.config.collection_for(category) }],
            "where": {
                "fieldFilter": {
                    "field": { "fieldPath": "lastPing" },
                    "op": "GREATER_THAN_OR_EQUAL",
                    "value": self.ping_filter_value(since),
                }
            }
        });

        let documents = self.run_query(query).await?;
        Ok(decode_vehicles(documents, category))
    }

    async fn fetch_bus_stops(&self) -> Result<Vec<BusStop>> {
        let documents = self.list_documents(&self.config.stops_collection).await?;

        let total = documents.len();
        let stops: Vec<BusStop> = documents
            .into_iter()
            .filter_map(|doc| serde_json::from_value(doc).ok())
            .collect();

        if stops.len() < total {
            log::warn!("⚠️  Skipped {} malformed stop documents", total - stops.len());
        }
        Ok(stops)
    }

    async fn fetch_stop_etas(&self) -> Result<HashMap<String, StopEta>> {
        let documents = self.list_documents(&self.config.etas_collection).await?;

        Ok(documents
            .into_iter()
            .filter_map(|doc| {
                let stop_id = doc["__id"].as_str()?.to_string();
                let eta = serde_json::from_value::<StopEta>(doc).ok()?;
                Some((stop_id, eta))
            })
            .collect())
    }
}

fn decode_vehicles(documents: Vec<Value>, category: VehicleCategory) -> Vec<VehiclePosition> {
    documents
        .into_iter()
        .filter_map(|doc| serde_json::from_value::<VehiclePosition>(doc).ok())
        .map(|mut v| {
            v.category = category;
            v
        })
        .collect()
}

// ============================================================================
// Typed value codec
// ============================================================================

/// Flattens a Firestore document into plain JSON. The document id is exposed
/// as `__id`, and as `id` / `stop_id` when the fields do not carry one.
pub fn decode_document(document: &Value) -> Value {
    let mut fields = match document.get("fields") {
        Some(Value::Object(f)) => f
            .iter()
            .map(|(k, v)| (k.clone(), decode_value(v)))
            .collect::<Map<String, Value>>(),
        _ => Map::new(),
    };

    if let Some(doc_id) = document["name"].as_str().and_then(|n| n.rsplit('/').next()) {
        let doc_id = Value::String(doc_id.to_string());
        fields.entry("id").or_insert_with(|| doc_id.clone());
        fields.entry("stop_id").or_insert_with(|| doc_id.clone());
        fields.insert("__id".to_string(), doc_id);
    }

    Value::Object(fields)
}

pub fn decode_value(value: &Value) -> Value {
    let Some(obj) = value.as_object() else {
        return Value::Null;
    };

    if let Some(s) = obj.get("stringValue") {
        return s.clone();
    }
    if let Some(i) = obj.get("integerValue") {
        // int64 values are sent as decimal strings
        return match i {
            Value::String(s) => s.parse::<i64>().map(Value::from).unwrap_or_else(|_| i.clone()),
            other => other.clone(),
        };
    }
    if let Some(d) = obj.get("doubleValue") {
        return d.clone();
    }
    if let Some(b) = obj.get("booleanValue") {
        return b.clone();
    }
    if let Some(t) = obj.get("timestampValue") {
        return t.clone();
    }
    if let Some(r) = obj.get("referenceValue") {
        return r.clone();
    }
    if let Some(b) = obj.get("bytesValue") {
        return b.clone();
    }
    if let Some(g) = obj.get("geoPointValue") {
        return json!({
            "latitude": g["latitude"].as_f64().unwrap_or_default(),
            "longitude": g["longitude"].as_f64().unwrap_or_default(),
        });
    }
    if let Some(a) = obj.get("arrayValue") {
        return Value::Array(
            a["values"]
                .as_array()
                .map(|values| values.iter().map(decode_value).collect())
                .unwrap_or_default(),
        );
    }
    if let Some(m) = obj.get("mapValue") {
        return Value::Object(
            m["fields"]
                .as_object()
                .map(|f| f.iter().map(|(k, v)| (k.clone(), decode_value(v))).collect())
                .unwrap_or_default(),
        );
    }

    Value::Null
}

pub fn encode_value(value: &Value) -> Value {
    match value {
        Value::Null => json!({ "nullValue": null }),
        Value::Bool(b) => json!({ "booleanValue": b }),
        Value::Number(n) => match n.as_i64() {
            Some(i) => json!({ "integerValue": i.to_string() }),
            None => json!({ "doubleValue": n.as_f64().unwrap_or_default() }),
        },
        Value::String(s) => json!({ "stringValue": s }),
        Value::Array(items) => json!({
            "arrayValue": { "values": items.iter().map(encode_value).collect::<Vec<_>>() }
        }),
        Value::Object(fields) => json!({
            "mapValue": {
                "fields": fields
                    .iter()
                    .map(|(k, v)| (k.clone(), encode_value(v)))
                    .collect::<Map<String, Value>>()
            }
        }),
    }
}
