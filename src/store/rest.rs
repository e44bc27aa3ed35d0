use crate::{
    chat::{timestamp, DeliveryStatus, Message, MessageId, NewMessage},
    error::StoreError,
    store::MessageStore,
};
use anyhow::Result;
use async_trait::async_trait;
use reqwest::{header, Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use std::{collections::HashSet, time::Duration};
use tracing::debug;

/// Rows requested per page on full-table scans. The server may cap pages
/// lower (`db-max-rows`); paging only stops on an empty page.
const PAGE_SIZE: usize = 1000;

/// Columns the conversation list needs from a row.
const SUMMARY_COLUMNS: &str = "id,phone_number,sender_type,message,created_at,status";

/// Messages table exposed through a hosted PostgREST endpoint
/// (`<url>/rest/v1/<table>`).
#[derive(Clone, Debug)]
pub struct RestStore {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    table: String,
}

impl RestStore {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>, table: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            table: table.into(),
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/rest/v1/{}", self.base_url, self.table)
    }

    fn request(&self, method: Method) -> RequestBuilder {
        self.http
            .request(method, self.endpoint())
            .header("apikey", &self.api_key)
            .bearer_auth(&self.api_key)
    }

    async fn select<T: DeserializeOwned>(&self, params: &[(&str, String)]) -> Result<Vec<T>, StoreError> {
        debug!(table = %self.table, ?params, "PostgREST select");
        let response = self.request(Method::GET).query(params).send().await?;
        let response = check(response, false).await?;
        Ok(response.json().await?)
    }

    /// Reads every matching row, one page at a time. `order` must be total
    /// so pages do not overlap.
    async fn select_all<T: DeserializeOwned>(&self, params: &[(&str, String)]) -> Result<Vec<T>, StoreError> {
        let mut rows = Vec::new();
        loop {
            let mut page_params = params.to_vec();
            page_params.push(("limit", PAGE_SIZE.to_string()));
            page_params.push(("offset", rows.len().to_string()));
            let page: Vec<T> = self.select(&page_params).await?;
            if page.is_empty() {
                return Ok(rows);
            }
            rows.extend(page);
        }
    }

    async fn fetch_by_id(&self, id: &MessageId) -> Result<Option<Message>, StoreError> {
        let rows: Vec<Message> = self
            .select(&[
                ("select", "*".to_string()),
                ("id", format!("eq.{}", id)),
                ("limit", "1".to_string()),
            ])
            .await?;
        Ok(rows.into_iter().next())
    }
}

/// Turns a non-2xx response into a store error. Client errors on writes mean
/// the row was refused; everything else is treated as the backend being
/// unavailable.
async fn check(response: Response, write: bool) -> Result<Response, StoreError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let detail = format!("{} {}", status, body.trim());
    if write && status.is_client_error() {
        Err(StoreError::Rejected(detail))
    } else {
        Err(StoreError::Unavailable(detail))
    }
}

#[async_trait]
impl MessageStore for RestStore {
    async fn distinct_phone_numbers(&self) -> Result<Vec<String>, StoreError> {
        #[derive(serde::Deserialize)]
        struct PhoneRow {
            phone_number: String,
        }

        let rows: Vec<PhoneRow> = self
            .select_all(&[
                ("select", "phone_number".to_string()),
                ("order", "created_at.desc,id.desc".to_string()),
            ])
            .await?;

        let mut seen = HashSet::new();
        Ok(rows
            .into_iter()
            .map(|row| row.phone_number)
            .filter(|phone| seen.insert(phone.clone()))
            .collect())
    }

    async fn messages(&self, phone_number: &str) -> Result<Vec<Message>, StoreError> {
        self.select_all(&[
            ("select", "*".to_string()),
            ("phone_number", format!("eq.{}", phone_number)),
            ("order", "created_at.asc,id.asc".to_string()),
        ])
        .await
    }

    async fn latest_message(&self, phone_number: &str) -> Result<Option<Message>, StoreError> {
        let rows: Vec<Message> = self
            .select(&[
                ("select", "*".to_string()),
                ("phone_number", format!("eq.{}", phone_number)),
                ("order", "created_at.desc".to_string()),
                ("limit", "1".to_string()),
            ])
            .await?;
        Ok(rows.into_iter().next())
    }

    async fn latest_per_phone(&self) -> Result<Vec<Message>, StoreError> {
        // PostgREST has no DISTINCT ON; one newest-first scan does the same.
        let rows: Vec<Message> = self
            .select_all(&[
                ("select", SUMMARY_COLUMNS.to_string()),
                ("order", "created_at.desc,id.desc".to_string()),
            ])
            .await?;

        let mut seen = HashSet::new();
        Ok(rows
            .into_iter()
            .filter(|row| seen.insert(row.phone_number.clone()))
            .collect())
    }

    async fn insert(&self, new: &NewMessage) -> Result<Message, StoreError> {
        new.validate()?;

        let mut body = serde_json::json!({
            "phone_number": new.phone_number,
            "sender_type": new.sender_type,
            "message": new.message,
            "status": DeliveryStatus::Sent,
        });
        if let Some(created_at) = &new.created_at {
            body["created_at"] = serde_json::Value::String(timestamp::format(created_at));
        }

        let response = self
            .request(Method::POST)
            .header("Prefer", "return=representation")
            .header(header::CONTENT_TYPE, "application/json")
            .json(&body)
            .send()
            .await?;
        let response = check(response, true).await?;

        let rows: Vec<Message> = response.json().await?;
        rows.into_iter()
            .next()
            .ok_or_else(|| StoreError::Rejected("insert returned no row".to_string()))
    }

    async fn update_status(&self, id: &MessageId, status: DeliveryStatus) -> Result<Message, StoreError> {
        let predecessors = status.predecessors();
        if !predecessors.is_empty() {
            let allowed = predecessors
                .iter()
                .map(|s| s.as_str())
                .collect::<Vec<_>>()
                .join(",");

            // The status filter makes the transition atomic on the server.
            let response = self
                .request(Method::PATCH)
                .query(&[
                    ("id", format!("eq.{}", id)),
                    ("status", format!("in.({})", allowed)),
                ])
                .header("Prefer", "return=representation")
                .json(&serde_json::json!({ "status": status }))
                .send()
                .await?;
            let response = check(response, true).await?;

            let rows: Vec<Message> = response.json().await?;
            if let Some(updated) = rows.into_iter().next() {
                return Ok(updated);
            }
        }

        match self.fetch_by_id(id).await? {
            None => Err(StoreError::NotFound(id.to_string())),
            Some(current) if current.status == status => Ok(current),
            Some(current) => Err(StoreError::InvalidTransition {
                id: id.to_string(),
                from: current.status,
                to: status,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::SenderRole;
    use axum::{
        extract::{Query, State},
        http::{HeaderMap, StatusCode},
        response::IntoResponse,
        routing::get,
        Json, Router,
    };
    use chrono::{TimeZone, Utc};
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    type Rows = Arc<Mutex<Vec<Message>>>;

    #[derive(Clone)]
    struct Fake {
        rows: Rows,
        /// Most rows a single select returns, like `db-max-rows`.
        max_rows: usize,
    }

    fn authorized(headers: &HeaderMap) -> bool {
        headers.get("apikey").map(|v| v == "anon-key").unwrap_or(false)
            && headers
                .get("authorization")
                .map(|v| v == "Bearer anon-key")
                .unwrap_or(false)
    }

    fn eq_filter<'a>(params: &'a HashMap<String, String>, column: &str) -> Option<&'a str> {
        params.get(column).and_then(|v| v.strip_prefix("eq."))
    }

    async fn select_rows(
        State(fake): State<Fake>,
        headers: HeaderMap,
        Query(params): Query<HashMap<String, String>>,
    ) -> impl IntoResponse {
        if !authorized(&headers) {
            return (StatusCode::UNAUTHORIZED, Json(serde_json::json!([])));
        }

        let mut selected: Vec<Message> = fake
            .rows
            .lock()
            .unwrap()
            .iter()
            .filter(|m| eq_filter(&params, "phone_number").map_or(true, |p| m.phone_number == p))
            .filter(|m| eq_filter(&params, "id").map_or(true, |id| m.id.as_str() == id))
            .cloned()
            .collect();

        let by_time = |a: &Message, b: &Message| a.created_at.cmp(&b.created_at).then_with(|| a.id.as_str().cmp(b.id.as_str()));
        match params.get("order") {
            Some(order) if order.starts_with("created_at.desc") => selected.sort_by(|a, b| by_time(b, a)),
            _ => selected.sort_by(by_time),
        }
        let offset = params.get("offset").and_then(|o| o.parse().ok()).unwrap_or(0);
        let limit = params
            .get("limit")
            .and_then(|l| l.parse().ok())
            .unwrap_or(usize::MAX)
            .min(fake.max_rows);
        let selected: Vec<Message> = selected.into_iter().skip(offset).take(limit).collect();

        (StatusCode::OK, Json(serde_json::to_value(selected).unwrap()))
    }

    async fn insert_row(State(Fake { rows, .. }): State<Fake>, Json(body): Json<serde_json::Value>) -> impl IntoResponse {
        let Some(text) = body.get("message").and_then(|v| v.as_str()) else {
            return (StatusCode::BAD_REQUEST, Json(serde_json::json!({"message": "null value"})));
        };

        let mut rows = rows.lock().unwrap();
        let row = Message {
            id: MessageId::new((rows.len() + 1).to_string()),
            phone_number: body["phone_number"].as_str().unwrap_or_default().to_string(),
            sender_type: serde_json::from_value(body["sender_type"].clone()).unwrap(),
            message: text.to_string(),
            created_at: body
                .get("created_at")
                .and_then(|v| v.as_str())
                .and_then(timestamp::parse)
                .unwrap_or_else(Utc::now),
            status: serde_json::from_value(body["status"].clone()).unwrap(),
            media_url: None,
            metadata: None,
        };
        rows.push(row.clone());
        (StatusCode::CREATED, Json(serde_json::json!([row])))
    }

    async fn patch_row(
        State(Fake { rows, .. }): State<Fake>,
        Query(params): Query<HashMap<String, String>>,
        Json(body): Json<serde_json::Value>,
    ) -> impl IntoResponse {
        let next: DeliveryStatus = serde_json::from_value(body["status"].clone()).unwrap();
        let allowed = params
            .get("status")
            .and_then(|s| s.strip_prefix("in.("))
            .and_then(|s| s.strip_suffix(')'))
            .unwrap_or_default()
            .split(',')
            .map(|s| s.to_string())
            .collect::<Vec<_>>();

        let mut rows = rows.lock().unwrap();
        let mut updated = Vec::new();
        for row in rows.iter_mut() {
            if Some(row.id.as_str()) == eq_filter(&params, "id") && allowed.contains(&row.status.to_string()) {
                row.status = next;
                updated.push(row.clone());
            }
        }
        Json(serde_json::to_value(updated).unwrap())
    }

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{}", addr)
    }

    async fn fake_postgrest() -> (RestStore, Rows) {
        fake_postgrest_capped(usize::MAX).await
    }

    async fn fake_postgrest_capped(max_rows: usize) -> (RestStore, Rows) {
        let rows: Rows = Arc::default();
        let router = Router::new()
            .route(
                "/rest/v1/messages",
                get(select_rows).post(insert_row).patch(patch_row),
            )
            .with_state(Fake {
                rows: rows.clone(),
                max_rows,
            });
        let url = serve(router).await;
        (RestStore::new(url, "anon-key", "messages").unwrap(), rows)
    }

    fn at(minute: u32) -> chrono::DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 10, minute, 0).unwrap()
    }

    #[tokio::test]
    async fn inserts_and_reads_back_through_postgrest() {
        let (store, _) = fake_postgrest().await;

        let created = store
            .insert(&NewMessage::new("+111", "hi", SenderRole::User).at(at(0)))
            .await
            .unwrap();
        store
            .insert(&NewMessage::new("+111", "there", SenderRole::Bot).at(at(5)))
            .await
            .unwrap();
        store
            .insert(&NewMessage::new("+222", "hello", SenderRole::User).at(at(3)))
            .await
            .unwrap();

        assert_eq!(created.status, DeliveryStatus::Sent);

        let messages = store.messages("+111").await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].message, "hi");

        assert_eq!(store.distinct_phone_numbers().await.unwrap(), ["+111", "+222"]);

        let latest = store.latest_per_phone().await.unwrap();
        assert_eq!(latest.len(), 2);
        assert_eq!(latest[0].message, "there");
        assert_eq!(latest[1].message, "hello");

        let newest = store.latest_message("+222").await.unwrap().unwrap();
        assert_eq!(newest.message, "hello");
    }

    #[tokio::test]
    async fn scans_page_past_the_server_row_cap() {
        let (store, _) = fake_postgrest_capped(3).await;
        for (phone, minute) in [("+111", 0), ("+222", 1), ("+333", 2), ("+333", 3), ("+333", 4)] {
            store
                .insert(&NewMessage::new(phone, "hi", SenderRole::User).at(at(minute)))
                .await
                .unwrap();
        }

        assert_eq!(store.distinct_phone_numbers().await.unwrap(), ["+333", "+222", "+111"]);
        let latest: Vec<String> = store
            .latest_per_phone()
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.phone_number)
            .collect();
        assert_eq!(latest, ["+333", "+222", "+111"]);
        assert_eq!(store.messages("+333").await.unwrap().len(), 3);

        let client = crate::store::StoreClient::new(Arc::new(store));
        let summaries = crate::aggregate::load_summaries(&client, crate::aggregate::SummaryStrategy::Aggregate).await;
        let phones: Vec<&str> = summaries.iter().map(|s| s.phone_number.as_str()).collect();
        assert_eq!(phones, ["+333", "+222", "+111"]);
    }

    #[tokio::test]
    async fn rejected_insert_is_reported_as_rejected() {
        let (store, rows) = fake_postgrest().await;
        let invalid = NewMessage::new("+111", "", SenderRole::User);
        assert!(matches!(store.insert(&invalid).await, Err(StoreError::Rejected(_))));
        assert!(rows.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn status_transitions_are_guarded() {
        let (store, _) = fake_postgrest().await;
        let created = store
            .insert(&NewMessage::new("+111", "hi", SenderRole::Agent))
            .await
            .unwrap();

        let delivered = store
            .update_status(&created.id, DeliveryStatus::Delivered)
            .await
            .unwrap();
        assert_eq!(delivered.status, DeliveryStatus::Delivered);

        let again = store
            .update_status(&created.id, DeliveryStatus::Delivered)
            .await
            .unwrap();
        assert_eq!(again.status, DeliveryStatus::Delivered);

        let back = store.update_status(&created.id, DeliveryStatus::Sent).await;
        assert!(matches!(back, Err(StoreError::InvalidTransition { .. })));

        let missing = store
            .update_status(&MessageId::new("404"), DeliveryStatus::Read)
            .await;
        assert!(matches!(missing, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn server_errors_mean_unavailable() {
        let router = Router::new().route(
            "/rest/v1/messages",
            get(|| async { (StatusCode::SERVICE_UNAVAILABLE, "maintenance") }),
        );
        let url = serve(router).await;
        let store = RestStore::new(url, "anon-key", "messages").unwrap();

        let err = store.messages("+111").await.unwrap_err();
        assert!(err.is_unavailable());
    }

    #[tokio::test]
    async fn unreachable_host_means_unavailable() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let store = RestStore::new(format!("http://{}", addr), "anon-key", "messages").unwrap();
        assert!(store.distinct_phone_numbers().await.unwrap_err().is_unavailable());
    }
}
