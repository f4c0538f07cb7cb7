// PostgREST row queries over HTTP.

use std::time::Duration;

use forecourt_core::remote::RemoteError;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION};
use reqwest::StatusCode;
use serde_json::Value;
use tracing::debug;

/// Media type asking PostgREST for exactly one row as a bare object.
const SINGLE_OBJECT: &str = "application/vnd.pgrst.object+json";

/// PostgREST code for "the single-object request matched zero rows".
/// Sent when an object request matched anything but exactly one row.
const SINGULAR_CODE: &str = "PGRST116";
/// The `details` PostgREST attaches to `SINGULAR_CODE` when nothing matched.
const NO_ROWS_DETAILS: &str = "The result contains 0 rows";

/// Build a PostgREST equality filter value.
pub fn eq(value: &str) -> String {
    format!("eq.{value}")
}

// ---------------------------------------------------------------------------
// RestClient
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct RestClient {
    http: reqwest::Client,
    base_url: String,
}

impl RestClient {
    /// `base_url` is the project URL without a trailing slash.
    pub fn new(base_url: &str, anon_key: &str, request_timeout: Duration) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        let mut key = HeaderValue::from_str(anon_key)?;
        key.set_sensitive(true);
        headers.insert("apikey", key);
        let mut bearer = HeaderValue::from_str(&format!("Bearer {anon_key}"))?;
        bearer.set_sensitive(true);
        headers.insert(AUTHORIZATION, bearer);

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(request_timeout)
            .build()?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn table_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{table}", self.base_url)
    }

    /// Exactly one row. Zero rows is [`RemoteError::NotFound`].
    pub async fn select_one(&self, table: &str, query: &[(&str, String)]) -> Result<Value, RemoteError> {
        let request = self
            .http
            .get(self.table_url(table))
            .header(ACCEPT, SINGLE_OBJECT)
            .query(query);
        self.execute(table, request).await
    }

    /// Every matching row, in the order the query asks for.
    pub async fn select_many(
        &self,
        table: &str,
        query: &[(&str, String)],
    ) -> Result<Vec<Value>, RemoteError> {
        let request = self.http.get(self.table_url(table)).query(query);
        match self.execute(table, request).await? {
            Value::Array(rows) => Ok(rows),
            other => Err(RemoteError::Decode(format!(
                "expected an array of {table} rows, got {}",
                type_name(&other)
            ))),
        }
    }

    /// At most one row.
    pub async fn select_first(
        &self,
        table: &str,
        query: &[(&str, String)],
    ) -> Result<Option<Value>, RemoteError> {
        let mut query = query.to_vec();
        query.push(("limit", "1".to_string()));
        Ok(self.select_many(table, &query).await?.into_iter().next())
    }

    async fn execute(&self, table: &str, request: reqwest::RequestBuilder) -> Result<Value, RemoteError> {
        let response = request.send().await.map_err(|e| classify_transport(&e))?;
        let status = response.status();
        let body = response.text().await.map_err(|e| classify_transport(&e))?;
        debug!("GET {table} -> {status} ({} bytes)", body.len());

        if !status.is_success() {
            return Err(classify_status(status, &body));
        }
        serde_json::from_str(&body).map_err(|e| RemoteError::Decode(e.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Error classification
// ---------------------------------------------------------------------------

/// Map a non-success response. Only a zero-row single-object reply is a
/// definitive not-found.
pub fn classify_status(status: StatusCode, body: &str) -> RemoteError {
    let parsed: Option<Value> = serde_json::from_str(body).ok();
    let field = |name: &str| {
        parsed
            .as_ref()
            .and_then(|v| v.get(name))
            .and_then(Value::as_str)
            .map(str::to_string)
    };

    // PGRST116 also covers several matching rows; only zero rows is a miss.
    if status == StatusCode::NOT_ACCEPTABLE
        && field("code").as_deref() == Some(SINGULAR_CODE)
        && field("details").as_deref() == Some(NO_ROWS_DETAILS)
    {
        return RemoteError::NotFound;
    }
    let message = field("message").unwrap_or_else(|| {
        status
            .canonical_reason()
            .unwrap_or("unexpected status")
            .to_string()
    });
    RemoteError::Server {
        status: status.as_u16(),
        message,
    }
}

pub fn classify_transport(err: &reqwest::Error) -> RemoteError {
    if err.is_timeout() {
        RemoteError::Timeout
    } else if err.is_connect() {
        RemoteError::Unreachable(err.to_string())
    } else if err.is_decode() {
        RemoteError::Decode(err.to_string())
    } else {
        RemoteError::Unreachable(err.to_string())
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;

    /// Serve one canned HTTP response and hand back the raw request text.
    async fn serve_once(status_line: &str, body: &str) -> (String, oneshot::Receiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let response = format!(
            "HTTP/1.1 {status_line}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        );
        let (req_tx, req_rx) = oneshot::channel();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 8192];
            let n = socket.read(&mut buf).await.unwrap();
            let _ = req_tx.send(String::from_utf8_lossy(&buf[..n]).to_string());
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.flush().await.unwrap();
        });

        (format!("http://{addr}"), req_rx)
    }

    fn client(base: &str) -> RestClient {
        RestClient::new(base, "anon-key", Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn zero_row_object_reply_is_not_found() {
        let body = r#"{"code":"PGRST116","details":"The result contains 0 rows","message":"JSON object requested, multiple (or no) rows returned"}"#;
        assert_eq!(classify_status(StatusCode::NOT_ACCEPTABLE, body), RemoteError::NotFound);
    }

    #[test]
    fn multi_row_object_reply_is_server_error() {
        let body = r#"{"code":"PGRST116","details":"The result contains 2 rows","message":"JSON object requested, multiple (or no) rows returned"}"#;
        assert_eq!(
            classify_status(StatusCode::NOT_ACCEPTABLE, body),
            RemoteError::Server {
                status: 406,
                message: "JSON object requested, multiple (or no) rows returned".into()
            }
        );
        assert!(matches!(
            classify_status(StatusCode::NOT_ACCEPTABLE, r#"{"code":"PGRST116"}"#),
            RemoteError::Server { status: 406, .. }
        ));
    }

    #[test]
    fn other_statuses_are_server_errors() {
        assert_eq!(
            classify_status(StatusCode::SERVICE_UNAVAILABLE, ""),
            RemoteError::Server {
                status: 503,
                message: "Service Unavailable".into()
            }
        );
        // A 406 for any other reason is not a missing record.
        assert_eq!(
            classify_status(StatusCode::NOT_ACCEPTABLE, r#"{"code":"PGRST107","message":"bad accept"}"#),
            RemoteError::Server {
                status: 406,
                message: "bad accept".into()
            }
        );
        assert!(matches!(
            classify_status(StatusCode::UNAUTHORIZED, r#"{"message":"Invalid API key"}"#),
            RemoteError::Server { status: 401, .. }
        ));
    }

    #[test]
    fn table_url_trims_trailing_slash() {
        let c = client("https://abc.supabase.co/");
        assert_eq!(c.table_url("tanks"), "https://abc.supabase.co/rest/v1/tanks");
        assert_eq!(eq("S1"), "eq.S1");
    }

    #[tokio::test]
    async fn single_row_request_carries_headers_and_filters() {
        let (base, req_rx) = serve_once("200 OK", r#"{"station_id":"S1","name":"Highway"}"#).await;
        let row = client(&base)
            .select_one("stations", &[("select", "*".into()), ("station_id", eq("S1"))])
            .await
            .unwrap();
        assert_eq!(row["name"], "Highway");

        let request = req_rx.await.unwrap().to_lowercase();
        assert!(request.starts_with("get /rest/v1/stations?select=*&station_id=eq.s1 "), "{request}");
        assert!(request.contains("apikey: anon-key"));
        assert!(request.contains("authorization: bearer anon-key"));
        assert!(request.contains("accept: application/vnd.pgrst.object+json"));
    }

    #[tokio::test]
    async fn missing_row_over_the_wire() {
        let (base, _req) = serve_once(
            "406 Not Acceptable",
            r#"{"code":"PGRST116","details":"The result contains 0 rows","hint":null,"message":"no rows"}"#,
        )
        .await;
        let result = client(&base)
            .select_one("stations", &[("station_id", eq("GONE"))])
            .await;
        assert_eq!(result, Err(RemoteError::NotFound));
    }

    #[tokio::test]
    async fn first_row_of_empty_result_is_none() {
        let (base, req_rx) = serve_once("200 OK", "[]").await;
        let row = client(&base)
            .select_first("staff", &[("phone", eq("555"))])
            .await
            .unwrap();
        assert!(row.is_none());
        assert!(req_rx.await.unwrap().contains("limit=1"));
    }

    #[tokio::test]
    async fn malformed_body_is_decode_error() {
        let (base, _req) = serve_once("200 OK", "{not json").await;
        let result = client(&base).select_one("system_settings", &[]).await;
        assert!(matches!(result, Err(RemoteError::Decode(_))));
    }

    #[tokio::test]
    async fn refused_connection_is_unreachable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let result = client(&format!("http://{addr}"))
            .select_many("tanks", &[])
            .await;
        assert!(matches!(result, Err(RemoteError::Unreachable(_))));
    }

    #[tokio::test]
    async fn silent_server_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (_socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(10)).await;
        });

        let c = RestClient::new(&format!("http://{addr}"), "k", Duration::from_millis(200)).unwrap();
        assert_eq!(c.select_many("tanks", &[]).await, Err(RemoteError::Timeout));
    }
}
