use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::config::{self, AppConfig};
use crate::error::JournalError;
use crate::model::{Entry, EntryFields, EntryId, EntryPatch};

/// Shown after a password-reset request whatever the account state is.
pub const FORGOT_PASSWORD_NOTICE: &str =
    "If an account with that email exists, a reset link has been sent.";

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct Account {
    pub email: String,
    #[serde(default)]
    pub is_premium: bool,
    #[serde(default)]
    pub feedback_count: u32,
}

/// The backend contract. Every journal call takes the caller's bearer token.
#[async_trait]
pub trait JournalApi: Send + Sync + 'static {
    async fn login(&self, username: &str, password: &str) -> Result<String, JournalError>;
    async fn register(&self, email: &str, password: &str) -> Result<(), JournalError>;
    async fn forgot_password(&self, email: &str) -> Result<String, JournalError>;
    async fn reset_password(&self, token: &str, new_password: &str) -> Result<(), JournalError>;
    async fn account(&self, bearer: &str) -> Result<Account, JournalError>;

    async fn list_entries(
        &self,
        bearer: &str,
        skip: u32,
        limit: u32,
    ) -> Result<Vec<Entry>, JournalError>;
    async fn create_entry(&self, bearer: &str, fields: &EntryFields)
        -> Result<Entry, JournalError>;
    async fn update_entry(
        &self,
        bearer: &str,
        id: EntryId,
        fields: &EntryFields,
    ) -> Result<EntryPatch, JournalError>;
    async fn delete_entry(&self, bearer: &str, id: EntryId) -> Result<(), JournalError>;
    async fn request_feedback(&self, bearer: &str, id: EntryId) -> Result<String, JournalError>;
}

pub struct ApiClient {
    client: Client,
    base_url: String,
}

impl ApiClient {
    pub fn new(base_url: &str, timeout: std::time::Duration) -> Result<Self, JournalError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| JournalError::Unreachable(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn from_config(app_config: &AppConfig) -> Result<Self, JournalError> {
        Self::new(
            &config::get_api_base_url(app_config),
            app_config.general.request_timeout(),
        )
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.client
            .request(method, format!("{}{}", self.base_url, path))
    }

    /// Sends exactly once; no call is retried.
    async fn send(&self, builder: RequestBuilder) -> Result<Response, JournalError> {
        let resp = builder.send().await.map_err(|e| {
            tracing::warn!("api: transport failure: {}", e);
            JournalError::Unreachable(e.to_string())
        })?;
        check_status(resp).await
    }

    async fn authenticated<T: Serialize + ?Sized>(
        &self,
        method: Method,
        path: &str,
        bearer: &str,
        body: Option<&T>,
    ) -> Result<Response, JournalError> {
        let mut builder = self.request(method, path).bearer_auth(bearer);
        if let Some(b) = body {
            builder = builder.json(b);
        }
        self.send(builder).await
    }
}

async fn check_status(resp: Response) -> Result<Response, JournalError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    tracing::debug!("api: {} response", status);
    Err(rejection(status, &body))
}

fn rejection(status: StatusCode, body: &str) -> JournalError {
    match status {
        StatusCode::UNAUTHORIZED => JournalError::Unauthenticated,
        StatusCode::NOT_FOUND => JournalError::NotFound,
        _ => JournalError::RequestRejected {
            status: status.as_u16(),
            detail: extract_detail(body).unwrap_or_else(|| {
                status
                    .canonical_reason()
                    .unwrap_or("Something went wrong.")
                    .to_string()
            }),
        },
    }
}

/// Reads `{detail}`; validation errors carry a list of `{msg}` objects instead.
fn extract_detail(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    match &value["detail"] {
        serde_json::Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        serde_json::Value::Array(items) => items
            .iter()
            .find_map(|item| item["msg"].as_str())
            .map(str::to_string),
        _ => None,
    }
}

async fn decode<T: DeserializeOwned>(resp: Response) -> Result<T, JournalError> {
    resp.json::<T>()
        .await
        .map_err(|e| JournalError::Malformed(e.to_string()))
}

#[async_trait]
impl JournalApi for ApiClient {
    async fn login(&self, username: &str, password: &str) -> Result<String, JournalError> {
        let builder = self
            .request(Method::POST, "/login")
            .form(&[("username", username), ("password", password)]);
        let resp = self.send(builder).await.map_err(|e| match e {
            // The login endpoint answers 401 for bad credentials.
            JournalError::Unauthenticated => JournalError::RequestRejected {
                status: 401,
                detail: "Invalid credentials".to_string(),
            },
            other => other,
        })?;

        #[derive(Deserialize)]
        struct TokenRes {
            access_token: String,
        }
        let res: TokenRes = decode(resp).await?;
        if res.access_token.trim().is_empty() {
            return Err(JournalError::Malformed("empty access token".to_string()));
        }
        Ok(res.access_token)
    }

    async fn register(&self, email: &str, password: &str) -> Result<(), JournalError> {
        let body = serde_json::json!({ "email": email, "password": password });
        self.send(self.request(Method::POST, "/register").json(&body))
            .await?;
        Ok(())
    }

    async fn forgot_password(&self, email: &str) -> Result<String, JournalError> {
        let body = serde_json::json!({ "email": email });
        self.send(self.request(Method::POST, "/forgot-password").json(&body))
            .await?;
        Ok(FORGOT_PASSWORD_NOTICE.to_string())
    }

    async fn reset_password(&self, token: &str, new_password: &str) -> Result<(), JournalError> {
        let body = serde_json::json!({ "token": token, "new_password": new_password });
        self.send(self.request(Method::POST, "/reset-password").json(&body))
            .await?;
        Ok(())
    }

    async fn account(&self, bearer: &str) -> Result<Account, JournalError> {
        let resp = self
            .authenticated::<()>(Method::GET, "/me", bearer, None)
            .await?;
        decode(resp).await
    }

    async fn list_entries(
        &self,
        bearer: &str,
        skip: u32,
        limit: u32,
    ) -> Result<Vec<Entry>, JournalError> {
        let builder = self
            .request(Method::GET, "/journal")
            .bearer_auth(bearer)
            .query(&[("skip", skip), ("limit", limit)]);
        let resp = self.send(builder).await?;
        decode(resp).await
    }

    async fn create_entry(
        &self,
        bearer: &str,
        fields: &EntryFields,
    ) -> Result<Entry, JournalError> {
        let resp = self
            .authenticated(Method::POST, "/journal", bearer, Some(fields))
            .await?;
        decode(resp).await
    }

    async fn update_entry(
        &self,
        bearer: &str,
        id: EntryId,
        fields: &EntryFields,
    ) -> Result<EntryPatch, JournalError> {
        let path = format!("/journal/{}", id);
        let resp = self
            .authenticated(Method::PUT, &path, bearer, Some(fields))
            .await?;
        decode(resp).await
    }

    async fn delete_entry(&self, bearer: &str, id: EntryId) -> Result<(), JournalError> {
        let path = format!("/journal/{}", id);
        self.authenticated::<()>(Method::DELETE, &path, bearer, None)
            .await?;
        Ok(())
    }

    async fn request_feedback(&self, bearer: &str, id: EntryId) -> Result<String, JournalError> {
        let path = format!("/ai-feedback/{}", id);
        let resp = self
            .authenticated::<()>(Method::POST, &path, bearer, None)
            .await?;

        #[derive(Deserialize)]
        struct FeedbackRes {
            feedback: Option<String>,
        }
        let res: FeedbackRes = decode(resp).await?;
        Ok(res.feedback.unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detail_string_and_validation_list() {
        assert_eq!(
            extract_detail(r#"{"detail": "Email already registered"}"#).as_deref(),
            Some("Email already registered")
        );
        assert_eq!(
            extract_detail(r#"{"detail": [{"loc": ["body"], "msg": "field required"}]}"#)
                .as_deref(),
            Some("field required")
        );
        assert_eq!(extract_detail("<html>oops</html>"), None);
        assert_eq!(extract_detail(r#"{"detail": ""}"#), None);
    }

    #[test]
    fn status_mapping() {
        assert_eq!(
            rejection(StatusCode::UNAUTHORIZED, ""),
            JournalError::Unauthenticated
        );
        assert_eq!(rejection(StatusCode::NOT_FOUND, "{}"), JournalError::NotFound);
        assert_eq!(
            rejection(StatusCode::FORBIDDEN, r#"{"detail": "Upgrade to continue"}"#),
            JournalError::RequestRejected {
                status: 403,
                detail: "Upgrade to continue".to_string()
            }
        );
        assert_eq!(
            rejection(StatusCode::INTERNAL_SERVER_ERROR, "boom"),
            JournalError::RequestRejected {
                status: 500,
                detail: "Internal Server Error".to_string()
            }
        );
    }

    #[test]
    fn base_url_is_normalized() {
        let client =
            ApiClient::new("http://localhost:8000/", std::time::Duration::from_secs(1)).unwrap();
        assert_eq!(client.base_url(), "http://localhost:8000");
    }

    #[tokio::test]
    async fn unreachable_backend_maps_to_unreachable() {
        // Nothing listens on the discard port.
        let client =
            ApiClient::new("http://127.0.0.1:9", std::time::Duration::from_millis(500)).unwrap();
        let err = client.list_entries("token", 0, 5).await.unwrap_err();
        assert!(matches!(err, JournalError::Unreachable(_)), "{err:?}");
    }
}
