use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{Client, Response, StatusCode, Url};
use serde::Deserialize;

use super::{ObjectStore, ObjectStoreError};

const API_BASE: &str = "https://storage.googleapis.com/storage/v1/b";
const UPLOAD_BASE: &str = "https://storage.googleapis.com/upload/storage/v1/b";
const SCOPE: &str = "https://www.googleapis.com/auth/devstorage.read_write";

/// Google Cloud Storage backend using the JSON API.
pub struct GcsStore {
    bucket: String,
    client: Client,
    access_token: tokio::sync::RwLock<String>,
    credentials_file: Option<String>,
}

#[derive(Deserialize)]
struct ServiceAccountKey {
    client_email: String,
    private_key: String,
    token_uri: String,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListResponse {
    #[serde(default)]
    items: Vec<ListItem>,
    next_page_token: Option<String>,
}

#[derive(Deserialize)]
struct ListItem {
    name: String,
}

impl GcsStore {
    pub async fn new(bucket: &str, credentials_file: Option<&str>) -> Result<Self, anyhow::Error> {
        let store = Self {
            bucket: bucket.to_string(),
            client: Client::builder().build()?,
            access_token: tokio::sync::RwLock::new(String::new()),
            credentials_file: credentials_file.map(str::to_string),
        };

        store.refresh_token().await?;
        Ok(store)
    }

    async fn refresh_token(&self) -> Result<(), anyhow::Error> {
        let token = match self.credentials_file.as_deref() {
            Some(path) => self.token_from_service_account(path).await?,
            None => self.token_from_metadata_server().await?,
        };

        *self.access_token.write().await = token;
        Ok(())
    }

    async fn token_from_service_account(&self, path: &str) -> Result<String, anyhow::Error> {
        let key: ServiceAccountKey = serde_json::from_str(&tokio::fs::read_to_string(path).await?)?;

        let now = chrono::Utc::now().timestamp();
        let header = base64_url_encode(&serde_json::to_vec(&serde_json::json!({
            "alg": "RS256",
            "typ": "JWT"
        }))?);
        let claims = base64_url_encode(&serde_json::to_vec(&serde_json::json!({
            "iss": key.client_email,
            "scope": SCOPE,
            "aud": key.token_uri,
            "iat": now,
            "exp": now + 3600,
        }))?);
        let unsigned = format!("{header}.{claims}");
        let signature = sign_rs256(unsigned.as_bytes(), &key.private_key)?;
        let assertion = format!("{unsigned}.{}", base64_url_encode(&signature));

        let resp: TokenResponse = self
            .client
            .post(&key.token_uri)
            .form(&[
                ("grant_type", "urn:ietf:params:oauth:grant-type:jwt-bearer"),
                ("assertion", assertion.as_str()),
            ])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        Ok(resp.access_token)
    }

    async fn token_from_metadata_server(&self) -> Result<String, anyhow::Error> {
        let resp: TokenResponse = self
            .client
            .get("http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token")
            .header("Metadata-Flavor", "Google")
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        Ok(resp.access_token)
    }

    async fn token(&self) -> String {
        self.access_token.read().await.clone()
    }

    /// `.../b/{bucket}/o/{key}` with the key percent-encoded as one path segment.
    fn object_url(&self, key: &str) -> Result<Url, ObjectStoreError> {
        let mut url = self.bucket_url(API_BASE)?;
        url.path_segments_mut()
            .map_err(|_| ObjectStoreError::Backend("GCS base URL cannot hold a path".into()))?
            .push(key);
        Ok(url)
    }

    /// `.../b/{bucket}/o`
    fn bucket_url(&self, base: &str) -> Result<Url, ObjectStoreError> {
        let mut url = Url::parse(base).map_err(|e| ObjectStoreError::Backend(e.to_string()))?;
        url.path_segments_mut()
            .map_err(|_| ObjectStoreError::Backend("GCS base URL cannot hold a path".into()))?
            .push(&self.bucket)
            .push("o");
        Ok(url)
    }

    /// Turn a non-success response into an error. A 401 also refreshes the
    /// token so the next attempt (a broker redelivery) can succeed.
    async fn check(&self, resp: Response, action: &str) -> Result<Response, ObjectStoreError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }

        if status == StatusCode::UNAUTHORIZED {
            if let Err(e) = self.refresh_token().await {
                tracing::warn!(error = %e, "Failed to refresh GCS access token");
            }
        }

        let body = resp.text().await.unwrap_or_default();
        Err(ObjectStoreError::Backend(format!(
            "GCS {action} failed ({status}): {body}"
        )))
    }
}

fn transport(e: reqwest::Error) -> ObjectStoreError {
    ObjectStoreError::Backend(e.to_string())
}

#[async_trait]
impl ObjectStore for GcsStore {
    async fn put(
        &self,
        key: &str,
        data: Bytes,
        content_type: &str,
    ) -> Result<(), ObjectStoreError> {
        let mut url = self.bucket_url(UPLOAD_BASE)?;
        url.query_pairs_mut()
            .append_pair("uploadType", "media")
            .append_pair("name", key);

        let resp = self
            .client
            .post(url)
            .bearer_auth(self.token().await)
            .header("Content-Type", content_type)
            .body(data)
            .send()
            .await
            .map_err(transport)?;

        self.check(resp, "upload").await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Bytes, ObjectStoreError> {
        let mut url = self.object_url(key)?;
        url.query_pairs_mut().append_pair("alt", "media");

        let resp = self
            .client
            .get(url)
            .bearer_auth(self.token().await)
            .send()
            .await
            .map_err(transport)?;

        if resp.status() == StatusCode::NOT_FOUND {
            return Err(ObjectStoreError::NotFound(key.to_string()));
        }

        self.check(resp, "download")
            .await?
            .bytes()
            .await
            .map_err(transport)
    }

    async fn delete(&self, key: &str) -> Result<(), ObjectStoreError> {
        let resp = self
            .client
            .delete(self.object_url(key)?)
            .bearer_auth(self.token().await)
            .send()
            .await
            .map_err(transport)?;

        // Already gone counts as deleted.
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }

        self.check(resp, "delete").await?;
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, ObjectStoreError> {
        let resp = self
            .client
            .get(self.object_url(key)?)
            .bearer_auth(self.token().await)
            .send()
            .await
            .map_err(transport)?;

        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }

        self.check(resp, "metadata lookup").await?;
        Ok(true)
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, ObjectStoreError> {
        let mut keys = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut url = self.bucket_url(API_BASE)?;
            {
                let mut query = url.query_pairs_mut();
                query.append_pair("prefix", prefix).append_pair("fields", "items(name),nextPageToken");
                if let Some(token) = page_token.as_deref() {
                    query.append_pair("pageToken", token);
                }
            }

            let resp = self
                .client
                .get(url)
                .bearer_auth(self.token().await)
                .send()
                .await
                .map_err(transport)?;

            let page: ListResponse = self
                .check(resp, "list")
                .await?
                .json()
                .await
                .map_err(transport)?;

            keys.extend(page.items.into_iter().map(|item| item.name));
            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }

        Ok(keys)
    }
}

fn base64_url_encode(data: &[u8]) -> String {
    use base64::Engine;
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(data)
}

fn sign_rs256(data: &[u8], private_key_pem: &str) -> Result<Vec<u8>, anyhow::Error> {
    use base64::Engine;

    let der_b64: String = private_key_pem
        .lines()
        .filter(|line| !line.starts_with("-----"))
        .collect();
    let der = base64::engine::general_purpose::STANDARD.decode(der_b64)?;

    let key_pair = ring::signature::RsaKeyPair::from_pkcs8(&der)
        .map_err(|e| anyhow::anyhow!("Failed to parse RSA key: {e}"))?;

    let mut signature = vec![0u8; key_pair.public().modulus_len()];
    key_pair
        .sign(
            &ring::signature::RSA_PKCS1_SHA256,
            &ring::rand::SystemRandom::new(),
            data,
            &mut signature,
        )
        .map_err(|e| anyhow::anyhow!("Failed to sign: {e}"))?;

    Ok(signature)
}
