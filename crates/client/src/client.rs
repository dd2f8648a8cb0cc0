use mlconsole_config::{ApiSettings, Settings};
use reqwest::header::LOCATION;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, Method, RequestBuilder, Response, Url};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::auth::{TokenManager, TokenPair};
use crate::error::{ClientError, ClientResult};
use crate::submission::TaskSubmission;

/// One file part of a multipart upload.
#[derive(Debug, Clone)]
pub struct UploadFile {
    pub field: String,
    pub file_name: String,
    pub mime: Option<String>,
    pub bytes: Vec<u8>,
}

/// Multipart upload body: file parts plus plain text fields.
#[derive(Debug, Clone, Default)]
pub struct Upload {
    pub files: Vec<UploadFile>,
    pub fields: Vec<(String, String)>,
}

impl Upload {
    pub fn file(mut self, file: UploadFile) -> Self {
        self.files.push(file);
        self
    }

    pub fn field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.push((name.into(), value.into()));
        self
    }

    fn into_form(self) -> ClientResult<Form> {
        let mut form = Form::new();
        for (name, value) in self.fields {
            form = form.text(name, value);
        }
        for file in self.files {
            let mut part = Part::bytes(file.bytes).file_name(file.file_name);
            if let Some(mime) = file.mime {
                part = part.mime_str(&mime)?;
            }
            form = form.part(file.field, part);
        }
        Ok(form)
    }
}

/// Authenticated client for the platform backend API.
#[derive(Clone)]
pub struct ApiClient {
    http: Client,
    api: ApiSettings,
    /// `api.base_url` with a trailing slash, so relative paths extend it.
    base: Url,
    tokens: Arc<TokenManager>,
}

impl ApiClient {
    pub fn new(api: ApiSettings, refresh_path: &str, refresh_skew: std::time::Duration) -> ClientResult<Self> {
        let http = Client::builder().timeout(api.timeout()).build()?;
        let base = parse_base(&api.base_url)?;
        let refresh_url = resolve_url(&base, refresh_path);
        Ok(Self {
            http,
            api,
            base,
            tokens: Arc::new(TokenManager::new(refresh_url, refresh_skew)),
        })
    }

    /// Builds a client from settings, seeding it with any configured tokens.
    pub async fn from_settings(settings: &Settings) -> ClientResult<Self> {
        let client = Self::new(
            settings.api.clone(),
            &settings.auth.refresh_path,
            settings.auth.refresh_skew(),
        )?;

        if let Some(access_token) = settings.auth.access_token.clone() {
            client
                .tokens
                .set_tokens(TokenPair {
                    access_token,
                    refresh_token: settings.auth.refresh_token.clone(),
                    expires_in: None,
                })
                .await;
        } else if let Some(refresh_token) = settings.auth.refresh_token.clone() {
            client.tokens.set_refresh_token(refresh_token).await;
        }

        Ok(client)
    }

    pub fn tokens(&self) -> &Arc<TokenManager> {
        &self.tokens
    }

    pub fn settings(&self) -> &ApiSettings {
        &self.api
    }

    /// Resolves an API path against the base URL.
    ///
    /// Absolute URLs pass through. A root-relative path that already starts with
    /// the base path (a `Location` header such as `/api/tasks/7`) is resolved from
    /// the host root; any other path is relative to the base URL.
    pub fn url(&self, path: &str) -> String {
        resolve_url(&self.base, path)
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> ClientResult<T> {
        let resp = self.send(self.request(Method::GET, path)).await?;
        decode(resp).await
    }

    pub async fn post<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> ClientResult<T> {
        let resp = self.send(self.request(Method::POST, path).json(body)).await?;
        decode(resp).await
    }

    pub async fn put<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> ClientResult<T> {
        let resp = self.send(self.request(Method::PUT, path).json(body)).await?;
        decode(resp).await
    }

    pub async fn patch<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> ClientResult<T> {
        let resp = self.send(self.request(Method::PATCH, path).json(body)).await?;
        decode(resp).await
    }

    pub async fn delete(&self, path: &str) -> ClientResult<()> {
        self.send(self.request(Method::DELETE, path)).await?;
        Ok(())
    }

    pub async fn upload<T: DeserializeOwned>(&self, path: &str, upload: Upload) -> ClientResult<T> {
        let form = upload.into_form()?;
        let resp = self
            .send(self.request(Method::POST, path).multipart(form))
            .await?;
        decode(resp).await
    }

    /// Uploads a file from disk as a single multipart part named `field`.
    pub async fn upload_path<T: DeserializeOwned>(
        &self,
        path: &str,
        field: &str,
        file_path: &Path,
        fields: Vec<(String, String)>,
    ) -> ClientResult<T> {
        let bytes = tokio::fs::read(file_path).await?;
        let file_name = file_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("upload")
            .to_string();

        let upload = Upload {
            files: vec![UploadFile {
                field: field.to_string(),
                file_name,
                mime: None,
                bytes,
            }],
            fields,
        };
        self.upload(path, upload).await
    }

    /// Issues a request that starts a long-running backend job and extracts the
    /// resulting task handle and its location.
    pub async fn submit(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> ClientResult<TaskSubmission> {
        let mut builder = self.request(method, path);
        if let Some(body) = body {
            builder = builder.json(body);
        }
        let resp = self.send(builder).await?;

        let status = resp.status();
        let request_url = resp.url().clone();
        let location = resp
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let bytes = resp.bytes().await?;
        let body = if bytes.is_empty() {
            None
        } else {
            Some(serde_json::from_slice::<Value>(&bytes)?)
        };

        let submission = TaskSubmission::from_parts(
            status,
            &request_url,
            location.as_deref(),
            body.as_ref(),
            |id| self.url(&self.api.task_path_for(id.as_str())),
        )?;
        debug!(
            task_id = %submission.task.id,
            location = %submission.location,
            "Background task submitted"
        );
        Ok(submission)
    }

    /// Fetches a task resource as raw JSON so the caller can judge its shape.
    pub async fn fetch_task_resource(&self, location: &str) -> ClientResult<Value> {
        self.get::<Value>(location).await
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.http.request(method, self.url(path))
    }

    /// Attaches the bearer token, sends, and turns non-2xx responses into
    /// [`ClientError::Http`].
    async fn send(&self, builder: RequestBuilder) -> ClientResult<Response> {
        let builder = match self.tokens.bearer(&self.http).await? {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        };

        let resp = builder.send().await?;
        let status = resp.status();
        debug!(url = %resp.url(), %status, "API response");

        if status.is_success() {
            return Ok(resp);
        }

        let url = resp.url().to_string();
        let raw = resp.text().await.unwrap_or_default();
        let err = ClientError::from_status(status, &raw);
        warn!(%url, %status, error = %err, "API request failed");
        Err(err)
    }
}

async fn decode<T: DeserializeOwned>(resp: Response) -> ClientResult<T> {
    let bytes = resp.bytes().await?;
    if bytes.is_empty() {
        return Ok(serde_json::from_value(Value::Null)?);
    }
    Ok(serde_json::from_slice(&bytes)?)
}

fn parse_base(base_url: &str) -> ClientResult<Url> {
    let mut base = Url::parse(base_url)
        .map_err(|e| ClientError::InvalidRequest(format!("invalid base_url {base_url:?}: {e}")))?;
    if !base.path().ends_with('/') {
        let path = format!("{}/", base.path());
        base.set_path(&path);
    }
    Ok(base)
}

fn resolve_url(base: &Url, path: &str) -> String {
    if let Ok(absolute) = Url::parse(path) {
        return absolute.to_string();
    }
    let relative = if path.starts_with(base.path()) {
        path
    } else {
        path.trim_start_matches('/')
    };
    match base.join(relative) {
        Ok(url) => url.to_string(),
        Err(_) => format!("{}{}", base, path.trim_start_matches('/')),
    }
}
