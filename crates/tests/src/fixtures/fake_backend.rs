use axum::extract::{Multipart, Path, Request, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use chrono::Utc;
use jsonwebtoken::{EncodingKey, Header, encode};
use mlconsole_client::ApiClient;
use mlconsole_config::{ApiSettings, AuthSettings, Settings, TaskSettings};
use mlconsole_services::Session;
use serde_json::{Value, json};
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

pub const PASSWORD: &str = "secret";

/// One scripted answer of the task resource endpoint.
#[derive(Debug, Clone)]
pub enum Reply {
    Task(Value),
    Error(u16, Value),
    Delayed(Duration, Value),
}

impl Reply {
    pub fn status(id: &str, status: &str) -> Self {
        Reply::Task(json!({ "id": id, "status": status }))
    }

    pub fn unavailable() -> Self {
        Reply::Error(503, json!({ "message": "Service temporarily unavailable" }))
    }
}

#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: String,
    pub path: String,
    pub authorization: Option<String>,
}

#[derive(Default)]
pub struct BackendState {
    scripts: Mutex<HashMap<String, VecDeque<Reply>>>,
    next_job_script: Mutex<Option<Vec<Reply>>>,
    requests: Mutex<Vec<RecordedRequest>>,
    jobs_created: AtomicUsize,
    refreshes: AtomicUsize,
}

impl BackendState {
    /// Pops the next scripted reply. The last reply of a script is sticky so a
    /// task keeps reporting its final state.
    fn next_reply(&self, id: &str) -> Option<Reply> {
        let mut scripts = self.scripts.lock().unwrap();
        let script = scripts.get_mut(id)?;
        if script.len() > 1 {
            script.pop_front()
        } else {
            script.front().cloned()
        }
    }
}

/// An in-process stand-in for the platform backend, served by axum on a random
/// local port.
pub struct FakeBackend {
    pub addr: SocketAddr,
    pub base_url: String,
    pub state: Arc<BackendState>,
}

impl FakeBackend {
    pub async fn spawn() -> Self {
        let state = Arc::new(BackendState::default());
        let app = router(state.clone());

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind to random port");
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            addr,
            base_url: format!("http://{}/api", addr),
            state,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Settings pointing at this backend, with a short poll interval.
    pub fn settings(&self) -> Settings {
        Settings {
            api: ApiSettings {
                base_url: self.base_url.clone(),
                timeout_secs: 5,
                task_path: "/tasks/{id}".to_string(),
            },
            auth: AuthSettings {
                access_token: None,
                refresh_token: None,
                refresh_path: "/auth/refresh".to_string(),
                refresh_skew_secs: 60,
            },
            tasks: TaskSettings {
                default_interval_ms: 20,
                intervals: HashMap::new(),
                max_poll_secs: None,
                history_limit: 10,
                event_capacity: 64,
            },
        }
    }

    pub async fn client(&self) -> ApiClient {
        ApiClient::from_settings(&self.settings())
            .await
            .expect("Failed to build API client")
    }

    pub async fn session(&self) -> Session {
        Session::from_settings(&self.settings())
            .await
            .expect("Failed to build session")
    }

    /// A session that has already logged in with a long-lived token.
    pub async fn logged_in_session(&self) -> Session {
        let session = self.session().await;
        session
            .login("/auth/login", &json!({ "username": "alice", "password": PASSWORD }))
            .await
            .expect("Login failed");
        session
    }

    pub fn script_task(&self, id: &str, replies: Vec<Reply>) {
        self.state
            .scripts
            .lock()
            .unwrap()
            .insert(id.to_string(), replies.into());
    }

    /// Script used for the task created by the next job submission.
    pub fn script_next_job(&self, replies: Vec<Reply>) {
        *self.state.next_job_script.lock().unwrap() = Some(replies);
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.state.requests.lock().unwrap().clone()
    }

    pub fn requests_to(&self, path: &str) -> Vec<RecordedRequest> {
        self.requests()
            .into_iter()
            .filter(|r| r.path == path)
            .collect()
    }

    pub fn polls_of(&self, task_id: &str) -> usize {
        self.requests_to(&format!("/api/tasks/{task_id}")).len()
    }

    pub fn refresh_count(&self) -> usize {
        self.state.refreshes.load(Ordering::SeqCst)
    }
}

fn router(state: Arc<BackendState>) -> Router {
    let api = Router::new()
        .route("/auth/login", post(login))
        .route("/auth/refresh", post(refresh))
        .route("/jobs/{kind}", post(create_job))
        .route("/tasks/{id}", get(get_task))
        .route("/datasets", get(list_datasets))
        .route("/datasets/upload", post(upload))
        .route(
            "/datasets/{name}",
            put(echo_dataset).patch(echo_dataset).delete(delete_dataset),
        )
        .route("/status/{code}", get(forced_status))
        .route("/broken", get(broken_body));

    Router::new()
        .nest("/api", api)
        .layer(middleware::from_fn_with_state(state.clone(), record))
        .with_state(state)
}

async fn record(State(state): State<Arc<BackendState>>, req: Request, next: Next) -> Response {
    let authorization = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    state.requests.lock().unwrap().push(RecordedRequest {
        method: req.method().to_string(),
        path: req.uri().path().to_string(),
        authorization,
    });
    next.run(req).await
}

fn error(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "message": message }))).into_response()
}

/// Signs an access token expiring `ttl_secs` from now.
pub fn access_token(subject: &str, ttl_secs: i64) -> String {
    let claims = json!({ "sub": subject, "exp": Utc::now().timestamp() + ttl_secs });
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(b"fake-backend-secret"),
    )
    .expect("Failed to sign token")
}

/// Issues a JWT whose lifetime is `ttl_secs` (default one hour). No
/// `expires_in` is sent, so the client has to read the `exp` claim.
async fn login(Json(body): Json<Value>) -> Response {
    if body["password"] != PASSWORD {
        return error(StatusCode::UNAUTHORIZED, "Invalid credentials");
    }
    let ttl = body["ttl_secs"].as_i64().unwrap_or(3600);
    let user = body["username"].as_str().unwrap_or("user");
    Json(json!({
        "access_token": access_token(user, ttl),
        "refresh_token": "refresh-1",
    }))
    .into_response()
}

async fn refresh(State(state): State<Arc<BackendState>>, Json(body): Json<Value>) -> Response {
    if body["refresh_token"].as_str().is_none() {
        return error(StatusCode::UNAUTHORIZED, "Missing refresh token");
    }
    let n = state.refreshes.fetch_add(1, Ordering::SeqCst) + 1;
    Json(json!({
        "access_token": format!("access-refreshed-{n}"),
        "expires_in": 3600,
    }))
    .into_response()
}

async fn create_job(
    State(state): State<Arc<BackendState>>,
    Path(kind): Path<String>,
) -> Response {
    let n = state.jobs_created.fetch_add(1, Ordering::SeqCst) + 1;
    let id = format!("task-{n}");
    let script = state
        .next_job_script
        .lock()
        .unwrap()
        .take()
        .unwrap_or_else(|| vec![Reply::status(&id, "running")]);
    state
        .scripts
        .lock()
        .unwrap()
        .insert(id.clone(), script.into());

    let mut headers = HeaderMap::new();
    headers.insert(
        header::LOCATION,
        format!("/api/tasks/{id}").parse().unwrap(),
    );
    (
        StatusCode::ACCEPTED,
        headers,
        Json(json!({ "id": id, "status": "pending", "kind": kind })),
    )
        .into_response()
}

async fn get_task(State(state): State<Arc<BackendState>>, Path(id): Path<String>) -> Response {
    match state.next_reply(&id) {
        None => error(StatusCode::NOT_FOUND, &format!("Task {id} not found")),
        Some(Reply::Task(task)) => Json(task).into_response(),
        Some(Reply::Error(code, body)) => {
            let status = StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            (status, Json(body)).into_response()
        }
        Some(Reply::Delayed(delay, task)) => {
            tokio::time::sleep(delay).await;
            Json(task).into_response()
        }
    }
}

async fn list_datasets() -> Json<Value> {
    Json(json!([{ "name": "cats", "images": 120 }]))
}

async fn echo_dataset(Path(name): Path<String>, Json(body): Json<Value>) -> Json<Value> {
    Json(json!({ "name": name, "body": body }))
}

async fn delete_dataset(Path(_name): Path<String>) -> StatusCode {
    StatusCode::NO_CONTENT
}

async fn upload(mut multipart: Multipart) -> Response {
    let mut files = Vec::new();
    let mut fields = serde_json::Map::new();

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(e) => return error(StatusCode::BAD_REQUEST, &e.to_string()),
        };
        let name = field.name().unwrap_or_default().to_string();
        match field.file_name().map(str::to_string) {
            Some(file_name) => {
                let content_type = field.content_type().map(str::to_string);
                let bytes = match field.bytes().await {
                    Ok(bytes) => bytes,
                    Err(e) => return error(StatusCode::BAD_REQUEST, &e.to_string()),
                };
                files.push(json!({
                    "field": name,
                    "file_name": file_name,
                    "content_type": content_type,
                    "size": bytes.len(),
                }));
            }
            None => {
                let text = match field.text().await {
                    Ok(text) => text,
                    Err(e) => return error(StatusCode::BAD_REQUEST, &e.to_string()),
                };
                fields.insert(name, Value::String(text));
            }
        }
    }

    (
        StatusCode::CREATED,
        Json(json!({ "files": files, "fields": fields })),
    )
        .into_response()
}

async fn forced_status(Path(code): Path<u16>) -> Response {
    let status = StatusCode::from_u16(code).unwrap_or(StatusCode::BAD_REQUEST);
    error(status, &format!("forced {code}"))
}

async fn broken_body() -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/json")],
        "{not json",
    )
        .into_response()
}
