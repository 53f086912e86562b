//! Helpers shared by the unit tests: a throwaway Alist signing API bound to
//! loopback that records what it was asked.

use std::{sync::Arc, time::Duration};

use axum::{
    Json, Router,
    extract::State,
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::post,
};
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::json;

use crate::alist::{AlistConfig, AlistResolver};

pub const TEST_TOKEN: &str = "test-token";

#[derive(Clone, Copy)]
pub enum SigningBehaviour {
    /// Answers `https://signed.example<path>?sign=ok`.
    Sign,
    Fixed(&'static str),
    Status(u16),
    NoRawUrl,
    /// Sleeps this long before answering like `Sign`.
    Hang(Duration),
}

#[derive(Default)]
struct Recorder {
    paths: Vec<String>,
    authorization: Option<String>,
}

#[derive(Clone)]
struct MockState {
    behaviour: SigningBehaviour,
    recorder: Arc<Mutex<Recorder>>,
}

#[derive(Deserialize)]
struct SignBody {
    path: String,
}

pub struct SigningServer {
    pub base_url: String,
    recorder: Arc<Mutex<Recorder>>,
}

impl SigningServer {
    pub fn hits(&self) -> usize {
        self.recorder.lock().paths.len()
    }

    pub fn paths(&self) -> Vec<String> {
        self.recorder.lock().paths.clone()
    }

    pub fn last_authorization(&self) -> Option<String> {
        self.recorder.lock().authorization.clone()
    }

    pub fn config(&self) -> AlistConfig {
        AlistConfig::new(self.base_url.clone(), Some(TEST_TOKEN.to_owned()))
    }

    pub fn resolver(&self) -> AlistResolver {
        AlistResolver::new(self.config()).expect("building test resolver")
    }
}

pub fn signed_url_for(path: &str) -> String {
    format!("https://signed.example{path}?sign=ok")
}

pub async fn spawn_signing_server(behaviour: SigningBehaviour) -> SigningServer {
    let recorder = Arc::new(Mutex::new(Recorder::default()));
    let app = Router::new()
        .route("/api/fs/get", post(sign))
        .with_state(MockState {
            behaviour,
            recorder: recorder.clone(),
        });

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("binding mock signing server");
    let addr = listener.local_addr().expect("mock server address");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    SigningServer {
        base_url: format!("http://{addr}"),
        recorder,
    }
}

async fn sign(
    State(state): State<MockState>,
    headers: HeaderMap,
    Json(body): Json<SignBody>,
) -> Response {
    {
        let mut recorder = state.recorder.lock();
        recorder.paths.push(body.path.clone());
        recorder.authorization = headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned);
    }

    match state.behaviour {
        SigningBehaviour::Hang(delay) => {
            tokio::time::sleep(delay).await;
            Json(json!({ "code": 200, "data": { "raw_url": signed_url_for(&body.path) } }))
                .into_response()
        }
        SigningBehaviour::Sign => {
            Json(json!({ "code": 200, "data": { "raw_url": signed_url_for(&body.path) } }))
                .into_response()
        }
        SigningBehaviour::Fixed(url) => {
            Json(json!({ "code": 200, "data": { "raw_url": url } })).into_response()
        }
        SigningBehaviour::Status(code) => {
            let status = StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            (status, "signing failed").into_response()
        }
        SigningBehaviour::NoRawUrl => {
            Json(json!({ "code": 500, "message": "object not found", "data": null }))
                .into_response()
        }
    }
}
