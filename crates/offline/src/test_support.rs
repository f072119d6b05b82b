//! In-process doubles shared by unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use serde_json::{Value, json};
use stockcount_core::MutationId;

use crate::api::{ApiError, Reachability, RemoteApi, SubmitRequest};

#[derive(Debug, Clone, PartialEq)]
pub struct Submission {
    pub path: String,
    pub key: MutationId,
    pub force: bool,
    pub body: Value,
    /// The key had already been applied; the server answered from its record.
    pub replay: bool,
}

/// Scripted stand-in for the backend.
///
/// Responses are queued per path and consumed in order. With nothing scripted,
/// `get` answers 404 and `submit` echoes the body with a server sequence
/// number. Creates are deduplicated by idempotency key like the real server.
#[derive(Default)]
pub struct ScriptedApi {
    scripts: Mutex<HashMap<String, VecDeque<Result<Value, ApiError>>>>,
    applied: Mutex<HashMap<MutationId, Value>>,
    submissions: Mutex<Vec<Submission>>,
    gets: Mutex<Vec<String>>,
    server_seq: AtomicU64,
    unreachable: AtomicBool,
}

impl ScriptedApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(&self, path: &str, response: Result<Value, ApiError>) -> &Self {
        self.scripts
            .lock()
            .unwrap()
            .entry(path.to_string())
            .or_default()
            .push_back(response);
        self
    }

    pub fn respond_times(&self, path: &str, response: Result<Value, ApiError>, times: usize) -> &Self {
        for _ in 0..times {
            self.respond(path, response.clone());
        }
        self
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.unreachable.store(!reachable, Ordering::SeqCst);
    }

    pub fn submissions(&self) -> Vec<Submission> {
        self.submissions.lock().unwrap().clone()
    }

    pub fn gets(&self) -> Vec<String> {
        self.gets.lock().unwrap().clone()
    }

    /// Distinct mutations the server applied.
    pub fn applied(&self) -> usize {
        self.applied.lock().unwrap().len()
    }

    fn next_scripted(&self, path: &str) -> Option<Result<Value, ApiError>> {
        self.scripts
            .lock()
            .unwrap()
            .get_mut(path)
            .and_then(VecDeque::pop_front)
    }
}

#[async_trait]
impl RemoteApi for ScriptedApi {
    async fn get(&self, path: &str) -> Result<Value, ApiError> {
        self.gets.lock().unwrap().push(path.to_string());
        self.next_scripted(path)
            .unwrap_or_else(|| Err(ApiError::status(404, json!({"detail": "Not found"}))))
    }

    async fn submit(&self, request: &SubmitRequest) -> Result<Value, ApiError> {
        let previous = self
            .applied
            .lock()
            .unwrap()
            .get(&request.idempotency_key)
            .cloned();

        self.submissions.lock().unwrap().push(Submission {
            path: request.path.clone(),
            key: request.idempotency_key,
            force: request.force,
            body: request.body.clone(),
            replay: previous.is_some(),
        });
        if let Some(previous) = previous {
            return Ok(previous);
        }

        let response = self.next_scripted(&request.path).unwrap_or_else(|| {
            let mut body = request.body.clone();
            if let Value::Object(map) = &mut body {
                let seq = self.server_seq.fetch_add(1, Ordering::SeqCst) + 1;
                map.insert("server_seq".to_string(), json!(seq));
            }
            Ok(body)
        });

        if let Ok(body) = &response {
            self.applied
                .lock()
                .unwrap()
                .insert(request.idempotency_key, body.clone());
        }
        response
    }
}

#[async_trait]
impl Reachability for ScriptedApi {
    async fn is_reachable(&self) -> bool {
        !self.unreachable.load(Ordering::SeqCst)
    }
}
