//! In-memory [`RemoteClient`] for exercising the platform layer without a network.
//!
//! Responses are scripted per (method, path) and per GraphQL document fragment.
//! Each route holds a queue; the last queued response repeats once the
//! earlier ones are consumed. Unrouted requests answer HTTP 404. Query
//! strings are ignored when matching REST paths.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;

use super::{GetOptions, RemoteClient, RemoteError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Query,
    Get,
    Post,
    Patch,
    Put,
    Delete,
}

#[derive(Debug, Clone)]
enum Reply {
    Json(Value),
    Status(u16, String),
    Graph(String),
}

impl Reply {
    fn into_result(self) -> Result<Value, RemoteError> {
        match self {
            Reply::Json(v) => Ok(v),
            Reply::Status(status, message) => Err(RemoteError::Status { status, message }),
            Reply::Graph(message) => Err(RemoteError::Graph(message)),
        }
    }
}

/// A recorded request.
#[derive(Debug, Clone)]
pub struct Call {
    pub method: Method,
    pub path: String,
    pub body: Option<Value>,
    pub token: Option<String>,
}

#[derive(Default)]
struct State {
    routes: HashMap<(Method, String), VecDeque<Reply>>,
    queries: Vec<(String, VecDeque<Reply>)>,
    calls: Vec<Call>,
}

#[derive(Default)]
pub struct FakeRemote {
    state: Mutex<State>,
}

fn route_key(path: &str) -> String {
    path.split('?').next().unwrap_or(path).to_string()
}

fn next_reply(queue: &mut VecDeque<Reply>) -> Option<Reply> {
    if queue.len() > 1 {
        queue.pop_front()
    } else {
        queue.front().cloned()
    }
}

impl FakeRemote {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, method: Method, path: &str, reply: Reply) -> &Self {
        let mut state = self.state.lock().unwrap();
        state
            .routes
            .entry((method, route_key(path)))
            .or_default()
            .push_back(reply);
        drop(state);
        self
    }

    pub fn on(&self, method: Method, path: &str, body: Value) -> &Self {
        self.push(method, path, Reply::Json(body))
    }

    pub fn on_status(&self, method: Method, path: &str, status: u16, message: &str) -> &Self {
        self.push(method, path, Reply::Status(status, message.to_string()))
    }

    /// Answer any GraphQL document containing `fragment` with `data`.
    pub fn on_query(&self, fragment: &str, data: Value) -> &Self {
        self.push_query(fragment, Reply::Json(data))
    }

    pub fn on_query_error(&self, fragment: &str, message: &str) -> &Self {
        self.push_query(fragment, Reply::Graph(message.to_string()))
    }

    pub fn on_query_status(&self, fragment: &str, status: u16, message: &str) -> &Self {
        self.push_query(fragment, Reply::Status(status, message.to_string()))
    }

    fn push_query(&self, fragment: &str, reply: Reply) -> &Self {
        let mut state = self.state.lock().unwrap();
        match state.queries.iter_mut().find(|(f, _)| f == fragment) {
            Some((_, queue)) => queue.push_back(reply),
            None => state
                .queries
                .push((fragment.to_string(), VecDeque::from([reply]))),
        }
        drop(state);
        self
    }

    pub fn calls(&self, method: Method, path: &str) -> Vec<Call> {
        let key = route_key(path);
        self.state
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|c| c.method == method && route_key(&c.path) == key)
            .cloned()
            .collect()
    }

    pub fn count(&self, method: Method, path: &str) -> usize {
        self.calls(method, path).len()
    }

    /// Every mutation (POST/PATCH/PUT/DELETE) recorded so far.
    pub fn mutations(&self) -> Vec<Call> {
        self.state
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|c| !matches!(c.method, Method::Get | Method::Query))
            .cloned()
            .collect()
    }

    fn respond(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
        token: Option<&str>,
    ) -> Result<Value, RemoteError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call {
            method,
            path: path.to_string(),
            body,
            token: token.map(str::to_string),
        });
        let reply = state
            .routes
            .get_mut(&(method, route_key(path)))
            .and_then(next_reply)
            .unwrap_or_else(|| Reply::Status(404, "Not Found".to_string()));
        reply.into_result()
    }
}

#[async_trait]
impl RemoteClient for FakeRemote {
    async fn query(&self, document: &str, variables: Value) -> Result<Value, RemoteError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call {
            method: Method::Query,
            path: document.to_string(),
            body: Some(variables),
            token: None,
        });
        let reply = state
            .queries
            .iter_mut()
            .find(|(fragment, _)| document.contains(fragment.as_str()))
            .and_then(|(_, queue)| next_reply(queue))
            .unwrap_or_else(|| Reply::Graph("no scripted query".to_string()));
        reply.into_result()
    }

    async fn get_json(&self, path: &str, options: GetOptions) -> Result<Value, RemoteError> {
        self.respond(Method::Get, path, None, options.token.as_deref())
    }

    async fn get_text(&self, path: &str, options: GetOptions) -> Result<String, RemoteError> {
        match self.respond(Method::Get, path, None, options.token.as_deref())? {
            Value::String(text) => Ok(text),
            other => Ok(other.to_string()),
        }
    }

    async fn post_json(
        &self,
        path: &str,
        body: Value,
        token: Option<&str>,
    ) -> Result<Value, RemoteError> {
        self.respond(Method::Post, path, Some(body), token)
    }

    async fn patch_json(
        &self,
        path: &str,
        body: Value,
        token: Option<&str>,
    ) -> Result<Value, RemoteError> {
        self.respond(Method::Patch, path, Some(body), token)
    }

    async fn put_json(
        &self,
        path: &str,
        body: Value,
        token: Option<&str>,
    ) -> Result<Value, RemoteError> {
        self.respond(Method::Put, path, Some(body), token)
    }

    async fn delete_json(&self, path: &str, token: Option<&str>) -> Result<(), RemoteError> {
        self.respond(Method::Delete, path, None, token).map(|_| ())
    }
}
