//! Test doubles for the completion seam.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use tramit_shared::{Result, TramitError};

use crate::{CompletionRequest, CompletionService};

type Responder = Box<dyn Fn(&CompletionRequest) -> Result<String> + Send + Sync>;

/// Completion service that replays queued replies, then falls back to a
/// responder closure (if any). Every request is recorded.
#[derive(Default)]
pub struct ScriptedCompletion {
    replies: Mutex<VecDeque<Result<String>>>,
    responder: Option<Responder>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedCompletion {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a successful reply.
    pub fn with_reply(self, reply: impl Into<String>) -> Self {
        self.push(Ok(reply.into()));
        self
    }

    /// Queue a failing call.
    pub fn with_error(self, message: impl Into<String>) -> Self {
        self.push(Err(TramitError::Completion(message.into())));
        self
    }

    /// Answer every request not covered by the queue with this closure.
    pub fn responding_with<F>(mut self, f: F) -> Self
    where
        F: Fn(&CompletionRequest) -> Result<String> + Send + Sync + 'static,
    {
        self.responder = Some(Box::new(f));
        self
    }

    /// Answer every request not covered by the queue with the same text.
    pub fn always(self, reply: impl Into<String>) -> Self {
        let reply = reply.into();
        self.responding_with(move |_| Ok(reply.clone()))
    }

    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().map(|r| r.len()).unwrap_or_default()
    }

    fn push(&self, reply: Result<String>) {
        if let Ok(mut replies) = self.replies.lock() {
            replies.push_back(reply);
        }
    }
}

#[async_trait]
impl CompletionService for ScriptedCompletion {
    async fn complete(&self, request: &CompletionRequest) -> Result<String> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request.clone());
        }

        let queued = self.replies.lock().ok().and_then(|mut r| r.pop_front());
        match (queued, &self.responder) {
            (Some(reply), _) => reply,
            (None, Some(responder)) => responder(request),
            (None, None) => Err(TramitError::Completion("no scripted reply left".into())),
        }
    }
}
