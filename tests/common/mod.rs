#![allow(dead_code)]

use async_trait::async_trait;
use lifeguard::{CallError, Transport, TransportResponse};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// One scripted reply.
#[derive(Debug, Clone)]
pub enum Reply {
    Status(u16, &'static str),
    Fail(&'static str),
    Slow(Duration, u16, &'static str),
}

/// Transport replaying a script; once exhausted it keeps returning the fallback reply.
#[derive(Debug)]
pub struct ScriptedTransport {
    script: Mutex<VecDeque<Reply>>,
    then: Reply,
    calls: AtomicUsize,
    urls: Mutex<Vec<String>>,
}

impl ScriptedTransport {
    pub fn new(script: impl IntoIterator<Item = Reply>) -> Self {
        Self {
            script: Mutex::new(script.into_iter().collect()),
            then: Reply::Status(200, "ok"),
            calls: AtomicUsize::new(0),
            urls: Mutex::new(Vec::new()),
        }
    }

    pub fn always(reply: Reply) -> Self {
        Self { then: reply, ..Self::new([]) }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn urls(&self) -> Vec<String> {
        self.urls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn perform_request(&self, method: &str, url: &str) -> Result<TransportResponse, CallError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.urls.lock().unwrap().push(format!("{method} {url}"));
        let reply = self.script.lock().unwrap().pop_front().unwrap_or_else(|| self.then.clone());
        match reply {
            Reply::Status(status, body) => Ok(TransportResponse::new(status, body)),
            Reply::Fail(message) => Err(CallError::Transport(message.to_string())),
            Reply::Slow(delay, status, body) => {
                tokio::time::sleep(delay).await;
                Ok(TransportResponse::new(status, body))
            }
        }
    }
}
