//! Scripted stand-ins for the model and the toolbelt.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;

use crate::error::VerifyError;
use crate::llm::{ChatModel, ChatSession, ModelReply, SessionOptions, ToolCall, Turn};
use crate::tools::{ToolContext, ToolExecutor};

type Script = dyn Fn(&SessionOptions, &[Turn]) -> Result<ModelReply, VerifyError> + Send + Sync;

/// A model whose every reply is computed from the session options and the
/// turns sent so far in that session.
pub struct ScriptedModel {
    script: Arc<Script>,
    opened: Arc<Mutex<Vec<SessionOptions>>>,
    credentials_ok: bool,
}

impl ScriptedModel {
    pub fn new(
        script: impl Fn(&SessionOptions, &[Turn]) -> Result<ModelReply, VerifyError>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        Self {
            script: Arc::new(script),
            opened: Arc::new(Mutex::new(Vec::new())),
            credentials_ok: true,
        }
    }

    pub fn without_credentials(mut self) -> Self {
        self.credentials_ok = false;
        self
    }

    pub fn sessions(&self) -> Vec<SessionOptions> {
        self.opened.lock().unwrap().clone()
    }
}

impl ChatModel for ScriptedModel {
    fn open_session(&self, options: SessionOptions) -> Box<dyn ChatSession> {
        self.opened.lock().unwrap().push(options.clone());
        Box::new(ScriptedSession {
            script: self.script.clone(),
            options,
            turns: Vec::new(),
        })
    }

    fn check_credentials(&self) -> Result<(), VerifyError> {
        if self.credentials_ok {
            Ok(())
        } else {
            Err(VerifyError::MissingCredential("LLM_API_KEY"))
        }
    }
}

struct ScriptedSession {
    script: Arc<Script>,
    options: SessionOptions,
    turns: Vec<Turn>,
}

#[async_trait]
impl ChatSession for ScriptedSession {
    async fn send(&mut self, turn: Turn) -> Result<ModelReply, VerifyError> {
        self.turns.push(turn);
        (self.script)(&self.options, &self.turns)
    }
}

/// Text of the first prompt in a session.
pub fn first_prompt(turns: &[Turn]) -> &str {
    match turns.first() {
        Some(Turn::Prompt(p)) => p,
        _ => "",
    }
}

pub fn text_reply(text: impl Into<String>) -> ModelReply {
    ModelReply {
        text: Some(text.into()),
        tool_calls: Vec::new(),
    }
}

pub fn tool_reply(calls: &[(&str, Value)]) -> ModelReply {
    ModelReply {
        text: None,
        tool_calls: calls
            .iter()
            .enumerate()
            .map(|(i, (name, args))| ToolCall {
                id: format!("call_{}", i),
                name: name.to_string(),
                arguments: args.clone(),
            })
            .collect(),
    }
}

pub fn verdict_json(verdict: &str, url: &str) -> String {
    serde_json::json!({
        "sources": [{
            "url": url,
            "accessed": true,
            "verdict": verdict,
            "explanation": "read it"
        }],
        "overall_verdict": verdict,
        "confidence": 0.8,
        "explanation": format!("{} per {}", verdict, url),
    })
    .to_string()
}

/// Echoes each call; stalls forever for claims listed in `stall_claims`.
#[derive(Default)]
pub struct ScriptedTools {
    pub calls: AtomicUsize,
    stall_claims: HashSet<String>,
}

impl ScriptedTools {
    pub fn stalling_on(claims: &[&str]) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            stall_claims: claims.iter().map(|c| c.to_string()).collect(),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ToolExecutor for ScriptedTools {
    async fn execute(&self, name: &str, args: &Value, ctx: &ToolContext) -> String {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let claim = ctx
            .document
            .current()
            .map(|f| f.claim_text.clone())
            .unwrap_or_default();
        if self.stall_claims.contains(&claim) {
            std::future::pending::<()>().await;
        }
        format!("{} output for {}", name, args)
    }
}
