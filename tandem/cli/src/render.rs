//! Transcript printing
//!
//! Single-mode responses are printed as deltas while they stream. Parallel
//! responses would interleave, so each side is printed whole once it
//! terminates.

use std::collections::{HashMap, HashSet};

use tandem_core::{
    ConversationSummary, Message, MessageId, MessageRole, ModelInfo, Session, SessionNotice,
    StoreChange,
};
use tokio::io::{AsyncWrite, AsyncWriteExt, Stdout};
use tokio::sync::mpsc;

/// Writes the transcript, to stdout unless told otherwise
pub struct Renderer<W = Stdout> {
    out: W,
    /// Bytes already printed per streaming message
    printed: HashMap<MessageId, usize>,
    /// Parallel messages whose final block is already printed
    shown: HashSet<MessageId>,
}

impl Renderer {
    pub fn new() -> Self {
        Self::with_writer(tokio::io::stdout())
    }
}

impl<W: AsyncWrite + Unpin> Renderer<W> {
    pub fn with_writer(out: W) -> Self {
        Self {
            out,
            printed: HashMap::new(),
            shown: HashSet::new(),
        }
    }

    pub async fn line(&mut self, text: &str) -> std::io::Result<()> {
        self.out.write_all(text.as_bytes()).await?;
        self.out.write_all(b"\n").await?;
        self.out.flush().await
    }

    pub async fn prompt(&mut self) -> std::io::Result<()> {
        self.out.write_all(b"> ").await?;
        self.out.flush().await
    }

    /// Print whatever changed since the last call
    pub async fn drain(
        &mut self,
        session: &Session,
        changes: &mut mpsc::UnboundedReceiver<StoreChange>,
    ) -> std::io::Result<()> {
        while let Ok(change) = changes.try_recv() {
            match change {
                StoreChange::Appended(id) => {
                    if let Some(msg) = session.store().get(&id) {
                        if msg.role() == MessageRole::Assistant && !msg.is_parallel() {
                            let header = format!("{}: ", msg.model().unwrap_or("assistant"));
                            self.out.write_all(header.as_bytes()).await?;
                            self.printed.insert(id, 0);
                        }
                    }
                }
                StoreChange::Updated(id) => {
                    if let Some(msg) = session.store().get(&id) {
                        self.updated(msg).await?;
                    }
                }
                StoreChange::Rebound { old, new } => {
                    if let Some(printed) = self.printed.remove(&old) {
                        self.printed.insert(new.clone(), printed);
                    }
                    if self.shown.remove(&old) {
                        self.shown.insert(new.clone());
                    }
                    // The update that preceded the rebind was looked up under
                    // the old id and missed
                    if let Some(msg) = session.store().get(&new) {
                        self.updated(msg).await?;
                    }
                }
                StoreChange::GroupReplaced {
                    removed,
                    replacement,
                } => {
                    for id in &removed {
                        self.shown.remove(id);
                    }
                    if let Some(msg) = session.store().get(&replacement) {
                        let kept = format!("(kept {})", msg.model().unwrap_or("response"));
                        self.line(&kept).await?;
                    }
                }
                StoreChange::Cleared => {
                    self.printed.clear();
                    self.shown.clear();
                    self.transcript(session.messages()).await?;
                }
            }
        }
        self.out.flush().await
    }

    async fn updated(&mut self, msg: &Message) -> std::io::Result<()> {
        if msg.is_parallel() {
            // Content and completion each report an update; print once
            if !msg.is_streaming() && self.shown.insert(msg.id().clone()) {
                let side = msg.side().map_or('?', |s| if s.index() == 0 { 'A' } else { 'B' });
                let marker = if msg.is_error() { "!" } else { "" };
                let block = format!(
                    "[{side}] {}:\n{marker}{}\n",
                    msg.model().unwrap_or("assistant"),
                    msg.content()
                );
                self.out.write_all(block.as_bytes()).await?;
            }
            return Ok(());
        }

        let Some(printed) = self.printed.get_mut(msg.id()) else {
            return Ok(());
        };
        if msg.is_error() {
            let text = format!("\n! {}\n", msg.content());
            self.out.write_all(text.as_bytes()).await?;
            self.printed.remove(msg.id());
            return Ok(());
        }

        let content = msg.content();
        if let Some(delta) = content.get(*printed..) {
            self.out.write_all(delta.as_bytes()).await?;
            *printed = content.len();
        }
        if !msg.is_streaming() {
            self.out.write_all(b"\n").await?;
            self.printed.remove(msg.id());
        }
        Ok(())
    }

    async fn transcript(&mut self, messages: &[Message]) -> std::io::Result<()> {
        for msg in messages {
            let who = match msg.role() {
                MessageRole::User => "you",
                MessageRole::Assistant => msg.model().unwrap_or("assistant"),
            };
            let text = format!("{who}: {}\n", msg.content());
            self.out.write_all(text.as_bytes()).await?;
        }
        Ok(())
    }

    pub async fn notice(&mut self, notice: &SessionNotice) -> std::io::Result<()> {
        match notice {
            SessionNotice::TurnFinished { completed: true, .. } => Ok(()),
            SessionNotice::TurnFinished { completed: false, .. } => {
                self.line("(response failed; you can send another message)").await
            }
            SessionNotice::MetadataRefreshed { title } => {
                self.line(&format!("(conversation: {title})")).await
            }
            SessionNotice::RefreshFailed { error } => {
                self.line(&format!("(could not refresh conversation: {error})")).await
            }
            SessionNotice::SelectionPersisted { .. } => Ok(()),
            SessionNotice::SelectionPersistFailed { error, .. } => {
                self.line(&format!("! selection kept locally but not saved: {error}"))
                    .await
            }
        }
    }
}

/// Current conversation, mode and response state
pub fn status(session: &Session) -> String {
    let conversation = session.conversation().map_or_else(
        || "none".to_string(),
        |c| format!("{} ({}, {})", c.title, c.id, c.model),
    );
    let mode = session.mode();
    let mode = if mode.is_dual() {
        format!("dual with {}", mode.second_model().unwrap_or("second model"))
    } else {
        "single".to_string()
    };
    format!(
        "conversation: {conversation}\nmode: {mode}\nstate: {}",
        session.state().description()
    )
}

/// One line per stored conversation
pub fn conversations(list: &[ConversationSummary]) -> String {
    if list.is_empty() {
        return "(no conversations)".to_string();
    }
    list.iter()
        .map(|c| {
            let updated = c.updated_at.unwrap_or(c.created_at).format("%Y-%m-%d %H:%M");
            format!(
                "{}  {}  [{}, {} messages, {updated}]",
                c.id, c.title, c.model_name, c.message_count
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Available models, the current one starred
pub fn models(models: &[ModelInfo], current: Option<&str>) -> String {
    if models.is_empty() {
        return "(no models)".to_string();
    }
    models
        .iter()
        .map(|m| {
            let mark = if Some(m.name.as_str()) == current { "*" } else { " " };
            format!("{mark} {}", m.name)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tandem_core::backend::mock::{sse, MockBackend, MockResponse};
    use tandem_core::ChatConfig;

    use super::*;

    fn dual_config() -> ChatConfig {
        ChatConfig {
            default_model: "model-a".to_string(),
            second_model: Some("model-b".to_string()),
            dual: true,
        }
    }

    #[tokio::test]
    async fn test_parallel_block_printed_once_per_side() {
        let backend = Arc::new(MockBackend::new());
        let mut session = Session::new(backend.clone(), backend.clone(), &dual_config());
        session.new_conversation(None, Some("model-a")).await.unwrap();
        let mut changes = session.subscribe();
        backend.push_response(MockResponse::fragments([
            sse(&json!({"content": "x", "model_index": 0})),
            sse(&json!({"content": "y", "model_index": 1})),
            sse(&json!({"done": true})),
        ]));

        session.submit("hello").unwrap();
        session.run_until_idle().await;

        // Every change of the turn is drained in one batch
        let mut renderer = Renderer::with_writer(Vec::new());
        renderer.drain(&session, &mut changes).await.unwrap();
        let out = String::from_utf8(renderer.out).unwrap();

        assert_eq!(out.matches("[A] model-a:\nx\n").count(), 1);
        assert_eq!(out.matches("[B] model-b:\ny\n").count(), 1);
    }

    #[tokio::test]
    async fn test_status_reports_mode_and_state() {
        let backend = Arc::new(MockBackend::new());
        let mut session = Session::new(backend.clone(), backend.clone(), &ChatConfig::default());
        assert_eq!(
            status(&session),
            "conversation: none\nmode: single\nstate: Idle"
        );

        session.switch_mode(true, Some("llama3.2")).unwrap();
        let text = status(&session);
        assert!(text.contains("mode: dual with llama3.2"));
        assert!(text.ends_with("state: Idle"));
    }

    #[test]
    fn test_models_marks_current() {
        let list = vec![
            ModelInfo {
                name: "qwen3:latest".to_string(),
                size: None,
            },
            ModelInfo {
                name: "llama3.2".to_string(),
                size: Some(2_000_000_000),
            },
        ];
        assert_eq!(
            models(&list, Some("llama3.2")),
            "  qwen3:latest\n* llama3.2"
        );
    }

    #[test]
    fn test_empty_lists() {
        assert_eq!(conversations(&[]), "(no conversations)");
        assert_eq!(models(&[], None), "(no models)");
    }
}
