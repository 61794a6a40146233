//! History-aware conversational retrieval.
//!
//! Each request is answered in four steps: resolve the caller's document collection, rewrite the
//! message into a standalone query (skipped when there is no history), retrieve, and ask the
//! model for a grounded answer. Nothing is kept between requests beyond what the client sends.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::embedding::EmbeddingClientError;
use crate::llm::{ChatMessage, ChatModel, LlmError};
use crate::namespace::{derive_name, sanitize_short_name};
use crate::retrieval::{HybridRetriever, RetrievalError};
use crate::store::Passage;

/// System prompt for the standalone-question rewrite.
pub const REWRITE_SYSTEM_PROMPT: &str = "Given a chat history and the latest user question which might reference context in the chat history, formulate a standalone question which can be understood without the chat history. Do NOT answer the question, just reformulate it if needed and otherwise return it as is.";

/// System prompt for the grounded answer; retrieved context is appended after it.
pub const ANSWER_SYSTEM_PROMPT: &str = "You are an assistant for question-answering tasks. Use the following pieces of retrieved context to answer the question. If you don't know the answer, just say that you don't know. Keep the answer concise.";

/// Reply for callers without a session.
pub const SESSION_EXPIRED_ANSWER: &str = "Your session has expired. Please log in again.";

/// Reply when no retrieval source can be reached.
pub const INITIALIZING_ANSWER: &str =
    "The knowledge base is still initializing. Please try again in a moment.";

/// One prior turn supplied by the client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatTurn {
    /// `user` or `assistant`; other roles are ignored.
    pub role: String,
    /// Turn text.
    pub content: String,
}

impl ChatTurn {
    fn to_message(&self) -> Option<ChatMessage> {
        match self.role.trim().to_ascii_lowercase().as_str() {
            "user" => Some(ChatMessage::user(self.content.clone())),
            "assistant" => Some(ChatMessage::assistant(self.content.clone())),
            _ => None,
        }
    }
}

/// Body of `POST /chat`.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatRequest {
    /// Latest user message.
    pub message: String,
    /// Short name of one of the caller's documents.
    #[serde(default)]
    pub collection_name: Option<String>,
    /// Prior turns, oldest first.
    #[serde(default)]
    pub history: Vec<ChatTurn>,
}

/// Result of a chat request.
#[derive(Debug, Clone)]
pub enum ChatOutcome {
    /// Grounded answer from the model.
    Answer {
        /// Model reply.
        answer: String,
        /// Passages placed in the prompt, in source-priority order.
        passages: Vec<Passage>,
    },
    /// Caller has no session.
    SessionExpired,
    /// No retrieval source was reachable.
    Initializing,
}

impl ChatOutcome {
    /// Text returned to the client.
    pub fn answer_text(&self) -> &str {
        match self {
            Self::Answer { answer, .. } => answer,
            Self::SessionExpired => SESSION_EXPIRED_ANSWER,
            Self::Initializing => INITIALIZING_ANSWER,
        }
    }
}

/// Collaborator failures surfaced as server errors.
#[derive(Debug, Error)]
pub enum ChatError {
    /// Language model call failed.
    #[error(transparent)]
    Llm(#[from] LlmError),
    /// Query embedding failed.
    #[error(transparent)]
    Embedding(#[from] EmbeddingClientError),
}

/// Conversational orchestrator over the hybrid retriever and the chat model.
#[derive(Clone)]
pub struct ConversationalRag {
    retriever: HybridRetriever,
    llm: Arc<dyn ChatModel>,
}

impl ConversationalRag {
    /// Create the orchestrator.
    pub fn new(retriever: HybridRetriever, llm: Arc<dyn ChatModel>) -> Self {
        Self { retriever, llm }
    }

    /// Answer `request` for the tenant owning the session, if any.
    pub async fn answer(
        &self,
        tenant_id: Option<&str>,
        request: &ChatRequest,
    ) -> Result<ChatOutcome, ChatError> {
        let Some(tenant_id) = tenant_id else {
            return Ok(ChatOutcome::SessionExpired);
        };

        let collection = request
            .collection_name
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(|short| derive_name(tenant_id, &sanitize_short_name(short)));

        let dialogue: Vec<ChatMessage> = request
            .history
            .iter()
            .filter_map(ChatTurn::to_message)
            .collect();

        let query = self.standalone_query(&dialogue, &request.message).await?;

        let retrieved = match self.retriever.retrieve(&query, collection.as_deref()).await {
            Ok(retrieved) => retrieved,
            Err(RetrievalError::Unavailable(reason)) => {
                tracing::warn!(reason = %reason, "Retrieval unavailable; answering with notice");
                return Ok(ChatOutcome::Initializing);
            }
            Err(RetrievalError::Embedding(error)) => {
                tracing::error!(error = %error, "Query embedding failed");
                return Err(error.into());
            }
        };

        let mut messages = Vec::with_capacity(dialogue.len() + 2);
        messages.push(ChatMessage::system(answer_system_prompt(&retrieved.passages)));
        messages.extend(dialogue);
        messages.push(ChatMessage::user(request.message.clone()));

        let answer = self.llm.complete(messages).await.inspect_err(|error| {
            tracing::error!(error = %error, "Answer generation failed");
        })?;

        tracing::debug!(
            passages = retrieved.passages.len(),
            searched = ?retrieved.searched,
            "Chat answered"
        );
        Ok(ChatOutcome::Answer {
            answer,
            passages: retrieved.passages,
        })
    }

    async fn standalone_query(
        &self,
        dialogue: &[ChatMessage],
        message: &str,
    ) -> Result<String, ChatError> {
        if dialogue.is_empty() {
            return Ok(message.to_string());
        }

        let mut messages = Vec::with_capacity(dialogue.len() + 2);
        messages.push(ChatMessage::system(REWRITE_SYSTEM_PROMPT));
        messages.extend_from_slice(dialogue);
        messages.push(ChatMessage::user(message));

        let rewritten = self.llm.complete(messages).await.inspect_err(|error| {
            tracing::error!(error = %error, "Question rewrite failed");
        })?;
        let rewritten = rewritten.trim();
        if rewritten.is_empty() {
            Ok(message.to_string())
        } else {
            Ok(rewritten.to_string())
        }
    }
}

fn answer_system_prompt(passages: &[Passage]) -> String {
    let context = passages
        .iter()
        .map(|passage| passage.text.as_str())
        .collect::<Vec<_>>()
        .join("\n\n");
    format!("{ANSWER_SYSTEM_PROMPT}\n\nCONTEXT:\n{context}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashEmbeddingClient;
    use crate::llm::ChatRole;
    use crate::store::{InMemoryStore, PassageInsert, VectorStore};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    #[derive(Default)]
    struct ScriptedModel {
        replies: Mutex<VecDeque<Result<String, LlmError>>>,
        calls: Mutex<Vec<Vec<ChatMessage>>>,
    }

    impl ScriptedModel {
        fn with(replies: Vec<Result<String, LlmError>>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
                calls: Mutex::default(),
            })
        }

        fn calls(&self) -> Vec<Vec<ChatMessage>> {
            self.calls.lock().expect("lock").clone()
        }
    }

    #[async_trait]
    impl ChatModel for ScriptedModel {
        async fn complete(&self, messages: Vec<ChatMessage>) -> Result<String, LlmError> {
            self.calls.lock().expect("lock").push(messages);
            self.replies
                .lock()
                .expect("lock")
                .pop_front()
                .unwrap_or_else(|| Ok("default".into()))
        }
    }

    async fn seed(store: &InMemoryStore, name: &str, texts: &[&str]) {
        let embedder = HashEmbeddingClient::new(8);
        let vectors = crate::embedding::EmbeddingClient::generate_embeddings(
            &embedder,
            texts.iter().map(|t| t.to_string()).collect(),
        )
        .await
        .expect("embed");
        let passages = texts
            .iter()
            .zip(vectors)
            .map(|(text, vector)| PassageInsert {
                text: text.to_string(),
                vector,
                metadata: serde_json::Map::new(),
            })
            .collect();
        store.upsert(name, passages).await.expect("upsert");
    }

    fn rag(store: Arc<InMemoryStore>, model: Arc<ScriptedModel>) -> ConversationalRag {
        let retriever =
            HybridRetriever::new(store, Arc::new(HashEmbeddingClient::new(8)), "global", 3);
        ConversationalRag::new(retriever, model)
    }

    fn request(message: &str, collection: Option<&str>, history: Vec<ChatTurn>) -> ChatRequest {
        ChatRequest {
            message: message.into(),
            collection_name: collection.map(str::to_string),
            history,
        }
    }

    #[tokio::test]
    async fn unauthenticated_caller_gets_session_expired() {
        let model = ScriptedModel::with(vec![]);
        let outcome = rag(Arc::new(InMemoryStore::new()), model.clone())
            .answer(None, &request("hi", None, vec![]))
            .await
            .expect("answer");
        assert!(matches!(outcome, ChatOutcome::SessionExpired));
        assert_eq!(outcome.answer_text(), SESSION_EXPIRED_ANSWER);
        assert!(model.calls().is_empty());
    }

    #[tokio::test]
    async fn empty_history_skips_rewrite_and_uses_global_only() {
        let store = Arc::new(InMemoryStore::new());
        seed(&store, "global", &["Office hours are Tuesday."]).await;
        seed(&store, &derive_name("alice", "Syllabus"), &["Grading is 50% exams."]).await;
        let model = ScriptedModel::with(vec![Ok("Tuesday.".into())]);

        let outcome = rag(store, model.clone())
            .answer(Some("alice"), &request("When are office hours?", None, vec![]))
            .await
            .expect("answer");

        let ChatOutcome::Answer { answer, passages } = outcome else {
            panic!("expected an answer");
        };
        assert_eq!(answer, "Tuesday.");
        assert!(passages.iter().all(|p| p.collection == "global"));

        let calls = model.calls();
        assert_eq!(calls.len(), 1);
        let prompt = &calls[0];
        assert_eq!(prompt[0].role, ChatRole::System);
        assert!(prompt[0].content.starts_with(ANSWER_SYSTEM_PROMPT));
        assert!(prompt[0].content.contains("CONTEXT:\nOffice hours are Tuesday."));
        assert_eq!(prompt.last().map(|m| m.content.as_str()), Some("When are office hours?"));
    }

    #[tokio::test]
    async fn history_triggers_rewrite_and_tenant_collection_is_derived() {
        let store = Arc::new(InMemoryStore::new());
        seed(&store, "global", &["Campus map."]).await;
        seed(&store, &derive_name("alice", "Syllabus"), &["Grading is 50% exams."]).await;
        seed(&store, &derive_name("bob", "Syllabus"), &["Bob's secret notes."]).await;
        let model = ScriptedModel::with(vec![
            Ok("What is the grading policy of the course?".into()),
            Ok("Half the grade is exams.".into()),
        ]);
        let history = vec![
            ChatTurn {
                role: "user".into(),
                content: "Tell me about the course".into(),
            },
            ChatTurn {
                role: "assistant".into(),
                content: "It is an intro course.".into(),
            },
            ChatTurn {
                role: "system".into(),
                content: "ignored".into(),
            },
        ];

        let outcome = rag(store, model.clone())
            .answer(
                Some("alice"),
                &request("And its grading?", Some("Syllabus"), history),
            )
            .await
            .expect("answer");

        let ChatOutcome::Answer { passages, .. } = outcome else {
            panic!("expected an answer");
        };
        assert!(passages.iter().any(|p| p.collection == derive_name("alice", "Syllabus")));
        assert!(passages.iter().all(|p| p.collection != derive_name("bob", "Syllabus")));

        let calls = model.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0][0].content, REWRITE_SYSTEM_PROMPT);
        assert_eq!(calls[0].len(), 4);
        assert_eq!(calls[1].len(), 4);
        assert!(calls[1][0].content.contains("Grading is 50% exams."));
    }

    #[tokio::test]
    async fn unreachable_store_gives_initializing_notice() {
        let store = Arc::new(InMemoryStore::new());
        seed(&store, "global", &["a"]).await;
        store.set_offline(true);
        let model = ScriptedModel::with(vec![]);

        let outcome = rag(store, model.clone())
            .answer(Some("alice"), &request("hi", None, vec![]))
            .await
            .expect("answer");
        assert!(matches!(outcome, ChatOutcome::Initializing));
        assert!(model.calls().is_empty());
    }

    #[tokio::test]
    async fn model_failure_is_an_error_not_an_answer() {
        let store = Arc::new(InMemoryStore::new());
        seed(&store, "global", &["a"]).await;
        let model = ScriptedModel::with(vec![Err(LlmError::GenerationFailed("boom".into()))]);

        let result = rag(store, model)
            .answer(Some("alice"), &request("hi", None, vec![]))
            .await;
        assert!(matches!(result, Err(ChatError::Llm(_))));
    }
}
