//! Retrieval-augmented tutor.
//!
//! A question is answered in up to three steps:
//!
//! 1. With earlier exchanges in the session, the language model rewrites the
//!    follow-up into a standalone question.
//! 2. The retriever picks context chunks for that question.
//! 3. The language model answers from a prompt holding the tutor persona,
//!    the retrieved context, the session history and the question.
//!
//! Questions asking what the tutor can do are answered from the course
//! overview without calling the model.

use std::fmt::Write as _;

use serde::Serialize;

use crate::{
    config::{ChatConfig, RetrievalConfig},
    error::{Error, Result},
    llm::{ChatMessage, LanguageModel},
    retrieval::{Retrieved, Retriever},
    session_store::History,
};

const CAPABILITY_PHRASES: &[&str] = &["what can you do"];

const CONDENSE_INSTRUCTIONS: &str = "Given the conversation so far and a \
follow-up question, rephrase the follow-up as a standalone question that can \
be understood without the conversation. Reply with the question only.";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Answer {
    pub text: String,
    /// Chunks the answer was grounded on, in retrieval order.
    pub sources: Vec<Retrieved>,
    /// The rewritten question used for retrieval, when it differs from the
    /// one asked.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub standalone_question: Option<String>,
}

pub struct Tutor<'a> {
    retriever: &'a Retriever,
    model: &'a dyn LanguageModel,
    chat: &'a ChatConfig,
    retrieval: &'a RetrievalConfig,
}

impl<'a> Tutor<'a> {
    pub fn new(
        retriever: &'a Retriever,
        model: &'a dyn LanguageModel,
        chat: &'a ChatConfig,
        retrieval: &'a RetrievalConfig,
    ) -> Self {
        Self {
            retriever,
            model,
            chat,
            retrieval,
        }
    }

    /// Answer `question` and record the exchange in `history`.
    pub fn ask(&self, history: &mut History, question: &str) -> Result<Answer> {
        let question = question.trim();
        if question.is_empty() {
            return Err(Error::EmptyInput("question is blank".into()));
        }

        if is_capability_question(question) {
            return Ok(Answer {
                text: self.overview(),
                sources: Vec::new(),
                standalone_question: None,
            });
        }

        let standalone = self.condense(history, question)?;
        let sources = self.retriever.retrieve(&standalone, self.retrieval)?;
        tracing::debug!(
            sources = sources.len(),
            standalone = %standalone,
            "retrieved context"
        );

        let messages = self.prompt(history, question, &sources);
        let text = self.model.complete(&messages)?;
        history.push(question, text.clone());

        Ok(Answer {
            text,
            sources,
            standalone_question: (standalone != question).then_some(standalone),
        })
    }

    /// The answer to "what can you do".
    pub fn overview(&self) -> String {
        if let Some(overview) = &self.chat.course_overview {
            return format!("I can help you with:\n{overview}");
        }

        let mut sections: Vec<&str> = Vec::new();
        for (_, chunk) in self.retriever.index().chunks() {
            if !sections.contains(&chunk.section.as_str()) {
                sections.push(&chunk.section);
            }
        }

        let mut text = format!(
            "I can help you understand {}. Ask me about concepts, \
             definitions and insights from the study material",
            self.chat.course_name
        );
        if sections.is_empty() {
            text.push('.');
        } else {
            text.push_str(", which covers:\n");
            for section in sections {
                let _ = writeln!(text, "- {section}");
            }
        }
        text
    }

    fn condense(&self, history: &History, question: &str) -> Result<String> {
        if history.is_empty() {
            return Ok(question.to_string());
        }

        let mut messages = vec![ChatMessage::system(CONDENSE_INSTRUCTIONS)];
        messages.extend(history.messages());
        messages.push(ChatMessage::user(format!(
            "Follow-up question: {question}\nStandalone question:"
        )));

        let rewritten = self.model.complete(&messages)?;
        let rewritten = rewritten.trim();
        Ok(if rewritten.is_empty() {
            question.to_string()
        } else {
            rewritten.to_string()
        })
    }

    fn prompt(
        &self,
        history: &History,
        question: &str,
        sources: &[Retrieved],
    ) -> Vec<ChatMessage> {
        let mut system = format!(
            "You are an AI tutor specializing in {}. Your goal is to help \
             the user understand the concepts in the study material. Ground \
             your answer in the context below; if it does not cover the \
             question, say so.\n\n\
             Relevant context from the study material:",
            self.chat.course_name
        );
        if sources.is_empty() {
            system.push_str("\n(no matching material)");
        }
        for source in sources {
            let _ = write!(
                system,
                "\n\n[{}] {}",
                source.chunk.section, source.chunk.text
            );
        }

        let mut messages = vec![ChatMessage::system(system)];
        messages.extend(history.messages());
        messages.push(ChatMessage::user(question));
        messages
    }
}

fn is_capability_question(question: &str) -> bool {
    let lower = question.to_lowercase();
    CAPABILITY_PHRASES.iter().any(|p| lower.contains(p))
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::{
        chunking::Chunk,
        config::RetrievalMode,
        embedding::{Embedder, HashEmbedder, RetryPolicy},
        llm::Role,
        vector_index::VectorIndex,
    };

    /// Replies from a script and records every prompt it was sent.
    struct ScriptedModel {
        replies: Mutex<Vec<String>>,
        prompts: Mutex<Vec<Vec<ChatMessage>>>,
    }

    impl ScriptedModel {
        fn new(replies: &[&str]) -> Self {
            Self {
                replies: Mutex::new(
                    replies.iter().rev().map(|r| r.to_string()).collect(),
                ),
                prompts: Mutex::new(Vec::new()),
            }
        }

        fn prompts(&self) -> Vec<Vec<ChatMessage>> {
            self.prompts.lock().unwrap().clone()
        }
    }

    impl LanguageModel for ScriptedModel {
        fn model_id(&self) -> &str {
            "scripted"
        }

        fn complete(&self, messages: &[ChatMessage]) -> Result<String> {
            self.prompts.lock().unwrap().push(messages.to_vec());
            self.replies
                .lock()
                .unwrap()
                .pop()
                .ok_or_else(|| {
                    Error::upstream("chat", false, "script exhausted")
                })
        }
    }

    fn retriever() -> Retriever {
        let embedder = HashEmbedder::new(64);
        let mut index = VectorIndex::new(embedder.model_id(), 64);
        for (section, text) in [
            (
                "Chapter 7",
                "recommender systems suggest items using collaborative filtering",
            ),
            ("Chapter 8", "computer vision models detect objects in images"),
            ("Chapter 9", "responsible ai requires fairness and transparency"),
        ] {
            index
                .add(&embedder.embed(text).unwrap(), Chunk::new(section, text))
                .unwrap();
        }
        Retriever::new(Arc::new(index), Arc::new(embedder), RetryPolicy::none())
            .unwrap()
    }

    fn chat_config() -> ChatConfig {
        ChatConfig {
            model: "scripted".into(),
            temperature: 0.0,
            history_turns: 10,
            course_name: "Module 2".into(),
            course_overview: None,
        }
    }

    fn retrieval_config() -> RetrievalConfig {
        RetrievalConfig {
            mode: RetrievalMode::Similarity,
            k: 1,
            fetch_k: 3,
            lambda: 0.5,
        }
    }

    #[test]
    fn first_question_is_answered_from_context() {
        let retriever = retriever();
        let model =
            ScriptedModel::new(&["Objects are detected by vision models."]);
        let (chat, retrieval) = (chat_config(), retrieval_config());
        let tutor = Tutor::new(&retriever, &model, &chat, &retrieval);
        let mut history = History::new(10);

        let answer = tutor
            .ask(
                &mut history,
                "how do computer vision models detect objects in images",
            )
            .unwrap();

        assert_eq!(answer.text, "Objects are detected by vision models.");
        assert_eq!(answer.sources[0].chunk.section, "Chapter 8");
        assert_eq!(answer.standalone_question, None);
        assert_eq!(history.len(), 1);

        let prompts = model.prompts();
        assert_eq!(prompts.len(), 1);
        let system = &prompts[0][0];
        assert_eq!(system.role, Role::System);
        assert!(system.content.contains("Module 2"));
        assert!(system.content.contains("[Chapter 8] computer vision models"));
        assert_eq!(prompts[0].last().unwrap().role, Role::User);
    }

    #[test]
    fn follow_up_is_condensed_before_retrieval() {
        let retriever = retriever();
        let model = ScriptedModel::new(&[
            "responsible ai requires fairness and transparency?",
            "It needs fairness and transparency.",
        ]);
        let (chat, retrieval) = (chat_config(), retrieval_config());
        let tutor = Tutor::new(&retriever, &model, &chat, &retrieval);
        let mut history = History::new(10);
        history.push("What is responsible AI?", "AI built with care.");

        let answer = tutor.ask(&mut history, "what does it require?").unwrap();

        assert_eq!(
            answer.standalone_question.as_deref(),
            Some("responsible ai requires fairness and transparency?")
        );
        assert_eq!(answer.sources[0].chunk.section, "Chapter 9");

        let prompts = model.prompts();
        assert_eq!(prompts.len(), 2);
        assert!(prompts[0][0].content.contains("standalone"));
        // system + one past exchange + question
        assert_eq!(prompts[1].len(), 4);
        assert_eq!(prompts[1][3].content, "what does it require?");
        assert_eq!(history.len(), 2);
    }

    #[test]
    fn capability_question_skips_the_model() {
        let retriever = retriever();
        let model = ScriptedModel::new(&[]);
        let (chat, retrieval) = (chat_config(), retrieval_config());
        let tutor = Tutor::new(&retriever, &model, &chat, &retrieval);
        let mut history = History::new(10);

        let answer = tutor.ask(&mut history, "Hey, What can you do?").unwrap();
        assert!(answer.text.contains("- Chapter 7"));
        assert!(answer.text.contains("- Chapter 9"));
        assert!(answer.sources.is_empty());
        assert!(model.prompts().is_empty());
        assert!(history.is_empty());
    }

    #[test]
    fn configured_overview_wins() {
        let retriever = retriever();
        let model = ScriptedModel::new(&[]);
        let chat = ChatConfig {
            course_overview: Some("- Chapter 7: Recommender Systems".into()),
            ..chat_config()
        };
        let retrieval = retrieval_config();
        let tutor = Tutor::new(&retriever, &model, &chat, &retrieval);
        assert_eq!(
            tutor.overview(),
            "I can help you with:\n- Chapter 7: Recommender Systems"
        );
    }

    #[test]
    fn model_failure_leaves_history_untouched() {
        let retriever = retriever();
        let model = ScriptedModel::new(&[]);
        let (chat, retrieval) = (chat_config(), retrieval_config());
        let tutor = Tutor::new(&retriever, &model, &chat, &retrieval);
        let mut history = History::new(10);

        assert!(matches!(
            tutor.ask(&mut history, "explain recommender systems"),
            Err(Error::Upstream { .. })
        ));
        assert!(history.is_empty());
    }

    #[test]
    fn blank_question_is_rejected() {
        let retriever = retriever();
        let model = ScriptedModel::new(&[]);
        let (chat, retrieval) = (chat_config(), retrieval_config());
        let tutor = Tutor::new(&retriever, &model, &chat, &retrieval);
        assert!(matches!(
            tutor.ask(&mut History::new(3), " \n"),
            Err(Error::EmptyInput(_))
        ));
    }
}
