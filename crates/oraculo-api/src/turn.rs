//! One question/answer exchange.
//!
//! A turn is a fixed sequence of independent writes with no transaction around
//! them. The first failing step stops the turn and the returned
//! [`TurnFailure`] records exactly which writes already happened. Nothing is
//! retried or rolled back.

use std::fmt::{Display, Formatter};

use oraculo_core::{
    build_grounding_context, citations_for, compose_grounded_prompt, score_procedures,
    ConversationId, ConversationPatch, Message, MessageRole, NewConversation, NewMessage,
    ProcedureFilter, ProcedureQuery, ProcedureStatus, SessionUser, NO_MATCH_RESPONSE,
};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::OraculoApi;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AskRequest {
    pub question: String,
    #[serde(default)]
    pub conversation_id: Option<ConversationId>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TurnAnswer {
    pub conversation_id: ConversationId,
    pub created_conversation: bool,
    pub user_message: Message,
    pub assistant_message: Message,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TurnStage {
    ValidateQuestion,
    CreateConversation,
    PersistQuestion,
    LoadProcedures,
    InvokeLlm,
    PersistAnswer,
    TouchConversation,
}

impl TurnStage {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ValidateQuestion => "validate_question",
            Self::CreateConversation => "create_conversation",
            Self::PersistQuestion => "persist_question",
            Self::LoadProcedures => "load_procedures",
            Self::InvokeLlm => "invoke_llm",
            Self::PersistAnswer => "persist_answer",
            Self::TouchConversation => "touch_conversation",
        }
    }
}

impl Display for TurnStage {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a turn stopped and what it had already written.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, thiserror::Error)]
#[error("turn failed at {stage}: {error}")]
pub struct TurnFailure {
    pub stage: TurnStage,
    /// Set once a conversation exists, whether created by this turn or supplied.
    pub conversation_id: Option<ConversationId>,
    pub created_conversation: bool,
    pub user_message: Option<Message>,
    pub assistant_message: Option<Message>,
    pub error: String,
}

#[derive(Debug, Default)]
struct TurnProgress {
    conversation_id: Option<ConversationId>,
    created_conversation: bool,
    user_message: Option<Message>,
    assistant_message: Option<Message>,
}

impl TurnProgress {
    fn fail(&self, stage: TurnStage, error: impl Display) -> Box<TurnFailure> {
        Box::new(TurnFailure {
            stage,
            conversation_id: self.conversation_id,
            created_conversation: self.created_conversation,
            user_message: self.user_message.clone(),
            assistant_message: self.assistant_message.clone(),
            error: format!("{error:#}"),
        })
    }
}

impl OraculoApi {
    /// Answer one question for `user`, opening a conversation when none is given.
    ///
    /// # Errors
    /// Returns [`TurnFailure`] describing the failed stage and the writes that
    /// were already committed.
    pub fn answer(&self, user: &SessionUser, request: AskRequest) -> Result<TurnAnswer, Box<TurnFailure>> {
        let result = self.run_turn(user, request);
        match &result {
            Ok(answer) => tracing::info!(
                user = %user.email,
                conversation_id = %answer.conversation_id,
                created_conversation = answer.created_conversation,
                citations = answer.assistant_message.sources.len(),
                "turn answered"
            ),
            Err(failure) => tracing::error!(
                user = %user.email,
                stage = %failure.stage,
                conversation_id = ?failure.conversation_id.map(|id| id.to_string()),
                user_message_persisted = failure.user_message.is_some(),
                assistant_message_persisted = failure.assistant_message.is_some(),
                error = %failure.error,
                "turn aborted"
            ),
        }
        result
    }

    fn run_turn(&self, user: &SessionUser, request: AskRequest) -> Result<TurnAnswer, Box<TurnFailure>> {
        let mut progress = TurnProgress::default();
        let question = request.question.as_str();
        if question.trim().is_empty() {
            return Err(progress.fail(TurnStage::ValidateQuestion, "question MUST be provided"));
        }

        let conversation_id = match request.conversation_id {
            Some(id) => id,
            None => {
                let conversation = self
                    .create_conversation(&NewConversation::for_question(
                        question,
                        &user.email,
                        OffsetDateTime::now_utc(),
                    ))
                    .map_err(|err| progress.fail(TurnStage::CreateConversation, err))?;
                progress.created_conversation = true;
                conversation.id
            }
        };
        progress.conversation_id = Some(conversation_id);

        let user_message = self
            .create_message(&NewMessage {
                conversation_id,
                role: MessageRole::User,
                content: question.to_string(),
                sources: Vec::new(),
            })
            .map_err(|err| progress.fail(TurnStage::PersistQuestion, err))?;
        progress.user_message = Some(user_message.clone());

        let corpus = self
            .list_procedures(
                &ProcedureQuery::all().filter(ProcedureFilter::Status(ProcedureStatus::Active)),
            )
            .map_err(|err| progress.fail(TurnStage::LoadProcedures, err))?;
        let matches = score_procedures(question, &corpus);

        let (content, sources) = if matches.is_empty() {
            (NO_MATCH_RESPONSE.to_string(), Vec::new())
        } else {
            let prompt = compose_grounded_prompt(&build_grounding_context(&matches), question);
            let answer = self
                .invoke_llm(&prompt)
                .map_err(|err| progress.fail(TurnStage::InvokeLlm, err))?;
            (answer, citations_for(&matches))
        };

        let assistant_message = self
            .create_message(&NewMessage {
                conversation_id,
                role: MessageRole::Assistant,
                content,
                sources,
            })
            .map_err(|err| progress.fail(TurnStage::PersistAnswer, err))?;
        progress.assistant_message = Some(assistant_message.clone());

        self.update_conversation(
            conversation_id,
            &ConversationPatch { title: None, last_message_at: Some(OffsetDateTime::now_utc()) },
        )
        .map_err(|err| progress.fail(TurnStage::TouchConversation, err))?;

        Ok(TurnAnswer {
            conversation_id,
            created_conversation: progress.created_conversation,
            user_message,
            assistant_message,
        })
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use oraculo_core::{
        ConversationQuery, MessageFilter, MessageQuery, MessageSort, Order, ProcedureDraft,
        CITATION_LIMIT, CITATION_RELEVANCE_LABEL,
    };

    use super::*;
    use crate::test_support::{api_with, cleanup, ScriptedLlm};

    fn caller() -> SessionUser {
        SessionUser {
            id: oraculo_core::ProfileId::new(),
            email: "ana@empresa.com".to_string(),
            full_name: "Ana Souza".to_string(),
            role: oraculo_core::Role::User,
        }
    }

    fn seed(api: &OraculoApi, title: &str, status: ProcedureStatus) -> Result<oraculo_core::Procedure> {
        api.create_procedure(ProcedureDraft {
            title: title.to_string(),
            category_id: None,
            status,
            content_md: format!("Passo a passo de {}", title.to_lowercase()),
            summary: String::new(),
            tags: Vec::new(),
            attachments: Vec::new(),
            version: 1,
        })
    }

    fn ask(question: &str, conversation_id: Option<ConversationId>) -> AskRequest {
        AskRequest { question: question.to_string(), conversation_id }
    }

    fn transcript(api: &OraculoApi, id: ConversationId) -> Result<Vec<Message>> {
        api.list_messages(
            &MessageQuery::all()
                .filter(MessageFilter::ConversationId(id))
                .order_by(Order::asc(MessageSort::CreatedAt)),
        )
    }

    // Test IDs: TTURN-001
    #[test]
    fn first_turn_creates_conversation_and_message_pair() -> Result<()> {
        let llm = ScriptedLlm::answering("Envie as notas fiscais ao financeiro.");
        let api = api_with(llm.clone());
        let reembolso = seed(&api, "Reembolso", ProcedureStatus::Active)?;

        let question = format!("Como faço para pedir reembolso {}", "de despesas ".repeat(6));
        let answer = match api.answer(&caller(), ask(&question, None)) {
            Ok(answer) => answer,
            Err(failure) => panic!("turn should succeed: {failure}"),
        };
        assert!(answer.created_conversation);
        assert_eq!(answer.assistant_message.content, "Envie as notas fiscais ao financeiro.");
        assert_eq!(answer.assistant_message.sources.len(), 1);
        assert_eq!(answer.assistant_message.sources[0].procedure_id, reembolso.id);
        assert_eq!(answer.assistant_message.sources[0].relevance, CITATION_RELEVANCE_LABEL);
        assert_eq!(llm.call_count(), 1);
        assert!(llm.prompt().is_some_and(|prompt| prompt.contains("# Reembolso\nCategoria: Sem categoria")));

        let conversations = api.list_conversations(&ConversationQuery::all())?;
        assert_eq!(conversations.len(), 1);
        assert_eq!(conversations[0].title.chars().count(), 53);
        assert!(conversations[0].title.ends_with("..."));
        assert_eq!(conversations[0].user_email, "ana@empresa.com");

        let messages = transcript(&api, answer.conversation_id)?;
        let roles = messages.iter().map(|message| message.role).collect::<Vec<_>>();
        assert_eq!(roles, vec![MessageRole::User, MessageRole::Assistant]);
        cleanup(&api);
        Ok(())
    }

    // Test IDs: TTURN-002
    #[test]
    fn no_match_uses_fallback_without_calling_llm() -> Result<()> {
        let llm = ScriptedLlm::answering("não deveria ser usado");
        let api = api_with(llm.clone());
        seed(&api, "Férias", ProcedureStatus::Active)?;

        let answer = match api.answer(&caller(), ask("xyz-no-match", None)) {
            Ok(answer) => answer,
            Err(failure) => panic!("turn should succeed: {failure}"),
        };
        assert_eq!(answer.assistant_message.content, NO_MATCH_RESPONSE);
        assert!(answer.assistant_message.sources.is_empty());
        assert_eq!(llm.call_count(), 0);
        cleanup(&api);
        Ok(())
    }

    // Test IDs: TTURN-003
    #[test]
    fn citations_are_capped_and_come_from_top_matches() -> Result<()> {
        let api = api_with(ScriptedLlm::answering("resposta"));
        let mut seeded = Vec::new();
        for index in 0..5 {
            seeded.push(seed(&api, &format!("Viagem {index}"), ProcedureStatus::Active)?.id);
        }

        let answer = match api.answer(&caller(), ask("viagem", None)) {
            Ok(answer) => answer,
            Err(failure) => panic!("turn should succeed: {failure}"),
        };
        let cited = answer.assistant_message.sources.iter().map(|s| s.procedure_id).collect::<Vec<_>>();
        assert_eq!(cited.len(), CITATION_LIMIT);
        assert_eq!(cited, seeded[..CITATION_LIMIT].to_vec());
        cleanup(&api);
        Ok(())
    }

    // Test IDs: TTURN-004
    #[test]
    fn inactive_procedures_are_never_cited() -> Result<()> {
        let llm = ScriptedLlm::answering("resposta");
        let api = api_with(llm.clone());
        seed(&api, "Reembolso rascunho", ProcedureStatus::Draft)?;
        seed(&api, "Reembolso antigo", ProcedureStatus::Archived)?;

        let answer = match api.answer(&caller(), ask("reembolso", None)) {
            Ok(answer) => answer,
            Err(failure) => panic!("turn should succeed: {failure}"),
        };
        assert!(answer.assistant_message.sources.is_empty());
        assert_eq!(answer.assistant_message.content, NO_MATCH_RESPONSE);
        assert_eq!(llm.call_count(), 0);
        cleanup(&api);
        Ok(())
    }

    // Test IDs: TTURN-005
    #[test]
    fn llm_failure_keeps_question_and_retry_adds_new_pair() -> Result<()> {
        let api = api_with(ScriptedLlm::failing());
        seed(&api, "Reembolso", ProcedureStatus::Active)?;

        let failure = match api.answer(&caller(), ask("reembolso", None)) {
            Ok(answer) => panic!("turn should fail, got {answer:?}"),
            Err(failure) => failure,
        };
        assert_eq!(failure.stage, TurnStage::InvokeLlm);
        assert!(failure.created_conversation);
        assert!(failure.user_message.is_some());
        assert!(failure.assistant_message.is_none());
        assert!(failure.error.contains("503"));

        let Some(conversation_id) = failure.conversation_id else {
            panic!("failure should name the conversation");
        };
        let after_failure = transcript(&api, conversation_id)?;
        assert_eq!(after_failure.len(), 1);
        assert_eq!(after_failure[0].role, MessageRole::User);

        let retry_api = OraculoApi { llm: ScriptedLlm::answering("Agora sim."), ..api.clone() };
        let answer = match retry_api.answer(&caller(), ask("reembolso", Some(conversation_id))) {
            Ok(answer) => answer,
            Err(failure) => panic!("retry should succeed: {failure}"),
        };
        assert!(!answer.created_conversation);

        let after_retry = transcript(&api, conversation_id)?;
        assert_eq!(after_retry.len(), 3);
        assert_eq!(after_retry[0], after_failure[0]);
        assert_eq!(after_retry[2].content, "Agora sim.");
        cleanup(&api);
        Ok(())
    }

    // Test IDs: TTURN-006
    #[test]
    fn blank_question_is_rejected_without_writes() -> Result<()> {
        let api = api_with(ScriptedLlm::answering("resposta"));
        let failure = match api.answer(&caller(), ask("   \n", None)) {
            Ok(answer) => panic!("blank question should fail, got {answer:?}"),
            Err(failure) => failure,
        };
        assert_eq!(failure.stage, TurnStage::ValidateQuestion);
        assert!(failure.conversation_id.is_none());
        assert!(api.list_conversations(&ConversationQuery::all())?.is_empty());
        cleanup(&api);
        Ok(())
    }

    // Test IDs: TTURN-007
    #[test]
    fn unknown_conversation_fails_when_persisting_question() -> Result<()> {
        let api = api_with(ScriptedLlm::answering("resposta"));
        let missing = ConversationId::new();
        let failure = match api.answer(&caller(), ask("reembolso", Some(missing))) {
            Ok(answer) => panic!("turn should fail, got {answer:?}"),
            Err(failure) => failure,
        };
        assert_eq!(failure.stage, TurnStage::PersistQuestion);
        assert_eq!(failure.conversation_id, Some(missing));
        assert!(failure.user_message.is_none());
        assert!(!failure.created_conversation);
        cleanup(&api);
        Ok(())
    }

    // Test IDs: TTURN-008
    #[test]
    fn follow_up_turn_bumps_last_activity() -> Result<()> {
        let api = api_with(ScriptedLlm::answering("resposta"));
        seed(&api, "Reembolso", ProcedureStatus::Active)?;
        let first = match api.answer(&caller(), ask("reembolso", None)) {
            Ok(answer) => answer,
            Err(failure) => panic!("turn should succeed: {failure}"),
        };
        let Some(before) = api.get_conversation(first.conversation_id)? else {
            panic!("conversation should exist");
        };

        if let Err(failure) = api.answer(&caller(), ask("e o prazo do reembolso?", Some(first.conversation_id))) {
            panic!("follow-up should succeed: {failure}");
        }
        let Some(after) = api.get_conversation(first.conversation_id)? else {
            panic!("conversation should exist");
        };
        assert!(after.last_message_at >= before.last_message_at);
        assert_eq!(after.title, before.title);
        assert_eq!(transcript(&api, first.conversation_id)?.len(), 4);
        cleanup(&api);
        Ok(())
    }

    // Test IDs: TTURN-009
    #[test]
    fn surrounding_whitespace_is_kept_for_scoring_and_storage() -> Result<()> {
        let llm = ScriptedLlm::answering("resposta");
        let api = api_with(llm.clone());
        seed(&api, "Reembolso", ProcedureStatus::Active)?;
        let viagem = seed(&api, "Reembolso de viagem", ProcedureStatus::Active)?;

        let answer = match api.answer(&caller(), ask("reembolso ", None)) {
            Ok(answer) => answer,
            Err(failure) => panic!("turn should succeed: {failure}"),
        };
        assert_eq!(answer.user_message.content, "reembolso ");
        // Only "reembolso de viagem" contains the phrase with its trailing space.
        assert_eq!(answer.assistant_message.sources[0].procedure_id, viagem.id);
        assert!(llm.prompt().is_some_and(|prompt| prompt.contains("PERGUNTA DO USUÁRIO:\nreembolso \n")));

        let Some(conversation) = api.get_conversation(answer.conversation_id)? else {
            panic!("conversation should exist");
        };
        assert_eq!(conversation.title, "reembolso ");
        cleanup(&api);
        Ok(())
    }
}
