use crate::{ScoredProcedure, SourceCitation};

/// Number of top matches attached to an answer as citations.
pub const CITATION_LIMIT: usize = 3;

pub const CITATION_RELEVANCE_LABEL: &str = "Procedimento consultado";

pub const UNCATEGORIZED_LABEL: &str = "Sem categoria";

/// Assistant reply used when no active procedure matches the question.
pub const NO_MATCH_RESPONSE: &str = "Desculpe, não encontrei informações sobre isso nos procedimentos cadastrados. Por favor, verifique se o procedimento existe ou entre em contato com um administrador para cadastrá-lo.";

const CONTEXT_SEPARATOR: &str = "\n\n---\n\n";

/// Concatenate matched procedures into the grounding block sent to the model.
#[must_use]
pub fn build_grounding_context(matches: &[ScoredProcedure]) -> String {
    matches
        .iter()
        .map(|matched| {
            let procedure = &matched.procedure;
            let category = procedure
                .category_id
                .map_or_else(|| UNCATEGORIZED_LABEL.to_string(), |id| id.to_string());
            format!(
                "# {}\nCategoria: {}\n{}\n\n{}",
                procedure.title, category, procedure.summary, procedure.content_md
            )
        })
        .collect::<Vec<_>>()
        .join(CONTEXT_SEPARATOR)
}

/// Embed the grounding block and the user's question in the fixed instruction template.
#[must_use]
pub fn compose_grounded_prompt(context: &str, question: &str) -> String {
    format!(
        "Você é o Oráculo de Procedimentos, um assistente especializado em responder perguntas sobre os procedimentos internos da empresa.

PROCEDIMENTOS DISPONÍVEIS:
{context}

REGRAS IMPORTANTES:
1. Responda APENAS com base nos procedimentos fornecidos acima
2. Se a resposta não estiver nos procedimentos, diga claramente que não encontrou a informação
3. Seja claro, objetivo e profissional
4. Use markdown para formatar a resposta (negrito, listas, etc)
5. Se relevante, cite o nome do procedimento usado

PERGUNTA DO USUÁRIO:
{question}

Responda de forma útil e estruturada:"
    )
}

/// Snapshot the first [`CITATION_LIMIT`] matches, in score order.
#[must_use]
pub fn citations_for(matches: &[ScoredProcedure]) -> Vec<SourceCitation> {
    matches
        .iter()
        .take(CITATION_LIMIT)
        .map(|matched| SourceCitation {
            procedure_id: matched.procedure.id,
            title: matched.procedure.title.clone(),
            relevance: CITATION_RELEVANCE_LABEL.to_string(),
        })
        .collect()
}
