//! Keyword relevance scorer used to pick grounding procedures for a question.
//!
//! This is an exact-substring heuristic over lower-cased text. It is not
//! tokenized, stemmed, or fuzzy, and results must stay bit-for-bit stable.

use serde::Serialize;

use crate::{Procedure, ProcedureStatus};

/// Maximum number of procedures returned for one question.
pub const RELEVANCE_LIMIT: usize = 5;

const TITLE_PHRASE_WEIGHT: u32 = 10;
const BODY_PHRASE_WEIGHT: u32 = 5;
const TAGS_PHRASE_WEIGHT: u32 = 3;
const TITLE_TERM_WEIGHT: u32 = 3;
const BODY_TERM_WEIGHT: u32 = 1;
const MIN_TERM_CHARS: usize = 4;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ScoredProcedure {
    pub procedure: Procedure,
    pub score: u32,
}

/// Score every active procedure against `question` and return the best matches.
///
/// At most [`RELEVANCE_LIMIT`] results, all with a positive score, sorted by
/// descending score. Equal scores keep the corpus order.
#[must_use]
pub fn score_procedures(question: &str, corpus: &[Procedure]) -> Vec<ScoredProcedure> {
    let question = question.to_lowercase();
    let terms = question
        .split_whitespace()
        .filter(|term| term.chars().count() >= MIN_TERM_CHARS)
        .collect::<Vec<_>>();

    let mut scored = corpus
        .iter()
        .filter(|procedure| procedure.status == ProcedureStatus::Active)
        .map(|procedure| ScoredProcedure {
            score: score_one(&question, &terms, procedure),
            procedure: procedure.clone(),
        })
        .filter(|candidate| candidate.score > 0)
        .collect::<Vec<_>>();

    // `sort_by` is stable, which is the only tie-breaker.
    scored.sort_by(|lhs, rhs| rhs.score.cmp(&lhs.score));
    scored.truncate(RELEVANCE_LIMIT);
    scored
}

fn score_one(question: &str, terms: &[&str], procedure: &Procedure) -> u32 {
    let title = procedure.title.to_lowercase();
    let body = procedure.content_md.to_lowercase();
    let tags = procedure.tags.join(" ").to_lowercase();

    let mut score = 0;
    if title.contains(question) {
        score += TITLE_PHRASE_WEIGHT;
    }
    if body.contains(question) {
        score += BODY_PHRASE_WEIGHT;
    }
    if tags.contains(question) {
        score += TAGS_PHRASE_WEIGHT;
    }
    for term in terms {
        if title.contains(term) {
            score += TITLE_TERM_WEIGHT;
        }
        if body.contains(term) {
            score += BODY_TERM_WEIGHT;
        }
    }
    score
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use time::OffsetDateTime;

    use super::*;
    use crate::ProcedureId;

    fn mk_procedure(title: &str, content_md: &str, tags: &[&str]) -> Procedure {
        Procedure {
            id: ProcedureId::new(),
            title: title.to_string(),
            category_id: None,
            status: ProcedureStatus::Active,
            content_md: content_md.to_string(),
            summary: String::new(),
            tags: tags.iter().map(|tag| (*tag).to_string()).collect(),
            attachments: Vec::new(),
            version: 1,
            created_at: OffsetDateTime::UNIX_EPOCH,
            updated_at: OffsetDateTime::UNIX_EPOCH,
        }
    }

    #[test]
    fn whole_question_in_title_scores_at_least_ten() {
        let corpus = vec![mk_procedure("Política de Reembolso", "Envie as notas fiscais.", &[])];
        let scored = score_procedures("reembolso", &corpus);
        assert_eq!(scored.len(), 1);
        assert!(scored[0].score >= 10);
        assert_eq!(scored[0].procedure.id, corpus[0].id);
    }

    #[test]
    fn empty_corpus_yields_no_matches() {
        assert!(score_procedures("qualquer coisa", &[]).is_empty());
    }

    #[test]
    fn no_overlap_yields_no_matches() {
        let corpus = vec![
            mk_procedure("Férias", "Solicite com antecedência.", &["rh"]),
            mk_procedure("Reembolso", "Anexe comprovantes.", &["financeiro"]),
        ];
        assert!(score_procedures("xyz-no-match", &corpus).is_empty());
    }

    #[test]
    fn weights_add_up_for_phrase_and_terms() {
        // Phrase in title (+10), phrase in body (+5), phrase in tags (+3),
        // term "reembolso" in title (+3) and body (+1).
        let corpus = vec![mk_procedure("Reembolso", "Regras de reembolso", &["reembolso"])];
        let scored = score_procedures("Reembolso", &corpus);
        assert_eq!(scored[0].score, 22);
    }

    #[test]
    fn short_terms_are_ignored() {
        let corpus = vec![mk_procedure("Uso do VPN", "Conecte via app", &[])];
        // "uso" and "vpn" have three characters, "como" has four but matches nothing.
        assert!(score_procedures("como uso vpn", &corpus).is_empty());
    }

    #[test]
    fn repeated_terms_count_each_time() {
        let corpus = vec![mk_procedure("Crachá", "crachá perdido", &[])];
        let scored = score_procedures("crachá crachá", &corpus);
        // Two occurrences of the term, each +3 title and +1 body.
        assert_eq!(scored[0].score, 8);
    }

    #[test]
    fn inactive_procedures_are_never_scored() {
        let mut draft = mk_procedure("Reembolso", "reembolso", &[]);
        draft.status = ProcedureStatus::Draft;
        let mut archived = mk_procedure("Reembolso antigo", "reembolso", &[]);
        archived.status = ProcedureStatus::Archived;
        assert!(score_procedures("reembolso", &[draft, archived]).is_empty());
    }

    #[test]
    fn results_are_capped_at_five() {
        let corpus = (0..8)
            .map(|index| mk_procedure(&format!("Reembolso {index}"), "texto", &[]))
            .collect::<Vec<_>>();
        let scored = score_procedures("reembolso", &corpus);
        assert_eq!(scored.len(), RELEVANCE_LIMIT);
    }

    #[test]
    fn ties_keep_corpus_order() {
        let corpus = vec![
            mk_procedure("Viagem nacional", "", &[]),
            mk_procedure("Reembolso de viagem", "", &[]),
            mk_procedure("Viagem internacional", "", &[]),
        ];
        let scored = score_procedures("viagem", &corpus);
        let ids = scored.iter().map(|item| item.procedure.id).collect::<Vec<_>>();
        assert_eq!(ids, vec![corpus[0].id, corpus[1].id, corpus[2].id]);
    }

    #[test]
    fn higher_scores_come_first() {
        let corpus = vec![
            mk_procedure("Manual geral", "como solicitar reembolso", &[]),
            mk_procedure("Reembolso", "texto", &[]),
        ];
        let scored = score_procedures("reembolso", &corpus);
        assert_eq!(scored[0].procedure.id, corpus[1].id);
        assert_eq!(scored[1].procedure.id, corpus[0].id);
    }

    fn arb_procedure() -> impl Strategy<Value = Procedure> {
        let words = prop::sample::select(vec![
            "reembolso", "viagem", "férias", "crachá", "senha", "acesso", "nota", "rh",
        ]);
        (
            prop::collection::vec(words.clone(), 0..4),
            prop::collection::vec(words.clone(), 0..8),
            prop::collection::vec(words, 0..3),
            prop::sample::select(vec![
                ProcedureStatus::Active,
                ProcedureStatus::Draft,
                ProcedureStatus::Archived,
            ]),
        )
            .prop_map(|(title, body, tags, status)| {
                let mut procedure = mk_procedure(&title.join(" "), &body.join(" "), &tags);
                procedure.status = status;
                procedure
            })
    }

    proptest! {
        #[test]
        fn property_results_are_bounded_positive_sorted_and_stable(
            corpus in prop::collection::vec(arb_procedure(), 0..12),
            question in "(reembolso|viagem|senha|nota|acesso)( (reembolso|viagem|crachá|rh)){0,2}",
        ) {
            let scored = score_procedures(&question, &corpus);
            prop_assert!(scored.len() <= RELEVANCE_LIMIT);
            prop_assert!(scored.iter().all(|item| item.score > 0));
            prop_assert!(scored.iter().all(|item| item.procedure.status == ProcedureStatus::Active));
            for pair in scored.windows(2) {
                prop_assert!(pair[0].score >= pair[1].score);
                if pair[0].score == pair[1].score {
                    let first = corpus.iter().position(|p| p.id == pair[0].procedure.id);
                    let second = corpus.iter().position(|p| p.id == pair[1].procedure.id);
                    prop_assert!(first < second);
                }
            }
        }
    }
}
