//! Prompt assembly from ranked context.

use rag_core::RankedItem;

/// Ranked contents labeled `Source 1..N`, separated by blank lines.
pub fn format_context(ranked: &[RankedItem]) -> String {
    ranked
        .iter()
        .enumerate()
        .map(|(i, item)| format!("Source {}: {}", i + 1, item.content))
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Grounded-answer prompt for `question`.
pub fn build_prompt(question: &str, ranked: &[RankedItem]) -> String {
    format!(
        "Vous êtes un assistant expert qui répond aux questions en utilisant uniquement le contexte fourni.\n\
         \n\
         CONTEXTE:\n\
         {context}\n\
         \n\
         QUESTION: {question}\n\
         \n\
         INSTRUCTIONS:\n\
         1. Répondez uniquement à partir des informations du contexte fourni\n\
         2. Si le contexte ne contient pas l'information, dites-le clairement\n\
         3. Citez vos sources sous la forme \"Source X\"\n\
         4. Soyez précis et concis\n\
         5. Synthétisez les informations complémentaires de plusieurs sources\n\
         \n\
         RÉPONSE:",
        context = format_context(ranked),
        question = question,
    )
}
