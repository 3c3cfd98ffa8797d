//! Predefined-answer matcher.
//!
//! Short-circuits greetings and frequent questions before any retrieval or
//! generation work. Matching is a pure function of the rule table.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use rag_core::{PredefinedConfig, PredefinedRule, RagError, Result};

/// Characters removed during normalization.
const STRIPPED_PUNCTUATION: &[char] = &['?', '!', '.', ',', ';', ':'];

/// Bonus per keyword found in the normalized question.
const KEYWORD_BONUS: f32 = 0.1;

/// Cap on the total keyword bonus.
const MAX_KEYWORD_BONUS: f32 = 0.3;

/// Default acceptance threshold.
pub const DEFAULT_THRESHOLD: f32 = 0.7;

/// Canonical token and the variants collapsed onto it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Synonym {
    pub canonical: String,
    pub variants: Vec<String>,
}

/// A successful match.
#[derive(Debug, Clone, PartialEq)]
pub struct PredefinedMatch {
    pub rule: PredefinedRule,
    /// Similarity plus keyword bonus.
    pub score: f32,
}

/// Summary of the rule table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PredefinedStats {
    pub total_questions: usize,
    pub average_confidence: f32,
    pub total_keywords: usize,
}

/// On-disk rule table.
#[derive(Debug, Deserialize)]
struct RulesFile {
    #[serde(default, rename = "rule")]
    rules: Vec<PredefinedRule>,

    #[serde(default, rename = "synonym")]
    synonyms: Vec<Synonym>,

    /// Keep the built-in rules and append the file's rules after them.
    #[serde(default)]
    include_defaults: bool,
}

#[derive(Debug, Clone)]
struct Entry {
    rule: PredefinedRule,
    /// Canonical question as stored; only the incoming question is normalized.
    target: Vec<char>,
}

/// Fuzzy matcher over a static table of canned answers.
#[derive(Debug, Clone)]
pub struct PredefinedMatcher {
    entries: Vec<Entry>,
    synonyms: Vec<Synonym>,
    threshold: f32,
}

impl PredefinedMatcher {
    /// Matcher over `rules`, normalizing with `synonyms`.
    pub fn new(rules: Vec<PredefinedRule>, synonyms: Vec<Synonym>) -> Self {
        let mut matcher = Self {
            entries: Vec::with_capacity(rules.len()),
            synonyms,
            threshold: DEFAULT_THRESHOLD,
        };
        for rule in rules {
            matcher.push(rule);
        }
        matcher
    }

    /// Matcher with the built-in rules and synonyms.
    pub fn with_defaults() -> Self {
        Self::new(default_rules(), default_synonyms())
    }

    /// Matcher with no rules; never matches.
    pub fn empty() -> Self {
        Self::new(Vec::new(), default_synonyms())
    }

    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Build from configuration: a rules file when set, the built-in table
    /// otherwise.
    pub fn from_config(config: &PredefinedConfig) -> Result<Self> {
        let matcher = match &config.rules_path {
            Some(path) => Self::load(path)?,
            None => Self::with_defaults(),
        };
        Ok(matcher.with_threshold(config.threshold))
    }

    /// Load a TOML rule table.
    ///
    /// ```toml
    /// include_defaults = true
    ///
    /// [[rule]]
    /// canonical_question = "horaires d'ouverture"
    /// answer = "Nos agences sont ouvertes de 8h à 16h."
    /// keywords = ["horaires", "ouverture"]
    /// confidence = 0.9
    ///
    /// [[synonym]]
    /// canonical = "horaires"
    /// variants = ["heures"]
    /// ```
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let file: RulesFile = toml::from_str(&content).map_err(|e| {
            RagError::config(format!("Invalid rules file {}: {}", path.display(), e))
        })?;

        let synonyms = if file.synonyms.is_empty() {
            default_synonyms()
        } else {
            file.synonyms
        };
        let base = if file.include_defaults {
            default_rules()
        } else {
            Vec::new()
        };

        let mut matcher = Self::new(base, synonyms);
        for rule in file.rules {
            matcher.add_rule(rule);
        }
        info!(
            "Loaded {} predefined rules from {}",
            matcher.entries.len(),
            path.display()
        );
        Ok(matcher)
    }

    /// Lowercase, strip punctuation and collapse synonyms.
    pub fn normalize(&self, question: &str) -> String {
        let mut text: String = question
            .to_lowercase()
            .chars()
            .filter(|c| !STRIPPED_PUNCTUATION.contains(c))
            .collect();

        for synonym in &self.synonyms {
            for variant in &synonym.variants {
                if text.contains(variant.as_str()) {
                    text = text.replace(variant.as_str(), &synonym.canonical);
                }
            }
        }

        text.trim().to_string()
    }

    /// Best rule scoring at least the configured threshold.
    pub fn find(&self, question: &str) -> Option<PredefinedMatch> {
        self.find_with_threshold(question, self.threshold)
    }

    /// Best rule scoring at least `threshold`. On ties the earliest rule
    /// wins.
    pub fn find_with_threshold(&self, question: &str, threshold: f32) -> Option<PredefinedMatch> {
        let normalized = self.normalize(question);
        let chars: Vec<char> = normalized.chars().collect();

        let mut best: Option<(usize, f32)> = None;
        for (i, entry) in self.entries.iter().enumerate() {
            let similarity = ratio(&chars, &entry.target);
            let hits = entry
                .rule
                .keywords
                .iter()
                .filter(|k| normalized.contains(k.to_lowercase().as_str()))
                .count();
            let bonus = (KEYWORD_BONUS * hits as f32).min(MAX_KEYWORD_BONUS);
            let score = similarity + bonus;

            if score >= threshold && best.map_or(true, |(_, s)| score > s) {
                best = Some((i, score));
            }
        }

        let (index, score) = best?;
        let rule = self.entries[index].rule.clone();
        debug!(
            "Predefined match for {:?}: {:?} (score {:.3})",
            question, rule.canonical_question, score
        );
        Some(PredefinedMatch { rule, score })
    }

    /// Add or replace a rule. The question is stored normalized.
    pub fn add_rule(&mut self, mut rule: PredefinedRule) {
        rule.canonical_question = self.normalize(&rule.canonical_question);
        match self
            .entries
            .iter_mut()
            .find(|e| e.rule.canonical_question == rule.canonical_question)
        {
            Some(existing) => {
                existing.target = rule.canonical_question.chars().collect();
                existing.rule = rule;
            }
            None => self.push(rule),
        }
    }

    fn push(&mut self, rule: PredefinedRule) {
        let target = rule.canonical_question.chars().collect();
        self.entries.push(Entry { rule, target });
    }

    /// Canonical questions in table order.
    pub fn questions(&self) -> Vec<&str> {
        self.entries
            .iter()
            .map(|e| e.rule.canonical_question.as_str())
            .collect()
    }

    pub fn rules(&self) -> impl Iterator<Item = &PredefinedRule> {
        self.entries.iter().map(|e| &e.rule)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn statistics(&self) -> PredefinedStats {
        let total = self.entries.len();
        let average_confidence = if total == 0 {
            0.0
        } else {
            self.entries.iter().map(|e| e.rule.confidence).sum::<f32>() / total as f32
        };
        PredefinedStats {
            total_questions: total,
            average_confidence,
            total_keywords: self.entries.iter().map(|e| e.rule.keywords.len()).sum(),
        }
    }

    /// Rules whose question or keywords contain `keyword` (case-insensitive).
    pub fn search_by_keyword(&self, keyword: &str) -> Vec<&PredefinedRule> {
        let needle = keyword.to_lowercase();
        self.rules()
            .filter(|rule| {
                rule.canonical_question.to_lowercase().contains(&needle)
                    || rule.keywords.iter().any(|k| k.to_lowercase().contains(&needle))
            })
            .collect()
    }
}

/// Ratcliff-Obershelp similarity: `2 * matched / (len(a) + len(b))`.
pub fn similarity(a: &str, b: &str) -> f32 {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    ratio(&a, &b)
}

fn ratio(a: &[char], b: &[char]) -> f32 {
    let total = a.len() + b.len();
    if total == 0 {
        return 1.0;
    }
    2.0 * matched_chars(a, b) as f32 / total as f32
}

/// Total size of the matching blocks found by recursively taking the
/// longest common substring and recursing on both sides of it.
fn matched_chars(a: &[char], b: &[char]) -> usize {
    let mut matched = 0;
    let mut pending = vec![(0, a.len(), 0, b.len())];

    while let Some((alo, ahi, blo, bhi)) = pending.pop() {
        let (i, j, size) = longest_match(a, b, alo, ahi, blo, bhi);
        if size == 0 {
            continue;
        }
        matched += size;
        if alo < i && blo < j {
            pending.push((alo, i, blo, j));
        }
        if i + size < ahi && j + size < bhi {
            pending.push((i + size, ahi, j + size, bhi));
        }
    }

    matched
}

/// Longest common run in `a[alo..ahi]` and `b[blo..bhi]`, earliest in `a`
/// then earliest in `b`.
fn longest_match(
    a: &[char],
    b: &[char],
    alo: usize,
    ahi: usize,
    blo: usize,
    bhi: usize,
) -> (usize, usize, usize) {
    let (mut best_i, mut best_j, mut best_size) = (alo, blo, 0);
    let width = bhi - blo;
    let mut prev = vec![0usize; width + 1];
    let mut curr = vec![0usize; width + 1];

    for i in alo..ahi {
        for j in blo..bhi {
            let col = j - blo + 1;
            if a[i] == b[j] {
                let run = prev[col - 1] + 1;
                curr[col] = run;
                if run > best_size {
                    best_i = i + 1 - run;
                    best_j = j + 1 - run;
                    best_size = run;
                }
            } else {
                curr[col] = 0;
            }
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    (best_i, best_j, best_size)
}

/// Built-in synonym table, applied in order.
pub fn default_synonyms() -> Vec<Synonym> {
    let table: [(&str, &[&str]); 5] = [
        ("css", &["caisse de sécurité sociale", "sécurité sociale", "caisse"]),
        ("retraite", &["pension", "retirement", "cessation d'activité"]),
        ("cotisation", &["contribution", "versement", "prélèvement"]),
        ("allocations", &["prestations", "indemnités", "aides"]),
        ("remboursement", &["remboursé", "rembourser", "prise en charge"]),
    ];
    table
        .iter()
        .map(|(canonical, variants)| Synonym {
            canonical: canonical.to_string(),
            variants: variants.iter().map(|v| v.to_string()).collect(),
        })
        .collect()
}

const HOW_CAN_I_HELP: &str = "Comment puis-je vous aider aujourd'hui ?";

const INTRODUCTION: &str = "Je suis une intelligence artificielle spécialisée dans l'assistance aux assurés de la CSS au Sénégal. Je peux répondre à vos questions sur la retraite, les cotisations, les allocations familiales et bien plus encore. Comment puis-je vous aider aujourd'hui ?";

/// Built-in greetings and social-security FAQ.
pub fn default_rules() -> Vec<PredefinedRule> {
    vec![
        PredefinedRule::new("Bonjour", format!("Bonjour ! {}", HOW_CAN_I_HELP), &["Bonjour", "salutation"], 0.95),
        PredefinedRule::new("Salut", format!("Salut ! {}", HOW_CAN_I_HELP), &["Salut", "salutation"], 0.95),
        PredefinedRule::new("Comment ça va", format!("Bien, merci ! {}", HOW_CAN_I_HELP), &["Comment", "ça", "va"], 0.95),
        PredefinedRule::new(
            "Comment vous appelez-vous",
            format!("Je m'appelle CSS AI. {}", HOW_CAN_I_HELP),
            &["Comment", "vous", "appelez-vous"],
            0.95,
        ),
        PredefinedRule::new("Comment vous présentez-vous", INTRODUCTION, &["Comment", "vous", "présentez-vous"], 0.95),
        PredefinedRule::new(
            "Comment vous pouvez vous aider",
            "Je suis là pour vous aider. Que souhaitez-vous savoir ?",
            &["Comment", "vous", "pouvez", "vous", "aider"],
            0.95,
        ),
        PredefinedRule::new(
            "Quel est votre nom",
            format!("Je m'appelle CSS AI. {}", HOW_CAN_I_HELP),
            &["Quel", "est", "votre", "nom"],
            0.95,
        ),
        PredefinedRule::new("Quel est votre rôle", INTRODUCTION, &["Quel", "est", "votre", "rôle"], 0.95),
        PredefinedRule::new(
            "Qu'est-ce que la retraite",
            "La retraite est une pension versée aux travailleurs salariés affiliés à la CSS lorsqu'ils cessent leur activité professionnelle.",
            &["retraite", "pension", "sociale", "affilié"],
            0.95,
        ),
        PredefinedRule::new(
            "Merci",
            "De rien ! N'hésitez pas à me poser d'autres questions.",
            &["Merci", "merci"],
            0.95,
        ),
        PredefinedRule::new(
            "Ok",
            "Ok ! N'hésitez pas à me poser d'autres questions.",
            &["Ok", "ok"],
            0.95,
        ),
        PredefinedRule::new(
            "quel est l'âge de la retraite",
            "L'âge légal de départ à la retraite au Sénégal est de 60 ans pour les salariés du secteur privé affiliés à la CSS. Un départ anticipé est possible sous conditions, et l'activité peut être prolongée jusqu'à 65 ans.",
            &["âge", "retraite", "60 ans", "départ", "légal"],
            0.95,
        ),
        PredefinedRule::new(
            "à quel âge peut-on prendre sa retraite",
            "Vous pouvez prendre votre retraite à partir de 60 ans si vous êtes affilié à la CSS, avec une possibilité de prolongation jusqu'à 65 ans selon votre situation.",
            &["âge", "prendre", "retraite", "60"],
            0.95,
        ),
        PredefinedRule::new(
            "quel est le taux de cotisation css",
            "Le taux de cotisation à la CSS est de 24% du salaire brut : 16% à la charge de l'employeur et 8% à la charge du salarié. Il couvre les prestations familiales, la pension de retraite et les risques professionnels.",
            &["taux", "cotisation", "24%", "employeur", "salarié"],
            0.9,
        ),
        PredefinedRule::new(
            "combien cotise-t-on à la css",
            "Les cotisations à la CSS représentent 24% du salaire brut : 8% prélevés sur le salaire et 16% payés par l'employeur.",
            &["cotise", "cotisation", "24%", "8%", "16%"],
            0.9,
        ),
        PredefinedRule::new(
            "montant des allocations familiales",
            "Les allocations familiales sont versées mensuellement. Leur montant dépend du nombre d'enfants à charge et de leur âge ; le barème en vigueur est disponible auprès de votre agence CSS.",
            &["montant", "allocations", "familiales", "enfants"],
            0.85,
        ),
        PredefinedRule::new(
            "qui a droit aux allocations familiales",
            "Les salariés affiliés à la CSS ayant des enfants à charge de moins de 21 ans (25 ans en cas d'études) résidant au Sénégal et déclarés à la CSS.",
            &["droit", "allocations", "familiales", "enfants", "21 ans"],
            0.9,
        ),
        PredefinedRule::new(
            "comment être remboursé par la css",
            "Présentez votre carte CSS lors des soins, conservez les justificatifs (ordonnances, factures), puis déposez votre dossier de remboursement dans les délais.",
            &["remboursé", "remboursement", "carte", "justificatifs"],
            0.85,
        ),
        PredefinedRule::new(
            "quels soins sont couverts par la css",
            "La CSS couvre les consultations, les hospitalisations, les médicaments prescrits, les examens de laboratoire, la radiologie et certains soins dentaires.",
            &["soins", "couverts", "consultations", "médicaments"],
            0.85,
        ),
        PredefinedRule::new(
            "quels documents pour s'inscrire à la css",
            "Une copie de votre pièce d'identité, un certificat de travail, les bulletins de salaire des 3 derniers mois, une fiche d'état civil et le formulaire d'immatriculation rempli.",
            &["documents", "inscrire", "pièce", "identité", "certificat"],
            0.9,
        ),
        PredefinedRule::new(
            "comment obtenir une attestation css",
            "Rendez-vous dans votre agence CSS avec votre pièce d'identité et votre numéro d'immatriculation, ou faites la demande en ligne sur le site officiel.",
            &["attestation", "obtenir", "agence", "identité"],
            0.9,
        ),
        PredefinedRule::new(
            "délai de traitement css",
            "Remboursements maladie : 15 à 30 jours. Prestations familiales : 7 à 15 jours. Pension de retraite : 1 à 3 mois. Un dossier incomplet allonge ces délais.",
            &["délai", "traitement", "remboursement", "pension"],
            0.8,
        ),
        PredefinedRule::new(
            "numéro de téléphone css",
            "Vous pouvez appeler le numéro vert gratuit de la CSS ou vous rendre dans une agence régionale. Les coordonnées figurent sur le site officiel.",
            &["numéro", "téléphone", "contact", "agence"],
            0.85,
        ),
        PredefinedRule::new(
            "où se trouve l'agence css",
            "La CSS dispose d'agences dans toutes les régions du Sénégal ; l'agence principale est à Dakar.",
            &["agence", "adresse", "dakar", "région"],
            0.85,
        ),
        PredefinedRule::new(
            "qu'est-ce que la css",
            "La CSS (Caisse de Sécurité Sociale) gère au Sénégal les prestations familiales, les pensions de retraite, les accidents du travail et les prestations maladie des salariés du secteur privé.",
            &["css", "caisse", "sécurité sociale", "organisme"],
            0.95,
        ),
        PredefinedRule::new(
            "comment fonctionne la css",
            "La CSS fonctionne par répartition : les cotisations des actifs financent les prestations versées aux bénéficiaires.",
            &["fonctionne", "répartition", "cotisations", "prestations"],
            0.9,
        ),
    ]
}
