use std::sync::LazyLock;

use chrono::NaiveDate;
use regex::Regex;
use serde::{Deserialize, Serialize};
use stegbot_contracts::{HelpTopic, InternRecord};
use thiserror::Error;

pub const INVALID_INPUT_REPLY: &str = "Veuillez envoyer un message valide.";
pub const EMPTY_MESSAGE_REPLY: &str =
    "Je n'ai pas reçu de message. StegBot est là pour vous aider avec la gestion des stagiaires !";
pub const KEY_PROMPT_REPLY: &str =
    "Quel est le CIN du stagiaire recherché ? Envoyez uniquement les chiffres (6 à 20 chiffres).";
pub const LOOKUP_FAILED_REPLY: &str =
    "La recherche du stagiaire est momentanément indisponible. Veuillez réessayer dans un instant.";
pub const INTERNAL_ERROR_REPLY: &str =
    "Une erreur est survenue. Veuillez réessayer ou contacter l'administrateur.";

/// Bonus added to an intent's raw score when the whole message equals one of
/// its triggers.
pub const EXACT_MATCH_BONUS: usize = 10;

const ENTITY_KEYWORDS: &[&str] = &["stagiaire"];
const SEARCH_KEYWORDS: &[&str] = &["cherche", "trouve", "search", "find"];
const KEY_KEYWORDS: &[&str] = &["cin", "clé", "cle", "key"];

static KEY_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9]{6,20}$").expect("static CIN pattern compiles"));

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CatalogError {
    #[error("intent catalog is empty")]
    Empty,
    #[error("intent #{0} has a blank name")]
    BlankName(usize),
    #[error("intent {0} has no triggers")]
    NoTriggers(String),
    #[error("intent {0} has a blank trigger")]
    BlankTrigger(String),
    #[error("intent {0} has an empty response")]
    EmptyResponse(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Intent {
    pub name: String,
    pub triggers: Vec<String>,
    pub response: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScoredIntent<'a> {
    pub intent: &'a Intent,
    pub score: usize,
}

/// Ordered, read-only set of intents. Declaration order decides ties.
#[derive(Debug, Clone)]
pub struct IntentCatalog {
    intents: Vec<Intent>,
}

impl IntentCatalog {
    pub fn new(intents: Vec<Intent>) -> Result<Self, CatalogError> {
        if intents.is_empty() {
            return Err(CatalogError::Empty);
        }
        let mut normalized = Vec::with_capacity(intents.len());
        for (idx, intent) in intents.into_iter().enumerate() {
            let name = intent.name.trim().to_string();
            if name.is_empty() {
                return Err(CatalogError::BlankName(idx));
            }
            if intent.triggers.is_empty() {
                return Err(CatalogError::NoTriggers(name));
            }
            if intent.triggers.iter().any(|t| t.trim().is_empty()) {
                return Err(CatalogError::BlankTrigger(name));
            }
            if intent.response.trim().is_empty() {
                return Err(CatalogError::EmptyResponse(name));
            }
            normalized.push(Intent {
                name,
                triggers: intent.triggers.iter().map(|t| normalize(t)).collect(),
                response: intent.response,
            });
        }
        Ok(Self { intents: normalized })
    }

    pub fn builtin() -> Self {
        let intents = BUILTIN_INTENTS
            .iter()
            .map(|(name, triggers, response)| Intent {
                name: name.to_string(),
                triggers: triggers.iter().map(|t| t.to_string()).collect(),
                response: response.to_string(),
            })
            .collect();
        Self { intents }
    }

    pub fn intents(&self) -> &[Intent] {
        &self.intents
    }

    pub fn len(&self) -> usize {
        self.intents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.intents.is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        self.intents.iter().map(|i| i.name.clone()).collect()
    }

    /// First three triggers and the first response line of every intent.
    pub fn help_topics(&self) -> Vec<HelpTopic> {
        self.intents
            .iter()
            .map(|intent| HelpTopic {
                name: intent.name.clone(),
                keywords: intent.triggers.iter().take(3).cloned().collect(),
                description: intent.response.lines().next().unwrap_or_default().to_string(),
            })
            .collect()
    }
}

pub fn normalize(message: &str) -> String {
    message.trim().to_lowercase()
}

/// `raw * matched`, where `raw` sums the char length of every contained
/// trigger plus [`EXACT_MATCH_BONUS`] for an exact match.
pub fn score_intent(normalized: &str, intent: &Intent) -> usize {
    let mut matched = 0usize;
    let mut raw = 0usize;
    for trigger in &intent.triggers {
        if normalized.contains(trigger.as_str()) {
            matched += 1;
            raw += trigger.chars().count();
            if normalized == trigger.as_str() {
                raw += EXACT_MATCH_BONUS;
            }
        }
    }
    raw * matched
}

pub fn score_intents<'a>(message: &str, catalog: &'a IntentCatalog) -> Vec<ScoredIntent<'a>> {
    let normalized = normalize(message);
    if normalized.is_empty() {
        return Vec::new();
    }
    catalog
        .intents()
        .iter()
        .map(|intent| ScoredIntent {
            intent,
            score: score_intent(&normalized, intent),
        })
        .filter(|scored| scored.score > 0)
        .collect()
}

pub fn match_intent<'a>(message: &str, catalog: &'a IntentCatalog) -> Option<&'a Intent> {
    let mut best: Option<ScoredIntent<'a>> = None;
    for scored in score_intents(message, catalog) {
        match best {
            Some(current) if scored.score <= current.score => {}
            _ => best = Some(scored),
        }
    }
    best.map(|scored| scored.intent)
}

pub fn looks_like_key(text: &str) -> bool {
    KEY_PATTERN.is_match(text.trim())
}

/// True when the message asks to find a record: it names the entity, or it
/// pairs a search verb with a key word.
pub fn signals_key_search(message: &str) -> bool {
    let normalized = normalize(message);
    let contains_any = |words: &[&str]| words.iter().any(|w| normalized.contains(*w));
    contains_any(ENTITY_KEYWORDS) || (contains_any(SEARCH_KEYWORDS) && contains_any(KEY_KEYWORDS))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextualRule {
    pub name: String,
    pub all_of: Vec<String>,
    pub response: String,
}

#[derive(Debug, Clone)]
pub struct ContextualRules {
    rules: Vec<ContextualRule>,
}

impl ContextualRules {
    pub fn new(rules: Vec<ContextualRule>) -> Self {
        let rules = rules
            .into_iter()
            .map(|rule| ContextualRule {
                all_of: rule.all_of.iter().map(|k| normalize(k)).collect(),
                ..rule
            })
            .collect();
        Self { rules }
    }

    pub fn builtin() -> Self {
        Self::new(
            BUILTIN_RULES
                .iter()
                .map(|(name, all_of, response)| ContextualRule {
                    name: name.to_string(),
                    all_of: all_of.iter().map(|k| k.to_string()).collect(),
                    response: response.to_string(),
                })
                .collect(),
        )
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn evaluate(&self, message: &str) -> Option<&ContextualRule> {
        let normalized = normalize(message);
        if normalized.is_empty() {
            return None;
        }
        self.rules.iter().find(|rule| {
            !rule.all_of.is_empty() && rule.all_of.iter().all(|k| normalized.contains(k.as_str()))
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConversationState {
    #[default]
    Idle,
    AwaitingKey,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InternshipStatus {
    Ongoing,
    Completed,
}

impl InternshipStatus {
    /// The end date itself still counts as ongoing.
    pub fn derive(date_fin: NaiveDate, today: NaiveDate) -> Self {
        if today <= date_fin {
            InternshipStatus::Ongoing
        } else {
            InternshipStatus::Completed
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            InternshipStatus::Ongoing => "en cours",
            InternshipStatus::Completed => "terminé",
        }
    }
}

pub fn format_record(record: &InternRecord, today: NaiveDate) -> String {
    let status = InternshipStatus::derive(record.date_fin, today);
    format!(
        "Stagiaire trouvé :\n\
         • Nom : {} {}\n\
         • CIN : {}\n\
         • Email : {}\n\
         • Téléphone : {}\n\
         • Institut : {}\n\
         • Spécialité : {}\n\
         • Début : {}\n\
         • Fin : {}\n\
         • Objet du stage : {}\n\
         • Statut : {}",
        record.prenom,
        record.nom,
        record.cin,
        record.email,
        record.telephone,
        record.institut,
        record.specialite,
        record.date_debut.format("%d/%m/%Y"),
        record.date_fin.format("%d/%m/%Y"),
        record.objet_stage,
        status.label(),
    )
}

pub fn invalid_key_reply(text: &str) -> String {
    format!("« {text} » n'est pas un CIN valide : un CIN contient uniquement 6 à 20 chiffres.")
}

pub fn not_found_reply(key: &str) -> String {
    format!("Aucun stagiaire trouvé pour le CIN {key}.")
}

pub fn fallback_reply(text: &str) -> String {
    format!(
        "Désolé, je n'ai pas compris votre question \"{text}\".\n\n\
         Je peux vous aider avec :\n\
         • Ajouter/modifier/supprimer des stagiaires\n\
         • Rechercher dans la base de données\n\
         • Générer des attestations\n\
         • Questions sur le système\n\n\
         Pouvez-vous reformuler votre question ?"
    )
}

const BUILTIN_RULES: &[(&str, &[&str], &str)] = &[
    (
        "record_count",
        &["combien", "inscrit"],
        "Pour connaître le nombre total de stagiaires, consultez le tableau de bord ou la liste des stagiaires.",
    ),
    (
        "record_count",
        &["how many", "intern"],
        "Pour connaître le nombre total de stagiaires, consultez le tableau de bord ou la liste des stagiaires.",
    ),
    (
        "latest_records",
        &["derniers", "ajout"],
        "Les derniers stagiaires ajoutés apparaissent en haut de la liste. Vous pouvez aussi trier par date d'ajout.",
    ),
    (
        "latest_records",
        &["latest", "intern"],
        "Les derniers stagiaires ajoutés apparaissent en haut de la liste. Vous pouvez aussi trier par date d'ajout.",
    ),
];

const BUILTIN_INTENTS: &[(&str, &[&str], &str)] = &[
    (
        "greeting",
        &["bonjour", "hello", "salut", "bonsoir", "hey"],
        "Bonjour ! Je suis StegBot, l'assistant virtuel du système de gestion des stagiaires. Comment puis-je vous aider ?",
    ),
    (
        "thanks",
        &["merci", "thank", "thanks"],
        "Avec plaisir 😊 N'hésitez pas si vous avez d'autres questions !",
    ),
    (
        "goodbye",
        &["au revoir", "bye", "goodbye"],
        "Au revoir ! À bientôt pour gérer vos stagiaires !",
    ),
    (
        "help",
        &["aide", "help", "aider", "comment"],
        "Je peux vous aider avec :\n• Ajouter un nouveau stagiaire\n• Rechercher des stagiaires\n• Générer des attestations\n• Questions sur le système\nQue souhaitez-vous faire ?",
    ),
    (
        "identity",
        &["qui es tu", "who are you", "présente toi"],
        "Je suis StegBot, l'assistant virtuel du système de gestion des stagiaires. Je peux vous aider à naviguer dans l'application et répondre à vos questions.",
    ),
    (
        "add_intern",
        &["ajouter stagiaire", "nouveau stagiaire", "add intern", "créer stagiaire"],
        "Pour ajouter un nouveau stagiaire, vous devez remplir le formulaire avec :\n• CIN\n• Nom et prénom\n• Email et téléphone\n• Institut et spécialité\n• Dates de début et fin\n• Objet du stage",
    ),
    (
        "search",
        &["rechercher", "chercher", "trouver", "search", "find"],
        "Vous pouvez rechercher des stagiaires par :\n• CIN\n• Nom ou prénom\n• Email\n• Institut\n• Spécialité\nUtilisez la barre de recherche dans l'interface !",
    ),
    (
        "certificate",
        &["attestation", "certificat", "pdf", "document"],
        "Pour générer une attestation de stage :\n1. Trouvez le stagiaire dans la liste\n2. Cliquez sur 'Générer attestation'\n3. Le PDF sera créé automatiquement\nL'attestation contiendra toutes les informations du stage.",
    ),
    (
        "edit",
        &["modifier", "éditer", "changer", "update", "edit"],
        "Pour modifier un stagiaire :\n1. Trouvez le stagiaire dans la liste\n2. Cliquez sur 'Modifier'\n3. Changez les informations nécessaires\n4. Sauvegardez les modifications",
    ),
    (
        "delete",
        &["supprimer", "effacer", "delete", "remove"],
        "Pour supprimer un stagiaire :\n1. Trouvez le stagiaire dans la liste\n2. Cliquez sur 'Supprimer'\n3. Confirmez la suppression\n⚠️ Attention : cette action est irréversible !",
    ),
    (
        "troubleshooting",
        &["problème", "erreur", "bug", "marche pas", "error"],
        "Si vous rencontrez un problème :\n1. Vérifiez votre connexion internet\n2. Actualisez la page\n3. Vérifiez que tous les champs requis sont remplis\n4. Contactez l'administrateur si le problème persiste",
    ),
    (
        "login",
        &["connexion", "login", "mot de passe", "password"],
        "Pour vous connecter :\n• Utilisez votre email et mot de passe\n• En cas d'oubli, contactez l'administrateur\n• Vérifiez que vos identifiants sont corrects",
    ),
    (
        "interns",
        &["stagiaire", "intern", "étudiant", "stage"],
        "Le système permet de gérer tous les aspects des stagiaires :\n• Informations personnelles\n• Détails du stage\n• Suivi des dates\n• Génération d'attestations\nQue voulez-vous savoir spécifiquement ?",
    ),
    (
        "working_hours",
        &["les horaires", "temps", "heure de travail"],
        "les horaires sont de 9h à 16h , du lundi au vendredi",
    ),
];

#[cfg(test)]
mod tests {
    use super::*;

    fn intent(name: &str, triggers: &[&str]) -> Intent {
        Intent {
            name: name.to_string(),
            triggers: triggers.iter().map(|t| t.to_string()).collect(),
            response: format!("{name} response"),
        }
    }

    fn catalog(intents: Vec<Intent>) -> IntentCatalog {
        IntentCatalog::new(intents).unwrap()
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn record() -> InternRecord {
        InternRecord {
            cin: "12345678".to_string(),
            nom: "Trabelsi".to_string(),
            prenom: "Amine".to_string(),
            email: "amine@example.tn".to_string(),
            telephone: "+216 22 123 456".to_string(),
            institut: "ISET Rades".to_string(),
            specialite: "Developpement web".to_string(),
            date_debut: date(2026, 7, 1),
            date_fin: date(2026, 8, 31),
            objet_stage: "Refonte du portail".to_string(),
        }
    }

    #[test]
    fn greeting_matches_builtin_catalog() {
        let catalog = IntentCatalog::builtin();
        let matched = match_intent("  Bonjour ", &catalog).unwrap();
        assert_eq!(matched.name, "greeting");
    }

    #[test]
    fn message_without_any_trigger_has_no_match() {
        let catalog = IntentCatalog::builtin();
        assert!(match_intent("quelle est la météo à tunis", &catalog).is_none());
        assert!(score_intents("xyz", &catalog).is_empty());
    }

    #[test]
    fn blank_message_has_no_match() {
        let catalog = IntentCatalog::builtin();
        assert!(match_intent("", &catalog).is_none());
        assert!(match_intent("   \t ", &catalog).is_none());
    }

    #[test]
    fn exact_match_adds_bonus() {
        let greeting = intent("greeting", &["hello"]);
        assert_eq!(score_intent("hello", &greeting), 5 + EXACT_MATCH_BONUS);
        assert_eq!(score_intent("hello there", &greeting), 5);
    }

    #[test]
    fn score_is_raw_times_matched_count() {
        let many = intent("many", &["foo", "bar", "baz"]);
        assert_eq!(score_intent("foo bar baz", &many), (3 + 3 + 3) * 3);
    }

    #[test]
    fn several_short_triggers_beat_one_long_trigger() {
        let catalog = catalog(vec![
            intent("long", &["longtrigger"]),
            intent("many", &["foo", "bar", "baz"]),
        ]);
        let matched = match_intent("longtrigger foo bar baz", &catalog).unwrap();
        assert_eq!(matched.name, "many");
    }

    #[test]
    fn higher_score_wins_regardless_of_order() {
        let first = catalog(vec![intent("short", &["edit"]), intent("long", &["supprimer"])]);
        let second = catalog(vec![intent("long", &["supprimer"]), intent("short", &["edit"])]);
        let message = "edit ou supprimer";
        assert_eq!(match_intent(message, &first).unwrap().name, "long");
        assert_eq!(match_intent(message, &second).unwrap().name, "long");
    }

    #[test]
    fn equal_scores_keep_the_earlier_intent() {
        let forward = catalog(vec![intent("alpha", &["abc"]), intent("beta", &["xyz"])]);
        let backward = catalog(vec![intent("beta", &["xyz"]), intent("alpha", &["abc"])]);
        assert_eq!(match_intent("abc xyz", &forward).unwrap().name, "alpha");
        assert_eq!(match_intent("abc xyz", &backward).unwrap().name, "beta");
    }

    #[test]
    fn triggers_are_case_insensitive() {
        let catalog = catalog(vec![intent("hours", &["Les Horaires"])]);
        assert_eq!(catalog.intents()[0].triggers, vec!["les horaires"]);
        assert_eq!(
            match_intent("Quels sont LES HORAIRES ?", &catalog).unwrap().name,
            "hours"
        );
    }

    #[test]
    fn trigger_length_counts_characters() {
        let accented = intent("edit", &["éditer"]);
        assert_eq!(score_intent("éditer", &accented), 6 + EXACT_MATCH_BONUS);
    }

    #[test]
    fn catalog_rejects_invalid_intents() {
        assert_eq!(IntentCatalog::new(vec![]).unwrap_err(), CatalogError::Empty);
        assert_eq!(
            IntentCatalog::new(vec![intent(" ", &["a"])]).unwrap_err(),
            CatalogError::BlankName(0)
        );
        assert_eq!(
            IntentCatalog::new(vec![intent("x", &[])]).unwrap_err(),
            CatalogError::NoTriggers("x".to_string())
        );
        assert_eq!(
            IntentCatalog::new(vec![intent("x", &["ok", "  "])]).unwrap_err(),
            CatalogError::BlankTrigger("x".to_string())
        );
        let mut empty = intent("x", &["ok"]);
        empty.response = String::new();
        assert_eq!(
            IntentCatalog::new(vec![empty]).unwrap_err(),
            CatalogError::EmptyResponse("x".to_string())
        );
    }

    #[test]
    fn help_topics_show_three_triggers_and_first_line() {
        let topics = IntentCatalog::builtin().help_topics();
        let help = topics.iter().find(|t| t.name == "help").unwrap();
        assert_eq!(help.keywords, vec!["aide", "help", "aider"]);
        assert_eq!(help.description, "Je peux vous aider avec :");
        assert_eq!(topics.len(), IntentCatalog::builtin().len());
    }

    #[test]
    fn key_validator_accepts_six_to_twenty_digits() {
        assert!(looks_like_key("123456"));
        assert!(looks_like_key("12345678901234567890"));
        assert!(looks_like_key("  12345678 "));
        assert!(!looks_like_key("12345"));
        assert!(!looks_like_key("123456789012345678901"));
        assert!(!looks_like_key("12AB34"));
        assert!(!looks_like_key("123 456"));
        assert!(!looks_like_key("123-456-789"));
        assert!(!looks_like_key("١٢٣٤٥٦"));
        assert!(!looks_like_key(""));
    }

    #[test]
    fn entity_keyword_signals_key_search() {
        assert!(signals_key_search("stagiaire"));
        assert!(signals_key_search("Je cherche un STAGIAIRE"));
        assert!(signals_key_search("rechercher par CIN"));
        assert!(signals_key_search("find by key"));
        assert!(!signals_key_search("rechercher"));
        assert!(!signals_key_search("mon cin"));
        assert!(!signals_key_search("bonjour"));
    }

    #[test]
    fn contextual_rules_need_both_keywords() {
        let rules = ContextualRules::builtin();
        assert_eq!(
            rules.evaluate("Combien d'inscrits cette année ?").unwrap().name,
            "record_count"
        );
        assert_eq!(
            rules.evaluate("how many interns do we have").unwrap().name,
            "record_count"
        );
        assert_eq!(
            rules.evaluate("les derniers ajouts").unwrap().name,
            "latest_records"
        );
        assert!(rules.evaluate("combien").is_none());
        assert!(rules.evaluate("latest news").is_none());
        assert!(rules.evaluate("  ").is_none());
    }

    #[test]
    fn first_matching_rule_wins() {
        let rules = ContextualRules::new(vec![
            ContextualRule {
                name: "first".to_string(),
                all_of: vec!["A".to_string(), "b".to_string()],
                response: "1".to_string(),
            },
            ContextualRule {
                name: "second".to_string(),
                all_of: vec!["a".to_string(), "b".to_string()],
                response: "2".to_string(),
            },
        ]);
        assert_eq!(rules.evaluate("a b").unwrap().name, "first");
    }

    #[test]
    fn status_is_ongoing_through_end_date() {
        let end = date(2026, 8, 31);
        assert_eq!(
            InternshipStatus::derive(end, date(2026, 8, 30)),
            InternshipStatus::Ongoing
        );
        assert_eq!(InternshipStatus::derive(end, end), InternshipStatus::Ongoing);
        assert_eq!(
            InternshipStatus::derive(end, date(2026, 9, 1)),
            InternshipStatus::Completed
        );
    }

    #[test]
    fn formatted_record_lists_fields_and_status() {
        let text = format_record(&record(), date(2026, 10, 16));
        assert!(text.starts_with("Stagiaire trouvé :"));
        assert!(text.contains("• Nom : Amine Trabelsi"));
        assert!(text.contains("• CIN : 12345678"));
        assert!(text.contains("• Institut : ISET Rades"));
        assert!(text.contains("• Début : 01/07/2026"));
        assert!(text.contains("• Fin : 31/08/2026"));
        assert!(text.ends_with("• Statut : terminé"));

        let ongoing = format_record(&record(), date(2026, 7, 15));
        assert!(ongoing.ends_with("• Statut : en cours"));
    }

    #[test]
    fn fallback_echoes_user_text() {
        assert!(fallback_reply("quelle heure").contains("\"quelle heure\""));
        assert_eq!(not_found_reply("123456"), "Aucun stagiaire trouvé pour le CIN 123456.");
        assert!(invalid_key_reply("12AB34").contains("12AB34"));
    }

    #[test]
    fn canned_texts_keep_deployed_wording() {
        assert!(fallback_reply("x").contains("• Rechercher dans la base de données\n"));

        let catalog = IntentCatalog::builtin();
        let help = match_intent("aide", &catalog).unwrap();
        assert!(help.response.contains("• Rechercher des stagiaires\n"));
        let hours = match_intent("les horaires", &catalog).unwrap();
        assert_eq!(hours.response, "les horaires sont de 9h à 16h , du lundi au vendredi");
    }
}
