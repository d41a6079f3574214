use chrono::{DateTime, Duration, Utc};
use thiserror::Error;

use crate::domain::conversation::Conversation;
use crate::domain::user::User;

/// Channel policy: proactive messages are allowed only inside this many
/// hours after the customer last wrote (or after conversation creation when
/// the customer has not written yet).
pub const DEFAULT_WINDOW_HOURS: u32 = 24;

/// True iff `now - reference < window`. The boundary itself is outside the
/// window.
pub fn is_within_window(now: DateTime<Utc>, reference: DateTime<Utc>, window: Duration) -> bool {
    now.signed_duration_since(reference) < window
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ComplianceRefusal {
    #[error("user has opted out of messaging")]
    OptedOut,
    #[error("messaging window has expired")]
    WindowExpired,
    #[error("engagement cycle budget is exhausted")]
    CyclesExhausted,
}

impl ComplianceRefusal {
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::OptedOut => "opted_out",
            Self::WindowExpired => "window_expired",
            Self::CyclesExhausted => "cycles_exhausted",
        }
    }
}

/// Decides whether an outbound message may be sent right now.
///
/// Replies are gated on consent and the messaging window; proactive
/// (agent-initiated) sends are additionally gated on the cycle budget.
#[derive(Clone, Debug)]
pub struct ComplianceGate {
    window: Duration,
    max_cycles: u32,
}

impl ComplianceGate {
    pub fn new(window_hours: u32, max_cycles: u32) -> Self {
        Self { window: Duration::hours(i64::from(window_hours)), max_cycles }
    }

    pub fn allow_reply(
        &self,
        conversation: &Conversation,
        user: &User,
        now: DateTime<Utc>,
    ) -> Result<(), ComplianceRefusal> {
        if user.opted_out {
            return Err(ComplianceRefusal::OptedOut);
        }
        if !is_within_window(now, conversation.window_reference(), self.window) {
            return Err(ComplianceRefusal::WindowExpired);
        }
        Ok(())
    }

    pub fn allow_proactive(
        &self,
        conversation: &Conversation,
        user: &User,
        now: DateTime<Utc>,
    ) -> Result<(), ComplianceRefusal> {
        self.allow_reply(conversation, user, now)?;
        if conversation.cycle_count >= self.max_cycles {
            return Err(ComplianceRefusal::CyclesExhausted);
        }
        Ok(())
    }
}

impl Default for ComplianceGate {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW_HOURS, 3)
    }
}

/// Deterministic first layer of opt-out detection: whole-word,
/// case-insensitive scan for stop words and stop phrases. Diacritics are
/// preserved so "não" and "nao" are distinct entries.
#[derive(Clone, Debug)]
pub struct OptOutScanner {
    keywords: Vec<&'static str>,
    phrases: Vec<&'static str>,
}

const STOP_KEYWORDS: &[&str] = &[
    "não",
    "nao",
    "pare",
    "parar",
    "sair",
    "cancelar",
    "descadastrar",
    "stop",
    "unsubscribe",
    "cancel",
];

const STOP_PHRASES: &[&str] = &[
    "não quero",
    "nao quero",
    "não tenho interesse",
    "nao tenho interesse",
    "não me envie",
    "nao me envie",
    "me deixe em paz",
    "not interested",
    "do not contact",
    "leave me alone",
];

/// Connectives that signal the customer is explaining rather than issuing a
/// plain stop command; such messages go to the model-assisted layer when the
/// keyword scan stays silent.
const EXPLANATORY_CONNECTIVES: &[&str] =
    &["porque", "pois", "mas", "porém", "porem", "but", "because", "however"];

const MODEL_REVIEW_TOKEN_THRESHOLD: usize = 8;

impl OptOutScanner {
    pub fn new() -> Self {
        Self { keywords: STOP_KEYWORDS.to_vec(), phrases: STOP_PHRASES.to_vec() }
    }

    /// Returns the matched stop word/phrase, if any.
    pub fn matches(&self, text: &str) -> Option<String> {
        let tokens = tokenize(text);
        if tokens.is_empty() {
            return None;
        }

        for phrase in &self.phrases {
            let phrase_tokens = tokenize(phrase);
            if contains_token_sequence(&tokens, &phrase_tokens) {
                return Some((*phrase).to_string());
            }
        }

        for keyword in &self.keywords {
            if tokens.iter().any(|token| token == keyword) {
                return Some((*keyword).to_string());
            }
        }

        None
    }
}

impl Default for OptOutScanner {
    fn default() -> Self {
        Self::new()
    }
}

/// True for messages long enough, or explanatory enough, that a silent
/// keyword scan is not conclusive and the model-assisted layer should look.
pub fn warrants_model_review(text: &str) -> bool {
    let tokens = tokenize(text);
    if tokens.len() > MODEL_REVIEW_TOKEN_THRESHOLD {
        return true;
    }
    tokens.iter().any(|token| EXPLANATORY_CONNECTIVES.contains(&token.as_str()))
}

fn tokenize(text: &str) -> Vec<String> {
    let mut sanitized = String::with_capacity(text.len());
    for character in text.to_lowercase().chars() {
        if character.is_alphanumeric() {
            sanitized.push(character);
        } else {
            sanitized.push(' ');
        }
    }
    sanitized.split_whitespace().map(|token| token.to_string()).collect()
}

fn contains_token_sequence(tokens: &[String], sequence: &[String]) -> bool {
    if sequence.is_empty() || sequence.len() > tokens.len() {
        return false;
    }
    tokens.windows(sequence.len()).any(|window| window == sequence)
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};

    use crate::domain::abandonment::AbandonmentId;
    use crate::domain::conversation::Conversation;
    use crate::domain::user::{User, UserId};

    use super::{
        is_within_window, warrants_model_review, ComplianceGate, ComplianceRefusal, OptOutScanner,
    };

    fn conversation() -> Conversation {
        Conversation::new(AbandonmentId("ab-1".to_string()), UserId("usr-1".to_string()))
    }

    fn user() -> User {
        User::new("+5511999887766", None)
    }

    #[test]
    fn window_is_exclusive_at_exactly_twenty_four_hours() {
        let reference = Utc::now();
        let window = Duration::hours(24);

        assert!(is_within_window(reference + Duration::hours(23), reference, window));
        assert!(!is_within_window(reference + Duration::hours(24), reference, window));
        assert!(!is_within_window(reference + Duration::hours(25), reference, window));
    }

    #[test]
    fn window_reference_falls_back_to_creation_time() {
        let gate = ComplianceGate::new(24, 3);
        let convo = conversation();
        let sender = user();

        assert!(gate.allow_reply(&convo, &sender, convo.created_at + Duration::hours(1)).is_ok());
        assert_eq!(
            gate.allow_reply(&convo, &sender, convo.created_at + Duration::hours(24)),
            Err(ComplianceRefusal::WindowExpired)
        );
    }

    #[test]
    fn window_tracks_last_user_message_when_present() {
        let gate = ComplianceGate::new(24, 3);
        let mut convo = conversation();
        let sender = user();

        let spoke_at = convo.created_at + Duration::hours(30);
        convo.last_user_message_at = Some(spoke_at);

        assert!(gate.allow_reply(&convo, &sender, spoke_at + Duration::hours(23)).is_ok());
        assert_eq!(
            gate.allow_reply(&convo, &sender, spoke_at + Duration::hours(24)),
            Err(ComplianceRefusal::WindowExpired)
        );
    }

    #[test]
    fn opted_out_users_are_refused_before_anything_else() {
        let gate = ComplianceGate::new(24, 3);
        let convo = conversation();
        let mut sender = user();
        sender.mark_opted_out("keyword:pare", Utc::now());

        assert_eq!(
            gate.allow_reply(&convo, &sender, convo.created_at),
            Err(ComplianceRefusal::OptedOut)
        );
        assert_eq!(
            gate.allow_proactive(&convo, &sender, convo.created_at),
            Err(ComplianceRefusal::OptedOut)
        );
    }

    #[test]
    fn cycle_budget_only_limits_proactive_sends() {
        let gate = ComplianceGate::new(24, 3);
        let mut convo = conversation();
        convo.cycle_count = 3;
        let sender = user();
        let now = convo.created_at + Duration::minutes(5);

        assert!(gate.allow_reply(&convo, &sender, now).is_ok());
        assert_eq!(
            gate.allow_proactive(&convo, &sender, now),
            Err(ComplianceRefusal::CyclesExhausted)
        );
    }

    #[test]
    fn scanner_matches_whole_words_case_insensitively() {
        let scanner = OptOutScanner::new();

        assert_eq!(scanner.matches("PARE"), Some("pare".to_string()));
        assert_eq!(scanner.matches("pode Cancelar tudo"), Some("cancelar".to_string()));
        assert!(scanner.matches("o cancelamento foi feito").is_none());
    }

    #[test]
    fn nao_matches_inside_nao_quero_but_not_inside_longer_words() {
        let scanner = OptOutScanner::new();

        // phrase layer wins for the canonical refusal
        assert_eq!(scanner.matches("não quero"), Some("não quero".to_string()));
        // "anão" contains the substring but not the whole word
        assert!(scanner.matches("sou anão e comprei ontem").is_none());
    }

    #[test]
    fn punctuation_does_not_hide_keywords() {
        let scanner = OptOutScanner::new();
        assert_eq!(scanner.matches("pare!!!"), Some("pare".to_string()));
        assert_eq!(scanner.matches("quero sair."), Some("sair".to_string()));
    }

    #[test]
    fn stop_phrases_match_across_languages() {
        let scanner = OptOutScanner::new();
        assert_eq!(
            scanner.matches("i am NOT interested, thanks"),
            Some("not interested".to_string())
        );
        assert_eq!(
            scanner.matches("nao tenho interesse nesse produto"),
            Some("nao tenho interesse".to_string())
        );
    }

    #[test]
    fn model_review_triggers_on_length_or_connectives() {
        assert!(!warrants_model_review("quero sim"));
        assert!(warrants_model_review("gostei do produto mas achei caro demais"));
        assert!(warrants_model_review(
            "oi, tudo bem? eu vi a oferta de voces ontem a noite e fiquei pensando a respeito"
        ));
    }
}
