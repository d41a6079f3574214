//! Two-layer opt-out detection.
//!
//! Layer one is the deterministic keyword scan from
//! `winback_core::compliance`; it settles the overwhelming majority of
//! messages for free. Layer two asks the model, but only for messages the
//! scan left open and that are long or explanatory enough to hide a refusal
//! ("pode parar de mandar mensagem porque eu já comprei em outra loja").
//!
//! Detection fails open: any error in the model layer counts as "not opted
//! out". Silencing a customer who never asked for it is the one mistake this
//! module must not make.

use std::sync::Arc;

use tracing::{debug, warn};

use winback_core::compliance::{warrants_model_review, OptOutScanner};

use crate::interpreter::Interpreter;

/// Reason string stored on the user when the model layer fired.
pub const MODEL_REVIEW_REASON: &str = "model_review";

pub struct OptOutDetector {
    scanner: OptOutScanner,
    interpreter: Arc<dyn Interpreter>,
}

impl OptOutDetector {
    pub fn new(interpreter: Arc<dyn Interpreter>) -> Self {
        Self { scanner: OptOutScanner::new(), interpreter }
    }

    /// Returns the opt-out reason when `text` asks us to stop, `None`
    /// otherwise.
    pub async fn detect(&self, text: &str) -> Option<String> {
        if let Some(matched) = self.scanner.matches(text) {
            debug!(
                event_name = "optout.keyword_match",
                keyword = %matched,
                "keyword scan detected an opt-out"
            );
            return Some(format!("keyword:{matched}"));
        }

        if !warrants_model_review(text) {
            return None;
        }

        match self.interpreter.review_opt_out(text).await {
            Ok(true) => {
                debug!(event_name = "optout.model_match", "model review detected an opt-out");
                Some(MODEL_REVIEW_REASON.to_string())
            }
            Ok(false) => None,
            Err(error) => {
                warn!(
                    event_name = "optout.review_failed",
                    error = %error,
                    "opt-out review failed, treating as not opted out"
                );
                None
            }
        }
    }
}
