use std::collections::BTreeMap;

use tera::{Context, Tera};
use thiserror::Error;
use winback_core::OutboundContent;

pub const OPENING_TEMPLATE: &str = "abandoned_cart_opening";

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("template `{0}` is not registered")]
    Unknown(String),
    #[error("template `{name}` failed to render: {reason}")]
    Render { name: String, reason: String },
    #[error("embedded templates failed to load: {0}")]
    Load(String),
}

/// Renders named outbound templates into plain message text. Templates are
/// embedded at compile time from `templates/messages/`.
pub struct TemplateEngine {
    tera: Tera,
}

impl TemplateEngine {
    pub fn new() -> Result<Self, TemplateError> {
        let mut tera = Tera::default();
        tera.add_raw_template(
            OPENING_TEMPLATE,
            include_str!("../../../templates/messages/abandoned_cart_opening.txt.tera"),
        )
        .map_err(|error| TemplateError::Load(error.to_string()))?;
        Ok(Self { tera })
    }

    pub fn render(
        &self,
        name: &str,
        params: &BTreeMap<String, String>,
    ) -> Result<String, TemplateError> {
        if !self.tera.get_template_names().any(|registered| registered == name) {
            return Err(TemplateError::Unknown(name.to_string()));
        }
        let mut context = Context::new();
        for (key, value) in params {
            context.insert(key, value);
        }
        let rendered = self.tera.render(name, &context).map_err(|error| {
            TemplateError::Render { name: name.to_string(), reason: error.to_string() }
        })?;
        Ok(rendered.trim().to_string())
    }

    /// Resolve a job's content to the text that goes over the wire.
    pub fn render_content(&self, content: &OutboundContent) -> Result<String, TemplateError> {
        match content {
            OutboundContent::Text { text } => Ok(text.clone()),
            OutboundContent::Template { name, params } => self.render(name, params),
        }
    }
}
