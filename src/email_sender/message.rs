use super::EmailError;
use crate::template::RenderedMessage;
use lettre::message::{Mailbox, MultiPart};
use lettre::Message;

/// Builds a multipart/alternative (plain + HTML) message.
pub fn build_message(from: &str, to: &str, rendered: &RenderedMessage) -> Result<Message, EmailError> {
    let email = Message::builder()
        .from(from.trim().parse::<Mailbox>()?) // Handles AddressError via From
        .to(to.trim().parse::<Mailbox>()?)
        .subject(rendered.subject_text.as_str())
        .multipart(MultiPart::alternative_plain_html(
            rendered.body_plain.clone(),
            rendered.body_html.clone(),
        ))?; // Handles LettreError via From
    Ok(email)
}
