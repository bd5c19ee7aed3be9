use super::{EmailError, MailAppKind, MailAppLauncher};
use crate::template::RenderedMessage;
use log::info;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use std::process::Command;

// Characters left readable in the address part of a mailto: URL.
const ADDRESS: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'@')
    .remove(b'.')
    .remove(b'_')
    .remove(b'-')
    .remove(b'+');
const COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

const OUTLOOK_SCRIPT: &str = r#"
on run argv
  set msgSubject to item 1 of argv
  set msgRecipient to item 2 of argv
  set msgHtml to item 3 of argv

  tell application "Microsoft Outlook"
    activate
    set newMessage to make new outgoing message with properties {subject:msgSubject, content:msgHtml}
    make new recipient at newMessage with properties {email address:{address:msgRecipient}}
    open newMessage
  end tell
end run
"#;

pub fn mailto_url(to: &str, subject: &str, body: &str) -> String {
    format!(
        "mailto:{}?subject={}&body={}",
        utf8_percent_encode(to.trim(), ADDRESS),
        utf8_percent_encode(subject, COMPONENT),
        utf8_percent_encode(body, COMPONENT)
    )
}

/// Opens drafts in the desktop's mail program. Nothing is transmitted.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemMailApp;

impl SystemMailApp {
    fn open_default(to: &str, message: &RenderedMessage) -> Result<(), EmailError> {
        let url = mailto_url(to, &message.subject_text, &message.body_plain);
        open::that(&url).map_err(|e| EmailError::MailApp(e.to_string()))
    }

    fn open_outlook(to: &str, message: &RenderedMessage) -> Result<(), EmailError> {
        if !cfg!(target_os = "macos") {
            return Err(EmailError::MailApp(
                "Outlook drafts via AppleScript are only available on macOS.".to_string(),
            ));
        }

        let html = format!("<html><body>{}</body></html>", message.body_html);
        let output = Command::new("osascript")
            .args(["-e", OUTLOOK_SCRIPT, message.subject_text.as_str(), to.trim(), html.as_str()])
            .output()
            .map_err(|e| EmailError::MailApp(format!("osascript could not be started: {}", e)))?;

        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let detail = if stderr.contains("Not authorized") {
            "Please allow Automation permission for Microsoft Outlook in macOS.".to_string()
        } else if stderr.is_empty() {
            "Unknown error".to_string()
        } else {
            stderr
        };
        Err(EmailError::MailApp(format!("Could not create Outlook draft: {}", detail)))
    }
}

impl MailAppLauncher for SystemMailApp {
    fn open_draft(&self, app: MailAppKind, to: &str, message: &RenderedMessage) -> Result<(), EmailError> {
        match app {
            MailAppKind::Outlook => Self::open_outlook(to, message)?,
            MailAppKind::Gmail | MailAppKind::Custom => Self::open_default(to, message)?,
        }
        info!("Opened draft for {} in {:?} mail app", to, app);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mailto_keeps_address_readable_and_encodes_the_rest() {
        assert_eq!(
            mailto_url(" ana+news@acme.io ", "Hi & bye", "Line 1\nLine 2"),
            "mailto:ana+news@acme.io?subject=Hi%20%26%20bye&body=Line%201%0ALine%202"
        );
    }

    #[test]
    fn mailto_encodes_unicode() {
        let url = mailto_url("a@b.io", "Grüße", "");
        assert!(url.ends_with("subject=Gr%C3%BC%C3%9Fe&body="));
    }
}
