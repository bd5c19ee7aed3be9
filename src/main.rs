use anyhow::{bail, Context, Result};
use postpanda::config::{AppConfig, BatchConfig};
use postpanda::email_sender::{AuthMode, OAuthSelection, TransportContext};
use postpanda::oauth::{CredentialStore, ProviderCatalog};
use postpanda::service::{Collaborators, Mailer};
use postpanda::session::{ParsedSpreadsheet, SessionRegistry};
use postpanda::template::{ColumnMapping, EmailTemplate};
use std::fs;
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<()> {
    // --- Load .env file at the very beginning ---
    match dotenvy::dotenv() {
        Ok(path) => println!("Loaded .env file from: {:?}", path),
        Err(_) => println!("Note: .env file not found. Relying on config file and existing environment variables."),
    }
    env_logger::init();

    let command = std::env::args().nth(1).unwrap_or_else(|| "send".to_string());
    let config = AppConfig::load().context("Failed to load configuration")?;
    let batch = config
        .batch
        .clone()
        .context("No [batch] section found in the configuration")?;

    let sheet = read_recipients(&batch)?;
    let template = EmailTemplate::load(&batch.template_path)?;
    let mapping = ColumnMapping::new(&batch.email_column, &batch.variables)?;

    let credentials = Arc::new(CredentialStore::new());
    let client_id = config.oauth.client_id.clone();
    if let Some(token) = &config.oauth.token {
        credentials.store(&client_id, token.provider, token.to_token(&client_id));
    }

    let mailer = Mailer::new(
        Arc::new(SessionRegistry::new()),
        credentials,
        ProviderCatalog::from_config(&config.oauth),
        Collaborators::system(&config.oauth)?,
    );
    let session = mailer.create_session(sheet)?;
    println!(
        "Loaded {} recipients with columns {:?}",
        session.total_rows, session.columns
    );

    let context = TransportContext {
        smtp: config.smtp.as_ref().map(|smtp| smtp.settings()),
        oauth: oauth_selection(&config, &batch),
        mail_app: config.mail_app.provider,
    };

    match command.as_str() {
        "preview" => {
            for index in 0..session.total_rows {
                let preview = mailer.preview(&session.session_id, index as i64, &template, &mapping)?;
                let marker = if preview.recipient_valid { "" } else { " (invalid)" };
                println!(
                    "--- {}/{} to {}{}",
                    preview.index + 1,
                    preview.total_rows,
                    preview.message.address,
                    marker
                );
                println!("Subject: {}\n\n{}\n", preview.message.subject_text, preview.message.body_text);
            }
        }
        "test" => {
            let result = mailer
                .send_test(&session.session_id, 0, &template, &mapping, batch.auth_mode, &context)
                .await?;
            println!("Test send: {}", serde_json::to_string(&result)?);
        }
        "send" => {
            let report = mailer
                .send_all(&session.session_id, &template, &mapping, batch.auth_mode, &context)
                .await?;
            println!("Done: {}", report);
            println!("{}", serde_json::to_string_pretty(&report.outcomes)?);
        }
        other => bail!("Unknown command '{}'. Use preview, test or send.", other),
    }

    Ok(())
}

fn read_recipients(batch: &BatchConfig) -> Result<ParsedSpreadsheet> {
    let raw = fs::read_to_string(&batch.recipients_path)
        .with_context(|| format!("Failed to read recipients file {:?}", batch.recipients_path))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("Recipients file {:?} is not valid JSON", batch.recipients_path))
}

fn oauth_selection(config: &AppConfig, batch: &BatchConfig) -> Option<OAuthSelection> {
    if batch.auth_mode != AuthMode::OAuth {
        return None;
    }
    let provider = batch
        .oauth_provider
        .or_else(|| config.oauth.token.as_ref().map(|token| token.provider))?;
    Some(OAuthSelection {
        client_id: config.oauth.client_id.clone(),
        provider,
    })
}
