use async_trait::async_trait;
use lettre::{
    message::{header::ContentType, MultiPart, SinglePart},
    transport::smtp::authentication::Credentials,
    Message, SmtpTransport, Transport,
};
use serde_json::{Map, Value};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::error::NotificationError;
use super::messages::{self, MessageCatalog};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmailTemplate {
    LoginCode,
    MagicLink,
    ResetPassword,
    Invite,
}

impl EmailTemplate {
    pub fn name(&self) -> &'static str {
        match self {
            EmailTemplate::LoginCode => "login_code",
            EmailTemplate::MagicLink => "magic_link",
            EmailTemplate::ResetPassword => "reset_password",
            EmailTemplate::Invite => "invite",
        }
    }

    fn message_keys(&self) -> (&'static str, &'static str) {
        match self {
            EmailTemplate::LoginCode => (messages::EMAIL_OTP_SUBJECT, messages::EMAIL_OTP_BODY),
            EmailTemplate::MagicLink => (
                messages::EMAIL_MAGIC_LINK_SUBJECT,
                messages::EMAIL_MAGIC_LINK_BODY,
            ),
            EmailTemplate::ResetPassword => {
                (messages::EMAIL_RESET_SUBJECT, messages::EMAIL_RESET_BODY)
            }
            EmailTemplate::Invite => (messages::EMAIL_INVITE_SUBJECT, messages::EMAIL_INVITE_BODY),
        }
    }
}

#[async_trait]
pub trait EmailProvider: Send + Sync {
    /// `data` fills template placeholders; its `locale` entry selects the
    /// language. `app_subfolder` selects app-specific templates.
    async fn send_user_email(
        &self,
        template: EmailTemplate,
        app_subfolder: Option<&str>,
        recipient: &str,
        data: &Map<String, Value>,
    ) -> Result<(), NotificationError>;
}

#[derive(Clone, Default)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub from: String,
    /// Root of `<subfolder>/<template>.html` overrides.
    pub templates_dir: Option<PathBuf>,
}

impl std::fmt::Debug for SmtpConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmtpConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("from", &self.from)
            .field("templates_dir", &self.templates_dir)
            .finish_non_exhaustive()
    }
}

pub struct SmtpEmailService {
    mailer: SmtpTransport,
    from_email: String,
    templates_dir: Option<PathBuf>,
    catalog: Arc<dyn MessageCatalog>,
}

impl SmtpEmailService {
    pub fn new(
        config: &SmtpConfig,
        catalog: Arc<dyn MessageCatalog>,
    ) -> Result<Self, NotificationError> {
        let creds = Credentials::new(config.username.clone(), config.password.clone());

        let mailer = SmtpTransport::starttls_relay(&config.host)
            .map_err(|e| NotificationError::Email(e.to_string()))?
            .credentials(creds)
            .port(config.port)
            .timeout(Some(Duration::from_secs(10)))
            .build();

        tracing::info!(
            host = %config.host,
            port = config.port,
            "Email service initialized with SMTP"
        );

        Ok(Self {
            mailer,
            from_email: config.from.clone(),
            templates_dir: config.templates_dir.clone(),
            catalog,
        })
    }

    async fn app_template(
        &self,
        subfolder: Option<&str>,
        template: EmailTemplate,
    ) -> Option<String> {
        let path = self
            .templates_dir
            .as_ref()?
            .join(subfolder?)
            .join(format!("{}.html", template.name()));
        tokio::fs::read_to_string(&path).await.ok()
    }

    async fn send_email(
        &self,
        to_email: &str,
        subject: &str,
        plain_body: &str,
        html_body: &str,
    ) -> Result<(), NotificationError> {
        let address_error =
            |e: lettre::address::AddressError| NotificationError::Email(e.to_string());
        let email = Message::builder()
            .from(self.from_email.parse().map_err(address_error)?)
            .to(to_email.parse().map_err(address_error)?)
            .subject(subject)
            .multipart(
                MultiPart::alternative()
                    .singlepart(
                        SinglePart::builder()
                            .header(ContentType::TEXT_PLAIN)
                            .body(plain_body.to_string()),
                    )
                    .singlepart(
                        SinglePart::builder()
                            .header(ContentType::TEXT_HTML)
                            .body(html_body.to_string()),
                    ),
            )
            .map_err(|e| NotificationError::Email(e.to_string()))?;

        // SMTP transport is blocking.
        let mailer = self.mailer.clone();
        let result = tokio::task::spawn_blocking(move || mailer.send(&email))
            .await
            .map_err(|e| NotificationError::Email(e.to_string()))?;

        match result {
            Ok(_) => {
                tracing::info!(to = %to_email, subject = %subject, "Email sent successfully");
                Ok(())
            }
            Err(e) => {
                tracing::error!(error = %e, to = %to_email, "Failed to send email");
                Err(NotificationError::Email(e.to_string()))
            }
        }
    }
}

/// Placeholder arguments from template data. Non-string values are rendered
/// as JSON.
fn template_args(data: &Map<String, Value>) -> Vec<(&str, String)> {
    data.iter()
        .map(|(k, v)| {
            let text = match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            (k.as_str(), text)
        })
        .collect()
}

#[async_trait]
impl EmailProvider for SmtpEmailService {
    async fn send_user_email(
        &self,
        template: EmailTemplate,
        app_subfolder: Option<&str>,
        recipient: &str,
        data: &Map<String, Value>,
    ) -> Result<(), NotificationError> {
        let owned = template_args(data);
        let args: Vec<(&str, &str)> = owned.iter().map(|(k, v)| (*k, v.as_str())).collect();
        let locale = data.get("locale").and_then(Value::as_str).unwrap_or("");

        let printer = self.catalog.printer_for_locale(locale);
        let (subject_key, body_key) = template.message_keys();
        let subject = printer.print(subject_key, &args);
        let plain_body = printer.print(body_key, &args);
        let html_body = match self.app_template(app_subfolder, template).await {
            Some(html) => messages::render(&html, &args),
            None => format!("<html><body><pre>{}</pre></body></html>", plain_body),
        };

        self.send_email(recipient, &subject, &plain_body, &html_body)
            .await
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SentEmail {
    pub template: EmailTemplate,
    pub app_subfolder: Option<String>,
    pub recipient: String,
    pub data: Map<String, Value>,
}

/// Records emails instead of sending them.
#[derive(Default)]
pub struct MockEmailService {
    sent: Mutex<Vec<SentEmail>>,
}

impl MockEmailService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<SentEmail> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl EmailProvider for MockEmailService {
    async fn send_user_email(
        &self,
        template: EmailTemplate,
        app_subfolder: Option<&str>,
        recipient: &str,
        data: &Map<String, Value>,
    ) -> Result<(), NotificationError> {
        self.sent
            .lock()
            .map_err(|e| NotificationError::Email(format!("Mock email mutex poisoned: {}", e)))?
            .push(SentEmail {
                template,
                app_subfolder: app_subfolder.map(str::to_string),
                recipient: recipient.to_string(),
                data: data.clone(),
            });
        Ok(())
    }
}
