//! Localized message text for SMS and email.

use std::collections::HashMap;
use std::sync::Arc;

pub const DEFAULT_LOCALE: &str = "en";

pub const SMS_OTP: &str = "sms.otp";
pub const EMAIL_OTP_SUBJECT: &str = "email.otp.subject";
pub const EMAIL_OTP_BODY: &str = "email.otp.body";
pub const EMAIL_MAGIC_LINK_SUBJECT: &str = "email.magic_link.subject";
pub const EMAIL_MAGIC_LINK_BODY: &str = "email.magic_link.body";
pub const EMAIL_RESET_SUBJECT: &str = "email.reset_password.subject";
pub const EMAIL_RESET_BODY: &str = "email.reset_password.body";
pub const EMAIL_INVITE_SUBJECT: &str = "email.invite.subject";
pub const EMAIL_INVITE_BODY: &str = "email.invite.body";

type Messages = HashMap<String, String>;

/// Replace `{name}` placeholders with `args`.
pub fn render(template: &str, args: &[(&str, &str)]) -> String {
    args.iter().fold(template.to_string(), |text, (name, value)| {
        text.replace(&format!("{{{}}}", name), value)
    })
}

/// Renders messages for one resolved locale.
#[derive(Clone)]
pub struct Printer {
    locale: String,
    messages: Arc<Messages>,
    fallback: Arc<Messages>,
}

impl Printer {
    pub fn locale(&self) -> &str {
        &self.locale
    }

    pub fn print(&self, key: &str, args: &[(&str, &str)]) -> String {
        let template = self
            .messages
            .get(key)
            .or_else(|| self.fallback.get(key))
            .map(String::as_str)
            .unwrap_or(key);
        render(template, args)
    }
}

pub trait MessageCatalog: Send + Sync {
    /// Printer for `locale`, falling back to the default locale.
    fn printer_for_locale(&self, locale: &str) -> Printer;

    /// Render in the default locale.
    fn sd(&self, key: &str, args: &[(&str, &str)]) -> String {
        self.printer_for_locale(DEFAULT_LOCALE).print(key, args)
    }

    /// Render in the first supported locale from `locales`.
    fn sl(&self, locales: &[&str], key: &str, args: &[(&str, &str)]) -> String;
}

/// In-process catalog with built-in English and Spanish text.
pub struct BuiltinCatalog {
    locales: HashMap<String, Arc<Messages>>,
}

impl Default for BuiltinCatalog {
    fn default() -> Self {
        let mut locales = HashMap::new();
        locales.insert("en".to_string(), Arc::new(messages(EN)));
        locales.insert("es".to_string(), Arc::new(messages(ES)));
        Self { locales }
    }
}

fn messages(entries: &[(&str, &str)]) -> Messages {
    entries
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// `en-AU` and `en_AU` both resolve to `en`.
fn base_language(locale: &str) -> String {
    locale
        .split(['-', '_'])
        .next()
        .unwrap_or("")
        .to_ascii_lowercase()
}

impl BuiltinCatalog {
    fn find(&self, locale: &str) -> Option<(&str, &Arc<Messages>)> {
        let lang = base_language(locale);
        self.locales
            .get_key_value(lang.as_str())
            .map(|(k, v)| (k.as_str(), v))
    }

    fn default_messages(&self) -> Arc<Messages> {
        self.locales
            .get(DEFAULT_LOCALE)
            .cloned()
            .unwrap_or_default()
    }
}

impl MessageCatalog for BuiltinCatalog {
    fn printer_for_locale(&self, locale: &str) -> Printer {
        let fallback = self.default_messages();
        match self.find(locale) {
            Some((resolved, messages)) => Printer {
                locale: resolved.to_string(),
                messages: messages.clone(),
                fallback,
            },
            None => Printer {
                locale: DEFAULT_LOCALE.to_string(),
                messages: fallback.clone(),
                fallback,
            },
        }
    }

    fn sl(&self, locales: &[&str], key: &str, args: &[(&str, &str)]) -> String {
        let locale = locales
            .iter()
            .find(|l| !l.is_empty() && self.find(l).is_some())
            .copied()
            .unwrap_or(DEFAULT_LOCALE);
        self.printer_for_locale(locale).print(key, args)
    }
}

const EN: &[(&str, &str)] = &[
    (SMS_OTP, "Your {app} code is {code}. It expires in {minutes} minutes."),
    (EMAIL_OTP_SUBJECT, "Your {app} sign-in code"),
    (
        EMAIL_OTP_BODY,
        "Hi {name},\n\nYour sign-in code is {code}. It expires in {minutes} minutes.",
    ),
    (EMAIL_MAGIC_LINK_SUBJECT, "Sign in to {app}"),
    (
        EMAIL_MAGIC_LINK_BODY,
        "Hi {name},\n\nUse this link to sign in: {link}\n\nThe link expires in {minutes} minutes.",
    ),
    (EMAIL_RESET_SUBJECT, "Reset your {app} password"),
    (
        EMAIL_RESET_BODY,
        "Hi {name},\n\nReset your password here: {link}\n\n\
         If you did not ask for this, ignore this email.",
    ),
    (EMAIL_INVITE_SUBJECT, "{inviter} invited you to {tenant}"),
    (
        EMAIL_INVITE_BODY,
        "{inviter} invited you to join {tenant} on {app}.\n\nAccept the invitation: {link}",
    ),
];

const ES: &[(&str, &str)] = &[
    (SMS_OTP, "Tu código de {app} es {code}. Caduca en {minutes} minutos."),
    (EMAIL_OTP_SUBJECT, "Tu código de acceso a {app}"),
    (
        EMAIL_OTP_BODY,
        "Hola {name},\n\nTu código de acceso es {code}. Caduca en {minutes} minutos.",
    ),
    (EMAIL_RESET_SUBJECT, "Restablece tu contraseña de {app}"),
];
