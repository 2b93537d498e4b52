use async_trait::async_trait;

use crate::domain::delivery_job::WelcomePayload;
use crate::domain::subscriber_email::SubscriberEmail;
use crate::email_client::EmailClient;

/// Who a welcome email goes to.
#[derive(Debug, Clone)]
pub struct Recipient {
    pub name: String,
    pub email: SubscriberEmail,
}

impl TryFrom<&WelcomePayload> for Recipient {
    type Error = DispatchError;

    fn try_from(payload: &WelcomePayload) -> Result<Self, Self::Error> {
        let email =
            SubscriberEmail::parse(payload.email.clone()).map_err(DispatchError::InvalidRecipient)?;

        Ok(Self {
            name: payload.name.clone(),
            email,
        })
    }
}

#[derive(thiserror::Error, Debug)]
pub enum DispatchError {
    #[error("The recipient is not valid: {0}")]
    InvalidRecipient(String),
    #[error("The mail API request failed: {0}")]
    Transport(#[from] reqwest::Error),
}

/// Delivers a single welcome email. Implementations never retry; retries are
/// driven by the queue.
#[async_trait]
pub trait EmailDispatcher: Send + Sync {
    async fn send_welcome(&self, recipient: &Recipient) -> Result<(), DispatchError>;
}

#[derive(Debug, PartialEq, Eq)]
pub struct WelcomeEmail {
    pub subject: String,
    pub text: String,
    pub html: String,
}

impl WelcomeEmail {
    pub const SUBJECT: &'static str = "Welcome to Our Newsletter!";

    pub fn render(name: &str) -> Self {
        let text = format!(
            "Hello {name},\n\n\
             Thank you for subscribing to our newsletter!\n\n\
             You'll receive our updates with the latest news and offers.\n\n\
             Best regards,\n\
             The Team"
        );
        let html = format!(
            "<!DOCTYPE html>\
             <html lang=\"en\">\
             <head><meta charset=\"UTF-8\"><title>Welcome to Our Newsletter</title></head>\
             <body>\
             <h1>Welcome to Our Newsletter!</h1>\
             <h2>Hello, {}!</h2>\
             <p>Thank you for subscribing to our newsletter.</p>\
             <p>You'll receive our updates with the latest news and offers.</p>\
             <p>If you have any questions, please contact our support team.</p>\
             </body>\
             </html>",
            htmlescape::encode_minimal(name)
        );

        Self {
            subject: Self::SUBJECT.to_string(),
            text,
            html,
        }
    }
}

pub struct WelcomeEmailDispatcher {
    email_client: EmailClient,
}

impl WelcomeEmailDispatcher {
    pub fn new(email_client: EmailClient) -> Self {
        Self { email_client }
    }
}

#[async_trait]
impl EmailDispatcher for WelcomeEmailDispatcher {
    #[tracing::instrument(
        name = "Send a welcome email",
        skip(self, recipient),
        fields(recipient_email = %recipient.email)
    )]
    async fn send_welcome(&self, recipient: &Recipient) -> Result<(), DispatchError> {
        let email = WelcomeEmail::render(&recipient.name);

        self.email_client
            .send_email(&recipient.email, &email.subject, &email.html, &email.text)
            .await?;

        Ok(())
    }
}
