use serde::Deserialize;

use crate::domain::subscriber_email::SubscriberEmail;
use crate::domain::subscriber_name::SubscriberName;

pub struct NewSubscriber {
    pub email: SubscriberEmail,
    pub name: SubscriberName,
    pub metadata: SubscriptionMetadata,
}

#[derive(Deserialize)]
pub struct NewSubscriberBody {
    pub name: String,
    pub email: String,
}

/// Request details kept for auditing only.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionMetadata {
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

impl NewSubscriber {
    pub fn parse(
        name: String,
        email: String,
        metadata: SubscriptionMetadata,
    ) -> Result<Self, String> {
        let name = SubscriberName::parse(name)?;
        let email = SubscriberEmail::parse(email)?;

        Ok(NewSubscriber {
            email,
            name,
            metadata,
        })
    }
}
