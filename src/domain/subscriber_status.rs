/// Welcome-email delivery status of a subscriber.
///
/// ```text
/// pending -> queued -> sent
/// pending -> pending_retry -> queued
/// queued -> failed -> queued
/// failed | pending_retry -> sent
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriberStatus {
    Pending,
    Queued,
    Sent,
    Failed,
    PendingRetry,
}

impl SubscriberStatus {
    pub fn is_sent(&self) -> bool {
        matches!(self, SubscriberStatus::Sent)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, SubscriberStatus::Failed)
    }

    /// Statuses a subscriber may be in for a transition into `self` to apply.
    /// `Pending` has none: it is only ever the status a record is created with.
    pub fn allowed_predecessors(&self) -> &'static [SubscriberStatus] {
        use SubscriberStatus::*;

        match self {
            Pending => &[],
            Queued => &[Pending, PendingRetry, Failed],
            PendingRetry => &[Pending],
            // A delivered email is recorded whatever the subscriber was moved
            // to meanwhile. sent -> sent keeps a re-delivered job's update a no-op.
            Sent => &[Queued, Failed, PendingRetry, Sent],
            Failed => &[Queued],
        }
    }

    pub fn can_transition_to(&self, next: SubscriberStatus) -> bool {
        next.allowed_predecessors().contains(self)
    }

    pub fn parse(status: String) -> Result<SubscriberStatus, String> {
        match status.as_str() {
            "pending" => Ok(SubscriberStatus::Pending),
            "queued" => Ok(SubscriberStatus::Queued),
            "sent" => Ok(SubscriberStatus::Sent),
            "failed" => Ok(SubscriberStatus::Failed),
            "pending_retry" => Ok(SubscriberStatus::PendingRetry),
            _ => Err(format!("{} is not a valid subscriber status", status)),
        }
    }
}

impl AsRef<str> for SubscriberStatus {
    fn as_ref(&self) -> &str {
        match self {
            SubscriberStatus::Pending => "pending",
            SubscriberStatus::Queued => "queued",
            SubscriberStatus::Sent => "sent",
            SubscriberStatus::Failed => "failed",
            SubscriberStatus::PendingRetry => "pending_retry",
        }
    }
}
