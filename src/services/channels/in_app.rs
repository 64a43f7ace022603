use async_trait::async_trait;

use super::{ChannelAdapter, Outcome};
use crate::db::models::Channel;
use crate::services::request::{Content, Destination};

/// The delivery record is the in-app inbox entry, so there is nothing to call.
#[derive(Debug, Clone, Copy, Default)]
pub struct InAppAdapter;

#[async_trait]
impl ChannelAdapter for InAppAdapter {
    fn channel(&self) -> Channel {
        Channel::InApp
    }

    fn is_enabled(&self) -> bool {
        true
    }

    async fn send(&self, _destination: &Destination, content: &Content) -> Outcome {
        tracing::debug!("In-app notification {} stored in inbox", content.record_id);
        Outcome::success()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::Priority;

    #[tokio::test]
    async fn always_succeeds() {
        let content = Content {
            record_id: "r1".to_string(),
            title: "t".to_string(),
            body: "b".to_string(),
            priority: Priority::Low,
        };
        let outcome = InAppAdapter.send(&Destination::InApp, &content).await;
        assert!(outcome.succeeded);
    }
}
