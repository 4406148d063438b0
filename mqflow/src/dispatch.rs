use async_trait::async_trait;

use crate::error::Result;
use crate::types::{ClientId, Publish, PublishAckReason};

/// Downstream processing of inbound publishes.
///
/// The returned reason code goes into the PUBACK or PUBREC of a QoS 1/2 flow. An error
/// is answered with `ImplementationSpecificError`.
#[async_trait]
pub trait Dispatcher: Sync + Send {
    async fn dispatch(&self, from: &ClientId, publish: Publish) -> Result<PublishAckReason>;
}

/// Routing is not part of this crate; messages are only logged.
pub struct DefaultDispatcher;

#[async_trait]
impl Dispatcher for DefaultDispatcher {
    async fn dispatch(&self, from: &ClientId, publish: Publish) -> Result<PublishAckReason> {
        log::debug!("{} dispatch {:?}, no subscribers", from, publish);
        Ok(PublishAckReason::NoMatchingSubscribers)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use parking_lot::Mutex;

    use super::*;

    #[derive(Default)]
    pub(crate) struct RecordingDispatcher {
        pub(crate) received: Mutex<Vec<(ClientId, Publish)>>,
    }

    #[async_trait]
    impl Dispatcher for RecordingDispatcher {
        async fn dispatch(&self, from: &ClientId, publish: Publish) -> Result<PublishAckReason> {
            self.received.lock().push((from.clone(), publish));
            Ok(PublishAckReason::Success)
        }
    }

    #[tokio::test]
    async fn default_dispatcher_reports_no_subscribers() {
        let p = Publish::new("a/b", crate::types::QoS::AtLeastOnce, bytes::Bytes::from_static(b"x"));
        let reason = DefaultDispatcher.dispatch(&ClientId::from("c"), p).await.unwrap();
        assert_eq!(reason, PublishAckReason::NoMatchingSubscribers);
    }
}
