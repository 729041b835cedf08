use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tracing::trace;

use crate::message::Message;
use crate::pipeline::{Context, Handler};
use crate::sink::{OutboundRecord, RecordSink};

/// Publishes routable messages to a sink and passes every message on.
pub struct QueueForwarder {
    sink: Arc<dyn RecordSink>,
}

impl QueueForwarder {
    pub fn new(sink: Arc<dyn RecordSink>) -> Self {
        Self { sink }
    }
}

#[async_trait]
impl Handler for QueueForwarder {
    fn name(&self) -> &str {
        "queue_forwarder"
    }

    async fn on_message(&mut self, _ctx: &Context, msg: Message) -> Result<Option<Message>> {
        if let Some(record) = OutboundRecord::from_message(&msg) {
            trace!(sink = self.sink.name(), routing_key = %record.routing_key, "publishing");
            self.sink.publish(record).await?;
        }
        Ok(Some(msg))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Payload, Record, Source, Value};
    use crate::monitor::MonitorKind;
    use crate::pipeline::tests::context_for;
    use crate::pipeline::Pipeline;
    use crate::sink::ChannelSink;

    #[tokio::test]
    async fn test_forwards_only_routable() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ctx = context_for(Arc::new(Pipeline::empty()), dir.path());
        let (sink, mut rx) = ChannelSink::new(8);
        let mut handler = QueueForwarder::new(Arc::new(sink));

        let record: Record = [("a", Value::Int(1))].into_iter().collect();
        let raw = Message::monitored(
            Source::Monitor(MonitorKind::Perf),
            Payload::Record(record.clone()),
        );
        let routable = Message::routable(
            Source::Handler("merger".to_string()),
            Payload::Record(record),
            "bench",
        );

        assert!(handler.on_message(&ctx, raw).await.expect("raw").is_some());
        assert!(handler
            .on_message(&ctx, routable)
            .await
            .expect("routable")
            .is_some());

        let published = rx.try_recv().expect("one record");
        assert_eq!(published.routing_key, "bench");
        assert!(rx.try_recv().is_err());
    }
}
