use anyhow::Result;
use async_trait::async_trait;
use tracing::info;

use crate::message::Message;
use crate::pipeline::{Context, Handler};

/// Logs every message and passes it on.
#[derive(Debug, Default)]
pub struct PrintHandler;

#[async_trait]
impl Handler for PrintHandler {
    fn name(&self) -> &str {
        "print"
    }

    async fn on_message(&mut self, ctx: &Context, msg: Message) -> Result<Option<Message>> {
        info!(
            benchmark = %ctx.benchmark().identifier(),
            source = ?msg.source(),
            routing_key = msg.routing_key().unwrap_or(""),
            payload = ?msg.payload(),
            "message"
        );
        Ok(Some(msg))
    }
}
