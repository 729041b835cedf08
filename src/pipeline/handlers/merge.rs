use std::collections::BTreeMap;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tracing::trace;

use crate::message::{Message, Payload, Record, Source};
use crate::monitor::{MonitorKind, WALL_CYCLE};
use crate::pipeline::{Context, Handler};

/// Provenance name of merged messages.
pub const MERGER_NAME: &str = "merger";

/// Monitor variants correlated into one row.
const TRACKED: [MonitorKind; 3] = [
    MonitorKind::Perf,
    MonitorKind::CycleCounter,
    MonitorKind::ResCtrl,
];

/// Correlates perf, cycle counter and resctrl samples into one routable row
/// per sampling period.
///
/// Each tracked variant has one slot. A newer message overwrites an
/// unconsumed older one from the same variant, so a fast monitor lapping a
/// slow one loses its older samples. Nothing is emitted until every slot is
/// filled; then all slots are cleared together.
#[derive(Debug)]
pub struct Merger {
    slots: BTreeMap<MonitorKind, Option<Message>>,
}

impl Merger {
    pub fn new() -> Self {
        Self {
            slots: TRACKED.iter().map(|&kind| (kind, None)).collect(),
        }
    }

    fn is_full(&self) -> bool {
        self.slots.values().all(Option::is_some)
    }

    fn take(&mut self, kind: MonitorKind) -> Result<Message> {
        self.slots
            .get_mut(&kind)
            .and_then(Option::take)
            .ok_or_else(|| anyhow!("merge slot {kind} empty"))
    }

    /// Empty every slot and build the merged message from their contents.
    fn merge(&mut self) -> Result<Message> {
        let perf = self.take(MonitorKind::Perf)?;
        let cycles = self.take(MonitorKind::CycleCounter)?;
        let resctrl = self.take(MonitorKind::ResCtrl)?;

        let routing_key = perf
            .benchmark()
            .map(|bench| bench.group_name())
            .ok_or_else(|| anyhow!("perf sample outlived its benchmark"))?;

        let mut merged = perf
            .payload()
            .as_record()
            .cloned()
            .ok_or_else(|| anyhow!("perf payload is not a record"))?;

        let wall_cycle = cycles
            .payload()
            .as_record()
            .and_then(|r| r.get(WALL_CYCLE))
            .ok_or_else(|| anyhow!("cycle counter sample has no {WALL_CYCLE}"))?;
        merged.insert(WALL_CYCLE, wall_cycle.clone());

        let sockets = resctrl
            .payload()
            .as_per_socket()
            .ok_or_else(|| anyhow!("resctrl payload is not per socket"))?;
        for (key, value) in sum_sockets(sockets)?.iter() {
            merged.insert(key, value.clone());
        }

        Ok(Message::routable(
            Source::Handler(MERGER_NAME.to_string()),
            Payload::Record(merged),
            routing_key,
        ))
    }
}

impl Default for Merger {
    fn default() -> Self {
        Self::new()
    }
}

/// Sum every key of socket 0 across all sockets.
fn sum_sockets(sockets: &[Record]) -> Result<Record> {
    let Some((first, rest)) = sockets.split_first() else {
        return Ok(Record::new());
    };

    let mut totals = first.clone();
    for socket in rest {
        for key in first.keys() {
            let add = socket
                .get(key)
                .ok_or_else(|| anyhow!("socket is missing {key}"))?;
            let sum = totals
                .get(key)
                .and_then(|acc| acc.checked_add(add))
                .ok_or_else(|| anyhow!("{key} is not numeric"))?;
            totals.insert(key, sum);
        }
    }

    Ok(totals)
}

#[async_trait]
impl Handler for Merger {
    fn name(&self) -> &str {
        MERGER_NAME
    }

    async fn on_message(&mut self, _ctx: &Context, msg: Message) -> Result<Option<Message>> {
        let Some(kind) = msg.monitor_kind().filter(|k| TRACKED.contains(k)) else {
            return Ok(Some(msg));
        };

        self.slots.insert(kind, Some(msg));

        if !self.is_full() {
            trace!(monitor = %kind, "merge pending");
            return Ok(None);
        }

        self.merge().map(Some)
    }

    async fn on_destroy(&mut self, _ctx: &Context) -> Result<()> {
        self.slots.values_mut().for_each(|slot| *slot = None);
        Ok(())
    }
}
