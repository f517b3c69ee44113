// Outbound event fan-out. The consensus code never publishes directly;
// events leave through the effect executor only.

use log::{debug, error, info};
use serde_json::Value;
use tokio::sync::broadcast;

use synod_common::{
    crypto::{Address, Hash},
    event::{EventType, LogEvent, RollupEvent},
};


const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Clone, Debug)]
pub enum BusEvent {
    Log(LogEvent),
    Rollup(RollupEvent),
}

// Broadcast bridge towards websocket consumers and the rollup mirror.
// Dropped receivers are fine; a send without subscribers is not an error.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<BusEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        EventBus::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        EventBus { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.sender.subscribe()
    }

    pub fn send_log(&self, event: LogEvent) {
        match event.event_type {
            EventType::Error => error!("[{}] {}", event.name, event.message),
            EventType::Info | EventType::Success => info!("[{}] {}", event.name, event.message),
            EventType::Debug => debug!("[{}] {}", event.name, event.message),
        }
        if self.sender.send(BusEvent::Log(event)).is_err() {
            debug!("no event subscribers connected");
        }
    }

    pub fn emit_rollup(
        &self,
        name: impl Into<String>,
        account: Address,
        transaction_hash: Hash,
        extra: Vec<Value>,
    ) {
        let event = RollupEvent {
            name: name.into(),
            account,
            transaction_hash,
            extra,
        };
        debug!(
            "rollup event {} for {}",
            event.name, event.transaction_hash
        );
        if self.sender.send(BusEvent::Rollup(event)).is_err() {
            debug!("no rollup subscribers connected");
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}
