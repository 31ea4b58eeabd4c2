//! Progress Bus: topic-keyed publish/subscribe for per-job status updates.
//!
//! Delivery is best-effort: no replay, no durability. A subscriber joining
//! after a publish does not see that publish; the relay compensates with an
//! explicit connection greeting. Per-topic publish order is preserved.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use renderflow_protocol::naming::job_channel;
use renderflow_protocol::{JobId, ProgressUpdate};

const CHANNEL_CAPACITY: usize = 256;

/// In-process pub/sub bus, namespaced like the wire topics
/// (`<namespace>:job:<id>`). Shared behind `Arc`.
pub struct ProgressBus {
    namespace: String,
    channels: Mutex<HashMap<String, broadcast::Sender<String>>>,
}

impl ProgressBus {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            channels: Mutex::new(HashMap::new()),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn job_topic(&self, job_id: JobId) -> String {
        job_channel(&self.namespace, job_id)
    }

    /// Publish a raw payload to a topic; returns the subscriber count.
    pub fn publish_raw(&self, topic: &str, message: String) -> usize {
        let mut channels = self.channels.lock().expect("progress bus poisoned");
        let Some(sender) = channels.get(topic) else {
            return 0;
        };
        let receivers = sender.receiver_count();
        if receivers == 0 {
            // Last subscriber left; drop the cold channel.
            channels.remove(topic);
            return 0;
        }
        match sender.send(message) {
            Ok(delivered) => delivered,
            Err(_) => 0,
        }
    }

    /// Publish a job status update. Serialization errors are logged and
    /// swallowed; publishing never interrupts the job.
    pub fn publish(&self, update: &ProgressUpdate) -> usize {
        let topic = self.job_topic(update.job_id);
        match serde_json::to_string(update) {
            Ok(payload) => {
                let subscribers = self.publish_raw(&topic, payload);
                debug!(
                    "Published {} to {} (subscribers: {})",
                    update.phase(),
                    topic,
                    subscribers
                );
                subscribers
            }
            Err(e) => {
                warn!("Failed to serialize progress update for {topic}: {e}");
                0
            }
        }
    }

    pub fn publish_started(&self, job_id: JobId) -> usize {
        self.publish(&ProgressUpdate::started(job_id))
    }

    pub fn publish_processing(&self, job_id: JobId, progress: Option<f64>) -> usize {
        self.publish(&ProgressUpdate::processing(job_id, progress))
    }

    pub fn publish_completed(
        &self,
        job_id: JobId,
        content_id: i64,
        output_paths: Vec<String>,
    ) -> usize {
        self.publish(&ProgressUpdate::completed(job_id, content_id, output_paths))
    }

    pub fn publish_failed(&self, job_id: JobId, error: impl Into<String>) -> usize {
        self.publish(&ProgressUpdate::failed(job_id, error))
    }

    /// Subscribe to one job's topic.
    pub fn subscribe_job(&self, job_id: JobId) -> Subscription {
        self.subscribe(&[self.job_topic(job_id)])
    }

    /// Subscribe to the union of several jobs' topics.
    pub fn subscribe_jobs(&self, job_ids: &[JobId]) -> Subscription {
        let topics: Vec<String> = job_ids.iter().map(|id| self.job_topic(*id)).collect();
        self.subscribe(&topics)
    }

    /// Subscribe to a set of topics, merged into one ordered-per-topic
    /// stream. Must be called from within a tokio runtime.
    pub fn subscribe(&self, topics: &[String]) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut forwarders = Vec::with_capacity(topics.len());
        {
            let mut channels = self.channels.lock().expect("progress bus poisoned");
            for topic in topics {
                let sender = channels
                    .entry(topic.clone())
                    .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
                let mut receiver = sender.subscribe();
                let tx = tx.clone();
                let topic = topic.clone();
                forwarders.push(tokio::spawn(async move {
                    loop {
                        match receiver.recv().await {
                            Ok(message) => {
                                if tx.send(message).is_err() {
                                    break;
                                }
                            }
                            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                                warn!("Subscriber lagged on {topic}, skipped {skipped} messages");
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                        }
                    }
                }));
            }
        }
        Subscription {
            rx,
            forwarders,
        }
    }
}

/// A live subscription. Dropping it cancels the forwarders and releases the
/// underlying channels.
pub struct Subscription {
    rx: mpsc::UnboundedReceiver<String>,
    forwarders: Vec<JoinHandle<()>>,
}

impl Subscription {
    /// Next message, or `None` once every subscribed topic is closed.
    pub async fn recv(&mut self) -> Option<String> {
        self.rx.recv().await
    }

    /// Non-blocking poll used by tests.
    pub fn try_recv(&mut self) -> Option<String> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        for task in &self.forwarders {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{timeout, Duration};

    #[tokio::test]
    async fn publish_without_subscribers_returns_zero() {
        let bus = ProgressBus::new("renderflow_test");
        assert_eq!(bus.publish_started(JobId::new(1)), 0);
    }

    #[tokio::test]
    async fn subscriber_receives_in_publish_order() {
        let bus = ProgressBus::new("renderflow_test");
        let mut sub = bus.subscribe_job(JobId::new(7));

        assert_eq!(bus.publish_started(JobId::new(7)), 1);
        bus.publish_processing(JobId::new(7), Some(50.0));
        bus.publish_completed(JobId::new(7), 42, vec!["/out/a.png".into()]);

        let phases: Vec<String> = {
            let mut out = Vec::new();
            for _ in 0..3 {
                let raw = timeout(Duration::from_secs(1), sub.recv())
                    .await
                    .unwrap()
                    .unwrap();
                let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
                out.push(value["status"].as_str().unwrap().to_string());
            }
            out
        };
        assert_eq!(phases, ["running", "running", "completed"]);
    }

    #[tokio::test]
    async fn late_subscriber_misses_earlier_publishes() {
        let bus = ProgressBus::new("renderflow_test");
        {
            let _warmup = bus.subscribe_job(JobId::new(3));
            bus.publish_started(JobId::new(3));
        }
        tokio::task::yield_now().await;

        let mut sub = bus.subscribe_job(JobId::new(3));
        bus.publish_failed(JobId::new(3), "boom");
        let raw = timeout(Duration::from_secs(1), sub.recv())
            .await
            .unwrap()
            .unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["status"], "failed");
        assert_eq!(value["error"], "boom");
        // Nothing else buffered.
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn multi_topic_subscription_sees_union() {
        let bus = ProgressBus::new("renderflow_test");
        let mut sub = bus.subscribe_jobs(&[JobId::new(1), JobId::new(2)]);

        bus.publish_started(JobId::new(1));
        bus.publish_started(JobId::new(2));
        bus.publish_started(JobId::new(3)); // not subscribed

        let mut seen = Vec::new();
        for _ in 0..2 {
            let raw = timeout(Duration::from_secs(1), sub.recv())
                .await
                .unwrap()
                .unwrap();
            let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
            seen.push(value["job_id"].as_i64().unwrap());
        }
        seen.sort();
        assert_eq!(seen, [1, 2]);
        assert!(sub.try_recv().is_none());
    }
}
