use std::fmt;
use std::sync::Mutex;

use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::events::{ExtractionStatus, FirmwareFile, ImportBatch};

/// Sink the pipeline reports into. Publishing never waits on subscribers.
pub trait ImportEventPublisher: Send + Sync + fmt::Debug {
    fn publish_status(&self, status: ExtractionStatus);
    fn publish_batch(&self, batch: ImportBatch);
    fn publish_firmware(&self, file: FirmwareFile);
}

/// In-process fan-out of pipeline notifications.
///
/// Each subscriber owns an unbounded queue, so a slow consumer grows its own
/// buffer instead of stalling the pipeline or losing messages. Subscribers
/// only see messages published after they attach.
#[derive(Default)]
pub struct InProcEventBus {
    statuses: Topic<ExtractionStatus>,
    batches: Topic<ImportBatch>,
    firmware: Topic<FirmwareFile>,
}

impl fmt::Debug for InProcEventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InProcEventBus")
            .field("status_subscribers", &self.statuses.len())
            .field("batch_subscribers", &self.batches.len())
            .field("firmware_subscribers", &self.firmware.len())
            .finish()
    }
}

impl InProcEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status_updates(&self) -> UnboundedReceiverStream<ExtractionStatus> {
        self.statuses.subscribe()
    }

    pub fn completed_batches(&self) -> UnboundedReceiverStream<ImportBatch> {
        self.batches.subscribe()
    }

    pub fn firmware_files(&self) -> UnboundedReceiverStream<FirmwareFile> {
        self.firmware.subscribe()
    }
}

impl ImportEventPublisher for InProcEventBus {
    fn publish_status(&self, status: ExtractionStatus) {
        self.statuses.publish(status);
    }

    fn publish_batch(&self, batch: ImportBatch) {
        self.batches.publish(batch);
    }

    fn publish_firmware(&self, file: FirmwareFile) {
        self.firmware.publish(file);
    }
}

struct Topic<T> {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<T>>>,
}

impl<T> Default for Topic<T> {
    fn default() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
        }
    }
}

impl<T: Clone> Topic<T> {
    fn subscribe(&self) -> UnboundedReceiverStream<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().push(tx);
        UnboundedReceiverStream::new(rx)
    }

    fn publish(&self, message: T) {
        // Detached subscribers are pruned as a side effect of publishing.
        self.lock()
            .retain(|subscriber| subscriber.send(message.clone()).is_ok());
    }

    fn len(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<mpsc::UnboundedSender<T>>> {
        // Subscriber lists are only pushed or retained, never left half-updated.
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use futures::StreamExt;

    use super::*;

    #[tokio::test]
    async fn every_subscriber_sees_every_later_message() {
        let bus = InProcEventBus::new();
        bus.publish_status(ExtractionStatus::Idle);

        let mut first = bus.status_updates();
        let mut second = bus.status_updates();
        bus.publish_batch(ImportBatch::pass_through(PathBuf::from("/imports/a.nes")));
        bus.publish_status(ExtractionStatus::Idle);

        assert_eq!(first.next().await, Some(ExtractionStatus::Idle));
        assert_eq!(second.next().await, Some(ExtractionStatus::Idle));
        assert!(futures::poll!(first.next()).is_pending());
    }

    #[tokio::test]
    async fn detached_subscriber_does_not_affect_others() {
        let bus = InProcEventBus::new();
        let gone = bus.completed_batches();
        let mut kept = bus.completed_batches();
        drop(gone);

        bus.publish_batch(ImportBatch::pass_through(PathBuf::from("/imports/b.gb")));
        let batch = kept.next().await.unwrap();
        assert_eq!(batch.paths, vec![PathBuf::from("/imports/b.gb")]);
        assert_eq!(bus.batches.len(), 1);
    }

    #[tokio::test]
    async fn firmware_has_its_own_topic() {
        let bus = InProcEventBus::new();
        let mut firmware = bus.firmware_files();
        let mut batches = bus.completed_batches();

        bus.publish_firmware(FirmwareFile::new(PathBuf::from("/imports/scph1001.bin")));
        assert_eq!(
            firmware.next().await.unwrap().path,
            PathBuf::from("/imports/scph1001.bin")
        );
        assert!(futures::poll!(batches.next()).is_pending());
    }
}
