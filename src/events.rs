use crossbeam_channel::{Receiver, Sender};
use log::warn;

/// Status events emitted toward the UI collaborator.
///
/// Delivered over a bounded channel so a stalled or absent consumer can never
/// block the tick path or the chunk pipeline; when the channel is full the
/// event is dropped with a warning.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    ProcessingStarted(String),
    ProcessingProgress { chunk_index: usize, percent: f32 },
    ProcessingCompleted,
    ChunkLoadingStarted(usize),
    ChunkReady(usize),
    /// A seek landed in a chunk that is not ready; the surface should pause
    /// and show a loading indicator until `ChunkLoadingCompleted`.
    ChunkLoadingRequired(usize),
    ChunkLoadingCompleted,
    Error(String),
}

pub type EventSender = Sender<SyncEvent>;
pub type EventReceiver = Receiver<SyncEvent>;

const EVENT_QUEUE_CAPACITY: usize = 256;

pub fn event_channel() -> (EventSender, EventReceiver) {
    crossbeam_channel::bounded(EVENT_QUEUE_CAPACITY)
}

/// Best-effort emit: never blocks, drops on a full or disconnected channel.
pub(crate) fn emit(sender: &EventSender, event: SyncEvent) {
    if let Err(e) = sender.try_send(event) {
        warn!("dropping sync event: {}", e);
    }
}
