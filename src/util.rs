use crossbeam_channel;
use event;

pub type LineSnd = crossbeam_channel::Sender<String>;
pub type LineRcv = crossbeam_channel::Receiver<String>;
pub type EventSnd = crossbeam_channel::Sender<event::Event>;
pub type EventRcv = crossbeam_channel::Receiver<event::Event>;

/// Push onto a bounded channel, blocking until there is room.
///
/// Returns false when every receiver is gone, which downstream treats as
/// "the pipeline is shutting down underneath us".
#[inline]
pub fn send<T>(chan: &crossbeam_channel::Sender<T>, item: T) -> bool {
    chan.send(item).is_ok()
}
