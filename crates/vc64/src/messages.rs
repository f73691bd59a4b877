//! Message queue from the core to the host GUI.
//!
//! The core posts enumerated events (motor on, warp toggled, disk
//! inserted, ...); the host drains them from a channel receiver on its
//! own thread. Posting never blocks.

use crossbeam_channel::{unbounded, Receiver, Sender};

/// Events published by the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Message {
    Run,
    Halt,
    WarpOn,
    WarpOff,
    AlwaysWarpOn,
    AlwaysWarpOff,
    RomMissing,
    ReadyToRun,
    SnapshotTaken,
    Cartridge,
    NoCartridge,
    DriveDisk,
    DriveNoDisk,
    DriveDiskSound,
    DriveNoDiskSound,
    DriveMotorOn,
    DriveMotorOff,
    DriveRedLedOn,
    DriveRedLedOff,
    DriveHeadUp,
    DriveHeadDown,
    DriveHeadUpSound,
    DriveHeadDownSound,
}

/// Unbounded producer handle held by the machine. Cloneable so the drive
/// can post without reaching back into the machine.
#[derive(Clone)]
pub struct MessageQueue {
    tx: Sender<Message>,
    rx: Receiver<Message>,
}

impl MessageQueue {
    #[must_use]
    pub fn new() -> Self {
        let (tx, rx) = unbounded();
        Self { tx, rx }
    }

    /// Post a message. Dropped silently if nobody listens.
    pub fn put(&self, msg: Message) {
        let _ = self.tx.send(msg);
    }

    /// A receiver for the host side. Receivers share the queue.
    #[must_use]
    pub fn receiver(&self) -> Receiver<Message> {
        self.rx.clone()
    }
}

impl Default for MessageQueue {
    fn default() -> Self {
        Self::new()
    }
}
