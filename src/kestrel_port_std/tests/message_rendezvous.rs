//! Message buffers: an ISR send into an empty buffer with a blocked
//! receiver is delivered by a single direct copy, never touching the
//! buffer's internal storage; blocked senders are drained in order when
//! space frees up.
mod common;

use common::{KernelTestUtil, SeqTracker};
use kestrel_kernel::{
    error::{SendError, WaitError},
    utils::StorageCell,
    MsgBufferCb, TaskAttr, TaskCb,
};
use kestrel_port_std as port;

port::use_port!(unsafe struct SystemTraits {
    startup_tasks = [DRIVER_TASK, RECEIVER_TASK],
});

static TEST_UTIL: KernelTestUtil = KernelTestUtil::new();
static SEQ: SeqTracker = SeqTracker::new();

static BUF_STORAGE: StorageCell<[u8; 64]> = StorageCell::new([0; 64]);
static BUF: MsgBufferCb<SystemTraits> = MsgBufferCb::new(&BUF_STORAGE);

static DRIVER_TASK: TaskCb<SystemTraits> = TaskCb::new(&DRIVER_ATTR);
static DRIVER_ATTR: TaskAttr<SystemTraits> = TaskAttr::new(driver_body)
    .with_priority(1)
    .with_auto_start(true);

static RECEIVER_TASK: TaskCb<SystemTraits> = TaskCb::new(&RECEIVER_ATTR);
static RECEIVER_ATTR: TaskAttr<SystemTraits> = TaskAttr::new(receiver_body)
    .with_priority(2)
    .with_auto_start(true);

fn isr_send() {
    // Blocking verbs are rejected in the interrupt context
    let mut scratch = [0u8; 8];
    assert_eq!(BUF.recv(&mut scratch), Err(WaitError::BadContext));

    // Non-blocking send; the blocked receiver takes the payload directly
    BUF.give(b"hello").unwrap();
}

fn receiver_body(_: usize) {
    SEQ.expect_and_replace(0, 1);

    let mut buf = [0u8; 64];
    let n = BUF.recv(&mut buf).unwrap();

    // The rendezvous delivered the whole message in one copy: nothing ever
    // entered the ring
    assert_eq!(n, 5);
    assert_eq!(&buf[..5], b"hello");
    assert_eq!(BUF.count().unwrap(), 0);
    assert_eq!(BUF.bytes_used().unwrap(), 0);

    SEQ.expect_and_replace(2, 3);

    // Fill most of the ring (56 + 4-byte prefix = 60 of 64 bytes), then
    // overflow into a blocking send
    let big = [0x5au8; 56];
    BUF.send(&big).unwrap();
    SEQ.expect_and_replace(3, 4);

    // 4 + 4 bytes don't fit anymore; blocks until the driver drains
    BUF.send(&[1, 2, 3, 4]).unwrap();

    SEQ.expect_and_replace(6, 7);

    // Our blocked message was moved into the ring by the driver's receive
    assert_eq!(BUF.count().unwrap(), 1);
    let n = BUF.take(&mut buf).unwrap();
    assert_eq!(n, 4);
    assert_eq!(&buf[..4], &[1, 2, 3, 4]);

    SEQ.expect_and_replace(7, 8);
}

fn driver_body(_: usize) {
    // The receiver has blocked on the empty buffer
    SEQ.expect_and_replace(1, 2);
    port::pend_software_interrupt::<SystemTraits>(isr_send);

    // The ISR ran and the woken receiver preempted us; by the time we run
    // again it has blocked sending its second message
    SEQ.expect_and_replace(4, 5);

    // A message that can never fit is rejected outright
    assert_eq!(BUF.give(&[0u8; 64]), Err(SendError::Overflow));

    SEQ.expect_and_replace(5, 6);

    // Receiving frees enough space for the blocked sender; storing its
    // message wakes it, and it preempts us inside `recv`
    let mut buf = [0u8; 64];
    let n = BUF.recv(&mut buf).unwrap();
    assert_eq!(n, 56);
    assert!(buf[..56].iter().all(|&b| b == 0x5a));

    SEQ.expect_and_replace(8, 9);
    TEST_UTIL.success::<SystemTraits>();
}

#[test]
fn message_rendezvous() {
    TEST_UTIL.run(|| port::boot::<SystemTraits>());
}
