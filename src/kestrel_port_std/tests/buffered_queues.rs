//! Mailbox queues, stream buffers, job queues, and memory pools.
mod common;

use std::sync::atomic::{AtomicUsize, Ordering};

use common::{KernelTestUtil, SeqTracker};
use kestrel_kernel::{
    error::PollError,
    utils::StorageCell,
    Job, JobQueueCb, MailboxCb, MemPoolCb, StreamBufferCb, TaskAttr, TaskCb,
};
use kestrel_port_std as port;

port::use_port!(unsafe struct SystemTraits {
    startup_tasks = [DRIVER_TASK, HELPER_TASK],
});

static TEST_UTIL: KernelTestUtil = KernelTestUtil::new();
static SEQ: SeqTracker = SeqTracker::new();

static BOX_BUF: StorageCell<[u8; 8]> = StorageCell::new([0; 8]); // 2 slots × 4 bytes
static MAILBOX: MailboxCb<SystemTraits> = MailboxCb::new(4, &BOX_BUF);

static STREAM_BUF: StorageCell<[u8; 8]> = StorageCell::new([0; 8]);
static STREAM: StreamBufferCb<SystemTraits> = StreamBufferCb::new(&STREAM_BUF);

static JOB_BUF: StorageCell<[Option<Job>; 2]> = StorageCell::new([None; 2]);
static JOBS: JobQueueCb<SystemTraits> = JobQueueCb::new(&JOB_BUF);

static POOL_BUF: StorageCell<[u8; 64]> = StorageCell::new([0; 64]); // 4 blocks × 16 bytes
static POOL: MemPoolCb<SystemTraits> = MemPoolCb::new(16, &POOL_BUF);

static JOBS_RUN: AtomicUsize = AtomicUsize::new(0);

static DRIVER_TASK: TaskCb<SystemTraits> = TaskCb::new(&DRIVER_ATTR);
static DRIVER_ATTR: TaskAttr<SystemTraits> = TaskAttr::new(driver_body)
    .with_priority(1)
    .with_auto_start(true);

static HELPER_TASK: TaskCb<SystemTraits> = TaskCb::new(&HELPER_ATTR);
static HELPER_ATTR: TaskAttr<SystemTraits> = TaskAttr::new(helper_body)
    .with_priority(2)
    .with_auto_start(true);

fn count_job() {
    JOBS_RUN.fetch_add(1, Ordering::SeqCst);
}

fn helper_body(_: usize) {
    SEQ.expect_and_replace(0, 1);

    // Mailbox: block on the empty queue; the driver's give is handed to us
    // directly
    let mut item = [0u8; 4];
    MAILBOX.recv(&mut item).unwrap();
    assert_eq!(&item, b"dir0");
    assert_eq!(MAILBOX.count().unwrap(), 0);
    SEQ.expect_and_replace(2, 3);

    // Stream: block on the empty buffer; the driver's write is delivered
    // partially (up to our buffer size) without touching the ring
    let mut small = [0u8; 4];
    let n = STREAM.read(&mut small).unwrap();
    assert_eq!(n, 4);
    assert_eq!(&small, b"abcd");
    SEQ.expect_and_replace(4, 5);

    // The rest of the driver's write went into the ring
    let mut rest = [0u8; 8];
    assert_eq!(STREAM.take(&mut rest).unwrap(), 2);
    assert_eq!(&rest[..2], b"ef");

    // Stream writer-side blocking: fill the ring, then overflow
    assert_eq!(STREAM.write(&[0x55; 8]).unwrap(), 8);
    SEQ.expect_and_replace(5, 6);
    assert_eq!(STREAM.write(b"xyz").unwrap(), 3);

    // Our blocked bytes were spliced in after the ring contents
    SEQ.expect_and_replace(7, 8);

    // Job queue: block on the empty queue; the driver hands us a job
    JOBS.wait().unwrap();
    assert_eq!(JOBS_RUN.load(Ordering::SeqCst), 1);
    SEQ.expect_and_replace(9, 10);

    // Let the driver exhaust the pool first
    kestrel_kernel::System::<SystemTraits>::sleep_for(10).unwrap();

    // Memory pool: block on the exhausted pool; the driver's give hands
    // the freed block to us directly
    let block = POOL.wait().unwrap();
    SEQ.expect_and_replace(11, 12);
    unsafe { POOL.give(block).unwrap() };

    // Fill the mailbox and park in `send`; the driver's `push` must not
    // evict past us
    MAILBOX.give(b"itm0").unwrap();
    MAILBOX.give(b"itm1").unwrap();
    SEQ.expect_and_replace(12, 13);
    MAILBOX.send(b"itm2").unwrap();
    SEQ.expect_and_replace(14, 15);

    // Same for the job queue
    JOBS.give(count_job).unwrap();
    JOBS.give(count_job).unwrap();
    SEQ.expect_and_replace(15, 16);
    JOBS.send(count_job).unwrap();
    SEQ.expect_and_replace(17, 18);

    // Our queued items survived both `push` calls, in order
    let mut item = [0u8; 4];
    MAILBOX.take(&mut item).unwrap();
    assert_eq!(&item, b"itm1");
    MAILBOX.take(&mut item).unwrap();
    assert_eq!(&item, b"itm2");

    TEST_UTIL.success::<SystemTraits>();
}

fn driver_body(_: usize) {
    // Mailbox rendezvous
    SEQ.expect_and_replace(1, 2);
    MAILBOX.give(b"dir0").unwrap();
    // (the helper preempted us here)

    // Mailbox FIFO order and the drop-oldest `push`
    MAILBOX.give(b"old0").unwrap();
    MAILBOX.give(b"old1").unwrap();
    assert_eq!(MAILBOX.give(b"full"), Err(PollError::Timeout));
    MAILBOX.push(b"new0").unwrap(); // drops "old0"
    let mut item = [0u8; 4];
    MAILBOX.take(&mut item).unwrap();
    assert_eq!(&item, b"old1");
    MAILBOX.take(&mut item).unwrap();
    assert_eq!(&item, b"new0");
    assert_eq!(MAILBOX.take(&mut item), Err(PollError::Timeout));

    SEQ.expect_and_replace(3, 4);
    // Stream rendezvous: 4 bytes straight into the helper's buffer, 2 into
    // the ring
    assert_eq!(STREAM.write(b"abcdef").unwrap(), 6);
    // (the helper preempted us, read the rest, and filled the ring)

    SEQ.expect_and_replace(6, 7);
    // The helper's overflowing write is blocked; reading drains the ring
    // first, then splices the blocked writer's bytes in order
    let mut buf = [0u8; 16];
    let n = STREAM.read(&mut buf).unwrap();
    assert_eq!(n, 11);
    assert!(buf[..8].iter().all(|&b| b == 0x55));
    assert_eq!(&buf[8..11], b"xyz");
    SEQ.expect_and_replace(8, 9);
    assert_eq!(STREAM.bytes_used().unwrap(), 0);

    // The helper has blocked on the empty job queue by now.
    // Job queue: a handed-over job runs in the helper's context
    JOBS.give(count_job).unwrap();
    // (the helper preempted us and ran the job)
    assert_eq!(JOBS_RUN.load(Ordering::SeqCst), 1);

    // Job queue storage and execution in our own context
    JOBS.give(count_job).unwrap();
    JOBS.give(count_job).unwrap();
    assert_eq!(JOBS.give(count_job), Err(PollError::Timeout));
    JOBS.take().unwrap();
    JOBS.take().unwrap();
    assert_eq!(JOBS_RUN.load(Ordering::SeqCst), 3);
    assert_eq!(JOBS.take(), Err(PollError::Timeout));

    SEQ.expect_and_replace(10, 11);
    // Memory pool: drain all four blocks
    let blocks = [
        POOL.take().unwrap(),
        POOL.take().unwrap(),
        POOL.take().unwrap(),
        POOL.take().unwrap(),
    ];
    assert_eq!(POOL.free_blocks().unwrap(), 0);
    assert_eq!(POOL.take(), Err(PollError::Timeout));

    // Distinct, word-aligned blocks
    for (i, a) in blocks.iter().enumerate() {
        assert_eq!(a.as_ptr() as usize % core::mem::size_of::<usize>(), 0);
        for b in &blocks[i + 1..] {
            assert_ne!(a.as_ptr(), b.as_ptr());
        }
    }

    // Wake the sleeping helper; it blocks on the now-exhausted pool.
    // Giving a block back hands it over directly.
    port::advance_time::<SystemTraits>(10);
    unsafe { POOL.give(blocks[0]).unwrap() };
    // (the helper preempted us here)

    for &block in &blocks[1..] {
        unsafe { POOL.give(block).unwrap() };
    }
    assert_eq!(POOL.free_blocks().unwrap(), 4);

    // The helper is parked in `send` on the full mailbox; `push` must be a
    // no-op rather than evict past it
    SEQ.expect_and_replace(13, 14);
    MAILBOX.push(b"lost").unwrap();
    assert_eq!(MAILBOX.count().unwrap(), 2);

    // Draining one item moves the parked sender's item in and wakes it
    let mut item = [0u8; 4];
    MAILBOX.take(&mut item).unwrap();
    assert_eq!(&item, b"itm0");

    // The helper is now parked on the full job queue
    SEQ.expect_and_replace(16, 17);
    JOBS.push(count_job).unwrap();
    assert_eq!(JOBS.count().unwrap(), 2);

    // Dequeuing stores the parked sender's job and wakes it; the helper
    // then verifies the mailbox contents and finishes the scenario
    JOBS.take().unwrap();
}

#[test]
fn buffered_queues() {
    TEST_UTIL.run(|| port::boot::<SystemTraits>());
}
