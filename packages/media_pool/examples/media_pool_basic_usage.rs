//! Example demonstrating a producer that renders into pooled buffers, hands finished buffers
//! to a consumer thread and defers the destruction of a buffer still read by "device" work.

use std::sync::Arc;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use media_pool::{
    Buffer, BufferFactory, BufferPool, DisposalQueuePool, LinkSlot, PoolConfig, Pooled, Shape,
    TimelineFence, WaitPolicy,
};

struct Device {
    name: &'static str,
}

fn main() {
    println!("=== media_pool: producer, consumer and deferred disposal ===");

    let pool = BufferPool::new(BufferFactory::new());
    pool.configure(
        PoolConfig::builder()
            .shape(Shape::new("video/x-raw, format=GRAY8, width=8, height=8"))
            .item_size(64)
            .min_items(2)
            .max_items(3)
            .wait_policy(WaitPolicy::BlockFor(Duration::from_secs(1)))
            .build()
            .expect("configuration is valid"),
    )
    .expect("a fresh pool accepts any configuration");
    pool.set_active(true).expect("preallocation succeeds");

    let device_slot = Arc::new(LinkSlot::new());
    device_slot.attach(Arc::new(Device { name: "software" }));

    let (frames, consumer_frames) = mpsc::channel::<Pooled<Buffer>>();

    let consumer = thread::spawn(move || {
        let mut received = 0_u32;

        for frame in consumer_frames {
            let first_byte = frame
                .map_readable()
                .and_then(|bytes| bytes.first().copied())
                .unwrap_or_default();
            println!("Consumer got frame starting with {first_byte}");
            received += 1;
        }

        received
    });

    for index in 0..10_u8 {
        let Some(device) = device_slot.lock_for_read() else {
            break;
        };

        let mut frame = pool.acquire().expect("a frame becomes available within a second");
        if let Some(mut bytes) = frame.map_writable() {
            bytes.fill(index);
        }
        println!("Rendered frame {index} on the {} device", device.name);
        device.unlock();

        frames.send(frame).expect("consumer is running");
    }

    drop(frames);
    let received = consumer.join().expect("consumer does not panic");
    println!("Consumer received {received} frames");

    // A buffer that the device still reads must outlive that work.
    let disposal = DisposalQueuePool::new();
    let timeline = TimelineFence::new();

    let in_flight = pool.acquire().expect("pool has a free buffer").detach();
    let mut queue = disposal.acquire_queue();
    queue.push(in_flight, |buffer| {
        println!("Destroying a {} byte buffer after the device is done", buffer.size());
    });
    queue.submit(&timeline.at(1));

    println!("Device work pending: {}", disposal.stats().pending);
    timeline.signal(1);
    println!("Device work pending: {}", disposal.stats().pending);

    let device = device_slot.tear_down().expect("device was attached");
    println!("Detached the {} device", device.name);

    pool.set_active(false).expect("deactivation cannot fail");
    println!("Pool stats: {:?}", pool.stats());
}
