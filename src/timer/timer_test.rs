use super::*;

use std::sync::atomic::AtomicUsize;

fn counting_callback(counter: Arc<AtomicUsize>) -> TimerCallbackFn {
    Box::new(move || {
        let counter = Arc::clone(&counter);
        Box::pin(async move {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    })
}

#[tokio::test]
async fn test_repeating_timer_fires() {
    let wheel = TimerWheel::new();
    let fired = Arc::new(AtomicUsize::new(0));

    let id = wheel.register(
        Duration::from_millis(20),
        true,
        counting_callback(Arc::clone(&fired)),
    );
    wheel.start(id);

    tokio::time::sleep(Duration::from_millis(300)).await;
    let count = fired.load(Ordering::SeqCst);
    assert!(count >= 3, "expected at least 3 fires, got {count}");

    wheel.stop(id);
    tokio::time::sleep(Duration::from_millis(60)).await;
    let after_stop = fired.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(
        fired.load(Ordering::SeqCst),
        after_stop,
        "timer fired after stop"
    );

    wheel.close();
}

#[tokio::test]
async fn test_once_timer_fires_once() {
    let wheel = TimerWheel::new();
    let fired = Arc::new(AtomicUsize::new(0));

    let id = wheel.register(
        Duration::from_millis(20),
        false,
        counting_callback(Arc::clone(&fired)),
    );
    wheel.start(id);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert!(!wheel.is_armed(id));

    wheel.close();
}

#[tokio::test]
async fn test_set_next_fire() {
    let wheel = TimerWheel::new();
    let fired = Arc::new(AtomicUsize::new(0));

    // A long interval that would not fire during the test on its own.
    let id = wheel.register(
        Duration::from_secs(3600),
        false,
        counting_callback(Arc::clone(&fired)),
    );
    wheel.set_next_fire(id, Instant::now() + Duration::from_millis(30));

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(fired.load(Ordering::SeqCst), 1);

    wheel.close();
}

#[tokio::test]
async fn test_unregistered_timer_never_fires() {
    let wheel = TimerWheel::new();
    let fired = Arc::new(AtomicUsize::new(0));

    let id = wheel.register(
        Duration::from_millis(20),
        true,
        counting_callback(Arc::clone(&fired)),
    );
    wheel.start(id);
    wheel.unregister(id);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(fired.load(Ordering::SeqCst), 0);

    wheel.close();
}
