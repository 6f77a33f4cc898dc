use std::sync::{Arc, Mutex};
use std::time::Duration;

use mail_dispatch::Error;
use mail_dispatch::dispatch::{
    Dispatcher, DispatcherSettings, EnqueueError, MessageRequest, OutboundMessage,
};
use tokio::time::Instant;
use tower::service_fn;
use tower::util::BoxService;
use tower_test::mock;

#[derive(Clone, Debug)]
struct Attempt {
    subject: String,
    at: Instant,
}

type AttemptLog = Arc<Mutex<Vec<Attempt>>>;
type TestClient = BoxService<Arc<OutboundMessage>, String, Error>;

/// A delivery client that records every call and fails the subjects for
/// which `fails` returns true.
fn recording_client(fails: fn(&str) -> bool) -> (TestClient, AttemptLog) {
    let log = AttemptLog::default();
    let attempts = Arc::clone(&log);
    let client = service_fn(move |message: Arc<OutboundMessage>| {
        let attempts = Arc::clone(&attempts);
        async move {
            attempts.lock().unwrap().push(Attempt {
                subject: message.subject.clone(),
                at: Instant::now(),
            });
            if fails(&message.subject) {
                Err::<String, Error>(format!("provider rejected {}", message.subject).into())
            } else {
                Ok(format!("id-{}", message.subject))
            }
        }
    });
    (BoxService::new(client), log)
}

fn never_fails(_: &str) -> bool {
    false
}

fn request(subject: impl Into<String>) -> MessageRequest {
    MessageRequest::builder()
        .to("ada@example.com")
        .subject(subject.into())
        .body_html("<p>Hello</p>")
        .build()
}

fn settings(rate_limit: u32) -> DispatcherSettings {
    DispatcherSettings::builder()
        .rate_limit(rate_limit)
        .default_sender_address("noreply@example.com")
        .build()
}

fn subjects(log: &AttemptLog) -> Vec<String> {
    log.lock().unwrap().iter().map(|send| send.subject.clone()).collect()
}

#[tokio::test(start_paused = true)]
async fn burst_over_the_rate_limit_is_paced() {
    let (client, log) = recording_client(never_fails);
    let dispatcher = Dispatcher::new(settings(20), client).unwrap();
    for n in 1..=25 {
        dispatcher.enqueue(request(format!("{n}"))).unwrap();
    }

    let origin = Instant::now();
    let handle = dispatcher.start().unwrap();
    dispatcher.wait_for_drain().await;
    handle.stop().await.unwrap();

    let sends = log.lock().unwrap().clone();
    assert_eq!(sends.len(), 25);

    // The first 20 go out back to back. The 21st waits a full tick; at
    // exactly one second the budget is still 20, so the 22nd waits another.
    // After that the two-second budget covers the rest of the burst.
    let tick = Duration::from_secs(1);
    assert!(sends[..20].iter().all(|send| send.at == origin));
    assert_eq!(sends[20].at, origin + tick);
    assert_eq!(sends[21].at, origin + 2 * tick);
    assert!(sends[22..].iter().all(|send| send.at == origin + 2 * tick));

    // Never more than the budget of the second in progress. A send landing
    // exactly on a whole second counts toward the second it opens, so the
    // bound is `(floor(T) + 1) * R` rather than `ceil(T) * R` (see the
    // "Burst of 25 at rate 20" decision in DESIGN.md).
    for (index, send) in sends.iter().enumerate() {
        let second_in_progress = (send.at - origin).as_secs() + 1;
        assert!(
            (index as u64) < second_in_progress * 20,
            "message {} sent {:?} into the burst",
            index + 1,
            send.at - origin
        );
    }

    let stats = dispatcher.stats();
    assert_eq!(stats.delivered, 25);
    assert_eq!(stats.throttled, 2);
}

#[tokio::test(start_paused = true)]
async fn sends_follow_enqueue_order() {
    let (client, log) = recording_client(never_fails);
    let dispatcher = Dispatcher::new(settings(5), client).unwrap();
    let handle = dispatcher.start().unwrap();

    let expected: Vec<String> = (1..=12).map(|n| format!("message {n}")).collect();
    for subject in &expected {
        dispatcher.enqueue(request(subject.as_str())).unwrap();
    }
    dispatcher.wait_for_drain().await;
    handle.stop().await.unwrap();

    assert_eq!(subjects(&log), expected);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_producers_are_each_dispatched_once_in_order() {
    let (client, log) = recording_client(never_fails);
    let dispatcher = Dispatcher::new(
        DispatcherSettings::builder()
            .rate_limit(10_000)
            .idle_poll_interval(Duration::from_millis(5))
            .drain_poll_interval(Duration::from_millis(5))
            .default_sender_address("noreply@example.com")
            .build(),
        client,
    )
    .unwrap();
    let handle = dispatcher.start().unwrap();

    let producers: Vec<_> = (0..4)
        .map(|producer| {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move {
                for seq in 0..50 {
                    dispatcher.enqueue(request(format!("{producer}:{seq}"))).unwrap();
                    tokio::task::yield_now().await;
                }
            })
        })
        .collect();
    for producer in producers {
        producer.await.unwrap();
    }
    assert!(dispatcher.wait_for_drain_timeout(Duration::from_secs(10)).await);
    handle.stop().await.unwrap();

    let sent = subjects(&log);
    assert_eq!(sent.len(), 200);
    let mut last_seen = [None::<u32>; 4];
    for subject in sent {
        let (producer, seq) = subject.split_once(':').unwrap();
        let (producer, seq): (usize, u32) = (producer.parse().unwrap(), seq.parse().unwrap());
        if let Some(previous) = last_seen[producer] {
            assert_eq!(seq, previous + 1, "producer {producer} reordered or duplicated");
        }
        last_seen[producer] = Some(seq);
    }
    assert_eq!(last_seen, [Some(49); 4]);
    assert_eq!(dispatcher.stats().delivered, 200);
}

#[tokio::test(start_paused = true)]
async fn failed_send_is_reported_once_and_dropped() {
    let (client, log) = recording_client(|subject| subject == "3");
    let dispatcher = Dispatcher::new(settings(20), client).unwrap();

    let delivered = Arc::new(Mutex::new(Vec::new()));
    let failed = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&delivered);
    dispatcher.on_success(move |receipt| {
        seen.lock()
            .unwrap()
            .push((receipt.message.subject.clone(), receipt.response.clone()));
        Ok(())
    });
    let seen = Arc::clone(&failed);
    dispatcher.on_failure(move |failure| {
        seen.lock()
            .unwrap()
            .push((failure.message.subject.clone(), failure.description()));
        Ok(())
    });

    for n in 1..=5 {
        dispatcher.enqueue(request(format!("{n}"))).unwrap();
    }
    let handle = dispatcher.start().unwrap();
    dispatcher.wait_for_drain().await;
    handle.stop().await.unwrap();

    let delivered = delivered.lock().unwrap().clone();
    let delivered_subjects: Vec<_> = delivered.iter().map(|(subject, _)| subject.as_str()).collect();
    assert_eq!(delivered_subjects, ["1", "2", "4", "5"]);
    assert_eq!(delivered[0].1, "id-1");
    assert_eq!(
        *failed.lock().unwrap(),
        vec![("3".to_string(), "provider rejected 3".to_string())]
    );

    // Attempted once each; the failure is not retried.
    assert_eq!(subjects(&log), ["1", "2", "3", "4", "5"]);
    assert!(dispatcher.is_empty());
    let stats = dispatcher.stats();
    assert_eq!((stats.delivered, stats.failed), (4, 1));
}

#[tokio::test(start_paused = true)]
async fn idle_poller_picks_up_work_within_one_interval() {
    let (client, log) = recording_client(never_fails);
    let idle = Duration::from_secs(30);
    let dispatcher = Dispatcher::new(
        DispatcherSettings::builder()
            .rate_limit(1)
            .idle_poll_interval(idle)
            .default_sender_address("noreply@example.com")
            .build(),
        client,
    )
    .unwrap();
    let handle = dispatcher.start().unwrap();

    dispatcher.enqueue(request("first")).unwrap();
    dispatcher.wait_for_drain().await;
    tokio::time::sleep(idle + Duration::from_secs(1)).await;
    let idle_sleeps_before = dispatcher.stats().idle_sleeps;

    let second_enqueued_at = Instant::now();
    dispatcher.enqueue(request("second")).unwrap();
    dispatcher.wait_for_drain().await;
    handle.stop().await.unwrap();

    let sends = log.lock().unwrap().clone();
    assert_eq!(sends.len(), 2);
    assert!(sends[1].at - sends[0].at >= idle);
    assert!(sends[1].at >= second_enqueued_at);
    // The idle poller noticed the new work within one interval.
    assert!(sends[1].at - second_enqueued_at <= idle);

    let stats = dispatcher.stats();
    assert!(idle_sleeps_before >= 2);
    assert_eq!(stats.throttled, 0);
}

#[tokio::test(start_paused = true)]
async fn new_burst_after_idle_starts_a_fresh_window() {
    let (client, log) = recording_client(never_fails);
    let tick = Duration::from_secs(1);
    let dispatcher = Dispatcher::new(
        DispatcherSettings::builder()
            .rate_limit(2)
            .idle_poll_interval(Duration::from_secs(30))
            .throttle_tick(tick)
            .default_sender_address("noreply@example.com")
            .build(),
        client,
    )
    .unwrap();

    // First burst overruns the budget of 2 by one message.
    for n in 1..=3 {
        dispatcher.enqueue(request(format!("a{n}"))).unwrap();
    }
    let handle = dispatcher.start().unwrap();
    dispatcher.wait_for_drain().await;
    assert_eq!(dispatcher.stats().throttled, 1);

    // Second burst lands while the loop is idle. Measured against the old
    // window it would be far inside the budget; measured against its own
    // window the third message must wait a tick again.
    for n in 1..=3 {
        dispatcher.enqueue(request(format!("b{n}"))).unwrap();
    }
    dispatcher.wait_for_drain().await;
    handle.stop().await.unwrap();

    let sends = log.lock().unwrap().clone();
    assert_eq!(subjects(&log), ["a1", "a2", "a3", "b1", "b2", "b3"]);
    assert_eq!(sends[1].at, sends[0].at);
    assert_eq!(sends[2].at - sends[1].at, tick);

    assert!(sends[3].at - sends[2].at >= Duration::from_secs(2));
    assert_eq!(sends[4].at, sends[3].at);
    assert_eq!(sends[5].at - sends[4].at, tick);

    let stats = dispatcher.stats();
    assert_eq!(stats.throttled, 2);
    assert_eq!(stats.delivered, 6);
}

#[tokio::test(start_paused = true)]
async fn blank_target_is_rejected_and_nothing_is_sent() {
    let (client, log) = recording_client(never_fails);
    let dispatcher = Dispatcher::new(settings(20), client).unwrap();
    let handle = dispatcher.start().unwrap();

    let blank = MessageRequest::builder()
        .to("")
        .subject("nowhere")
        .body_html("<p>Hello</p>")
        .build();
    let error = dispatcher.enqueue(blank).unwrap_err();
    assert!(matches!(error, EnqueueError::Validation { field: "target address" }));
    assert_eq!(
        error.to_string(),
        "cannot enqueue message: target address is missing or blank"
    );
    assert!(dispatcher.is_empty());

    tokio::time::sleep(Duration::from_secs(60)).await;
    handle.stop().await.unwrap();
    assert!(log.lock().unwrap().is_empty());
    assert_eq!(dispatcher.stats().enqueued, 0);
}

#[tokio::test(start_paused = true)]
async fn at_most_one_send_is_in_flight() {
    let (client, mut provider) = mock::pair::<Arc<OutboundMessage>, &'static str>();
    let dispatcher = Dispatcher::new(settings(20), client).unwrap();
    let outcomes = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&outcomes);
    dispatcher.on_success(move |receipt| {
        seen.lock().unwrap().push(receipt.message.subject.clone());
        Ok(())
    });

    dispatcher.enqueue(request("first")).unwrap();
    dispatcher.enqueue(request("second")).unwrap();
    let handle = dispatcher.start().unwrap();

    let (first, respond) = provider.next_request().await.unwrap();
    assert_eq!(first.subject, "first");

    // While the first send is unresolved no second request may start, and
    // the head stays queued.
    let pending = tokio::time::timeout(Duration::from_secs(5), provider.next_request()).await;
    assert!(pending.is_err());
    assert_eq!(dispatcher.len(), 2);
    assert!(outcomes.lock().unwrap().is_empty());

    respond.send_response("accepted");
    let (second, respond) = provider.next_request().await.unwrap();
    assert_eq!(second.subject, "second");
    assert_eq!(*outcomes.lock().unwrap(), ["first"]);
    respond.send_response("accepted");

    dispatcher.wait_for_drain().await;
    handle.stop().await.unwrap();
    assert_eq!(*outcomes.lock().unwrap(), ["first", "second"]);
}

#[tokio::test(start_paused = true)]
async fn observer_failures_do_not_stop_the_loop() {
    let (client, log) = recording_client(never_fails);
    let dispatcher = Dispatcher::new(settings(20), client).unwrap();
    dispatcher.on_success(|receipt| {
        if receipt.message.subject == "2" {
            panic!("observer bug");
        }
        Err("observer unavailable".into())
    });

    for n in 1..=3 {
        dispatcher.enqueue(request(format!("{n}"))).unwrap();
    }
    let handle = dispatcher.start().unwrap();
    dispatcher.wait_for_drain().await;
    handle.stop().await.unwrap();

    assert_eq!(subjects(&log), ["1", "2", "3"]);
    let stats = dispatcher.stats();
    assert_eq!(stats.delivered, 3);
    assert_eq!(stats.observer_errors, 3);
}

#[tokio::test(start_paused = true)]
async fn stop_leaves_unattempted_messages_queued() {
    let (client, log) = recording_client(never_fails);
    let dispatcher = Dispatcher::new(settings(1), client).unwrap();
    for n in 1..=3 {
        dispatcher.enqueue(request(format!("{n}"))).unwrap();
    }

    let handle = dispatcher.start().unwrap();
    // Let the first message out; the second is now waiting on its tick.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(!handle.is_finished());
    handle.stop().await.unwrap();

    assert_eq!(subjects(&log), ["1"]);
    assert_eq!(dispatcher.len(), 2);
    assert!(!dispatcher.wait_for_drain_timeout(Duration::from_secs(5)).await);
}
