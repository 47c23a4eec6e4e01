// A weekly job primed on a Monday, failing on its Wednesday slot.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cadence_core::{ChannelSink, Event, EventLevel};
use cadence_scheduler::JobScheduler;
use chrono::{DateTime, TimeZone, Utc};
use tokio::sync::mpsc;

fn utc(d: u32, h: u32, m: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, d, h, m, 0).single().unwrap()
}

async fn wait_for(rx: &mut mpsc::Receiver<Event>, level: EventLevel) -> Event {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = rx.recv().await.expect("sink closed");
            if event.level == level {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

#[tokio::test]
async fn failed_run_is_reclaimable() {
    let (sink, mut rx) = ChannelSink::channel(32);
    let mut scheduler = JobScheduler::new(Arc::new(sink));
    let attempts = Arc::new(AtomicU32::new(0));

    let counter = Arc::clone(&attempts);
    scheduler
        .add_job("weekly-submit", "30 14 * * 3", move || {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    anyhow::bail!("submission endpoint unavailable");
                }
                Ok(())
            }
        })
        .unwrap();

    // Monday 2024-05-13 10:00 UTC.
    scheduler.prime(utc(13, 10, 0));
    let snap = scheduler.job("weekly-submit").unwrap();
    assert!(snap.active);
    assert_eq!(snap.next_run, Some(utc(15, 14, 30)));

    assert_eq!(scheduler.tick(utc(14, 14, 30)), 0, "Tuesday does not match");

    let slot = utc(15, 14, 30);
    assert_eq!(scheduler.tick(slot), 1);
    let failure = wait_for(&mut rx, EventLevel::Error).await;
    assert!(failure.message.contains("submission endpoint unavailable"));

    let snap = scheduler.job("weekly-submit").unwrap();
    assert_eq!(snap.last_run, None);
    assert_eq!(snap.next_run, Some(utc(22, 14, 30)));

    assert_eq!(scheduler.tick(slot), 1);
    wait_for(&mut rx, EventLevel::Success).await;
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    assert_eq!(scheduler.job("weekly-submit").unwrap().last_run, Some(slot));
    assert_eq!(scheduler.tick(slot), 0);
}

#[tokio::test]
async fn snapshots_serialize_for_status_output() {
    let (sink, _rx) = ChannelSink::channel(8);
    let mut scheduler = JobScheduler::new(Arc::new(sink));
    scheduler
        .add_job("retrain", "0 18 * * 6", || async { Ok(()) })
        .unwrap();
    scheduler.prime(utc(13, 10, 0));

    let json = serde_json::to_value(scheduler.jobs()).unwrap();
    assert_eq!(json[0]["name"], "retrain");
    assert_eq!(json[0]["schedule"], "0 18 * * 6");
    assert_eq!(json[0]["next_run"], "2024-05-18T18:00:00Z");
    assert_eq!(json[0]["running"], 0);
}
