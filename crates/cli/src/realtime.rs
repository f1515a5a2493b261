//! Wall-clock replay on a tokio host.
//!
//! The manager lives on the thread running the replay future. Host callback
//! requests travel over an unbounded channel and are delivered when their
//! timer fires. Scenario posts come from a separate producer thread, so they
//! exercise the cross-thread posting path.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use lanesched_core::SchedulerConfig;
use lanesched_scheduler::{SchedulerHost, WakeupKind};
use tokio::sync::mpsc;
use tracing::{debug, info, trace};

use crate::scenario::Scenario;
use crate::world::{ReplayClock, Report, World};

/// How long a realtime replay without `duration_ms` keeps running after its last event.
const TRAILING_RUN: Duration = Duration::from_millis(100);

type Request = (Instant, WakeupKind);

/// Host whose `post_do_work` only enqueues the request for the driver loop.
struct TokioHost {
    requests: mpsc::UnboundedSender<Request>,
}

impl SchedulerHost for TokioHost {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn post_do_work(&self, delay: Duration, wakeup: WakeupKind) {
        // The receiver only goes away once the replay is over.
        let _ = self.requests.send((Instant::now() + delay, wakeup));
    }
}

/// Task cost is spent by blocking the run-loop thread.
struct WallClock;

impl ReplayClock for WallClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn spend(&self, cost: Duration) {
        thread::sleep(cost);
    }
}

/// Replay `scenario` against the wall clock.
pub async fn run_realtime(scenario: &Scenario, config: &SchedulerConfig) -> Result<Report> {
    let (tx, mut rx) = mpsc::unbounded_channel::<Request>();
    let world = World::build(scenario, Arc::new(TokioHost { requests: tx }), Arc::new(WallClock), config)?;
    let start = world.start();
    let end = start + scenario.duration_ms.map_or(scenario.last_event() + TRAILING_RUN, Duration::from_millis);

    let poster = world.poster();
    let posts = scenario.posts();
    let producer = thread::Builder::new()
        .name("lanesched-producer".into())
        .spawn(move || {
            for post in posts {
                let due = start + post.at();
                let now = Instant::now();
                if due > now {
                    thread::sleep(due - now);
                }
                poster.post(&post);
            }
        })
        .context("failed to spawn producer thread")?;

    let mut steps = scenario.steps().into_iter().peekable();
    let mut callbacks: BTreeMap<(Instant, u64), WakeupKind> = BTreeMap::new();
    let mut next_request = 0u64;
    let mut delivered = 0usize;

    info!("Realtime replay of '{}' running for {:?}", scenario.name, end - start);
    loop {
        while let Ok((at, kind)) = rx.try_recv() {
            callbacks.insert((at, next_request), kind);
            next_request += 1;
        }

        let now = Instant::now();
        while let Some(entry) = callbacks.first_entry() {
            if entry.key().0 > now {
                break;
            }
            let kind = entry.remove();
            trace!(?kind, "Delivering host callback");
            world.manager().do_work(kind);
            delivered += 1;
        }
        while let Some((_, action)) = steps.next_if(|(at, _)| start + *at <= now) {
            world.apply(&action)?;
        }

        if now >= end {
            break;
        }
        let mut wake = end;
        if let Some(((at, _), _)) = callbacks.first_key_value() {
            wake = wake.min(*at);
        }
        if let Some((at, _)) = steps.peek() {
            wake = wake.min(start + *at);
        }

        tokio::select! {
            Some((at, kind)) = rx.recv() => {
                callbacks.insert((at, next_request), kind);
                next_request += 1;
            }
            _ = tokio::time::sleep_until(tokio::time::Instant::from_std(wake)) => {}
        }
    }

    producer
        .join()
        .map_err(|_| anyhow!("producer thread panicked"))?;
    debug!("Realtime replay delivered {} host callbacks", delivered);
    Ok(world.finish("realtime"))
}
