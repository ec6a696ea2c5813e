use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use sqlx::MySqlPool;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use crate::dispatch;
use crate::eventlog::EventLog;
use crate::idgen::PersistentIdAllocator;
use crate::manager::InstanceManager;
use crate::sessions::SessionRegistry;
use crate::storage;
use crate::transport::{Outbox, Transport};

/// Tick period of the control loop, matching the game's frame cadence.
pub const FRAME_MILLIS: u64 = 16;

/// ~15 s: flush the event log and persist the ID high-water mark.
const LOG_FLUSH_TICKS: u32 = 900;

/// ~10 min: touch the SQL connection so it does not idle out.
const SQL_PING_TICKS: u32 = 40_000;

/// ~10 min: grace window between SHUTDOWN_UNIVERSE and leaving the loop.
const UNIVERSE_SHUTDOWN_TICKS: u32 = 40_000;

/// ~60 s: how long the shutdown coordinator waits for the fleet to drain.
const DRAIN_TICKS: u32 = 3_600;

/// All mutable orchestrator state. Everything here is owned by the
/// control-loop task; handlers get `&mut Master` and nothing is locked.
pub struct Master {
    pub sessions: SessionRegistry,
    pub im: InstanceManager,
    pub ids: PersistentIdAllocator,
    pub outbox: Outbox,
    pub chat_peer: Option<SocketAddr>,
    pub universe_shutdown: bool,
    pub shutdown_started: bool,
    pub log: EventLog,
    universe_ticks: u32,
}

impl Master {
    pub fn new(im: InstanceManager, ids: PersistentIdAllocator, log: EventLog) -> Self {
        Self {
            sessions: SessionRegistry::new(),
            im,
            ids,
            outbox: Outbox::new(),
            chat_peer: None,
            universe_shutdown: false,
            shutdown_started: false,
            log,
            universe_ticks: 0,
        }
    }

    #[cfg(test)]
    pub fn for_tests() -> Self {
        use crate::launcher::Launcher;
        Self::new(
            InstanceManager::new("127.0.0.1".to_string(), 3000, Launcher::disabled()),
            PersistentIdAllocator::new(1000),
            EventLog::disabled(),
        )
    }

    /// Spawn the standing services and warm the default worlds so first
    /// logins do not eat a cold start.
    pub fn prestart(&mut self) {
        info!("prestarting chat, default worlds, auth");
        self.im.launcher().spawn_chat();
        let idx = self.im.get_instance(0, 0);
        self.im.ready_instance(idx, &mut self.outbox);
        let idx = self.im.get_instance(1000, 0);
        self.im.ready_instance(idx, &mut self.outbox);
        self.im.launcher().spawn_auth();
    }

    /// One fixed-rate tick of orchestrator state. Returns `false` once the
    /// universe-shutdown window has fully elapsed.
    pub fn tick(&mut self) -> bool {
        self.im.tick(&mut self.outbox);
        for zone in self.im.reap() {
            info!(zone = %zone, "reaped instance");
            self.log.line(&format!("instance {zone} reaped"));
        }

        if self.universe_shutdown {
            self.universe_ticks += 1;
            if self.universe_ticks >= UNIVERSE_SHUTDOWN_TICKS {
                return false;
            }
        }
        true
    }

    /// First half of the shutdown sequence; idempotent. Returns `false`
    /// when shutdown had already started.
    pub fn begin_shutdown(&mut self) -> bool {
        if self.shutdown_started {
            return false;
        }
        self.shutdown_started = true;
        info!("shutting down the fleet, waiting up to 60 seconds");
        self.log.line("fleet shutdown started");
        self.im.shutdown_all(&mut self.outbox);
        true
    }
}

/// The fixed-tick driver: drain inbound messages, advance timers, flush
/// outbound traffic, service the periodic chores, and watch both exits
/// (universe fuse and signal flag).
pub async fn run(
    master: &mut Master,
    transport: &mut Transport,
    pool: &MySqlPool,
    shutdown_flag: &AtomicBool,
) {
    let mut tick = tokio::time::interval(Duration::from_millis(FRAME_MILLIS));
    // Deadlines here are counted in ticks; a stalled loop must not burn
    // through them by bursting.
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut flush_ticks: u32 = 0;
    let mut ping_ticks: u32 = 0;

    loop {
        tick.tick().await;

        while let Some(ev) = transport.poll() {
            dispatch::handle_event(master, ev);
        }

        let keep_running = master.tick();
        transport.flush(&mut master.outbox);

        flush_ticks += 1;
        if flush_ticks >= LOG_FLUSH_TICKS {
            flush_ticks = 0;
            master.log.flush();
            if master.ids.dirty() {
                match storage::save_persistent_id(pool, master.ids.high_water()).await {
                    Ok(()) => master.ids.mark_saved(),
                    Err(e) => warn!(err = %e, "persistent id save failed"),
                }
            }
        }

        ping_ticks += 1;
        if ping_ticks >= SQL_PING_TICKS {
            ping_ticks = 0;
            if let Err(e) = storage::ping(pool).await {
                warn!(err = %e, "sql keep-alive failed");
            }
        }

        if !keep_running {
            info!("universe shutdown window elapsed");
            break;
        }
        if shutdown_flag.load(Ordering::Relaxed) {
            info!("shutdown signal received");
            break;
        }
    }
}

/// The shutdown coordinator: tell every instance to drain, persist the ID
/// allocator, then keep servicing the protocol until the fleet reports
/// done or the timeout lapses.
pub async fn shutdown(master: &mut Master, transport: &mut Transport, pool: &MySqlPool) {
    if !master.begin_shutdown() {
        return;
    }

    match storage::save_persistent_id(pool, master.ids.high_water()).await {
        Ok(()) => {
            master.ids.mark_saved();
            info!("saved persistent id high-water mark");
        }
        Err(e) => warn!(err = %e, "persistent id save failed during shutdown"),
    }

    let mut tick = tokio::time::interval(Duration::from_millis(FRAME_MILLIS));
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut ticks: u32 = 0;

    loop {
        tick.tick().await;

        // Affirmations, shutdown responses, and disconnects still arrive
        // while the fleet drains; keep dispatching them.
        while let Some(ev) = transport.poll() {
            dispatch::handle_event(master, ev);
        }
        transport.flush(&mut master.outbox);

        let _ = master.im.reap();
        if master.im.all_shutdown_complete() {
            info!("fleet drained cleanly");
            break;
        }

        ticks += 1;
        if ticks >= DRAIN_TICKS {
            warn!("fleet drain timed out, exiting anyway");
            break;
        }
    }

    master.log.line("fleet shutdown finished");
    master.log.flush();
}

#[cfg(test)]
mod tests {
    use super::*;
    use masterproto::master::{parse_resp, MasterResp};

    use crate::transport::Outgoing;

    #[test]
    fn universe_shutdown_fuse_counts_ticks() {
        let mut m = Master::for_tests();

        for _ in 0..100 {
            assert!(m.tick());
        }

        m.universe_shutdown = true;
        for _ in 0..UNIVERSE_SHUTDOWN_TICKS - 1 {
            assert!(m.tick());
        }
        assert!(!m.tick());
    }

    #[test]
    fn begin_shutdown_is_idempotent_and_notifies_the_fleet() {
        let mut m = Master::for_tests();
        let world: std::net::SocketAddr = "10.0.0.9:5000".parse().unwrap();
        let idx = m.im.get_instance(1200, 0);
        m.im.get_mut(idx).sys_addr = Some(world);

        assert!(m.begin_shutdown());
        let out: Vec<_> = m
            .outbox
            .drain()
            .map(|o| match o {
                Outgoing::To(addr, payload) => (addr, parse_resp(payload).unwrap()),
                Outgoing::Broadcast(_) => panic!("unexpected broadcast"),
            })
            .collect();
        assert_eq!(out, vec![(world, MasterResp::Shutdown)]);
        assert!(m.im.get(idx).shutting_down);

        // Second entry is a no-op: the two shutdown paths converge here.
        assert!(!m.begin_shutdown());
        assert!(m.outbox.is_empty());
    }
}
