use std::net::SocketAddr;

use masterproto::master::MasterResp;
use tracing::{debug, info, warn};

use crate::instance::{Instance, TransferRequest, ZoneId};
use crate::launcher::Launcher;
use crate::transport::Outbox;

/// Ticks a non-empty affirmation set may age before the instance is
/// declared wedged and its requests rerouted.
pub const AFFIRMATION_WEDGE_TICKS: u32 = 1_000;

/// Owns every known world instance. The backing list is dense and in
/// insertion order; everything else is a scan (the fleet is tens of
/// instances, not thousands).
#[derive(Debug)]
pub struct InstanceManager {
    instances: Vec<Instance>,
    next_instance_id: u16,
    external_ip: String,
    world_port_base: u16,
    launcher: Launcher,
}

impl InstanceManager {
    pub fn new(external_ip: String, world_port_base: u16, launcher: Launcher) -> Self {
        Self {
            instances: Vec::new(),
            next_instance_id: 1,
            external_ip,
            world_port_base,
            launcher,
        }
    }

    pub fn launcher(&self) -> &Launcher {
        &self.launcher
    }

    pub fn instances(&self) -> &[Instance] {
        &self.instances
    }

    pub fn get(&self, idx: usize) -> &Instance {
        &self.instances[idx]
    }

    pub fn get_mut(&mut self, idx: usize) -> &mut Instance {
        &mut self.instances[idx]
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// Resolve `(map_id, clone_id)` to a usable instance, launching a new
    /// world process when no running one has room.
    pub fn get_instance(&mut self, map_id: u16, clone_id: u32) -> usize {
        if let Some(i) = self
            .instances
            .iter()
            .position(|inst| inst.accepts(map_id, clone_id))
        {
            return i;
        }
        self.spawn_instance(map_id, clone_id, None)
    }

    /// Launch a password-guarded instance. Private zones skip the ready
    /// gate: the endpoint is handed out as soon as it is asked for.
    pub fn create_private(&mut self, map_id: u16, clone_id: u32, password: String) -> usize {
        let idx = self.spawn_instance(map_id, clone_id, Some(password));
        self.instances[idx].ready = true;
        idx
    }

    fn spawn_instance(
        &mut self,
        map_id: u16,
        clone_id: u32,
        private_password: Option<String>,
    ) -> usize {
        let port = self.next_free_port();
        let instance_id = self.next_instance_id;
        self.next_instance_id += 1;

        let zone = ZoneId {
            map_id,
            clone_id,
            instance_id,
        };
        let mut inst = Instance::new(zone, self.external_ip.clone(), port);
        inst.private_password = private_password;

        info!(zone = %zone, port, "launching world instance");
        self.launcher.spawn_world(
            &self.external_ip,
            port,
            map_id,
            instance_id,
            clone_id,
            inst.hard_cap,
        );

        self.instances.push(inst);
        self.instances.len() - 1
    }

    /// Rebuild a record for a world that survived a master restart and
    /// announced itself. It is already serving players, so it enters ready.
    pub fn adopt_instance(
        &mut self,
        map_id: u16,
        instance_id: u16,
        ip: String,
        port: u16,
        sys_addr: SocketAddr,
    ) -> usize {
        let zone = ZoneId {
            map_id,
            clone_id: 0,
            instance_id,
        };
        let mut inst = Instance::new(zone, ip, port);
        inst.sys_addr = Some(sys_addr);
        inst.ready = true;
        self.next_instance_id = self.next_instance_id.max(instance_id + 1);
        info!(zone = %zone, port, "adopted surviving world instance");
        self.instances.push(inst);
        self.instances.len() - 1
    }

    pub fn find_by_sys_addr(&self, addr: SocketAddr) -> Option<usize> {
        self.instances
            .iter()
            .position(|inst| inst.sys_addr == Some(addr))
    }

    /// `clone_id` is deliberately not part of this key: callers hold the
    /// identity of a running instance, not a reservation slot.
    pub fn find_by_map_and_instance(&self, map_id: u16, instance_id: u16) -> Option<usize> {
        self.instances
            .iter()
            .position(|inst| inst.zone.map_id == map_id && inst.zone.instance_id == instance_id)
    }

    pub fn find_private(&self, password: &str) -> Option<usize> {
        self.instances
            .iter()
            .position(|inst| inst.private_password.as_deref() == Some(password))
    }

    /// `(map_id, clone_id, instance_id)` triples, optionally restricted to
    /// one map.
    pub fn zone_list(&self, map_filter: Option<u16>) -> Vec<(u16, u32, u16)> {
        self.instances
            .iter()
            .filter(|inst| map_filter.is_none_or(|m| inst.zone.map_id == m))
            .map(|inst| (inst.zone.map_id, inst.zone.clone_id, inst.zone.instance_id))
            .collect()
    }

    pub fn is_port_in_use(&self, port: u16) -> bool {
        self.instances.iter().any(|inst| inst.port == port)
    }

    fn next_free_port(&self) -> u16 {
        let mut port = self.world_port_base;
        while self.is_port_in_use(port) {
            port += 1;
        }
        port
    }

    /// Mark an instance ready and run every queued request through the
    /// affirmation handshake. Ready is monotonic; a duplicate WORLD_READY
    /// is a no-op.
    pub fn ready_instance(&mut self, idx: usize, outbox: &mut Outbox) {
        if self.instances[idx].ready {
            return;
        }
        self.instances[idx].ready = true;

        let drained: Vec<TransferRequest> =
            self.instances[idx].pending_requests.drain(..).collect();
        for req in drained {
            self.request_affirmation(idx, req, outbox);
        }
    }

    /// Phase one of the handshake: tell the instance to prep for the
    /// client, park the request until the instance affirms.
    pub fn request_affirmation(&mut self, idx: usize, req: TransferRequest, outbox: &mut Outbox) {
        let inst = &mut self.instances[idx];
        match inst.sys_addr {
            Some(addr) => {
                outbox.send(
                    addr,
                    MasterResp::PrepZone {
                        zone_id: inst.zone.map_id as i32,
                    }
                    .encode(),
                );
            }
            None => {
                // No peer to prep; the wedge timeout will reroute this.
                warn!(zone = %inst.zone, "instance has no transport peer yet");
            }
        }
        inst.pending_affirmations.push(req);
    }

    /// Phase two: the instance finished prepping, hand the requester its
    /// endpoint. Unknown request IDs are stale replies and are ignored.
    pub fn affirm_transfer(&mut self, idx: usize, request_id: u64, outbox: &mut Outbox) {
        let inst = &mut self.instances[idx];
        let Some(pos) = inst
            .pending_affirmations
            .iter()
            .position(|r| r.request_id == request_id)
        else {
            debug!(request_id, zone = %inst.zone, "affirmation for unknown request");
            return;
        };
        let req = inst.pending_affirmations.remove(pos);

        outbox.send(
            req.requester,
            MasterResp::ZoneTransferResponse {
                request_id: req.request_id,
                mythran_shift: req.mythran_shift,
                map_id: inst.zone.map_id,
                instance_id: inst.zone.instance_id,
                clone_id: inst.zone.clone_id,
                ip: inst.ip.clone(),
                port: inst.port,
            }
            .encode(),
        );
    }

    /// Move every parked request off `idx` and resubmit it through normal
    /// resolution for the same zone, request IDs and requesters intact.
    pub fn redirect_pending(&mut self, idx: usize, outbox: &mut Outbox) {
        let (zone, reqs) = {
            let inst = &mut self.instances[idx];
            let mut v: Vec<TransferRequest> = inst.pending_affirmations.drain(..).collect();
            v.extend(inst.pending_requests.drain(..));
            (inst.zone, v)
        };

        for req in reqs {
            let target = self.get_instance(zone.map_id, zone.clone_id);
            if self.instances[target].ready {
                self.request_affirmation(target, req, outbox);
            } else {
                self.instances[target].enqueue_pending(req);
            }
        }
    }

    /// Per-tick bookkeeping: age the affirmation timers and recycle any
    /// instance that sat on a non-empty affirmation set for the full wedge
    /// window.
    pub fn tick(&mut self, outbox: &mut Outbox) {
        for i in 0..self.instances.len() {
            let wedged = {
                let inst = &mut self.instances[i];
                if inst.pending_affirmations.is_empty() {
                    inst.affirmation_timeout = 0;
                    false
                } else {
                    inst.affirmation_timeout += 1;
                    inst.affirmation_timeout == AFFIRMATION_WEDGE_TICKS
                }
            };

            if wedged {
                let zone = self.instances[i].zone;
                warn!(zone = %zone, "instance never affirmed, recycling it");
                if let Some(addr) = self.instances[i].sys_addr {
                    outbox.send(addr, MasterResp::Shutdown.encode());
                }
                self.instances[i].shutting_down = true;
                self.redirect_pending(i, outbox);
            }
        }
    }

    /// Drop every instance that finished shutting down; returns their
    /// identities for the event log.
    pub fn reap(&mut self) -> Vec<ZoneId> {
        let mut gone = Vec::new();
        self.instances.retain(|inst| {
            if inst.shutdown_complete {
                gone.push(inst.zone);
                false
            } else {
                true
            }
        });
        gone
    }

    pub fn remove(&mut self, idx: usize) -> Instance {
        self.instances.remove(idx)
    }

    pub fn shutdown_all(&mut self, outbox: &mut Outbox) {
        for inst in &mut self.instances {
            if let Some(addr) = inst.sys_addr {
                outbox.send(addr, MasterResp::Shutdown.encode());
            }
            inst.shutting_down = true;
        }
    }

    pub fn all_shutdown_complete(&self) -> bool {
        self.instances.iter().all(|inst| inst.shutdown_complete)
    }
}
