use std::collections::VecDeque;
use std::net::SocketAddr;

/// Identity of one world slice: which map, which parallel clone of it,
/// which running copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ZoneId {
    pub map_id: u16,
    pub clone_id: u32,
    pub instance_id: u16,
}

impl std::fmt::Display for ZoneId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.map_id, self.clone_id, self.instance_id)
    }
}

/// One client's in-flight request to enter a zone. Moved between the
/// pending queue and the affirmation set; never aliased.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    pub request_id: u64,
    pub mythran_shift: bool,
    pub requester: SocketAddr,
}

pub const DEFAULT_SOFT_CAP: u32 = 12;
pub const DEFAULT_HARD_CAP: u32 = 12;

/// One running world-server child process, as the master sees it.
#[derive(Debug)]
pub struct Instance {
    pub zone: ZoneId,
    pub ip: String,
    pub port: u16,
    /// Transport identity of the child once it has connected and announced
    /// itself; a freshly spawned child has none yet.
    pub sys_addr: Option<SocketAddr>,
    pub ready: bool,
    pub shutting_down: bool,
    pub shutdown_complete: bool,
    pub soft_cap: u32,
    pub hard_cap: u32,
    pub player_count: u32,
    pub pending_requests: VecDeque<TransferRequest>,
    pub pending_affirmations: Vec<TransferRequest>,
    pub affirmation_timeout: u32,
    pub private_password: Option<String>,
}

impl Instance {
    pub fn new(zone: ZoneId, ip: String, port: u16) -> Self {
        Self {
            zone,
            ip,
            port,
            sys_addr: None,
            ready: false,
            shutting_down: false,
            shutdown_complete: false,
            soft_cap: DEFAULT_SOFT_CAP,
            hard_cap: DEFAULT_HARD_CAP,
            player_count: 0,
            pending_requests: VecDeque::new(),
            pending_affirmations: Vec::new(),
            affirmation_timeout: 0,
            private_password: None,
        }
    }

    pub fn is_private(&self) -> bool {
        self.private_password.is_some()
    }

    /// Whether zone resolution may hand this instance out for
    /// `(map_id, clone_id)`.
    pub fn accepts(&self, map_id: u16, clone_id: u32) -> bool {
        self.zone.map_id == map_id
            && self.zone.clone_id == clone_id
            && !self.shutting_down
            && !self.shutdown_complete
            && !self.is_private()
            && self.player_count < self.soft_cap
    }

    pub fn enqueue_pending(&mut self, req: TransferRequest) {
        debug_assert!(!self.shutting_down, "enqueue on a draining instance");
        debug_assert!(!self.ready, "pending queue is only for unready instances");
        self.pending_requests.push_back(req);
    }

    pub fn add_player(&mut self) {
        self.player_count += 1;
    }

    pub fn remove_player(&mut self) {
        self.player_count = self.player_count.saturating_sub(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inst(map_id: u16, clone_id: u32) -> Instance {
        Instance::new(
            ZoneId {
                map_id,
                clone_id,
                instance_id: 1,
            },
            "127.0.0.1".to_string(),
            3000,
        )
    }

    #[test]
    fn accepts_matches_map_and_clone() {
        let i = inst(1200, 4);
        assert!(i.accepts(1200, 4));
        assert!(!i.accepts(1200, 5));
        assert!(!i.accepts(1201, 4));
    }

    #[test]
    fn accepts_excludes_draining_private_and_full() {
        let mut i = inst(1200, 0);
        i.shutting_down = true;
        assert!(!i.accepts(1200, 0));

        let mut i = inst(1200, 0);
        i.private_password = Some("hunter2".to_string());
        assert!(!i.accepts(1200, 0));

        let mut i = inst(1200, 0);
        i.player_count = i.soft_cap;
        assert!(!i.accepts(1200, 0));
    }

    #[test]
    fn player_count_never_underflows() {
        let mut i = inst(1200, 0);
        i.remove_player();
        assert_eq!(i.player_count, 0);
        i.add_player();
        i.add_player();
        i.remove_player();
        assert_eq!(i.player_count, 1);
    }
}
