use std::path::PathBuf;
use std::process::Stdio;

use tokio::process::Command;
use tracing::{info, warn};

use crate::config::Config;

pub const WORLD_BIN: &str = "worldd";
pub const AUTH_BIN: &str = "authd";
pub const CHAT_BIN: &str = "chatd";

/// Spawns child server processes.
///
/// Children are detached on purpose: a world must outlive a master crash so
/// the recovery path (reconnect + SERVER_INFO) has something to recover.
/// Spawn failures are logged and otherwise ignored; a child that never
/// comes up surfaces later as the absence of a connection.
#[derive(Debug)]
pub struct Launcher {
    bin_dir: PathBuf,
    use_sudo_auth: bool,
    use_sudo_chat: bool,
    enabled: bool,
}

impl Launcher {
    pub fn new(cfg: &Config) -> Self {
        Self {
            bin_dir: cfg.bin_dir.clone(),
            use_sudo_auth: cfg.use_sudo_auth,
            use_sudo_chat: cfg.use_sudo_chat,
            enabled: true,
        }
    }

    /// A launcher that records nothing and spawns nothing.
    #[cfg(test)]
    pub fn disabled() -> Self {
        Self {
            bin_dir: PathBuf::new(),
            use_sudo_auth: false,
            use_sudo_chat: false,
            enabled: false,
        }
    }

    fn command(&self, bin: &str, sudo: bool) -> Command {
        let path = self.bin_dir.join(bin);
        let mut cmd = if sudo {
            let mut c = Command::new("sudo");
            c.arg(&path);
            c
        } else {
            Command::new(&path)
        };
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(false);
        cmd
    }

    fn spawn(&self, mut cmd: Command, what: &str) {
        if !self.enabled {
            return;
        }
        match cmd.spawn() {
            Ok(child) => info!(what, pid = child.id(), "spawned child server"),
            Err(e) => warn!(what, err = %e, "failed to spawn child server"),
        }
    }

    pub fn spawn_world(
        &self,
        ip: &str,
        port: u16,
        map_id: u16,
        instance_id: u16,
        clone_id: u32,
        max_players: u32,
    ) {
        let mut cmd = self.command(WORLD_BIN, false);
        cmd.env("WORLDD_IP", ip)
            .env("WORLDD_PORT", port.to_string())
            .env("WORLDD_ZONE", map_id.to_string())
            .env("WORLDD_INSTANCE", instance_id.to_string())
            .env("WORLDD_CLONE", clone_id.to_string())
            .env("WORLDD_MAX_CLIENTS", max_players.to_string());
        self.spawn(cmd, "world");
    }

    pub fn spawn_auth(&self) {
        let cmd = self.command(AUTH_BIN, self.use_sudo_auth);
        self.spawn(cmd, "auth");
    }

    pub fn spawn_chat(&self) {
        let cmd = self.command(CHAT_BIN, self.use_sudo_chat);
        self.spawn(cmd, "chat");
    }
}
