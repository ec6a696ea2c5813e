use bytes::Bytes;

use crate::cursor::{put_fixed_str, put_var_str, Cursor};
use crate::{header, split_header, WireError, HEADER_LEN};

// Requests (fleet -> master).
pub const MSG_REQUEST_PERSISTENT_ID: u8 = 0x01;
pub const MSG_REQUEST_ZONE_TRANSFER: u8 = 0x02;
pub const MSG_SERVER_INFO: u8 = 0x03;
pub const MSG_SET_SESSION_KEY: u8 = 0x04;
pub const MSG_REQUEST_SESSION_KEY: u8 = 0x05;
pub const MSG_PLAYER_ADDED: u8 = 0x06;
pub const MSG_PLAYER_REMOVED: u8 = 0x07;
pub const MSG_CREATE_PRIVATE_ZONE: u8 = 0x08;
pub const MSG_REQUEST_PRIVATE_ZONE: u8 = 0x09;
pub const MSG_WORLD_READY: u8 = 0x0a;
/// Travels both ways: a world may ask the master to pre-provision a zone,
/// and the master sends it to a world to start per-client prep.
pub const MSG_PREP_ZONE: u8 = 0x0b;
pub const MSG_AFFIRM_TRANSFER_RESPONSE: u8 = 0x0c;
pub const MSG_SHUTDOWN_RESPONSE: u8 = 0x0d;
pub const MSG_SHUTDOWN_UNIVERSE: u8 = 0x0e;
pub const MSG_SHUTDOWN_INSTANCE: u8 = 0x0f;
pub const MSG_GET_INSTANCES: u8 = 0x10;

// Responses (master -> fleet).
pub const MSG_PERSISTENT_ID_RESPONSE: u8 = 0x81;
pub const MSG_ZONE_TRANSFER_RESPONSE: u8 = 0x82;
pub const MSG_NEW_SESSION_ALERT: u8 = 0x83;
pub const MSG_SESSION_KEY_RESPONSE: u8 = 0x84;
pub const MSG_SHUTDOWN: u8 = 0x85;
pub const MSG_RESPOND_INSTANCES: u8 = 0x86;

// Fixed string widths.
const IP_WIDTH: usize = 24;
const SET_SESSION_USERNAME_WIDTH: usize = 12;
const REQUEST_SESSION_USERNAME_WIDTH: usize = 8;
const SESSION_RESPONSE_USERNAME_WIDTH: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerRole {
    Master,
    Auth,
    Chat,
    World,
}

impl ServerRole {
    pub fn as_u32(self) -> u32 {
        match self {
            ServerRole::Master => 0,
            ServerRole::Auth => 1,
            ServerRole::Chat => 2,
            ServerRole::World => 3,
        }
    }
}

impl TryFrom<u32> for ServerRole {
    type Error = WireError;

    fn try_from(v: u32) -> Result<Self, WireError> {
        match v {
            0 => Ok(ServerRole::Master),
            1 => Ok(ServerRole::Auth),
            2 => Ok(ServerRole::Chat),
            3 => Ok(ServerRole::World),
            _ => Err(WireError::Malformed("unknown server role")),
        }
    }
}

/// Messages the master accepts from the fleet.
#[derive(Debug, Clone, PartialEq)]
pub enum MasterReq {
    RequestPersistentId {
        request_id: u64,
    },
    RequestZoneTransfer {
        request_id: u64,
        mythran_shift: bool,
        zone_id: u32,
        clone_id: u32,
    },
    ServerInfo {
        port: u32,
        zone_id: u32,
        instance_id: u32,
        role: ServerRole,
        ip: String,
    },
    SetSessionKey {
        session_key: u32,
        username: String,
    },
    RequestSessionKey {
        username: String,
    },
    PlayerAdded {
        map_id: u16,
        instance_id: u16,
    },
    PlayerRemoved {
        map_id: u16,
        instance_id: u16,
    },
    CreatePrivateZone {
        map_id: u32,
        clone_id: u32,
        password: String,
    },
    RequestPrivateZone {
        request_id: u64,
        mythran_shift: bool,
        password: String,
    },
    WorldReady {
        map_id: u16,
        instance_id: u16,
    },
    PrepZone {
        zone_id: i32,
    },
    AffirmTransferResponse {
        request_id: u64,
    },
    ShutdownResponse,
    ShutdownUniverse,
    ShutdownInstance {
        zone_id: u32,
        instance_id: u16,
    },
    GetInstances {
        object_id: u64,
        zone_id: Option<u16>,
        responding_zone_id: u16,
        responding_instance_id: u16,
    },
}

/// Messages the master emits to the fleet.
#[derive(Debug, Clone, PartialEq)]
pub enum MasterResp {
    PersistentIdResponse {
        request_id: u64,
        object_id: u32,
    },
    ZoneTransferResponse {
        request_id: u64,
        mythran_shift: bool,
        map_id: u16,
        instance_id: u16,
        clone_id: u32,
        ip: String,
        port: u16,
    },
    NewSessionAlert {
        session_key: u32,
        username: String,
    },
    SessionKeyResponse {
        session_key: u32,
        username: String,
    },
    PrepZone {
        zone_id: i32,
    },
    Shutdown,
    RespondInstances {
        object_id: u64,
        /// `(map_id, clone_id, instance_id)` per running instance.
        zones: Vec<(u16, u32, u16)>,
    },
}

pub fn parse_req(frame: Bytes) -> Result<MasterReq, WireError> {
    let (kind, payload) = split_header(&frame)?;
    let mut c = Cursor::new(payload);

    match kind {
        MSG_REQUEST_PERSISTENT_ID => Ok(MasterReq::RequestPersistentId {
            request_id: c.u64_le()?,
        }),
        MSG_REQUEST_ZONE_TRANSFER => Ok(MasterReq::RequestZoneTransfer {
            request_id: c.u64_le()?,
            mythran_shift: c.flag()?,
            zone_id: c.u32_le()?,
            clone_id: c.u32_le()?,
        }),
        MSG_SERVER_INFO => Ok(MasterReq::ServerInfo {
            port: c.u32_le()?,
            zone_id: c.u32_le()?,
            instance_id: c.u32_le()?,
            role: ServerRole::try_from(c.u32_le()?)?,
            ip: c.fixed_str(IP_WIDTH)?,
        }),
        MSG_SET_SESSION_KEY => Ok(MasterReq::SetSessionKey {
            session_key: c.u32_le()?,
            username: c.fixed_str(SET_SESSION_USERNAME_WIDTH)?,
        }),
        MSG_REQUEST_SESSION_KEY => Ok(MasterReq::RequestSessionKey {
            username: c.fixed_str(REQUEST_SESSION_USERNAME_WIDTH)?,
        }),
        MSG_PLAYER_ADDED => Ok(MasterReq::PlayerAdded {
            map_id: c.u16_le()?,
            instance_id: c.u16_le()?,
        }),
        MSG_PLAYER_REMOVED => Ok(MasterReq::PlayerRemoved {
            map_id: c.u16_le()?,
            instance_id: c.u16_le()?,
        }),
        MSG_CREATE_PRIVATE_ZONE => Ok(MasterReq::CreatePrivateZone {
            map_id: c.u32_le()?,
            clone_id: c.u32_le()?,
            password: c.var_str()?,
        }),
        MSG_REQUEST_PRIVATE_ZONE => Ok(MasterReq::RequestPrivateZone {
            request_id: c.u64_le()?,
            mythran_shift: c.flag()?,
            password: c.var_str()?,
        }),
        MSG_WORLD_READY => Ok(MasterReq::WorldReady {
            map_id: c.u16_le()?,
            instance_id: c.u16_le()?,
        }),
        MSG_PREP_ZONE => Ok(MasterReq::PrepZone {
            zone_id: c.i32_le()?,
        }),
        MSG_AFFIRM_TRANSFER_RESPONSE => Ok(MasterReq::AffirmTransferResponse {
            request_id: c.u64_le()?,
        }),
        MSG_SHUTDOWN_RESPONSE => Ok(MasterReq::ShutdownResponse),
        MSG_SHUTDOWN_UNIVERSE => Ok(MasterReq::ShutdownUniverse),
        MSG_SHUTDOWN_INSTANCE => Ok(MasterReq::ShutdownInstance {
            zone_id: c.u32_le()?,
            instance_id: c.u16_le()?,
        }),
        MSG_GET_INSTANCES => {
            let object_id = c.u64_le()?;
            let zone_id = if c.flag()? { Some(c.u16_le()?) } else { None };
            Ok(MasterReq::GetInstances {
                object_id,
                zone_id,
                responding_zone_id: c.u16_le()?,
                responding_instance_id: c.u16_le()?,
            })
        }
        other => Err(WireError::UnknownKind(other)),
    }
}

pub fn parse_resp(frame: Bytes) -> Result<MasterResp, WireError> {
    let (kind, payload) = split_header(&frame)?;
    let mut c = Cursor::new(payload);

    match kind {
        MSG_PERSISTENT_ID_RESPONSE => Ok(MasterResp::PersistentIdResponse {
            request_id: c.u64_le()?,
            object_id: c.u32_le()?,
        }),
        MSG_ZONE_TRANSFER_RESPONSE => Ok(MasterResp::ZoneTransferResponse {
            request_id: c.u64_le()?,
            mythran_shift: c.flag()?,
            map_id: c.u16_le()?,
            instance_id: c.u16_le()?,
            clone_id: c.u32_le()?,
            ip: c.fixed_str(IP_WIDTH)?,
            port: c.u16_le()?,
        }),
        MSG_NEW_SESSION_ALERT => Ok(MasterResp::NewSessionAlert {
            session_key: c.u32_le()?,
            username: c.var_str()?,
        }),
        MSG_SESSION_KEY_RESPONSE => Ok(MasterResp::SessionKeyResponse {
            session_key: c.u32_le()?,
            username: c.fixed_str(SESSION_RESPONSE_USERNAME_WIDTH)?,
        }),
        MSG_PREP_ZONE => Ok(MasterResp::PrepZone {
            zone_id: c.i32_le()?,
        }),
        MSG_SHUTDOWN => Ok(MasterResp::Shutdown),
        MSG_RESPOND_INSTANCES => {
            let object_id = c.u64_le()?;
            let count = c.u32_le()? as usize;
            let mut zones = Vec::with_capacity(count.min(1024));
            for _ in 0..count {
                let map_id = c.u16_le()?;
                let clone_id = c.u32_le()?;
                let instance_id = c.u16_le()?;
                zones.push((map_id, clone_id, instance_id));
            }
            Ok(MasterResp::RespondInstances { object_id, zones })
        }
        other => Err(WireError::UnknownKind(other)),
    }
}

impl MasterReq {
    pub fn kind(&self) -> u8 {
        match self {
            MasterReq::RequestPersistentId { .. } => MSG_REQUEST_PERSISTENT_ID,
            MasterReq::RequestZoneTransfer { .. } => MSG_REQUEST_ZONE_TRANSFER,
            MasterReq::ServerInfo { .. } => MSG_SERVER_INFO,
            MasterReq::SetSessionKey { .. } => MSG_SET_SESSION_KEY,
            MasterReq::RequestSessionKey { .. } => MSG_REQUEST_SESSION_KEY,
            MasterReq::PlayerAdded { .. } => MSG_PLAYER_ADDED,
            MasterReq::PlayerRemoved { .. } => MSG_PLAYER_REMOVED,
            MasterReq::CreatePrivateZone { .. } => MSG_CREATE_PRIVATE_ZONE,
            MasterReq::RequestPrivateZone { .. } => MSG_REQUEST_PRIVATE_ZONE,
            MasterReq::WorldReady { .. } => MSG_WORLD_READY,
            MasterReq::PrepZone { .. } => MSG_PREP_ZONE,
            MasterReq::AffirmTransferResponse { .. } => MSG_AFFIRM_TRANSFER_RESPONSE,
            MasterReq::ShutdownResponse => MSG_SHUTDOWN_RESPONSE,
            MasterReq::ShutdownUniverse => MSG_SHUTDOWN_UNIVERSE,
            MasterReq::ShutdownInstance { .. } => MSG_SHUTDOWN_INSTANCE,
            MasterReq::GetInstances { .. } => MSG_GET_INSTANCES,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut out = Vec::with_capacity(HEADER_LEN + 32);
        out.extend_from_slice(&header(self.kind()));

        match self {
            MasterReq::RequestPersistentId { request_id } => {
                out.extend_from_slice(&request_id.to_le_bytes());
            }
            MasterReq::RequestZoneTransfer {
                request_id,
                mythran_shift,
                zone_id,
                clone_id,
            } => {
                out.extend_from_slice(&request_id.to_le_bytes());
                out.push(*mythran_shift as u8);
                out.extend_from_slice(&zone_id.to_le_bytes());
                out.extend_from_slice(&clone_id.to_le_bytes());
            }
            MasterReq::ServerInfo {
                port,
                zone_id,
                instance_id,
                role,
                ip,
            } => {
                out.extend_from_slice(&port.to_le_bytes());
                out.extend_from_slice(&zone_id.to_le_bytes());
                out.extend_from_slice(&instance_id.to_le_bytes());
                out.extend_from_slice(&role.as_u32().to_le_bytes());
                put_fixed_str(&mut out, ip, IP_WIDTH);
            }
            MasterReq::SetSessionKey {
                session_key,
                username,
            } => {
                out.extend_from_slice(&session_key.to_le_bytes());
                put_fixed_str(&mut out, username, SET_SESSION_USERNAME_WIDTH);
            }
            MasterReq::RequestSessionKey { username } => {
                put_fixed_str(&mut out, username, REQUEST_SESSION_USERNAME_WIDTH);
            }
            MasterReq::PlayerAdded {
                map_id,
                instance_id,
            }
            | MasterReq::PlayerRemoved {
                map_id,
                instance_id,
            } => {
                out.extend_from_slice(&map_id.to_le_bytes());
                out.extend_from_slice(&instance_id.to_le_bytes());
            }
            MasterReq::CreatePrivateZone {
                map_id,
                clone_id,
                password,
            } => {
                out.extend_from_slice(&map_id.to_le_bytes());
                out.extend_from_slice(&clone_id.to_le_bytes());
                put_var_str(&mut out, password);
            }
            MasterReq::RequestPrivateZone {
                request_id,
                mythran_shift,
                password,
            } => {
                out.extend_from_slice(&request_id.to_le_bytes());
                out.push(*mythran_shift as u8);
                put_var_str(&mut out, password);
            }
            MasterReq::WorldReady {
                map_id,
                instance_id,
            } => {
                out.extend_from_slice(&map_id.to_le_bytes());
                out.extend_from_slice(&instance_id.to_le_bytes());
            }
            MasterReq::PrepZone { zone_id } => {
                out.extend_from_slice(&zone_id.to_le_bytes());
            }
            MasterReq::AffirmTransferResponse { request_id } => {
                out.extend_from_slice(&request_id.to_le_bytes());
            }
            MasterReq::ShutdownResponse | MasterReq::ShutdownUniverse => {}
            MasterReq::ShutdownInstance {
                zone_id,
                instance_id,
            } => {
                out.extend_from_slice(&zone_id.to_le_bytes());
                out.extend_from_slice(&instance_id.to_le_bytes());
            }
            MasterReq::GetInstances {
                object_id,
                zone_id,
                responding_zone_id,
                responding_instance_id,
            } => {
                out.extend_from_slice(&object_id.to_le_bytes());
                match zone_id {
                    Some(z) => {
                        out.push(1);
                        out.extend_from_slice(&z.to_le_bytes());
                    }
                    None => out.push(0),
                }
                out.extend_from_slice(&responding_zone_id.to_le_bytes());
                out.extend_from_slice(&responding_instance_id.to_le_bytes());
            }
        }

        Bytes::from(out)
    }
}

impl MasterResp {
    pub fn kind(&self) -> u8 {
        match self {
            MasterResp::PersistentIdResponse { .. } => MSG_PERSISTENT_ID_RESPONSE,
            MasterResp::ZoneTransferResponse { .. } => MSG_ZONE_TRANSFER_RESPONSE,
            MasterResp::NewSessionAlert { .. } => MSG_NEW_SESSION_ALERT,
            MasterResp::SessionKeyResponse { .. } => MSG_SESSION_KEY_RESPONSE,
            MasterResp::PrepZone { .. } => MSG_PREP_ZONE,
            MasterResp::Shutdown => MSG_SHUTDOWN,
            MasterResp::RespondInstances { .. } => MSG_RESPOND_INSTANCES,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut out = Vec::with_capacity(HEADER_LEN + 32);
        out.extend_from_slice(&header(self.kind()));

        match self {
            MasterResp::PersistentIdResponse {
                request_id,
                object_id,
            } => {
                out.extend_from_slice(&request_id.to_le_bytes());
                out.extend_from_slice(&object_id.to_le_bytes());
            }
            MasterResp::ZoneTransferResponse {
                request_id,
                mythran_shift,
                map_id,
                instance_id,
                clone_id,
                ip,
                port,
            } => {
                out.extend_from_slice(&request_id.to_le_bytes());
                out.push(*mythran_shift as u8);
                out.extend_from_slice(&map_id.to_le_bytes());
                out.extend_from_slice(&instance_id.to_le_bytes());
                out.extend_from_slice(&clone_id.to_le_bytes());
                put_fixed_str(&mut out, ip, IP_WIDTH);
                out.extend_from_slice(&port.to_le_bytes());
            }
            MasterResp::NewSessionAlert {
                session_key,
                username,
            } => {
                out.extend_from_slice(&session_key.to_le_bytes());
                put_var_str(&mut out, username);
            }
            MasterResp::SessionKeyResponse {
                session_key,
                username,
            } => {
                out.extend_from_slice(&session_key.to_le_bytes());
                put_fixed_str(&mut out, username, SESSION_RESPONSE_USERNAME_WIDTH);
            }
            MasterResp::PrepZone { zone_id } => {
                out.extend_from_slice(&zone_id.to_le_bytes());
            }
            MasterResp::Shutdown => {}
            MasterResp::RespondInstances { object_id, zones } => {
                out.extend_from_slice(&object_id.to_le_bytes());
                out.extend_from_slice(&(zones.len() as u32).to_le_bytes());
                for (map_id, clone_id, instance_id) in zones {
                    out.extend_from_slice(&map_id.to_le_bytes());
                    out.extend_from_slice(&clone_id.to_le_bytes());
                    out.extend_from_slice(&instance_id.to_le_bytes());
                }
            }
        }

        Bytes::from(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SUBSYS_MASTER;

    #[test]
    fn header_carries_subsystem_and_kind() {
        let frame = MasterReq::ShutdownUniverse.encode();
        assert_eq!(frame.len(), HEADER_LEN);
        assert_eq!(frame[1], SUBSYS_MASTER);
        assert_eq!(frame[3], MSG_SHUTDOWN_UNIVERSE);
    }

    #[test]
    fn rejects_wrong_subsystem() {
        let mut frame = MasterReq::ShutdownUniverse.encode().to_vec();
        frame[1] = 0x07;
        assert_eq!(
            parse_req(Bytes::from(frame)),
            Err(WireError::BadSubsystem(0x07))
        );
    }

    #[test]
    fn rejects_unknown_kind() {
        let mut frame = MasterReq::ShutdownUniverse.encode().to_vec();
        frame[3] = 0x7f;
        assert_eq!(parse_req(Bytes::from(frame)), Err(WireError::UnknownKind(0x7f)));
    }

    #[test]
    fn zone_transfer_request_round_trips() {
        let req = MasterReq::RequestZoneTransfer {
            request_id: 7,
            mythran_shift: false,
            zone_id: 1200,
            clone_id: 0,
        };
        assert_eq!(parse_req(req.encode()).unwrap(), req);
    }

    #[test]
    fn server_info_carries_fixed_width_ip() {
        let req = MasterReq::ServerInfo {
            port: 3001,
            zone_id: 1200,
            instance_id: 4,
            role: ServerRole::World,
            ip: "10.0.0.5".to_string(),
        };
        let frame = req.encode();
        // header + 4 u32 fields + 24-byte ip field
        assert_eq!(frame.len(), HEADER_LEN + 16 + 24);
        assert_eq!(parse_req(frame).unwrap(), req);
    }

    #[test]
    fn set_session_key_truncates_long_usernames() {
        let req = MasterReq::SetSessionKey {
            session_key: 100,
            username: "a_very_long_username".to_string(),
        };
        match parse_req(req.encode()).unwrap() {
            MasterReq::SetSessionKey {
                session_key,
                username,
            } => {
                assert_eq!(session_key, 100);
                assert_eq!(username, "a_very_long_");
                assert_eq!(username.len(), 12);
            }
            other => panic!("unexpected decode: {other:?}"),
        }
    }

    #[test]
    fn private_zone_password_is_length_prefixed() {
        let req = MasterReq::CreatePrivateZone {
            map_id: 1300,
            clone_id: 5,
            password: "hunter2".to_string(),
        };
        assert_eq!(parse_req(req.encode()).unwrap(), req);

        let req = MasterReq::RequestPrivateZone {
            request_id: 9,
            mythran_shift: true,
            password: "hunter2".to_string(),
        };
        assert_eq!(parse_req(req.encode()).unwrap(), req);
    }

    #[test]
    fn get_instances_optional_zone_filter() {
        let with = MasterReq::GetInstances {
            object_id: 42,
            zone_id: Some(1200),
            responding_zone_id: 1000,
            responding_instance_id: 1,
        };
        assert_eq!(parse_req(with.encode()).unwrap(), with);

        let without = MasterReq::GetInstances {
            object_id: 42,
            zone_id: None,
            responding_zone_id: 1000,
            responding_instance_id: 1,
        };
        assert_eq!(parse_req(without.encode()).unwrap(), without);
    }

    #[test]
    fn zone_transfer_response_round_trips() {
        let resp = MasterResp::ZoneTransferResponse {
            request_id: 7,
            mythran_shift: false,
            map_id: 1200,
            instance_id: 3,
            clone_id: 0,
            ip: "10.0.0.5".to_string(),
            port: 3000,
        };
        assert_eq!(parse_resp(resp.encode()).unwrap(), resp);
    }

    #[test]
    fn respond_instances_round_trips() {
        let resp = MasterResp::RespondInstances {
            object_id: 9000,
            zones: vec![(1000, 0, 1), (1200, 4, 2)],
        };
        assert_eq!(parse_resp(resp.encode()).unwrap(), resp);
    }

    #[test]
    fn truncated_payload_is_short_not_panic() {
        let frame = MasterReq::RequestZoneTransfer {
            request_id: 7,
            mythran_shift: false,
            zone_id: 1200,
            clone_id: 0,
        }
        .encode();
        let cut = frame.slice(..frame.len() - 3);
        assert!(matches!(
            parse_req(cut),
            Err(WireError::Short { .. })
        ));
    }
}
