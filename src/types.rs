//! Data structures shared by the router, the registry and remote peers.
//!
//! These types are serialised using [`serde`](https://serde.rs/).  Enum
//! discriminants travel as the integer codes operators already see in
//! `clients.json` (roles) and in command submissions (command kinds), so a
//! peer written in any language only needs to agree on the numbers.

use std::fmt;

use serde::{Deserialize, Serialize};

/// The declared role of a connecting peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Role {
    #[default]
    Unset,
    /// A managed host that executes commands.
    Endpoint,
    /// An operator console that issues commands.
    Controller,
}

impl From<Role> for u8 {
    fn from(role: Role) -> Self {
        match role {
            Role::Unset => 0,
            Role::Endpoint => 1,
            Role::Controller => 2,
        }
    }
}

impl TryFrom<u8> for Role {
    type Error = String;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(Role::Unset),
            1 => Ok(Role::Endpoint),
            2 => Ok(Role::Controller),
            other => Err(format!("unknown role code {other}")),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Role::Unset => "Not set",
            Role::Endpoint => "Endpoint",
            Role::Controller => "Controller",
        })
    }
}

/// A stable record identifying a peer across sessions.
///
/// `uuid` is assigned by the peer itself; the router never invents one.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Identity {
    pub name: String,
    pub username: String,
    pub role: Role,
    pub version: String,
    pub uuid: String,
}

impl Identity {
    pub fn new(
        name: impl Into<String>,
        username: impl Into<String>,
        role: Role,
        version: impl Into<String>,
        uuid: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            username: username.into(),
            role,
            version: version.into(),
            uuid: uuid.into(),
        }
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{name: {}, username: {}, role: {}, version: {}, uuid: {}}}",
            self.name, self.username, self.role, self.version, self.uuid
        )
    }
}

/// What a [`Command`] asks the endpoint to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum CommandKind {
    #[default]
    NotSet,
    /// Transfer a module file to the endpoint.
    InstallModule,
    /// Remove a previously installed module file.
    DeleteModule,
    /// Start a module and relay its traffic.
    RunModule,
}

impl From<CommandKind> for u8 {
    fn from(kind: CommandKind) -> Self {
        match kind {
            CommandKind::NotSet => 0,
            CommandKind::InstallModule => 1,
            CommandKind::DeleteModule => 2,
            CommandKind::RunModule => 3,
        }
    }
}

impl TryFrom<u8> for CommandKind {
    type Error = String;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(CommandKind::NotSet),
            1 => Ok(CommandKind::InstallModule),
            2 => Ok(CommandKind::DeleteModule),
            3 => Ok(CommandKind::RunModule),
            other => Err(format!("unknown command kind {other}")),
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CommandKind::NotSet => "NOT_SET",
            CommandKind::InstallModule => "INSTALL_MODULE",
            CommandKind::DeleteModule => "DELETE_MODULE",
            CommandKind::RunModule => "RUN_MODULE",
        })
    }
}

/// A unit of work a controller submits against one endpoint.
///
/// Immutable once queued: the router clones it out of the queue, it never
/// edits an entry in place.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    pub kind: CommandKind,
    /// File name of the module, relative to the module directory.
    pub module_file: String,
    /// uuid of the endpoint this command is meant for.
    pub target: String,
}

impl Command {
    pub fn new(kind: CommandKind, module_file: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            kind,
            module_file: module_file.into(),
            target: target.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_codes() {
        assert_eq!(u8::from(Role::Unset), 0);
        assert_eq!(u8::from(Role::Endpoint), 1);
        assert_eq!(u8::from(Role::Controller), 2);
        assert_eq!(Role::try_from(2), Ok(Role::Controller));
        assert!(Role::try_from(7).is_err());
    }

    #[test]
    fn test_identity_json_uses_integer_role() {
        let identity = Identity::new("web-01", "ops", Role::Endpoint, "1.0", "u-1");
        let json = serde_json::to_value(&identity).unwrap();
        assert_eq!(json["role"], 1);
        assert_eq!(json["uuid"], "u-1");
    }

    #[test]
    fn test_unknown_kind_rejected() {
        let err = serde_json::from_str::<Command>(r#"{"kind":9,"module_file":"a","target":"b"}"#);
        assert!(err.is_err());
    }

    #[test]
    fn test_display() {
        let identity = Identity::new("n", "u", Role::Controller, "2", "id");
        assert_eq!(
            identity.to_string(),
            "{name: n, username: u, role: Controller, version: 2, uuid: id}"
        );
        assert_eq!(CommandKind::DeleteModule.to_string(), "DELETE_MODULE");
    }
}
