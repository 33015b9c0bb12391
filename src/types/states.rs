use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// Where a connection is in its life.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Handshaking,
    Ready,
    Closing,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use ConnectionState::*;

        f.write_str(match self {
            Disconnected => "disconnected",
            Connecting => "connecting",
            Handshaking => "handshaking",
            Ready => "ready",
            Closing => "closing",
        })
    }
}

/// Which half of the protocol a client speaks. Consumers identify as workers
/// during the handshake; producers don't.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum Role {
    #[default]
    Producer,
    Consumer,
    Both,
}

impl Role {
    /// Whether a client in this role may issue commands reserved for `other`.
    pub fn permits(self, other: Role) -> bool {
        self == Role::Both || self == other
    }

    pub fn is_worker(self) -> bool {
        self.permits(Role::Consumer)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            Role::Producer => "producer",
            Role::Consumer => "consumer",
            Role::Both => "both",
        })
    }
}

impl FromStr for Role {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "producer" => Ok(Role::Producer),
            "consumer" => Ok(Role::Consumer),
            "both" => Ok(Role::Both),
            _ => Err(Error::config(format!(
                "unknown role {s:?}, expected producer, consumer or both"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_permissions() {
        assert!(Role::Both.permits(Role::Producer));
        assert!(Role::Both.permits(Role::Consumer));
        assert!(Role::Consumer.permits(Role::Consumer));
        assert!(!Role::Consumer.permits(Role::Producer));
        assert!(!Role::Producer.is_worker());
        assert_eq!("both".parse::<Role>().unwrap(), Role::Both);
        assert!("admin".parse::<Role>().is_err());
    }
}
