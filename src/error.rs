use std::num::ParseIntError;
use std::{io, net};

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error, PartialEq)]
#[non_exhaustive]
pub enum Error {
    /// Indicates a stream id that the agent does not know about.
    #[error("unknown stream")]
    ErrUnknownStream,

    /// Indicates a component id outside of the stream's component range.
    #[error("unknown component")]
    ErrUnknownComponent,

    /// Indicates an operation on a candidate or pair that is no longer alive.
    #[error("invalid handle")]
    ErrInvalidHandle,

    /// Indicates gather-candidates has not been called for the stream yet.
    #[error("stream is not gathering")]
    ErrNotGathering,

    /// Indicates gather-candidates is already running for the stream.
    #[error("stream is already gathering")]
    ErrAlreadyGathering,

    /// Indicates no socket could be bound for a host candidate, e.g. when
    /// the configured port range is exhausted.
    #[error("failed to create candidate socket")]
    ErrSocketCreationFailed,

    /// Indicates a candidate duplicating an existing (base, address) pair.
    #[error("redundant candidate")]
    ErrRedundantCandidate,

    /// Indicates a non-blocking send could not make progress.
    #[error("operation would block")]
    ErrWouldBlock,

    /// Indicates both agents believed they held the same role.
    #[error("role conflict")]
    ErrRoleConflict,

    /// Indicates an inbound check failed username or integrity validation.
    #[error("authentication failed")]
    ErrAuthenticationFailed,

    /// Indicates a STUN transaction ran out of retransmissions.
    #[error("transaction timed out")]
    ErrTransactionTimeout,

    /// Indicates an operation on a closed pseudo-TCP socket.
    #[error("pseudo-tcp socket is closed")]
    ErrPseudoTcpClosed,

    /// Indicates the scheme type could not be parsed.
    #[error("unknown scheme type")]
    ErrSchemeType,

    /// Indicates query arguments are provided in a STUN URL.
    #[error("queries not supported in stun address")]
    ErrStunQuery,

    /// Indicates an malformed query is provided.
    #[error("invalid query")]
    ErrInvalidQuery,

    /// Indicates malformed hostname is provided.
    #[error("invalid hostname")]
    ErrHost,

    /// Indicates malformed port is provided.
    #[error("invalid port number")]
    ErrPort,

    /// Indicates an unsupported transport type was provided.
    #[error("invalid transport protocol type")]
    ErrProtoType,

    /// Indicates the agent is closed.
    #[error("the agent is closed")]
    ErrClosed,

    /// Indicates the remote ufrag was empty.
    #[error("remote ufrag is empty")]
    ErrRemoteUfragEmpty,

    /// Indicates the remote pwd was empty.
    #[error("remote pwd is empty")]
    ErrRemotePwdEmpty,

    /// Indicates agent was give TURN URL with an empty Username.
    #[error("username is empty")]
    ErrUsernameEmpty,

    /// Indicates agent was give TURN URL with an empty Password.
    #[error("password is empty")]
    ErrPasswordEmpty,

    /// Indicates we were unable to parse a candidate address.
    #[error("failed to parse address")]
    ErrAddressParseFailed,

    /// Indicates restart was requested while candidate gathering is running.
    #[error("agent can not be restarted when gathering")]
    ErrRestartWhenGathering,

    #[error("attribute not long enough to be a candidate")]
    ErrAttributeTooShortCandidate,
    #[error("could not parse component")]
    ErrParseComponent,
    #[error("could not parse priority")]
    ErrParsePriority,
    #[error("could not parse port")]
    ErrParsePort,
    #[error("could not parse type")]
    ErrParseType,
    #[error("unknown candidate type")]
    ErrUnknownCandidateType,
    #[error("unable to determine networkType")]
    ErrDetermineNetworkType,
    #[error("username mismatch")]
    ErrMismatchUsername,
    #[error("invalid url")]
    ErrInvalidUrl,

    #[error("parse int: {0}")]
    ParseInt(#[from] ParseIntError),
    #[error("parse addr: {0}")]
    ParseIp(#[from] net::AddrParseError),
    #[error("{0}")]
    Io(#[source] IoError),
    #[error("{0}")]
    Util(#[from] util::Error),
    #[error("{0}")]
    Stun(#[from] stun::Error),
    #[error("{0}")]
    ParseUrl(#[from] url::ParseError),
    #[error("{0}")]
    Turn(#[from] turn::Error),

    #[error("{0}")]
    Other(String),
}

#[derive(Debug, Error)]
#[error("io error: {0}")]
pub struct IoError(#[from] pub io::Error);

// Workaround for wanting PartialEq for io::Error.
impl PartialEq for IoError {
    fn eq(&self, other: &Self) -> bool {
        self.0.kind() == other.0.kind()
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(IoError(e))
    }
}
