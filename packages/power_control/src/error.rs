/// Errors raised by the wake and power-off collaborators.
///
/// Reachability probes never produce one of these: every probe failure
/// collapses into `reachable = false`.
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("invalid hardware address {address:?}: {reason}")]
    InvalidHardwareAddress { address: String, reason: String },

    #[error("failed to transmit wake packet to {target}: {source}")]
    Transmission {
        target: String,
        #[source]
        source: std::io::Error,
    },

    #[error("could not open remote session to {host}: {detail}")]
    Connection { host: String, detail: String },

    #[error("remote authentication rejected for {user}@{host}")]
    Authentication { host: String, user: String },

    #[error("remote command timed out after {secs}s")]
    CommandTimeout { secs: u64 },

    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
}
