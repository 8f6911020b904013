use super::*;

pub type Result<T, E = GeneratorError> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum GeneratorError {
    #[snafu(display("failed to connect to {endpoint}: {source}"))]
    Connect {
        endpoint: String,
        source: std::io::Error,
    },

    #[snafu(display("connect to {endpoint} timed out"))]
    ConnectTimeout { endpoint: String },

    #[snafu(display("protocol error: {message}"))]
    Protocol { message: String },

    #[snafu(display("mining.authorize was rejected by {endpoint}"))]
    AuthFailed { endpoint: String },

    #[snafu(display("mining.subscribe failed against {endpoint}"))]
    SubscribeFailed { endpoint: String },

    #[snafu(display("no configured upstream came up"))]
    Fatal,

    #[snafu(display("io error: {source}"))]
    Io { source: std::io::Error },

    #[snafu(display("serialization error: {source}"))]
    Serialization { source: serde_json::Error },

    #[snafu(display("bitcoin rpc call to {endpoint} failed: {source}"))]
    Rpc {
        endpoint: String,
        source: bitcoind_async_client::error::ClientError,
    },
}
