//! The generator: the upstream-facing bridge between one local stratifier and either a set of
//! upstream stratum pools (proxy mode) or a set of bitcoin RPC endpoints (server mode).
use {
    bitcoind_async_client::{Auth, Client as RpcClient},
    serde_json::{Value, json},
    snafu::{ResultExt, Snafu, ensure},
    std::{
        collections::{HashMap, VecDeque},
        sync::{
            Arc,
            atomic::{AtomicU64, Ordering},
        },
        time::{Duration, Instant},
    },
    stratum::{
        Authorize, Configure, ConfigureResponse, Difficulty, Extranonce, Id, JsonRpcError,
        MerkleNode, Message, Nbits, Nonce, Notify, Ntime, PrevHash, SetDifficulty, Username,
        Version,
    },
    tokio::{
        io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter},
        net::{
            TcpListener, TcpStream,
            tcp::{OwnedReadHalf, OwnedWriteHalf},
        },
        sync::{
            Mutex, Notify as TokioNotify, RwLock,
            broadcast::{self, error::RecvError},
        },
        task::JoinSet,
    },
    tokio_util::sync::CancellationToken,
    tracing::{debug, error, info, warn},
};

pub mod error;
mod proxy;
mod server;
mod session;
mod types;

pub const USER_AGENT: &str = concat!("generator/", env!("CARGO_PKG_VERSION"));

pub use {
    proxy::{ProxyConfig, run_proxy},
    server::{RpcEndpoint, ServerConfig, run_server},
    session::configure,
    types::{
        NotifyInstance, NotifyRegistry, OutboundMsg, ProxyInstance, ShareMsg, ShareRegistry,
        SessionState, Signal, UpstreamConfig,
    },
};
