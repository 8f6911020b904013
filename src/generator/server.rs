use super::*;

/// One configured bitcoin RPC endpoint.
#[derive(Debug, Clone)]
pub struct RpcEndpoint {
    pub url: String,
    pub user: String,
    pub pass: String,
}

pub struct ServerConfig {
    pub endpoints: Vec<RpcEndpoint>,
    pub listen_address: String,
    pub listen_port: u16,
    pub rpc_timeout: Duration,
}

struct ServerInstance {
    endpoint: String,
    client: RpcClient,
    signals: broadcast::Sender<Signal>,
}

impl ServerInstance {
    fn signal(&self, signal: Signal) {
        let _ = self.signals.send(signal);
    }
}

pub async fn run_server(config: ServerConfig, cancel: CancellationToken) -> error::Result<()> {
    let mut connected = None;

    for rpc_endpoint in &config.endpoints {
        info!(endpoint = %rpc_endpoint.url, "probing bitcoin rpc endpoint");

        let client = build_client(rpc_endpoint, config.rpc_timeout)?;

        match client.call_raw::<u64>("getblockcount", &[]).await {
            Ok(height) => {
                info!(endpoint = %rpc_endpoint.url, height, "bitcoin rpc endpoint is alive");
                connected = Some((rpc_endpoint.url.clone(), client));
                break;
            }
            Err(source) => {
                warn!(endpoint = %rpc_endpoint.url, %source, "bitcoin rpc endpoint did not respond");
            }
        }
    }

    let Some((endpoint, client)) = connected else {
        error!("no configured bitcoin rpc endpoint came up");
        return Err(error::GeneratorError::Fatal);
    };

    let (signals, _) = broadcast::channel(64);

    let server = Arc::new(ServerInstance {
        endpoint,
        client,
        signals,
    });

    server.signal(Signal::Subscribe);

    let listener = TcpListener::bind((config.listen_address.as_str(), config.listen_port))
        .await
        .context(error::IoSnafu)?;

    info!(
        address = %config.listen_address,
        port = config.listen_port,
        "listening for stratifier requests"
    );

    loop {
        let accepted = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            accepted = listener.accept() => accepted,
        };

        let (stream, _addr) = match accepted {
            Ok(pair) => pair,
            Err(source) => {
                warn!(%source, "accept failed");
                continue;
            }
        };

        let server = server.clone();
        let cancel = cancel.clone();

        tokio::spawn(async move {
            if let Err(source) = handle_request(&server, stream, &cancel).await {
                debug!(%source, "request connection closed with error");
            }
        });
    }
}

fn build_client(endpoint: &RpcEndpoint, timeout: Duration) -> error::Result<RpcClient> {
    RpcClient::new(
        endpoint.url.clone(),
        Auth::UserPass(endpoint.user.clone(), endpoint.pass.clone()),
        None,
        None,
        Some(timeout.as_secs()),
    )
    .context(error::RpcSnafu {
        endpoint: endpoint.url.clone(),
    })
}

async fn handle_request(
    server: &ServerInstance,
    stream: TcpStream,
    cancel: &CancellationToken,
) -> error::Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let mut line = String::new();
    let n = reader.read_line(&mut line).await.context(error::IoSnafu)?;

    if n == 0 {
        return Ok(());
    }

    let line = line.trim();

    if line.is_empty() {
        return Ok(());
    }

    if line == "shutdown" {
        info!("shutdown requested by stratifier");
        server.signal(Signal::Shutdown);
        cancel.cancel();
        return Ok(());
    }

    if line == "ping" {
        write_half.write_all(b"pong\n").await.context(error::IoSnafu)?;
        return Ok(());
    }

    if line == "signals" {
        return types::forward_signals(server.signals.subscribe(), &mut write_half, cancel).await;
    }

    if line == "getbase" {
        return match server
            .client
            .call_raw::<Value>("getblocktemplate", &[json!({"rules": ["segwit"]})])
            .await
        {
            Ok(template) => write_json_line(&mut write_half, &template).await,
            Err(source) => {
                warn!(%source, endpoint = %server.endpoint, "failed to fetch block template");
                write_line(&mut write_half, "Failed").await
            }
        };
    }

    if line == "getbest" {
        return match server.client.call_raw::<String>("getbestblockhash", &[]).await {
            Ok(hash) => write_line(&mut write_half, &hash).await,
            Err(source) => {
                warn!(%source, endpoint = %server.endpoint, "failed to fetch best block hash");
                write_line(&mut write_half, "Failed").await
            }
        };
    }

    if line == "getlast" {
        return match fetch_tip_at_current_height(server).await {
            Ok(hash) => write_line(&mut write_half, &hash).await,
            Err(source) => {
                warn!(%source, endpoint = %server.endpoint, "failed to fetch current tip");
                write_line(&mut write_half, "Failed").await
            }
        };
    }

    if let Some(hex) = line.strip_prefix("submitblock:") {
        match server
            .client
            .call_raw::<Option<String>>("submitblock", &[json!(hex)])
            .await
        {
            Ok(None) => {
                info!("block submission accepted");
                server.signal(Signal::Update);
            }
            Ok(Some(reason)) => warn!(%reason, "block submission rejected"),
            Err(source) => warn!(%source, endpoint = %server.endpoint, "submitblock rpc call failed"),
        }

        return Ok(());
    }

    warn!(%line, "unrecognised request");
    Ok(())
}

async fn fetch_tip_at_current_height(server: &ServerInstance) -> error::Result<String> {
    let height: u64 = server
        .client
        .call_raw("getblockcount", &[])
        .await
        .context(error::RpcSnafu {
            endpoint: server.endpoint.clone(),
        })?;

    server
        .client
        .call_raw("getblockhash", &[json!(height)])
        .await
        .context(error::RpcSnafu {
            endpoint: server.endpoint.clone(),
        })
}

async fn write_line(writer: &mut OwnedWriteHalf, line: &str) -> error::Result<()> {
    writer
        .write_all(format!("{line}\n").as_bytes())
        .await
        .context(error::IoSnafu)
}

async fn write_json_line(writer: &mut OwnedWriteHalf, value: &Value) -> error::Result<()> {
    let mut line = serde_json::to_string(value).context(error::SerializationSnafu)?;
    line.push('\n');
    writer.write_all(line.as_bytes()).await.context(error::IoSnafu)?;
    Ok(())
}
