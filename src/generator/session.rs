use super::*;

/// Result of a successful subscribe handshake.
pub struct SubscribeOutcome {
    pub sessionid: Option<String>,
    pub enonce1: Extranonce,
    pub nonce2len: usize,
    pub no_sessionid: bool,
    pub no_params: bool,
}

/// Outcome of dispatching one inbound upstream message during normal operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatched {
    None,
    Notify,
    Diff,
}

/// Opens a fresh TCP connection to `endpoint`, bounded by `timeout`.
pub async fn connect(endpoint: &str, timeout: Duration) -> error::Result<TcpStream> {
    let stream = tokio::time::timeout(timeout, TcpStream::connect(endpoint))
        .await
        .map_err(|_| {
            error::ConnectTimeoutSnafu {
                endpoint: endpoint.to_string(),
            }
            .build()
        })?
        .context(error::ConnectSnafu {
            endpoint: endpoint.to_string(),
        })?;

    stream.set_nodelay(true).context(error::IoSnafu)?;

    Ok(stream)
}

pub(crate) async fn write_message(
    writer: &mut BufWriter<OwnedWriteHalf>,
    message: &Message,
) -> error::Result<()> {
    let mut line = serde_json::to_string(message).context(error::SerializationSnafu)?;
    line.push('\n');

    writer
        .write_all(line.as_bytes())
        .await
        .context(error::IoSnafu)?;
    writer.flush().await.context(error::IoSnafu)?;

    Ok(())
}

async fn read_line(
    reader: &mut BufReader<OwnedReadHalf>,
    timeout: Duration,
) -> error::Result<Option<String>> {
    let mut line = String::new();

    match tokio::time::timeout(timeout, reader.read_line(&mut line)).await {
        Err(_) => Ok(None),
        Ok(Ok(0)) => Err(error::ProtocolSnafu {
            message: "connection closed by upstream".to_string(),
        }
        .build()),
        Ok(Ok(_)) => Ok(Some(line)),
        Ok(Err(source)) => Err(error::GeneratorError::Io { source }),
    }
}

/// Depth-first search for a `["mining.notify", sessionid, ...]` descriptor anywhere in `value`.
fn find_sessionid(value: &Value) -> Option<String> {
    let array = value.as_array()?;

    if let Some(Value::String(method)) = array.first()
        && method.eq_ignore_ascii_case("mining.notify")
        && array.len() > 1
        && let Value::String(sessionid) = &array[1]
    {
        return Some(sessionid.clone());
    }

    array.iter().find_map(find_sessionid)
}

fn parse_subscribe_result(result: &Value, sessionid_enabled: bool) -> error::Result<SubscribeOutcome> {
    let array = result.as_array().ok_or_else(|| {
        error::ProtocolSnafu {
            message: "mining.subscribe result is not an array".to_string(),
        }
        .build()
    })?;

    ensure!(
        array.len() >= 3,
        error::ProtocolSnafu {
            message: "mining.subscribe result has fewer than 3 elements".to_string(),
        }
    );

    let sessionid = sessionid_enabled.then(|| find_sessionid(&array[0])).flatten();

    let enonce1_hex = array[1].as_str().ok_or_else(|| {
        error::ProtocolSnafu {
            message: "mining.subscribe enonce1 is not a string".to_string(),
        }
        .build()
    })?;

    let enonce1 = Extranonce::from_hex(enonce1_hex).map_err(|source| {
        error::ProtocolSnafu {
            message: format!("invalid enonce1 hex: {source}"),
        }
        .build()
    })?;

    ensure!(
        !enonce1.is_empty() && enonce1.len() <= 15,
        error::ProtocolSnafu {
            message: format!("enonce1 length {} out of range 1..=15", enonce1.len()),
        }
    );

    let nonce2len = array[2].as_u64().ok_or_else(|| {
        error::ProtocolSnafu {
            message: "mining.subscribe nonce2len is not an integer".to_string(),
        }
        .build()
    })? as usize;

    ensure!(
        (4..=8).contains(&nonce2len),
        error::ProtocolSnafu {
            message: format!("nonce2len {nonce2len} out of range 4..=8"),
        }
    );

    Ok(SubscribeOutcome {
        sessionid,
        enonce1,
        nonce2len,
        no_sessionid: false,
        no_params: false,
    })
}

/// One `mining.subscribe` attempt against an already-connected socket.
async fn try_subscribe(
    proxy_id: u64,
    client_version: &str,
    sessionid: Option<&str>,
    params_enabled: bool,
    sessionid_enabled: bool,
    timeout: Duration,
    writer: &mut BufWriter<OwnedWriteHalf>,
    reader: &mut BufReader<OwnedReadHalf>,
) -> error::Result<SubscribeOutcome> {
    let params = match (sessionid, params_enabled) {
        (Some(sessionid), true) => json!([client_version, sessionid]),
        (_, true) => json!([client_version]),
        (_, false) => json!([]),
    };

    write_message(
        writer,
        &Message::Request {
            id: Id::Number(proxy_id),
            method: "mining.subscribe".to_string(),
            params,
        },
    )
    .await?;

    let line = read_line(reader, timeout).await?.ok_or_else(|| {
        error::ProtocolSnafu {
            message: "mining.subscribe timed out".to_string(),
        }
        .build()
    })?;

    let message: Message = serde_json::from_str(&line).context(error::SerializationSnafu)?;

    match message {
        Message::Response {
            result: Some(result),
            error: None,
            ..
        } => parse_subscribe_result(&result, sessionid_enabled),
        Message::Response { error: Some(err), .. } => Err(error::ProtocolSnafu {
            message: format!("mining.subscribe error: {err}"),
        }
        .build()),
        _ => Err(error::ProtocolSnafu {
            message: "unexpected reply to mining.subscribe".to_string(),
        }
        .build()),
    }
}

/// Opens a fresh connection to `endpoint` and runs the three-attempt subscribe fallback,
/// then authorizes. Returns the live connection halves and the negotiated session outcome.
pub async fn handshake(
    endpoint: &str,
    config: &UpstreamConfig,
    id_seed: u64,
    known_sessionid: Option<String>,
    mut no_sessionid: bool,
    mut no_params: bool,
) -> error::Result<(
    BufReader<OwnedReadHalf>,
    BufWriter<OwnedWriteHalf>,
    SubscribeOutcome,
)> {
    let sessionid = known_sessionid;

    loop {
        let stream = connect(endpoint, config.timeout).await?;
        let (read_half, write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);
        let mut writer = BufWriter::new(write_half);

        let attempt = if !no_sessionid && sessionid.is_some() {
            try_subscribe(
                id_seed,
                &config.client_version,
                sessionid.as_deref(),
                true,
                !no_sessionid,
                config.timeout,
                &mut writer,
                &mut reader,
            )
            .await
        } else if !no_params {
            try_subscribe(
                id_seed,
                &config.client_version,
                None,
                true,
                !no_sessionid,
                config.timeout,
                &mut writer,
                &mut reader,
            )
            .await
        } else {
            try_subscribe(
                id_seed,
                &config.client_version,
                None,
                false,
                !no_sessionid,
                config.timeout,
                &mut writer,
                &mut reader,
            )
            .await
        };

        match attempt {
            Ok(mut outcome) => {
                outcome.no_sessionid = no_sessionid;
                outcome.no_params = no_params;

                match authorize(config, id_seed + 1, &mut writer, &mut reader).await {
                    Ok(()) => return Ok((reader, writer, outcome)),
                    Err(_) => {
                        return Err(error::AuthFailedSnafu {
                            endpoint: endpoint.to_string(),
                        }
                        .build());
                    }
                }
            }
            Err(_) if no_params => {
                return Err(error::SubscribeFailedSnafu {
                    endpoint: endpoint.to_string(),
                }
                .build());
            }
            Err(_) => {
                if !no_sessionid {
                    no_sessionid = true;
                } else {
                    no_params = true;
                }
                continue;
            }
        }
    }
}

/// Sends `mining.configure` and parses the reply. Not called anywhere in `handshake`: version
/// rolling / minimum-difficulty negotiation is a capability a caller can opt into on a live
/// connection, not part of the automatic subscribe/authorize sequence.
pub async fn configure(
    writer: &mut BufWriter<OwnedWriteHalf>,
    reader: &mut BufReader<OwnedReadHalf>,
    id: u64,
    configure: Configure,
    timeout: Duration,
) -> error::Result<ConfigureResponse> {
    write_message(
        writer,
        &Message::Request {
            id: Id::Number(id),
            method: "mining.configure".to_string(),
            params: serde_json::to_value(configure).context(error::SerializationSnafu)?,
        },
    )
    .await?;

    let line = read_line(reader, timeout).await?.ok_or_else(|| {
        error::ProtocolSnafu {
            message: "mining.configure timed out".to_string(),
        }
        .build()
    })?;

    let message: Message = serde_json::from_str(&line).context(error::SerializationSnafu)?;

    match message {
        Message::Response {
            result: Some(result),
            error: None,
            ..
        } => serde_json::from_value(result).context(error::SerializationSnafu),
        Message::Response { error: Some(err), .. } => Err(error::ProtocolSnafu {
            message: format!("mining.configure error: {err}"),
        }
        .build()),
        _ => Err(error::ProtocolSnafu {
            message: "unexpected reply to mining.configure".to_string(),
        }
        .build()),
    }
}

/// Sends `mining.authorize` and consumes lines until the matching response arrives, dispatching
/// any interleaved server-pushed notifications along the way (their side effects are discarded;
/// this runs before the `ProxyInstance` exists).
async fn authorize(
    config: &UpstreamConfig,
    id: u64,
    writer: &mut BufWriter<OwnedWriteHalf>,
    reader: &mut BufReader<OwnedReadHalf>,
) -> error::Result<()> {
    write_message(
        writer,
        &Message::Request {
            id: Id::Number(id),
            method: "mining.authorize".to_string(),
            params: serde_json::to_value(Authorize {
                username: config.auth.0.clone(),
                password: config.pass.clone(),
            })
            .context(error::SerializationSnafu)?,
        },
    )
    .await?;

    loop {
        let line = read_line(reader, config.timeout).await?.ok_or_else(|| {
            error::ProtocolSnafu {
                message: "mining.authorize timed out".to_string(),
            }
            .build()
        })?;

        let message: Message = serde_json::from_str(&line).context(error::SerializationSnafu)?;

        match message {
            Message::Notification { method, params } => {
                warn_unhandled_preauth(&method, &params);
            }
            Message::Response {
                result: Some(Value::Bool(true)),
                error: None,
                ..
            } => return Ok(()),
            Message::Response { .. } => {
                return Err(error::ProtocolSnafu {
                    message: "mining.authorize rejected".to_string(),
                }
                .build());
            }
            Message::Request { .. } => continue,
        }
    }
}

fn warn_unhandled_preauth(method: &str, _params: &Value) {
    match method {
        "mining.notify" | "mining.set_difficulty" => {
            debug!(%method, "dropping notification received before authorize completed");
        }
        _ => warn!(%method, "unhandled notification before authorize"),
    }
}

/// Classifies and dispatches one inbound upstream message, mutating the relevant registry or
/// session field. Replies to `client.get_version` directly on `writer`.
pub async fn parse_method(
    proxy: &ProxyInstance,
    writer: &mut BufWriter<OwnedWriteHalf>,
    message: Message,
) -> error::Result<Dispatched> {
    let (method, params, id) = match message {
        Message::Notification { method, params } => (method, params, None),
        Message::Request { method, params, id } => (method, params, Some(id)),
        Message::Response { .. } => {
            return Ok(Dispatched::None);
        }
    };

    match method.as_str() {
        "mining.notify" => match serde_json::from_value::<Notify>(params) {
            Ok(notify) => match proxy.notifies.lock().await.insert(notify) {
                Ok(_) => Ok(Dispatched::Notify),
                Err(source) => {
                    warn!(%source, "rejected mining.notify");
                    Ok(Dispatched::None)
                }
            },
            Err(source) => {
                warn!(%source, "failed to parse mining.notify");
                Ok(Dispatched::None)
            }
        },
        "mining.set_difficulty" => match serde_json::from_value::<SetDifficulty>(params) {
            Ok(set_difficulty) => {
                let difficulty = set_difficulty.difficulty();
                let mut session = proxy.session.write().await;
                if difficulty.as_f64() != 0.0 && difficulty != session.diff {
                    session.diff = difficulty;
                    Ok(Dispatched::Diff)
                } else {
                    Ok(Dispatched::None)
                }
            }
            Err(source) => {
                warn!(%source, "failed to parse mining.set_difficulty");
                Ok(Dispatched::None)
            }
        },
        "client.reconnect" => {
            warn!(?params, "ignoring client.reconnect (stubbed)");
            Ok(Dispatched::None)
        }
        "client.get_version" => {
            if let Some(id) = id {
                write_message(
                    writer,
                    &Message::Response {
                        id,
                        result: Some(json!(proxy.config.client_version)),
                        error: None,
                        reject_reason: None,
                    },
                )
                .await?;
            }
            Ok(Dispatched::None)
        }
        "client.show_message" => {
            info!(?params, "message from upstream");
            Ok(Dispatched::None)
        }
        _ => {
            warn!(%method, "unhandled message");
            Ok(Dispatched::None)
        }
    }
}

/// Reads one line from the upstream with `timeout`, retrying up to `retries` times on timeout.
/// `Ok(None)` means the upstream is presumed dead and a reconnect should be triggered.
pub async fn read_line_with_retries(
    reader: &mut BufReader<OwnedReadHalf>,
    timeout: Duration,
    retries: u32,
) -> error::Result<Option<String>> {
    for _ in 0..retries {
        match read_line(reader, timeout).await? {
            Some(line) => return Ok(Some(line)),
            None => continue,
        }
    }

    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn depth_first_sessionid_lookup() {
        let value = json!([
            [["mining.set_difficulty", "s1"], ["mining.notify", "s1"]],
            "f000000f",
            4
        ]);

        assert_eq!(find_sessionid(&value[0]), Some("s1".to_string()));
    }

    #[test]
    fn sessionid_lookup_absent() {
        let value = json!([["mining.set_difficulty", "s1"]]);
        assert_eq!(find_sessionid(&value), None);
    }

    #[test]
    fn happy_subscribe_result() {
        let result = json!([
            [["mining.set_difficulty", "s1"], ["mining.notify", "s1"]],
            "f000000f",
            4
        ]);

        let outcome = parse_subscribe_result(&result, true).unwrap();
        assert_eq!(outcome.sessionid, Some("s1".to_string()));
        assert_eq!(outcome.enonce1.to_hex(), "f000000f");
        assert_eq!(outcome.nonce2len, 4);
    }

    #[test]
    fn nonce2len_too_small_is_rejected() {
        let result = json!([[], "f000000f", 3]);
        assert!(parse_subscribe_result(&result, true).is_err());
    }

    #[test]
    fn nonce2len_too_large_is_rejected() {
        let result = json!([[], "f000000f", 9]);
        assert!(parse_subscribe_result(&result, true).is_err());
    }

    #[test]
    fn enonce1_too_long_is_rejected() {
        let result = json!([[], "00000000000000000000000000000000", 4]);
        assert!(parse_subscribe_result(&result, true).is_err());
    }

    #[test]
    fn short_result_is_rejected() {
        let result = json!(["f000000f", 4]);
        assert!(parse_subscribe_result(&result, true).is_err());
    }

    #[tokio::test]
    async fn configure_roundtrip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read_half, write_half) = stream.into_split();
            let mut reader = BufReader::new(read_half);
            let mut writer = BufWriter::new(write_half);

            let mut line = String::new();
            reader.read_line(&mut line).await.unwrap();
            let request: Message = serde_json::from_str(&line).unwrap();
            let Message::Request { id, method, .. } = request else {
                panic!("expected a request");
            };
            assert_eq!(method, "mining.configure");

            write_message(
                &mut writer,
                &Message::Response {
                    id,
                    result: Some(json!({"version-rolling": true, "version-rolling.mask": "1fffe000"})),
                    error: None,
                    reject_reason: None,
                },
            )
            .await
            .unwrap();
        });

        let client = TcpStream::connect(addr).await.unwrap();
        let (read_half, write_half) = client.into_split();
        let mut reader = BufReader::new(read_half);
        let mut writer = BufWriter::new(write_half);

        let response = configure(
            &mut writer,
            &mut reader,
            1,
            Configure {
                extensions: vec!["version-rolling".to_string()],
                minimum_difficulty_value: None,
                version_rolling_mask: Some("1fffe000".parse().unwrap()),
                version_rolling_min_bit_count: None,
            },
            Duration::from_secs(5),
        )
        .await
        .unwrap();

        assert!(response.version_rolling);
        assert_eq!(response.version_rolling_mask, Some("1fffe000".parse().unwrap()));

        server.await.unwrap();
    }
}
