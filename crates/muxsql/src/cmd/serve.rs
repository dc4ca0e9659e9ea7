use std::sync::Arc;

use muxsql::mux::{ConnectionConfig, Listener};
use muxsql::{AccessPolicy, DbService};

use crate::cmd::{parse_duration, ServeArgs, DEFAULT_LISTEN};
use crate::exit::{credential_error, io_error, mux_error, CliError, CliResult, SUCCESS, USAGE};

pub fn run(args: ServeArgs) -> CliResult<i32> {
    let connection = connection_config(&args)?;
    let policy = AccessPolicy {
        schema_requires_root: args.schema_requires_root,
    };
    let config = args.storage.server_config(policy);
    tracing::info!(?config, "starting server");
    let service = Arc::new(
        config
            .service()
            .map_err(|err| credential_error("invalid configuration", err))?,
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| io_error("runtime setup failed", err))?;

    runtime.block_on(async move {
        let listener = bind(&args, service, connection).await?;
        let shutdown = listener.shutdown_token();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => tracing::info!("interrupt received; shutting down"),
                Err(err) => tracing::warn!(error = %err, "could not listen for ctrl-c"),
            }
            shutdown.cancel();
        });
        listener
            .run()
            .await
            .map_err(|err| mux_error("server failed", err))
    })?;

    Ok(SUCCESS)
}

async fn bind(
    args: &ServeArgs,
    service: Arc<DbService>,
    config: ConnectionConfig,
) -> CliResult<Listener<DbService>> {
    #[cfg(unix)]
    if let Some(path) = &args.socket {
        return Listener::bind_unix(path, service, config)
            .map_err(|err| mux_error("bind failed", err));
    }
    #[cfg(not(unix))]
    if args.socket.is_some() {
        return Err(CliError::new(USAGE, "--socket requires a unix platform"));
    }

    let addr = args.listen.as_deref().unwrap_or(DEFAULT_LISTEN);
    Listener::bind_tcp(addr, service, config)
        .await
        .map_err(|err| mux_error("bind failed", err))
}

fn connection_config(args: &ServeArgs) -> CliResult<ConnectionConfig> {
    let mut config = ConnectionConfig::default();
    config.handshake.timeout = parse_duration(&args.handshake_timeout)?;
    config.handshake.max_clock_skew = parse_duration(&args.max_clock_skew)?;
    config.keepalive_interval = parse_duration(&args.keepalive)?;
    config.idle_timeout = parse_duration(&args.idle_timeout)?;
    if config.idle_timeout <= config.keepalive_interval {
        return Err(CliError::new(
            USAGE,
            "--idle-timeout must be longer than --keepalive",
        ));
    }
    Ok(config)
}
