use muxsql::{AccessPolicy, Databases, ROOT_USER};

use crate::cmd::CreateDbArgs;
use crate::exit::{credential_error, engine_error, CliResult, SUCCESS};
use crate::output::{render_created, CreatedDatabase, OutputFormat};

pub fn run(args: CreateDbArgs, format: OutputFormat) -> CliResult<i32> {
    let config = args.storage.server_config(AccessPolicy::default());
    let manager = config
        .credential_manager()
        .map_err(|err| credential_error("invalid configuration", err))?;

    let mut creds = manager
        .generate_credentials(ROOT_USER.to_string())
        .map_err(|err| credential_error("key generation failed", err))?;
    config
        .databases()
        .create(&args.name, &creds.b64_encrypted_key())
        .map_err(|err| engine_error("create-db", err))?;

    let private_key = zeroize::Zeroizing::new(creds.b64_private_key());
    creds.clear();
    println!(
        "{}",
        render_created(
            &CreatedDatabase {
                database: &args.name,
                access_key: &creds.access_key,
                private_key: &private_key,
                key_cipher: manager.cipher().name(),
            },
            format,
        )
    );
    Ok(SUCCESS)
}
