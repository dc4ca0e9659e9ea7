use crate::cmd::VersionArgs;
use crate::exit::{CliResult, SUCCESS};

pub fn run(args: VersionArgs) -> CliResult<i32> {
    println!("muxsql {}", env!("CARGO_PKG_VERSION"));
    if !args.extended {
        return Ok(SUCCESS);
    }

    println!(
        "target: {}",
        option_env!("MUXSQL_BUILD_TARGET").unwrap_or("unknown")
    );
    println!("os/arch: {}/{}", std::env::consts::OS, std::env::consts::ARCH);
    println!(
        "rustc: {}",
        option_env!("RUSTC_VERSION").unwrap_or("unknown")
    );
    println!("git_hash: {}", option_env!("GIT_HASH").unwrap_or("unknown"));
    println!(
        "frame: magic=\"MX\" header={}B max_payload={}B",
        muxsql::frame::HEADER_SIZE,
        muxsql::frame::DEFAULT_MAX_PAYLOAD
    );
    println!("key_ciphers: aes-128-ocb3, plaintext");

    Ok(SUCCESS)
}
