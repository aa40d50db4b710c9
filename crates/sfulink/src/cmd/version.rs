use crate::cmd::VersionArgs;
use crate::exit::{CliResult, SUCCESS};

pub fn run(args: VersionArgs) -> CliResult<i32> {
    if !args.extended {
        println!("sfulink {}", env!("CARGO_PKG_VERSION"));
        return Ok(SUCCESS);
    }

    println!("name: sfulink");
    println!("version: {}", env!("CARGO_PKG_VERSION"));
    println!(
        "target: {}",
        option_env!("SFULINK_BUILD_TARGET").unwrap_or("unknown")
    );
    println!("target_os: {}", std::env::consts::OS);
    println!("target_arch: {}", std::env::consts::ARCH);
    println!("git_hash: {}", option_env!("GIT_HASH").unwrap_or("unknown"));
    println!(
        "features: worker={}, async={}, cli=true",
        cfg!(feature = "worker"),
        cfg!(feature = "async")
    );
    println!(
        "protocol: frame_max={} payload_max={}",
        sfulink_frame::MESSAGE_MAX_LEN,
        sfulink_frame::PAYLOAD_MAX_LEN
    );

    Ok(SUCCESS)
}
