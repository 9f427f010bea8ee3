//! bakectl - In-Container Build Driver
//!
//! Runs inside the build container as the single foreground process of
//! a job. Executes the recipe's build program against the fetched
//! source, then packs the staged result into the output directory:
//!
//! ```text
//! /source/<recipe>     the recipe script (run with /bin/sh)
//! $CHEF_OUT/stage/     where the recipe installs its results
//! $CHEF_OUT/package.pack  gzip tar of the stage tree (this tool)
//! $CHEF_OUT/build.log  combined recipe output (this tool)
//! ```
//!
//! The exit code is the recipe's exit code; packing failures exit 70.

use std::fs;
use std::path::PathBuf;
use std::process::{Command, ExitCode, Stdio};

fn usage() -> ! {
    eprintln!("usage: bakectl <recipe-path>");
    std::process::exit(2);
}

fn main() -> ExitCode {
    let mut args = std::env::args().skip(1);
    let recipe = match (args.next(), args.next()) {
        (Some(recipe), None) => PathBuf::from(recipe),
        _ => usage(),
    };

    let out_dir = std::env::var_os("CHEF_OUT")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/out"));
    let stage_dir = out_dir.join("stage");
    let log_path = out_dir.join("build.log");

    if let Err(e) = fs::create_dir_all(&stage_dir) {
        eprintln!("bakectl: cannot create {}: {}", stage_dir.display(), e);
        return ExitCode::from(70);
    }

    let log = match fs::File::create(&log_path) {
        Ok(f) => f,
        Err(e) => {
            eprintln!("bakectl: cannot create {}: {}", log_path.display(), e);
            return ExitCode::from(70);
        }
    };
    let log_err = match log.try_clone() {
        Ok(f) => f,
        Err(e) => {
            eprintln!("bakectl: cannot clone log handle: {}", e);
            return ExitCode::from(70);
        }
    };

    let status = Command::new("/bin/sh")
        .arg(&recipe)
        .current_dir("/source")
        .env("CHEF_STAGE", &stage_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::from(log))
        .stderr(Stdio::from(log_err))
        .status();

    let code = match status {
        Ok(status) => status.code().unwrap_or(1),
        Err(e) => {
            eprintln!("bakectl: cannot run {}: {}", recipe.display(), e);
            return ExitCode::from(127);
        }
    };

    if code != 0 {
        eprintln!("bakectl: recipe exited {}", code);
        return ExitCode::from(code.clamp(0, 255) as u8);
    }

    // The recipe succeeded; pack the stage tree.
    let package = out_dir.join("package.pack");
    match chef::pack::write_pack(&stage_dir, &package) {
        Ok(digest) => {
            println!("package.pack sha256:{}", digest);
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("bakectl: packing failed: {}", e);
            ExitCode::from(70)
        }
    }
}
